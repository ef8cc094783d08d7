//! Event-log replay projection
//!
//! Folds the event sequence into per-agent aggregates. Nothing here reads
//! service tables: the log alone reconstructs the derived state, which is
//! what makes it a sufficient feed for external observers.

use std::collections::{BTreeMap, HashMap};

use serde::Serialize;

use agora_core::EconomyResult;

use crate::events::{Event, EventPayload};

/// Derived per-agent totals
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AgentAggregates {
    pub tasks_posted: u32,
    /// Tasks that reached approval (including auto-approval) as the worker
    pub tasks_completed: u32,
    /// Coins received from escrow payouts as the worker
    pub total_earned: i64,
    /// Coins that left this agent's escrows toward workers
    pub total_spent: i64,
    /// Revealed ratings received, per rating label
    pub spec_quality_ratings: BTreeMap<String, u32>,
    pub delivery_quality_ratings: BTreeMap<String, u32>,
}

#[derive(Debug, Default)]
struct TaskParties {
    poster: String,
    worker: Option<String>,
}

/// The folded state of a full log replay
#[derive(Debug, Default)]
pub struct EconomyProjection {
    agents: HashMap<String, AgentAggregates>,
    tasks: HashMap<String, TaskParties>,
}

impl EconomyProjection {
    /// Replay events in log order.
    pub fn replay<'a, I>(events: I) -> EconomyResult<Self>
    where
        I: IntoIterator<Item = &'a Event>,
    {
        let mut projection = Self::default();
        for event in events {
            let payload: EventPayload = serde_json::from_value(event.payload.clone())?;
            projection.apply(&payload);
        }
        Ok(projection)
    }

    pub fn agent(&self, agent_id: &str) -> AgentAggregates {
        self.agents.get(agent_id).cloned().unwrap_or_default()
    }

    fn entry(&mut self, agent_id: &str) -> &mut AgentAggregates {
        self.agents.entry(agent_id.to_string()).or_default()
    }

    fn apply(&mut self, payload: &EventPayload) {
        match payload {
            EventPayload::TaskCreated {
                task_id, poster_id, ..
            } => {
                self.entry(poster_id).tasks_posted += 1;
                self.tasks.insert(
                    task_id.clone(),
                    TaskParties {
                        poster: poster_id.clone(),
                        worker: None,
                    },
                );
            }
            EventPayload::TaskAccepted {
                task_id, worker_id, ..
            } => {
                if let Some(parties) = self.tasks.get_mut(task_id) {
                    parties.worker = Some(worker_id.clone());
                }
            }
            EventPayload::TaskApproved { task_id, .. }
            | EventPayload::TaskAutoApproved { task_id, .. } => {
                if let Some(worker) = self.worker_of(task_id) {
                    self.entry(&worker).tasks_completed += 1;
                }
            }
            EventPayload::EscrowReleased {
                task_id,
                recipient_id,
                amount,
                ..
            } => {
                // A release back to the poster is a refund, not earnings.
                if self.worker_of(task_id).as_deref() == Some(recipient_id.as_str()) {
                    self.entry(recipient_id).total_earned += amount;
                    if let Some(poster) = self.poster_of(task_id) {
                        self.entry(&poster).total_spent += amount;
                    }
                }
            }
            EventPayload::EscrowSplit {
                worker_id,
                poster_id,
                worker_amount,
                ..
            } => {
                if *worker_amount > 0 {
                    self.entry(worker_id).total_earned += worker_amount;
                    self.entry(poster_id).total_spent += worker_amount;
                }
            }
            EventPayload::FeedbackRevealed {
                to_agent_id,
                category,
                rating,
                ..
            } => {
                let aggregates = self.entry(to_agent_id);
                let histogram = if category == "spec_quality" {
                    &mut aggregates.spec_quality_ratings
                } else {
                    &mut aggregates.delivery_quality_ratings
                };
                *histogram.entry(rating.clone()).or_default() += 1;
            }
            _ => {}
        }
    }

    fn worker_of(&self, task_id: &str) -> Option<String> {
        self.tasks.get(task_id).and_then(|t| t.worker.clone())
    }

    fn poster_of(&self, task_id: &str) -> Option<String> {
        self.tasks.get(task_id).map(|t| t.poster.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn event(payload: EventPayload, id: i64) -> Event {
        Event {
            event_id: id,
            source: payload.source().into(),
            kind: payload.kind().into(),
            task_id: payload.task_id().map(str::to_string),
            agent_id: payload.agent_id().map(str::to_string),
            summary: payload.summary(),
            payload: serde_json::to_value(&payload).unwrap(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn replay_reconstructs_totals() {
        let events = vec![
            event(
                EventPayload::TaskCreated {
                    task_id: "t-1".into(),
                    poster_id: "a-alice".into(),
                    title: "fix".into(),
                    reward: 10,
                },
                1,
            ),
            event(
                EventPayload::TaskAccepted {
                    task_id: "t-1".into(),
                    bid_id: "bid-1".into(),
                    worker_id: "a-bob".into(),
                },
                2,
            ),
            event(
                EventPayload::TaskApproved {
                    task_id: "t-1".into(),
                    poster_id: "a-alice".into(),
                },
                3,
            ),
            event(
                EventPayload::EscrowReleased {
                    escrow_id: "esc-1".into(),
                    task_id: "t-1".into(),
                    recipient_id: "a-bob".into(),
                    amount: 10,
                },
                4,
            ),
            event(
                EventPayload::FeedbackRevealed {
                    task_id: "t-1".into(),
                    feedback_id: "fb-1".into(),
                    from_agent_id: "a-alice".into(),
                    to_agent_id: "a-bob".into(),
                    category: "delivery_quality".into(),
                    rating: "extremely_satisfied".into(),
                },
                5,
            ),
        ];

        let projection = EconomyProjection::replay(&events).unwrap();
        let alice = projection.agent("a-alice");
        let bob = projection.agent("a-bob");

        assert_eq!(alice.tasks_posted, 1);
        assert_eq!(alice.total_spent, 10);
        assert_eq!(bob.tasks_completed, 1);
        assert_eq!(bob.total_earned, 10);
        assert_eq!(bob.delivery_quality_ratings["extremely_satisfied"], 1);
    }

    #[test]
    fn refund_to_poster_is_not_earnings() {
        let events = vec![
            event(
                EventPayload::TaskCreated {
                    task_id: "t-2".into(),
                    poster_id: "a-alice".into(),
                    title: "stale".into(),
                    reward: 5,
                },
                1,
            ),
            event(
                EventPayload::TaskExpired {
                    task_id: "t-2".into(),
                    reason: "bidding".into(),
                },
                2,
            ),
            event(
                EventPayload::EscrowReleased {
                    escrow_id: "esc-2".into(),
                    task_id: "t-2".into(),
                    recipient_id: "a-alice".into(),
                    amount: 5,
                },
                3,
            ),
        ];

        let projection = EconomyProjection::replay(&events).unwrap();
        let alice = projection.agent("a-alice");
        assert_eq!(alice.total_earned, 0);
        assert_eq!(alice.total_spent, 0);
    }
}
