//! Append-only event log
//!
//! Every state change appends exactly one event inside the same transaction
//! that performs the change, so the log's id order is consistent with
//! causal order. Readers either replay with the catch-up query or subscribe
//! to the in-process broadcast bus that re-emits each event once after its
//! transaction commits.
//!
//! The payload is a tagged variant per event type; constructing the variant
//! is the write-time shape validation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};
use tokio::sync::broadcast;
use tracing::debug;

use agora_core::EconomyResult;

use crate::store::Store;

/// One row of the log, as stored and as pushed to subscribers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_id: i64,
    pub source: String,
    pub kind: String,
    pub task_id: Option<String>,
    pub agent_id: Option<String>,
    pub summary: String,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
}

/// Exhaustive set of event payloads. The `kind` tag doubles as the wire
/// event type.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum EventPayload {
    #[serde(rename = "agent.registered")]
    AgentRegistered { agent_id: String, name: String },

    #[serde(rename = "account.created")]
    AccountCreated { account_id: String },

    #[serde(rename = "salary.paid")]
    SalaryPaid {
        round_id: i64,
        amount: i64,
        accounts: Vec<String>,
    },

    #[serde(rename = "escrow.locked")]
    EscrowLocked {
        escrow_id: String,
        task_id: String,
        payer_id: String,
        amount: i64,
    },

    #[serde(rename = "escrow.released")]
    EscrowReleased {
        escrow_id: String,
        task_id: String,
        recipient_id: String,
        amount: i64,
    },

    #[serde(rename = "escrow.split")]
    EscrowSplit {
        escrow_id: String,
        task_id: String,
        worker_id: String,
        poster_id: String,
        worker_pct: i64,
        worker_amount: i64,
        poster_amount: i64,
    },

    #[serde(rename = "task.created")]
    TaskCreated {
        task_id: String,
        poster_id: String,
        title: String,
        reward: i64,
    },

    #[serde(rename = "task.cancelled")]
    TaskCancelled { task_id: String, poster_id: String },

    #[serde(rename = "task.expired")]
    TaskExpired { task_id: String, reason: String },

    #[serde(rename = "bid.submitted")]
    BidSubmitted {
        task_id: String,
        bid_id: String,
        bidder_id: String,
    },

    #[serde(rename = "task.accepted")]
    TaskAccepted {
        task_id: String,
        bid_id: String,
        worker_id: String,
    },

    #[serde(rename = "asset.uploaded")]
    AssetUploaded {
        task_id: String,
        asset_id: String,
        uploader_id: String,
        filename: String,
        size_bytes: i64,
    },

    #[serde(rename = "task.submitted")]
    TaskSubmitted { task_id: String, worker_id: String },

    #[serde(rename = "task.approved")]
    TaskApproved { task_id: String, poster_id: String },

    #[serde(rename = "task.auto_approved")]
    TaskAutoApproved { task_id: String, auto: bool },

    #[serde(rename = "task.disputed")]
    TaskDisputed {
        task_id: String,
        poster_id: String,
        reason: String,
    },

    #[serde(rename = "task.ruled")]
    TaskRuled {
        task_id: String,
        ruling_id: String,
        worker_pct: i64,
    },

    #[serde(rename = "feedback.revealed")]
    FeedbackRevealed {
        task_id: String,
        feedback_id: String,
        from_agent_id: String,
        to_agent_id: String,
        category: String,
        rating: String,
    },

    #[serde(rename = "claim.filed")]
    ClaimFiled {
        claim_id: String,
        task_id: String,
        claimant_id: String,
        respondent_id: String,
    },

    #[serde(rename = "rebuttal.submitted")]
    RebuttalSubmitted {
        claim_id: String,
        rebuttal_id: String,
        respondent_id: String,
    },

    #[serde(rename = "ruling.delivered")]
    RulingDelivered {
        ruling_id: String,
        claim_id: String,
        task_id: String,
        worker_pct: i64,
    },

    #[serde(rename = "system.invariant_violation")]
    InvariantViolation { context: String },
}

impl EventPayload {
    /// Wire event type, identical to the serde tag
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AgentRegistered { .. } => "agent.registered",
            Self::AccountCreated { .. } => "account.created",
            Self::SalaryPaid { .. } => "salary.paid",
            Self::EscrowLocked { .. } => "escrow.locked",
            Self::EscrowReleased { .. } => "escrow.released",
            Self::EscrowSplit { .. } => "escrow.split",
            Self::TaskCreated { .. } => "task.created",
            Self::TaskCancelled { .. } => "task.cancelled",
            Self::TaskExpired { .. } => "task.expired",
            Self::BidSubmitted { .. } => "bid.submitted",
            Self::TaskAccepted { .. } => "task.accepted",
            Self::AssetUploaded { .. } => "asset.uploaded",
            Self::TaskSubmitted { .. } => "task.submitted",
            Self::TaskApproved { .. } => "task.approved",
            Self::TaskAutoApproved { .. } => "task.auto_approved",
            Self::TaskDisputed { .. } => "task.disputed",
            Self::TaskRuled { .. } => "task.ruled",
            Self::FeedbackRevealed { .. } => "feedback.revealed",
            Self::ClaimFiled { .. } => "claim.filed",
            Self::RebuttalSubmitted { .. } => "rebuttal.submitted",
            Self::RulingDelivered { .. } => "ruling.delivered",
            Self::InvariantViolation { .. } => "system.invariant_violation",
        }
    }

    /// Owning service of the event type
    pub fn source(&self) -> &'static str {
        match self {
            Self::AgentRegistered { .. } => "identity",
            Self::AccountCreated { .. }
            | Self::SalaryPaid { .. }
            | Self::EscrowLocked { .. }
            | Self::EscrowReleased { .. }
            | Self::EscrowSplit { .. } => "bank",
            Self::TaskCreated { .. }
            | Self::TaskCancelled { .. }
            | Self::TaskExpired { .. }
            | Self::BidSubmitted { .. }
            | Self::TaskAccepted { .. }
            | Self::AssetUploaded { .. }
            | Self::TaskSubmitted { .. }
            | Self::TaskApproved { .. }
            | Self::TaskAutoApproved { .. }
            | Self::TaskDisputed { .. }
            | Self::TaskRuled { .. } => "board",
            Self::FeedbackRevealed { .. } => "reputation",
            Self::ClaimFiled { .. }
            | Self::RebuttalSubmitted { .. }
            | Self::RulingDelivered { .. } => "court",
            Self::InvariantViolation { .. } => "system",
        }
    }

    /// Task the event belongs to, when there is one
    pub fn task_id(&self) -> Option<&str> {
        match self {
            Self::EscrowLocked { task_id, .. }
            | Self::EscrowReleased { task_id, .. }
            | Self::EscrowSplit { task_id, .. }
            | Self::TaskCreated { task_id, .. }
            | Self::TaskCancelled { task_id, .. }
            | Self::TaskExpired { task_id, .. }
            | Self::BidSubmitted { task_id, .. }
            | Self::TaskAccepted { task_id, .. }
            | Self::AssetUploaded { task_id, .. }
            | Self::TaskSubmitted { task_id, .. }
            | Self::TaskApproved { task_id, .. }
            | Self::TaskAutoApproved { task_id, .. }
            | Self::TaskDisputed { task_id, .. }
            | Self::TaskRuled { task_id, .. }
            | Self::FeedbackRevealed { task_id, .. }
            | Self::ClaimFiled { task_id, .. }
            | Self::RulingDelivered { task_id, .. } => Some(task_id),
            _ => None,
        }
    }

    /// The acting agent, when one is attributable
    pub fn agent_id(&self) -> Option<&str> {
        match self {
            Self::AgentRegistered { agent_id, .. } => Some(agent_id),
            Self::AccountCreated { account_id } => Some(account_id),
            Self::EscrowLocked { payer_id, .. } => Some(payer_id),
            Self::EscrowReleased { recipient_id, .. } => Some(recipient_id),
            Self::TaskCreated { poster_id, .. }
            | Self::TaskCancelled { poster_id, .. }
            | Self::TaskApproved { poster_id, .. }
            | Self::TaskDisputed { poster_id, .. } => Some(poster_id),
            Self::BidSubmitted { bidder_id, .. } => Some(bidder_id),
            Self::TaskAccepted { worker_id, .. }
            | Self::TaskSubmitted { worker_id, .. } => Some(worker_id),
            Self::AssetUploaded { uploader_id, .. } => Some(uploader_id),
            Self::FeedbackRevealed { to_agent_id, .. } => Some(to_agent_id),
            Self::ClaimFiled { claimant_id, .. } => Some(claimant_id),
            Self::RebuttalSubmitted { respondent_id, .. } => Some(respondent_id),
            _ => None,
        }
    }

    /// Pre-rendered one-line summary
    pub fn summary(&self) -> String {
        match self {
            Self::AgentRegistered { agent_id, name } => {
                format!("agent {} registered as {}", name, agent_id)
            }
            Self::AccountCreated { account_id } => {
                format!("account {} opened", account_id)
            }
            Self::SalaryPaid {
                round_id,
                amount,
                accounts,
            } => format!(
                "salary round {} paid {} to {} accounts",
                round_id,
                amount,
                accounts.len()
            ),
            Self::EscrowLocked {
                escrow_id,
                task_id,
                amount,
                ..
            } => format!("escrow {} locked {} for {}", escrow_id, amount, task_id),
            Self::EscrowReleased {
                escrow_id,
                recipient_id,
                amount,
                ..
            } => format!(
                "escrow {} released {} to {}",
                escrow_id, amount, recipient_id
            ),
            Self::EscrowSplit {
                escrow_id,
                worker_amount,
                poster_amount,
                ..
            } => format!(
                "escrow {} split {} / {}",
                escrow_id, worker_amount, poster_amount
            ),
            Self::TaskCreated {
                task_id,
                poster_id,
                reward,
                ..
            } => format!(
                "task {} created by {} (reward {})",
                task_id, poster_id, reward
            ),
            Self::TaskCancelled { task_id, .. } => {
                format!("task {} cancelled", task_id)
            }
            Self::TaskExpired { task_id, reason } => {
                format!("task {} expired ({})", task_id, reason)
            }
            Self::BidSubmitted {
                task_id, bidder_id, ..
            } => format!("bid on {} by {}", task_id, bidder_id),
            Self::TaskAccepted {
                task_id, worker_id, ..
            } => format!("task {} accepted, worker {}", task_id, worker_id),
            Self::AssetUploaded {
                task_id, filename, ..
            } => format!("asset {} uploaded to {}", filename, task_id),
            Self::TaskSubmitted { task_id, .. } => {
                format!("task {} submitted for review", task_id)
            }
            Self::TaskApproved { task_id, .. } => {
                format!("task {} approved", task_id)
            }
            Self::TaskAutoApproved { task_id, .. } => {
                format!("task {} auto-approved on review timeout", task_id)
            }
            Self::TaskDisputed { task_id, .. } => {
                format!("task {} disputed", task_id)
            }
            Self::TaskRuled {
                task_id,
                worker_pct,
                ..
            } => format!("task {} ruled, worker {}%", task_id, worker_pct),
            Self::FeedbackRevealed {
                task_id,
                to_agent_id,
                rating,
                ..
            } => format!(
                "feedback on {} revealed: {} rated {}",
                task_id, to_agent_id, rating
            ),
            Self::ClaimFiled {
                claim_id, task_id, ..
            } => format!("claim {} filed for {}", claim_id, task_id),
            Self::RebuttalSubmitted { claim_id, .. } => {
                format!("rebuttal submitted for {}", claim_id)
            }
            Self::RulingDelivered {
                claim_id,
                worker_pct,
                ..
            } => format!("ruling on {}: worker {}%", claim_id, worker_pct),
            Self::InvariantViolation { context } => {
                format!("invariant violation: {}", context)
            }
        }
    }
}

/// In-process fan-out of committed events
#[derive(Clone)]
pub struct EventLog {
    bus: broadcast::Sender<Event>,
}

impl EventLog {
    pub fn new() -> Self {
        let (bus, _) = broadcast::channel(1024);
        Self { bus }
    }

    /// Append an event within the caller's transaction. The event becomes
    /// visible to catch-up readers at commit; the caller publishes it to
    /// the live bus after the commit succeeds.
    pub async fn append(
        conn: &mut SqliteConnection,
        payload: EventPayload,
    ) -> EconomyResult<Event> {
        let now = Utc::now();
        let body = serde_json::to_value(&payload)?;
        let result = sqlx::query(
            "INSERT INTO events (source, kind, task_id, agent_id, summary, payload, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(payload.source())
        .bind(payload.kind())
        .bind(payload.task_id())
        .bind(payload.agent_id())
        .bind(payload.summary())
        .bind(body.to_string())
        .bind(now)
        .execute(&mut *conn)
        .await?;

        Ok(Event {
            event_id: result.last_insert_rowid(),
            source: payload.source().to_string(),
            kind: payload.kind().to_string(),
            task_id: payload.task_id().map(str::to_string),
            agent_id: payload.agent_id().map(str::to_string),
            summary: payload.summary(),
            payload: body,
            created_at: now,
        })
    }

    /// Push committed events to live subscribers. Lagging or absent
    /// subscribers are not an error.
    pub fn publish_all<I: IntoIterator<Item = Event>>(&self, events: I) {
        for event in events {
            debug!(kind = %event.kind, id = event.event_id, "event published");
            let _ = self.bus.send(event);
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.bus.subscribe()
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}

fn row_to_event(row: &SqliteRow) -> EconomyResult<Event> {
    let payload_text: String = row.try_get("payload")?;
    Ok(Event {
        event_id: row.try_get("event_id")?,
        source: row.try_get("source")?,
        kind: row.try_get("kind")?,
        task_id: row.try_get("task_id")?,
        agent_id: row.try_get("agent_id")?,
        summary: row.try_get("summary")?,
        payload: serde_json::from_str(&payload_text)?,
        created_at: row.try_get("created_at")?,
    })
}

/// Catch-up query: events with id greater than `after`, ascending, bounded.
pub async fn events_after(store: &Store, after: i64, limit: i64) -> EconomyResult<Vec<Event>> {
    let rows = sqlx::query(
        "SELECT event_id, source, kind, task_id, agent_id, summary, payload, created_at
         FROM events WHERE event_id > ? ORDER BY event_id ASC LIMIT ?",
    )
    .bind(after)
    .bind(limit)
    .fetch_all(store.pool())
    .await?;
    rows.iter().map(row_to_event).collect()
}

/// All events for one task, in id order.
pub async fn events_for_task(store: &Store, task_id: &str) -> EconomyResult<Vec<Event>> {
    let rows = sqlx::query(
        "SELECT event_id, source, kind, task_id, agent_id, summary, payload, created_at
         FROM events WHERE task_id = ? ORDER BY event_id ASC",
    )
    .bind(task_id)
    .fetch_all(store.pool())
    .await?;
    rows.iter().map(row_to_event).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_tag_matches_kind() {
        let payload = EventPayload::TaskExpired {
            task_id: "t-x".into(),
            reason: "bidding".into(),
        };
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["kind"], payload.kind());
        assert_eq!(value["reason"], "bidding");
    }

    #[test]
    fn payload_round_trips() {
        let payload = EventPayload::EscrowSplit {
            escrow_id: "esc-x".into(),
            task_id: "t-x".into(),
            worker_id: "a-w".into(),
            poster_id: "a-p".into(),
            worker_pct: 40,
            worker_amount: 4,
            poster_amount: 6,
        };
        let value = serde_json::to_value(&payload).unwrap();
        let back: EventPayload = serde_json::from_value(value).unwrap();
        assert_eq!(back.kind(), "escrow.split");
    }

    #[tokio::test]
    async fn ids_increase_monotonically() {
        let store = Store::open_in_memory().await.unwrap();
        // The events table has no agent/task FK, so appends need no fixtures.
        let mut ids = Vec::new();
        for round in 0..3 {
            let mut tx = store.begin().await.unwrap();
            let event = EventLog::append(
                &mut tx,
                EventPayload::SalaryPaid {
                    round_id: round,
                    amount: 10,
                    accounts: vec![],
                },
            )
            .await
            .unwrap();
            tx.commit().await.unwrap();
            ids.push(event.event_id);
        }
        assert!(ids.windows(2).all(|w| w[0] < w[1]));

        let replayed = events_after(&store, 0, 10).await.unwrap();
        assert_eq!(replayed.len(), 3);
        assert_eq!(replayed[0].kind, "salary.paid");
    }
}
