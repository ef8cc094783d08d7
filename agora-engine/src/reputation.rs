//! Reputation: sealed dual-reveal feedback and score aggregation
//!
//! After a task pays out (approved or ruled) each side may file exactly one
//! rating: the poster rates delivery quality, the worker rates spec
//! quality. Rows stay sealed until both exist, then flip visible together
//! in one transaction. Scores are the rounded mean of revealed ratings per
//! category, starting at 100.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use agora_core::{id, EconomyError, EconomyResult};

use crate::board::TaskBoardService;
use crate::events::{EventLog, EventPayload};
use crate::models::{Feedback, FeedbackCategory, FeedbackRole, Rating};
use crate::store::{map_unique, Store};

/// Configuration for the reputation service
#[derive(Debug, Clone)]
pub struct ReputationConfig {
    pub max_comment_length: usize,
}

impl Default for ReputationConfig {
    fn default() -> Self {
        Self {
            max_comment_length: 256,
        }
    }
}

/// Feedback submission request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitFeedbackRequest {
    pub task_id: String,
    pub from_agent_id: String,
    pub rating: Rating,
    pub comment: Option<String>,
}

/// Feedback as served to readers: rating and comment are withheld while
/// the row is sealed; the counterparty learns only that it exists.
#[derive(Debug, Clone, Serialize)]
pub struct FeedbackView {
    pub feedback_id: String,
    pub task_id: String,
    pub from_agent_id: String,
    pub to_agent_id: String,
    pub role: FeedbackRole,
    pub category: FeedbackCategory,
    pub submitted: bool,
    pub visible: bool,
    pub rating: Option<Rating>,
    pub comment: Option<String>,
    pub submitted_at: DateTime<Utc>,
}

impl From<Feedback> for FeedbackView {
    fn from(row: Feedback) -> Self {
        let visible = row.is_visible();
        Self {
            feedback_id: row.feedback_id,
            task_id: row.task_id,
            from_agent_id: row.from_agent_id,
            to_agent_id: row.to_agent_id,
            role: row.role,
            category: row.category,
            submitted: true,
            visible,
            rating: visible.then_some(row.rating),
            comment: if visible { row.comment } else { None },
            submitted_at: row.submitted_at,
        }
    }
}

/// An agent's two category scores
#[derive(Debug, Clone, Serialize)]
pub struct AgentScores {
    pub agent_id: String,
    pub spec_quality: i64,
    pub delivery_quality: i64,
}

#[derive(Clone)]
pub struct ReputationService {
    store: Store,
    events: EventLog,
    config: ReputationConfig,
}

impl ReputationService {
    pub fn new(store: Store, events: EventLog, config: ReputationConfig) -> Self {
        Self {
            store,
            events,
            config,
        }
    }

    /// Submit one sealed feedback entry. When it completes the pair, both
    /// rows reveal atomically and one `feedback.revealed` event is emitted
    /// for each.
    pub async fn submit_feedback(
        &self,
        request: SubmitFeedbackRequest,
    ) -> EconomyResult<FeedbackView> {
        if let Some(comment) = &request.comment {
            if comment.chars().count() > self.config.max_comment_length {
                return Err(EconomyError::validation(format!(
                    "comment exceeds {} characters",
                    self.config.max_comment_length
                )));
            }
        }

        let mut tx = self.store.begin().await?;
        let task = TaskBoardService::fetch_task(&mut tx, &request.task_id).await?;
        if !task.status.is_paying() {
            return Err(EconomyError::conflict(
                "feedback opens once the task is approved or ruled",
            ));
        }
        let worker = task
            .worker_id
            .clone()
            .ok_or_else(|| EconomyError::invariant("paying task has no worker"))?;

        let (role, category, to_agent) = if request.from_agent_id == task.poster_id {
            (FeedbackRole::Poster, FeedbackCategory::DeliveryQuality, worker)
        } else if request.from_agent_id == worker {
            (
                FeedbackRole::Worker,
                FeedbackCategory::SpecQuality,
                task.poster_id.clone(),
            )
        } else {
            return Err(EconomyError::forbidden(
                "only the poster and the worker may rate this task",
            ));
        };

        let mut row = Feedback {
            feedback_id: id::fresh(id::FEEDBACK),
            task_id: request.task_id.clone(),
            from_agent_id: request.from_agent_id.clone(),
            to_agent_id: to_agent,
            role,
            category,
            rating: request.rating,
            comment: request.comment,
            visible: 0,
            submitted_at: Utc::now(),
        };
        sqlx::query(
            "INSERT INTO reputation_feedback
             (feedback_id, task_id, from_agent_id, to_agent_id, role, category,
              rating, comment, visible, submitted_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, 0, ?)",
        )
        .bind(&row.feedback_id)
        .bind(&row.task_id)
        .bind(&row.from_agent_id)
        .bind(&row.to_agent_id)
        .bind(row.role)
        .bind(row.category)
        .bind(row.rating)
        .bind(&row.comment)
        .bind(row.submitted_at)
        .execute(&mut *tx)
        .await
        .map_err(|err| map_unique(err, "feedback already submitted for this task"))?;

        // Second of the pair? Reveal both rows in this same transaction.
        let counterpart = sqlx::query_as::<_, Feedback>(
            "SELECT feedback_id, task_id, from_agent_id, to_agent_id, role, category,
                    rating, comment, visible, submitted_at
             FROM reputation_feedback
             WHERE task_id = ? AND from_agent_id != ?",
        )
        .bind(&request.task_id)
        .bind(&request.from_agent_id)
        .fetch_optional(&mut *tx)
        .await?;

        let mut events = Vec::new();
        if let Some(other) = &counterpart {
            sqlx::query("UPDATE reputation_feedback SET visible = 1 WHERE task_id = ?")
                .bind(&request.task_id)
                .execute(&mut *tx)
                .await?;
            row.visible = 1;

            for revealed in [&row, other] {
                events.push(
                    EventLog::append(
                        &mut tx,
                        EventPayload::FeedbackRevealed {
                            task_id: revealed.task_id.clone(),
                            feedback_id: revealed.feedback_id.clone(),
                            from_agent_id: revealed.from_agent_id.clone(),
                            to_agent_id: revealed.to_agent_id.clone(),
                            category: category_str(revealed.category).to_string(),
                            rating: rating_str(revealed.rating).to_string(),
                        },
                    )
                    .await?,
                );
            }
            info!(task_id = %request.task_id, "feedback pair revealed");
        }

        tx.commit().await?;
        self.events.publish_all(events);
        Ok(row.into())
    }

    /// Both directions for a task; sealed rows are redacted.
    pub async fn feedback_for_task(&self, task_id: &str) -> EconomyResult<Vec<FeedbackView>> {
        let rows = sqlx::query_as::<_, Feedback>(
            "SELECT feedback_id, task_id, from_agent_id, to_agent_id, role, category,
                    rating, comment, visible, submitted_at
             FROM reputation_feedback WHERE task_id = ? ORDER BY submitted_at, feedback_id",
        )
        .bind(task_id)
        .fetch_all(self.store.pool())
        .await?;
        Ok(rows.into_iter().map(FeedbackView::from).collect())
    }

    /// Category scores for an agent: the rounded mean of revealed ratings
    /// targeting them, 100 while no revealed feedback exists.
    pub async fn scores(&self, agent_id: &str) -> EconomyResult<AgentScores> {
        Ok(AgentScores {
            agent_id: agent_id.to_string(),
            spec_quality: self
                .category_score(agent_id, FeedbackCategory::SpecQuality)
                .await?,
            delivery_quality: self
                .category_score(agent_id, FeedbackCategory::DeliveryQuality)
                .await?,
        })
    }

    async fn category_score(
        &self,
        agent_id: &str,
        category: FeedbackCategory,
    ) -> EconomyResult<i64> {
        let ratings: Vec<Rating> = sqlx::query_scalar(
            "SELECT rating FROM reputation_feedback
             WHERE to_agent_id = ? AND category = ? AND visible = 1",
        )
        .bind(agent_id)
        .bind(category)
        .fetch_all(self.store.pool())
        .await?;

        if ratings.is_empty() {
            return Ok(100);
        }
        let sum: i64 = ratings.iter().map(Rating::score).sum();
        Ok(((sum as f64) / (ratings.len() as f64)).round() as i64)
    }
}

fn category_str(category: FeedbackCategory) -> &'static str {
    match category {
        FeedbackCategory::SpecQuality => "spec_quality",
        FeedbackCategory::DeliveryQuality => "delivery_quality",
    }
}

fn rating_str(rating: Rating) -> &'static str {
    match rating {
        Rating::Dissatisfied => "dissatisfied",
        Rating::Satisfied => "satisfied",
        Rating::ExtremelySatisfied => "extremely_satisfied",
    }
}
