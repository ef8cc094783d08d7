//! Domain models for the agent economy
//!
//! Database rows, state machine enums and constructors. Enums are stored as
//! snake_case TEXT; the same spelling is the wire contract.

use agora_core::{id, EconomyError, EconomyResult};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Task lifecycle state machine
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type,
)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Accepting bids, escrow locked
    Open,
    /// Worker assigned, execution clock running
    Accepted,
    /// Work delivered, review clock running
    Submitted,
    /// Poster approved (or review timed out); escrow released to worker
    Approved,
    /// Poster withdrew the task before accepting a bid
    Cancelled,
    /// A deadline fired without progress; escrow returned to poster
    Expired,
    /// Poster contested the submission; a court claim exists
    Disputed,
    /// Court delivered a ruling; escrow split by the ruled percentage
    Ruled,
}

impl TaskStatus {
    /// Check if this is a terminal state (no further transitions possible)
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Approved | Self::Cancelled | Self::Expired | Self::Ruled
        )
    }

    /// Terminal states in which escrow has paid out to the worker (at least
    /// partially) and feedback exchange opens
    pub fn is_paying(&self) -> bool {
        matches!(self, Self::Approved | Self::Ruled)
    }

    pub fn can_bid(&self) -> bool {
        matches!(self, Self::Open)
    }

    pub fn can_accept(&self) -> bool {
        matches!(self, Self::Open)
    }

    pub fn can_cancel(&self) -> bool {
        matches!(self, Self::Open)
    }

    pub fn can_submit(&self) -> bool {
        matches!(self, Self::Accepted)
    }

    pub fn can_upload_asset(&self) -> bool {
        matches!(self, Self::Accepted)
    }

    pub fn can_approve(&self) -> bool {
        matches!(self, Self::Submitted)
    }

    pub fn can_dispute(&self) -> bool {
        matches!(self, Self::Submitted)
    }

    pub fn can_rule(&self) -> bool {
        matches!(self, Self::Disputed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Accepted => "accepted",
            Self::Submitted => "submitted",
            Self::Approved => "approved",
            Self::Cancelled => "cancelled",
            Self::Expired => "expired",
            Self::Disputed => "disputed",
            Self::Ruled => "ruled",
        }
    }
}

/// Escrow resolution state
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type,
)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum EscrowStatus {
    /// Funds held out of the payer's spendable balance
    Locked,
    /// Full amount credited to a single recipient
    Released,
    /// Amount divided between worker and poster by a ruling
    Split,
}

/// Ledger transaction kind
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type,
)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum TxKind {
    /// Balance-increasing credit, idempotent on (account, reference)
    Credit,
    /// Funds moved out of spendable balance into an escrow
    EscrowLock,
    /// Escrow payout back into a spendable balance
    EscrowRelease,
}

/// Which side of the contract a feedback entry comes from
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type,
)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum FeedbackRole {
    Poster,
    Worker,
}

/// What quality dimension a feedback entry rates
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type,
)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum FeedbackCategory {
    /// Worker rating the poster's specification
    SpecQuality,
    /// Poster rating the worker's delivery
    DeliveryQuality,
}

/// Three-step satisfaction scale
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type,
)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum Rating {
    Dissatisfied,
    Satisfied,
    ExtremelySatisfied,
}

impl Rating {
    /// Numeric coding used by score aggregation
    pub fn score(&self) -> i64 {
        match self {
            Self::Dissatisfied => 0,
            Self::Satisfied => 50,
            Self::ExtremelySatisfied => 100,
        }
    }
}

/// Court claim pipeline state
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type,
)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum ClaimStatus {
    /// Claim recorded; window not yet open (momentary)
    Filed,
    /// Respondent may answer until the rebuttal deadline
    Rebuttal,
    /// Judge panel invoked; awaiting aggregate
    Judging,
    /// Ruling persisted; escrow split executed
    Ruled,
}

/// Reason a task expired, kept for the event payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpiryReason {
    Bidding,
    Execution,
}

impl ExpiryReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bidding => "bidding",
            Self::Execution => "execution",
        }
    }
}

/// A registered participant. Immutable after creation.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Agent {
    pub agent_id: String,
    pub name: String,
    /// `<algo>:<base64>`; `ed25519` is the only algorithm accepted in v1
    pub public_key: String,
    pub registered_at: DateTime<Utc>,
}

/// One account per agent; the id equals the agent id
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Account {
    pub account_id: String,
    /// Spendable balance; escrowed funds are already subtracted
    pub balance: i64,
    pub created_at: DateTime<Utc>,
}

/// Ledger entry; the audit trail of every coin that moved
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct LedgerTransaction {
    pub tx_id: String,
    pub account_id: String,
    pub kind: TxKind,
    pub amount: i64,
    pub resulting_balance: i64,
    /// Idempotency key for credits, provenance for everything else
    pub reference: String,
    pub created_at: DateTime<Utc>,
}

/// Funds held for a task until release or split
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Escrow {
    pub escrow_id: String,
    pub payer_account_id: String,
    pub amount: i64,
    pub task_id: String,
    pub status: EscrowStatus,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

/// A unit of work with an attached escrow
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Task {
    pub task_id: String,
    pub poster_id: String,
    pub title: String,
    pub spec: String,
    pub reward: i64,
    pub bidding_seconds: i64,
    pub execution_seconds: i64,
    pub review_seconds: i64,
    pub bidding_deadline: DateTime<Utc>,
    pub execution_deadline: Option<DateTime<Utc>>,
    pub review_deadline: Option<DateTime<Utc>>,
    pub escrow_id: String,
    pub worker_id: Option<String>,
    pub accepted_bid_id: Option<String>,
    pub dispute_reason: Option<String>,
    pub ruling_id: Option<String>,
    pub worker_pct: Option<i64>,
    pub ruling_summary: Option<String>,
    pub status: TaskStatus,
    pub expired_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub accepted_at: Option<DateTime<Utc>>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub approved_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub disputed_at: Option<DateTime<Utc>>,
    pub ruled_at: Option<DateTime<Utc>>,
    pub expired_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Reject transitions that are illegal from the current state
    pub fn ensure_transition(&self, allowed: bool, to: TaskStatus) -> EconomyResult<()> {
        if allowed {
            Ok(())
        } else {
            Err(EconomyError::transition(
                self.status.as_str(),
                to.as_str(),
                "not permitted from current status",
            ))
        }
    }
}

/// A binding offer by a candidate worker; final once submitted
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Bid {
    pub bid_id: String,
    pub task_id: String,
    pub bidder_id: String,
    pub proposal: String,
    pub submitted_at: DateTime<Utc>,
}

/// Deliverable reference; the blob itself lives under the asset storage dir
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Asset {
    pub asset_id: String,
    pub task_id: String,
    pub uploader_id: String,
    pub filename: String,
    pub content_type: String,
    pub size_bytes: i64,
    pub storage_path: String,
    pub uploaded_at: DateTime<Utc>,
}

/// A sealed, direction-specific rating
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Feedback {
    pub feedback_id: String,
    pub task_id: String,
    pub from_agent_id: String,
    pub to_agent_id: String,
    pub role: FeedbackRole,
    pub category: FeedbackCategory,
    pub rating: Rating,
    pub comment: Option<String>,
    /// 0 while sealed; flips to 1 for both rows when the second arrives
    pub visible: i64,
    pub submitted_at: DateTime<Utc>,
}

impl Feedback {
    pub fn is_visible(&self) -> bool {
        self.visible != 0
    }
}

/// A dispute raised by the poster against a submission
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Claim {
    pub claim_id: String,
    pub task_id: String,
    pub claimant_id: String,
    pub respondent_id: String,
    pub reason: String,
    pub status: ClaimStatus,
    pub rebuttal_deadline: DateTime<Utc>,
    pub filed_at: DateTime<Utc>,
}

/// The respondent's answer to a claim
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Rebuttal {
    pub rebuttal_id: String,
    pub claim_id: String,
    pub respondent_id: String,
    pub content: String,
    pub submitted_at: DateTime<Utc>,
}

/// Final verdict; `votes` archives the raw per-judge opinions as JSON
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Ruling {
    pub ruling_id: String,
    pub claim_id: String,
    pub worker_pct: i64,
    pub summary: String,
    pub votes: String,
    pub ruled_at: DateTime<Utc>,
}

impl Task {
    /// Build a fresh open task; escrow is attached by the board
    pub fn new(
        poster_id: String,
        title: String,
        spec: String,
        reward: i64,
        bidding_seconds: i64,
        execution_seconds: i64,
        review_seconds: i64,
        escrow_id: String,
    ) -> Self {
        let now = Utc::now();
        Self {
            task_id: id::fresh(id::TASK),
            poster_id,
            title,
            spec,
            reward,
            bidding_seconds,
            execution_seconds,
            review_seconds,
            bidding_deadline: now + Duration::seconds(bidding_seconds),
            execution_deadline: None,
            review_deadline: None,
            escrow_id,
            worker_id: None,
            accepted_bid_id: None,
            dispute_reason: None,
            ruling_id: None,
            worker_pct: None,
            ruling_summary: None,
            status: TaskStatus::Open,
            expired_reason: None,
            created_at: now,
            accepted_at: None,
            submitted_at: None,
            approved_at: None,
            cancelled_at: None,
            disputed_at: None,
            ruled_at: None,
            expired_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(TaskStatus::Approved.is_terminal());
        assert!(TaskStatus::Ruled.is_terminal());
        assert!(TaskStatus::Expired.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::Open.is_terminal());
        assert!(!TaskStatus::Disputed.is_terminal());
    }

    #[test]
    fn paying_states_open_feedback() {
        assert!(TaskStatus::Approved.is_paying());
        assert!(TaskStatus::Ruled.is_paying());
        assert!(!TaskStatus::Expired.is_paying());
        assert!(!TaskStatus::Cancelled.is_paying());
    }

    #[test]
    fn rating_coding() {
        assert_eq!(Rating::Dissatisfied.score(), 0);
        assert_eq!(Rating::Satisfied.score(), 50);
        assert_eq!(Rating::ExtremelySatisfied.score(), 100);
    }

    #[test]
    fn new_task_deadline_arithmetic() {
        let task = Task::new(
            "a-00000000-0000-0000-0000-000000000000".into(),
            "title".into(),
            "spec".into(),
            10,
            60,
            120,
            30,
            "esc-x".into(),
        );
        assert_eq!(task.status, TaskStatus::Open);
        assert_eq!(
            task.bidding_deadline - task.created_at,
            Duration::seconds(60)
        );
        assert!(task.execution_deadline.is_none());
        assert!(task.review_deadline.is_none());
    }

    #[test]
    fn illegal_transition_reports_both_states() {
        let task = Task::new(
            "a-00000000-0000-0000-0000-000000000000".into(),
            "t".into(),
            "s".into(),
            1,
            1,
            1,
            1,
            "esc-x".into(),
        );
        let err = task
            .ensure_transition(task.status.can_approve(), TaskStatus::Approved)
            .unwrap_err();
        assert!(err.to_string().contains("open"));
        assert!(err.to_string().contains("approved"));
    }
}
