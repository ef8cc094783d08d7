//! Error types for the agent economy
//!
//! Every error carries a wire kind that the HTTP layer renders into the
//! uniform `{ "error": <kind>, "message": <text> }` envelope. The kinds
//! partition into validation, auth, conflict, not-found, transient and
//! fatal classes; transient errors are the only ones internal retry loops
//! may swallow.

use thiserror::Error;

/// Main error type for economy operations
#[derive(Error, Debug)]
pub enum EconomyError {
    /// Malformed input the caller must fix
    #[error("{0}")]
    Validation(String),

    /// Bad signature or unknown agent; never retried
    #[error("{0}")]
    Unauthorized(String),

    /// Authenticated agent acting outside its role
    #[error("{0}")]
    Forbidden(String),

    /// Referenced entity does not exist
    #[error("{0} not found")]
    NotFound(String),

    /// Operation illegal from the current state or unique-key collision
    #[error("{0}")]
    Conflict(String),

    /// State machine transition rejected
    #[error("invalid transition {from} -> {to}: {reason}")]
    Transition {
        from: String,
        to: String,
        reason: String,
    },

    /// Spendable balance below the requested amount
    #[error("insufficient funds: balance {balance}, required {required}")]
    InsufficientFunds { balance: i64, required: i64 },

    /// An active escrow lock already exists for (payer, task)
    #[error("active escrow already exists for {payer} on {task_id}")]
    EscrowExists { payer: String, task_id: String },

    /// Public key already registered to another agent
    #[error("public key already registered")]
    DuplicateKey,

    /// Judge panel failure or timeout beyond what abstention absorbs
    #[error("judge panel error: {0}")]
    Judge(String),

    /// Storage errors; busy/timeout variants are transient
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// JSON (de)serialization errors
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A broken invariant; surfaces as fatal and is never retried
    #[error("invariant violation: {0}")]
    Invariant(String),

    /// General internal errors
    #[error("internal error: {0}")]
    Internal(String),
}

impl EconomyError {
    /// Create a validation error
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Self::Validation(msg.into())
    }

    /// Create an unauthorized error
    pub fn unauthorized<S: Into<String>>(msg: S) -> Self {
        Self::Unauthorized(msg.into())
    }

    /// Create a forbidden error
    pub fn forbidden<S: Into<String>>(msg: S) -> Self {
        Self::Forbidden(msg.into())
    }

    /// Create a not-found error; `what` names the missing entity
    pub fn not_found<S: Into<String>>(what: S) -> Self {
        Self::NotFound(what.into())
    }

    /// Create a conflict error
    pub fn conflict<S: Into<String>>(msg: S) -> Self {
        Self::Conflict(msg.into())
    }

    /// Create a state transition error
    pub fn transition<S: Into<String>>(from: S, to: S, reason: S) -> Self {
        Self::Transition {
            from: from.into(),
            to: to.into(),
            reason: reason.into(),
        }
    }

    /// Create an invariant violation
    pub fn invariant<S: Into<String>>(msg: S) -> Self {
        Self::Invariant(msg.into())
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }

    /// Wire error kind rendered into the response envelope
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Unauthorized(_) => "unauthorized",
            Self::Forbidden(_) => "forbidden",
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) | Self::Transition { .. } => "conflict",
            Self::InsufficientFunds { .. } => "insufficient_funds",
            Self::EscrowExists { .. } => "escrow_exists",
            Self::DuplicateKey => "duplicate_key",
            Self::Judge(_) => "judge_unavailable",
            Self::Database(_) => "transient",
            Self::Serialization(_) => "validation",
            Self::Invariant(_) => "invariant_violation",
            Self::Internal(_) => "internal",
        }
    }

    /// Whether an idempotent internal step may retry this error
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Database(sqlx::Error::PoolTimedOut) => true,
            Self::Database(sqlx::Error::Database(db)) => {
                // SQLITE_BUSY / SQLITE_LOCKED surface with these codes
                matches!(db.code().as_deref(), Some("5") | Some("6"))
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_match_taxonomy() {
        assert_eq!(EconomyError::validation("x").kind(), "validation");
        assert_eq!(
            EconomyError::transition("open", "ruled", "no path").kind(),
            "conflict"
        );
        assert_eq!(
            EconomyError::InsufficientFunds {
                balance: 3,
                required: 10
            }
            .kind(),
            "insufficient_funds"
        );
        assert_eq!(EconomyError::DuplicateKey.kind(), "duplicate_key");
    }

    #[test]
    fn only_storage_errors_are_transient() {
        assert!(!EconomyError::validation("x").is_transient());
        assert!(EconomyError::Database(sqlx::Error::PoolTimedOut).is_transient());
    }
}
