//! Prefixed identifier scheme
//!
//! Every entity id on the wire is `<prefix>-<uuid-v4>`; the prefix is part
//! of the contract and doubles as a cheap type check at the boundary.

use uuid::Uuid;

use crate::{EconomyError, EconomyResult};

pub const AGENT: &str = "a";
pub const TASK: &str = "t";
pub const BID: &str = "bid";
pub const ESCROW: &str = "esc";
pub const TRANSACTION: &str = "tx";
pub const ASSET: &str = "asset";
pub const FEEDBACK: &str = "fb";
pub const CLAIM: &str = "clm";
pub const REBUTTAL: &str = "reb";
pub const RULING: &str = "rul";

/// Mint a fresh id with the given prefix
pub fn fresh(prefix: &str) -> String {
    format!("{}-{}", prefix, Uuid::new_v4())
}

/// Check that `id` is a well-formed `<prefix>-<uuid>` identifier
pub fn is_valid(prefix: &str, id: &str) -> bool {
    id.strip_prefix(prefix)
        .and_then(|rest| rest.strip_prefix('-'))
        .map(|tail| Uuid::parse_str(tail).is_ok())
        .unwrap_or(false)
}

/// Validate `id` against `prefix`, naming `what` in the error
pub fn ensure(prefix: &str, id: &str, what: &str) -> EconomyResult<()> {
    if is_valid(prefix, id) {
        Ok(())
    } else {
        Err(EconomyError::validation(format!(
            "malformed {} id: {}",
            what, id
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_ids_validate() {
        let id = fresh(TASK);
        assert!(id.starts_with("t-"));
        assert!(is_valid(TASK, &id));
    }

    #[test]
    fn wrong_prefix_rejected() {
        let id = fresh(AGENT);
        assert!(!is_valid(TASK, &id));
        assert!(ensure(TASK, &id, "task").is_err());
    }

    #[test]
    fn garbage_rejected() {
        assert!(!is_valid(AGENT, "a-not-a-uuid"));
        assert!(!is_valid(AGENT, "a"));
        assert!(!is_valid(AGENT, ""));
    }
}
