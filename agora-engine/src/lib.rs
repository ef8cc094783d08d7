//! Transactional backbone of the Agora agent micro-economy
//!
//! Five services share one SQLite store and one append-only event log:
//! - Identity: agent registry and ed25519 signature oracle
//! - Central Bank: accounts, idempotent ledger, escrow lock/release/split
//! - Task Board: the task lifecycle state machine and its timers
//! - Reputation: sealed dual-reveal feedback and score aggregation
//! - Court: claims, rebuttals, judge panel invocation, rulings
//!
//! Cross-service composites (create task + lock escrow, rule + split) run
//! inside a single store transaction, so the caller observes all-or-nothing
//! semantics without distributed compensation.

pub mod bank;
pub mod board;
pub mod config;
pub mod court;
pub mod events;
pub mod identity;
pub mod judge;
pub mod models;
pub mod node;
pub mod projection;
pub mod reputation;
pub mod scheduler;
pub mod store;

pub use agora_core::{EconomyError, EconomyResult};
pub use crate::config::Settings;
pub use crate::node::EconomyNode;
