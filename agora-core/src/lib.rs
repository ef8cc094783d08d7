//! Core types shared by every Agora service crate
//!
//! This crate carries the pieces all services agree on: the prefixed
//! identifier scheme, the canonical request serialization that signatures
//! cover, and the error taxonomy mapped onto the wire envelope.

pub mod canonical;
pub mod error;
pub mod id;

pub use error::EconomyError;

/// Result type alias for economy operations
pub type EconomyResult<T> = Result<T, EconomyError>;
