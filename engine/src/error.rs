//! Error types for the reconciliation engine.

use crate::{EntityKind, RecordId};
use thiserror::Error;

/// All possible errors from the engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Input errors
    #[error("invalid page request: {0}")]
    InvalidPage(String),

    #[error("invalid filter: {0}")]
    InvalidFilter(String),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("kind mismatch: list holds {expected}, record is {got}")]
    KindMismatch { expected: EntityKind, got: EntityKind },

    // Mutation errors
    #[error("record not found: {0}")]
    RecordNotFound(RecordId),

    #[error("record already exists: {0}")]
    DuplicateRecord(RecordId),
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
