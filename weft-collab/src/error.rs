//! Error taxonomy for the replication layer.
//!
//! Transform conflicts are deliberately absent: they are an expected
//! steady-state occurrence, resolved by rejection and reported through the
//! transform log, never raised as errors.

use thiserror::Error;
use weft_core::CoreError;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CollabError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("malformed change: {0}")]
    BadChange(String),

    #[error("stale history: local watermark {local}, remote {remote}")]
    StaleHistory { local: usize, remote: usize },

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("unknown document {0}")]
    UnknownDocument(uuid::Uuid),
}
