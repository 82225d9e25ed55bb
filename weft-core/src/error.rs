//! Error taxonomy for the linear model and transaction engine.

use thiserror::Error;

/// Errors raised by document construction and transaction processing.
///
/// `UnbalancedTransaction` and `InvalidOperation` are fatal to the
/// transaction that caused them and are guaranteed to leave the document
/// untouched. `UnbalancedDocument` surfaces from the tree projection and
/// triggers a full rollback in the processor.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CoreError {
    #[error("unbalanced transaction: net nesting {nesting}")]
    UnbalancedTransaction { nesting: i64 },

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("unbalanced document content at offset {offset}")]
    UnbalancedDocument { offset: usize },

    #[error("transaction already applied")]
    AlreadyApplied,

    #[error("transaction not applied")]
    NotApplied,
}
