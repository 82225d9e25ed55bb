//! # weft-core — linear document model and transaction engine
//!
//! A document is a flat, annotated token sequence kept in sync with a tree
//! projection, mutated only through atomic, invertible transactions.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐   commit / rollback   ┌──────────────────────┐
//! │ Transaction      │ ────────────────────► │ LinearDocument       │
//! │ (op list)        │                       │  items: [DataItem]   │
//! └──────────────────┘                       │  store: Annotations  │
//!          │                                 │  tree:  projection   │
//!          ▼                                 └──────────┬───────────┘
//! ┌──────────────────┐                                  │ events
//! │ Processor        │  verify → apply → sync tree      ▼
//! │ (undo log)       │  rollback on any failure   ┌───────────┐
//! └──────────────────┘                            │ observers │
//!                                                 └───────────┘
//! ```
//!
//! ## Modules
//!
//! - [`item`] — data items: scalars, annotated scalars, structural markers
//! - [`store`] — content-addressed, deduplicated annotation store
//! - [`document`] — the linear document and its tree projection
//! - [`transaction`] — operations, transactions, inversion, builders
//! - [`processor`] — atomic apply with tagged-inverse rollback
//! - [`tree`] — the derived tree view and its re-synchronization

pub mod document;
pub mod error;
pub mod item;
pub mod processor;
pub mod store;
pub mod transaction;
pub mod tree;

// Re-exports for convenience
pub use document::LinearDocument;
pub use error::CoreError;
pub use item::{net_nesting, DataItem, Marker};
pub use processor::{DocumentEvent, TransactionProcessor};
pub use store::{Annotation, AnnotationHash, AnnotationStore, StoreDelta};
pub use transaction::{Operation, PositionedAttr, Splice, Transaction};
pub use tree::{DocumentNode, ResyncSplice, TreeProjection};
