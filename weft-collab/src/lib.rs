//! # weft-collab — rebase-based collaborative editing
//!
//! Replication for [`weft_core`] documents: optimistic client replicas, a
//! central server that serializes concurrent changes by rewriting them over
//! whatever was committed first, and the wire envelope connecting the two.
//!
//! ## Architecture
//!
//! ```text
//!  ┌──────────────┐  submit(Change)   ┌──────────────────────────┐
//!  │ RebaseClient │ ────────────────► │ RebaseServer             │
//!  │  doc (local) │                   │  per-doc DocumentState   │
//!  │  unconfirmed │ ◄──────────────── │  transform → commit →    │
//!  │  queue       │  broadcast(Change)│  append history          │
//!  └──────────────┘       ▲           └───────────┬──────────────┘
//!         │               │                       │
//!         │ rebase queue  └───── DocumentHub ─────┘
//!         ▼                      (fan-out)
//!  identical rewrite on every replica ⇒ convergence
//! ```
//!
//! Both sides run the same deterministic rewrite ([`transform_change`]), so
//! a client that rebased its queue over an interleaved broadcast holds
//! exactly what the server later echoes back.
//!
//! ## Modules
//!
//! - [`selection`] — author cursors and offset translation through edits
//! - [`squash`] — transaction composition; the algebra transform relies on
//! - [`change`] — the replication unit: a run of transactions plus stores
//! - [`transform`] — rewriting a change across concurrent committed work
//! - [`protocol`] — message envelope and payload codecs
//! - [`broadcast`] — per-document fan-out, anchored to the commit order
//! - [`server`] — the authoritative commit path
//! - [`client`] — the optimistic replica and its rebase loop
//!
//! [`transform_change`]: transform::transform_change

pub mod broadcast;
pub mod change;
pub mod client;
pub mod error;
pub mod protocol;
pub mod selection;
pub mod server;
pub mod squash;
pub mod transform;

pub use broadcast::{AuthorInfo, DocumentHub, HubEvent, HubRegistry, HubStats, HubSubscription};
pub use change::Change;
pub use client::{AcceptOutcome, ClientConfig, RebaseClient};
pub use error::CollabError;
pub use protocol::{DocumentSnapshot, MessageType, SyncMessage};
pub use selection::{AuthorId, Selection};
pub use server::{DocumentState, RebaseServer, ServerConfig};
pub use squash::{compose, compose_all};
pub use transform::{transform_change, Rejection, TransformLog};
