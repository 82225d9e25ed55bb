//! Authoritative rebase server.
//!
//! Architecture:
//! ```text
//! Client A ──┐
//!             ├── SubmitChange ── RebaseServer ── per-doc DocumentState
//! Client B ──┘                        │              │
//!                                     │              ├── LinearDocument
//!                                     │              ├── committed history
//!                                     │              └── author selections
//!                                     │
//!                          ┌──────────┼───────────┐
//!                          ▼          ▼           ▼
//!                       Client A   Client B    Client C   (NewChange fan-out)
//! ```
//!
//! The server is the single ordering point: a submitted change built on
//! stale history is rebased across the committed tail before it commits,
//! and the rebased form is what everyone — the submitter included — sees
//! broadcast. Commit is transactional per change: a change that fails to
//! apply leaves the document exactly as it was.

use std::collections::{BTreeMap, HashMap};

use log::{debug, info};
use uuid::Uuid;
use weft_core::{DataItem, LinearDocument};

use crate::change::Change;
use crate::error::CollabError;
use crate::protocol::DocumentSnapshot;
use crate::selection::{AuthorId, Selection};
use crate::transform::{transform_change, TransformLog};

/// One document's authoritative state.
pub struct DocumentState {
    doc: LinearDocument,
    /// Committed history from index 0; `history.end()` is the current
    /// history length.
    history: Change,
    selections: BTreeMap<AuthorId, Selection>,
}

impl DocumentState {
    fn new(items: Vec<DataItem>) -> Result<Self, CollabError> {
        Ok(Self {
            doc: LinearDocument::from_items(items)?,
            history: Change::empty(0),
            selections: BTreeMap::new(),
        })
    }

    pub fn doc(&self) -> &LinearDocument {
        &self.doc
    }

    pub fn history_length(&self) -> usize {
        self.history.end()
    }

    pub fn selections(&self) -> &BTreeMap<AuthorId, Selection> {
        &self.selections
    }

    /// Everything a late joiner needs.
    pub fn snapshot(&self) -> DocumentSnapshot {
        DocumentSnapshot {
            items: self.doc.snapshot().to_vec(),
            store: self.doc.store().slice(self.doc.store().hashes()),
            history_length: self.history_length(),
            selections: self.selections.clone(),
        }
    }
}

/// Server tuning knobs.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Largest transaction count accepted in one submitted change.
    pub max_change_transactions: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_change_transactions: 1024,
        }
    }
}

/// Orders and commits changes for any number of documents.
#[derive(Default)]
pub struct RebaseServer {
    config: ServerConfig,
    documents: HashMap<Uuid, DocumentState>,
}

impl RebaseServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: ServerConfig) -> Self {
        Self {
            config,
            documents: HashMap::new(),
        }
    }

    /// Fetch a document, creating it from `initial` on first access.
    pub fn load_or_create(
        &mut self,
        doc_id: Uuid,
        initial: Vec<DataItem>,
    ) -> Result<&DocumentState, CollabError> {
        if !self.documents.contains_key(&doc_id) {
            info!("creating document {doc_id}");
            self.documents.insert(doc_id, DocumentState::new(initial)?);
        }
        Ok(&self.documents[&doc_id])
    }

    pub fn document(&self, doc_id: &Uuid) -> Result<&DocumentState, CollabError> {
        self.documents
            .get(doc_id)
            .ok_or(CollabError::UnknownDocument(*doc_id))
    }

    pub fn document_count(&self) -> usize {
        self.documents.len()
    }

    /// Commit a submitted change, rebasing it first when it was built on
    /// stale history. Returns the committed form — what must be broadcast —
    /// plus the log of anything the rebase dropped.
    ///
    /// The commit is atomic: on any error the document state is unchanged.
    pub fn apply_change(
        &mut self,
        doc_id: Uuid,
        author: AuthorId,
        change: &Change,
    ) -> Result<(Change, TransformLog), CollabError> {
        change.validate()?;
        if change.len() > self.config.max_change_transactions {
            return Err(CollabError::BadChange(format!(
                "change carries {} transactions, limit is {}",
                change.len(),
                self.config.max_change_transactions
            )));
        }
        let state = self
            .documents
            .get_mut(&doc_id)
            .ok_or(CollabError::UnknownDocument(doc_id))?;

        // Committed transactions the submitter has not seen yet.
        let behind = state.history.most_recent(change.start)?;
        let (rebased, log) = transform_change(change, &behind)?;
        if !log.is_clean() {
            debug!(
                "change from {author} at {} rebased with {} rejections",
                change.start,
                log.rejections.len()
            );
        }

        // Stage on a copy so a failing transaction cannot leave the
        // authoritative document half-updated.
        let mut staged = state.doc.clone();
        rebased.commit_to(&mut staged)?;
        let history = state.history.concat(&rebased)?;

        state.doc = staged;
        state.history = history;

        // Everyone else's selection drifts with the committed content; the
        // submitter's travels inside the change.
        for (other, selection) in state.selections.iter_mut() {
            if rebased.selections.contains_key(other) {
                continue;
            }
            for txn in &rebased.transactions {
                *selection = selection.translate_through(txn);
            }
        }
        for (who, selection) in &rebased.selections {
            state.selections.insert(*who, *selection);
        }

        debug!(
            "document {doc_id}: committed {} transaction(s), history now {}",
            rebased.len(),
            state.history_length()
        );
        Ok((rebased, log))
    }

    /// Committed history from index `start` onward, for a client catching up.
    pub fn changes_since(&self, doc_id: &Uuid, start: usize) -> Result<Change, CollabError> {
        let state = self.document(doc_id)?;
        state.history.most_recent(start)
    }

    /// Drop a departed author's presence.
    pub fn remove_author(&mut self, doc_id: &Uuid, author: &AuthorId) {
        if let Some(state) = self.documents.get_mut(doc_id) {
            if state.selections.remove(author).is_some() {
                debug!("document {doc_id}: author {author} disconnected");
            }
        }
    }

    /// One-line description of a document's state, for logs and debugging.
    pub fn history_summary(&self, doc_id: &Uuid) -> Result<String, CollabError> {
        let state = self.document(doc_id)?;
        let ops: usize = state
            .history
            .transactions
            .iter()
            .map(|t| t.ops().len())
            .sum();
        Ok(format!(
            "history={} ops={} length={} authors={}",
            state.history_length(),
            ops,
            state.doc.len(),
            state.selections.len()
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_core::{StoreDelta, Transaction};

    fn paragraph(text: &str) -> Vec<DataItem> {
        let mut items = vec![DataItem::open("paragraph")];
        items.extend(text.chars().map(DataItem::scalar));
        items.push(DataItem::close("paragraph"));
        items
    }

    fn scalars(text: &str) -> Vec<DataItem> {
        text.chars().map(DataItem::scalar).collect()
    }

    #[test]
    fn test_load_or_create_is_idempotent() {
        let mut server = RebaseServer::new();
        let doc_id = Uuid::new_v4();
        server.load_or_create(doc_id, paragraph("hi")).unwrap();
        server.load_or_create(doc_id, paragraph("ignored")).unwrap();

        assert_eq!(server.document_count(), 1);
        assert_eq!(server.document(&doc_id).unwrap().doc().content_summary(), "hi");
    }

    #[test]
    fn test_oversized_change_is_refused() {
        let mut server = RebaseServer::with_config(ServerConfig {
            max_change_transactions: 1,
        });
        let doc_id = Uuid::new_v4();
        let author = Uuid::new_v4();
        server.load_or_create(doc_id, paragraph("ab")).unwrap();

        let mut change = Change::empty(0);
        change.push(
            Transaction::insert_at(4, 1, scalars("X")).unwrap(),
            StoreDelta::default(),
        );
        change.push(
            Transaction::insert_at(5, 2, scalars("Y")).unwrap(),
            StoreDelta::default(),
        );
        assert!(matches!(
            server.apply_change(doc_id, author, &change),
            Err(CollabError::BadChange(_))
        ));
        assert_eq!(server.document(&doc_id).unwrap().history_length(), 0);
    }

    #[test]
    fn test_unknown_document() {
        let server = RebaseServer::new();
        assert!(matches!(
            server.document(&Uuid::new_v4()),
            Err(CollabError::UnknownDocument(_))
        ));
    }

    #[test]
    fn test_apply_change_in_sequence() {
        let mut server = RebaseServer::new();
        let doc_id = Uuid::new_v4();
        let author = Uuid::new_v4();
        server.load_or_create(doc_id, paragraph("ab")).unwrap();

        let change = Change::from_transaction(
            0,
            Transaction::insert_at(4, 1, scalars("X")).unwrap(),
            StoreDelta::default(),
        );
        let (committed, log) = server.apply_change(doc_id, author, &change).unwrap();
        assert!(log.is_clean());
        assert_eq!(committed.start, 0);

        let state = server.document(&doc_id).unwrap();
        assert_eq!(state.history_length(), 1);
        assert_eq!(state.doc().content_summary(), "Xab");
    }

    #[test]
    fn test_apply_change_rebases_stale_submission() {
        let mut server = RebaseServer::new();
        let doc_id = Uuid::new_v4();
        server.load_or_create(doc_id, paragraph("")).unwrap();

        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let a = Change::from_transaction(
            0,
            Transaction::insert_at(2, 1, scalars("abc")).unwrap(),
            StoreDelta::default(),
        );
        let b = Change::from_transaction(
            0,
            Transaction::insert_at(2, 1, scalars("AB")).unwrap(),
            StoreDelta::default(),
        );

        server.apply_change(doc_id, alice, &a).unwrap();
        let (committed_b, _) = server.apply_change(doc_id, bob, &b).unwrap();
        assert_eq!(committed_b.start, 1);

        let state = server.document(&doc_id).unwrap();
        assert_eq!(state.doc().content_summary(), "abcAB");
        assert_eq!(state.history_length(), 2);
    }

    #[test]
    fn test_failed_commit_leaves_state_untouched() {
        let mut server = RebaseServer::new();
        let doc_id = Uuid::new_v4();
        let author = Uuid::new_v4();
        server.load_or_create(doc_id, paragraph("ab")).unwrap();

        // Removal content does not match the document.
        let bogus = Change::from_transaction(
            0,
            Transaction::remove_range(&paragraph("xy"), 1..2).unwrap(),
            StoreDelta::default(),
        );
        assert!(server.apply_change(doc_id, author, &bogus).is_err());

        let state = server.document(&doc_id).unwrap();
        assert_eq!(state.history_length(), 0);
        assert_eq!(state.doc().content_summary(), "ab");
    }

    #[test]
    fn test_changes_since() {
        let mut server = RebaseServer::new();
        let doc_id = Uuid::new_v4();
        let author = Uuid::new_v4();
        server.load_or_create(doc_id, paragraph("")).unwrap();

        for text in ["a", "b"] {
            let state = server.document(&doc_id).unwrap();
            let change = Change::from_transaction(
                state.history_length(),
                Transaction::insert_at(state.doc().len(), 1, scalars(text)).unwrap(),
                StoreDelta::default(),
            );
            server.apply_change(doc_id, author, &change).unwrap();
        }

        let tail = server.changes_since(&doc_id, 1).unwrap();
        assert_eq!(tail.start, 1);
        assert_eq!(tail.len(), 1);

        let all = server.changes_since(&doc_id, 0).unwrap();
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn test_selections_follow_committed_content() {
        let mut server = RebaseServer::new();
        let doc_id = Uuid::new_v4();
        server.load_or_create(doc_id, paragraph("ab")).unwrap();

        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();

        // Bob parks his cursor at offset 3, announced via a no-op change.
        let mut parked = Change::empty(0);
        parked.selections.insert(bob, Selection::collapsed(3));
        server.apply_change(doc_id, bob, &parked).unwrap();

        // Alice inserts before it; Bob's cursor must shift right.
        let insert = Change::from_transaction(
            0,
            Transaction::insert_at(4, 1, scalars("XY")).unwrap(),
            StoreDelta::default(),
        );
        server.apply_change(doc_id, alice, &insert).unwrap();

        let state = server.document(&doc_id).unwrap();
        assert_eq!(state.selections()[&bob], Selection::collapsed(5));

        server.remove_author(&doc_id, &bob);
        let state = server.document(&doc_id).unwrap();
        assert!(!state.selections().contains_key(&bob));
    }

    #[test]
    fn test_history_summary() {
        let mut server = RebaseServer::new();
        let doc_id = Uuid::new_v4();
        server.load_or_create(doc_id, paragraph("ab")).unwrap();
        let summary = server.history_summary(&doc_id).unwrap();
        assert!(summary.contains("history=0"));
        assert!(summary.contains("length=4"));
    }
}
