//! Changes: the replication unit.
//!
//! A change bundles a run of sequential transactions starting at a known
//! point in a document's committed history, one store delta per transaction
//! carrying the annotation values that transaction introduced, and the
//! authors' selections after the run. Wire shape:
//!
//! ```json
//! {
//!   "start": 7,
//!   "transactions": [[...], [...]],
//!   "stores": [{"hashes": [...], "hashStore": {...}}, {...}],
//!   "selections": {"5e3b...": {"anchor": 3, "focus": 3}}
//! }
//! ```

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use weft_core::{
    AnnotationHash, AnnotationStore, DataItem, DocumentEvent, LinearDocument, Operation,
    StoreDelta, Transaction, TransactionProcessor,
};

use crate::error::CollabError;
use crate::selection::{AuthorId, Selection};
use crate::squash::compose_all;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Change {
    /// History index this change applies after: the number of committed
    /// transactions its first transaction was built on.
    pub start: usize,
    pub transactions: Vec<Transaction>,
    /// Parallel to `transactions`: the annotation values each transaction
    /// introduced, exactly what a receiving replica must absorb before
    /// applying it.
    pub stores: Vec<StoreDelta>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub selections: BTreeMap<AuthorId, Selection>,
}

impl Change {
    pub fn empty(start: usize) -> Self {
        Change {
            start,
            transactions: Vec::new(),
            stores: Vec::new(),
            selections: BTreeMap::new(),
        }
    }

    pub fn from_transaction(start: usize, transaction: Transaction, store: StoreDelta) -> Self {
        Change {
            start,
            transactions: vec![transaction],
            stores: vec![store],
            selections: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    /// History index just past this change.
    pub fn end(&self) -> usize {
        self.start + self.transactions.len()
    }

    /// Structural sanity of a change received off the wire.
    pub fn validate(&self) -> Result<(), CollabError> {
        if self.transactions.len() != self.stores.len() {
            return Err(CollabError::BadChange(format!(
                "{} transactions but {} store deltas",
                self.transactions.len(),
                self.stores.len()
            )));
        }
        Ok(())
    }

    pub fn push(&mut self, transaction: Transaction, store: StoreDelta) {
        self.transactions.push(transaction);
        self.stores.push(store);
    }

    /// Append a consecutive change. `other` must start exactly where this
    /// change ends.
    pub fn concat(&self, other: &Change) -> Result<Change, CollabError> {
        if other.start != self.end() {
            return Err(CollabError::BadChange(format!(
                "cannot concat change starting at {} onto one ending at {}",
                other.start,
                self.end()
            )));
        }
        let mut merged = self.clone();
        merged.transactions.extend(other.transactions.iter().cloned());
        merged.stores.extend(other.stores.iter().cloned());
        for (author, selection) in &other.selections {
            merged.selections.insert(*author, *selection);
        }
        Ok(merged)
    }

    /// The tail of this change from history index `start` onward.
    pub fn most_recent(&self, start: usize) -> Result<Change, CollabError> {
        if start < self.start || start > self.end() {
            return Err(CollabError::BadChange(format!(
                "history index {start} outside change spanning {}..{}",
                self.start,
                self.end()
            )));
        }
        let skip = start - self.start;
        Ok(Change {
            start,
            transactions: self.transactions[skip..].to_vec(),
            stores: self.stores[skip..].to_vec(),
            selections: self.selections.clone(),
        })
    }

    /// The head of this change, keeping only the first `length` transactions.
    pub fn truncated(&self, length: usize) -> Change {
        let length = length.min(self.transactions.len());
        Change {
            start: self.start,
            transactions: self.transactions[..length].to_vec(),
            stores: self.stores[..length].to_vec(),
            selections: self.selections.clone(),
        }
    }

    /// Fold the whole run into a single transaction paired with one merged
    /// store delta. Annotation entries whose every reference was cancelled
    /// out during composition are dropped from the delta.
    pub fn squashed(&self) -> Result<Change, CollabError> {
        self.validate()?;
        if self.transactions.len() <= 1 {
            return Ok(self.clone());
        }
        let composed = compose_all(self.transactions.iter())?
            .ok_or_else(|| CollabError::BadChange("empty change".into()))?;

        let mut pool = AnnotationStore::new();
        for delta in &self.stores {
            pool.absorb(delta)?;
        }
        let refs = inserted_annotation_refs(&composed);
        let store = pool.slice(&refs);

        Ok(Change {
            start: self.start,
            transactions: vec![composed],
            stores: vec![store],
            selections: self.selections.clone(),
        })
    }

    /// Commit every transaction of this change to `doc`, absorbing each
    /// store delta first so inserted annotation references resolve.
    ///
    /// Runs in staging mode: the applied flag on a received change reflects
    /// the sender's bookkeeping, not this document's.
    pub fn commit_to(&self, doc: &mut LinearDocument) -> Result<Vec<DocumentEvent>, CollabError> {
        self.validate()?;
        let mut events = Vec::new();
        for (transaction, delta) in self.transactions.iter().zip(&self.stores) {
            doc.store_mut().absorb(delta)?;
            let mut txn = transaction.clone();
            events.extend(TransactionProcessor::process(doc, &mut txn, true)?);
        }
        Ok(events)
    }

    /// Net length delta across the whole run.
    pub fn net_delta(&self) -> isize {
        self.transactions.iter().map(Transaction::net_delta).sum()
    }
}

/// Annotation references appearing in a transaction's inserted content, in
/// first-use order.
pub fn inserted_annotation_refs(transaction: &Transaction) -> Vec<AnnotationHash> {
    let mut seen = BTreeSet::new();
    let mut refs = Vec::new();
    for op in transaction.ops() {
        if let Operation::Replace { insert, .. } = op {
            for item in insert {
                if let DataItem::Annotated(_, hashes) = item {
                    for hash in hashes {
                        if seen.insert(hash.clone()) {
                            refs.push(hash.clone());
                        }
                    }
                }
            }
        }
    }
    refs
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use weft_core::Annotation;

    fn scalars(text: &str) -> Vec<DataItem> {
        text.chars().map(DataItem::scalar).collect()
    }

    fn paragraph(text: &str) -> Vec<DataItem> {
        let mut items = vec![DataItem::open("paragraph")];
        items.extend(text.chars().map(DataItem::scalar));
        items.push(DataItem::close("paragraph"));
        items
    }

    #[test]
    fn test_validate_rejects_store_mismatch() {
        let mut change = Change::empty(0);
        change
            .transactions
            .push(Transaction::insert_at(2, 1, scalars("x")).unwrap());
        assert!(matches!(
            change.validate(),
            Err(CollabError::BadChange(_))
        ));
    }

    #[test]
    fn test_concat_requires_contiguity() {
        let a = Change::from_transaction(
            3,
            Transaction::insert_at(2, 1, scalars("x")).unwrap(),
            StoreDelta::default(),
        );
        let b = Change::from_transaction(
            5,
            Transaction::insert_at(3, 1, scalars("y")).unwrap(),
            StoreDelta::default(),
        );
        assert!(a.concat(&b).is_err());

        let b = Change { start: 4, ..b };
        let merged = a.concat(&b).unwrap();
        assert_eq!(merged.start, 3);
        assert_eq!(merged.end(), 5);
    }

    #[test]
    fn test_most_recent_slices_tail() {
        let mut change = Change::empty(2);
        change.push(
            Transaction::insert_at(4, 1, scalars("a")).unwrap(),
            StoreDelta::default(),
        );
        change.push(
            Transaction::insert_at(5, 2, scalars("b")).unwrap(),
            StoreDelta::default(),
        );

        let tail = change.most_recent(3).unwrap();
        assert_eq!(tail.start, 3);
        assert_eq!(tail.len(), 1);
        assert_eq!(tail.transactions[0], change.transactions[1]);

        assert!(change.most_recent(5).is_err());
    }

    #[test]
    fn test_squashed_folds_to_single_transaction() {
        let base = paragraph("abc");
        let mut doc = LinearDocument::from_items(base.clone()).unwrap();
        let mut change = Change::empty(0);

        let mut t1 = Transaction::insert_at(doc.len(), 2, scalars("X")).unwrap();
        doc.commit(&mut t1).unwrap();
        change.push(t1, StoreDelta::default());
        let mut t2 = Transaction::insert_at(doc.len(), 4, scalars("Y")).unwrap();
        doc.commit(&mut t2).unwrap();
        change.push(t2, StoreDelta::default());

        let squashed = change.squashed().unwrap();
        assert_eq!(squashed.len(), 1);
        assert_eq!(squashed.start, 0);

        let mut replay = LinearDocument::from_items(base).unwrap();
        squashed.commit_to(&mut replay).unwrap();
        assert_eq!(replay.snapshot(), doc.snapshot());
    }

    #[test]
    fn test_squashed_drops_cancelled_annotation_entries() {
        // An annotated run inserted and removed within the same change: its
        // store entry must not survive the squash.
        let mut scratch = AnnotationStore::new();
        let bold = scratch.insert(Annotation::new("bold"));
        let delta = scratch.slice(&[bold.clone()]);

        let base = paragraph("ab");
        let mut change = Change::empty(0);
        let t1 =
            Transaction::insert_at(4, 1, vec![DataItem::annotated('x', [bold.clone()])]).unwrap();
        change.push(t1, delta);
        let t2 = Transaction::remove_range(
            &[
                DataItem::open("paragraph"),
                DataItem::annotated('x', [bold.clone()]),
                DataItem::scalar('a'),
                DataItem::scalar('b'),
                DataItem::close("paragraph"),
            ],
            1..2,
        )
        .unwrap();
        change.push(t2, StoreDelta::default());

        let squashed = change.squashed().unwrap();
        assert!(squashed.stores[0].is_empty());

        let mut doc = LinearDocument::from_items(base).unwrap();
        squashed.commit_to(&mut doc).unwrap();
        assert_eq!(doc.content_summary(), "ab");
    }

    #[test]
    fn test_wire_shape() {
        let mut change = Change::from_transaction(
            7,
            Transaction::insert_at(2, 1, scalars("x")).unwrap(),
            StoreDelta::default(),
        );
        let author = uuid::Uuid::new_v4();
        change.selections.insert(author, Selection::collapsed(2));

        let json = serde_json::to_value(&change).unwrap();
        assert_eq!(json["start"], json!(7));
        assert_eq!(json["transactions"][0][0]["type"], json!("retain"));
        assert!(json["stores"][0].get("hashStore").is_some());
        assert_eq!(json["selections"][author.to_string()]["anchor"], json!(2));

        let back: Change = serde_json::from_value(json).unwrap();
        assert_eq!(back, change);
    }
}
