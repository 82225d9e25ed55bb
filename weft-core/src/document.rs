//! The linear document: item array, annotation store, tree projection.
//!
//! The array is the source of truth; the tree is derived and kept in sync by
//! the transaction processor. UI code never mutates a document directly —
//! every mutation goes through [`commit`](LinearDocument::commit) /
//! [`rollback`](LinearDocument::rollback).

use crate::error::CoreError;
use crate::item::DataItem;
use crate::processor::{DocumentEvent, TransactionProcessor};
use crate::store::AnnotationStore;
use crate::transaction::Transaction;
use crate::tree::TreeProjection;

#[derive(Debug, Clone)]
pub struct LinearDocument {
    pub(crate) items: Vec<DataItem>,
    pub(crate) store: AnnotationStore,
    pub(crate) tree: TreeProjection,
}

impl PartialEq for LinearDocument {
    /// Tree equality follows from item equality; only content and store
    /// participate in replica comparison.
    fn eq(&self, other: &Self) -> bool {
        self.items == other.items && self.store == other.store
    }
}

impl LinearDocument {
    /// Build a document from items and a store. Fails if the items are not
    /// balanced.
    pub fn new(items: Vec<DataItem>, store: AnnotationStore) -> Result<Self, CoreError> {
        let tree = TreeProjection::build(&items)?;
        Ok(Self { items, store, tree })
    }

    pub fn from_items(items: Vec<DataItem>) -> Result<Self, CoreError> {
        Self::new(items, AnnotationStore::new())
    }

    pub fn empty() -> Self {
        Self {
            items: Vec::new(),
            store: AnnotationStore::new(),
            tree: TreeProjection::default(),
        }
    }

    /// The boundary handed to the rendering layer: the current item array.
    pub fn snapshot(&self) -> &[DataItem] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn store(&self) -> &AnnotationStore {
        &self.store
    }

    /// The store is append-only; mutation is limited to inserting values.
    pub fn store_mut(&mut self) -> &mut AnnotationStore {
        &mut self.store
    }

    pub fn tree(&self) -> &TreeProjection {
        &self.tree
    }

    /// Scalar content flattened into a string. Used for history summaries
    /// and convergence checks.
    pub fn content_summary(&self) -> String {
        self.items
            .iter()
            .filter_map(DataItem::scalar_value)
            .collect()
    }

    /// Apply `txn` atomically and mark it applied. Returns the deduplicated
    /// change notifications for observers.
    pub fn commit(&mut self, txn: &mut Transaction) -> Result<Vec<DocumentEvent>, CoreError> {
        TransactionProcessor::process(self, txn, false)
    }

    /// Undo a previously committed transaction by applying its inverse.
    pub fn rollback(&mut self, txn: &mut Transaction) -> Result<Vec<DocumentEvent>, CoreError> {
        if !txn.is_applied() {
            return Err(CoreError::NotApplied);
        }
        let mut inverse = txn.invert();
        let events = TransactionProcessor::process(self, &mut inverse, true)?;
        txn.set_applied(false);
        Ok(events)
    }

    /// Force a full tree rebuild from the array.
    pub fn rebuild_tree(&mut self) -> Result<(), CoreError> {
        self.tree = TreeProjection::build(&self.items)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paragraph(text: &str) -> Vec<DataItem> {
        let mut items = vec![DataItem::open("paragraph")];
        items.extend(text.chars().map(DataItem::scalar));
        items.push(DataItem::close("paragraph"));
        items
    }

    #[test]
    fn test_new_validates_balance() {
        assert!(LinearDocument::from_items(vec![DataItem::open("paragraph")]).is_err());
        assert!(LinearDocument::from_items(paragraph("ab")).is_ok());
    }

    #[test]
    fn test_commit_and_rollback_restore_document() {
        let mut doc = LinearDocument::from_items(paragraph("abc")).unwrap();
        let before = doc.snapshot().to_vec();

        let mut txn = Transaction::remove_range(doc.snapshot(), 2..4).unwrap();
        doc.commit(&mut txn).unwrap();
        assert_eq!(doc.content_summary(), "a");
        assert!(txn.is_applied());

        doc.rollback(&mut txn).unwrap();
        assert_eq!(doc.snapshot(), &before[..]);
        assert!(!txn.is_applied());
    }

    #[test]
    fn test_rollback_requires_applied() {
        let mut doc = LinearDocument::from_items(paragraph("abc")).unwrap();
        let mut txn = Transaction::remove_range(doc.snapshot(), 2..4).unwrap();
        assert_eq!(doc.rollback(&mut txn), Err(CoreError::NotApplied));
    }

    #[test]
    fn test_content_summary_skips_markers() {
        let mut items = paragraph("ab");
        items.extend(paragraph("cd"));
        let doc = LinearDocument::from_items(items).unwrap();
        assert_eq!(doc.content_summary(), "abcd");
    }
}
