//! The transaction processor: atomic apply with full rollback.
//!
//! Processing runs in three phases:
//!
//! 1. A read-only walk over the operations that verifies the balance
//!    invariant, checks removals against actual document content, and
//!    queues concrete array edits. Nothing is mutated; a bad transaction
//!    is rejected here with the document untouched.
//! 2. Queued edits are applied in order, each recording a tagged inverse
//!    edit — the undo log.
//! 3. The tree projection is re-synchronized (incrementally where possible,
//!    full rebuild otherwise). If this fails, the undo log runs in reverse,
//!    the tree is rebuilt from the restored array, and the error is
//!    re-raised: the document is item-for-item what it was before.

use serde_json::Value;

use crate::document::LinearDocument;
use crate::error::CoreError;
use crate::item::DataItem;
use crate::transaction::{Operation, Transaction};
use crate::tree::{ResyncSplice, TreeProjection};

/// Change notification emitted from a successful commit.
///
/// Purely observational: consumers must not rely on events for document
/// correctness. Identical events are emitted once.
#[derive(Debug, Clone, PartialEq)]
pub enum DocumentEvent {
    /// Items were removed and/or inserted at `offset` (post-apply coords).
    Spliced {
        offset: usize,
        removed_len: usize,
        inserted_len: usize,
    },
    AttributeChanged {
        offset: usize,
        key: String,
        from: Option<Value>,
        to: Option<Value>,
    },
    /// The element opening at `offset` had its subtree touched.
    NodeUpdated { offset: usize },
}

/// A concrete array edit queued during the verification walk. Offsets are
/// apply-time coordinates (adjusted for earlier queued splices).
#[derive(Debug)]
enum QueuedEdit {
    Splice {
        offset: usize,
        remove_len: usize,
        insert: Vec<DataItem>,
        structural: bool,
    },
    Attribute {
        offset: usize,
        key: String,
        from: Option<Value>,
        to: Option<Value>,
    },
}

/// The undo log: tagged inverse edits, applied in reverse on rollback.
#[derive(Debug)]
enum InverseEdit {
    Reinsert {
        offset: usize,
        removed: Vec<DataItem>,
        inserted_len: usize,
    },
    RestoreAttribute {
        offset: usize,
        key: String,
        value: Option<Value>,
    },
}

pub struct TransactionProcessor;

impl TransactionProcessor {
    /// Execute `txn` against `doc` atomically.
    ///
    /// With `staging` set, the applied-flag bookkeeping is skipped: the
    /// transaction is neither guarded against double-commit nor marked
    /// applied. Used for speculative application the caller manages itself
    /// (rollback, rebase replay).
    pub fn process(
        doc: &mut LinearDocument,
        txn: &mut Transaction,
        staging: bool,
    ) -> Result<Vec<DocumentEvent>, CoreError> {
        if !staging && txn.is_applied() {
            return Err(CoreError::AlreadyApplied);
        }

        let edits = Self::verify_and_queue(doc, txn)?;

        let mut undo_log = Vec::with_capacity(edits.len());
        Self::apply_edits(doc, &edits, &mut undo_log);

        if let Err(err) = Self::sync_tree(doc, &edits) {
            Self::run_undo_log(doc, &undo_log);
            // Correctness fallback after rollback: rebuild from the restored
            // array. The pre-state was valid, so this cannot fail.
            match TreeProjection::build(&doc.items) {
                Ok(tree) => doc.tree = tree,
                Err(rebuild_err) => {
                    log::error!("tree rebuild after rollback failed: {rebuild_err}");
                }
            }
            return Err(err);
        }

        if !staging {
            txn.set_applied(true);
        }
        Ok(Self::collect_events(doc, &edits))
    }

    /// Phase 1: verify without mutating, queue concrete edits.
    fn verify_and_queue(
        doc: &LinearDocument,
        txn: &Transaction,
    ) -> Result<Vec<QueuedEdit>, CoreError> {
        if txn.base_length() != doc.items.len() {
            return Err(CoreError::InvalidOperation(format!(
                "transaction built for length {}, document has {}",
                txn.base_length(),
                doc.items.len()
            )));
        }

        let mut edits = Vec::new();
        let mut cursor = 0usize;
        let mut adjustment = 0isize;

        for op in txn.ops() {
            match op {
                Operation::Retain { length } => cursor += length,
                Operation::Replace { remove, insert } => {
                    let removed_nesting = crate::item::net_nesting(remove);
                    if removed_nesting != 0 {
                        return Err(CoreError::UnbalancedTransaction {
                            nesting: removed_nesting,
                        });
                    }
                    let inserted_nesting = crate::item::net_nesting(insert);
                    if inserted_nesting != 0 {
                        return Err(CoreError::UnbalancedTransaction {
                            nesting: inserted_nesting,
                        });
                    }

                    let actual = &doc.items[cursor..cursor + remove.len()];
                    if actual != &remove[..] {
                        return Err(CoreError::InvalidOperation(format!(
                            "removal at offset {cursor} does not match document content"
                        )));
                    }
                    for item in insert {
                        if let Some(refs) = item.annotations() {
                            for hash in refs {
                                if !doc.store.contains(hash) {
                                    return Err(CoreError::InvalidOperation(format!(
                                        "unknown annotation reference {hash}"
                                    )));
                                }
                            }
                        }
                    }

                    let structural = remove.iter().chain(insert).any(DataItem::is_marker);
                    if !remove.is_empty() || !insert.is_empty() {
                        edits.push(QueuedEdit::Splice {
                            offset: (cursor as isize + adjustment) as usize,
                            remove_len: remove.len(),
                            insert: insert.clone(),
                            structural,
                        });
                    }
                    adjustment += insert.len() as isize - remove.len() as isize;
                    cursor += remove.len();
                }
                Operation::SetAttribute { key, from, to } => {
                    let target = doc.items.get(cursor).ok_or_else(|| {
                        CoreError::InvalidOperation(format!(
                            "attribute change at offset {cursor} beyond document end"
                        ))
                    })?;
                    let DataItem::Marker(marker) = target else {
                        return Err(CoreError::InvalidOperation(format!(
                            "attribute change at offset {cursor} targets non-marker"
                        )));
                    };
                    if marker.kind.starts_with('/') {
                        return Err(CoreError::InvalidOperation(format!(
                            "attribute change at offset {cursor} targets closing marker"
                        )));
                    }
                    if marker.attributes.get(key) != from.as_ref() {
                        return Err(CoreError::InvalidOperation(format!(
                            "attribute {key:?} at offset {cursor} does not match expected value"
                        )));
                    }
                    edits.push(QueuedEdit::Attribute {
                        offset: (cursor as isize + adjustment) as usize,
                        key: key.clone(),
                        from: from.clone(),
                        to: to.clone(),
                    });
                }
            }
        }

        Ok(edits)
    }

    /// Phase 2: mutate the array, recording the undo log.
    fn apply_edits(doc: &mut LinearDocument, edits: &[QueuedEdit], undo_log: &mut Vec<InverseEdit>) {
        for edit in edits {
            match edit {
                QueuedEdit::Splice {
                    offset,
                    remove_len,
                    insert,
                    ..
                } => {
                    let removed: Vec<DataItem> = doc
                        .items
                        .splice(*offset..*offset + remove_len, insert.iter().cloned())
                        .collect();
                    undo_log.push(InverseEdit::Reinsert {
                        offset: *offset,
                        removed,
                        inserted_len: insert.len(),
                    });
                }
                QueuedEdit::Attribute {
                    offset, key, to, ..
                } => {
                    if let DataItem::Marker(marker) = &mut doc.items[*offset] {
                        let old = match to {
                            Some(value) => marker.attributes.insert(key.clone(), value.clone()),
                            None => marker.attributes.remove(key),
                        };
                        undo_log.push(InverseEdit::RestoreAttribute {
                            offset: *offset,
                            key: key.clone(),
                            value: old,
                        });
                    }
                }
            }
        }
    }

    /// Phase 3: bring the tree projection back in sync with the array.
    fn sync_tree(doc: &mut LinearDocument, edits: &[QueuedEdit]) -> Result<(), CoreError> {
        let splices: Vec<ResyncSplice> = edits
            .iter()
            .filter_map(|edit| match edit {
                QueuedEdit::Splice {
                    offset,
                    remove_len,
                    insert,
                    structural,
                } => Some(ResyncSplice {
                    offset: *offset,
                    removed_len: *remove_len,
                    inserted_len: insert.len(),
                    structural: *structural,
                }),
                QueuedEdit::Attribute { .. } => None,
            })
            .collect();

        let mut resynced = doc.tree.clone();
        if resynced.resync(&splices) {
            doc.tree = resynced;
        } else {
            doc.tree = TreeProjection::build(&doc.items)?;
        }

        debug_assert!(doc.tree.offsets_consistent_with(&doc.items));

        // Attribute edits land on the tree as well.
        for edit in edits {
            if let QueuedEdit::Attribute {
                offset, key, to, ..
            } = edit
            {
                update_tree_attribute(&mut doc.tree.roots, *offset, key, to);
            }
        }
        Ok(())
    }

    /// Rollback: interpret the undo log in reverse.
    fn run_undo_log(doc: &mut LinearDocument, undo_log: &[InverseEdit]) {
        for edit in undo_log.iter().rev() {
            match edit {
                InverseEdit::Reinsert {
                    offset,
                    removed,
                    inserted_len,
                } => {
                    doc.items
                        .splice(*offset..*offset + inserted_len, removed.iter().cloned());
                }
                InverseEdit::RestoreAttribute { offset, key, value } => {
                    if let DataItem::Marker(marker) = &mut doc.items[*offset] {
                        match value {
                            Some(old) => marker.attributes.insert(key.clone(), old.clone()),
                            None => marker.attributes.remove(key),
                        };
                    }
                }
            }
        }
    }

    fn collect_events(doc: &LinearDocument, edits: &[QueuedEdit]) -> Vec<DocumentEvent> {
        let mut events: Vec<DocumentEvent> = Vec::new();
        let mut push = |events: &mut Vec<DocumentEvent>, event: DocumentEvent| {
            if !events.contains(&event) {
                events.push(event);
            }
        };

        for edit in edits {
            match edit {
                QueuedEdit::Splice {
                    offset,
                    remove_len,
                    insert,
                    ..
                } => {
                    push(
                        &mut events,
                        DocumentEvent::Spliced {
                            offset: *offset,
                            removed_len: *remove_len,
                            inserted_len: insert.len(),
                        },
                    );
                    if let Some(node_offset) = doc.tree.enclosing_element_start(*offset) {
                        push(&mut events, DocumentEvent::NodeUpdated { offset: node_offset });
                    }
                }
                QueuedEdit::Attribute {
                    offset,
                    key,
                    from,
                    to,
                } => {
                    push(
                        &mut events,
                        DocumentEvent::AttributeChanged {
                            offset: *offset,
                            key: key.clone(),
                            from: from.clone(),
                            to: to.clone(),
                        },
                    );
                }
            }
        }
        events
    }
}

/// Mirror an attribute change onto the projected element node at `offset`.
fn update_tree_attribute(
    nodes: &mut [crate::tree::DocumentNode],
    offset: usize,
    key: &str,
    to: &Option<Value>,
) {
    use crate::tree::DocumentNode;
    for node in nodes {
        if let DocumentNode::Element {
            range,
            attributes,
            children,
            ..
        } = node
        {
            if range.start == offset {
                match to {
                    Some(value) => {
                        attributes.insert(key.to_string(), value.clone());
                    }
                    None => {
                        attributes.remove(key);
                    }
                }
                return;
            }
            if range.start < offset && offset < range.end {
                update_tree_attribute(children, offset, key, to);
                return;
            }
        }
    }
}
