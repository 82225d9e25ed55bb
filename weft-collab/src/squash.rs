//! Transaction composition.
//!
//! `compose` folds two sequential transactions into one that maps the first
//! transaction's base document straight to the second's result. The merge
//! walks both operation streams in lockstep: the first transaction's
//! removals pass straight through to the output, its insertions are matched
//! against the second transaction's operations (a later removal of freshly
//! inserted content cancels out entirely), and attribute sets chain through
//! their old/new value pairs.
//!
//! Composition is associative, which is what lets a client squash its whole
//! unconfirmed queue into a single transaction before submission without
//! changing the outcome.

use std::collections::VecDeque;

use serde_json::Value;
use weft_core::{DataItem, Operation, Transaction};

use crate::error::CollabError;

/// Compose `first` then `second` into a single transaction over `first`'s
/// base document.
pub fn compose(first: &Transaction, second: &Transaction) -> Result<Transaction, CollabError> {
    let mid_length = (first.base_length() as isize + first.net_delta()) as usize;
    if second.base_length() != mid_length {
        return Err(CollabError::BadChange(format!(
            "cannot compose: second transaction expects base length {}, first produces {}",
            second.base_length(),
            mid_length
        )));
    }

    let mut a_ops = first.ops().iter();
    let mut b_ops = second.ops().iter();
    // Remaining width of the current first-stream op, as seen by `second`.
    let mut a_cur: Option<ACur> = None;
    let mut b_cur: Option<BCur> = None;
    // Attribute sets from `first` whose target item has not been reached yet.
    let mut pending_attrs: Vec<(String, Option<Value>, Option<Value>)> = Vec::new();
    let mut out = OutBuilder::default();

    loop {
        while a_cur.is_none() {
            match a_ops.next() {
                Some(Operation::Retain { length }) => {
                    if *length > 0 {
                        a_cur = Some(ACur::Retain(*length));
                    }
                }
                Some(Operation::Replace { remove, insert }) => {
                    // Base content removed by `first` is invisible to
                    // `second`; it goes straight to the output. An attribute
                    // set on an item the same transaction then removes has no
                    // surviving effect.
                    if !remove.is_empty() {
                        pending_attrs.clear();
                        out.remove(remove.clone());
                    }
                    if !insert.is_empty() {
                        a_cur = Some(ACur::Insert(insert.iter().cloned().collect()));
                    }
                }
                Some(Operation::SetAttribute { key, from, to }) => {
                    pending_attrs.push((key.clone(), from.clone(), to.clone()));
                }
                None => break,
            }
        }

        while b_cur.is_none() {
            match b_ops.next() {
                Some(Operation::Retain { length }) => {
                    if *length > 0 {
                        b_cur = Some(BCur::Retain(*length));
                    }
                }
                Some(Operation::Replace { remove, insert }) => {
                    // The insertion lands at the current position, ahead of
                    // whatever the removal consumes.
                    out.insert(insert.clone());
                    if !remove.is_empty() {
                        b_cur = Some(BCur::Remove(remove.iter().cloned().collect()));
                    }
                }
                Some(Operation::SetAttribute { key, from, to }) => {
                    match &mut a_cur {
                        // Attribute set on content `first` inserted: fold it
                        // into the inserted item itself.
                        Some(ACur::Insert(queue)) => {
                            let front = queue.front_mut().ok_or_else(|| {
                                CollabError::BadChange("attribute set past end of insertion".into())
                            })?;
                            set_marker_attribute(front, key, to)?;
                        }
                        _ => {
                            out.flush_attrs(&mut pending_attrs);
                            out.attr(key.clone(), from.clone(), to.clone());
                        }
                    }
                }
                None => break,
            }
        }

        match (a_cur.take(), b_cur.take()) {
            (None, None) => break,
            (Some(ACur::Retain(a)), Some(BCur::Retain(b))) => {
                out.flush_attrs(&mut pending_attrs);
                let n = a.min(b);
                out.retain(n);
                a_cur = remaining_retain(a - n).map(ACur::Retain);
                b_cur = remaining_retain(b - n).map(BCur::Retain);
            }
            (Some(ACur::Retain(a)), Some(BCur::Remove(mut content))) => {
                // `second` removes base content: its removal list carries the
                // items as they stood after `first`, so any pending attribute
                // set must be peeled off the first removed item to recover
                // the base version.
                let n = a.min(content.len());
                let mut chunk: Vec<DataItem> = content.drain(..n).collect();
                if let Some(item) = chunk.first_mut() {
                    for (key, from, _) in pending_attrs.drain(..) {
                        set_marker_attribute(item, &key, &from)?;
                    }
                }
                out.remove(chunk);
                a_cur = remaining_retain(a - n).map(ACur::Retain);
                if !content.is_empty() {
                    b_cur = Some(BCur::Remove(content));
                }
            }
            (Some(ACur::Insert(mut queue)), Some(BCur::Retain(b))) => {
                let n = queue.len().min(b);
                out.insert(queue.drain(..n).collect());
                if !queue.is_empty() {
                    a_cur = Some(ACur::Insert(queue));
                }
                b_cur = remaining_retain(b - n).map(BCur::Retain);
            }
            (Some(ACur::Insert(mut queue)), Some(BCur::Remove(mut content))) => {
                // `second` removes content `first` inserted: both vanish.
                let n = queue.len().min(content.len());
                let cancelled: Vec<DataItem> = queue.drain(..n).collect();
                let removed: Vec<DataItem> = content.drain(..n).collect();
                debug_assert_eq!(cancelled, removed);
                if !queue.is_empty() {
                    a_cur = Some(ACur::Insert(queue));
                }
                if !content.is_empty() {
                    b_cur = Some(BCur::Remove(content));
                }
            }
            (a, b) => {
                debug_assert!(a.is_none() || b.is_none());
                return Err(CollabError::BadChange(
                    "transaction streams fell out of alignment".into(),
                ));
            }
        }
    }

    out.flush_attrs(&mut pending_attrs);
    Transaction::new(out.ops).map_err(CollabError::Core)
}

/// Fold a run of sequential transactions into one, or `None` for an empty
/// run.
pub fn compose_all<'a>(
    transactions: impl IntoIterator<Item = &'a Transaction>,
) -> Result<Option<Transaction>, CollabError> {
    let mut iter = transactions.into_iter();
    let Some(first) = iter.next() else {
        return Ok(None);
    };
    let mut acc = first.clone();
    for txn in iter {
        acc = compose(&acc, txn)?;
    }
    Ok(Some(acc))
}

enum ACur {
    Retain(usize),
    Insert(VecDeque<DataItem>),
}

enum BCur {
    Retain(usize),
    Remove(VecDeque<DataItem>),
}

fn remaining_retain(n: usize) -> Option<usize> {
    if n > 0 {
        Some(n)
    } else {
        None
    }
}

fn set_marker_attribute(
    item: &mut DataItem,
    key: &str,
    value: &Option<Value>,
) -> Result<(), CollabError> {
    match item {
        DataItem::Marker(marker) => {
            match value {
                Some(v) => {
                    marker.attributes.insert(key.to_string(), v.clone());
                }
                None => {
                    marker.attributes.remove(key);
                }
            }
            Ok(())
        }
        _ => Err(CollabError::BadChange(
            "attribute operation targets a non-marker item".into(),
        )),
    }
}

/// Builds the composed operation list, greedily merging adjacent operations
/// so equivalent compositions come out in the same canonical shape.
#[derive(Default)]
struct OutBuilder {
    ops: Vec<Operation>,
}

impl OutBuilder {
    fn retain(&mut self, n: usize) {
        if n == 0 {
            return;
        }
        if let Some(Operation::Retain { length }) = self.ops.last_mut() {
            *length += n;
            return;
        }
        self.ops.push(Operation::Retain { length: n });
    }

    fn remove(&mut self, items: Vec<DataItem>) {
        if items.is_empty() {
            return;
        }
        if let Some(Operation::Replace { remove, .. }) = self.ops.last_mut() {
            remove.extend(items);
            return;
        }
        self.ops.push(Operation::Replace {
            remove: items,
            insert: Vec::new(),
        });
    }

    fn insert(&mut self, items: Vec<DataItem>) {
        if items.is_empty() {
            return;
        }
        if let Some(Operation::Replace { insert, .. }) = self.ops.last_mut() {
            insert.extend(items);
            return;
        }
        self.ops.push(Operation::Replace {
            remove: Vec::new(),
            insert: items,
        });
    }

    fn attr(&mut self, key: String, from: Option<Value>, to: Option<Value>) {
        // Chain with an attribute set on the same item emitted just before:
        // the composed operation keeps the oldest `from` and newest `to`.
        for op in self.ops.iter_mut().rev() {
            match op {
                Operation::SetAttribute { key: k, to: t, .. } if *k == key => {
                    *t = to;
                    return;
                }
                Operation::SetAttribute { .. } => continue,
                _ => break,
            }
        }
        self.ops.push(Operation::SetAttribute { key, from, to });
    }

    fn flush_attrs(&mut self, pending: &mut Vec<(String, Option<Value>, Option<Value>)>) {
        for (key, from, to) in pending.drain(..) {
            self.attr(key, from, to);
        }
    }
}
