//! Rebasing: transforming a change across concurrently committed history.
//!
//! The committed side always wins. An uncommitted change is rewritten op by
//! op against the committed run:
//!
//!   - offsets shift past committed splices, with content inserted at the
//!     same offset landing after the committed insertion;
//!   - the part of a removal that overlaps a committed removal is dropped,
//!     the non-overlapping head and tail survive;
//!   - an insertion or attribute set aimed strictly inside committed-removed
//!     content is dropped.
//!
//! Dropped content dooms what was built on it: any later transaction in the
//! queue that references a rejected range is dropped whole, and its own
//! insertions extend the doomed region, until a transaction with no such
//! dependency is reached.
//!
//! Every rejection is recorded in a [`TransformLog`]; conflicts are an
//! expected outcome of concurrent editing, never an error.
//!
//! Internally the rewrite walks the queue with a running *delta
//! transaction* mapping the client's local document onto the target
//! document. After each queue entry `t` rewritten to `t'`, the delta
//! advances by composition: `invert(t) ∘ delta ∘ t'`. Reusing transaction
//! composition here keeps every coordinate shift exact, including the
//! corrections introduced by rejected content.

use std::collections::BTreeSet;
use std::ops::Range;

use log::debug;
use weft_core::{AnnotationStore, PositionedAttr, Splice, Transaction};

use crate::change::{inserted_annotation_refs, Change};
use crate::error::CollabError;
use crate::selection::translate_offset;
use crate::squash::compose;

/// Record of everything a rebase dropped.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransformLog {
    pub rejections: Vec<Rejection>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Rejection {
    /// Part of a removal overlapped a committed removal.
    Removal {
        transaction: usize,
        offset: usize,
        length: usize,
    },
    /// An insertion aimed strictly inside committed-removed content.
    Insertion {
        transaction: usize,
        offset: usize,
        length: usize,
    },
    /// An attribute set whose target marker was removed.
    Attribute {
        transaction: usize,
        offset: usize,
        key: String,
    },
    /// A whole transaction depending on previously rejected content.
    Doomed { transaction: usize },
}

impl TransformLog {
    pub fn is_clean(&self) -> bool {
        self.rejections.is_empty()
    }

    fn record(&mut self, rejection: Rejection) {
        debug!("rebase rejection: {rejection:?}");
        self.rejections.push(rejection);
    }
}

/// Rewrite `incoming` so it applies after `committed`.
///
/// Both changes must start at the same history index. The result starts at
/// `committed.end()`; its store deltas are rebuilt so each surviving
/// transaction still carries exactly the annotation values it introduces.
pub fn transform_change(
    incoming: &Change,
    committed: &Change,
) -> Result<(Change, TransformLog), CollabError> {
    incoming.validate()?;
    committed.validate()?;
    if incoming.start != committed.start {
        return Err(CollabError::BadChange(format!(
            "cannot rebase change starting at {} across history starting at {}",
            incoming.start, committed.start
        )));
    }

    let mut log = TransformLog::default();
    if committed.is_empty() {
        return Ok((incoming.clone(), log));
    }

    let mut out = Change::empty(committed.end());
    if incoming.is_empty() {
        out.selections = incoming.selections.clone();
        return Ok((out, log));
    }

    let squashed = committed.squashed()?;
    let mut delta = squashed.transactions[0].clone();

    let mut pool = AnnotationStore::new();
    for store in &incoming.stores {
        pool.absorb(store)?;
    }
    let mut shipped: BTreeSet<weft_core::AnnotationHash> = BTreeSet::new();

    // Rejected-content ranges, kept in the coordinates of the transaction
    // about to be processed.
    let mut doom: Vec<Range<usize>> = Vec::new();

    for (index, txn) in incoming.transactions.iter().enumerate() {
        if txn.base_length() != delta.base_length() {
            return Err(CollabError::BadChange(format!(
                "transaction {index} expects base length {}, queue is at {}",
                txn.base_length(),
                delta.base_length()
            )));
        }
        let (splices, attrs) = txn.to_positioned();

        let doomed = touches_doom(&splices, &attrs, &doom);
        let kept = if doomed {
            log.record(Rejection::Doomed { transaction: index });
            None
        } else {
            let (rewritten, rejected_post) = transform_one(index, txn, &delta, &mut log)?;
            doom_advance(&mut doom, &splices);
            doom.extend(rejected_post);
            Some(rewritten)
        };
        if doomed {
            doom_advance(&mut doom, &splices);
            doom.extend(inserted_post_ranges(&splices));
        }

        // delta': invert(t) ∘ delta ∘ t'
        let mut next = compose(&txn.invert(), &delta)?;
        if let Some(rewritten) = kept {
            if !rewritten.is_noop() {
                next = compose(&next, &rewritten)?;
                let refs: Vec<_> = inserted_annotation_refs(&rewritten)
                    .into_iter()
                    .filter(|hash| shipped.insert(hash.clone()))
                    .collect();
                out.push(rewritten, pool.slice(&refs));
            }
        }
        delta = next;
    }

    // The final delta maps the client's post-queue document onto the target
    // document, which is exactly what the bundled selections need.
    let (delta_splices, _) = delta.to_positioned();
    for (author, selection) in &incoming.selections {
        out.selections.insert(
            *author,
            crate::selection::Selection {
                anchor: translate_offset(selection.anchor, &delta_splices),
                focus: translate_offset(selection.focus, &delta_splices),
            },
        );
    }

    Ok((out, log))
}

/// Rewrite a single transaction against the delta's committed splices.
/// Returns the rewritten transaction plus the rejected-content ranges in the
/// original transaction's post-document coordinates.
fn transform_one(
    index: usize,
    txn: &Transaction,
    delta: &Transaction,
    log: &mut TransformLog,
) -> Result<(Transaction, Vec<Range<usize>>), CollabError> {
    let (local, attrs) = txn.to_positioned();
    let (adjusts, _) = delta.to_positioned();
    let target_len = (delta.base_length() as isize + delta.net_delta()) as usize;

    let mut out_splices: Vec<Splice> = Vec::new();
    let mut out_attrs: Vec<PositionedAttr> = Vec::new();
    let mut rejected_post: Vec<Range<usize>> = Vec::new();
    let mut local_delta: isize = 0;

    for sp in &local {
        let p = sp.offset;
        let end = p + sp.remove.len();

        // Carve the removal range: drop overlaps with committed removals,
        // split around committed insertions so they survive in place.
        let mut pieces: Vec<(usize, usize)> = Vec::new();
        let mut cur = p;
        for a in &adjusts {
            let arm = a.remove.len();
            if arm == 0 {
                if cur < a.offset && a.offset < end {
                    pieces.push((cur, a.offset));
                    cur = a.offset;
                }
                continue;
            }
            let a_end = a.offset + arm;
            let ov_start = p.max(a.offset);
            let ov_end = end.min(a_end);
            if ov_start < ov_end {
                if cur < ov_start {
                    pieces.push((cur, ov_start));
                }
                log.record(Rejection::Removal {
                    transaction: index,
                    offset: ov_start,
                    length: ov_end - ov_start,
                });
                cur = cur.max(ov_end);
            }
        }
        if cur < end {
            pieces.push((cur, end));
        }

        let mut insert = sp.insert.clone();
        if !insert.is_empty() {
            let inside_removal = adjusts.iter().any(|a| {
                let arm = a.remove.len();
                arm > 0 && a.offset < p && p < a.offset + arm
            });
            if inside_removal {
                log.record(Rejection::Insertion {
                    transaction: index,
                    offset: p,
                    length: insert.len(),
                });
                let post = (p as isize + local_delta) as usize;
                rejected_post.push(post..post + insert.len());
                insert.clear();
            }
        }

        if !insert.is_empty() && pieces.first().map(|(x, _)| *x) != Some(p) {
            out_splices.push(Splice {
                offset: map_offset(p, &adjusts),
                remove: Vec::new(),
                insert: std::mem::take(&mut insert),
            });
        }
        for (x, y) in &pieces {
            out_splices.push(Splice {
                offset: map_offset(*x, &adjusts),
                remove: sp.remove[*x - p..*y - p].to_vec(),
                insert: if *x == p {
                    std::mem::take(&mut insert)
                } else {
                    Vec::new()
                },
            });
        }

        local_delta += sp.net_delta();
    }

    for attr in &attrs {
        let removed = adjusts.iter().any(|a| {
            let arm = a.remove.len();
            arm > 0 && a.offset <= attr.offset && attr.offset < a.offset + arm
        });
        if removed {
            log.record(Rejection::Attribute {
                transaction: index,
                offset: attr.offset,
                key: attr.key.clone(),
            });
            continue;
        }
        out_attrs.push(PositionedAttr {
            offset: map_offset(attr.offset, &adjusts),
            ..attr.clone()
        });
    }

    let rewritten = Transaction::from_positioned(target_len, &out_splices, &out_attrs)?;
    Ok((rewritten, rejected_post))
}

/// Map an offset past committed splices. Ties go to the committed side: an
/// offset sitting exactly at a committed splice lands after its insertion.
///
/// Callers must have excluded offsets strictly inside committed removals.
fn map_offset(offset: usize, adjusts: &[Splice]) -> usize {
    let mut delta: isize = 0;
    for a in adjusts {
        let removed = a.remove.len();
        let end = a.offset + removed;
        if offset >= end {
            delta += a.insert.len() as isize - removed as isize;
        } else if offset == a.offset {
            delta += a.insert.len() as isize;
        } else {
            debug_assert!(
                offset < a.offset,
                "offset {offset} inside committed removal {}..{end}",
                a.offset
            );
        }
    }
    (offset as isize + delta) as usize
}

/// True when any operation depends on previously rejected content.
fn touches_doom(splices: &[Splice], attrs: &[PositionedAttr], doom: &[Range<usize>]) -> bool {
    for range in doom {
        if range.is_empty() {
            continue;
        }
        for sp in splices {
            let removed = sp.remove.len();
            if removed > 0 && sp.offset < range.end && range.start < sp.offset + removed {
                return true;
            }
            if !sp.insert.is_empty() && range.start < sp.offset && sp.offset < range.end {
                return true;
            }
        }
        for attr in attrs {
            if range.start <= attr.offset && attr.offset < range.end {
                return true;
            }
        }
    }
    false
}

/// Rebase doomed ranges into the coordinates after `splices` applied.
fn doom_advance(doom: &mut Vec<Range<usize>>, splices: &[Splice]) {
    let mut advanced = Vec::with_capacity(doom.len());
    for range in doom.iter() {
        let start = translate_offset(range.start, splices);
        let end = translate_offset(range.end, splices);
        if start < end {
            advanced.push(start..end);
        }
    }
    *doom = advanced;
}

/// Post-document ranges of the content each splice inserts.
fn inserted_post_ranges(splices: &[Splice]) -> Vec<Range<usize>> {
    let mut delta: isize = 0;
    let mut out = Vec::new();
    for sp in splices {
        if !sp.insert.is_empty() {
            let post = (sp.offset as isize + delta) as usize;
            out.push(post..post + sp.insert.len());
        }
        delta += sp.net_delta();
    }
    out
}
