//! Author cursors expressed as offsets into the linear document.
//!
//! A selection survives concurrent editing by being translated through each
//! transaction as it lands: offsets after a splice shift by the splice's net
//! length change, and offsets inside removed content collapse to the removal
//! site rather than dangling past the end of the document.

use serde::{Deserialize, Serialize};
use uuid::Uuid;
use weft_core::{Splice, Transaction};

pub type AuthorId = Uuid;

/// A directional range: `anchor` is where the selection started, `focus`
/// where it currently ends. A caret has `anchor == focus`.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Selection {
    pub anchor: usize,
    pub focus: usize,
}

impl Selection {
    pub fn collapsed(offset: usize) -> Self {
        Selection { anchor: offset, focus: offset }
    }

    pub fn new(anchor: usize, focus: usize) -> Self {
        Selection { anchor, focus }
    }

    pub fn is_collapsed(&self) -> bool {
        self.anchor == self.focus
    }

    /// The covered range in ascending order, regardless of direction.
    pub fn range(&self) -> (usize, usize) {
        if self.anchor <= self.focus {
            (self.anchor, self.focus)
        } else {
            (self.focus, self.anchor)
        }
    }

    /// Translates this selection through a transaction that has been applied
    /// to the document the selection was expressed against.
    pub fn translate_through(&self, transaction: &Transaction) -> Selection {
        let (splices, _) = transaction.to_positioned();
        Selection {
            anchor: translate_offset(self.anchor, &splices),
            focus: translate_offset(self.focus, &splices),
        }
    }
}

/// Maps an offset through a set of ascending, non-overlapping splices.
///
/// Offsets past a splice shift by its net delta; offsets inside removed
/// content collapse to the removal site. Content inserted exactly at the
/// offset pushes the offset right, so a cursor keeps pointing at the same
/// item when text lands in front of it.
pub fn translate_offset(offset: usize, splices: &[Splice]) -> usize {
    let mut delta: isize = 0;
    for splice in splices {
        let removed = splice.removed_len();
        let end = splice.offset + removed;
        if offset >= end {
            delta += splice.inserted_len() as isize - removed as isize;
        } else if offset >= splice.offset {
            // Inside the removed range: collapse to the splice site.
            return (splice.offset as isize + delta) as usize;
        } else {
            break;
        }
    }
    (offset as isize + delta) as usize
}
