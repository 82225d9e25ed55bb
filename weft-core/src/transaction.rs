//! Transactions: atomic, invertible edit descriptions over the linear model.
//!
//! A transaction is an ordered list of operations whose cursor advances
//! monotonically across the whole document length. Wire shape is a bare
//! operation array:
//!
//! ```json
//! [
//!   {"type": "retain", "length": 1},
//!   {"type": "replace", "remove": [], "insert": ["a", "b"]},
//!   {"type": "retain", "length": 1}
//! ]
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CoreError;
use crate::item::{net_nesting, DataItem};

/// One operation of a transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Operation {
    /// Advance the cursor without changing content.
    Retain { length: usize },
    /// Remove the next `remove.len()` items and insert `insert` in their
    /// place. Both lists must have zero net nesting.
    Replace {
        remove: Vec<DataItem>,
        insert: Vec<DataItem>,
    },
    /// Mutate an attribute of the structural marker at the cursor.
    #[serde(rename = "attribute")]
    SetAttribute {
        key: String,
        #[serde(default)]
        from: Option<Value>,
        #[serde(default)]
        to: Option<Value>,
    },
}

/// A `Replace` pinned to an absolute offset in the transaction's base
/// document. The positioned view is what squash and transform work on.
#[derive(Debug, Clone, PartialEq)]
pub struct Splice {
    pub offset: usize,
    pub remove: Vec<DataItem>,
    pub insert: Vec<DataItem>,
}

impl Splice {
    pub fn removed_len(&self) -> usize {
        self.remove.len()
    }

    pub fn inserted_len(&self) -> usize {
        self.insert.len()
    }

    pub fn net_delta(&self) -> isize {
        self.insert.len() as isize - self.remove.len() as isize
    }
}

/// A `SetAttribute` pinned to an absolute offset in the base document.
#[derive(Debug, Clone, PartialEq)]
pub struct PositionedAttr {
    pub offset: usize,
    pub key: String,
    pub from: Option<Value>,
    pub to: Option<Value>,
}

/// An ordered, immutable operation list plus a mutable applied flag.
///
/// The flag guards against double-commit and double-rollback; it is not
/// part of the wire shape and always deserializes as unapplied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "Vec<Operation>", into = "Vec<Operation>")]
pub struct Transaction {
    ops: Vec<Operation>,
    applied: bool,
}

impl From<Vec<Operation>> for Transaction {
    fn from(ops: Vec<Operation>) -> Self {
        Self {
            ops,
            applied: false,
        }
    }
}

impl From<Transaction> for Vec<Operation> {
    fn from(txn: Transaction) -> Self {
        txn.ops
    }
}

impl Transaction {
    /// Construct a transaction, validating the balance invariant of every
    /// `Replace` operation up front.
    pub fn new(ops: Vec<Operation>) -> Result<Self, CoreError> {
        validate_ops(&ops)?;
        Ok(Self {
            ops,
            applied: false,
        })
    }

    pub fn ops(&self) -> &[Operation] {
        &self.ops
    }

    pub fn is_applied(&self) -> bool {
        self.applied
    }

    pub(crate) fn set_applied(&mut self, applied: bool) {
        self.applied = applied;
    }

    /// Document length this transaction expects to run against.
    pub fn base_length(&self) -> usize {
        self.ops
            .iter()
            .map(|op| match op {
                Operation::Retain { length } => *length,
                Operation::Replace { remove, .. } => remove.len(),
                Operation::SetAttribute { .. } => 0,
            })
            .sum()
    }

    /// Net change to the document length.
    pub fn net_delta(&self) -> isize {
        self.ops
            .iter()
            .map(|op| match op {
                Operation::Replace { remove, insert } => {
                    insert.len() as isize - remove.len() as isize
                }
                _ => 0,
            })
            .sum()
    }

    pub fn is_noop(&self) -> bool {
        self.ops.iter().all(|op| match op {
            Operation::Retain { .. } => true,
            Operation::Replace { remove, insert } => remove.is_empty() && insert.is_empty(),
            Operation::SetAttribute { .. } => false,
        })
    }

    /// The mechanical inverse: swaps every removal with its insertion and
    /// every attribute's old value with its new one.
    pub fn invert(&self) -> Transaction {
        let ops = self
            .ops
            .iter()
            .map(|op| match op {
                Operation::Retain { length } => Operation::Retain { length: *length },
                Operation::Replace { remove, insert } => Operation::Replace {
                    remove: insert.clone(),
                    insert: remove.clone(),
                },
                Operation::SetAttribute { key, from, to } => Operation::SetAttribute {
                    key: key.clone(),
                    from: to.clone(),
                    to: from.clone(),
                },
            })
            .collect();
        Transaction {
            ops,
            applied: false,
        }
    }

    /// Positioned view: replaces and attribute sets at absolute base-document
    /// offsets, in ascending order.
    pub fn to_positioned(&self) -> (Vec<Splice>, Vec<PositionedAttr>) {
        let mut splices = Vec::new();
        let mut attrs = Vec::new();
        let mut cursor = 0usize;
        for op in &self.ops {
            match op {
                Operation::Retain { length } => cursor += length,
                Operation::Replace { remove, insert } => {
                    if !remove.is_empty() || !insert.is_empty() {
                        splices.push(Splice {
                            offset: cursor,
                            remove: remove.clone(),
                            insert: insert.clone(),
                        });
                    }
                    cursor += remove.len();
                }
                Operation::SetAttribute { key, from, to } => {
                    attrs.push(PositionedAttr {
                        offset: cursor,
                        key: key.clone(),
                        from: from.clone(),
                        to: to.clone(),
                    });
                }
            }
        }
        (splices, attrs)
    }

    /// Rebuild a transaction from a positioned view.
    ///
    /// `splices` must be sorted by offset with non-overlapping removal
    /// ranges; `attrs` must be sorted by offset and target offsets outside
    /// every removal range. At equal offsets attributes are emitted first.
    pub fn from_positioned(
        base_length: usize,
        splices: &[Splice],
        attrs: &[PositionedAttr],
    ) -> Result<Transaction, CoreError> {
        let mut ops = Vec::new();
        let mut cursor = 0usize;
        let mut attr_iter = attrs.iter().peekable();

        let mut emit_attrs_until =
            |ops: &mut Vec<Operation>, cursor: &mut usize, limit: usize| {
                while let Some(attr) = attr_iter.next_if(|attr| attr.offset <= limit) {
                    if attr.offset > *cursor {
                        ops.push(Operation::Retain {
                            length: attr.offset - *cursor,
                        });
                        *cursor = attr.offset;
                    }
                    ops.push(Operation::SetAttribute {
                        key: attr.key.clone(),
                        from: attr.from.clone(),
                        to: attr.to.clone(),
                    });
                }
            };

        for splice in splices {
            if splice.offset < cursor {
                return Err(CoreError::InvalidOperation(format!(
                    "splice at {} overlaps previous operation ending at {cursor}",
                    splice.offset
                )));
            }
            emit_attrs_until(&mut ops, &mut cursor, splice.offset);
            if splice.offset > cursor {
                ops.push(Operation::Retain {
                    length: splice.offset - cursor,
                });
                cursor = splice.offset;
            }
            ops.push(Operation::Replace {
                remove: splice.remove.clone(),
                insert: splice.insert.clone(),
            });
            cursor += splice.remove.len();
        }

        emit_attrs_until(&mut ops, &mut cursor, base_length);
        if cursor > base_length {
            return Err(CoreError::InvalidOperation(format!(
                "operations overrun base length {base_length}"
            )));
        }
        if cursor < base_length {
            ops.push(Operation::Retain {
                length: base_length - cursor,
            });
        }
        Transaction::new(ops)
    }

    /// Insert `items` at `offset` in a document of length `doc_length`.
    pub fn insert_at(
        doc_length: usize,
        offset: usize,
        items: Vec<DataItem>,
    ) -> Result<Transaction, CoreError> {
        Self::from_positioned(
            doc_length,
            &[Splice {
                offset,
                remove: Vec::new(),
                insert: items,
            }],
            &[],
        )
    }

    /// Remove `range` from a document whose items are `snapshot`.
    pub fn remove_range(
        snapshot: &[DataItem],
        range: std::ops::Range<usize>,
    ) -> Result<Transaction, CoreError> {
        Self::replace_range(snapshot, range, Vec::new())
    }

    /// Replace `range` of `snapshot` with `insert`.
    pub fn replace_range(
        snapshot: &[DataItem],
        range: std::ops::Range<usize>,
        insert: Vec<DataItem>,
    ) -> Result<Transaction, CoreError> {
        if range.end > snapshot.len() || range.start > range.end {
            return Err(CoreError::InvalidOperation(format!(
                "range {range:?} out of bounds for document of length {}",
                snapshot.len()
            )));
        }
        Self::from_positioned(
            snapshot.len(),
            &[Splice {
                offset: range.start,
                remove: snapshot[range].to_vec(),
                insert,
            }],
            &[],
        )
    }

    /// Set attribute `key` on the marker at `offset`.
    pub fn set_attribute_at(
        doc_length: usize,
        offset: usize,
        key: impl Into<String>,
        from: Option<Value>,
        to: Option<Value>,
    ) -> Result<Transaction, CoreError> {
        Self::from_positioned(
            doc_length,
            &[],
            &[PositionedAttr {
                offset,
                key: key.into(),
                from,
                to,
            }],
        )
    }
}

fn validate_ops(ops: &[Operation]) -> Result<(), CoreError> {
    for op in ops {
        if let Operation::Replace { remove, insert } = op {
            let removed = net_nesting(remove);
            if removed != 0 {
                return Err(CoreError::UnbalancedTransaction { nesting: removed });
            }
            let inserted = net_nesting(insert);
            if inserted != 0 {
                return Err(CoreError::UnbalancedTransaction { nesting: inserted });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn paragraph(text: &str) -> Vec<DataItem> {
        let mut items = vec![DataItem::open("paragraph")];
        items.extend(text.chars().map(DataItem::scalar));
        items.push(DataItem::close("paragraph"));
        items
    }

    #[test]
    fn test_new_rejects_unbalanced_remove() {
        let result = Transaction::new(vec![Operation::Replace {
            remove: vec![DataItem::open("paragraph")],
            insert: vec![],
        }]);
        assert_eq!(
            result,
            Err(CoreError::UnbalancedTransaction { nesting: 1 })
        );
    }

    #[test]
    fn test_new_rejects_unbalanced_insert() {
        let result = Transaction::new(vec![Operation::Replace {
            remove: vec![],
            insert: vec![DataItem::close("paragraph")],
        }]);
        assert_eq!(
            result,
            Err(CoreError::UnbalancedTransaction { nesting: -1 })
        );
    }

    #[test]
    fn test_insert_at_builder() {
        let txn = Transaction::insert_at(4, 1, vec![DataItem::scalar('x')]).unwrap();
        assert_eq!(txn.base_length(), 4);
        assert_eq!(txn.net_delta(), 1);
        assert_eq!(
            txn.ops(),
            &[
                Operation::Retain { length: 1 },
                Operation::Replace {
                    remove: vec![],
                    insert: vec![DataItem::scalar('x')],
                },
                Operation::Retain { length: 3 },
            ]
        );
    }

    #[test]
    fn test_remove_range_captures_content() {
        let snapshot = paragraph("abc");
        let txn = Transaction::remove_range(&snapshot, 2..4).unwrap();
        match &txn.ops()[1] {
            Operation::Replace { remove, .. } => {
                assert_eq!(remove, &[DataItem::scalar('b'), DataItem::scalar('c')]);
            }
            other => panic!("expected replace, got {other:?}"),
        }
    }

    #[test]
    fn test_invert_roundtrip_shape() {
        let snapshot = paragraph("abc");
        let txn = Transaction::replace_range(&snapshot, 1..3, vec![DataItem::scalar('z')]).unwrap();
        let inverse = txn.invert();
        assert_eq!(inverse.base_length() as isize, 5 + txn.net_delta());
        assert_eq!(inverse.net_delta(), -txn.net_delta());
        assert_eq!(inverse.invert().ops(), txn.ops());
    }

    #[test]
    fn test_positioned_roundtrip() {
        let snapshot = paragraph("abcd");
        let txn = Transaction::replace_range(&snapshot, 2..4, vec![DataItem::scalar('z')]).unwrap();
        let (splices, attrs) = txn.to_positioned();
        assert_eq!(splices.len(), 1);
        assert_eq!(splices[0].offset, 2);
        let rebuilt = Transaction::from_positioned(txn.base_length(), &splices, &attrs).unwrap();
        assert_eq!(rebuilt.ops(), txn.ops());
    }

    #[test]
    fn test_from_positioned_rejects_overlap() {
        let splices = vec![
            Splice {
                offset: 1,
                remove: vec![DataItem::scalar('a'), DataItem::scalar('b')],
                insert: vec![],
            },
            Splice {
                offset: 2,
                remove: vec![DataItem::scalar('b')],
                insert: vec![],
            },
        ];
        assert!(Transaction::from_positioned(6, &splices, &[]).is_err());
    }

    #[test]
    fn test_wire_shape() {
        let txn = Transaction::insert_at(2, 1, vec![DataItem::scalar('a')]).unwrap();
        let json = serde_json::to_value(&txn).unwrap();
        assert_eq!(
            json,
            json!([
                {"type": "retain", "length": 1},
                {"type": "replace", "remove": [], "insert": ["a"]},
                {"type": "retain", "length": 1},
            ])
        );

        let back: Transaction = serde_json::from_value(json).unwrap();
        assert_eq!(back.ops(), txn.ops());
        assert!(!back.is_applied());
    }

    #[test]
    fn test_set_attribute_wire_shape() {
        let txn =
            Transaction::set_attribute_at(2, 0, "level", None, Some(json!(2))).unwrap();
        let json = serde_json::to_value(&txn).unwrap();
        assert_eq!(json[0]["type"], json!("attribute"));
        assert_eq!(json[0]["key"], json!("level"));
        assert_eq!(json[0]["to"], json!(2));
    }
}
