//! Data items: the units of the linear model.
//!
//! A document is a flat array of items: bare scalars, annotated scalars
//! (a scalar plus a set of store references), and open/close structural
//! markers. A closing marker's type is the opening type prefixed with `/`,
//! matching the wire shape:
//!
//! ```json
//! "a"
//! ["a", ["h1a2b3c4d5e6f708"]]
//! {"type": "paragraph"}
//! {"type": "/paragraph"}
//! ```

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::store::AnnotationHash;

/// A structural marker. `kind` starting with `/` closes the matching
/// opening marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Marker {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, Value>,
}

/// One unit of document content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DataItem {
    Scalar(char),
    Annotated(char, BTreeSet<AnnotationHash>),
    Marker(Marker),
}

impl DataItem {
    pub fn scalar(ch: char) -> Self {
        DataItem::Scalar(ch)
    }

    pub fn annotated(ch: char, refs: impl IntoIterator<Item = AnnotationHash>) -> Self {
        DataItem::Annotated(ch, refs.into_iter().collect())
    }

    pub fn open(kind: impl Into<String>) -> Self {
        DataItem::Marker(Marker {
            kind: kind.into(),
            attributes: BTreeMap::new(),
        })
    }

    pub fn open_with_attributes(
        kind: impl Into<String>,
        attributes: BTreeMap<String, Value>,
    ) -> Self {
        DataItem::Marker(Marker {
            kind: kind.into(),
            attributes,
        })
    }

    pub fn close(kind: impl Into<String>) -> Self {
        DataItem::Marker(Marker {
            kind: format!("/{}", kind.into()),
            attributes: BTreeMap::new(),
        })
    }

    pub fn is_marker(&self) -> bool {
        matches!(self, DataItem::Marker(_))
    }

    pub fn is_open(&self) -> bool {
        matches!(self, DataItem::Marker(m) if !m.kind.starts_with('/'))
    }

    pub fn is_close(&self) -> bool {
        matches!(self, DataItem::Marker(m) if m.kind.starts_with('/'))
    }

    /// Element type of a marker, with the closing `/` stripped.
    pub fn marker_kind(&self) -> Option<&str> {
        match self {
            DataItem::Marker(m) => Some(m.kind.trim_start_matches('/')),
            _ => None,
        }
    }

    pub fn scalar_value(&self) -> Option<char> {
        match self {
            DataItem::Scalar(ch) | DataItem::Annotated(ch, _) => Some(*ch),
            DataItem::Marker(_) => None,
        }
    }

    pub fn annotations(&self) -> Option<&BTreeSet<AnnotationHash>> {
        match self {
            DataItem::Annotated(_, refs) => Some(refs),
            _ => None,
        }
    }

    /// +1 for an opening marker, -1 for a closing marker, 0 for content.
    pub fn nesting_delta(&self) -> i64 {
        if self.is_open() {
            1
        } else if self.is_close() {
            -1
        } else {
            0
        }
    }
}

/// Net open/close nesting of an item slice.
pub fn net_nesting(items: &[DataItem]) -> i64 {
    items.iter().map(DataItem::nesting_delta).sum()
}
