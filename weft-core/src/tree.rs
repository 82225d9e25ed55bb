//! Tree projection of the linear model.
//!
//! The item array is the source of truth; the tree is a derived view whose
//! node offsets must stay consistent with array positions at every committed
//! state. Content-only splices are re-synchronized incrementally; anything
//! touching structural markers falls back to a full rebuild.

use std::collections::BTreeMap;
use std::ops::Range;

use serde_json::Value;

use crate::error::CoreError;
use crate::item::DataItem;

/// A node in the tree projection.
///
/// Element ranges cover the opening marker through the closing marker
/// (`range.start` is the open marker's offset, `range.end - 1` the close
/// marker's). Text ranges cover a maximal run of scalar items.
#[derive(Debug, Clone, PartialEq)]
pub enum DocumentNode {
    Element {
        kind: String,
        attributes: BTreeMap<String, Value>,
        range: Range<usize>,
        children: Vec<DocumentNode>,
    },
    Text {
        range: Range<usize>,
    },
}

impl DocumentNode {
    pub fn range(&self) -> &Range<usize> {
        match self {
            DocumentNode::Element { range, .. } | DocumentNode::Text { range } => range,
        }
    }

    fn range_mut(&mut self) -> &mut Range<usize> {
        match self {
            DocumentNode::Element { range, .. } | DocumentNode::Text { range } => range,
        }
    }
}

/// A linear splice, described for tree re-synchronization.
///
/// Offsets are in apply-time coordinates: splices are handed over in the
/// order they were applied, each offset valid at its own application point.
#[derive(Debug, Clone, Copy)]
pub struct ResyncSplice {
    pub offset: usize,
    pub removed_len: usize,
    pub inserted_len: usize,
    /// True when any removed or inserted item was a structural marker.
    pub structural: bool,
}

/// The derived tree view of a linear document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TreeProjection {
    pub roots: Vec<DocumentNode>,
    pub length: usize,
}

impl TreeProjection {
    /// Build a tree from scratch. Fails on any stray or mismatched closing
    /// marker, or on an opening marker left unclosed at the end.
    pub fn build(items: &[DataItem]) -> Result<Self, CoreError> {
        struct Open {
            kind: String,
            attributes: BTreeMap<String, Value>,
            start: usize,
            children: Vec<DocumentNode>,
        }

        let mut stack: Vec<Open> = Vec::new();
        let mut roots: Vec<DocumentNode> = Vec::new();
        let mut text_start: Option<usize> = None;

        let mut flush_text = |stack: &mut Vec<Open>,
                              roots: &mut Vec<DocumentNode>,
                              text_start: &mut Option<usize>,
                              end: usize| {
            if let Some(start) = text_start.take() {
                let node = DocumentNode::Text { range: start..end };
                match stack.last_mut() {
                    Some(open) => open.children.push(node),
                    None => roots.push(node),
                }
            }
        };

        for (offset, item) in items.iter().enumerate() {
            match item {
                DataItem::Marker(marker) if !marker.kind.starts_with('/') => {
                    flush_text(&mut stack, &mut roots, &mut text_start, offset);
                    stack.push(Open {
                        kind: marker.kind.clone(),
                        attributes: marker.attributes.clone(),
                        start: offset,
                        children: Vec::new(),
                    });
                }
                DataItem::Marker(marker) => {
                    flush_text(&mut stack, &mut roots, &mut text_start, offset);
                    let open = stack
                        .pop()
                        .ok_or(CoreError::UnbalancedDocument { offset })?;
                    if open.kind != marker.kind[1..] {
                        return Err(CoreError::UnbalancedDocument { offset });
                    }
                    let node = DocumentNode::Element {
                        kind: open.kind,
                        attributes: open.attributes,
                        range: open.start..offset + 1,
                        children: open.children,
                    };
                    match stack.last_mut() {
                        Some(parent) => parent.children.push(node),
                        None => roots.push(node),
                    }
                }
                DataItem::Scalar(_) | DataItem::Annotated(_, _) => {
                    if text_start.is_none() {
                        text_start = Some(offset);
                    }
                }
            }
        }

        flush_text(&mut stack, &mut roots, &mut text_start, items.len());
        if let Some(open) = stack.last() {
            return Err(CoreError::UnbalancedDocument { offset: open.start });
        }

        Ok(Self {
            roots,
            length: items.len(),
        })
    }

    /// Incrementally re-synchronize after a batch of splices.
    ///
    /// Returns `false` when the splices cannot be absorbed incrementally
    /// (structural changes, or content landing outside any text run); the
    /// caller must then rebuild from the array.
    pub fn resync(&mut self, splices: &[ResyncSplice]) -> bool {
        for splice in splices {
            if splice.structural {
                return false;
            }
            let delta = splice.inserted_len as isize - splice.removed_len as isize;
            if !absorb_content_splice(&mut self.roots, splice, delta) {
                return false;
            }
            self.length = (self.length as isize + delta) as usize;
        }
        true
    }

    /// Walk the tree checking that node offsets tile the array consistently.
    /// Used by the processor after resync and by tests.
    pub fn offsets_consistent_with(&self, items: &[DataItem]) -> bool {
        if self.length != items.len() {
            return false;
        }
        fn check(nodes: &[DocumentNode], items: &[DataItem]) -> bool {
            for node in nodes {
                let range = node.range();
                if range.end > items.len() || range.start > range.end {
                    return false;
                }
                match node {
                    DocumentNode::Element { kind, children, .. } => {
                        let open_ok = items[range.start].marker_kind() == Some(kind.as_str())
                            && items[range.start].is_open();
                        let close_ok = items[range.end - 1].marker_kind() == Some(kind.as_str())
                            && items[range.end - 1].is_close();
                        if !open_ok || !close_ok || !check(children, items) {
                            return false;
                        }
                    }
                    DocumentNode::Text { range } => {
                        if items[range.clone()].iter().any(DataItem::is_marker) {
                            return false;
                        }
                    }
                }
            }
            true
        }
        check(&self.roots, items)
    }

    /// Offset of the innermost element containing `offset`, if any.
    pub fn enclosing_element_start(&self, offset: usize) -> Option<usize> {
        fn descend(nodes: &[DocumentNode], offset: usize, best: Option<usize>) -> Option<usize> {
            for node in nodes {
                if let DocumentNode::Element {
                    range, children, ..
                } = node
                {
                    if range.start <= offset && offset < range.end {
                        return descend(children, offset, Some(range.start));
                    }
                }
            }
            best
        }
        descend(&self.roots, offset, None)
    }
}

/// Absorb one content-only splice. Succeeds only when the splice lands
/// entirely within a single text run.
fn absorb_content_splice(nodes: &mut [DocumentNode], splice: &ResyncSplice, delta: isize) -> bool {
    let end = splice.offset + splice.removed_len;
    let mut handled = false;

    for node in nodes.iter_mut() {
        if handled {
            // Everything after the absorbing node shifts wholesale.
            shift_subtree(node, delta);
            continue;
        }
        match node {
            DocumentNode::Text { range } if range.start <= splice.offset && end <= range.end => {
                range.end = (range.end as isize + delta) as usize;
                handled = true;
            }
            DocumentNode::Element {
                range, children, ..
            } if range.start < splice.offset && end < range.end => {
                if !absorb_content_splice(children, splice, delta) {
                    return false;
                }
                range.end = (range.end as isize + delta) as usize;
                handled = true;
            }
            _ => {}
        }
    }

    handled
}

fn shift_subtree(node: &mut DocumentNode, delta: isize) {
    let range = node.range_mut();
    range.start = (range.start as isize + delta) as usize;
    range.end = (range.end as isize + delta) as usize;
    if let DocumentNode::Element { children, .. } = node {
        for child in children {
            shift_subtree(child, delta);
        }
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
    fn test_build_simple() {
        let items = paragraph("ab");
        let tree = TreeProjection::build(&items).unwrap();
        assert_eq!(tree.roots.len(), 1);
        assert!(tree.offsets_consistent_with(&items));

        match &tree.roots[0] {
            DocumentNode::Element {
                kind,
                range,
                children,
                ..
            } => {
                assert_eq!(kind, "paragraph");
                assert_eq!(*range, 0..4);
                assert_eq!(children.len(), 1);
                assert_eq!(*children[0].range(), 1..3);
            }
            other => panic!("expected element, got {other:?}"),
        }
    }

    #[test]
    fn test_build_nested() {
        let mut items = vec![DataItem::open("list"), DataItem::open("item")];
        items.push(DataItem::scalar('x'));
        items.push(DataItem::close("item"));
        items.push(DataItem::close("list"));
        let tree = TreeProjection::build(&items).unwrap();
        assert!(tree.offsets_consistent_with(&items));
    }

    #[test]
    fn test_build_rejects_stray_close() {
        let items = vec![DataItem::close("paragraph"), DataItem::open("paragraph")];
        assert_eq!(
            TreeProjection::build(&items),
            Err(CoreError::UnbalancedDocument { offset: 0 })
        );
    }

    #[test]
    fn test_build_rejects_mismatched_close() {
        let items = vec![DataItem::open("list"), DataItem::close("paragraph")];
        assert!(TreeProjection::build(&items).is_err());
    }

    #[test]
    fn test_build_rejects_unclosed() {
        let items = vec![DataItem::open("paragraph"), DataItem::scalar('a')];
        assert_eq!(
            TreeProjection::build(&items),
            Err(CoreError::UnbalancedDocument { offset: 0 })
        );
    }

    #[test]
    fn test_resync_content_insert() {
        let mut items = paragraph("ab");
        let mut tree = TreeProjection::build(&items).unwrap();

        // Insert 'X' between 'a' and 'b'
        items.insert(2, DataItem::scalar('X'));
        let ok = tree.resync(&[ResyncSplice {
            offset: 2,
            removed_len: 0,
            inserted_len: 1,
            structural: false,
        }]);
        assert!(ok);
        assert!(tree.offsets_consistent_with(&items));
    }

    #[test]
    fn test_resync_content_remove() {
        let mut items = paragraph("abc");
        let mut tree = TreeProjection::build(&items).unwrap();

        items.remove(2);
        let ok = tree.resync(&[ResyncSplice {
            offset: 2,
            removed_len: 1,
            inserted_len: 0,
            structural: false,
        }]);
        assert!(ok);
        assert!(tree.offsets_consistent_with(&items));
    }

    #[test]
    fn test_resync_structural_requests_rebuild() {
        let items = paragraph("ab");
        let mut tree = TreeProjection::build(&items).unwrap();
        let ok = tree.resync(&[ResyncSplice {
            offset: 4,
            removed_len: 0,
            inserted_len: 4,
            structural: true,
        }]);
        assert!(!ok);
    }

    #[test]
    fn test_resync_shifts_following_siblings() {
        let mut items = paragraph("a");
        items.extend(paragraph("b"));
        let mut tree = TreeProjection::build(&items).unwrap();

        items.insert(1, DataItem::scalar('X'));
        let ok = tree.resync(&[ResyncSplice {
            offset: 1,
            removed_len: 0,
            inserted_len: 1,
            structural: false,
        }]);
        assert!(ok);
        assert!(tree.offsets_consistent_with(&items));
        assert_eq!(tree.roots[1].range().start, 4);
    }

    #[test]
    fn test_enclosing_element_start() {
        let mut items = vec![DataItem::open("list"), DataItem::open("item")];
        items.push(DataItem::scalar('x'));
        items.push(DataItem::close("item"));
        items.push(DataItem::close("list"));
        let tree = TreeProjection::build(&items).unwrap();
        assert_eq!(tree.enclosing_element_start(2), Some(1));
        assert_eq!(tree.enclosing_element_start(0), Some(0));
    }
}
