//! Path trie for prefix-inherited rule matching.
//!
//! Rule patterns are split on `/` into segments, with empty segments ignored,
//! so `/a/b/` and `/a/b` name the same node. A `*` segment matches any single
//! segment.
//!
//! Lookup walks as deep as the request path allows and returns the deepest
//! configured limit on the way. A path with no rule of its own inherits the
//! rule of its closest configured ancestor. At each level an exact segment
//! match is preferred; the wildcard branch is only tried when the exact
//! branch yields nothing.

use std::collections::HashMap;
use std::sync::Arc;

use super::resource::{ResourceLimit, ANY_MARKER};

/// A node of the path trie.
#[derive(Debug, Clone, Default)]
pub struct PathNode {
    children: HashMap<String, PathNode>,
    wildcard: Option<Box<PathNode>>,
    limit: Option<Arc<ResourceLimit>>,
}

fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|segment| !segment.is_empty())
}

impl PathNode {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach `limit` to the node for `path`, creating intermediate nodes.
    ///
    /// Returns the limit previously attached there, if any.
    pub fn insert(&mut self, path: &str, limit: Arc<ResourceLimit>) -> Option<Arc<ResourceLimit>> {
        let mut node = self;
        for segment in segments(path) {
            node = if segment == ANY_MARKER {
                node.wildcard.get_or_insert_with(Default::default).as_mut()
            } else {
                node.children.entry(segment.to_string()).or_default()
            };
        }
        node.limit.replace(limit)
    }

    /// Find the effective limit for `path`.
    pub fn lookup(&self, path: &str) -> Option<&Arc<ResourceLimit>> {
        let segments: Vec<&str> = segments(path).collect();
        self.find(&segments)
    }

    fn find(&self, segments: &[&str]) -> Option<&Arc<ResourceLimit>> {
        if let Some((first, rest)) = segments.split_first() {
            let exact = self.children.get(*first).and_then(|child| child.find(rest));
            if exact.is_some() {
                return exact;
            }
            let wild = self.wildcard.as_ref().and_then(|child| child.find(rest));
            if wild.is_some() {
                return wild;
            }
        }
        self.limit.as_ref()
    }

    /// Number of limits attached anywhere in this subtree.
    pub fn len(&self) -> usize {
        self.limit.is_some() as usize
            + self.children.values().map(PathNode::len).sum::<usize>()
            + self.wildcard.as_ref().map_or(0, |w| w.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
