//! Concurrent routing trie.
//!
//! Children are held in a [`DashMap`] and each node's handler slot behind a
//! [`RwLock`], so the trie is read and mutated from many tasks without an
//! outer lock. A child is fully constructed before it is linked into its
//! parent; a concurrent walk sees either the old or the new topology.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;

use crate::error::{Result, RpcError};

/// Split a dot path into its non-empty segments.
///
/// `"a..b."` yields `["a", "b"]`; a blank path yields nothing.
pub fn split_path(path: &str) -> impl Iterator<Item = &str> {
    path.split('.').map(str::trim).filter(|s| !s.is_empty())
}

/// One node of the trie.
pub struct RouteNode<H> {
    name: String,
    children: DashMap<String, Arc<RouteNode<H>>>,
    handler: RwLock<Option<H>>,
}

impl<H: Clone> RouteNode<H> {
    /// Create an unbound node for a path segment.
    pub fn create(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            children: DashMap::new(),
            handler: RwLock::new(None),
        }
    }

    /// Segment name (empty for the root).
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The bound handler, if any.
    pub fn handler(&self) -> Option<H> {
        self.handler.read().clone()
    }

    fn set_handler(&self, handler: H) {
        *self.handler.write() = Some(handler);
    }

    /// Direct child by segment name.
    pub fn child(&self, name: &str) -> Option<Arc<RouteNode<H>>> {
        self.children.get(name).map(|c| Arc::clone(c.value()))
    }

    /// Number of direct children.
    pub fn child_count(&self) -> usize {
        self.children.len()
    }

    /// Drop every child of this node. The node itself stays.
    pub fn clear(&self) {
        self.children.clear();
    }

    fn child_or_create(&self, name: &str) -> Arc<RouteNode<H>> {
        // The entry guard is released before the caller descends.
        let entry = self
            .children
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(RouteNode::create(name)));
        Arc::clone(entry.value())
    }
}

/// Routing trie keyed by dot-separated paths.
///
/// Resolution is exact: every segment must exist and the terminal node must
/// hold a handler. There is no prefix or wildcard fallback.
pub struct RouteTrie<H> {
    root: Arc<RouteNode<H>>,
}

impl<H: Clone> RouteTrie<H> {
    /// Create a trie holding only the root.
    pub fn new() -> Self {
        Self {
            root: Arc::new(RouteNode::create("")),
        }
    }

    /// The root node.
    pub fn root(&self) -> &Arc<RouteNode<H>> {
        &self.root
    }

    /// Bind `handler` at `path`, creating intermediate nodes.
    ///
    /// A blank path would rebind the root and is rejected.
    pub fn register(&self, path: &str, handler: H) -> Result<()> {
        if split_path(path).next().is_none() {
            tracing::error!("It is not allowed to override the root node");
            return Err(RpcError::InvalidRoute(path.to_string()));
        }

        let mut node = Arc::clone(&self.root);
        for segment in split_path(path) {
            node = node.child_or_create(segment);
        }
        node.set_handler(handler);
        Ok(())
    }

    /// Walk to the terminal node of `path`.
    ///
    /// A blank path resolves to the root.
    pub fn resolve_node(&self, path: &str) -> Option<Arc<RouteNode<H>>> {
        let mut node = Arc::clone(&self.root);
        for segment in split_path(path) {
            node = node.child(segment)?;
        }
        Some(node)
    }

    /// Handler bound at exactly `path`.
    pub fn resolve(&self, path: &str) -> Option<H> {
        self.resolve_node(path)?.handler()
    }

    /// Remove the subtree rooted at `path`.
    ///
    /// Returns `false` (a no-op) for the root or a path that was never
    /// registered.
    pub fn unregister(&self, path: &str) -> bool {
        let segments: Vec<&str> = split_path(path).collect();
        let Some((last, parents)) = segments.split_last() else {
            tracing::error!("Cannot remove root");
            return false;
        };

        let mut parent = Arc::clone(&self.root);
        for segment in parents {
            match parent.child(segment) {
                Some(next) => parent = next,
                None => return false,
            }
        }
        parent.children.remove(*last).is_some()
    }

    /// Drop every route. The root stays.
    pub fn clear(&self) {
        self.root.clear();
    }

    /// Full paths of every node that holds a handler, sorted.
    pub fn paths(&self) -> Vec<String> {
        let mut out = Vec::new();
        let mut stack: Vec<(String, Arc<RouteNode<H>>)> = vec![(String::new(), Arc::clone(&self.root))];

        while let Some((prefix, node)) = stack.pop() {
            if !prefix.is_empty() && node.handler.read().is_some() {
                out.push(prefix.clone());
            }
            for child in node.children.iter() {
                let path = if prefix.is_empty() {
                    child.key().clone()
                } else {
                    format!("{}.{}", prefix, child.key())
                };
                stack.push((path, Arc::clone(child.value())));
            }
        }

        out.sort();
        out
    }
}

impl<H: Clone> Default for RouteTrie<H> {
    fn default() -> Self {
        Self::new()
    }
}
