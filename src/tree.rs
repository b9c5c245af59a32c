//! The hierarchical channel namespace.
//!
//! Channel paths are `::`-separated; every path prefix is an interior node
//! and the full path addresses a leaf. Siblings keep insertion order so
//! that two identical runs serialize their channels in the same order.

use std::collections::HashMap;
use std::fmt;

use crate::{TelematError, TelematResult};

/// The path separator between tree levels.
pub const SEPARATOR: &str = "::";

/// A node of the channel tree: named children plus, on leaves, a value.
///
/// Interior nodes are created on demand while adding leaves. Nodes are never
/// removed.
#[derive(Debug, Clone, Default)]
pub struct TreeNode<T> {
    children: HashMap<String, TreeNode<T>>,
    order: Vec<String>,
    value: Option<T>,
}

impl<T> TreeNode<T> {
    pub fn new() -> Self {
        Self {
            children: HashMap::new(),
            order: Vec::new(),
            value: None,
        }
    }

    /// The value stored at this node, present on leaves only.
    pub fn value(&self) -> Option<&T> {
        self.value.as_ref()
    }

    /// True when the node has neither children nor a value.
    pub fn is_empty(&self) -> bool {
        self.children.is_empty() && self.value.is_none()
    }

    /// The direct children, in insertion order.
    pub fn children(&self) -> impl Iterator<Item = (&str, &TreeNode<T>)> {
        self.order
            .iter()
            .filter_map(|name| self.children.get(name).map(|child| (name.as_str(), child)))
    }

    /// Adds a leaf at `path`, creating interior nodes along the way.
    ///
    /// Fails when the path (or one of its segments) is empty, when the path
    /// is already taken by a leaf or an interior node, or when a prefix of
    /// the path is already a leaf.
    pub fn add_leaf(&mut self, path: &str, value: T) -> TelematResult<()> {
        let segments = split_path(path)?;

        let mut node = self;
        for (i, segment) in segments.iter().enumerate() {
            let last = i == segments.len() - 1;
            if last {
                if node.children.contains_key(*segment) {
                    return Err(TelematError::DuplicateChannel(path.to_string()));
                }
                let mut leaf = TreeNode::new();
                leaf.value = Some(value);
                node.order.push(segment.to_string());
                node.children.insert(segment.to_string(), leaf);
                return Ok(());
            }
            if !node.children.contains_key(*segment) {
                node.order.push(segment.to_string());
            }
            let child = node
                .children
                .entry(segment.to_string())
                .or_insert_with(TreeNode::new);
            if child.value.is_some() {
                return Err(TelematError::DuplicateChannel(
                    segments[..=i].join(SEPARATOR),
                ));
            }
            node = child;
        }
        unreachable!("split_path returns at least one segment")
    }

    /// Looks up the leaf value at `path`. Returns `None` for unknown paths
    /// and for paths addressing interior nodes.
    pub fn get_leaf(&self, path: &str) -> Option<&T> {
        let mut node = self;
        for segment in path.split(SEPARATOR) {
            node = node.children.get(segment)?;
        }
        node.value.as_ref()
    }

    /// Calls `f` on every leaf value, in tree order.
    pub fn visit_leaves(&self, f: &mut impl FnMut(&T)) {
        if let Some(value) = &self.value {
            f(value);
        }
        for (_, child) in self.children() {
            child.visit_leaves(f);
        }
    }

    fn render(&self, name: &str, depth: usize, out: &mut fmt::Formatter<'_>) -> fmt::Result {
        for i in 0..depth {
            if i != depth - 1 {
                write!(out, "    ")?;
            } else {
                write!(out, "|-- ")?;
            }
        }
        writeln!(out, "{name}")?;
        for (child_name, child) in self.children() {
            child.render(child_name, depth + 1, out)?;
        }
        Ok(())
    }
}

impl<T> fmt::Display for TreeNode<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.render(".", 0, f)
    }
}

fn split_path(path: &str) -> TelematResult<Vec<&str>> {
    let segments: Vec<&str> = path.split(SEPARATOR).collect();
    if segments.iter().any(|s| s.is_empty()) {
        return Err(TelematError::EmptyChannelPath(path.to_string()));
    }
    Ok(segments)
}
