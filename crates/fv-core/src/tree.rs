//! Nested containers of leaves and their structure descriptors.
//!
//! `flatten` linearizes a tree into its leaves (depth-first, dict entries in
//! key order) plus a [`TreeSpec`]; `TreeSpec::unflatten` rebuilds the same
//! nesting from a flat sequence of the matching length.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq)]
pub enum Tree<T> {
    Leaf(T),
    Tuple(Vec<Tree<T>>),
    Dict(BTreeMap<String, Tree<T>>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TreeSpec {
    Leaf,
    Tuple(Vec<TreeSpec>),
    Dict(BTreeMap<String, TreeSpec>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TreeError {
    LeafCountMismatch { expected: usize, actual: usize },
    NotALeaf,
}

impl std::fmt::Display for TreeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LeafCountMismatch { expected, actual } => write!(
                f,
                "tree structure expects {} leaves, got {}",
                expected, actual
            ),
            Self::NotALeaf => write!(f, "expected a single leaf, found a container"),
        }
    }
}

impl std::error::Error for TreeError {}

impl<T> Tree<T> {
    #[must_use]
    pub fn leaf(value: T) -> Self {
        Self::Leaf(value)
    }

    /// Empty container, the tree analogue of "nothing saved".
    #[must_use]
    pub fn unit() -> Self {
        Self::Tuple(Vec::new())
    }

    #[must_use]
    pub fn pair(first: Self, second: Self) -> Self {
        Self::Tuple(vec![first, second])
    }

    #[must_use]
    pub fn as_leaf(&self) -> Option<&T> {
        match self {
            Self::Leaf(value) => Some(value),
            Self::Tuple(_) | Self::Dict(_) => None,
        }
    }

    pub fn into_leaf(self) -> Result<T, TreeError> {
        match self {
            Self::Leaf(value) => Ok(value),
            Self::Tuple(_) | Self::Dict(_) => Err(TreeError::NotALeaf),
        }
    }

    #[must_use]
    pub fn leaf_count(&self) -> usize {
        match self {
            Self::Leaf(_) => 1,
            Self::Tuple(children) => children.iter().map(Self::leaf_count).sum(),
            Self::Dict(entries) => entries.values().map(Self::leaf_count).sum(),
        }
    }

    #[must_use]
    pub fn spec(&self) -> TreeSpec {
        match self {
            Self::Leaf(_) => TreeSpec::Leaf,
            Self::Tuple(children) => TreeSpec::Tuple(children.iter().map(Self::spec).collect()),
            Self::Dict(entries) => TreeSpec::Dict(
                entries
                    .iter()
                    .map(|(key, child)| (key.clone(), child.spec()))
                    .collect(),
            ),
        }
    }

    /// Leaves by reference, in flattening order.
    #[must_use]
    pub fn leaves(&self) -> Vec<&T> {
        let mut out = Vec::with_capacity(self.leaf_count());
        self.collect_refs(&mut out);
        out
    }

    fn collect_refs<'a>(&'a self, out: &mut Vec<&'a T>) {
        match self {
            Self::Leaf(value) => out.push(value),
            Self::Tuple(children) => children.iter().for_each(|child| child.collect_refs(out)),
            Self::Dict(entries) => entries.values().for_each(|child| child.collect_refs(out)),
        }
    }

    #[must_use]
    pub fn flatten(self) -> (Vec<T>, TreeSpec) {
        let spec = self.spec();
        let mut leaves = Vec::with_capacity(self.leaf_count());
        self.collect_owned(&mut leaves);
        (leaves, spec)
    }

    fn collect_owned(self, out: &mut Vec<T>) {
        match self {
            Self::Leaf(value) => out.push(value),
            Self::Tuple(children) => children
                .into_iter()
                .for_each(|child| child.collect_owned(out)),
            Self::Dict(entries) => entries
                .into_values()
                .for_each(|child| child.collect_owned(out)),
        }
    }

    pub fn try_map<U, E>(&self, f: &mut impl FnMut(&T) -> Result<U, E>) -> Result<Tree<U>, E> {
        Ok(match self {
            Self::Leaf(value) => Tree::Leaf(f(value)?),
            Self::Tuple(children) => Tree::Tuple(
                children
                    .iter()
                    .map(|child| child.try_map(f))
                    .collect::<Result<_, _>>()?,
            ),
            Self::Dict(entries) => Tree::Dict(
                entries
                    .iter()
                    .map(|(key, child)| Ok::<_, E>((key.clone(), child.try_map(f)?)))
                    .collect::<Result<_, _>>()?,
            ),
        })
    }
}

impl TreeSpec {
    #[must_use]
    pub fn leaf_count(&self) -> usize {
        match self {
            Self::Leaf => 1,
            Self::Tuple(children) => children.iter().map(Self::leaf_count).sum(),
            Self::Dict(entries) => entries.values().map(Self::leaf_count).sum(),
        }
    }

    pub fn unflatten<T>(&self, leaves: Vec<T>) -> Result<Tree<T>, TreeError> {
        let expected = self.leaf_count();
        if leaves.len() != expected {
            return Err(TreeError::LeafCountMismatch {
                expected,
                actual: leaves.len(),
            });
        }
        let mut iter = leaves.into_iter();
        self.build(&mut iter).ok_or(TreeError::LeafCountMismatch {
            expected,
            actual: 0,
        })
    }

    fn build<T>(&self, leaves: &mut impl Iterator<Item = T>) -> Option<Tree<T>> {
        Some(match self {
            Self::Leaf => Tree::Leaf(leaves.next()?),
            Self::Tuple(children) => Tree::Tuple(
                children
                    .iter()
                    .map(|child| child.build(leaves))
                    .collect::<Option<_>>()?,
            ),
            Self::Dict(entries) => Tree::Dict(
                entries
                    .iter()
                    .map(|(key, child)| Some((key.clone(), child.build(leaves)?)))
                    .collect::<Option<_>>()?,
            ),
        })
    }
}
