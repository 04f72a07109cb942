//! In-memory mirror of one filesystem entry.
//!
//! The tree is a map of maps with no parent back-pointers. Lookups descend
//! from the root one name at a time, so finding a node costs O(depth).
//!
//! An ignored node is always a leaf: ignored subtrees are never listed, and
//! nothing inserts children below an ignored node.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// A single entry in the directory cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheNode {
  /// File name (lossy UTF-8 of the OS name)
  pub name: String,
  /// Absolute path, redundant with parent + name
  pub path: PathBuf,
  pub is_dir: bool,
  pub ignored: bool,
  /// Children keyed by name, sorted so equal trees compare equal
  pub children: BTreeMap<String, CacheNode>,
}

/// Per-kind node totals for a subtree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeCounts {
  pub dirs: usize,
  pub files: usize,
  pub ignored: usize,
}

impl CacheNode {
  /// Create an empty, unignored directory node.
  pub fn directory(path: impl Into<PathBuf>) -> Self {
    Self::new(path.into(), true)
  }

  /// Create an unignored file node.
  pub fn file(path: impl Into<PathBuf>) -> Self {
    Self::new(path.into(), false)
  }

  fn new(path: PathBuf, is_dir: bool) -> Self {
    Self {
      name: entry_name(&path),
      path,
      is_dir,
      ignored: false,
      children: BTreeMap::new(),
    }
  }

  /// Set the ignored flag. Marking a node ignored drops its children.
  pub fn with_ignored(mut self, ignored: bool) -> Self {
    self.ignored = ignored;
    if ignored {
      self.children.clear();
    }
    self
  }

  pub fn child(&self, name: &str) -> Option<&CacheNode> {
    self.children.get(name)
  }

  /// Insert a child, replacing any existing child with the same name.
  ///
  /// Returns the replaced node. Inserting below an ignored node is refused
  /// and hands the node back unchanged.
  pub fn insert_child(&mut self, node: CacheNode) -> Result<Option<CacheNode>, CacheNode> {
    if self.ignored || !self.is_dir {
      return Err(node);
    }
    Ok(self.children.insert(node.name.clone(), node))
  }

  pub fn remove_child(&mut self, name: &str) -> Option<CacheNode> {
    self.children.remove(name)
  }

  /// Follow `segments` down from this node.
  pub fn descend<S: AsRef<str>>(&self, segments: &[S]) -> Option<&CacheNode> {
    let mut node = self;
    for segment in segments {
      node = node.children.get(segment.as_ref())?;
    }
    Some(node)
  }

  /// Mutable variant of [`CacheNode::descend`].
  pub fn descend_mut<S: AsRef<str>>(&mut self, segments: &[S]) -> Option<&mut CacheNode> {
    let mut node = self;
    for segment in segments {
      node = node.children.get_mut(segment.as_ref())?;
    }
    Some(node)
  }

  /// Depth-first, pre-order iterator over this node and its descendants.
  pub fn walk(&self) -> Walk<'_> {
    Walk { stack: vec![self] }
  }

  /// Count the directories, files and ignored entries in this subtree.
  pub fn counts(&self) -> NodeCounts {
    let mut counts = NodeCounts::default();
    for node in self.walk() {
      if node.is_dir {
        counts.dirs += 1;
      } else {
        counts.files += 1;
      }
      if node.ignored {
        counts.ignored += 1;
      }
    }
    counts
  }
}

/// Iterator returned by [`CacheNode::walk`].
pub struct Walk<'a> {
  stack: Vec<&'a CacheNode>,
}

impl<'a> Iterator for Walk<'a> {
  type Item = &'a CacheNode;

  fn next(&mut self) -> Option<Self::Item> {
    let node = self.stack.pop()?;
    // Reverse so children come out in name order
    self.stack.extend(node.children.values().rev());
    Some(node)
  }
}

/// Display name for a path: its final component, or the whole path for roots like `/`.
pub fn entry_name(path: &Path) -> String {
  path
    .file_name()
    .map(|name| name.to_string_lossy().into_owned())
    .unwrap_or_else(|| path.to_string_lossy().into_owned())
}
