//! Lock-guarded tree shared between the service actor and its handles.
//!
//! Readers get `Arc` snapshots; writers go through `Arc::make_mut`, so a
//! snapshot handed out earlier is never mutated underneath its holder. The
//! lock is only held for the pointer swap or the in-place edit, never while
//! notifying anyone.

use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use dirmirror_core::{CacheNode, ChangeDescriptor, WatchEvent};
use tracing::trace;

use crate::filter::IgnoreFilter;

/// Result of applying one watch event to the tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
  Changed(ChangeDescriptor),
  Unchanged,
  /// File content changed; the tree itself is untouched
  ContentModified(PathBuf),
  /// The tree cannot be patched reliably and needs a full scan
  NeedsRescan {
    reason: String,
    change: Option<ChangeDescriptor>,
  },
  /// The root itself disappeared; the tree has been cleared
  RootDeleted,
}

#[derive(Debug, Default)]
struct Slot {
  root: Option<PathBuf>,
  tree: Option<Arc<CacheNode>>,
}

#[derive(Debug, Clone, Default)]
pub struct SharedTree {
  inner: Arc<Mutex<Slot>>,
}

impl SharedTree {
  pub fn new() -> Self {
    Self::default()
  }

  // Every mutation leaves the tree structurally valid, so a poisoned lock is safe to reuse
  fn lock(&self) -> MutexGuard<'_, Slot> {
    self.inner.lock().unwrap_or_else(PoisonError::into_inner)
  }

  pub fn root(&self) -> Option<PathBuf> {
    self.lock().root.clone()
  }

  pub fn snapshot(&self) -> Option<Arc<CacheNode>> {
    self.lock().tree.clone()
  }

  /// Point at a new root (or none) and drop the current tree
  pub fn reset(&self, root: Option<PathBuf>) {
    let mut slot = self.lock();
    slot.root = root;
    slot.tree = None;
  }

  /// Drop the tree but keep the root
  pub fn clear(&self) {
    self.lock().tree = None;
  }

  /// Swap in a freshly scanned tree
  pub fn install(&self, tree: CacheNode) {
    self.lock().tree = Some(Arc::new(tree));
  }

  /// Look up a node by absolute path under the root, or by root-relative path.
  pub fn find(&self, path: &Path) -> Option<CacheNode> {
    let slot = self.lock();
    let root = slot.root.as_deref()?;
    let tree = slot.tree.as_deref()?;
    let segments = if path.is_absolute() {
      relative_segments(root, path)?
    } else {
      normal_segments(path)?
    };
    tree.descend(&segments).cloned()
  }

  /// Apply one event, returning what happened. Never blocks on anything but the lock.
  pub fn apply(&self, event: &WatchEvent, filter: &dyn IgnoreFilter) -> ApplyOutcome {
    let mut slot = self.lock();
    let Some(root) = slot.root.clone() else {
      return ApplyOutcome::Unchanged;
    };

    match event {
      WatchEvent::Created { path, is_dir } => match slot.tree.as_mut() {
        Some(tree) => apply_created(tree, &root, path, *is_dir, filter),
        None => ApplyOutcome::Unchanged,
      },
      WatchEvent::Deleted { path } => {
        if *path == root {
          slot.tree = None;
          return ApplyOutcome::RootDeleted;
        }
        match slot.tree.as_mut() {
          Some(tree) => match remove_node(tree, &root, path) {
            Some(removed) => ApplyOutcome::Changed(ChangeDescriptor::Removed {
              path: path.clone(),
              was_dir: removed.is_dir,
            }),
            None => ApplyOutcome::Unchanged,
          },
          None => ApplyOutcome::Unchanged,
        }
      }
      WatchEvent::Modified { path } => {
        if slot.tree.is_some() && path.starts_with(&root) {
          ApplyOutcome::ContentModified(path.clone())
        } else {
          ApplyOutcome::Unchanged
        }
      }
      WatchEvent::Moved { from, to, is_dir } => {
        if *from == root {
          slot.tree = None;
          return ApplyOutcome::RootDeleted;
        }
        match slot.tree.as_mut() {
          Some(tree) => apply_moved(tree, &root, from, to, *is_dir, filter),
          None => ApplyOutcome::Unchanged,
        }
      }
    }
  }
}

fn apply_created(
  tree: &mut Arc<CacheNode>,
  root: &Path,
  path: &Path,
  is_dir: bool,
  filter: &dyn IgnoreFilter,
) -> ApplyOutcome {
  let Some((parent, _)) = split_parent(root, path) else {
    return ApplyOutcome::Unchanged;
  };
  if !accepts_children(tree, &parent) {
    trace!(path = %path.display(), "Parent missing or ignored, dropping create");
    return ApplyOutcome::Unchanged;
  }

  let ignored = filter.should_ignore(path, is_dir);
  let node = if is_dir {
    CacheNode::directory(path)
  } else {
    CacheNode::file(path)
  }
  .with_ignored(ignored);

  let inserted = Arc::make_mut(tree)
    .descend_mut(&parent)
    .is_some_and(|parent| parent.insert_child(node).is_ok());
  if !inserted {
    return ApplyOutcome::Unchanged;
  }

  let change = ChangeDescriptor::Inserted {
    path: path.to_path_buf(),
    is_dir,
    ignored,
  };
  if is_dir && !ignored {
    // Its contents may have appeared before the watch on it did
    return ApplyOutcome::NeedsRescan {
      reason: format!("directory created: {}", path.display()),
      change: Some(change),
    };
  }
  ApplyOutcome::Changed(change)
}

fn apply_moved(
  tree: &mut Arc<CacheNode>,
  root: &Path,
  from: &Path,
  to: &Path,
  is_dir: bool,
  filter: &dyn IgnoreFilter,
) -> ApplyOutcome {
  let removed = remove_node(tree, root, from);
  let was_dir = removed.as_ref().map_or(is_dir, |node| node.is_dir);
  let removal = removed.as_ref().map(|node| ChangeDescriptor::Removed {
    path: from.to_path_buf(),
    was_dir: node.is_dir,
  });

  if was_dir {
    return ApplyOutcome::NeedsRescan {
      reason: format!("directory moved: {} -> {}", from.display(), to.display()),
      change: removal,
    };
  }

  let target = split_parent(root, to).filter(|(parent, _)| accepts_children(tree.as_ref(), parent));
  let Some((parent, _)) = target else {
    trace!(to = %to.display(), "Move target parent missing or ignored");
    return removal.map_or(ApplyOutcome::Unchanged, ApplyOutcome::Changed);
  };

  let node = CacheNode::file(to).with_ignored(filter.should_ignore(to, false));
  let ignored = node.ignored;
  let inserted = Arc::make_mut(tree)
    .descend_mut(&parent)
    .is_some_and(|parent| parent.insert_child(node).is_ok());

  match (removal.is_some(), inserted) {
    (true, true) => ApplyOutcome::Changed(ChangeDescriptor::Moved {
      from: from.to_path_buf(),
      to: to.to_path_buf(),
    }),
    (false, true) => ApplyOutcome::Changed(ChangeDescriptor::Inserted {
      path: to.to_path_buf(),
      is_dir: false,
      ignored,
    }),
    (_, false) => removal.map_or(ApplyOutcome::Unchanged, ApplyOutcome::Changed),
  }
}

/// Remove the node at `path`, cloning the tree only if the node exists
fn remove_node(tree: &mut Arc<CacheNode>, root: &Path, path: &Path) -> Option<CacheNode> {
  let (parent, name) = split_parent(root, path)?;
  tree.descend(&parent)?.child(&name)?;
  Arc::make_mut(tree).descend_mut(&parent)?.remove_child(&name)
}

fn accepts_children(tree: &CacheNode, parent: &[String]) -> bool {
  tree
    .descend(parent)
    .is_some_and(|node| node.is_dir && !node.ignored)
}

/// Split `path` into its parent's root-relative segments and its own name
fn split_parent(root: &Path, path: &Path) -> Option<(Vec<String>, String)> {
  let mut segments = relative_segments(root, path)?;
  let name = segments.pop()?;
  Some((segments, name))
}

/// Root-relative name segments of `path`, or `None` when it is not under `root`
pub fn relative_segments(root: &Path, path: &Path) -> Option<Vec<String>> {
  normal_segments(path.strip_prefix(root).ok()?)
}

fn normal_segments(relative: &Path) -> Option<Vec<String>> {
  relative
    .components()
    .filter(|component| !matches!(component, Component::CurDir))
    .map(|component| match component {
      Component::Normal(name) => Some(name.to_string_lossy().into_owned()),
      _ => None,
    })
    .collect()
}
