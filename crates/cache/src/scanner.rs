//! One-shot, cancellable directory scan producing a [`CacheNode`] tree.
//!
//! The walk is breadth-first over an explicit queue, never recursive, so deep
//! trees cannot overflow the stack. Each queued directory is identified by its
//! root-relative name segments; its children are attached by descending from
//! the root node, which keeps the tree free of parent pointers.
//!
//! Ignore rules are evaluated once per entry. Ignored directories are recorded
//! as leaves and never listed. An entry that cannot be read is kept as an
//! ignored leaf and the walk carries on.

use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Instant;

use dirmirror_core::{CacheNode, ScanConfig, ScanProgress, ScanStats, entry_name};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::filter::IgnoreFilter;

#[derive(Error, Debug)]
pub enum ScanError {
  #[error("Root does not exist: {}", .0.display())]
  RootMissing(PathBuf),
  #[error("Root is not a directory: {}", .0.display())]
  NotADirectory(PathBuf),
  #[error("IO error at {}: {source}", path.display())]
  Io {
    path: PathBuf,
    #[source]
    source: io::Error,
  },
  #[error("Scan cancelled")]
  Cancelled,
}

/// Notifications emitted while a scan runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanNotice {
  Progress(ScanProgress),
  /// An entry could not be read and was recorded as an ignored leaf
  EntryError { path: PathBuf, message: String },
}

/// Result of a completed scan
#[derive(Debug, Clone)]
pub struct ScanOutcome {
  pub root: CacheNode,
  pub stats: ScanStats,
}

/// Directory scanner
#[derive(Debug, Clone)]
pub struct Scanner {
  progress_interval: usize,
}

impl Default for Scanner {
  fn default() -> Self {
    Self::new(&ScanConfig::default())
  }
}

impl Scanner {
  pub fn new(config: &ScanConfig) -> Self {
    Self {
      progress_interval: config.progress_interval.max(1),
    }
  }

  /// Scan `root` into a fresh tree.
  ///
  /// Blocks on directory listing; run it off the async runtime.
  pub fn scan(
    &self,
    root: &Path,
    filter: &dyn IgnoreFilter,
    cancel: &CancellationToken,
    notify: &mut dyn FnMut(ScanNotice),
  ) -> Result<ScanOutcome, ScanError> {
    let start = Instant::now();
    check_root(root)?;
    info!(root = %root.display(), "Scan started");

    let mut walk = Walk::new(self.progress_interval, notify);
    let mut tree = CacheNode::directory(root);
    let mut queue: VecDeque<Vec<String>> = VecDeque::new();
    queue.push_back(Vec::new());

    while let Some(segments) = queue.pop_front() {
      if cancel.is_cancelled() {
        debug!(root = %root.display(), "Scan cancelled");
        return Err(ScanError::Cancelled);
      }

      let dir_path = join_segments(root, &segments);
      let entries = match fs::read_dir(&dir_path) {
        Ok(entries) => entries,
        Err(source) if segments.is_empty() => return Err(ScanError::Io { path: dir_path, source }),
        Err(e) => {
          walk.entry_error(&dir_path, &e);
          if let Some(node) = tree.descend_mut(&segments) {
            node.ignored = true;
          }
          walk.progress.ignored += 1;
          continue;
        }
      };

      let mut children = BTreeMap::new();
      for entry in entries {
        let entry = match entry {
          Ok(entry) => entry,
          Err(e) => {
            // No name to record; the listing itself is still usable
            walk.entry_error(&dir_path, &e);
            continue;
          }
        };

        let path = entry.path();
        // Links are leaves, but one whose target is gone is an unreadable entry
        let file_type = entry.file_type().and_then(|file_type| {
          if file_type.is_symlink() {
            fs::metadata(&path)?;
          }
          Ok(file_type)
        });
        let node = match file_type {
          Ok(file_type) => {
            let is_dir = file_type.is_dir();
            let ignored = filter.should_ignore(&path, is_dir);
            if is_dir && !ignored {
              let mut child_segments = segments.clone();
              child_segments.push(entry_name(&path));
              queue.push_back(child_segments);
            }
            walk.counted(is_dir, ignored, &dir_path);
            new_node(path, is_dir, ignored)
          }
          Err(e) => {
            walk.entry_error(&path, &e);
            walk.counted(false, true, &dir_path);
            new_node(path, false, true)
          }
        };
        children.insert(node.name.clone(), node);
      }

      if let Some(node) = tree.descend_mut(&segments) {
        node.children = children;
      }
    }

    let stats = walk.finish(root, start);
    info!(
      root = %root.display(),
      dirs = stats.dirs,
      files = stats.files,
      ignored = stats.ignored,
      errors = stats.errors,
      duration_ms = stats.duration.as_millis() as u64,
      "Scan complete"
    );

    Ok(ScanOutcome { root: tree, stats })
  }
}

fn check_root(root: &Path) -> Result<(), ScanError> {
  match fs::metadata(root) {
    Ok(metadata) if metadata.is_dir() => Ok(()),
    Ok(_) => Err(ScanError::NotADirectory(root.to_path_buf())),
    Err(e) if e.kind() == io::ErrorKind::NotFound => Err(ScanError::RootMissing(root.to_path_buf())),
    Err(source) => Err(ScanError::Io {
      path: root.to_path_buf(),
      source,
    }),
  }
}

fn new_node(path: PathBuf, is_dir: bool, ignored: bool) -> CacheNode {
  let node = if is_dir {
    CacheNode::directory(path)
  } else {
    CacheNode::file(path)
  };
  node.with_ignored(ignored)
}

fn join_segments(root: &Path, segments: &[String]) -> PathBuf {
  let mut path = root.to_path_buf();
  path.extend(segments);
  path
}

/// Counters and notification plumbing for a single walk
struct Walk<'a> {
  progress: ScanProgress,
  interval: usize,
  since_report: usize,
  notify: &'a mut dyn FnMut(ScanNotice),
}

impl<'a> Walk<'a> {
  fn new(interval: usize, notify: &'a mut dyn FnMut(ScanNotice)) -> Self {
    Self {
      progress: ScanProgress::default(),
      interval,
      since_report: 0,
      notify,
    }
  }

  fn counted(&mut self, is_dir: bool, ignored: bool, current: &Path) {
    if is_dir {
      self.progress.dirs += 1;
    } else {
      self.progress.files += 1;
    }
    if ignored {
      self.progress.ignored += 1;
    }

    self.since_report += 1;
    if self.since_report >= self.interval {
      self.since_report = 0;
      self.progress.current = current.to_path_buf();
      (self.notify)(ScanNotice::Progress(self.progress.clone()));
    }
  }

  fn entry_error(&mut self, path: &Path, error: &io::Error) {
    warn!(path = %path.display(), error = %error, "Unreadable entry, marking ignored");
    self.progress.errors += 1;
    (self.notify)(ScanNotice::EntryError {
      path: path.to_path_buf(),
      message: error.to_string(),
    });
  }

  fn finish(mut self, root: &Path, start: Instant) -> ScanStats {
    self.progress.current = root.to_path_buf();
    (self.notify)(ScanNotice::Progress(self.progress.clone()));
    ScanStats {
      dirs: self.progress.dirs,
      files: self.progress.files,
      ignored: self.progress.ignored,
      errors: self.progress.errors,
      duration: start.elapsed(),
    }
  }
}
