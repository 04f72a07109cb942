//! Watch events, cache state and consumer notifications.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

// ============================================================================
// Watch Events
// ============================================================================

/// A semantic filesystem change, translated from raw OS notifications.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WatchEvent {
  Created { path: PathBuf, is_dir: bool },
  Deleted { path: PathBuf },
  /// File content changed (never emitted for directories)
  Modified { path: PathBuf },
  Moved { from: PathBuf, to: PathBuf, is_dir: bool },
}

impl fmt::Display for WatchEvent {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Created { path, is_dir } => write!(f, "CREATED {} (dir: {is_dir})", path.display()),
      Self::Deleted { path } => write!(f, "DELETED {}", path.display()),
      Self::Modified { path } => write!(f, "MODIFIED {}", path.display()),
      Self::Moved { from, to, is_dir } => {
        write!(f, "MOVED {} -> {} (dir: {is_dir})", from.display(), to.display())
      }
    }
  }
}

// ============================================================================
// Cache State
// ============================================================================

/// Lifecycle state of the cache service.
///
/// Every SetRoot or Rescan allocates a new generation; events and scan results
/// from older generations are discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CacheState {
  Idle,
  Scanning { generation: u64 },
  /// `watching == false` is the degraded mode: valid tree, no live updates
  Ready { generation: u64, watching: bool },
  Rescanning { generation: u64 },
}

impl CacheState {
  pub fn generation(&self) -> Option<u64> {
    match *self {
      Self::Idle => None,
      Self::Scanning { generation } | Self::Ready { generation, .. } | Self::Rescanning { generation } => {
        Some(generation)
      }
    }
  }

  pub fn is_ready(&self) -> bool {
    matches!(self, Self::Ready { .. })
  }

  /// True once the service has settled on `generation` or anything newer.
  pub fn is_ready_at(&self, generation: u64) -> bool {
    matches!(*self, Self::Ready { generation: current, .. } if current >= generation)
  }
}

// ============================================================================
// Scan Reporting
// ============================================================================

/// Why a scan was started.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanReason {
  SetRoot,
  /// Automatic rescan after a structurally ambiguous event
  Rescan { reason: String },
  /// Rescan requested through the handle
  Manual,
}

/// Running totals reported while a scan is in progress.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanProgress {
  pub dirs: usize,
  pub files: usize,
  pub ignored: usize,
  pub errors: usize,
  /// Directory being listed when the progress was reported
  pub current: PathBuf,
}

/// Totals for a completed scan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanStats {
  pub dirs: usize,
  pub files: usize,
  pub ignored: usize,
  pub errors: usize,
  pub duration: Duration,
}

// ============================================================================
// Consumer Notifications
// ============================================================================

/// Fine-grained description of an applied tree mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeDescriptor {
  Inserted { path: PathBuf, is_dir: bool, ignored: bool },
  Removed { path: PathBuf, was_dir: bool },
  Moved { from: PathBuf, to: PathBuf },
}

/// Notification broadcast to subscribers after the tree lock is released.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheUpdate {
  ScanStarted { generation: u64, root: PathBuf, reason: ScanReason },
  ScanProgress { generation: u64, progress: ScanProgress },
  /// A single entry could not be read; it is kept as an ignored leaf
  ScanEntryError { generation: u64, path: PathBuf, message: String },
  /// A new consistent tree snapshot is available
  SnapshotReplaced { generation: u64, stats: ScanStats },
  ScanFailed { generation: u64, error: String },
  Changed(ChangeDescriptor),
  ContentModified { path: PathBuf },
  Rescanning { reason: String },
  /// The OS watch could not be established; the tree will not update live
  WatchDegraded { error: String },
  WatchError { error: String },
  /// The root was deleted; the tree is cleared until the next SetRoot
  RootDeleted { root: PathBuf },
  Cleared,
}
