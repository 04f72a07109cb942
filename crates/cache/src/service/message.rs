//! Commands accepted by the cache service actor.
//!
//! Every command carries a oneshot reply so callers learn when the service
//! has acted on it. Reads (snapshot, find, state) bypass the actor entirely.

use std::path::PathBuf;

use tokio::sync::oneshot;

use super::handle::CacheError;

#[derive(Debug)]
pub enum CacheCommand {
  /// Replace the root and start a fresh scan; replies with the new generation
  SetRoot {
    path: PathBuf,
    patterns: Vec<String>,
    reply: oneshot::Sender<Result<u64, CacheError>>,
  },
  /// Swap the ignore patterns used by the live watcher and later scans
  UpdateIgnorePatterns {
    patterns: Vec<String>,
    reply: oneshot::Sender<Result<(), CacheError>>,
  },
  /// Rescan the current root; replies with the new generation
  Rescan {
    reply: oneshot::Sender<Result<u64, CacheError>>,
  },
  /// Cancel any scan, stop watching and forget the root
  Stop { reply: oneshot::Sender<()> },
  /// Stop and exit the actor
  Shutdown { reply: oneshot::Sender<()> },
}
