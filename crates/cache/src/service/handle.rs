//! Handle for talking to the cache service
//!
//! The handle is cheap to clone. Commands go through the actor; reads are
//! served straight from the shared tree and the state channel, so they never
//! wait behind a scan.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dirmirror_core::{CacheNode, CacheState, CacheUpdate};
use tokio::sync::{broadcast, mpsc, oneshot, watch};

use super::message::CacheCommand;
use super::tree::SharedTree;
use crate::filter::FilterError;

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
  #[error("Cache service has shut down")]
  ActorGone,
  #[error("No root is set")]
  NoRoot,
  #[error(transparent)]
  Filter(#[from] FilterError),
}

// ============================================================================
// Cache Handle
// ============================================================================

#[derive(Clone, Debug)]
pub struct CacheHandle {
  tx: mpsc::Sender<CacheCommand>,
  tree: SharedTree,
  state: watch::Receiver<CacheState>,
  updates: broadcast::Sender<CacheUpdate>,
}

impl CacheHandle {
  pub(crate) fn new(
    tx: mpsc::Sender<CacheCommand>,
    tree: SharedTree,
    state: watch::Receiver<CacheState>,
    updates: broadcast::Sender<CacheUpdate>,
  ) -> Self {
    Self {
      tx,
      tree,
      state,
      updates,
    }
  }

  async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> CacheCommand) -> Result<T, CacheError> {
    let (reply, rx) = oneshot::channel();
    self.tx.send(command(reply)).await.map_err(|_| CacheError::ActorGone)?;
    rx.await.map_err(|_| CacheError::ActorGone)
  }

  /// Point the cache at `path` and start scanning it.
  ///
  /// Returns the generation of the new scan once it has started; use
  /// [`CacheHandle::wait_for`] to wait for it to finish.
  pub async fn set_root<I, S>(&self, path: impl Into<PathBuf>, patterns: I) -> Result<u64, CacheError>
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    let path = path.into();
    let patterns = patterns.into_iter().map(Into::into).collect();
    self
      .request(|reply| CacheCommand::SetRoot { path, patterns, reply })
      .await?
  }

  /// Replace the ignore patterns. Applies to later events and scans; does not rescan.
  pub async fn update_ignore_patterns<I, S>(&self, patterns: I) -> Result<(), CacheError>
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    let patterns = patterns.into_iter().map(Into::into).collect();
    self
      .request(|reply| CacheCommand::UpdateIgnorePatterns { patterns, reply })
      .await?
  }

  /// Rescan the current root, returning the new generation
  pub async fn rescan(&self) -> Result<u64, CacheError> {
    self.request(|reply| CacheCommand::Rescan { reply }).await?
  }

  /// Stop scanning and watching, and drop the tree
  pub async fn stop(&self) -> Result<(), CacheError> {
    self.request(|reply| CacheCommand::Stop { reply }).await
  }

  /// Stop the service. Other handles get `ActorGone` afterwards.
  pub async fn shutdown(&self) -> Result<(), CacheError> {
    self.request(|reply| CacheCommand::Shutdown { reply }).await
  }

  /// The current tree, if one is installed
  pub fn snapshot(&self) -> Option<Arc<CacheNode>> {
    self.tree.snapshot()
  }

  /// Look up a node by absolute path under the root, or by root-relative path
  pub fn find(&self, path: impl AsRef<Path>) -> Option<CacheNode> {
    self.tree.find(path.as_ref())
  }

  pub fn root(&self) -> Option<PathBuf> {
    self.tree.root()
  }

  pub fn state(&self) -> CacheState {
    *self.state.borrow()
  }

  /// Receive notifications sent from now on
  pub fn subscribe(&self) -> broadcast::Receiver<CacheUpdate> {
    self.updates.subscribe()
  }

  /// Wait until the state satisfies `predicate`, returning that state
  pub async fn wait_for(&self, predicate: impl FnMut(&CacheState) -> bool) -> Result<CacheState, CacheError> {
    let mut state = self.state.clone();
    let result = state.wait_for(predicate).await;
    result.map(|state| *state).map_err(|_| CacheError::ActorGone)
  }
}
