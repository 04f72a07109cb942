//! Directory cache service
//!
//! A single actor task owns the cache lifecycle; callers talk to it through a
//! cheap, cloneable [`CacheHandle`].
//!
//! # Lifecycle
//!
//! ```text
//! Idle -> Scanning -> Ready(watching) -> Rescanning -> Ready(watching) -> ...
//! ```
//!
//! Any failure or teardown returns to `Idle`. Every `set_root` and rescan
//! allocates a new generation; scan results and watcher events from older
//! generations are discarded, and the old watcher is fully stopped before the
//! new scan starts.
//!
//! # Incremental updates
//!
//! Once a scan is installed the watcher feeds events that patch the tree in
//! place. Created and moved directories fall back to a full rescan rather than
//! walking the new subtree; the reason is logged and broadcast as
//! [`CacheUpdate::Rescanning`](dirmirror_core::CacheUpdate::Rescanning).
//!
//! # Example
//!
//! ```ignore
//! let cache = CacheService::spawn(Config::load_for_root(&root));
//! let generation = cache.set_root(&root, ["*.log", "target/"]).await?;
//! cache.wait_for(|state| state.is_ready_at(generation)).await?;
//! let node = cache.find("src/main.rs");
//! ```

mod actor;
mod handle;
mod message;
mod tree;

#[cfg(test)]
mod __tests__;

pub use handle::{CacheError, CacheHandle};
pub use tree::{ApplyOutcome, SharedTree};

use dirmirror_core::Config;
use tokio_util::sync::CancellationToken;

use crate::filter::{FilterFactory, GitignoreFilter};

/// Entry point for starting cache services
pub struct CacheService;

impl CacheService {
  /// Spawn a service using gitignore-style matching for ignore patterns.
  ///
  /// Must be called from within a tokio runtime.
  pub fn spawn(config: Config) -> CacheHandle {
    let factory = GitignoreFilter::factory(config.ignore.patterns.clone(), config.ignore.respect_gitignore);
    Self::spawn_with_filter(config, factory)
  }

  /// Spawn a service with a custom ignore predicate
  pub fn spawn_with_filter(config: Config, factory: FilterFactory) -> CacheHandle {
    Self::spawn_with_cancel(config, factory, CancellationToken::new())
  }

  /// Spawn a service that also stops when `cancel` is cancelled.
  ///
  /// Pass a child of an application-wide token to tie the cache to a larger
  /// shutdown sequence.
  pub fn spawn_with_cancel(config: Config, factory: FilterFactory, cancel: CancellationToken) -> CacheHandle {
    actor::CacheActor::spawn(config, factory, cancel)
  }
}
