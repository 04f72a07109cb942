//! CacheActor - owns the lifecycle of one cache service
//!
//! The actor is the only writer of lifecycle state: the generation counter,
//! the in-flight scan, the watcher and the active ignore filter. The tree is
//! shared with handles through [`SharedTree`], which the actor mutates after
//! each applied event.

use std::path::PathBuf;
use std::sync::Arc;

use dirmirror_core::{CacheState, CacheUpdate, Config, ScanReason, WatchEvent, WatcherConfig};
use tokio::{
  sync::{broadcast, mpsc, watch},
  task::JoinError,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::handle::{CacheError, CacheHandle};
use super::message::CacheCommand;
use super::tree::{ApplyOutcome, SharedTree};
use crate::filter::{FilterFactory, IgnoreFilter, SharedFilter};
use crate::scanner::{ScanError, ScanNotice, ScanOutcome, Scanner};
use crate::watcher::{WatchError, WatchSignal, WatcherHandle, WatcherMessage, WatcherTask};

/// Starts the watcher for a freshly installed tree
pub(crate) type WatcherSpawner = fn(
  PathBuf,
  u64,
  &WatcherConfig,
  SharedFilter,
  mpsc::Sender<WatcherMessage>,
) -> Result<WatcherHandle, WatchError>;

/// Result of a background scan, tagged with the generation it ran for
struct ScanDone {
  generation: u64,
  result: Result<Result<ScanOutcome, ScanError>, JoinError>,
}

pub(crate) struct CacheActor {
  config: Config,
  factory: FilterFactory,
  spawn_watcher: WatcherSpawner,
  tree: SharedTree,
  filter: SharedFilter,
  /// Root the current generation belongs to
  root: Option<PathBuf>,
  patterns: Vec<String>,
  generation: u64,
  scan_cancel: Option<CancellationToken>,
  watcher: Option<WatcherHandle>,
  state: watch::Sender<CacheState>,
  updates: broadcast::Sender<CacheUpdate>,
  command_rx: mpsc::Receiver<CacheCommand>,
  scan_tx: mpsc::Sender<ScanDone>,
  scan_rx: mpsc::Receiver<ScanDone>,
  watch_tx: mpsc::Sender<WatcherMessage>,
  watch_rx: mpsc::Receiver<WatcherMessage>,
  cancel: CancellationToken,
}

impl CacheActor {
  /// Spawn the actor and return a handle for communication
  ///
  /// Cancelling `cancel` shuts the actor down just like a Shutdown command.
  pub(crate) fn spawn(config: Config, factory: FilterFactory, cancel: CancellationToken) -> CacheHandle {
    Self::spawn_with_watcher(config, factory, cancel, WatcherTask::spawn)
  }

  pub(crate) fn spawn_with_watcher(
    config: Config,
    factory: FilterFactory,
    cancel: CancellationToken,
    spawn_watcher: WatcherSpawner,
  ) -> CacheHandle {
    let (command_tx, command_rx) = mpsc::channel(config.service.command_buffer.max(1));
    let (updates, _) = broadcast::channel(config.service.update_buffer.max(1));
    let (state, state_rx) = watch::channel(CacheState::Idle);
    let (scan_tx, scan_rx) = mpsc::channel(4);
    let (watch_tx, watch_rx) = mpsc::channel(config.watcher.event_buffer.max(1));
    let tree = SharedTree::new();

    let handle = CacheHandle::new(command_tx, tree.clone(), state_rx, updates.clone());

    let actor = Self {
      config,
      factory,
      spawn_watcher,
      tree,
      filter: SharedFilter::allow_all(),
      root: None,
      patterns: Vec::new(),
      generation: 0,
      scan_cancel: None,
      watcher: None,
      state,
      updates,
      command_rx,
      scan_tx,
      scan_rx,
      watch_tx,
      watch_rx,
      cancel,
    };
    tokio::spawn(actor.run());

    handle
  }

  /// Main actor event loop
  ///
  /// Runs until a Shutdown command arrives or every handle is dropped.
  async fn run(mut self) {
    info!("CacheActor started");

    loop {
      tokio::select! {
        biased;

        _ = self.cancel.cancelled() => {
          info!("CacheActor shutting down (cancelled)");
          break;
        }

        command = self.command_rx.recv() => {
          let Some(command) = command else {
            info!("CacheActor shutting down (all handles dropped)");
            break;
          };
          if !self.handle_command(command).await {
            info!("CacheActor shutting down (requested)");
            break;
          }
        }

        Some(done) = self.scan_rx.recv() => self.handle_scan_done(done).await,

        Some(message) = self.watch_rx.recv() => self.handle_watcher_message(message).await,
      }
    }

    self.teardown().await;
    info!("CacheActor stopped");
  }

  /// Returns false once the actor should exit
  async fn handle_command(&mut self, command: CacheCommand) -> bool {
    match command {
      CacheCommand::SetRoot { path, patterns, reply } => {
        let _ = reply.send(self.set_root(path, patterns).await);
      }
      CacheCommand::UpdateIgnorePatterns { patterns, reply } => {
        let _ = reply.send(self.update_ignore_patterns(patterns));
      }
      CacheCommand::Rescan { reply } => {
        let result = if self.root.is_some() {
          Ok(self.rescan(ScanReason::Manual).await)
        } else {
          Err(CacheError::NoRoot)
        };
        let _ = reply.send(result);
      }
      CacheCommand::Stop { reply } => {
        self.teardown().await;
        let _ = self.updates.send(CacheUpdate::Cleared);
        let _ = reply.send(());
      }
      CacheCommand::Shutdown { reply } => {
        self.teardown().await;
        let _ = reply.send(());
        return false;
      }
    }
    true
  }

  // ==========================================================================
  // Lifecycle
  // ==========================================================================

  async fn set_root(&mut self, path: PathBuf, patterns: Vec<String>) -> Result<u64, CacheError> {
    let root = tokio::fs::canonicalize(&path).await.unwrap_or(path);
    // Reject bad patterns before touching the current root
    let filter = (self.factory)(&root, &patterns)?;

    self.stop_watcher().await;
    self.cancel_scan();
    self.generation += 1;

    info!(root = %root.display(), generation = self.generation, "Setting root");
    self.tree.reset(Some(root.clone()));
    self.filter.store(filter);
    self.root = Some(root.clone());
    self.patterns = patterns;

    self.set_state(CacheState::Scanning {
      generation: self.generation,
    });
    self.start_scan(root, ScanReason::SetRoot);
    Ok(self.generation)
  }

  fn update_ignore_patterns(&mut self, patterns: Vec<String>) -> Result<(), CacheError> {
    let root = self.root.as_ref().ok_or(CacheError::NoRoot)?;
    let filter = (self.factory)(root, &patterns)?;
    self.filter.store(filter);
    info!(root = %root.display(), patterns = patterns.len(), "Ignore patterns updated");
    self.patterns = patterns;
    Ok(())
  }

  /// Throw away the live watcher and rebuild the tree from disk
  async fn rescan(&mut self, reason: ScanReason) -> u64 {
    let Some(root) = self.root.clone() else {
      return self.generation;
    };

    match &reason {
      ScanReason::Rescan { reason } => {
        info!("rescanning due to: {reason}");
        let _ = self.updates.send(CacheUpdate::Rescanning { reason: reason.clone() });
      }
      _ => {
        info!(root = %root.display(), "Manual rescan requested");
        let _ = self.updates.send(CacheUpdate::Rescanning {
          reason: "manual".to_string(),
        });
      }
    }

    self.stop_watcher().await;
    self.cancel_scan();
    self.generation += 1;

    // Pick up edits to ignore files since the last scan
    match (self.factory)(&root, &self.patterns) {
      Ok(filter) => self.filter.store(filter),
      Err(e) => warn!(error = %e, "Could not rebuild ignore filter, keeping the current one"),
    }

    // The previous tree stays readable until the new one is installed
    self.set_state(CacheState::Rescanning {
      generation: self.generation,
    });
    self.start_scan(root, reason);
    self.generation
  }

  /// Cancel work, stop watching and forget the root
  async fn teardown(&mut self) {
    self.stop_watcher().await;
    self.cancel_scan();
    self.generation += 1;
    self.root = None;
    self.tree.reset(None);
    self.set_state(CacheState::Idle);
  }

  fn set_state(&self, state: CacheState) {
    debug!(state = ?state, "State changed");
    self.state.send_replace(state);
  }

  // ==========================================================================
  // Scanning
  // ==========================================================================

  fn start_scan(&mut self, root: PathBuf, reason: ScanReason) {
    let generation = self.generation;
    let cancel = self.cancel.child_token();
    self.scan_cancel = Some(cancel.clone());

    let _ = self.updates.send(CacheUpdate::ScanStarted {
      generation,
      root: root.clone(),
      reason,
    });

    let scanner = Scanner::new(&self.config.scan);
    let filter = self.filter.load();
    let updates = self.updates.clone();
    let done_tx = self.scan_tx.clone();

    tokio::spawn(async move {
      let result = tokio::task::spawn_blocking(move || {
        scanner.scan(&root, filter.as_ref(), &cancel, &mut |notice| {
          let update = match notice {
            ScanNotice::Progress(progress) => CacheUpdate::ScanProgress { generation, progress },
            ScanNotice::EntryError { path, message } => CacheUpdate::ScanEntryError {
              generation,
              path,
              message,
            },
          };
          let _ = updates.send(update);
        })
      })
      .await;

      let _ = done_tx.send(ScanDone { generation, result }).await;
    });
  }

  fn cancel_scan(&mut self) {
    if let Some(cancel) = self.scan_cancel.take() {
      cancel.cancel();
    }
  }

  async fn handle_scan_done(&mut self, done: ScanDone) {
    if done.generation != self.generation {
      debug!(
        generation = done.generation,
        current = self.generation,
        "Discarding stale scan result"
      );
      return;
    }
    self.scan_cancel = None;

    let error = match done.result {
      Ok(Ok(outcome)) => return self.install(outcome).await,
      Ok(Err(ScanError::Cancelled)) => "scan cancelled".to_string(),
      Ok(Err(e)) => e.to_string(),
      Err(e) => format!("scan task failed: {e}"),
    };

    // No baseline, so no watcher either
    warn!(generation = done.generation, error = %error, "Scan failed");
    self.tree.clear();
    self.set_state(CacheState::Idle);
    let _ = self.updates.send(CacheUpdate::ScanFailed {
      generation: done.generation,
      error,
    });
  }

  async fn install(&mut self, outcome: ScanOutcome) {
    let Some(root) = self.root.clone() else {
      return;
    };
    let generation = self.generation;
    self.tree.install(outcome.root);

    let watching = match (self.spawn_watcher)(
      root.clone(),
      generation,
      &self.config.watcher,
      self.filter.clone(),
      self.watch_tx.clone(),
    ) {
      Ok(handle) => {
        self.watcher = Some(handle);
        true
      }
      Err(e) => {
        warn!(root = %root.display(), error = %e, "Could not watch root, continuing without live updates");
        let _ = self.updates.send(CacheUpdate::WatchDegraded { error: e.to_string() });
        false
      }
    };

    self.set_state(CacheState::Ready { generation, watching });
    let _ = self.updates.send(CacheUpdate::SnapshotReplaced {
      generation,
      stats: outcome.stats,
    });
  }

  // ==========================================================================
  // Watching
  // ==========================================================================

  async fn stop_watcher(&mut self) {
    if let Some(watcher) = self.watcher.take() {
      watcher.stop().await;
      debug!("Watcher stopped");
    }
  }

  async fn handle_watcher_message(&mut self, message: WatcherMessage) {
    if message.generation != self.generation || self.watcher.is_none() {
      trace!(generation = message.generation, "Discarding stale watcher message");
      return;
    }

    match message.signal {
      WatchSignal::Event(event) => self.apply_event(event).await,
      WatchSignal::RescanRequired { reason } => {
        self.rescan(ScanReason::Rescan { reason }).await;
      }
      WatchSignal::Error(error) => {
        let _ = self.updates.send(CacheUpdate::WatchError { error });
      }
    }
  }

  async fn apply_event(&mut self, event: WatchEvent) {
    let filter: Arc<dyn IgnoreFilter> = self.filter.load();
    let outcome = self.tree.apply(&event, filter.as_ref());

    match outcome {
      ApplyOutcome::Changed(change) => {
        debug!(event = %event, "Applied");
        let _ = self.updates.send(CacheUpdate::Changed(change));
      }
      ApplyOutcome::Unchanged => {
        trace!(event = %event, "Event left the tree unchanged");
      }
      ApplyOutcome::ContentModified(path) => {
        let _ = self.updates.send(CacheUpdate::ContentModified { path });
      }
      ApplyOutcome::NeedsRescan { reason, change } => {
        if let Some(change) = change {
          let _ = self.updates.send(CacheUpdate::Changed(change));
        }
        self.rescan(ScanReason::Rescan { reason }).await;
      }
      ApplyOutcome::RootDeleted => {
        let root = self.root.clone().unwrap_or_default();
        warn!(root = %root.display(), "Root deleted, clearing cache");
        self.teardown().await;
        let _ = self.updates.send(CacheUpdate::RootDeleted { root });
      }
    }
  }
}
