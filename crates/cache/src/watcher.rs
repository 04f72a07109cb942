//! WatcherTask - recursive OS watch that feeds semantic events to the cache
//!
//! # Design
//!
//! The watcher bridges notify's sync callback with the async cache service:
//! 1. notify's callback uses `blocking_send` to forward raw events to a channel
//! 2. The async task translates raw events into [`WatchEvent`]s
//! 3. Rename halves are paired by their tracker cookie within a short window
//! 4. Translated events are tagged with the generation the watch was started
//!    for, so the service can drop anything belonging to an older root
//!
//! Events are never coalesced across paths and are forwarded in OS order.
//!
//! # Lifecycle
//!
//! The watcher runs until:
//! - The `CancellationToken` is triggered
//! - The raw event channel closes (notify watcher dropped)
//! - The service stops listening

use std::{
  collections::VecDeque,
  fs,
  path::{Path, PathBuf},
  time::{Duration, Instant},
};

use dirmirror_core::{WatchEvent, WatcherConfig};
use notify::{
  Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher,
  event::{CreateKind, ModifyKind, RenameMode},
};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::filter::{SharedFilter, is_shadowed};

// Paired cookies kept around to swallow the trailing `RenameMode::Both`
const PAIRED_COOKIE_HISTORY: usize = 64;

// ============================================================================
// Messages and Errors
// ============================================================================

/// Message from a watcher task to the cache service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatcherMessage {
  /// Generation the watch was started for
  pub generation: u64,
  pub signal: WatchSignal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchSignal {
  Event(WatchEvent),
  /// The OS dropped events; the tree can no longer be trusted
  RescanRequired { reason: String },
  /// Non-fatal backend error
  Error(String),
}

/// Errors that can occur when starting the watcher
#[derive(Debug, thiserror::Error)]
pub enum WatchError {
  #[error("Failed to initialize watcher: {0}")]
  Init(#[source] notify::Error),

  #[error("Failed to watch path: {0}")]
  Watch(#[source] notify::Error),
}

// ============================================================================
// Event Translation
// ============================================================================

/// A rename-from waiting for its rename-to
#[derive(Debug)]
struct PendingFrom {
  tracker: Option<usize>,
  path: PathBuf,
  deadline: Instant,
}

/// Turns raw notify events into filtered [`WatchEvent`]s.
///
/// Holds no OS resources, so it can be driven directly with synthetic events.
#[derive(Debug)]
pub struct EventTranslator {
  root: PathBuf,
  filter: SharedFilter,
  rename_window: Duration,
  pending: VecDeque<PendingFrom>,
  paired: VecDeque<usize>,
}

impl EventTranslator {
  pub fn new(root: impl Into<PathBuf>, filter: SharedFilter, rename_window: Duration) -> Self {
    Self {
      root: root.into(),
      filter,
      rename_window,
      pending: VecDeque::new(),
      paired: VecDeque::new(),
    }
  }

  /// Earliest moment an unpaired rename-from turns into a delete
  pub fn next_deadline(&self) -> Option<Instant> {
    self.pending.iter().map(|from| from.deadline).min()
  }

  /// Report rename-froms whose window has passed as deletes
  pub fn flush_expired(&mut self, now: Instant) -> Vec<WatchSignal> {
    let mut out = Vec::new();
    let mut kept = VecDeque::with_capacity(self.pending.len());
    for from in std::mem::take(&mut self.pending) {
      if from.deadline <= now {
        trace!(path = %from.path.display(), "Rename window expired, treating as delete");
        self.emit(WatchEvent::Deleted { path: from.path }, &mut out);
      } else {
        kept.push_back(from);
      }
    }
    self.pending = kept;
    out
  }

  /// Translate one raw event. May also release earlier rename-froms.
  pub fn translate(&mut self, event: Event, now: Instant) -> Vec<WatchSignal> {
    let mut out = self.flush_expired(now);

    if event.need_rescan() {
      // The rescan supersedes anything still waiting for a partner
      self.pending.clear();
      warn!(root = %self.root.display(), "Watcher requested rescan");
      out.push(WatchSignal::RescanRequired {
        reason: "watcher event queue overflowed".to_string(),
      });
      return out;
    }

    let tracker = event.tracker();
    match event.kind {
      EventKind::Create(kind) => {
        for path in event.paths {
          self.flush_touching(&path, &mut out);
          let is_dir = match kind {
            CreateKind::Folder => true,
            CreateKind::File => false,
            _ => is_dir_on_disk(&path),
          };
          self.emit(WatchEvent::Created { path, is_dir }, &mut out);
        }
      }
      EventKind::Remove(_) => {
        for path in event.paths {
          self.flush_touching(&path, &mut out);
          self.emit(WatchEvent::Deleted { path }, &mut out);
        }
      }
      EventKind::Modify(ModifyKind::Name(mode)) => self.translate_rename(mode, tracker, event.paths, now, &mut out),
      EventKind::Modify(ModifyKind::Metadata(_)) => {
        trace!(paths = ?event.paths, "Ignoring metadata change");
      }
      EventKind::Modify(_) => {
        for path in event.paths {
          self.flush_touching(&path, &mut out);
          if is_dir_on_disk(&path) {
            continue;
          }
          self.emit(WatchEvent::Modified { path }, &mut out);
        }
      }
      EventKind::Access(_) | EventKind::Any | EventKind::Other => {
        trace!(kind = ?event.kind, "Ignoring event");
      }
    }

    out
  }

  fn translate_rename(
    &mut self,
    mode: RenameMode,
    tracker: Option<usize>,
    paths: Vec<PathBuf>,
    now: Instant,
    out: &mut Vec<WatchSignal>,
  ) {
    match mode {
      RenameMode::From => {
        for path in paths {
          self.flush_touching(&path, out);
          self.pending.push_back(PendingFrom {
            tracker,
            path,
            deadline: now + self.rename_window,
          });
        }
      }
      RenameMode::To => {
        for to in paths {
          let partner = self.take_partner(tracker);
          self.flush_touching(&to, out);
          let is_dir = is_dir_on_disk(&to);
          match partner {
            Some(from) => {
              if let Some(cookie) = tracker {
                self.remember_paired(cookie);
              }
              self.emit(WatchEvent::Moved { from, to, is_dir }, out);
            }
            None => self.emit(WatchEvent::Created { path: to, is_dir }, out),
          }
        }
      }
      RenameMode::Both => {
        let mut paths = paths.into_iter();
        let (Some(from), Some(to)) = (paths.next(), paths.next()) else {
          debug!("Rename event without both paths, ignoring");
          return;
        };
        if let Some(cookie) = tracker
          && self.forget_paired(cookie)
        {
          trace!(cookie, "Rename already reported from its halves");
          return;
        }
        // A half we were still holding is superseded by the full event
        if tracker.is_some() {
          let _ = self.take_partner(tracker);
        }
        self.flush_touching(&from, out);
        self.flush_touching(&to, out);
        let is_dir = is_dir_on_disk(&to);
        self.emit(WatchEvent::Moved { from, to, is_dir }, out);
      }
      RenameMode::Any | RenameMode::Other => {
        // No pairing information; whichever side exists now decides
        for path in paths {
          self.flush_touching(&path, out);
          match fs::symlink_metadata(&path) {
            Ok(metadata) => {
              let is_dir = metadata.is_dir();
              self.emit(WatchEvent::Created { path, is_dir }, out);
            }
            Err(_) => self.emit(WatchEvent::Deleted { path }, out),
          }
        }
      }
    }
  }

  /// Remove and return the held rename-from matching `tracker`
  fn take_partner(&mut self, tracker: Option<usize>) -> Option<PathBuf> {
    let index = match tracker {
      Some(_) => self.pending.iter().position(|from| from.tracker == tracker),
      // Untracked halves pair with the most recent untracked from
      None => self.pending.iter().rposition(|from| from.tracker.is_none()),
    }?;
    self.pending.remove(index).map(|from| from.path)
  }

  /// Release held rename-froms for `path` as deletes, keeping per-path order
  fn flush_touching(&mut self, path: &Path, out: &mut Vec<WatchSignal>) {
    while let Some(index) = self.pending.iter().position(|from| from.path == path) {
      if let Some(from) = self.pending.remove(index) {
        self.emit(WatchEvent::Deleted { path: from.path }, out);
      }
    }
  }

  fn remember_paired(&mut self, cookie: usize) {
    if self.paired.len() >= PAIRED_COOKIE_HISTORY {
      self.paired.pop_front();
    }
    self.paired.push_back(cookie);
  }

  fn forget_paired(&mut self, cookie: usize) -> bool {
    match self.paired.iter().position(|&c| c == cookie) {
      Some(index) => {
        self.paired.remove(index);
        true
      }
      None => false,
    }
  }

  /// Apply root and ignore rules, then queue the event
  fn emit(&self, event: WatchEvent, out: &mut Vec<WatchSignal>) {
    if let Some(event) = self.filter_event(event) {
      debug!(event = %event, "Watch event");
      out.push(WatchSignal::Event(event));
    }
  }

  fn filter_event(&self, event: WatchEvent) -> Option<WatchEvent> {
    let filter = self.filter.load();
    let visible = |path: &Path| path.starts_with(&self.root) && !is_shadowed(filter.as_ref(), &self.root, path);

    match event {
      WatchEvent::Created { ref path, .. } | WatchEvent::Deleted { ref path } => visible(path).then_some(event),
      WatchEvent::Modified { ref path } => {
        (visible(path) && !filter.should_ignore(path, false)).then_some(event)
      }
      WatchEvent::Moved { from, to, is_dir } => match (visible(&from), visible(&to)) {
        (true, true) => {
          if filter.should_ignore(&from, is_dir) && filter.should_ignore(&to, is_dir) {
            trace!(from = %from.display(), to = %to.display(), "Dropping move between ignored paths");
            return None;
          }
          Some(WatchEvent::Moved { from, to, is_dir })
        }
        // Moved out of view: gone as far as the tree is concerned
        (true, false) => Some(WatchEvent::Deleted { path: from }),
        // Moved into view from somewhere untracked
        (false, true) => Some(WatchEvent::Created { path: to, is_dir }),
        (false, false) => None,
      },
    }
  }
}

fn is_dir_on_disk(path: &Path) -> bool {
  fs::symlink_metadata(path).is_ok_and(|metadata| metadata.is_dir())
}

// ============================================================================
// WatcherTask
// ============================================================================

/// Async task owning the OS watch for one root generation
pub struct WatcherTask {
  root: PathBuf,
  generation: u64,
  translator: EventTranslator,
  tx: mpsc::Sender<WatcherMessage>,
  cancel: CancellationToken,
  // Declared before the watcher so it drops first and unblocks notify's callback
  raw_rx: mpsc::Receiver<Result<Event, notify::Error>>,
  // The notify watcher must be held to keep it alive
  _watcher: RecommendedWatcher,
}

impl WatcherTask {
  /// Start watching `root` recursively. The task is not run until `run()` is called.
  pub fn new(
    root: PathBuf,
    generation: u64,
    config: &WatcherConfig,
    filter: SharedFilter,
    tx: mpsc::Sender<WatcherMessage>,
    cancel: CancellationToken,
  ) -> Result<Self, WatchError> {
    info!(root = %root.display(), generation, "Initializing file watcher");

    let (raw_tx, raw_rx) = mpsc::channel::<Result<Event, notify::Error>>(config.event_buffer.max(1));
    let notify_config = Config::default().with_poll_interval(config.poll_interval());

    let mut watcher = RecommendedWatcher::new(
      move |res| {
        // Runs on notify's thread; a closed channel means the task is gone
        let _ = raw_tx.blocking_send(res);
      },
      notify_config,
    )
    .map_err(WatchError::Init)?;

    watcher
      .watch(&root, RecursiveMode::Recursive)
      .map_err(WatchError::Watch)?;

    let translator = EventTranslator::new(root.clone(), filter, config.rename_window());

    Ok(Self {
      root,
      generation,
      translator,
      tx,
      cancel,
      raw_rx,
      _watcher: watcher,
    })
  }

  /// Start watching and spawn the task
  pub fn spawn(
    root: PathBuf,
    generation: u64,
    config: &WatcherConfig,
    filter: SharedFilter,
    tx: mpsc::Sender<WatcherMessage>,
  ) -> Result<WatcherHandle, WatchError> {
    let cancel = CancellationToken::new();
    let task = Self::new(root, generation, config, filter, tx, cancel.clone())?;
    Ok(WatcherHandle {
      cancel,
      task: Some(tokio::spawn(task.run())),
    })
  }

  /// Run until cancelled or either channel closes
  pub async fn run(mut self) {
    info!(root = %self.root.display(), generation = self.generation, "WatcherTask started");

    loop {
      let deadline = self.translator.next_deadline();

      tokio::select! {
        biased;

        _ = self.cancel.cancelled() => {
          debug!("WatcherTask shutting down (cancelled)");
          break;
        }

        raw = self.raw_rx.recv() => {
          let signals = match raw {
            Some(Ok(event)) => self.translator.translate(event, Instant::now()),
            Some(Err(e)) => {
              warn!(error = %e, "Watcher error");
              vec![WatchSignal::Error(e.to_string())]
            }
            None => {
              info!("WatcherTask shutting down (channel closed)");
              break;
            }
          };
          if !self.forward(signals).await {
            break;
          }
        }

        _ = sleep_until(deadline) => {
          let signals = self.translator.flush_expired(Instant::now());
          if !self.forward(signals).await {
            break;
          }
        }
      }
    }

    info!(root = %self.root.display(), generation = self.generation, "WatcherTask stopped");
  }

  /// Send signals to the service. Returns false once the task should stop.
  async fn forward(&self, signals: Vec<WatchSignal>) -> bool {
    for signal in signals {
      let message = WatcherMessage {
        generation: self.generation,
        signal,
      };
      tokio::select! {
        biased;
        _ = self.cancel.cancelled() => return false,
        sent = self.tx.send(message) => {
          if sent.is_err() {
            debug!("Cache service gone, stopping watcher");
            return false;
          }
        }
      }
    }
    true
  }
}

async fn sleep_until(deadline: Option<Instant>) {
  match deadline {
    Some(deadline) => tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await,
    None => std::future::pending().await,
  }
}

/// Handle used by the service to stop a running watcher
#[derive(Debug)]
pub struct WatcherHandle {
  cancel: CancellationToken,
  task: Option<JoinHandle<()>>,
}

impl WatcherHandle {
  /// Cancel the task and wait until the OS watch is released
  pub async fn stop(mut self) {
    self.cancel.cancel();
    if let Some(task) = self.task.take()
      && let Err(e) = task.await
    {
      warn!(error = %e, "Watcher task ended abnormally");
    }
  }
}

impl Drop for WatcherHandle {
  fn drop(&mut self) {
    self.cancel.cancel();
  }
}
