//! In-memory mirror of a directory tree, kept current by a filesystem watcher.
//!
//! - [`scanner`]: cancellable one-shot walk producing a [`CacheNode`] tree
//! - [`watcher`]: recursive OS watch translated into [`WatchEvent`]s
//! - [`filter`]: gitignore-style ignore predicate
//! - [`service`]: actor tying the three together behind a [`CacheHandle`]

pub mod filter;
pub mod scanner;
pub mod service;
pub mod watcher;

pub use dirmirror_core::{
  CacheNode, CacheState, CacheUpdate, ChangeDescriptor, Config, ConfigError, IgnoreConfig, NodeCounts, ScanConfig,
  ScanProgress, ScanReason, ScanStats, ServiceConfig, WatchEvent, WatcherConfig,
};
pub use filter::{FilterError, FilterFactory, GitignoreFilter, IgnoreFilter, SharedFilter};
pub use scanner::{ScanError, ScanNotice, ScanOutcome, Scanner};
pub use service::{CacheError, CacheHandle, CacheService};
pub use watcher::{EventTranslator, WatchError, WatchSignal, WatcherHandle, WatcherMessage, WatcherTask};
