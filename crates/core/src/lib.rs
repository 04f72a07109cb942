//! Shared data model and configuration for the directory cache.

pub mod config;
pub mod event;
pub mod node;

pub use config::{Config, ConfigError, IgnoreConfig, ScanConfig, ServiceConfig, WatcherConfig};
pub use event::{CacheState, CacheUpdate, ChangeDescriptor, ScanProgress, ScanReason, ScanStats, WatchEvent};
pub use node::{CacheNode, NodeCounts, entry_name};
