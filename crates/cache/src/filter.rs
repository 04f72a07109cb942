//! Ignore predicate consumed by the scanner, watcher and cache service.
//!
//! The cache does not care how patterns are matched, only that it can ask
//! "should this path be hidden?". [`GitignoreFilter`] is the default answer,
//! compiled once per root generation with the `ignore` crate.

use std::fmt;
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};

use ignore::gitignore::{Gitignore, GitignoreBuilder};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum FilterError {
  #[error("Invalid ignore pattern: {0}")]
  Pattern(#[from] ignore::Error),
}

/// Decides whether a path is hidden from the cache.
pub trait IgnoreFilter: Send + Sync {
  fn should_ignore(&self, path: &Path, is_dir: bool) -> bool;
}

impl<F> IgnoreFilter for F
where
  F: Fn(&Path, bool) -> bool + Send + Sync,
{
  fn should_ignore(&self, path: &Path, is_dir: bool) -> bool {
    self(path, is_dir)
  }
}

/// Builds the filter for a root and its pattern set.
pub type FilterFactory = Arc<dyn Fn(&Path, &[String]) -> Result<Arc<dyn IgnoreFilter>, FilterError> + Send + Sync>;

// ============================================================================
// Gitignore Filter
// ============================================================================

/// Gitignore-style matcher rooted at a directory.
///
/// Supports basename globs (`*.log`), root-relative globs (`/build`,
/// `docs/*.md`), directory-only patterns (`target/`) and negation (`!keep.log`).
/// The root itself and paths outside the root are never ignored.
pub struct GitignoreFilter {
  root: std::path::PathBuf,
  matcher: Gitignore,
}

impl GitignoreFilter {
  /// Compile `patterns` for `root`, optionally layering `<root>/.gitignore` underneath.
  pub fn new<S: AsRef<str>>(root: &Path, patterns: &[S], respect_gitignore: bool) -> Result<Self, FilterError> {
    let mut builder = GitignoreBuilder::new(root);

    if respect_gitignore {
      let gitignore_path = root.join(".gitignore");
      if gitignore_path.exists()
        && let Some(err) = builder.add(&gitignore_path)
      {
        warn!(error = %err, "Error parsing .gitignore, continuing with partial rules");
      }
    }

    // Explicit patterns come last so they take precedence
    for pattern in patterns {
      builder.add_line(None, pattern.as_ref())?;
    }

    let matcher = builder.build()?;
    debug!(
      root = %root.display(),
      patterns = matcher.num_ignores() + matcher.num_whitelists(),
      "Ignore matcher built"
    );

    Ok(Self {
      root: root.to_path_buf(),
      matcher,
    })
  }

  /// Factory producing a `GitignoreFilter` with `always` prepended to every pattern set.
  pub fn factory(always: Vec<String>, respect_gitignore: bool) -> FilterFactory {
    Arc::new(move |root: &Path, patterns: &[String]| {
      let combined: Vec<&str> = always.iter().chain(patterns).map(String::as_str).collect();
      let filter = GitignoreFilter::new(root, &combined, respect_gitignore)?;
      Ok(Arc::new(filter) as Arc<dyn IgnoreFilter>)
    })
  }
}

impl IgnoreFilter for GitignoreFilter {
  fn should_ignore(&self, path: &Path, is_dir: bool) -> bool {
    let Ok(relative) = path.strip_prefix(&self.root) else {
      return false;
    };
    if relative.as_os_str().is_empty() {
      return false;
    }
    self.matcher.matched(relative, is_dir).is_ignore()
  }
}

impl fmt::Debug for GitignoreFilter {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("GitignoreFilter")
      .field("root", &self.root)
      .field("ignores", &self.matcher.num_ignores())
      .finish()
  }
}

/// True when some directory strictly between `root` and `path` is ignored.
///
/// Entries inside an ignored directory are never part of the tree, so events
/// for them carry no information.
pub fn is_shadowed(filter: &dyn IgnoreFilter, root: &Path, path: &Path) -> bool {
  if !path.starts_with(root) {
    return false;
  }
  path
    .ancestors()
    .skip(1)
    .take_while(|ancestor| *ancestor != root)
    .any(|ancestor| filter.should_ignore(ancestor, true))
}

// ============================================================================
// Shared Filter
// ============================================================================

/// Swappable filter shared between the service and a live watcher.
#[derive(Clone)]
pub struct SharedFilter {
  inner: Arc<RwLock<Arc<dyn IgnoreFilter>>>,
}

impl SharedFilter {
  pub fn new(filter: Arc<dyn IgnoreFilter>) -> Self {
    Self {
      inner: Arc::new(RwLock::new(filter)),
    }
  }

  /// A filter that ignores nothing.
  pub fn allow_all() -> Self {
    Self::new(Arc::new(|_: &Path, _: bool| false))
  }

  /// Current filter. Callers hold the returned `Arc`, not the lock.
  pub fn load(&self) -> Arc<dyn IgnoreFilter> {
    self.inner.read().unwrap_or_else(PoisonError::into_inner).clone()
  }

  pub fn store(&self, filter: Arc<dyn IgnoreFilter>) {
    *self.inner.write().unwrap_or_else(PoisonError::into_inner) = filter;
  }
}

impl fmt::Debug for SharedFilter {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("SharedFilter").finish_non_exhaustive()
  }
}
