//! Lifecycle tests: set_root, scan failures, stop, shutdown and reconfiguration.

use std::path::PathBuf;
use std::time::Duration;

use dirmirror_core::{CacheState, CacheUpdate, ScanReason, WatcherConfig};
use pretty_assertions::assert_eq;
use tokio::{
  sync::{broadcast::error::TryRecvError, mpsc},
  time::{sleep, timeout},
};
use tokio_util::sync::CancellationToken;

use super::helpers::{CacheTestContext, TIMEOUT, assert_leaf_invariant, names, next_update};
use crate::filter::{GitignoreFilter, SharedFilter};
use crate::service::actor::CacheActor;
use crate::service::{CacheError, CacheService};
use crate::watcher::{WatchError, WatcherHandle, WatcherMessage};

#[tokio::test(flavor = "multi_thread")]
async fn test_initial_scan_builds_tree() {
  let ctx = CacheTestContext::new();
  ctx.write("a.txt", "a");
  ctx.mkdir("sub");

  let generation = ctx.start(&["*.log"]).await;

  let tree = ctx.cache.snapshot().expect("tree installed");
  assert_eq!(tree.path, ctx.root);
  assert_eq!(names(&tree), vec!["a.txt", "sub"]);

  let a = ctx.cache.find(ctx.path("a.txt")).expect("a.txt");
  assert!(!a.is_dir && !a.ignored);
  let sub = ctx.cache.find("sub").expect("sub");
  assert!(sub.is_dir && !sub.ignored);

  assert_eq!(
    ctx.cache.state(),
    CacheState::Ready {
      generation,
      watching: true
    }
  );
  assert_eq!(ctx.cache.root(), Some(ctx.root.clone()));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_ignored_directories_are_leaves() {
  let ctx = CacheTestContext::new();
  ctx.write("target/debug/out.bin", "x");
  ctx.write("src/main.rs", "fn main() {}");
  ctx.write("debug.log", "x");

  ctx.start(&["target/", "*.log"]).await;

  let target = ctx.cache.find("target").expect("target recorded");
  assert!(target.ignored);
  assert!(ctx.cache.find("target/debug").is_none());
  assert!(ctx.cache.find("debug.log").is_some_and(|node| node.ignored));
  assert!(ctx.cache.find("src/main.rs").is_some_and(|node| !node.ignored));

  assert_leaf_invariant(&ctx.root, &ctx.cache.snapshot().expect("tree"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_scan_reports_progress_and_completion() {
  let ctx = CacheTestContext::new();
  for i in 0..20 {
    ctx.write(&format!("f{i}.txt"), "x");
  }
  let mut updates = ctx.cache.subscribe();

  let generation = ctx.cache.set_root(&ctx.root, ["*.log"]).await.expect("set root");

  let started = next_update(&mut updates, |u| matches!(u, CacheUpdate::ScanStarted { .. })).await;
  assert_eq!(
    started,
    CacheUpdate::ScanStarted {
      generation,
      root: ctx.root.clone(),
      reason: ScanReason::SetRoot
    }
  );

  next_update(&mut updates, |u| matches!(u, CacheUpdate::ScanProgress { .. })).await;

  let replaced = next_update(&mut updates, |u| matches!(u, CacheUpdate::SnapshotReplaced { .. })).await;
  match replaced {
    CacheUpdate::SnapshotReplaced { generation: g, stats } => {
      assert_eq!(g, generation);
      assert_eq!(stats.files, 20);
      assert_eq!(stats.errors, 0);
    }
    other => panic!("expected SnapshotReplaced, got {other:?}"),
  }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_missing_root_goes_idle() {
  let ctx = CacheTestContext::new();
  let missing = ctx.path("does-not-exist");
  let mut updates = ctx.cache.subscribe();

  let generation = ctx.cache.set_root(&missing, Vec::<String>::new()).await.expect("set root");

  let failed = next_update(&mut updates, |u| matches!(u, CacheUpdate::ScanFailed { .. })).await;
  assert!(matches!(failed, CacheUpdate::ScanFailed { generation: g, .. } if g == generation));

  let state = timeout(TIMEOUT, ctx.cache.wait_for(|state| *state == CacheState::Idle))
    .await
    .expect("timeout")
    .expect("service alive");
  assert_eq!(state, CacheState::Idle);
  assert!(ctx.cache.snapshot().is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_file_root_goes_idle() {
  let ctx = CacheTestContext::new();
  let file = ctx.write("plain.txt", "x");
  let mut updates = ctx.cache.subscribe();

  ctx.cache.set_root(&file, Vec::<String>::new()).await.expect("set root");

  let failed = next_update(&mut updates, |u| matches!(u, CacheUpdate::ScanFailed { .. })).await;
  match failed {
    CacheUpdate::ScanFailed { error, .. } => assert!(error.contains("not a directory"), "{error}"),
    other => panic!("expected ScanFailed, got {other:?}"),
  }
  assert!(ctx.cache.snapshot().is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_invalid_patterns_are_rejected() {
  let ctx = CacheTestContext::new();
  ctx.write("a.txt", "a");

  let result = ctx.cache.set_root(&ctx.root, ["a{b"]).await;
  assert!(matches!(result, Err(CacheError::Filter(_))));
  assert_eq!(ctx.cache.state(), CacheState::Idle);
  assert!(ctx.cache.root().is_none());

  // A running cache keeps its patterns when an update is rejected
  ctx.mkdir("sub");
  ctx.start(&["*.log"]).await;
  let result = ctx.cache.update_ignore_patterns(["[z-a]"]).await;
  assert!(matches!(result, Err(CacheError::Filter(_))));
  assert!(ctx.cache.state().is_ready());

  ctx.write("sub/late.log", "x");
  ctx.wait_until("late.log inserted", |cache| cache.find("sub/late.log").is_some()).await;
  assert!(ctx.cache.find("sub/late.log").is_some_and(|node| node.ignored));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_operations_without_root() {
  let ctx = CacheTestContext::new();
  assert!(matches!(ctx.cache.rescan().await, Err(CacheError::NoRoot)));
  assert!(matches!(
    ctx.cache.update_ignore_patterns(["*.log"]).await,
    Err(CacheError::NoRoot)
  ));
  assert!(ctx.cache.find("anything").is_none());
  assert!(ctx.cache.snapshot().is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_root_is_canonicalized() {
  let ctx = CacheTestContext::new();
  ctx.mkdir("sub");
  ctx.write("a.txt", "a");

  let indirect = ctx.root.join("sub").join("..");
  let generation = ctx.cache.set_root(&indirect, ["*.log"]).await.expect("set root");
  ctx.wait_ready(generation).await;

  assert_eq!(ctx.cache.root(), Some(ctx.root.clone()));
  assert!(ctx.cache.find(ctx.path("a.txt")).is_some());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_set_root_replaces_previous_root() {
  let ctx = CacheTestContext::new();
  ctx.write("first/one.txt", "1");
  ctx.write("second/two.txt", "2");

  let first = ctx.cache.set_root(ctx.path("first"), ["*.log"]).await.expect("set first");
  ctx.wait_ready(first).await;
  assert!(ctx.cache.find("one.txt").is_some());

  let second = ctx.cache.set_root(ctx.path("second"), ["*.log"]).await.expect("set second");
  assert!(second > first);
  ctx.wait_ready(second).await;

  assert_eq!(ctx.cache.root(), Some(ctx.path("second")));
  assert!(ctx.cache.find("one.txt").is_none());
  assert!(ctx.cache.find("two.txt").is_some());

  // The old root is no longer watched
  ctx.write("first/late.txt", "x");
  ctx.write("second/marker.txt", "x");
  ctx.wait_until("marker in second root", |cache| cache.find("marker.txt").is_some()).await;
  assert!(ctx.cache.find("late.txt").is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_manual_rescan() {
  let ctx = CacheTestContext::new();
  ctx.write("a.txt", "a");
  let first = ctx.start(&["*.log"]).await;

  let mut updates = ctx.cache.subscribe();
  let second = ctx.cache.rescan().await.expect("rescan");
  assert!(second > first);

  let rescanning = next_update(&mut updates, |u| matches!(u, CacheUpdate::Rescanning { .. })).await;
  assert_eq!(
    rescanning,
    CacheUpdate::Rescanning {
      reason: "manual".to_string()
    }
  );

  ctx.wait_ready(second).await;
  assert!(ctx.exists("a.txt"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_update_patterns_applies_without_rescan() {
  let ctx = CacheTestContext::new();
  ctx.mkdir("sub");
  ctx.write("keep.tmp", "x");
  let generation = ctx.start(&[]).await;

  ctx.cache.update_ignore_patterns(["*.tmp"]).await.expect("update patterns");

  // Existing nodes keep the flag from the last scan
  assert!(ctx.cache.find("keep.tmp").is_some_and(|node| !node.ignored));

  ctx.write("sub/new.tmp", "x");
  ctx.wait_until("new.tmp inserted", |cache| cache.find("sub/new.tmp").is_some()).await;
  assert!(ctx.cache.find("sub/new.tmp").is_some_and(|node| node.ignored));
  assert_eq!(ctx.cache.state().generation(), Some(generation));

  // The next scan uses the new patterns everywhere
  let next = ctx.cache.rescan().await.expect("rescan");
  ctx.wait_ready(next).await;
  assert!(ctx.cache.find("keep.tmp").is_some_and(|node| node.ignored));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_stop_clears_everything() {
  let ctx = CacheTestContext::new();
  ctx.write("a.txt", "a");
  ctx.start(&[]).await;
  let mut updates = ctx.cache.subscribe();

  ctx.cache.stop().await.expect("stop");

  assert_eq!(ctx.cache.state(), CacheState::Idle);
  assert!(ctx.cache.snapshot().is_none());
  assert!(ctx.cache.root().is_none());
  next_update(&mut updates, |u| *u == CacheUpdate::Cleared).await;

  // Changes after stop are not tracked, and the service can be reused
  ctx.write("b.txt", "b");
  let generation = ctx.start(&[]).await;
  assert!(ctx.cache.state().is_ready_at(generation));
  assert!(ctx.exists("b.txt"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_shutdown_rejects_further_commands() {
  let ctx = CacheTestContext::new();
  ctx.start(&[]).await;

  let other = ctx.cache.clone();
  ctx.cache.shutdown().await.expect("shutdown");

  let result = other.set_root(PathBuf::from("/tmp"), Vec::<String>::new()).await;
  assert!(matches!(result, Err(CacheError::ActorGone)));
  assert!(other.snapshot().is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_set_root_during_scan_discards_stale_result() {
  let ctx = CacheTestContext::with_service(|mut config| {
    // Room for every progress notice of the abandoned scan
    config.service.update_buffer = 4096;
    CacheService::spawn(config)
  });
  ctx.populate("big", 200, 20);
  ctx.write("small/only.txt", "x");
  let mut updates = ctx.cache.subscribe();

  let first = ctx.cache.set_root(ctx.path("big"), ["*.log"]).await.expect("set big");
  let second = ctx.cache.set_root(ctx.path("small"), ["*.log"]).await.expect("set small");
  assert!(second > first);

  // Once the second scan has started, only its snapshot may be installed
  next_update(&mut updates, |u| {
    matches!(u, CacheUpdate::ScanStarted { generation, .. } if *generation == second)
  })
  .await;
  let replaced = next_update(&mut updates, |u| matches!(u, CacheUpdate::SnapshotReplaced { .. })).await;
  assert!(
    matches!(replaced, CacheUpdate::SnapshotReplaced { generation, .. } if generation == second),
    "{replaced:?}"
  );

  let state = ctx.wait_ready(second).await;
  assert_eq!(
    state,
    CacheState::Ready {
      generation: second,
      watching: true
    }
  );
  assert_eq!(ctx.cache.root(), Some(ctx.path("small")));
  let tree = ctx.cache.snapshot().expect("tree");
  assert_eq!(tree.path, ctx.path("small"));
  assert_eq!(names(&tree), vec!["only.txt"]);
  assert!(ctx.cache.find("d0000").is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_stop_during_scan_installs_nothing() {
  let ctx = CacheTestContext::with_service(|mut config| {
    // Room for every progress notice of the abandoned scan
    config.service.update_buffer = 4096;
    CacheService::spawn(config)
  });
  ctx.populate("big", 200, 20);
  let mut updates = ctx.cache.subscribe();

  ctx.cache.set_root(ctx.path("big"), ["*.log"]).await.expect("set root");
  ctx.cache.stop().await.expect("stop");

  assert_eq!(ctx.cache.state(), CacheState::Idle);
  assert!(ctx.cache.snapshot().is_none());
  assert!(ctx.cache.root().is_none());
  next_update(&mut updates, |u| *u == CacheUpdate::Cleared).await;

  // Give an abandoned scan time to report back
  sleep(Duration::from_millis(300)).await;
  loop {
    match updates.try_recv() {
      Ok(update) => assert!(
        !matches!(update, CacheUpdate::SnapshotReplaced { .. }),
        "snapshot installed after stop: {update:?}"
      ),
      Err(TryRecvError::Lagged(_)) => continue,
      Err(_) => break,
    }
  }
  assert_eq!(ctx.cache.state(), CacheState::Idle);
  assert!(ctx.cache.snapshot().is_none());
}

fn unavailable_watcher(
  _root: PathBuf,
  _generation: u64,
  _config: &WatcherConfig,
  _filter: SharedFilter,
  _tx: mpsc::Sender<WatcherMessage>,
) -> Result<WatcherHandle, WatchError> {
  Err(WatchError::Watch(notify::Error::generic("watch limit reached")))
}

#[tokio::test(flavor = "multi_thread")]
async fn test_watch_failure_keeps_tree_without_watching() {
  let ctx = CacheTestContext::with_service(|config| {
    CacheActor::spawn_with_watcher(
      config,
      GitignoreFilter::factory(Vec::new(), false),
      CancellationToken::new(),
      unavailable_watcher,
    )
  });
  ctx.write("a.txt", "a");
  let mut updates = ctx.cache.subscribe();

  let generation = ctx.cache.set_root(&ctx.root, ["*.log"]).await.expect("set root");

  let degraded = next_update(&mut updates, |u| matches!(u, CacheUpdate::WatchDegraded { .. })).await;
  match degraded {
    CacheUpdate::WatchDegraded { error } => assert!(error.contains("watch limit reached"), "{error}"),
    other => panic!("expected WatchDegraded, got {other:?}"),
  }
  let replaced = next_update(&mut updates, |u| matches!(u, CacheUpdate::SnapshotReplaced { .. })).await;
  assert!(matches!(replaced, CacheUpdate::SnapshotReplaced { generation: g, .. } if g == generation));

  assert_eq!(
    ctx.wait_ready(generation).await,
    CacheState::Ready {
      generation,
      watching: false
    }
  );
  assert!(ctx.exists("a.txt"));

  // Without a watcher only a rescan picks up changes
  ctx.write("b.txt", "b");
  let next = ctx.cache.rescan().await.expect("rescan");
  ctx.wait_ready(next).await;
  assert!(ctx.exists("b.txt"));
  assert_eq!(
    ctx.cache.state(),
    CacheState::Ready {
      generation: next,
      watching: false
    }
  );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cancel_token_stops_service() {
  let cancel = CancellationToken::new();
  let token = cancel.clone();
  let ctx = CacheTestContext::with_service(move |config| {
    CacheService::spawn_with_cancel(config, GitignoreFilter::factory(Vec::new(), false), token)
  });
  ctx.write("a.txt", "a");
  ctx.start(&[]).await;

  cancel.cancel();

  let result = timeout(TIMEOUT, ctx.cache.wait_for(|_| false)).await.expect("timeout");
  assert!(matches!(result, Err(CacheError::ActorGone)));
  assert!(ctx.cache.snapshot().is_none());
  assert!(matches!(ctx.cache.rescan().await, Err(CacheError::ActorGone)));
}
