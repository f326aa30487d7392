//! Integration tests for source activation and the startup sequence.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reconcile_rs::queue::{PriorityQueue, PriorityWorkQueue, default_controller_rate_limiter};
use reconcile_rs::source::{Channel, QueueRef};
use reconcile_rs::{
    BoxError, Context, Controller, Error, Options, ReconcileError, ReconcileResult, Source,
    SyncingSource, reconcile_fn,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// Test sources
// ---------------------------------------------------------------------------

/// Starts instantly; sync takes `sync_delay` (or forever).
struct Syncing {
    name: &'static str,
    sync_delay: Option<Duration>,
    starts: Arc<AtomicUsize>,
}

impl Syncing {
    fn new(name: &'static str, sync_delay: Option<Duration>) -> (Self, Arc<AtomicUsize>) {
        let starts = Arc::new(AtomicUsize::new(0));
        let source = Self {
            name,
            sync_delay,
            starts: Arc::clone(&starts),
        };
        (source, starts)
    }
}

#[async_trait]
impl Source<String> for Syncing {
    async fn start(
        &self,
        _ctx: CancellationToken,
        _queue: QueueRef<String>,
    ) -> Result<(), BoxError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn as_syncing(&self) -> Option<&dyn SyncingSource<String>> {
        Some(self)
    }

    fn name(&self) -> String {
        self.name.to_string()
    }
}

#[async_trait]
impl SyncingSource<String> for Syncing {
    async fn wait_for_sync(&self, ctx: CancellationToken) -> Result<(), BoxError> {
        let Some(delay) = self.sync_delay else {
            ctx.cancelled().await;
            return Err("sync aborted".into());
        };
        tokio::select! {
            _ = tokio::time::sleep(delay) => Ok(()),
            _ = ctx.cancelled() => Err("sync aborted".into()),
        }
    }
}

/// `start` never returns.
struct Blocking;

#[async_trait]
impl Source<String> for Blocking {
    async fn start(
        &self,
        _ctx: CancellationToken,
        _queue: QueueRef<String>,
    ) -> Result<(), BoxError> {
        std::future::pending::<()>().await;
        Ok(())
    }

    fn name(&self) -> String {
        "blocking".to_string()
    }
}

struct Failing;

#[async_trait]
impl Source<String> for Failing {
    async fn start(
        &self,
        _ctx: CancellationToken,
        _queue: QueueRef<String>,
    ) -> Result<(), BoxError> {
        Err("connection refused".into())
    }

    fn name(&self) -> String {
        "failing".to_string()
    }
}

fn test_controller(timeout: Duration, warmup: bool) -> Controller<String> {
    let reconciler = reconcile_fn(|_ctx: Context, _key: String| async {
        Ok::<_, ReconcileError>(ReconcileResult::done())
    });
    Controller::new(
        Options::new("startup-test", reconciler)
            .cache_sync_timeout(timeout)
            .enable_warmup(warmup),
    )
    .unwrap()
}

async fn run_until_err(controller: &Controller<String>) -> reconcile_rs::Result<()> {
    let ctx = CancellationToken::new();
    let _guard = ctx.clone().drop_guard();
    tokio::time::timeout(Duration::from_secs(2), controller.start(ctx))
        .await
        .expect("start should fail well before the test timeout")
}

// ---------------------------------------------------------------------------
// Sync timeouts and start failures
// ---------------------------------------------------------------------------

#[tokio::test]
async fn slow_sync_fails_startup_naming_the_source() {
    let controller = test_controller(Duration::from_millis(50), false);
    let (slow, _) = Syncing::new("slow-cache", None);
    let (fast, fast_starts) = Syncing::new("fast-cache", Some(Duration::from_millis(5)));
    controller.watch(slow).await.unwrap();
    controller.watch(fast).await.unwrap();

    let err = run_until_err(&controller).await.unwrap_err();
    match &err {
        Error::SourceSync { controller, name, .. } => {
            assert_eq!(controller, "startup-test");
            assert_eq!(name, "slow-cache");
        }
        other => panic!("expected SourceSync, got {other:?}"),
    }
    assert!(err.to_string().contains("slow-cache"));
    assert_eq!(fast_starts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn blocking_start_times_out() {
    let controller = test_controller(Duration::from_millis(50), false);
    controller.watch(Blocking).await.unwrap();

    let err = run_until_err(&controller).await.unwrap_err();
    assert!(matches!(&err, Error::SourceTimeout { name } if name == "blocking"));
    assert!(err.to_string().contains("non-blocking"));
}

#[tokio::test]
async fn start_error_is_reported() {
    let controller = test_controller(Duration::from_secs(5), false);
    controller.watch(Failing).await.unwrap();

    let err = run_until_err(&controller).await.unwrap_err();
    assert!(matches!(&err, Error::SourceStart { name, .. } if name == "failing"));
    assert!(err.to_string().contains("connection refused"));
}

#[tokio::test]
async fn cancellation_during_sync_is_not_an_error() {
    let controller = test_controller(Duration::from_secs(30), false);
    let (slow, _) = Syncing::new("slow-cache", None);
    controller.watch(slow).await.unwrap();

    let ctx = CancellationToken::new();
    let run = {
        let controller = controller.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move { controller.start(ctx).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    ctx.cancel();

    let result = tokio::time::timeout(Duration::from_secs(2), run)
        .await
        .expect("start should return after cancellation")
        .unwrap();
    assert!(result.is_ok(), "{result:?}");
}

// ---------------------------------------------------------------------------
// Warmup
// ---------------------------------------------------------------------------

#[tokio::test]
async fn warmup_then_start_activates_sources_once() {
    let controller = test_controller(Duration::from_secs(5), true);
    let (source, starts) = Syncing::new("cache", Some(Duration::from_millis(5)));
    controller.watch(source).await.unwrap();

    let ctx = CancellationToken::new();
    controller.warmup(ctx.clone()).await.unwrap();
    assert_eq!(starts.load(Ordering::SeqCst), 1);
    assert!(controller.queue().is_some());
    assert!(!controller.is_started());

    let run = {
        let controller = controller.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move { controller.start(ctx).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(controller.is_started());
    assert_eq!(starts.load(Ordering::SeqCst), 1);

    ctx.cancel();
    run.await.unwrap().unwrap();
}

#[tokio::test]
async fn warmup_is_noop_unless_enabled() {
    let controller = test_controller(Duration::from_secs(5), false);
    let (source, starts) = Syncing::new("cache", Some(Duration::from_millis(5)));
    controller.watch(source).await.unwrap();

    controller.warmup(CancellationToken::new()).await.unwrap();
    assert_eq!(starts.load(Ordering::SeqCst), 0);
    assert!(controller.queue().is_none());
}

#[tokio::test]
async fn concurrent_warmup_and_start_activate_once() {
    let controller = test_controller(Duration::from_secs(5), true);
    let (source, starts) = Syncing::new("cache", Some(Duration::from_millis(30)));
    controller.watch(source).await.unwrap();

    let ctx = CancellationToken::new();
    let run = {
        let controller = controller.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move { controller.start(ctx).await })
    };
    controller.warmup(ctx.clone()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(starts.load(Ordering::SeqCst), 1);

    ctx.cancel();
    run.await.unwrap().unwrap();
}

// ---------------------------------------------------------------------------
// Watches registered after activation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn late_watch_starts_immediately() {
    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let reconciler = {
        let seen = Arc::clone(&seen);
        reconcile_fn(move |_ctx: Context, key: String| {
            let seen = Arc::clone(&seen);
            async move {
                seen.lock().unwrap().push(key);
                Ok::<_, ReconcileError>(ReconcileResult::done())
            }
        })
    };
    let controller: Controller<String> =
        Controller::new(Options::new("late-watch", reconciler)).unwrap();

    let ctx = CancellationToken::new();
    let run = {
        let controller = controller.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move { controller.start(ctx).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let (tx, rx) = mpsc::channel(8);
    controller.watch(Channel::new("late", rx)).await.unwrap();
    tx.send("x".to_string()).await.unwrap();

    for _ in 0..50 {
        if !seen.lock().unwrap().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(*seen.lock().unwrap(), vec!["x".to_string()]);

    ctx.cancel();
    run.await.unwrap().unwrap();
}

// ---------------------------------------------------------------------------
// Channel source
// ---------------------------------------------------------------------------

#[tokio::test]
async fn channel_forwards_items_with_priority() {
    let queue: QueueRef<String> = Arc::new(PriorityWorkQueue::new(
        "channel-test",
        default_controller_rate_limiter(),
    ));
    let (tx, rx) = mpsc::channel(8);
    let source = Channel::new("updates", rx).with_priority(7);
    assert_eq!(Source::<String>::name(&source), "channel(updates)");

    let ctx = CancellationToken::new();
    source.start(ctx.clone(), Arc::clone(&queue)).await.unwrap();
    tx.send("a".to_string()).await.unwrap();

    let got = tokio::time::timeout(Duration::from_millis(500), queue.get_with_priority())
        .await
        .unwrap();
    assert_eq!(got, Some(("a".to_string(), 7)));
    ctx.cancel();
}

#[tokio::test]
async fn channel_cannot_start_twice() {
    let queue: QueueRef<String> = Arc::new(PriorityWorkQueue::new(
        "channel-test",
        default_controller_rate_limiter(),
    ));
    let (_tx, rx) = mpsc::channel::<String>(8);
    let source = Channel::new("updates", rx);
    let ctx = CancellationToken::new();

    source.start(ctx.clone(), Arc::clone(&queue)).await.unwrap();
    assert!(source.start(ctx.clone(), queue).await.is_err());
    ctx.cancel();
}
