//! Controller: lifecycle, worker pool, reconcile handling.
//!
//! A controller owns a set of sources, a queue built on activation, and a
//! fixed pool of workers that drain the queue into the reconciler. Sources
//! are activated exactly once, either early through [`Controller::warmup`]
//! or by [`Controller::start`]. `start` blocks until the root token is
//! cancelled and every worker has finished its current item.

mod startup;

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use futures::FutureExt as _;
use tokio::sync::OnceCell;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, error, info, warn};

use crate::config::{
    ControllerConfig, DEFAULT_CACHE_SYNC_TIMEOUT, DEFAULT_MAX_CONCURRENT_RECONCILES,
};
use crate::error::{Error, Result};
use crate::queue::{
    AddOpts, NewQueueFn, PriorityQueue, RateLimiter, default_controller_rate_limiter,
    default_new_queue,
};
use crate::reconcile::{
    Context, ReconcileError, ReconcileId, ReconcileResult, Reconciler, Request,
};
use crate::source::Source;
use crate::telemetry::metrics::{
    ControllerMetrics, RESULT_ERROR, RESULT_REQUEUE, RESULT_REQUEUE_AFTER, RESULT_SUCCESS,
};
use crate::telemetry::reconcile::{controller_span, record_result, start_reconcile_span};

/// Builds the span used as the controller's logger. Called with `None`
/// outside of a reconcile.
pub type LogConstructor<K> = Arc<dyn Fn(Option<&K>) -> Span + Send + Sync>;

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// Arguments for creating a [`Controller`].
pub struct Options<K: Request> {
    name: String,
    reconciler: Arc<dyn Reconciler<K>>,
    rate_limiter: Option<Arc<dyn RateLimiter<K>>>,
    new_queue: Option<NewQueueFn<K>>,
    log_constructor: Option<LogConstructor<K>>,
    max_concurrent_reconciles: usize,
    cache_sync_timeout: Duration,
    recover_panic: bool,
    leader_elected: bool,
    enable_warmup: bool,
}

impl<K: Request> Options<K> {
    pub fn new(name: impl Into<String>, reconciler: impl Reconciler<K> + 'static) -> Self {
        Self::with_reconciler(name, Arc::new(reconciler))
    }

    pub fn with_reconciler(name: impl Into<String>, reconciler: Arc<dyn Reconciler<K>>) -> Self {
        Self {
            name: name.into(),
            reconciler,
            rate_limiter: None,
            new_queue: None,
            log_constructor: None,
            max_concurrent_reconciles: DEFAULT_MAX_CONCURRENT_RECONCILES,
            cache_sync_timeout: DEFAULT_CACHE_SYNC_TIMEOUT,
            recover_panic: true,
            leader_elected: true,
            enable_warmup: false,
        }
    }

    /// Copy declarative settings from a [`ControllerConfig`].
    pub fn from_config(config: &ControllerConfig, reconciler: Arc<dyn Reconciler<K>>) -> Self {
        Self::with_reconciler(config.name.clone(), reconciler)
            .max_concurrent_reconciles(config.max_concurrent_reconciles)
            .cache_sync_timeout(config.cache_sync_timeout())
            .recover_panic(config.recover_panic)
            .leader_elected(config.leader_elected)
            .enable_warmup(config.enable_warmup)
    }

    pub fn rate_limiter(mut self, rate_limiter: Arc<dyn RateLimiter<K>>) -> Self {
        self.rate_limiter = Some(rate_limiter);
        self
    }

    pub fn new_queue(mut self, new_queue: NewQueueFn<K>) -> Self {
        self.new_queue = Some(new_queue);
        self
    }

    pub fn log_constructor(mut self, log_constructor: LogConstructor<K>) -> Self {
        self.log_constructor = Some(log_constructor);
        self
    }

    /// Zero falls back to the default of 1.
    pub fn max_concurrent_reconciles(mut self, n: usize) -> Self {
        self.max_concurrent_reconciles = if n == 0 {
            DEFAULT_MAX_CONCURRENT_RECONCILES
        } else {
            n
        };
        self
    }

    /// Zero falls back to the default of two minutes.
    pub fn cache_sync_timeout(mut self, timeout: Duration) -> Self {
        self.cache_sync_timeout = if timeout.is_zero() {
            DEFAULT_CACHE_SYNC_TIMEOUT
        } else {
            timeout
        };
        self
    }

    pub fn recover_panic(mut self, recover: bool) -> Self {
        self.recover_panic = recover;
        self
    }

    pub fn leader_elected(mut self, leader_elected: bool) -> Self {
        self.leader_elected = leader_elected;
        self
    }

    pub fn enable_warmup(mut self, enable: bool) -> Self {
        self.enable_warmup = enable;
        self
    }
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

/// Mutable lifecycle state, guarded by a mutex that is never held across
/// an await.
struct Lifecycle<K: Request> {
    /// Set by the first `start`.
    started: bool,
    /// Root token passed to `start` / `warmup`.
    ///
    /// Stored so that `watch` calls after activation can start their source
    /// right away. Kept for compatibility with callers that register
    /// watches late; new code should register sources before starting.
    ctx: Option<CancellationToken>,
    queue: Option<Arc<dyn PriorityQueue<K>>>,
    /// Sources waiting for activation. Emptied by the startup orchestrator.
    start_watches: Vec<Arc<dyn Source<K>>>,
    /// True once the startup orchestrator has run; later watches start inline.
    started_event_sources: bool,
}

struct Inner<K: Request> {
    name: String,
    max_concurrent_reconciles: usize,
    cache_sync_timeout: Duration,
    reconciler: Arc<dyn Reconciler<K>>,
    rate_limiter: Arc<dyn RateLimiter<K>>,
    new_queue: NewQueueFn<K>,
    log_constructor: LogConstructor<K>,
    recover_panic: bool,
    leader_elected: bool,
    enable_warmup: bool,
    metrics: ControllerMetrics,
    lifecycle: Mutex<Lifecycle<K>>,
    /// Run-once gate shared by `warmup` and `start`.
    sources_started: OnceCell<()>,
}

/// Reconciliation engine for work items of type `K`.
pub struct Controller<K: Request> {
    inner: Arc<Inner<K>>,
}

impl<K: Request> Clone for Controller<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K: Request> Controller<K> {
    /// Build a controller. Nothing runs until `warmup` or `start`.
    pub fn new(options: Options<K>) -> Result<Self> {
        if options.name.trim().is_empty() {
            return Err(Error::Config("controller name is required".to_string()));
        }

        let name = options.name;
        let log_constructor = options.log_constructor.unwrap_or_else(|| {
            let name = name.clone();
            Arc::new(move |request: Option<&K>| controller_span(&name, request))
        });

        Ok(Self {
            inner: Arc::new(Inner {
                metrics: ControllerMetrics::new(&name),
                max_concurrent_reconciles: options.max_concurrent_reconciles,
                cache_sync_timeout: options.cache_sync_timeout,
                reconciler: options.reconciler,
                rate_limiter: options
                    .rate_limiter
                    .unwrap_or_else(default_controller_rate_limiter),
                new_queue: options.new_queue.unwrap_or_else(default_new_queue),
                log_constructor,
                recover_panic: options.recover_panic,
                leader_elected: options.leader_elected,
                enable_warmup: options.enable_warmup,
                lifecycle: Mutex::new(Lifecycle {
                    started: false,
                    ctx: None,
                    queue: None,
                    start_watches: Vec::new(),
                    started_event_sources: false,
                }),
                sources_started: OnceCell::new(),
                name,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The controller's logger outside of any reconcile.
    pub fn logger(&self) -> Span {
        (self.inner.log_constructor)(None)
    }

    /// Whether this controller must only run on the elected leader.
    pub fn need_leader_election(&self) -> bool {
        self.inner.leader_elected
    }

    pub fn is_started(&self) -> bool {
        self.lock().started
    }

    /// The active queue, once sources have been activated.
    pub fn queue(&self) -> Option<Arc<dyn PriorityQueue<K>>> {
        self.lock().queue.clone()
    }

    fn lock(&self) -> MutexGuard<'_, Lifecycle<K>> {
        self.inner
            .lifecycle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a source.
    ///
    /// Before activation the source is buffered; afterwards it is started
    /// immediately with the stored root token and queue.
    pub async fn watch<S>(&self, source: S) -> Result<()>
    where
        S: Source<K> + 'static,
    {
        self.watch_shared(Arc::new(source)).await
    }

    pub async fn watch_shared(&self, source: Arc<dyn Source<K>>) -> Result<()> {
        let (ctx, queue) = {
            let mut lc = self.lock();
            if !lc.started_event_sources {
                lc.start_watches.push(source);
                return Ok(());
            }
            match (lc.ctx.clone(), lc.queue.clone()) {
                (Some(ctx), Some(queue)) => (ctx, queue),
                _ => {
                    return Err(Error::Other(format!(
                        "controller {} has activated sources but holds no queue",
                        self.inner.name
                    )));
                }
            }
        };

        let name = source.name();
        self.logger()
            .in_scope(|| info!(source = %name, "Starting EventSource"));
        source
            .start(ctx, queue)
            .await
            .map_err(|cause| Error::SourceStart { name, cause })
    }

    /// Activate sources ahead of `start`, e.g. before leadership is granted.
    /// No-op unless warmup is enabled.
    pub async fn warmup(&self, ctx: CancellationToken) -> Result<()> {
        if !self.inner.enable_warmup {
            return Ok(());
        }

        self.lock().ctx = Some(ctx.clone());
        self.start_event_sources(&ctx).await
    }

    /// Run the controller until `ctx` is cancelled.
    ///
    /// Activates sources (unless warmup already did), spawns the workers,
    /// then waits for cancellation and for every worker to finish its
    /// current item. Errors only on setup failures.
    pub async fn start(&self, ctx: CancellationToken) -> Result<()> {
        {
            let mut lc = self.lock();
            if lc.started {
                return Err(Error::AlreadyStarted);
            }
            lc.started = true;
            lc.ctx = Some(ctx.clone());
        }

        let workers = self.inner.max_concurrent_reconciles;
        self.inner.metrics.init(workers);
        let log = self.logger();

        // Sources go first so they can register their caches before workers run.
        self.start_event_sources(&ctx).await?;

        let queue = self.queue().ok_or_else(|| {
            Error::Other(format!(
                "controller {} has no queue after activating sources",
                self.inner.name
            ))
        })?;

        log.in_scope(|| {
            info!("Starting Controller");
            info!(worker_count = workers, "Starting workers");
        });

        let mut pool = JoinSet::new();
        for _ in 0..workers {
            let this = self.clone();
            let ctx = ctx.clone();
            let queue = Arc::clone(&queue);
            pool.spawn(async move { while this.process_next_work_item(&ctx, &queue).await {} });
        }

        loop {
            tokio::select! {
                _ = ctx.cancelled() => break,
                joined = pool.join_next() => match joined {
                    Some(Err(e)) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
                    Some(_) => {}
                    None => {
                        ctx.cancelled().await;
                        break;
                    }
                },
            }
        }

        log.in_scope(|| info!("Shutdown signal received, waiting for all workers to finish"));
        while let Some(joined) = pool.join_next().await {
            match joined {
                Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
                _ => {}
            }
        }
        log.in_scope(|| info!("All workers finished"));
        Ok(())
    }

    /// Invoke the reconciler once, containing panics.
    ///
    /// With panic recovery enabled a panic becomes a retryable
    /// [`ReconcileError`] carrying the panic message. With it disabled the
    /// panic is logged and resumed.
    pub async fn reconcile(
        &self,
        ctx: Context,
        request: K,
    ) -> std::result::Result<ReconcileResult, ReconcileError> {
        let reconciler = Arc::clone(&self.inner.reconciler);
        let outcome = AssertUnwindSafe(async move { reconciler.reconcile(ctx, request).await })
            .catch_unwind()
            .await;

        match outcome {
            Ok(result) => result,
            Err(payload) => {
                self.inner.metrics.panicked();
                let message = panic_message(payload.as_ref());
                if self.inner.recover_panic {
                    error!(panic = %message, "Observed a panic in reconciler");
                    return Err(ReconcileError::panic(message));
                }
                info!("Observed a panic in reconciler: {message}");
                std::panic::resume_unwind(payload)
            }
        }
    }

    /// Pull one item and handle it. Returns false once the worker should stop.
    async fn process_next_work_item(
        &self,
        ctx: &CancellationToken,
        queue: &Arc<dyn PriorityQueue<K>>,
    ) -> bool {
        let next = tokio::select! {
            biased;
            _ = ctx.cancelled() => None,
            next = queue.get_with_priority() => next,
        };
        let Some((item, priority)) = next else {
            return false;
        };

        // `done` must run even if the reconciler panics with recovery off.
        let _in_flight = InFlight::new(queue.as_ref(), &self.inner.metrics, item.clone());
        self.reconcile_handler(ctx, queue.as_ref(), item, priority)
            .await;
        true
    }

    async fn reconcile_handler(
        &self,
        ctx: &CancellationToken,
        queue: &dyn PriorityQueue<K>,
        request: K,
        priority: i32,
    ) {
        let started = Instant::now();
        let log = (self.inner.log_constructor)(Some(&request));
        let reconcile_id = ReconcileId::new();
        let span = start_reconcile_span(&log, reconcile_id);
        let rctx = Context::new(ctx.clone()).with_reconcile_id(reconcile_id);
        let metrics = &self.inner.metrics;

        async {
            debug!("Reconciling");
            let label = match self.reconcile(rctx, request.clone()).await {
                Err(err) => {
                    if err.is_terminal() {
                        metrics.terminal_error();
                    } else {
                        queue.add_with_opts(AddOpts::rate_limited(priority), request);
                    }
                    metrics.reconcile_error();
                    if !err.result().is_zero() {
                        warn!(
                            "Reconciler returned both a non-zero result and an error; the result \
                             is ignored and the error decides whether the item is requeued with backoff"
                        );
                    }
                    error!(error = %err, "Reconciler error");
                    RESULT_ERROR
                }
                Ok(result) if !result.requeue_after.is_zero() => {
                    debug!(after = ?result.requeue_after, "Reconcile done, requeueing after delay");
                    // Explicit delay overrides the rate limiter; reset backoff first.
                    queue.forget(&request);
                    queue.add_with_opts(AddOpts::after(priority, result.requeue_after), request);
                    RESULT_REQUEUE_AFTER
                }
                Ok(result) if result.requeue => {
                    debug!("Reconcile done, requeueing");
                    queue.add_with_opts(AddOpts::rate_limited(priority), request);
                    RESULT_REQUEUE
                }
                Ok(_) => {
                    debug!("Reconcile successful");
                    queue.forget(&request);
                    RESULT_SUCCESS
                }
            };
            metrics.reconciled(label);
            record_result(&Span::current(), label);
        }
        .instrument(span)
        .await;

        metrics.observe_duration(started.elapsed());
    }
}

/// Marks a dequeued item as in flight; releases it on drop.
struct InFlight<'a, K: Request> {
    queue: &'a dyn PriorityQueue<K>,
    metrics: &'a ControllerMetrics,
    item: K,
}

impl<'a, K: Request> InFlight<'a, K> {
    fn new(queue: &'a dyn PriorityQueue<K>, metrics: &'a ControllerMetrics, item: K) -> Self {
        metrics.worker_started();
        Self {
            queue,
            metrics,
            item,
        }
    }
}

impl<K: Request> Drop for InFlight<'_, K> {
    fn drop(&mut self) {
        self.metrics.worker_finished();
        self.queue.done(&self.item);
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
