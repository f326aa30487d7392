//! Source activation.
//!
//! Runs at most once per controller, whichever of `warmup` / `start` gets
//! there first. Builds the queue, ties its shutdown to the root token, and
//! starts every buffered source concurrently. Each syncing source gets
//! `cache_sync_timeout` to finish its initial population. The first error
//! is returned, but only after every source task has finished.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::StreamExt as _;
use futures::stream::FuturesUnordered;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, error, info};

use super::Controller;
use crate::error::{Error, Result};
use crate::queue::PriorityQueue;
use crate::reconcile::Request;
use crate::source::Source;

impl<K: Request> Controller<K> {
    /// Activate sources and queue. Only the caller that actually runs the
    /// activation sees its error; later callers get `Ok`.
    pub(super) async fn start_event_sources(&self, ctx: &CancellationToken) -> Result<()> {
        let mut outcome = Ok(());
        let slot = &mut outcome;
        self.inner
            .sources_started
            .get_or_init(|| async move {
                *slot = self.activate(ctx).await;
            })
            .await;
        outcome
    }

    async fn activate(&self, ctx: &CancellationToken) -> Result<()> {
        let queue = (self.inner.new_queue)(&self.inner.name, Arc::clone(&self.inner.rate_limiter))
            .into_priority_queue();
        self.lock().queue = Some(Arc::clone(&queue));

        {
            let queue = Arc::clone(&queue);
            let ctx = ctx.clone();
            tokio::spawn(async move {
                ctx.cancelled().await;
                queue.shut_down();
            });
        }

        let watches = std::mem::take(&mut self.lock().start_watches);
        let mut result = self.start_sources(ctx, &queue, watches).await;

        // Sources registered while the batch above was starting.
        loop {
            let late = {
                let mut lc = self.lock();
                if lc.start_watches.is_empty() {
                    // Sources are released by now; from here on `watch`
                    // starts new sources itself.
                    lc.started_event_sources = true;
                    break;
                }
                std::mem::take(&mut lc.start_watches)
            };
            let late_result = self.start_sources(ctx, &queue, late).await;
            if result.is_ok() {
                result = late_result;
            }
        }

        result
    }

    async fn start_sources(
        &self,
        ctx: &CancellationToken,
        queue: &Arc<dyn PriorityQueue<K>>,
        watches: Vec<Arc<dyn Source<K>>>,
    ) -> Result<()> {
        let mut pending: FuturesUnordered<_> = watches
            .into_iter()
            .map(|source| {
                start_source(
                    source,
                    self.inner.name.clone(),
                    ctx.clone(),
                    Arc::clone(queue),
                    self.inner.cache_sync_timeout,
                )
                .instrument(self.logger())
            })
            .collect();

        // First error by completion time wins; the rest still run to the end.
        let mut first_err = None;
        while let Some(result) = pending.next().await {
            if let Err(err) = result {
                first_err.get_or_insert(err);
            }
        }

        first_err.map_or(Ok(()), Err)
    }
}

/// Start one source and, if it syncs, wait for it within `timeout`.
async fn start_source<K: Request>(
    source: Arc<dyn Source<K>>,
    controller: String,
    ctx: CancellationToken,
    queue: Arc<dyn PriorityQueue<K>>,
    timeout: Duration,
) -> Result<()> {
    let name = source.name();
    let sync_ctx = ctx.child_token();
    let _cancel_sync = sync_ctx.clone().drop_guard();
    let did_start_syncing = Arc::new(AtomicBool::new(false));

    // A dropped sender means the source task panicked.
    let (tx, mut rx) = oneshot::channel::<Result<()>>();
    {
        let ctx = ctx.clone();
        let sync_ctx = sync_ctx.clone();
        let did_start_syncing = Arc::clone(&did_start_syncing);
        let name = name.clone();
        tokio::spawn(
            async move {
                info!(source = %name, "Starting EventSource");
                if let Err(cause) = source.start(ctx, queue).await {
                    let _ = tx.send(Err(Error::SourceStart { name, cause }));
                    return;
                }
                let Some(syncing) = source.as_syncing() else {
                    let _ = tx.send(Ok(()));
                    return;
                };
                did_start_syncing.store(true, Ordering::SeqCst);
                let synced = syncing.wait_for_sync(sync_ctx).await.map_err(|cause| {
                    let err = Error::SourceSync {
                        controller,
                        name,
                        cause,
                    };
                    error!(error = %err, "Could not wait for cache to sync");
                    err
                });
                let _ = tx.send(synced);
            }
            .instrument(Span::current()),
        );
    }

    tokio::select! {
        received = &mut rx => return received.unwrap_or_else(|_| Err(exited(name.clone()))),
        _ = tokio::time::sleep(timeout) => {}
        _ = ctx.cancelled() => {}
    }
    sync_ctx.cancel();

    if did_start_syncing.load(Ordering::SeqCst) {
        // Racing with wait_for_sync; let it report what happened.
        let received = rx.await;
        if ctx.is_cancelled() {
            return Ok(());
        }
        return received.unwrap_or_else(|_| Err(exited(name)));
    }
    if ctx.is_cancelled() {
        return Ok(());
    }
    Err(Error::SourceTimeout { name })
}

fn exited(name: String) -> Error {
    Error::SourceTask {
        name,
        reason: "task exited without reporting a result".to_string(),
    }
}
