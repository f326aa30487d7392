//! Event sources: producers of work items.
//!
//! A source is started once with the controller's root token and queue, and
//! must return quickly; any listening happens in tasks it spawns itself.
//! Sources that do an initial bulk population also expose
//! [`SyncingSource`] through [`Source::as_syncing`], which the controller
//! waits on (with a timeout) before it considers startup complete.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::BoxError;
use crate::queue::{AddOpts, PriorityQueue};
use crate::reconcile::Request;

/// Queue handle given to sources.
pub type QueueRef<K> = Arc<dyn PriorityQueue<K>>;

#[async_trait]
pub trait Source<K: Request>: Send + Sync {
    /// Begin delivering items into `queue`. Must not block.
    async fn start(&self, ctx: CancellationToken, queue: QueueRef<K>) -> Result<(), BoxError>;

    /// Optional sync capability.
    fn as_syncing(&self) -> Option<&dyn SyncingSource<K>> {
        None
    }

    /// Name used in logs and startup errors.
    fn name(&self) -> String {
        std::any::type_name::<Self>().to_string()
    }
}

/// A source with an initial population phase.
#[async_trait]
pub trait SyncingSource<K: Request>: Source<K> {
    /// Resolve once the initial population is done, or fail when `ctx` fires.
    async fn wait_for_sync(&self, ctx: CancellationToken) -> Result<(), BoxError>;
}

// ---------------------------------------------------------------------------
// Channel source
// ---------------------------------------------------------------------------

/// Forwards items received on an mpsc channel into the queue.
pub struct Channel<K: Request> {
    name: String,
    priority: i32,
    rx: Mutex<Option<mpsc::Receiver<K>>>,
}

impl<K: Request> Channel<K> {
    pub fn new(name: impl Into<String>, rx: mpsc::Receiver<K>) -> Self {
        Self {
            name: name.into(),
            priority: 0,
            rx: Mutex::new(Some(rx)),
        }
    }

    /// Priority attached to every forwarded item.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

#[async_trait]
impl<K: Request> Source<K> for Channel<K> {
    async fn start(&self, ctx: CancellationToken, queue: QueueRef<K>) -> Result<(), BoxError> {
        let rx = self
            .rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(mut rx) = rx else {
            return Err(format!("channel source {} was already started", self.name).into());
        };

        let name = self.name.clone();
        let priority = self.priority;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = ctx.cancelled() => break,
                    item = rx.recv() => match item {
                        Some(item) => queue.add_with_opts(AddOpts::immediate(priority), item),
                        None => break,
                    },
                }
            }
            debug!(source = %name, "channel source stopped");
        });

        Ok(())
    }

    fn name(&self) -> String {
        format!("channel({})", self.name)
    }
}
