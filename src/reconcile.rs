//! Reconciler contract.
//!
//! A reconciler receives one work item at a time and drives actual state
//! toward desired state for it. It reports back with a [`ReconcileResult`]
//! (done, or requeue) or a [`ReconcileError`] (retry with backoff, or drop
//! when terminal).

use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::BoxError;

/// Bound for work items. Any cloneable, hashable key qualifies.
pub trait Request: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static {}

impl<T> Request for T where T: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static {}

// ---------------------------------------------------------------------------
// Result / error
// ---------------------------------------------------------------------------

/// What the reconciler wants done with the item after a successful pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileResult {
    /// Legacy requeue flag: put the item back through the rate limiter.
    pub requeue: bool,
    /// Requeue after a fixed delay. Zero means no delayed requeue.
    pub requeue_after: Duration,
}

impl ReconcileResult {
    /// Done, nothing to requeue.
    pub fn done() -> Self {
        Self::default()
    }

    /// Requeue through the rate limiter.
    pub fn requeue() -> Self {
        Self {
            requeue: true,
            ..Self::default()
        }
    }

    /// Requeue after `delay`, bypassing the rate limiter.
    pub fn requeue_after(delay: Duration) -> Self {
        Self {
            requeue: false,
            requeue_after: delay,
        }
    }

    pub fn is_zero(&self) -> bool {
        !self.requeue && self.requeue_after.is_zero()
    }
}

/// Why a reconcile invocation failed.
#[derive(Debug, Error)]
pub enum ReconcileErrorKind {
    /// Ordinary failure; the item is requeued with backoff.
    #[error(transparent)]
    Retryable(BoxError),

    /// Failure the reconciler marked as unretriable; the item is dropped.
    #[error("terminal error: {0}")]
    Terminal(BoxError),

    /// The reconciler panicked and the panic was recovered.
    #[error("panic: {0} [recovered]")]
    Panic(String),
}

/// Error returned by a reconcile invocation.
///
/// A reconciler may attach a [`ReconcileResult`] to the error. The
/// controller ignores it (the error always wins) and logs a warning.
#[derive(Debug)]
pub struct ReconcileError {
    kind: ReconcileErrorKind,
    result: ReconcileResult,
}

impl ReconcileError {
    /// Wrap an error as retryable.
    pub fn new(err: impl Into<BoxError>) -> Self {
        ReconcileErrorKind::Retryable(err.into()).into()
    }

    /// Wrap an error as terminal.
    pub fn terminal(err: impl Into<BoxError>) -> Self {
        ReconcileErrorKind::Terminal(err.into()).into()
    }

    pub(crate) fn panic(message: String) -> Self {
        ReconcileErrorKind::Panic(message).into()
    }

    /// Attach a result alongside the error.
    pub fn with_result(mut self, result: ReconcileResult) -> Self {
        self.result = result;
        self
    }

    pub fn kind(&self) -> &ReconcileErrorKind {
        &self.kind
    }

    pub fn result(&self) -> ReconcileResult {
        self.result
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.kind, ReconcileErrorKind::Terminal(_))
    }

    pub fn is_panic(&self) -> bool {
        matches!(self.kind, ReconcileErrorKind::Panic(_))
    }
}

impl From<ReconcileErrorKind> for ReconcileError {
    fn from(kind: ReconcileErrorKind) -> Self {
        Self {
            kind,
            result: ReconcileResult::default(),
        }
    }
}

impl fmt::Display for ReconcileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.kind.fmt(f)
    }
}

impl std::error::Error for ReconcileError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        std::error::Error::source(&self.kind)
    }
}

// ---------------------------------------------------------------------------
// Invocation context
// ---------------------------------------------------------------------------

/// Process-unique identifier of a single reconcile invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReconcileId(pub Uuid);

impl ReconcileId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ReconcileId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ReconcileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-invocation context handed to the reconciler.
///
/// The token is the controller's root token: it fires on shutdown, but
/// the engine never cancels a single reconcile on its own.
#[derive(Debug, Clone)]
pub struct Context {
    token: CancellationToken,
    reconcile_id: Option<ReconcileId>,
}

impl Context {
    pub fn new(token: CancellationToken) -> Self {
        Self {
            token,
            reconcile_id: None,
        }
    }

    pub(crate) fn with_reconcile_id(mut self, id: ReconcileId) -> Self {
        self.reconcile_id = Some(id);
        self
    }

    /// The id of the running invocation, if this context belongs to one.
    pub fn reconcile_id(&self) -> Option<ReconcileId> {
        self.reconcile_id
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

// ---------------------------------------------------------------------------
// Reconciler
// ---------------------------------------------------------------------------

/// User-supplied reconciliation logic.
///
/// May run concurrently for distinct items; the engine never runs it
/// concurrently for the same item.
#[async_trait]
pub trait Reconciler<K: Request>: Send + Sync {
    async fn reconcile(&self, ctx: Context, request: K)
    -> Result<ReconcileResult, ReconcileError>;
}

/// Adapter turning an async closure into a [`Reconciler`].
pub struct ReconcileFn<F>(F);

/// Build a reconciler from `Fn(Context, K) -> impl Future<Output = Result<..>>`.
pub fn reconcile_fn<K, F, Fut>(f: F) -> ReconcileFn<F>
where
    K: Request,
    F: Fn(Context, K) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ReconcileResult, ReconcileError>> + Send + 'static,
{
    ReconcileFn(f)
}

#[async_trait]
impl<K, F, Fut> Reconciler<K> for ReconcileFn<F>
where
    K: Request,
    F: Fn(Context, K) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ReconcileResult, ReconcileError>> + Send + 'static,
{
    async fn reconcile(
        &self,
        ctx: Context,
        request: K,
    ) -> Result<ReconcileResult, ReconcileError> {
        (self.0)(ctx, request).await
    }
}
