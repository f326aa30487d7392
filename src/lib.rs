//! # reconcile-rs
//!
//! Reconciliation engine for level-triggered control loops.
//!
//! Sources turn change notifications into work items on a deduplicating
//! priority queue; a fixed pool of workers feeds each item to a
//! user-supplied [`Reconciler`], retrying failures with backoff and never
//! running two reconciles for the same item at once.

pub mod config;
pub mod controller;
pub mod error;
pub mod queue;
pub mod reconcile;
pub mod source;
pub mod telemetry;

pub use controller::{Controller, LogConstructor, Options};
pub use error::{BoxError, Error, Result};
pub use reconcile::{
    Context, ReconcileError, ReconcileErrorKind, ReconcileId, ReconcileResult, Reconciler,
    Request, reconcile_fn,
};
pub use source::{Source, SyncingSource};
