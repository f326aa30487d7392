//! Span helpers for controllers and reconcile invocations.

use std::fmt::Debug;

use tracing::Span;

use crate::reconcile::ReconcileId;

/// Default controller span. `request` is `None` outside of a reconcile
/// (startup, watch registration).
pub fn controller_span<K: Debug>(controller: &str, request: Option<&K>) -> Span {
    match request {
        Some(request) => tracing::info_span!(
            "controller",
            controller = controller,
            request = ?request,
        ),
        None => tracing::info_span!("controller", controller = controller),
    }
}

/// Child span scoping a single reconcile invocation.
pub fn start_reconcile_span(parent: &Span, reconcile_id: ReconcileId) -> Span {
    tracing::info_span!(
        parent: parent,
        "reconcile",
        reconcile_id = %reconcile_id,
        result = tracing::field::Empty,
    )
}

/// Record how the invocation ended on its span.
pub fn record_result(span: &Span, result: &'static str) {
    span.record("result", result);
}
