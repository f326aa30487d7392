//! Controller metric instruments.
//!
//! Built from the `"reconcile-rs"` meter of the globally-registered
//! `MeterProvider`. Every data point carries a `controller` label.

use std::time::Duration;

use opentelemetry::KeyValue;
use opentelemetry::metrics::{Counter, Gauge, Histogram, Meter, UpDownCounter};

pub const RESULT_SUCCESS: &str = "success";
pub const RESULT_ERROR: &str = "error";
pub const RESULT_REQUEUE: &str = "requeue";
pub const RESULT_REQUEUE_AFTER: &str = "requeue_after";

fn meter() -> Meter {
    opentelemetry::global::meter("reconcile-rs")
}

/// Instruments for one controller, pre-labelled with its name.
#[derive(Clone)]
pub struct ControllerMetrics {
    controller: KeyValue,
    /// Labels: `controller`, `result`.
    reconcile_total: Counter<u64>,
    reconcile_errors: Counter<u64>,
    terminal_errors: Counter<u64>,
    panics: Counter<u64>,
    /// Seconds.
    reconcile_time: Histogram<f64>,
    worker_count: Gauge<u64>,
    active_workers: UpDownCounter<i64>,
}

impl ControllerMetrics {
    pub fn new(controller: &str) -> Self {
        let meter = meter();
        Self {
            controller: KeyValue::new("controller", controller.to_string()),
            reconcile_total: meter
                .u64_counter("controller.reconcile.total")
                .with_description("Total number of reconciliations per controller")
                .build(),
            reconcile_errors: meter
                .u64_counter("controller.reconcile.errors")
                .with_description("Total number of reconciliation errors per controller")
                .build(),
            terminal_errors: meter
                .u64_counter("controller.reconcile.terminal_errors")
                .with_description("Total number of terminal reconciliation errors per controller")
                .build(),
            panics: meter
                .u64_counter("controller.reconcile.panics")
                .with_description("Total number of reconciliation panics per controller")
                .build(),
            reconcile_time: meter
                .f64_histogram("controller.reconcile.duration")
                .with_description("Length of time per reconciliation per controller")
                .with_unit("s")
                .build(),
            worker_count: meter
                .u64_gauge("controller.workers.max")
                .with_description("Maximum number of concurrent reconciles per controller")
                .build(),
            active_workers: meter
                .i64_up_down_counter("controller.workers.active")
                .with_description("Number of currently used workers per controller")
                .build(),
        }
    }

    /// Touch every series so it is exported before the first reconcile.
    pub fn init(&self, max_workers: usize) {
        let labels = std::slice::from_ref(&self.controller);
        for result in [
            RESULT_ERROR,
            RESULT_REQUEUE_AFTER,
            RESULT_REQUEUE,
            RESULT_SUCCESS,
        ] {
            self.reconcile_total.add(0, &self.with_result(result));
        }
        self.reconcile_errors.add(0, labels);
        self.terminal_errors.add(0, labels);
        self.panics.add(0, labels);
        self.worker_count.record(max_workers as u64, labels);
        self.active_workers.add(0, labels);
    }

    pub fn reconciled(&self, result: &'static str) {
        self.reconcile_total.add(1, &self.with_result(result));
    }

    pub fn reconcile_error(&self) {
        self.reconcile_errors
            .add(1, std::slice::from_ref(&self.controller));
    }

    pub fn terminal_error(&self) {
        self.terminal_errors
            .add(1, std::slice::from_ref(&self.controller));
    }

    pub fn panicked(&self) {
        self.panics.add(1, std::slice::from_ref(&self.controller));
    }

    pub fn observe_duration(&self, elapsed: Duration) {
        self.reconcile_time
            .record(elapsed.as_secs_f64(), std::slice::from_ref(&self.controller));
    }

    pub fn worker_started(&self) {
        self.active_workers
            .add(1, std::slice::from_ref(&self.controller));
    }

    pub fn worker_finished(&self) {
        self.active_workers
            .add(-1, std::slice::from_ref(&self.controller));
    }

    fn with_result(&self, result: &'static str) -> [KeyValue; 2] {
        [self.controller.clone(), KeyValue::new("result", result)]
    }
}
