use crate::controller::ControllerId;

use std::collections::HashMap;
use std::sync::Arc;

use opentelemetry::KeyValue;
use opentelemetry::metrics::{Counter, Gauge, Histogram, Meter};
use tokio::time::Instant;

#[derive(Clone)]
pub struct Metrics {
    pub controllers: HashMap<ControllerId, Arc<ControllerMetrics>>,
    pub worker: Arc<WorkerMetrics>,
}

impl Metrics {
    pub fn new(meter: &Meter, controller_names: &[&'static str]) -> Self {
        let controllers = controller_names
            .iter()
            .map(|&id| (id, Arc::new(ControllerMetrics::new(id, meter))))
            .collect::<HashMap<ControllerId, Arc<ControllerMetrics>>>();

        Self {
            controllers,
            worker: Arc::new(WorkerMetrics::new(meter)),
        }
    }
}

#[derive(Clone)]
pub struct ControllerMetrics {
    controller: String,
    reconcile_operations: Counter<u64>,
    reconcile_failures: Counter<u64>,
    reconcile_duration: Histogram<f64>,
    triggered: Counter<u64>,
    ready: Gauge<i64>,
}

impl ControllerMetrics {
    pub fn new(controller: &str, meter: &Meter) -> Self {
        let reconcile_operations = meter
            .u64_counter("reconcile_operations")
            .with_description("Total number of reconcile operations")
            .build();

        let reconcile_failures = meter
            .u64_counter("reconcile_failures")
            .with_description("Number of errors that occurred during reconcile operations")
            .build();

        let reconcile_duration = meter
            .f64_histogram("reconcile_duration_seconds")
            .with_description("Histogram of reconcile operations")
            .build();

        let triggered = meter
            .u64_counter("triggered")
            .with_description(
                "Number of times a Kubernetes object applied or delete event triggered to reconcile an object",
            )
            .build();

        let ready = meter
            .i64_gauge("ready")
            .with_description("1 when the controller is ready to reconcile resources, 0 otherwise")
            .build();

        Self {
            controller: controller.to_string(),
            reconcile_operations,
            reconcile_failures,
            reconcile_duration,
            triggered,
            ready,
        }
    }

    pub fn reconcile_failure_inc(&self) {
        self.reconcile_failures
            .add(1, &[KeyValue::new("controller", self.controller.clone())]);
    }

    pub fn reconcile_count_and_measure(&self) -> ReconcileMeasurer {
        self.reconcile_operations
            .add(1, &[KeyValue::new("controller", self.controller.clone())]);
        ReconcileMeasurer {
            start: Instant::now(),
            controller: self.controller.clone(),
            metric: self.reconcile_duration.clone(),
        }
    }

    pub fn triggered_inc(&self, triggered_by: &str) {
        self.triggered.add(
            1,
            &[
                KeyValue::new("controller", self.controller.clone()),
                KeyValue::new("triggered_by", triggered_by.to_string()),
            ],
        );
    }

    pub fn ready_set(&self, status: i64) {
        self.ready.record(
            status,
            &[KeyValue::new("controller", self.controller.clone())],
        );
    }
}

/// Counters shared by every worker pool, labelled by the resource the pool
/// serves.
#[derive(Clone)]
pub struct WorkerMetrics {
    jobs_submitted: Counter<u64>,
    jobs_dropped: Counter<u64>,
    jobs_requeued: Counter<u64>,
}

impl WorkerMetrics {
    pub fn new(meter: &Meter) -> Self {
        let jobs_submitted = meter
            .u64_counter("worker_jobs_submitted")
            .with_description("Total number of jobs submitted to the worker pools")
            .build();

        let jobs_dropped = meter
            .u64_counter("worker_jobs_dropped")
            .with_description(
                "Number of jobs dropped because the queue was full or the requeue budget was spent",
            )
            .build();

        let jobs_requeued = meter
            .u64_counter("worker_jobs_requeued")
            .with_description("Number of jobs pushed back to the queue after a failure")
            .build();

        Self {
            jobs_submitted,
            jobs_dropped,
            jobs_requeued,
        }
    }

    pub fn submitted_inc(&self, resource: &str) {
        self.jobs_submitted
            .add(1, &[KeyValue::new("resource", resource.to_string())]);
    }

    pub fn dropped_inc(&self, resource: &str) {
        self.jobs_dropped
            .add(1, &[KeyValue::new("resource", resource.to_string())]);
    }

    pub fn requeued_inc(&self, resource: &str) {
        self.jobs_requeued
            .add(1, &[KeyValue::new("resource", resource.to_string())]);
    }
}

/// Smart function duration measurer
///
/// Relies on Drop to calculate duration and register the observation in the histogram
pub struct ReconcileMeasurer {
    start: Instant,
    controller: String,
    metric: Histogram<f64>,
}

impl Drop for ReconcileMeasurer {
    fn drop(&mut self) {
        let duration = self.start.elapsed().as_secs_f64();
        self.metric.record(
            duration,
            &[KeyValue::new("controller", self.controller.clone())],
        );
    }
}
