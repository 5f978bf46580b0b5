//! Instruments for the writes the controller issues against the API
//! server: pod annotations and extended resource capacity updates.

use opentelemetry::KeyValue;
use opentelemetry::metrics::{Counter, Meter};

#[derive(Clone)]
pub struct K8sApiMetrics {
    annotate_pod_calls: Counter<u64>,
    annotate_pod_errors: Counter<u64>,
    advertise_resource_calls: Counter<u64>,
    advertise_resource_errors: Counter<u64>,
}

impl K8sApiMetrics {
    pub fn new(meter: &Meter) -> Self {
        let annotate_pod_calls = meter
            .u64_counter("annotate_pod_request_call_count")
            .with_description("The number of requests to annotate pod objects")
            .build();

        let annotate_pod_errors = meter
            .u64_counter("annotate_pod_request_err_count")
            .with_description("The number of requests that failed to annotate the pod")
            .build();

        let advertise_resource_calls = meter
            .u64_counter("advertise_resource_request_call_count")
            .with_description("The number of requests to advertise extended resources")
            .build();

        let advertise_resource_errors = meter
            .u64_counter("advertise_resource_request_err_count")
            .with_description("The number of requests that failed to advertise extended resources")
            .build();

        Self {
            annotate_pod_calls,
            annotate_pod_errors,
            advertise_resource_calls,
            advertise_resource_errors,
        }
    }

    pub fn annotate_pod_inc(&self, annotate_key: &str) {
        self.annotate_pod_calls
            .add(1, &[KeyValue::new("annotate_key", annotate_key.to_string())]);
    }

    pub fn annotate_pod_error_inc(&self, annotate_key: &str) {
        self.annotate_pod_errors
            .add(1, &[KeyValue::new("annotate_key", annotate_key.to_string())]);
    }

    pub fn advertise_resource_inc(&self, resource_name: &str) {
        self.advertise_resource_calls.add(
            1,
            &[KeyValue::new("resource_name", resource_name.to_string())],
        );
    }

    pub fn advertise_resource_error_inc(&self, resource_name: &str) {
        self.advertise_resource_errors.add(
            1,
            &[KeyValue::new("resource_name", resource_name.to_string())],
        );
    }
}
