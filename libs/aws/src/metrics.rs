use opentelemetry::KeyValue;
use opentelemetry::metrics::{Counter, Histogram, Meter};
use tokio::time::Instant;

/// Instruments shared by every EC2 call: an aggregate call/error pair, a
/// per operation call/error pair keyed by the `api` label, and a latency
/// histogram.
#[derive(Clone)]
pub struct Ec2Metrics {
    api_calls: Counter<u64>,
    api_errors: Counter<u64>,
    call_latency: Histogram<f64>,
    assigned_private_ips: Counter<u64>,
    unassigned_private_ips: Counter<u64>,
}

impl Ec2Metrics {
    pub fn new(meter: &Meter) -> Self {
        let api_calls = meter
            .u64_counter("ec2_api_req_count")
            .with_description("The number of calls made to ec2")
            .build();

        let api_errors = meter
            .u64_counter("ec2_api_err_count")
            .with_description("The number of errors encountered while interacting with ec2")
            .build();

        let call_latency = meter
            .f64_histogram("ec2_api_call_latency_seconds")
            .with_description("EC2 API call latency in seconds")
            .build();

        let assigned_private_ips = meter
            .u64_counter("num_assigned_private_ip_address")
            .with_description("The number of secondary private ip addresses allocated")
            .build();

        let unassigned_private_ips = meter
            .u64_counter("num_unassigned_private_ip_address")
            .with_description("The number of secondary private ip addresses unassigned")
            .build();

        Self {
            api_calls,
            api_errors,
            call_latency,
            assigned_private_ips,
            unassigned_private_ips,
        }
    }

    /// Start measuring one call; completed by [`CallMeasurer::observe`].
    pub fn measure(&self, api: &'static str) -> CallMeasurer {
        self.api_calls.add(1, &[KeyValue::new("api", api)]);
        CallMeasurer {
            api,
            start: Instant::now(),
            errors: self.api_errors.clone(),
            latency: self.call_latency.clone(),
        }
    }

    pub fn assigned_ips_add(&self, count: u64) {
        self.assigned_private_ips.add(count, &[]);
    }

    pub fn unassigned_ips_add(&self, count: u64) {
        self.unassigned_private_ips.add(count, &[]);
    }
}

pub struct CallMeasurer {
    api: &'static str,
    start: Instant,
    errors: Counter<u64>,
    latency: Histogram<f64>,
}

impl CallMeasurer {
    /// Record latency and, for failed calls, the error counters.
    pub fn observe<T, E>(self, result: &Result<T, E>) {
        self.latency.record(
            self.start.elapsed().as_secs_f64(),
            &[KeyValue::new("api", self.api)],
        );
        if result.is_err() {
            self.errors.add(1, &[KeyValue::new("api", self.api)]);
        }
    }
}
