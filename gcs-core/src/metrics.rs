//! Client-side metrics
//!
//! Process-local counters, gauges and a latency histogram, exported in the
//! Prometheus text format.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Monotonically increasing count
pub struct Counter {
    value: AtomicU64,
    name: &'static str,
    help: &'static str,
}

impl Counter {
    pub const fn new(name: &'static str, help: &'static str) -> Self {
        Self {
            value: AtomicU64::new(0),
            name,
            help,
        }
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    /// Format as Prometheus metric
    pub fn to_prometheus(&self) -> String {
        format!(
            "# HELP {} {}\n# TYPE {} counter\n{} {}\n",
            self.name, self.help, self.name, self.name, self.get()
        )
    }
}

/// Value that can go up or down
pub struct Gauge {
    value: AtomicI64,
    name: &'static str,
    help: &'static str,
}

impl Gauge {
    pub const fn new(name: &'static str, help: &'static str) -> Self {
        Self {
            value: AtomicI64::new(0),
            name,
            help,
        }
    }

    pub fn set(&self, val: i64) {
        self.value.store(val, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }

    /// Format as Prometheus metric
    pub fn to_prometheus(&self) -> String {
        format!(
            "# HELP {} {}\n# TYPE {} gauge\n{} {}\n",
            self.name, self.help, self.name, self.name, self.get()
        )
    }
}

const LATENCY_BOUNDS: [f64; 10] = [0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.5, 1.0];

/// Latency histogram with fixed second-valued buckets
pub struct Histogram {
    buckets: [AtomicU64; LATENCY_BOUNDS.len()],
    sum_micros: AtomicU64,
    count: AtomicU64,
    name: &'static str,
    help: &'static str,
}

impl Histogram {
    pub const fn new(name: &'static str, help: &'static str) -> Self {
        Self {
            buckets: [const { AtomicU64::new(0) }; LATENCY_BOUNDS.len()],
            sum_micros: AtomicU64::new(0),
            count: AtomicU64::new(0),
            name,
            help,
        }
    }

    /// Record one observation in seconds
    pub fn observe(&self, seconds: f64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_micros
            .fetch_add((seconds * 1_000_000.0) as u64, Ordering::Relaxed);
        for (bound, count) in LATENCY_BOUNDS.iter().zip(&self.buckets) {
            if seconds <= *bound {
                count.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Format as Prometheus metric
    pub fn to_prometheus(&self) -> String {
        let mut output = format!(
            "# HELP {} {}\n# TYPE {} histogram\n",
            self.name, self.help, self.name
        );
        for (bound, count) in LATENCY_BOUNDS.iter().zip(&self.buckets) {
            output.push_str(&format!(
                "{}_bucket{{le=\"{}\"}} {}\n",
                self.name,
                bound,
                count.load(Ordering::Relaxed)
            ));
        }
        output.push_str(&format!("{}_bucket{{le=\"+Inf\"}} {}\n", self.name, self.count()));
        let sum_secs = self.sum_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0;
        output.push_str(&format!("{}_sum {}\n", self.name, sum_secs));
        output.push_str(&format!("{}_count {}\n", self.name, self.count()));
        output
    }
}

/// Standard GCS client metrics
pub mod standard {
    use super::*;

    pub static COMMANDS_ISSUED: Counter =
        Counter::new("gcs_commands_issued_total", "Table operations queued on a connection");

    pub static LOOKUP_MISSES: Counter =
        Counter::new("gcs_lookup_misses_total", "Lookups that found no entry");

    pub static TEST_AND_UPDATE_MATCHED: Counter = Counter::new(
        "gcs_test_and_update_matched_total",
        "Conditional updates whose test matched",
    );

    pub static TEST_AND_UPDATE_MISMATCHED: Counter = Counter::new(
        "gcs_test_and_update_mismatched_total",
        "Conditional updates whose test did not match",
    );

    pub static NOTIFICATIONS_DELIVERED: Counter = Counter::new(
        "gcs_notifications_delivered_total",
        "Subscription notifications handed to subscribers",
    );

    pub static MALFORMED_PAYLOADS: Counter = Counter::new(
        "gcs_malformed_payloads_total",
        "Published payloads dropped because they could not be decoded",
    );

    pub static LIVE_CLIENTS: Gauge =
        Gauge::new("gcs_live_clients", "Clients whose latest membership record is a join");

    pub static COMMAND_DURATION: Histogram =
        Histogram::new("gcs_command_duration_seconds", "Backend time per table operation");
}

/// Render every standard metric
pub fn gather_client_metrics() -> String {
    let mut output = String::new();

    // Counters
    output.push_str(&standard::COMMANDS_ISSUED.to_prometheus());
    output.push_str(&standard::LOOKUP_MISSES.to_prometheus());
    output.push_str(&standard::TEST_AND_UPDATE_MATCHED.to_prometheus());
    output.push_str(&standard::TEST_AND_UPDATE_MISMATCHED.to_prometheus());
    output.push_str(&standard::NOTIFICATIONS_DELIVERED.to_prometheus());
    output.push_str(&standard::MALFORMED_PAYLOADS.to_prometheus());

    // Gauges
    output.push_str(&standard::LIVE_CLIENTS.to_prometheus());

    // Histograms
    output.push_str(&standard::COMMAND_DURATION.to_prometheus());

    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter() {
        let counter = Counter::new("test_counter", "Test counter");
        assert_eq!(counter.get(), 0);
        counter.inc();
        counter.inc();
        assert_eq!(counter.get(), 2);
        assert!(counter.to_prometheus().contains("test_counter 2"));
    }

    #[test]
    fn test_gauge() {
        let gauge = Gauge::new("test_gauge", "Test gauge");
        gauge.set(10);
        gauge.set(3);
        assert_eq!(gauge.get(), 3);
    }

    #[test]
    fn test_histogram() {
        let histogram = Histogram::new("test_histogram", "Test histogram");
        histogram.observe(0.001);
        histogram.observe(0.01);
        histogram.observe(2.0);

        let prometheus = histogram.to_prometheus();
        assert!(prometheus.contains("test_histogram_count 3"));
        assert!(prometheus.contains("test_histogram_bucket{le=\"0.001\"} 1"));
        assert!(prometheus.contains("test_histogram_bucket{le=\"+Inf\"} 3"));
    }

    #[test]
    fn test_gather() {
        let output = gather_client_metrics();
        assert!(output.contains("gcs_commands_issued_total"));
        assert!(output.contains("gcs_command_duration_seconds_count"));
    }
}
