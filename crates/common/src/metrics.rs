//! Metrics collection for relayq
//!
//! This module provides Prometheus metrics for the broker and its workers.

use lazy_static::lazy_static;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Registry};
use std::sync::Arc;

/// Metrics registry for relayq
#[derive(Debug, Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub broker: BrokerMetrics,
    pub worker: WorkerMetrics,
}

/// Broker-specific metrics
#[derive(Debug, Clone)]
pub struct BrokerMetrics {
    /// Requests accepted at the frontend
    pub requests_received: IntCounter,

    /// Requests handed to a worker
    pub requests_dispatched: IntCounter,

    /// Replies forwarded to their client
    pub replies_delivered: IntCounter,

    /// Replies whose client had already disconnected
    pub replies_undeliverable: IntCounter,

    /// Replies from workers holding no assignment
    pub unknown_worker_replies: IntCounter,

    /// Assignments lost because the worker left mid-request
    pub assignments_abandoned: IntCounter,

    /// Requests waiting for an idle worker
    pub queue_depth: IntGauge,

    /// Workers currently registered
    pub registered_workers: IntGauge,

    /// Registered workers that are idle
    pub idle_workers: IntGauge,

    /// Connected clients
    pub connected_clients: IntGauge,

    /// Time from arrival to dispatch
    pub queue_wait: Histogram,

    /// Time from dispatch to worker reply
    pub worker_round_trip: Histogram,
}

/// Worker-side metrics
#[derive(Debug, Clone)]
pub struct WorkerMetrics {
    /// Replies sent back to the broker
    pub replies_sent: IntCounter,

    /// Request handling duration
    pub handle_duration: Histogram,
}

lazy_static! {
    /// Global metrics registry instance
    pub static ref METRICS: MetricsRegistry =
        MetricsRegistry::try_new().expect("metric descriptors are statically valid");
}

const LATENCY_BUCKETS: &[f64] = &[
    0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0,
];

fn counter(registry: &Registry, name: &str, help: &str) -> prometheus::Result<IntCounter> {
    let metric = IntCounter::new(name, help)?;
    registry.register(Box::new(metric.clone()))?;
    Ok(metric)
}

fn gauge(registry: &Registry, name: &str, help: &str) -> prometheus::Result<IntGauge> {
    let metric = IntGauge::new(name, help)?;
    registry.register(Box::new(metric.clone()))?;
    Ok(metric)
}

fn histogram(registry: &Registry, name: &str, help: &str) -> prometheus::Result<Histogram> {
    let opts = HistogramOpts::new(name, help).buckets(LATENCY_BUCKETS.to_vec());
    let metric = Histogram::with_opts(opts)?;
    registry.register(Box::new(metric.clone()))?;
    Ok(metric)
}

impl MetricsRegistry {
    /// Create a new metrics registry
    pub fn try_new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let broker = BrokerMetrics {
            requests_received: counter(
                &registry,
                "broker_requests_received_total",
                "Total number of client requests received",
            )?,
            requests_dispatched: counter(
                &registry,
                "broker_requests_dispatched_total",
                "Total number of requests dispatched to workers",
            )?,
            replies_delivered: counter(
                &registry,
                "broker_replies_delivered_total",
                "Total number of replies delivered to clients",
            )?,
            replies_undeliverable: counter(
                &registry,
                "broker_replies_undeliverable_total",
                "Total number of replies dropped because the client was gone",
            )?,
            unknown_worker_replies: counter(
                &registry,
                "broker_unknown_worker_replies_total",
                "Total number of replies from workers without an assignment",
            )?,
            assignments_abandoned: counter(
                &registry,
                "broker_assignments_abandoned_total",
                "Total number of assignments lost to departed workers",
            )?,
            queue_depth: gauge(
                &registry,
                "broker_queue_depth",
                "Requests waiting for an idle worker",
            )?,
            registered_workers: gauge(
                &registry,
                "broker_registered_workers",
                "Currently registered workers",
            )?,
            idle_workers: gauge(&registry, "broker_idle_workers", "Currently idle workers")?,
            connected_clients: gauge(
                &registry,
                "broker_connected_clients",
                "Currently connected clients",
            )?,
            queue_wait: histogram(
                &registry,
                "broker_queue_wait_seconds",
                "Time a request waited for an idle worker",
            )?,
            worker_round_trip: histogram(
                &registry,
                "broker_worker_round_trip_seconds",
                "Time between dispatch and worker reply",
            )?,
        };

        let worker = WorkerMetrics {
            replies_sent: counter(
                &registry,
                "worker_replies_sent_total",
                "Total number of replies sent by this worker",
            )?,
            handle_duration: histogram(
                &registry,
                "worker_handle_duration_seconds",
                "Request handling duration in seconds",
            )?,
        };

        Ok(MetricsRegistry {
            registry,
            broker,
            worker,
        })
    }

    /// Gather all metrics as text
    pub fn gather(&self) -> String {
        use prometheus::Encoder;

        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            tracing::warn!("Failed to encode metrics: {}", e);
            return String::new();
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

/// Helper trait for measuring latency
pub trait LatencyTimer {
    /// Observe the duration of a closure
    fn time<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R;
}

impl LatencyTimer for Histogram {
    fn time<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        let start = std::time::Instant::now();
        let result = f();
        self.observe(start.elapsed().as_secs_f64());
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_registry() {
        let metrics = MetricsRegistry::try_new().unwrap();

        metrics.broker.requests_received.inc();
        metrics.broker.queue_depth.set(3);
        let doubled = metrics.worker.handle_duration.time(|| 21 * 2);

        let output = metrics.gather();
        assert_eq!(doubled, 42);
        assert!(output.contains("broker_requests_received_total 1"));
        assert!(output.contains("broker_queue_depth 3"));
        assert!(output.contains("worker_handle_duration_seconds_count 1"));
    }
}
