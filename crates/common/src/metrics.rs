//! Metrics collection for EmberLM
//!
//! This module provides Prometheus metrics for observability.
//! Hot-path updates are restricted to counter increments and gauge sets.

use lazy_static::lazy_static;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Registry};
use std::sync::Arc;

/// Metrics registry for EmberLM
#[derive(Debug, Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub inference: InferenceMetrics,
    pub resources: ResourceMetrics,
}

/// Inference-related metrics
#[derive(Debug, Clone)]
pub struct InferenceMetrics {
    /// Total number of generation requests
    pub requests_total: IntCounter,

    /// Total number of successful requests
    pub requests_success: IntCounter,

    /// Total number of failed requests
    pub requests_failed: IntCounter,

    /// Total number of cancelled requests
    pub requests_cancelled: IntCounter,

    /// Time to first token in seconds
    pub ttft_seconds: Histogram,

    /// End-to-end request duration in seconds
    pub request_duration: Histogram,

    /// Decode throughput in tokens per second
    pub tokens_per_second: Histogram,

    /// Tokens generated total
    pub tokens_generated_total: IntCounter,

    /// Current in-flight generations
    pub active_requests: IntGauge,
}

/// Memory and pooling metrics
#[derive(Debug, Clone)]
pub struct ResourceMetrics {
    /// Loaded model parameter bytes
    pub model_bytes: IntGauge,

    /// Live KV cache bytes across all sessions
    pub kv_cache_bytes: IntGauge,

    /// Active sessions
    pub active_sessions: IntGauge,

    /// Scratch buffers rented
    pub scratch_rented_total: IntCounter,

    /// Scratch buffers recycled back to the pool
    pub scratch_recycled_total: IntCounter,

    /// Scratch buffers allocated fresh (pool miss)
    pub scratch_allocated_total: IntCounter,
}

lazy_static! {
    /// Global metrics registry instance
    pub static ref METRICS: MetricsRegistry = MetricsRegistry::new();
}

impl MetricsRegistry {
    /// Create a new metrics registry
    pub fn new() -> Self {
        let registry = Arc::new(Registry::new());

        let requests_total =
            IntCounter::new("ember_requests_total", "Total number of generation requests").unwrap();
        let requests_success = IntCounter::new(
            "ember_requests_success_total",
            "Total number of successful requests",
        )
        .unwrap();
        let requests_failed = IntCounter::new(
            "ember_requests_failed_total",
            "Total number of failed requests",
        )
        .unwrap();
        let requests_cancelled = IntCounter::new(
            "ember_requests_cancelled_total",
            "Total number of cancelled requests",
        )
        .unwrap();

        let ttft_seconds = Histogram::with_opts(
            HistogramOpts::new("ember_ttft_seconds", "Time to first token in seconds")
                .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
        )
        .unwrap();
        let request_duration = Histogram::with_opts(
            HistogramOpts::new(
                "ember_request_duration_seconds",
                "End-to-end request duration in seconds",
            )
            .buckets(vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0]),
        )
        .unwrap();
        let tokens_per_second = Histogram::with_opts(
            HistogramOpts::new(
                "ember_tokens_per_second",
                "Decode throughput in tokens per second",
            )
            .buckets(vec![1.0, 2.0, 5.0, 10.0, 20.0, 50.0, 100.0, 200.0]),
        )
        .unwrap();

        let tokens_generated_total =
            IntCounter::new("ember_tokens_generated_total", "Tokens generated total").unwrap();
        let active_requests =
            IntGauge::new("ember_active_requests", "Current in-flight generations").unwrap();

        let model_bytes =
            IntGauge::new("ember_model_bytes", "Loaded model parameter bytes").unwrap();
        let kv_cache_bytes = IntGauge::new(
            "ember_kv_cache_bytes",
            "Live KV cache bytes across all sessions",
        )
        .unwrap();
        let active_sessions = IntGauge::new("ember_active_sessions", "Active sessions").unwrap();
        let scratch_rented_total =
            IntCounter::new("ember_scratch_rented_total", "Scratch buffers rented").unwrap();
        let scratch_recycled_total = IntCounter::new(
            "ember_scratch_recycled_total",
            "Scratch buffers recycled back to the pool",
        )
        .unwrap();
        let scratch_allocated_total = IntCounter::new(
            "ember_scratch_allocated_total",
            "Scratch buffers allocated fresh (pool miss)",
        )
        .unwrap();

        for collector in [
            Box::new(requests_total.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(requests_success.clone()),
            Box::new(requests_failed.clone()),
            Box::new(requests_cancelled.clone()),
            Box::new(ttft_seconds.clone()),
            Box::new(request_duration.clone()),
            Box::new(tokens_per_second.clone()),
            Box::new(tokens_generated_total.clone()),
            Box::new(active_requests.clone()),
            Box::new(model_bytes.clone()),
            Box::new(kv_cache_bytes.clone()),
            Box::new(active_sessions.clone()),
            Box::new(scratch_rented_total.clone()),
            Box::new(scratch_recycled_total.clone()),
            Box::new(scratch_allocated_total.clone()),
        ] {
            registry.register(collector).unwrap();
        }

        Self {
            registry,
            inference: InferenceMetrics {
                requests_total,
                requests_success,
                requests_failed,
                requests_cancelled,
                ttft_seconds,
                request_duration,
                tokens_per_second,
                tokens_generated_total,
                active_requests,
            },
            resources: ResourceMetrics {
                model_bytes,
                kv_cache_bytes,
                active_sessions,
                scratch_rented_total,
                scratch_recycled_total,
                scratch_allocated_total,
            },
        }
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_construction() {
        let metrics = MetricsRegistry::new();
        metrics.inference.requests_total.inc();
        metrics.inference.tokens_generated_total.inc_by(3);
        metrics.resources.active_sessions.set(2);

        assert_eq!(metrics.inference.requests_total.get(), 1);
        assert_eq!(metrics.inference.tokens_generated_total.get(), 3);
        assert_eq!(metrics.resources.active_sessions.get(), 2);
    }

    #[test]
    fn test_global_registry_gathers() {
        METRICS.inference.requests_total.inc();
        let families = METRICS.registry.gather();
        assert!(families
            .iter()
            .any(|f| f.get_name() == "ember_requests_total"));
    }
}
