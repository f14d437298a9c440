//! Prometheus metrics for synchronization and data-feeding observability.

use std::sync::OnceLock;

use prometheus::{
    Counter, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};

/// Global metrics registry
static REGISTRY: OnceLock<MetricsRegistry> = OnceLock::new();

/// Collection of all coordination metrics
pub struct MetricsRegistry {
    pub registry: Registry,

    // Synchronization metrics
    pub sync_iterations: Counter,
    pub broadcast_seconds: Histogram,
    pub reduce_seconds: Histogram,
    pub transfer_elements: Counter,

    // Queue metrics
    pub queue_wait_seconds: Histogram,

    // Data-feeding metrics
    pub records_read: Counter,
    pub source_epochs: Counter,
    pub attached_queues: Gauge,
}

impl MetricsRegistry {
    /// Create a new metrics registry with all metrics registered.
    pub fn new() -> Self {
        let registry = Registry::new();

        let sync_iterations = Counter::with_opts(Opts::new(
            "treesync_iterations_total",
            "Completed synchronized iterations",
        ))
        .unwrap();
        registry.register(Box::new(sync_iterations.clone())).unwrap();

        let broadcast_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "treesync_broadcast_seconds",
                "Time per worker spent in the broadcast half of an iteration",
            )
            .buckets(vec![1e-5, 1e-4, 1e-3, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        )
        .unwrap();
        registry.register(Box::new(broadcast_seconds.clone())).unwrap();

        let reduce_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "treesync_reduce_seconds",
                "Time per worker spent in the reduce half of an iteration",
            )
            .buckets(vec![1e-5, 1e-4, 1e-3, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        )
        .unwrap();
        registry.register(Box::new(reduce_seconds.clone())).unwrap();

        let transfer_elements = Counter::with_opts(Opts::new(
            "treesync_transfer_elements_total",
            "Elements moved between device buffers",
        ))
        .unwrap();
        registry.register(Box::new(transfer_elements.clone())).unwrap();

        let queue_wait_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "treesync_queue_wait_seconds",
                "Time spent blocked on empty queues",
            )
            .buckets(vec![1e-4, 1e-3, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0]),
        )
        .unwrap();
        registry.register(Box::new(queue_wait_seconds.clone())).unwrap();

        let records_read = Counter::with_opts(Opts::new(
            "treesync_records_read_total",
            "Records distributed to sample queues",
        ))
        .unwrap();
        registry.register(Box::new(records_read.clone())).unwrap();

        let source_epochs = Counter::with_opts(Opts::new(
            "treesync_source_epochs_total",
            "Times a source wrapped back to its first record",
        ))
        .unwrap();
        registry.register(Box::new(source_epochs.clone())).unwrap();

        let attached_queues = Gauge::with_opts(Opts::new(
            "treesync_attached_queues",
            "Sample queues currently served by reader bodies",
        ))
        .unwrap();
        registry.register(Box::new(attached_queues.clone())).unwrap();

        Self {
            registry,
            sync_iterations,
            broadcast_seconds,
            reduce_seconds,
            transfer_elements,
            queue_wait_seconds,
            records_read,
            source_epochs,
            attached_queues,
        }
    }

    /// Encode all metrics in the Prometheus text format.
    pub fn gather(&self) -> String {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut out = Vec::new();
        encoder.encode(&families, &mut out).unwrap();
        String::from_utf8(out).unwrap()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Process-wide registry, created on first use.
pub fn global() -> &'static MetricsRegistry {
    REGISTRY.get_or_init(MetricsRegistry::new)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_show_up_in_the_text_exposition() {
        let metrics = global();
        metrics.records_read.inc();
        let text = metrics.gather();
        assert!(text.contains("treesync_records_read_total"));
        assert!(text.contains("treesync_iterations_total"));
    }

    #[test]
    fn standalone_registry_starts_at_zero() {
        let metrics = MetricsRegistry::new();
        assert_eq!(metrics.sync_iterations.get(), 0.0);
        assert_eq!(metrics.attached_queues.get(), 0.0);
    }
}
