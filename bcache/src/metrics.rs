//! Metrics for [super::Cache].

use commonware_runtime::Metrics as RuntimeMetrics;
use prometheus_client::metrics::{counter::Counter, gauge::Gauge};

/// Metrics for [super::Cache].
#[derive(Default)]
pub struct Metrics {
    /// Descriptors in the pool.
    pub buffers: Gauge,
    /// Lookups that found the block already cached.
    pub hits: Counter,
    /// Descriptors bound to a new block.
    pub misses: Counter,
    /// Descriptors rebound away from a previously cached block.
    pub evictions: Counter,
    /// Read requests submitted to the device.
    pub reads: Counter,
    /// Read-ahead requests submitted to the device.
    pub read_aheads: Counter,
    /// Write requests submitted to the device.
    pub writes: Counter,
    /// Times an allocation waited because every descriptor was held.
    pub exhausted: Counter,
    /// Buffers discarded by invalidation.
    pub invalidations: Counter,
}

impl Metrics {
    /// Create and register metrics with the given context.
    ///
    /// Metric names will be prefixed with the context's label.
    pub fn init<E: RuntimeMetrics>(context: &E) -> Self {
        let metrics = Self::default();
        context.register("buffers", "Descriptors in the pool", metrics.buffers.clone());
        context.register("hits", "Lookups served from the cache", metrics.hits.clone());
        context.register("misses", "Descriptors bound to a new block", metrics.misses.clone());
        context.register(
            "evictions",
            "Descriptors rebound away from a cached block",
            metrics.evictions.clone(),
        );
        context.register("reads", "Read requests submitted", metrics.reads.clone());
        context.register(
            "read_aheads",
            "Read-ahead requests submitted",
            metrics.read_aheads.clone(),
        );
        context.register("writes", "Write requests submitted", metrics.writes.clone());
        context.register(
            "exhausted",
            "Allocations that waited for a held buffer to be released",
            metrics.exhausted.clone(),
        );
        context.register(
            "invalidations",
            "Buffers discarded by invalidation",
            metrics.invalidations.clone(),
        );
        metrics
    }
}
