//! Prometheus instrumentation for the store.

use prometheus::{exponential_buckets, Histogram, HistogramOpts, Registry};
use std::fmt;

/// Query-shape histograms exported by the store.
#[derive(Clone)]
pub struct SeriesStoreMetrics {
    pub(crate) index_lookups_per_query: Histogram,
    pub(crate) series_pre_intersection_per_query: Histogram,
    pub(crate) series_post_intersection_per_query: Histogram,
    pub(crate) chunks_per_query: Histogram,
}

impl SeriesStoreMetrics {
    /// Create the histograms and register them with `registry`. Panics if a
    /// collector with one of the names is already registered.
    pub fn new(registry: &Registry) -> Self {
        Self {
            index_lookups_per_query: register_histogram(
                registry,
                "chunk_store_index_lookups_per_query",
                "Distribution of index lookups per query.",
                exponential_buckets(1.0, 2.0, 5),
            ),
            series_pre_intersection_per_query: register_histogram(
                registry,
                "chunk_store_series_pre_intersection_per_query",
                "Distribution of series per query, before matcher intersection.",
                exponential_buckets(10.0, 8.0, 6),
            ),
            series_post_intersection_per_query: register_histogram(
                registry,
                "chunk_store_series_post_intersection_per_query",
                "Distribution of series per query, after matcher intersection.",
                exponential_buckets(10.0, 8.0, 6),
            ),
            chunks_per_query: register_histogram(
                registry,
                "chunk_store_chunks_per_query",
                "Distribution of chunks per query.",
                exponential_buckets(10.0, 8.0, 7),
            ),
        }
    }
}

impl fmt::Debug for SeriesStoreMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SeriesStoreMetrics").finish()
    }
}

fn register_histogram(
    registry: &Registry,
    name: &str,
    help: &str,
    buckets: prometheus::Result<Vec<f64>>,
) -> Histogram {
    let opts = HistogramOpts::new(name, help).buckets(buckets.expect("bucket layout is valid"));
    let histogram = Histogram::with_opts(opts).expect("histogram options are valid");
    registry
        .register(Box::new(histogram.clone()))
        .expect("metric is not registered twice");
    histogram
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn histograms_register_and_observe() {
        let registry = Registry::new();
        let metrics = SeriesStoreMetrics::new(&registry);

        metrics.index_lookups_per_query.observe(3.0);
        metrics.chunks_per_query.observe(12.0);

        assert_eq!(metrics.index_lookups_per_query.get_sample_count(), 1);
        assert_eq!(metrics.index_lookups_per_query.get_sample_sum(), 3.0);
        assert_eq!(registry.gather().len(), 4);
    }

    #[test]
    #[should_panic(expected = "metric is not registered twice")]
    fn duplicate_registration_panics() {
        let registry = Registry::new();
        let _metrics = SeriesStoreMetrics::new(&registry);
        let _dup = SeriesStoreMetrics::new(&registry);
    }
}
