//! Metrics collection and Prometheus exporter for the cache engine
//!
//! Mirrors the shape of a hand-rolled collector/exporter pair: a
//! [`CacheMetricsCollector`] holds the latest [`crate::engine::EngineStats`]
//! snapshot, and a [`PrometheusExporter`] formats it as Prometheus text
//! format on demand. There is no background scrape loop here — callers
//! push a fresh snapshot whenever they like (typically right after
//! [`crate::engine::CacheEngine::stats`]) and an HTTP handler calls
//! [`PrometheusExporter::export`] per request.

use crate::engine::EngineStats;
use std::fmt::Write as _;
use parking_lot::RwLock;

/// Holds the most recently observed engine statistics snapshot.
pub struct CacheMetricsCollector {
    latest: RwLock<Option<EngineStats>>,
}

impl CacheMetricsCollector {
    pub fn new() -> Self {
        Self { latest: RwLock::new(None) }
    }

    pub fn update(&self, stats: EngineStats) {
        *self.latest.write() = Some(stats);
    }

    pub fn latest(&self) -> Option<EngineStats> {
        self.latest.read().clone()
    }
}

impl Default for CacheMetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// Prometheus text format exporter for [`EngineStats`].
#[derive(Debug)]
pub struct PrometheusExporter {
    prefix: String,
}

impl PrometheusExporter {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self { prefix: prefix.into() }
    }

    /// Export the collector's latest snapshot in Prometheus text format.
    /// Returns an empty string if no snapshot has been pushed yet.
    pub fn export(&self, collector: &CacheMetricsCollector) -> String {
        let mut output = String::with_capacity(2 * 1024);
        let Some(stats) = collector.latest() else {
            return output;
        };

        self.write_help(&mut output, "dirty_bytes", "Bytes dirtied but not yet submitted");
        self.write_type(&mut output, "dirty_bytes", "gauge");
        self.write_metric(&mut output, "dirty_bytes", stats.dirty_bytes as f64);

        self.write_help(&mut output, "submitted_bytes", "Bytes currently in flight to the backend");
        self.write_type(&mut output, "submitted_bytes", "gauge");
        self.write_metric(&mut output, "submitted_bytes", stats.submitted_bytes as f64);

        self.write_help(&mut output, "total_submitted_bytes", "Lifetime bytes submitted to the backend");
        self.write_type(&mut output, "total_submitted_bytes", "counter");
        self.write_metric(&mut output, "total_submitted_bytes", stats.total_submitted_bytes as f64);

        self.write_help(&mut output, "num_dirty_items", "Count of dirty cache entries");
        self.write_type(&mut output, "num_dirty_items", "gauge");
        self.write_metric(&mut output, "num_dirty_items", stats.num_dirty_items as f64);

        self.write_help(&mut output, "num_memfile_items", "Count of entries backed by in-memory memfiles");
        self.write_type(&mut output, "num_memfile_items", "gauge");
        self.write_metric(&mut output, "num_memfile_items", stats.num_memfile_items as f64);

        self.write_help(&mut output, "cache_size_bytes", "Current total cache footprint on disk");
        self.write_type(&mut output, "cache_size_bytes", "gauge");
        self.write_metric(&mut output, "cache_size_bytes", stats.cache_size as f64);

        self.write_help(&mut output, "comp_bytes", "Bytes stored in compressed form");
        self.write_type(&mut output, "comp_bytes", "gauge");
        self.write_metric(&mut output, "comp_bytes", stats.comp_bytes as f64);

        self.write_help(&mut output, "memfile_bytes", "Bytes held in memfiles");
        self.write_type(&mut output, "memfile_bytes", "gauge");
        self.write_metric(&mut output, "memfile_bytes", stats.memfile_bytes as f64);

        self.write_help(&mut output, "submitted_memfile_bytes", "Memfile bytes currently in flight");
        self.write_type(&mut output, "submitted_memfile_bytes", "gauge");
        self.write_metric(&mut output, "submitted_memfile_bytes", stats.submitted_memfile_bytes as f64);

        self.write_help(&mut output, "congested", "1 if the engine is currently throttling writers");
        self.write_type(&mut output, "congested", "gauge");
        self.write_metric(&mut output, "congested", if stats.is_congested { 1.0 } else { 0.0 });

        self.write_help(&mut output, "hits_total", "Lifetime cache hits");
        self.write_type(&mut output, "hits_total", "counter");
        self.write_metric(&mut output, "hits_total", stats.total_hits as f64);

        self.write_help(&mut output, "memory_hits_total", "Lifetime memfile hits");
        self.write_type(&mut output, "memory_hits_total", "counter");
        self.write_metric(&mut output, "memory_hits_total", stats.total_memory_hits as f64);

        self.write_help(&mut output, "cache_miss_backend_total", "Lifetime misses that fetched from the backend");
        self.write_type(&mut output, "cache_miss_backend_total", "counter");
        self.write_metric(&mut output, "cache_miss_backend_total", stats.total_cache_miss_backend as f64);

        self.write_help(
            &mut output,
            "cache_miss_decompress_total",
            "Lifetime misses served by decompressing a cached block",
        );
        self.write_type(&mut output, "cache_miss_decompress_total", "counter");
        self.write_metric(&mut output, "cache_miss_decompress_total", stats.total_cache_miss_decompress as f64);

        self.write_help(&mut output, "dirty_ops_total", "Lifetime dirty operations");
        self.write_type(&mut output, "dirty_ops_total", "counter");
        self.write_metric(&mut output, "dirty_ops_total", stats.total_dirty_ops as f64);

        self.write_help(&mut output, "put_ops_total", "Lifetime put operations");
        self.write_type(&mut output, "put_ops_total", "counter");
        self.write_metric(&mut output, "put_ops_total", stats.total_put_ops as f64);

        self.write_help(&mut output, "compress_ops_total", "Lifetime background compressions");
        self.write_type(&mut output, "compress_ops_total", "counter");
        self.write_metric(&mut output, "compress_ops_total", stats.total_compress_ops as f64);

        self.write_help(&mut output, "transid", "Current transaction id");
        self.write_type(&mut output, "transid", "gauge");
        self.write_metric(&mut output, "transid", stats.transid.0 as f64);

        self.write_help(&mut output, "basetransid", "Base (last committed) transaction id");
        self.write_type(&mut output, "basetransid", "gauge");
        self.write_metric(&mut output, "basetransid", stats.basetransid.0 as f64);

        output
    }

    fn write_help(&self, output: &mut String, name: &str, help: &str) {
        let _ = writeln!(output, "# HELP {}_{} {}", self.prefix, name, help);
    }

    fn write_type(&self, output: &mut String, name: &str, metric_type: &str) {
        let _ = writeln!(output, "# TYPE {}_{} {}", self.prefix, name, metric_type);
    }

    fn write_metric(&self, output: &mut String, name: &str, value: f64) {
        let _ = writeln!(output, "{}_{} {}", self.prefix, name, value);
    }
}

impl Default for PrometheusExporter {
    fn default() -> Self {
        Self::new("cachekv")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::TransId;

    fn sample_stats() -> EngineStats {
        EngineStats {
            dirty_bytes: 10,
            submitted_bytes: 20,
            total_submitted_bytes: 30,
            num_dirty_items: 1,
            num_memfile_items: 2,
            cache_size: 40,
            comp_bytes: 5,
            memfile_bytes: 6,
            submitted_memfile_bytes: 7,
            is_congested: true,
            total_hits: 100,
            total_memory_hits: 50,
            total_cache_miss_backend: 3,
            total_cache_miss_decompress: 4,
            total_dirty_ops: 8,
            total_put_ops: 9,
            total_compress_ops: 1,
            transid: TransId(42),
            basetransid: TransId(41),
        }
    }

    #[test]
    fn export_with_no_snapshot_is_empty() {
        let collector = CacheMetricsCollector::new();
        let exporter = PrometheusExporter::default();
        assert_eq!(exporter.export(&collector), "");
    }

    #[test]
    fn export_contains_pushed_values() {
        let collector = CacheMetricsCollector::new();
        collector.update(sample_stats());
        let exporter = PrometheusExporter::new("cachekv");
        let text = exporter.export(&collector);
        assert!(text.contains("cachekv_dirty_bytes 10"));
        assert!(text.contains("cachekv_congested 1"));
        assert!(text.contains("cachekv_transid 42"));
        assert!(text.contains("# TYPE cachekv_hits_total counter"));
    }
}
