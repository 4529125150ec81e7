//! In-process counters for the Observability leaf (SPEC_FULL addition, §2).
//! Grounded on the teacher's pervasive `tracing`-plus-counters style in
//! `disk_usage_eviction_task.rs`, minus a metrics-exporter crate — this repo
//! exposes a plain snapshot struct rather than wiring a `/metrics` endpoint,
//! since no HTTP server is in scope.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct CacheMetrics {
    bytes_downloaded: AtomicU64,
    downloads_succeeded: AtomicU64,
    downloads_failed: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    evictions: AtomicU64,
    evicted_bytes: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CacheMetricsSnapshot {
    pub bytes_downloaded: u64,
    pub downloads_succeeded: u64,
    pub downloads_failed: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub evictions: u64,
    pub evicted_bytes: u64,
}

impl CacheMetrics {
    pub fn record_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_download_success(&self, bytes: u64) {
        self.bytes_downloaded.fetch_add(bytes, Ordering::Relaxed);
        self.downloads_succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_download_failure(&self) {
        self.downloads_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_eviction(&self, count: u64, bytes: u64) {
        self.evictions.fetch_add(count, Ordering::Relaxed);
        self.evicted_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CacheMetricsSnapshot {
        CacheMetricsSnapshot {
            bytes_downloaded: self.bytes_downloaded.load(Ordering::Relaxed),
            downloads_succeeded: self.downloads_succeeded.load(Ordering::Relaxed),
            downloads_failed: self.downloads_failed.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            evicted_bytes: self.evicted_bytes.load(Ordering::Relaxed),
        }
    }
}
