//! Typed engine configuration (SPEC_FULL ambient-stack addition), grounded on the
//! teacher's `PageServerConf` / `DiskUsageEvictionTaskConfig` pattern: tunables are
//! named config fields with `humantime_serde`-decoded durations, not inline magic
//! numbers.

use std::time::Duration;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

/// Retry/backoff policy for the downloader's remote-I/O retry loop (spec.md §4.4
/// step 5: "retry up to 3 times with a 2-second backoff").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_secs(2),
        }
    }
}

/// The minimum time between successive download attempts for a `Forbidden` file
/// (spec.md §3.3 `retry_cooldown_deadline`, glossary "Cooldown").
fn default_cooldown() -> Duration {
    Duration::from_secs(30)
}

fn default_slice_duration() -> Duration {
    Duration::from_secs(600)
}

fn default_eviction_interval() -> Duration {
    Duration::from_secs(600)
}

fn default_max_buckets() -> usize {
    5000
}

fn default_tombstone_threshold() -> usize {
    200
}

fn default_download_buffer_bytes() -> usize {
    17 * 1024
}

fn default_download_concurrency() -> usize {
    8
}

fn default_estimate_concurrency() -> usize {
    32
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Absolute local filesystem root the cache materializes objects under.
    pub cache_root: Utf8PathBuf,
    /// Total-byte budget (spec.md §3.5 `capacity_limit`).
    pub capacity_limit_bytes: u64,
    /// Age-bucket width (spec.md §3.4/§3.5 `slice_duration`).
    #[serde(with = "humantime_serde", default = "default_slice_duration")]
    pub slice_duration: Duration,
    /// Whether `configure` rescans `cache_root` to reconstruct managed files on
    /// startup (spec.md §4.3 `configure(..., autoload=true)`).
    #[serde(default = "default_true")]
    pub autoload: bool,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(with = "humantime_serde", default = "default_cooldown")]
    pub forbidden_cooldown: Duration,
    /// How often `evict_to_budget` runs unprompted, in addition to being triggered
    /// by admission/growth (spec.md §4.2).
    #[serde(with = "humantime_serde", default = "default_eviction_interval")]
    pub eviction_interval: Duration,
    #[serde(default = "default_max_buckets")]
    pub max_buckets: usize,
    #[serde(default = "default_tombstone_threshold")]
    pub tombstone_threshold: usize,
    #[serde(default = "default_download_buffer_bytes")]
    pub download_buffer_bytes: usize,
    #[serde(default = "default_download_concurrency")]
    pub download_worker_concurrency: usize,
    #[serde(default = "default_estimate_concurrency")]
    pub estimate_worker_concurrency: usize,
}

fn default_true() -> bool {
    true
}

impl CacheConfig {
    pub fn new(cache_root: Utf8PathBuf, capacity_limit_bytes: u64) -> Self {
        Self {
            cache_root,
            capacity_limit_bytes,
            slice_duration: default_slice_duration(),
            autoload: true,
            retry: RetryPolicy::default(),
            forbidden_cooldown: default_cooldown(),
            eviction_interval: default_eviction_interval(),
            max_buckets: default_max_buckets(),
            tombstone_threshold: default_tombstone_threshold(),
            download_buffer_bytes: default_download_buffer_bytes(),
            download_worker_concurrency: default_download_concurrency(),
            estimate_worker_concurrency: default_estimate_concurrency(),
        }
    }

    /// Parses `cacheInit`'s `limit_percent`/`hard_bytes` pair (spec.md §6.1) into a
    /// concrete byte budget, given the filesystem's total capacity at `cache_root`.
    pub fn capacity_from_percent(total_fs_bytes: u64, limit_percent: u8, hard_bytes: u64) -> u64 {
        let from_percent = (total_fs_bytes as f64 * (limit_percent as f64 / 100.0)) as u64;
        if hard_bytes > 0 {
            from_percent.min(hard_bytes)
        } else {
            from_percent
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hard_bytes_caps_percent_based_limit() {
        let limit = CacheConfig::capacity_from_percent(1_000_000_000, 50, 100_000_000);
        assert_eq!(limit, 100_000_000);
    }

    #[test]
    fn zero_hard_bytes_means_unbounded_by_hard_cap() {
        let limit = CacheConfig::capacity_from_percent(1_000_000_000, 10, 0);
        assert_eq!(limit, 100_000_000);
    }
}
