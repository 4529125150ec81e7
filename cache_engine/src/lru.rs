//! The eviction engine (spec.md §3.4, §3.5, §4.2).
//!
//! Age buckets are modeled as an arena of managed files owned by the Registry plus a
//! bucket-key index: files carry only a small integer bucket key, never a raw
//! pointer back to their bucket (spec.md §9 "Cyclic and back-pointer structure").
//! `BTreeMap<i64, VecDeque<Arc<ManagedFile>>>` gives the strictly-ordered
//! `bucket_keys` sequence spec.md §3.5 asks for "for free", without a parallel
//! Vec<i64> to keep in sync.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use tracing::{debug, warn};

use crate::local_fs::LocalFs;
use crate::managed_file::ManagedFile;

#[derive(Debug, Clone, Copy, Default)]
pub struct LruStats {
    pub current_capacity: i64,
    pub capacity_limit: u64,
    pub hard_item_count: usize,
    pub soft_item_count: usize,
    pub bucket_count: usize,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EvictionOutcome {
    pub evicted_bytes: u64,
    pub evicted_count: usize,
    /// True when the sweep stopped early because the only remaining candidate was
    /// the sole file in the sole bucket, or because every candidate was ineligible
    /// (spec.md §4.2 step 4, §8 "Evicting when all files are pinned").
    pub partial: bool,
}

pub struct LruState {
    origin: SystemTime,
    slice: Duration,
    buckets: Mutex<BTreeMap<i64, VecDeque<Arc<ManagedFile>>>>,
    capacity_limit: u64,
    current_capacity: AtomicI64,
    hard_item_count: AtomicUsize,
    soft_item_count: AtomicUsize,
    max_buckets: usize,
    tombstone_threshold: usize,
}

impl LruState {
    pub fn new(
        origin: SystemTime,
        slice: Duration,
        capacity_limit: u64,
        max_buckets: usize,
        tombstone_threshold: usize,
    ) -> Self {
        Self {
            origin,
            slice,
            buckets: Mutex::new(BTreeMap::new()),
            capacity_limit,
            current_capacity: AtomicI64::new(0),
            hard_item_count: AtomicUsize::new(0),
            soft_item_count: AtomicUsize::new(0),
            max_buckets,
            tombstone_threshold,
        }
    }

    fn bucket_key(&self, t: SystemTime) -> Option<i64> {
        let elapsed = t.duration_since(self.origin).ok()?;
        let slice_secs = self.slice.as_secs().max(1);
        Some((elapsed.as_secs() / slice_secs) as i64)
    }

    pub fn current_capacity(&self) -> i64 {
        self.current_capacity.load(Ordering::SeqCst)
    }

    pub fn capacity_limit(&self) -> u64 {
        self.capacity_limit
    }

    pub fn is_over_budget(&self) -> bool {
        self.current_capacity() > self.capacity_limit as i64
    }

    pub fn stats(&self) -> LruStats {
        LruStats {
            current_capacity: self.current_capacity(),
            capacity_limit: self.capacity_limit,
            hard_item_count: self.hard_item_count.load(Ordering::SeqCst),
            soft_item_count: self.soft_item_count.load(Ordering::SeqCst),
            bucket_count: self.buckets.lock().unwrap().len(),
        }
    }

    pub fn should_rebuild_index(&self) -> bool {
        let hard = self.hard_item_count.load(Ordering::SeqCst);
        let soft = self.soft_item_count.load(Ordering::SeqCst);
        soft.saturating_sub(hard) >= self.tombstone_threshold
    }

    /// Applies a `size_local` delta (positive or negative) to `current_capacity`,
    /// the bridge described in spec.md §4.3 `subscribe_to_size_change`.
    pub fn apply_capacity_delta(&self, delta: i64) {
        if delta != 0 {
            self.current_capacity.fetch_add(delta, Ordering::SeqCst);
        }
    }

    /// Assigns `file` to the bucket matching its current `last_access`. Rejects
    /// (returns `false`) timestamps older than `origin` (spec.md §3.5, §8).
    pub fn admit(&self, file: Arc<ManagedFile>) -> bool {
        let Some(key) = self.bucket_key(file.last_access()) else {
            return false;
        };
        {
            let mut buckets = self.buckets.lock().unwrap();
            buckets.entry(key).or_default().push_front(Arc::clone(&file));
        }
        file.set_bucket_key(key);
        self.current_capacity
            .fetch_add(file.size_local() as i64, Ordering::SeqCst);
        self.hard_item_count.fetch_add(1, Ordering::SeqCst);
        self.soft_item_count.fetch_add(1, Ordering::SeqCst);
        true
    }

    /// Re-examines `file`'s `last_access`; moves it to a newer bucket if it has
    /// crossed the slice boundary since it was last placed. No-op otherwise
    /// (spec.md §4.2 "A newly touched file is moved lazily").
    pub fn touch(&self, file: &Arc<ManagedFile>) {
        let Some(new_key) = self.bucket_key(file.last_access()) else {
            return;
        };
        if file.bucket_key() == Some(new_key) {
            return;
        }
        let mut buckets = self.buckets.lock().unwrap();
        if let Some(old_key) = file.bucket_key() {
            if let Some(list) = buckets.get_mut(&old_key) {
                if let Some(pos) = list.iter().position(|f| Arc::ptr_eq(f, file)) {
                    list.remove(pos);
                }
                if list.is_empty() {
                    buckets.remove(&old_key);
                }
            }
        }
        buckets.entry(new_key).or_default().push_front(Arc::clone(file));
        drop(buckets);
        file.set_bucket_key(new_key);
    }

    /// Removes every remaining reference to `file` from the bucket structure
    /// without deleting its bytes — used when the Registry force-removes a pinned
    /// file's reservation after all pins have finally dropped.
    pub fn forget(&self, file: &Arc<ManagedFile>) {
        if let Some(key) = file.bucket_key() {
            let mut buckets = self.buckets.lock().unwrap();
            if let Some(list) = buckets.get_mut(&key) {
                if let Some(pos) = list.iter().position(|f| Arc::ptr_eq(f, file)) {
                    list.remove(pos);
                }
                if list.is_empty() {
                    buckets.remove(&key);
                }
            }
        }
    }

    /// Cooperative eviction (spec.md §4.2 `evict_to_budget`).
    ///
    /// Phase 1 (identification, lock held, no file I/O): walk buckets oldest to
    /// newest, oldest-touched-first within a bucket, calling
    /// `try_mark_for_deletion` and removing successful candidates from the bucket
    /// structure. Phase 2 (outside the lock): physically delete the bytes of every
    /// file marked in phase 1.
    pub async fn evict_to_budget(&self, local_fs: &dyn LocalFs) -> EvictionOutcome {
        if self.exceeds_safety_cap() {
            warn!("LRU bucket count exceeds safety cap, clearing index instead of sweeping");
            return self.clear_all(local_fs).await;
        }

        let mut marked: Vec<Arc<ManagedFile>> = Vec::new();
        let mut partial = false;

        {
            let mut buckets = self.buckets.lock().unwrap();

            let sole_bucket_sole_file = buckets.len() == 1
                && buckets.values().next().map(|l| l.len()) == Some(1);

            if sole_bucket_sole_file {
                // Never evict the sole file in the sole bucket (spec.md §4.2 step 4).
                partial = true;
            } else {
                'sweep: for key in buckets.keys().copied().collect::<Vec<_>>() {
                    let Some(list) = buckets.get_mut(&key) else {
                        continue;
                    };
                    // Oldest-touched-first within a bucket: back of the deque,
                    // since touches push to the front.
                    let mut idx = list.len();
                    while idx > 0 {
                        idx -= 1;
                        if self.current_capacity() <= self.capacity_limit as i64 {
                            break 'sweep;
                        }
                        if list[idx].try_mark_for_deletion() {
                            let file = list.remove(idx).unwrap();
                            self.current_capacity
                                .fetch_sub(file.size_local() as i64, Ordering::SeqCst);
                            self.hard_item_count.fetch_sub(1, Ordering::SeqCst);
                            marked.push(file);
                        }
                    }
                    if list.is_empty() {
                        buckets.remove(&key);
                    }
                }
                if self.current_capacity() > self.capacity_limit as i64 && marked.is_empty() {
                    partial = true;
                }
            }
        }

        let mut evicted_bytes = 0u64;
        for file in &marked {
            let size = file.size_local();
            if let Err(e) = file.finalize_delete(local_fs).await {
                warn!(path = %file.local_path, error = %e, "failed to delete evicted file's bytes");
            }
            evicted_bytes += size;
        }

        debug!(
            evicted_count = marked.len(),
            evicted_bytes, partial, "eviction sweep finished"
        );

        EvictionOutcome {
            evicted_bytes,
            evicted_count: marked.len(),
            partial,
        }
    }

    fn exceeds_safety_cap(&self) -> bool {
        self.buckets.lock().unwrap().len() > self.max_buckets
    }

    /// Clears the entire LRU (spec.md §4.2 step 5: safety cap exceeded, or an
    /// external validity predicate failed). Every tracked file is marked for
    /// deletion and its bytes removed.
    pub async fn clear_all(&self, local_fs: &dyn LocalFs) -> EvictionOutcome {
        let drained: Vec<Arc<ManagedFile>> = {
            let mut buckets = self.buckets.lock().unwrap();
            let mut all = Vec::new();
            for (_, list) in buckets.iter() {
                all.extend(list.iter().cloned());
            }
            buckets.clear();
            all
        };

        let mut evicted_bytes = 0u64;
        let mut evicted_count = 0usize;
        for file in drained {
            if file.try_mark_for_deletion() {
                let size = file.size_local();
                self.current_capacity.fetch_sub(size as i64, Ordering::SeqCst);
                self.hard_item_count.fetch_sub(1, Ordering::SeqCst);
                if let Err(e) = file.finalize_delete(local_fs).await {
                    warn!(path = %file.local_path, error = %e, "failed to delete file's bytes during full clear");
                }
                evicted_bytes += size;
                evicted_count += 1;
            }
        }
        EvictionOutcome {
            evicted_bytes,
            evicted_count,
            partial: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local_fs::TokioLocalFs;
    use cache_fs::{FileSystemDescriptor, Kind, RemotePath};
    use camino::Utf8PathBuf;

    fn idle_file(tmp: &camino_tempfile::Utf8TempDir, name: &str, size: u64, last_access: SystemTime) -> Arc<ManagedFile> {
        let path = tmp.path().join(name);
        std::fs::write(path.as_std_path(), vec![0u8; size as usize]).unwrap();
        let f = ManagedFile::reconstructed_idle(
            path,
            format!("hdfs://h:1/{name}"),
            RemotePath::from_string(name).unwrap(),
            FileSystemDescriptor::new(Kind::Hdfs, "h", 1),
            size,
            last_access,
        );
        Arc::new(f)
    }

    #[tokio::test]
    async fn admits_and_evicts_oldest_first() {
        let tmp = camino_tempfile::tempdir().unwrap();
        let origin = SystemTime::now() - Duration::from_secs(3600);
        let lru = LruState::new(origin, Duration::from_secs(60), 150, 5000, 200);

        let old = idle_file(&tmp, "old", 100, origin + Duration::from_secs(10));
        let newer = idle_file(&tmp, "newer", 100, origin + Duration::from_secs(500));

        assert!(lru.admit(Arc::clone(&old)));
        assert!(lru.admit(Arc::clone(&newer)));
        assert_eq!(lru.current_capacity(), 200);
        assert!(lru.is_over_budget());

        let outcome = lru.evict_to_budget(&TokioLocalFs).await;
        assert_eq!(outcome.evicted_count, 1);
        assert_eq!(old.state(), crate::managed_file::State::MarkedForDeletion);
        assert_eq!(newer.state(), crate::managed_file::State::Idle);
        assert!(lru.current_capacity() <= 150);
    }

    #[tokio::test]
    async fn admit_rejects_timestamp_before_origin() {
        let tmp = camino_tempfile::tempdir().unwrap();
        let origin = SystemTime::now();
        let lru = LruState::new(origin, Duration::from_secs(60), 1_000_000, 5000, 200);
        let too_old = idle_file(&tmp, "f", 10, origin - Duration::from_secs(10));
        assert!(!lru.admit(too_old));
        assert_eq!(lru.current_capacity(), 0);
    }

    #[tokio::test]
    async fn never_evicts_sole_file_in_sole_bucket() {
        let tmp = camino_tempfile::tempdir().unwrap();
        let origin = SystemTime::now() - Duration::from_secs(60);
        let lru = LruState::new(origin, Duration::from_secs(600), 1, 5000, 200);
        let only = idle_file(&tmp, "only", 100, origin + Duration::from_secs(1));
        lru.admit(Arc::clone(&only));

        let outcome = lru.evict_to_budget(&TokioLocalFs).await;
        assert!(outcome.partial);
        assert_eq!(outcome.evicted_count, 0);
        assert_eq!(only.state(), crate::managed_file::State::Idle);
    }

    #[tokio::test]
    async fn pinned_files_are_skipped() {
        let tmp = camino_tempfile::tempdir().unwrap();
        let origin = SystemTime::now() - Duration::from_secs(600);
        let lru = LruState::new(origin, Duration::from_secs(60), 50, 5000, 200);
        let pinned = idle_file(&tmp, "pinned", 100, origin + Duration::from_secs(1));
        assert!(pinned.pin().await);
        lru.admit(Arc::clone(&pinned));

        let outcome = lru.evict_to_budget(&TokioLocalFs).await;
        assert!(outcome.partial);
        assert_eq!(outcome.evicted_count, 0);
    }
}
