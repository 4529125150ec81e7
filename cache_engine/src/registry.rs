//! The single content-addressed map from canonical local path to managed file
//! (spec.md §4.3). Mediates autoloading, pinning, and deletion, and owns the LRU.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;

use camino::Utf8PathBuf;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};
use walkdir::WalkDir;

use cache_fs::{FileSystemDescriptor, RemoteFs, RemotePath};

use crate::canonical_path::{local_of, network_path_of, reverse};
use crate::config::CacheConfig;
use crate::downloader::Downloader;
use crate::error::{Error, Result};
use crate::local_fs::LocalFs;
use crate::lru::LruState;
use crate::managed_file::{ManagedFile, State};

/// A read-only snapshot of a managed file's metadata (spec.md §4.3 addition,
/// SPEC_FULL): used by metadata-only Facade entry points so they needn't pin.
#[derive(Debug, Clone)]
pub struct FileSnapshot {
    pub local_path: Utf8PathBuf,
    pub network_path: String,
    pub size_local: u64,
    pub size_remote_estimated: u64,
    pub state: State,
    pub last_access: SystemTime,
}

/// A pinned reference to a [`ManagedFile`]. Dropping it releases the pin.
pub struct Pin {
    file: Arc<ManagedFile>,
}

impl Pin {
    pub fn file(&self) -> &Arc<ManagedFile> {
        &self.file
    }
}

impl std::ops::Deref for Pin {
    type Target = ManagedFile;
    fn deref(&self) -> &ManagedFile {
        &self.file
    }
}

impl Drop for Pin {
    fn drop(&mut self) {
        self.file.unpin();
    }
}

pub struct Registry<F: RemoteFs, L: LocalFs> {
    config: CacheConfig,
    index: RwLock<HashMap<Utf8PathBuf, Arc<ManagedFile>>>,
    pub(crate) lru: Arc<LruState>,
    remote_fs: Arc<F>,
    local_fs: Arc<L>,
    downloader: Downloader<F, L>,
    registered_filesystems: std::sync::Mutex<Vec<FileSystemDescriptor>>,
}

impl<F: RemoteFs, L: LocalFs> Registry<F, L> {
    /// spec.md §4.3 `configure`.
    #[instrument(skip_all)]
    pub async fn configure(config: CacheConfig, remote_fs: Arc<F>, local_fs: Arc<L>) -> Result<Self> {
        local_fs
            .mkdir(&config.cache_root)
            .await
            .map_err(|e| Error::LocalFileOpFailure(e.to_string()))?;

        let origin = SystemTime::now() - config.slice_duration * 10_000;
        let lru = Arc::new(LruState::new(
            origin,
            config.slice_duration,
            config.capacity_limit_bytes,
            config.max_buckets,
            config.tombstone_threshold,
        ));

        let downloader = Downloader::new(
            config.clone(),
            Arc::clone(&remote_fs),
            Arc::clone(&local_fs),
            Arc::clone(&lru),
        );

        let registry = Self {
            config: config.clone(),
            index: RwLock::new(HashMap::new()),
            lru,
            remote_fs,
            local_fs,
            downloader,
            registered_filesystems: std::sync::Mutex::new(Vec::new()),
        };

        if config.autoload {
            registry.reconstruct_from_disk().await?;
        }

        Ok(registry)
    }

    /// Rescans `cache_root`, admitting discovered files as `Idle` in ascending
    /// mtime order (spec.md §4.3, §8 round-trip property). Files whose network
    /// path cannot be decoded are skipped, not deleted (spec.md §4.3).
    async fn reconstruct_from_disk(&self) -> Result<()> {
        let mut discovered: Vec<(Utf8PathBuf, u64, SystemTime)> = Vec::new();

        for entry in WalkDir::new(self.config.cache_root.as_std_path())
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(path) = Utf8PathBuf::try_from(entry.path().to_path_buf()) else {
                continue;
            };
            if path.as_str().ends_with("_tmp") {
                // Leftover from an interrupted download; never resurrected.
                let _ = tokio::fs::remove_file(&path).await;
                continue;
            }
            let Ok(meta) = entry.metadata() else { continue };
            let mtime = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            discovered.push((path, meta.len(), mtime));
        }

        discovered.sort_by_key(|(_, _, mtime)| *mtime);

        let mut index = self.index.write().await;
        for (local_path, size, mtime) in discovered {
            let Some((descriptor, remote_rel)) = reverse(&self.config.cache_root, &local_path)
            else {
                warn!(%local_path, "skipping file whose network path cannot be decoded");
                continue;
            };
            let network_path = network_path_of(&descriptor, &remote_rel);
            let file = Arc::new(ManagedFile::reconstructed_idle(
                local_path.clone(),
                network_path,
                remote_rel,
                descriptor,
                size,
                mtime,
            ));
            if self.lru.admit(Arc::clone(&file)) {
                index.insert(local_path, file);
            }
        }
        info!(reconstructed = index.len(), "cache reconstructed from disk");
        Ok(())
    }

    /// Idempotent registration of a remote filesystem (spec.md §4.3
    /// `register_remote_fs`).
    pub async fn register_remote_fs(&self, descriptor: FileSystemDescriptor) -> Result<()> {
        self.remote_fs.register(&descriptor).await?;
        let mut registered = self.registered_filesystems.lock().unwrap();
        if !registered.contains(&descriptor) {
            registered.push(descriptor);
        }
        Ok(())
    }

    pub fn is_registered(&self, descriptor: &FileSystemDescriptor) -> bool {
        self.registered_filesystems.lock().unwrap().contains(descriptor)
    }

    pub fn lru_stats(&self) -> crate::lru::LruStats {
        self.lru.stats()
    }

    async fn maybe_evict(&self) {
        if self.lru.is_over_budget() {
            self.lru.evict_to_budget(self.local_fs.as_ref()).await;
        }
    }

    /// The hot path (spec.md §4.3 `get_or_load`).
    #[instrument(skip(self), fields(network_path = %network_path))]
    pub async fn get_or_load(
        &self,
        descriptor: FileSystemDescriptor,
        remote_rel: RemotePath,
        network_path: String,
    ) -> Result<Pin> {
        loop {
            let local_path = local_of(&self.config.cache_root, &descriptor, &remote_rel);

            let existing = {
                let index = self.index.read().await;
                index.get(&local_path).cloned()
            };

            if let Some(file) = existing {
                if file.state() == State::MarkedForDeletion {
                    file.wait_until_finalized().await;
                    self.index.write().await.remove(&local_path);
                    continue;
                }

                if file.pin().await {
                    self.lru.touch(&file);
                    debug!(%local_path, "cache hit");
                    return Ok(Pin { file });
                }

                // Pin failed: either Forbidden or the race lost to a concurrent
                // MarkedForDeletion transition. If Forbidden and past cooldown,
                // kick off an async resync; either way this call fails.
                if file.is_past_cooldown() {
                    self.downloader.spawn_resync(Arc::clone(&file));
                }
                if file.state() == State::Forbidden {
                    return Err(file.last_failure().map(Error::from).unwrap_or(Error::CacheObjectForbidden));
                }
                continue;
            }

            // Miss: construct, claim, admit, pin, dispatch, wait.
            debug!(%local_path, "cache miss");
            let stat = self.remote_fs.stat(&descriptor, &remote_rel).await;
            let size_remote_estimated = match &stat {
                Ok(s) => s.size,
                // spec.md §6.5 Open Questions #1: the missing-remote placeholder
                // behavior is preserved; see DESIGN.md.
                Err(_) => 0,
            };

            let file = Arc::new(ManagedFile::new_amorphous(
                local_path.clone(),
                network_path.clone(),
                remote_rel.clone(),
                descriptor.clone(),
                None,
                size_remote_estimated,
                SystemTime::now(),
            ));

            let winner = {
                let mut index = self.index.write().await;
                index
                    .entry(local_path.clone())
                    .or_insert_with(|| Arc::clone(&file))
                    .clone()
            };
            if !Arc::ptr_eq(&winner, &file) {
                // Someone else's construction won the index slot first; retry
                // the lookup so we pin (and wait on, if still downloading)
                // their file instead of downloading our own orphan copy
                // (spec.md §8 invariant 7, single-downloader guarantee).
                continue;
            }

            if !file.claim_for_download() {
                // We just won the index slot for a freshly constructed
                // Amorphous file; this should never fail. Retry defensively.
                continue;
            }

            self.lru.admit(Arc::clone(&file));

            self.downloader.prepare(Arc::clone(&file)).await?;

            if !file.pin().await {
                return Err(file
                    .last_failure()
                    .map(Error::from)
                    .unwrap_or(Error::CacheObjectForbidden));
            }
            self.lru.touch(&file);
            self.maybe_evict().await;
            return Ok(Pin { file });
        }
    }

    /// Schedules removal. Deferred until all pins drop if currently pinned.
    pub async fn remove(&self, local_path: &Utf8PathBuf, physical: bool) -> Result<()> {
        let file = {
            let index = self.index.read().await;
            index.get(local_path).cloned()
        };
        let Some(file) = file else {
            return Err(Error::CacheObjectNotFound);
        };

        loop {
            if file.try_mark_for_deletion() {
                break;
            }
            if file.open_handles() == 0 && file.state() != State::Idle {
                // Not eligible right now (in progress, already gone, etc).
                return Err(Error::CacheObjectUnderFinalization);
            }
            file.wait_for_state_change().await;
        }

        self.lru.forget(&file);
        if physical {
            file.finalize_delete(self.local_fs.as_ref())
                .await
                .map_err(|e| Error::LocalFileOpFailure(e.to_string()))?;
        }
        self.index.write().await.remove(local_path);
        Ok(())
    }

    /// Computes the canonical local path for `(descriptor, remote_rel)` without
    /// touching the index or the remote filesystem.
    pub fn local_path_for(&self, descriptor: &FileSystemDescriptor, remote_rel: &RemotePath) -> Utf8PathBuf {
        local_of(&self.config.cache_root, descriptor, remote_rel)
    }

    /// Drops `local_path` from the index and the LRU's bucket structure without
    /// deleting bytes on disk — used by the Facade's `rename` after the bytes
    /// have already been moved out from under the old path.
    pub async fn forget_local(&self, local_path: &Utf8PathBuf) {
        let file = self.index.write().await.remove(local_path);
        if let Some(file) = file {
            self.lru.forget(&file);
        }
    }

    pub async fn snapshot(&self, local_path: &Utf8PathBuf) -> Option<FileSnapshot> {
        let index = self.index.read().await;
        let file = index.get(local_path)?;
        Some(FileSnapshot {
            local_path: file.local_path.clone(),
            network_path: file.network_path.clone(),
            size_local: file.size_local(),
            size_remote_estimated: file.size_remote_estimated(),
            state: file.state(),
            last_access: file.last_access(),
        })
    }

    /// Reaps tombstoned (removed-but-still-indexed) entries once the soft/hard
    /// ratio crosses the configured threshold (spec.md §4.2 `index_rebuild`,
    /// §9 "Weak references vs. tombstones").
    pub async fn index_rebuild(&self) {
        if !self.lru.should_rebuild_index() {
            return;
        }
        let mut index = self.index.write().await;
        index.retain(|_, f| f.state() != State::MarkedForDeletion);
        debug!(remaining = index.len(), "index rebuilt, tombstones reaped");
    }

    pub fn local_fs(&self) -> &Arc<L> {
        &self.local_fs
    }

    pub fn remote_fs(&self) -> &Arc<F> {
        &self.remote_fs
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn downloader(&self) -> &Downloader<F, L> {
        &self.downloader
    }
}
