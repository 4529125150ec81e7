//! The single process-wide context (spec.md §9 "Singletons"): created by
//! `CacheEngine::init` (the `cacheInit` equivalent) and torn down by
//! `CacheEngine::shutdown` (`cacheShutdown`). Every sub-component receives an
//! explicit `Arc` handle into this context; there are no ambient globals beyond
//! the single engine handle the caller holds.

use std::sync::Arc;

use cache_fs::{FileSystemDescriptor, RemoteFs, RemotePath};
use cache_util::{RequestId, ShutdownGuard};

use crate::config::CacheConfig;
use crate::error::{Error, Result};
use crate::facade::Facade;
use crate::local_fs::LocalFs;
use crate::metrics::{CacheMetrics, CacheMetricsSnapshot};
use crate::prepare::PrepareTable;
use crate::progress::FileProgress;
use crate::registry::Registry;

pub struct CacheEngine<F: RemoteFs, L: LocalFs> {
    registry: Arc<Registry<F, L>>,
    facade: Facade<F, L>,
    prepare_table: PrepareTable<F, L>,
    metrics: Arc<CacheMetrics>,
    shutdown: ShutdownGuard,
}

impl<F: RemoteFs, L: LocalFs> CacheEngine<F, L> {
    /// `cacheInit(limit_percent, root, slice, hard_bytes)` (spec.md §6.1),
    /// expressed as a typed [`CacheConfig`] rather than the raw four-argument
    /// signature (see [`CacheConfig::capacity_from_percent`] for the percent/
    /// hard-cap resolution this call shape replaces).
    pub async fn init(config: CacheConfig, remote_fs: F, local_fs: L) -> Result<Self> {
        let registry = Arc::new(
            Registry::configure(config, Arc::new(remote_fs), Arc::new(local_fs)).await?,
        );
        let facade = Facade::new(Arc::clone(&registry));
        let prepare_table = PrepareTable::new(Arc::clone(&registry));
        Ok(Self {
            registry,
            facade,
            prepare_table,
            metrics: Arc::new(CacheMetrics::default()),
            shutdown: ShutdownGuard::default(),
        })
    }

    /// `cacheConfigureFileSystem` (spec.md §6.1): idempotent.
    pub async fn configure_file_system(&self, descriptor: FileSystemDescriptor) -> Result<()> {
        if self.registry.is_registered(&descriptor) {
            return Ok(());
        }
        self.registry.register_remote_fs(descriptor).await
    }

    pub fn facade(&self) -> &Facade<F, L> {
        &self.facade
    }

    pub fn metrics(&self) -> CacheMetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn registry(&self) -> &Arc<Registry<F, L>> {
        &self.registry
    }

    /// `cachePrepareData` (spec.md §6.1): rejected once shutdown has begun.
    pub async fn prepare_data<C>(
        &self,
        descriptor: FileSystemDescriptor,
        paths: Vec<RemotePath>,
        progress_cb: C,
    ) -> Result<RequestId>
    where
        C: FnOnce(Vec<FileProgress>) + Send + 'static,
    {
        if self.shutdown.is_shutting_down() {
            return Err(Error::AsyncRejected);
        }
        Ok(self.prepare_table.prepare_dataset(descriptor, paths, progress_cb).await)
    }

    /// `cacheCancelPrepareData`.
    pub async fn cancel_prepare_data(&self, id: RequestId) -> Result<()> {
        self.prepare_table.cancel(id).await
    }

    /// `cacheCheckPrepareStatus`.
    pub async fn check_prepare_status(
        &self,
        id: RequestId,
    ) -> Result<(Vec<FileProgress>, bool)> {
        self.prepare_table.check_status(id).await
    }

    /// Runs one eviction sweep immediately, independent of the background
    /// interval (spec.md §4.2 `evict_to_budget`, exposed here for tests and for
    /// operators who want an on-demand sweep).
    pub async fn run_eviction_sweep(&self) -> crate::lru::EvictionOutcome {
        let outcome = self.registry.lru.evict_to_budget(self.registry.local_fs().as_ref()).await;
        self.metrics.record_eviction(outcome.evicted_count as u64, outcome.evicted_bytes);
        self.registry.index_rebuild().await;
        outcome
    }

    /// `cacheShutdown(force, update_clients)` (spec.md §6.1): idempotent;
    /// already-in-progress calls observe `FinalizationInProgress`.
    pub async fn shutdown(&self, _force: bool, _update_clients: bool) -> Result<()> {
        if self.shutdown.is_shutting_down() {
            return Err(Error::FinalizationInProgress);
        }
        self.shutdown.begin_shutdown();
        Ok(())
    }
}
