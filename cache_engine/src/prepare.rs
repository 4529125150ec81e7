//! The batch prepare API (SPEC_FULL addition, §4.6): a thin fan-out over
//! `Registry::get_or_load`, one task per requested path, bounded by a worker-pool
//! semaphore, aggregating `FileProgress` per path and invoking a callback once
//! the whole request resolves (spec.md §6.1 `cachePrepareData`/
//! `cacheCancelPrepareData`/`cacheCheckPrepareStatus`, §8 scenario 3).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use cache_fs::{FileSystemDescriptor, RemoteFs, RemotePath};
use cache_util::RequestId;

use crate::error::{Error, Result};
use crate::local_fs::LocalFs;
use crate::progress::{FileProgress, ProgressStatus};
use crate::registry::Registry;

struct TrackedRequest {
    progress: Vec<FileProgress>,
    cancel: CancellationToken,
    done: bool,
}

/// Owns the in-flight and completed prepare requests. One instance lives on
/// `CacheEngine` for the lifetime of the process.
pub struct PrepareTable<F: RemoteFs, L: LocalFs> {
    registry: Arc<Registry<F, L>>,
    worker_permits: Arc<Semaphore>,
    requests: Mutex<HashMap<RequestId, Arc<Mutex<TrackedRequest>>>>,
}

impl<F: RemoteFs, L: LocalFs> PrepareTable<F, L> {
    pub fn new(registry: Arc<Registry<F, L>>) -> Self {
        let concurrency = registry.config().download_worker_concurrency.max(1);
        Self {
            registry,
            worker_permits: Arc::new(Semaphore::new(concurrency)),
            requests: Mutex::new(HashMap::new()),
        }
    }

    /// spec.md §6.1 `cachePrepareData`: returns immediately with a `RequestId`;
    /// `progress_cb` fires once every path in `paths` has resolved.
    #[instrument(skip(self, paths, progress_cb))]
    pub async fn prepare_dataset<C>(
        &self,
        descriptor: FileSystemDescriptor,
        paths: Vec<RemotePath>,
        progress_cb: C,
    ) -> RequestId
    where
        C: FnOnce(Vec<FileProgress>) + Send + 'static,
    {
        let id = RequestId::generate();
        let cancel = CancellationToken::new();

        let initial: Vec<FileProgress> = paths
            .iter()
            .map(|p| {
                let local_path = self.registry.local_path_for(&descriptor, p);
                FileProgress::not_run(
                    local_path,
                    p.to_string(),
                    descriptor.clone(),
                    0,
                )
            })
            .collect();

        let tracked = Arc::new(Mutex::new(TrackedRequest {
            progress: initial,
            cancel: cancel.clone(),
            done: false,
        }));
        self.requests.lock().await.insert(id, Arc::clone(&tracked));

        let registry = Arc::clone(&self.registry);
        let permits = Arc::clone(&self.worker_permits);

        tokio::spawn(async move {
            let mut handles = Vec::with_capacity(paths.len());
            for (index, path) in paths.into_iter().enumerate() {
                let registry = Arc::clone(&registry);
                let permits = Arc::clone(&permits);
                let descriptor = descriptor.clone();
                let tracked = Arc::clone(&tracked);
                let cancel = cancel.clone();
                handles.push(tokio::spawn(async move {
                    let Ok(_permit) = permits.acquire().await else {
                        return;
                    };
                    if cancel.is_cancelled() {
                        return;
                    }
                    let started = Instant::now();
                    let network_path = crate::canonical_path::network_path_of(&descriptor, &path);
                    let result = registry
                        .get_or_load(descriptor.clone(), path.clone(), network_path)
                        .await;
                    let mut tracked = tracked.lock().await;
                    let entry = &mut tracked.progress[index];
                    match result {
                        Ok(pin) => {
                            entry.succeed(pin.size_local(), started.elapsed());
                        }
                        Err(e) => {
                            let status = ProgressStatus::from(&e);
                            entry.fail(status, e.to_string());
                        }
                    }
                }));
            }
            for h in handles {
                let _ = h.await;
            }
            let mut tracked = tracked.lock().await;
            tracked.done = true;
            progress_cb(tracked.progress.clone());
        });

        id
    }

    /// spec.md §6.1 `cacheCancelPrepareData`.
    pub async fn cancel(&self, id: RequestId) -> Result<()> {
        let requests = self.requests.lock().await;
        let tracked = requests.get(&id).ok_or(Error::RequestNotFound)?;
        tracked.lock().await.cancel.cancel();
        Ok(())
    }

    /// spec.md §6.1 `cacheCheckPrepareStatus`.
    pub async fn check_status(&self, id: RequestId) -> Result<(Vec<FileProgress>, bool)> {
        let requests = self.requests.lock().await;
        let tracked = requests.get(&id).ok_or(Error::RequestNotFound)?;
        let tracked = tracked.lock().await;
        Ok((tracked.progress.clone(), tracked.done))
    }
}

/// spec.md §6.5's ready-overall predicate used by scenario 3's "all callbacks
/// fire with `overall=true`".
pub fn overall_ready(progress: &[FileProgress]) -> bool {
    progress.iter().all(FileProgress::ready)
}
