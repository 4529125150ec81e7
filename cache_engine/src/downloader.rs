//! The byte pump that materializes a remote object into the local cache
//! (spec.md §4.4): happy path, retry/backoff on transient remote I/O errors,
//! optional transform pipeline, and the temp-file-then-rename publish step.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use cache_fs::RemoteFs;

use crate::config::CacheConfig;
use crate::error::Error;
use crate::local_fs::{tmp_path_for, LocalFs};
use crate::lru::LruState;
use crate::managed_file::{DownloadOutcome, ManagedFile, SyncFailure};
use crate::transform::{NoTransform, ProcessTransform, TransformStage};

pub struct Downloader<F: RemoteFs, L: LocalFs> {
    config: CacheConfig,
    remote_fs: Arc<F>,
    local_fs: Arc<L>,
    lru: Arc<LruState>,
}

impl<F: RemoteFs, L: LocalFs> Downloader<F, L> {
    pub fn new(config: CacheConfig, remote_fs: Arc<F>, local_fs: Arc<L>, lru: Arc<LruState>) -> Self {
        Self {
            config,
            remote_fs,
            local_fs,
            lru,
        }
    }

    /// Runs the full sync for a file already claimed (`InProgressBySync`) by the
    /// caller, and publishes its outcome. Assumed to be called at most once per
    /// claim (spec.md §4.1 "single-downloader guarantee").
    #[instrument(skip(self, file), fields(path = %file.local_path))]
    pub async fn prepare(&self, file: Arc<ManagedFile>) -> crate::error::Result<()> {
        let outcome = self.run_sync(&file).await;
        self.publish(&file, outcome);
        Ok(())
    }

    /// Fire-and-forget resync of a `Forbidden`, past-cooldown file (spec.md §4.3
    /// `get_or_load` "kick off an async resync"). Silently no-ops if the claim
    /// race is lost.
    pub fn spawn_resync(&self, file: Arc<ManagedFile>) {
        if !file.claim_for_download() {
            return;
        }
        let config = self.config.clone();
        let remote_fs = Arc::clone(&self.remote_fs);
        let local_fs = Arc::clone(&self.local_fs);
        let lru = Arc::clone(&self.lru);
        tokio::spawn(async move {
            let downloader = Downloader {
                config,
                remote_fs,
                local_fs,
                lru,
            };
            let outcome = downloader.run_sync(&file).await;
            downloader.publish(&file, outcome);
        });
    }

    fn publish(&self, file: &ManagedFile, outcome: DownloadOutcome) {
        file.publish_download(outcome, self.config.forbidden_cooldown);
    }

    async fn run_sync(&self, file: &ManagedFile) -> DownloadOutcome {
        let outcome = self.run_sync_inner(file).await;
        if matches!(outcome, DownloadOutcome::Failure(_)) {
            // Whatever was grown into `size_local`/`current_capacity` by partial
            // writes during a failed attempt must not linger (spec.md §8 invariant
            // 5: "no residual contribution from f in LRU.current_capacity").
            let delta = file.grow_size_local(0);
            self.lru.apply_capacity_delta(delta);
        }
        outcome
    }

    async fn run_sync_inner(&self, file: &ManagedFile) -> DownloadOutcome {
        let tmp_path = tmp_path_for(&file.local_path);

        if let Err(e) = self.local_fs.create_parent_dirs(&tmp_path).await {
            return DownloadOutcome::Failure(SyncFailure::LocalFailure(e.to_string()));
        }

        let max_attempts = self.config.retry.max_attempts.max(1);
        let mut last_error: Option<SyncFailure> = None;

        for attempt in 0..max_attempts {
            if file.is_canceled() {
                let _ = self.local_fs.remove_file(&tmp_path).await;
                return DownloadOutcome::Failure(SyncFailure::Canceled);
            }

            let resume_offset = self.local_fs.metadata_len(&tmp_path).await.unwrap_or(0);

            match self.attempt_once(file, &tmp_path, resume_offset).await {
                Ok(written) => {
                    if file.size_remote_estimated() > 0 && written != file.size_remote_estimated() {
                        let _ = self.local_fs.remove_file(&tmp_path).await;
                        return DownloadOutcome::Failure(SyncFailure::InconsistentData);
                    }
                    if let Err(e) = self.local_fs.rename(&tmp_path, &file.local_path).await {
                        return DownloadOutcome::Failure(SyncFailure::LocalFailure(e.to_string()));
                    }
                    return DownloadOutcome::Success { size_local: written };
                }
                Err(SyncFailure::Canceled) => {
                    let _ = self.local_fs.remove_file(&tmp_path).await;
                    return DownloadOutcome::Failure(SyncFailure::Canceled);
                }
                Err(SyncFailure::MissedRemotely) => {
                    let _ = self.local_fs.remove_file(&tmp_path).await;
                    return DownloadOutcome::Failure(SyncFailure::MissedRemotely);
                }
                Err(failure) => {
                    warn!(attempt, error = ?failure, "remote sync attempt failed, will retry");
                    last_error = Some(failure);
                    if attempt + 1 < max_attempts {
                        tokio::time::sleep(self.config.retry.backoff).await;
                    }
                }
            }
        }

        let _ = self.local_fs.remove_file(&tmp_path).await;
        DownloadOutcome::Failure(last_error.unwrap_or(SyncFailure::RemoteIoError(
            "retries exhausted".to_string(),
        )))
    }

    /// One attempt: opens the remote stream from `resume_offset`, pipes it
    /// through the transform stage if configured, and appends the transformed
    /// bytes to `tmp_path`. Returns the total bytes written to `tmp_path`.
    async fn attempt_once(
        &self,
        file: &ManagedFile,
        tmp_path: &camino::Utf8Path,
        resume_offset: u64,
    ) -> Result<u64, SyncFailure> {
        let cancel = CancellationToken::new();

        let raw = self
            .remote_fs
            .open_read(&file.descriptor, &file.remote_rel, resume_offset, cancel.clone())
            .await
            .map_err(Self::classify_fs_error)?;

        let mapped = raw.map(|item| item.map_err(Error::from));
        let boxed: Box<dyn tokio_stream::Stream<Item = crate::error::Result<bytes::Bytes>> + Send + Unpin> =
            Box::new(Box::pin(mapped));

        let transformed = if let Some(cmd) = &file.transform_cmd {
            ProcessTransform::new(cmd.clone())
                .apply(boxed, cancel.clone())
                .await
                .map_err(|e| SyncFailure::TransformFailed(e.to_string()))?
        } else {
            NoTransform.apply(boxed, cancel.clone()).await.expect("NoTransform never fails")
        };

        let mut out = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .open(tmp_path)
            .await
            .map_err(|e| SyncFailure::LocalFailure(e.to_string()))?;
        out.seek(std::io::SeekFrom::Start(resume_offset))
            .await
            .map_err(|e| SyncFailure::LocalFailure(e.to_string()))?;

        let mut written = resume_offset;
        let mut stream = transformed;
        while let Some(chunk) = stream.next().await {
            if file.is_canceled() {
                cancel.cancel();
                return Err(SyncFailure::Canceled);
            }
            let bytes = chunk.map_err(Self::classify_core_error)?;
            out.write_all(&bytes)
                .await
                .map_err(|e| SyncFailure::LocalFailure(e.to_string()))?;
            written += bytes.len() as u64;
            let delta = file.grow_size_local(written);
            self.lru.apply_capacity_delta(delta);
        }
        out.flush().await.map_err(|e| SyncFailure::LocalFailure(e.to_string()))?;

        debug!(written, "download attempt completed");
        Ok(written)
    }

    fn classify_fs_error(e: cache_fs::FsError) -> SyncFailure {
        match e {
            cache_fs::FsError::NotFound(_) => SyncFailure::MissedRemotely,
            cache_fs::FsError::Cancelled => SyncFailure::Canceled,
            other => SyncFailure::RemoteIoError(other.to_string()),
        }
    }

    fn classify_core_error(e: Error) -> SyncFailure {
        match e {
            Error::ObjectDoesNotExist(_) => SyncFailure::MissedRemotely,
            other => SyncFailure::RemoteIoError(other.to_string()),
        }
    }
}
