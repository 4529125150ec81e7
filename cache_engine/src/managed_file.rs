//! The per-file record (spec.md §3.3, §4.1).

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use camino::Utf8PathBuf;
use tokio::sync::Notify;

use cache_fs::{FileSystemDescriptor, RemotePath};

use crate::error::Error;
use crate::local_fs::LocalFs;

/// spec.md §3.3 `state`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Amorphous,
    InProgressBySync,
    InUse,
    Idle,
    Forbidden,
    MarkedForDeletion,
    SyncJustHappened,
}

/// Why a download failed, carried so callers don't have to re-derive a
/// [`crate::error::Error`] from a bare `Forbidden` state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncFailure {
    MissedRemotely,
    LocalFailure(String),
    Canceled,
    RemoteIoError(String),
    InconsistentData,
    TransformFailed(String),
}

impl From<SyncFailure> for Error {
    fn from(f: SyncFailure) -> Self {
        match f {
            SyncFailure::MissedRemotely => Error::ObjectDoesNotExist(String::new()),
            SyncFailure::LocalFailure(m) => Error::LocalFileOpFailure(m),
            SyncFailure::Canceled => Error::RequestFailed("canceled".to_string()),
            SyncFailure::RemoteIoError(m) => Error::RemoteUnreachable(m),
            SyncFailure::InconsistentData => Error::InconsistentData,
            SyncFailure::TransformFailed(m) => Error::LocalFileOpFailure(m),
        }
    }
}

struct Inner {
    state: State,
    size_local: u64,
    size_remote_estimated: u64,
    open_handles: u32,
    compatible: bool,
    last_access: SystemTime,
    retry_cooldown_deadline: Option<SystemTime>,
    bucket_key: Option<i64>,
    canceled: bool,
    last_failure: Option<SyncFailure>,
}

/// The metadata record for one cached object. Owned by the Registry; referenced
/// (pinned) by clients via the Registry (spec.md §4.1).
pub struct ManagedFile {
    pub local_path: Utf8PathBuf,
    pub network_path: String,
    pub remote_rel: RemotePath,
    pub descriptor: FileSystemDescriptor,
    pub transform_cmd: Option<String>,
    pub created_at: SystemTime,
    inner: Mutex<Inner>,
    /// Per-file condition variable: broadcasts on every state transition plus on
    /// `canceled` being set (spec.md §4.1 "Concurrency").
    changed: Notify,
    /// `current_capacity` lives in the LRU; this counter exists only so the LRU can
    /// compute `size_local` deltas without re-locking `inner` from outside
    /// (spec.md §4.2 "Numeric semantics": "fetch-add on `current_capacity`").
    size_hint: AtomicI64,
}

pub enum DownloadOutcome {
    Success { size_local: u64 },
    Failure(SyncFailure),
}

impl ManagedFile {
    pub fn new_amorphous(
        local_path: Utf8PathBuf,
        network_path: String,
        remote_rel: RemotePath,
        descriptor: FileSystemDescriptor,
        transform_cmd: Option<String>,
        size_remote_estimated: u64,
        now: SystemTime,
    ) -> Self {
        Self {
            local_path,
            network_path,
            remote_rel,
            descriptor,
            transform_cmd,
            created_at: now,
            inner: Mutex::new(Inner {
                state: State::Amorphous,
                size_local: 0,
                size_remote_estimated,
                open_handles: 0,
                compatible: false,
                last_access: now,
                retry_cooldown_deadline: None,
                bucket_key: None,
                canceled: false,
                last_failure: None,
            }),
            changed: Notify::new(),
            size_hint: AtomicI64::new(0),
        }
    }

    /// Reconstructs a record for a file discovered on disk at startup (spec.md
    /// §4.3 `configure`): admitted directly as `Idle`, `compatible = true`.
    pub fn reconstructed_idle(
        local_path: Utf8PathBuf,
        network_path: String,
        remote_rel: RemotePath,
        descriptor: FileSystemDescriptor,
        size_local: u64,
        mtime: SystemTime,
    ) -> Self {
        Self {
            local_path,
            network_path,
            remote_rel,
            descriptor,
            transform_cmd: None,
            created_at: mtime,
            inner: Mutex::new(Inner {
                state: State::Idle,
                size_local,
                size_remote_estimated: size_local,
                open_handles: 0,
                compatible: true,
                last_access: mtime,
                retry_cooldown_deadline: None,
                bucket_key: None,
                canceled: false,
                last_failure: None,
            }),
            changed: Notify::new(),
            size_hint: AtomicI64::new(size_local as i64),
        }
    }

    pub fn state(&self) -> State {
        self.inner.lock().unwrap().state
    }

    pub fn size_local(&self) -> u64 {
        self.inner.lock().unwrap().size_local
    }

    pub fn size_remote_estimated(&self) -> u64 {
        self.inner.lock().unwrap().size_remote_estimated
    }

    pub fn open_handles(&self) -> u32 {
        self.inner.lock().unwrap().open_handles
    }

    pub fn compatible(&self) -> bool {
        self.inner.lock().unwrap().compatible
    }

    pub fn last_access(&self) -> SystemTime {
        self.inner.lock().unwrap().last_access
    }

    pub fn last_failure(&self) -> Option<SyncFailure> {
        self.inner.lock().unwrap().last_failure.clone()
    }

    pub fn bucket_key(&self) -> Option<i64> {
        self.inner.lock().unwrap().bucket_key
    }

    pub fn set_bucket_key(&self, key: i64) {
        self.inner.lock().unwrap().bucket_key = Some(key);
    }

    /// Current `size_local` as tracked redundantly for lock-free delta reporting;
    /// callers should prefer [`ManagedFile::size_local`] and compute deltas
    /// themselves, this exists for the LRU's `subscribe_to_size_change` bridge.
    pub fn size_hint(&self) -> i64 {
        self.size_hint.load(Ordering::Acquire)
    }

    // ---- pin / unpin (spec.md §4.1) -------------------------------------------

    /// Attempt to increment `open_handles`. Blocks while `InProgressBySync`.
    pub async fn pin(&self) -> bool {
        loop {
            {
                let mut inner = self.inner.lock().unwrap();
                match inner.state {
                    State::MarkedForDeletion => return false,
                    State::Forbidden => {
                        // Past-cooldown retry is the Registry's job (it triggers a
                        // resync); a pin on a currently-Forbidden file still fails
                        // this request, per spec.md §4.3 `get_or_load` step 2.
                        return false;
                    }
                    State::InProgressBySync => {
                        // fall through to wait below, lock dropped first
                    }
                    State::Amorphous => return false,
                    State::InUse | State::Idle | State::SyncJustHappened => {
                        inner.open_handles += 1;
                        inner.state = State::InUse;
                        inner.last_access = SystemTime::now();
                        return true;
                    }
                }
            }
            self.changed.notified().await;
        }
    }

    /// Decrement `open_handles`. Demotes `InUse` with no remaining handles to
    /// `Idle`. `SyncJustHappened` is left for the next bucket sweep to demote.
    pub fn unpin(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.open_handles > 0 {
            inner.open_handles -= 1;
        }
        let became_idle = inner.open_handles == 0 && inner.state == State::InUse;
        if became_idle {
            inner.state = State::Idle;
        }
        drop(inner);
        if became_idle {
            self.changed.notify_waiters();
        }
    }

    /// Demotes a lingering `SyncJustHappened` file to `Idle`, called by the LRU's
    /// bucket sweep (spec.md §4.1 `unpin` note).
    pub fn demote_if_just_synced(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == State::SyncJustHappened && inner.open_handles == 0 {
            inner.state = State::Idle;
        }
    }

    // ---- downloader lifecycle ---------------------------------------------

    /// Atomically transitions `Amorphous -> InProgressBySync`.
    pub fn claim_for_download(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == State::Amorphous
            || (inner.state == State::Forbidden && self.cooldown_elapsed(&inner))
        {
            inner.state = State::InProgressBySync;
            inner.canceled = false;
            true
        } else {
            false
        }
    }

    fn cooldown_elapsed(&self, inner: &Inner) -> bool {
        match inner.retry_cooldown_deadline {
            Some(deadline) => SystemTime::now() >= deadline,
            None => true,
        }
    }

    pub fn is_past_cooldown(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.state == State::Forbidden && self.cooldown_elapsed(&inner)
    }

    /// Incremental growth during a download (spec.md §4.4 step 4 "update
    /// `size_local` incrementally so the LRU sees growth"). Returns the byte delta
    /// so the caller can apply it to the LRU's `current_capacity`.
    pub fn grow_size_local(&self, new_size: u64) -> i64 {
        let mut inner = self.inner.lock().unwrap();
        let delta = new_size as i64 - inner.size_local as i64;
        inner.size_local = new_size;
        self.size_hint.store(new_size as i64, Ordering::Release);
        delta
    }

    pub fn is_canceled(&self) -> bool {
        self.inner.lock().unwrap().canceled
    }

    pub fn cancel(&self) {
        self.inner.lock().unwrap().canceled = true;
        self.changed.notify_waiters();
    }

    pub fn publish_download(&self, outcome: DownloadOutcome, cooldown: Duration) {
        let mut inner = self.inner.lock().unwrap();
        match outcome {
            DownloadOutcome::Success { size_local } => {
                let delta = size_local as i64 - inner.size_local as i64;
                inner.size_local = size_local;
                self.size_hint.fetch_add(delta, Ordering::AcqRel);
                inner.compatible = true;
                inner.last_access = SystemTime::now();
                inner.state = State::SyncJustHappened;
                inner.last_failure = None;
            }
            DownloadOutcome::Failure(failure) => {
                inner.compatible = false;
                inner.state = State::Forbidden;
                inner.retry_cooldown_deadline = Some(SystemTime::now() + cooldown);
                inner.last_failure = Some(failure);
            }
        }
        drop(inner);
        self.changed.notify_waiters();
    }

    /// Waits until the file leaves `InProgressBySync` (spec.md §4.3 `get_or_load`
    /// miss path: "block on the file's condition until it leaves
    /// `InProgressBySync`").
    pub async fn wait_until_settled(&self) {
        loop {
            {
                let inner = self.inner.lock().unwrap();
                if inner.state != State::InProgressBySync {
                    return;
                }
            }
            self.changed.notified().await;
        }
    }

    /// Waits until the file is no longer `MarkedForDeletion` (spec.md §4.3
    /// `get_or_load`/`LRU.find` "wait on the file's finalization condition").
    pub async fn wait_until_finalized(&self) {
        loop {
            {
                let inner = self.inner.lock().unwrap();
                if inner.state != State::MarkedForDeletion {
                    return;
                }
            }
            self.changed.notified().await;
        }
    }

    /// Waits for the next state transition, whatever it is. Used by callers
    /// (e.g. `Registry::remove`) retrying a `try_`-style compare-and-swap
    /// after any change, rather than waiting on one specific target state.
    pub async fn wait_for_state_change(&self) {
        self.changed.notified().await;
    }

    // ---- eviction ------------------------------------------------------------

    /// Succeeds iff `open_handles == 0` and state is `Idle`.
    pub fn try_mark_for_deletion(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.open_handles == 0 && inner.state == State::Idle {
            inner.state = State::MarkedForDeletion;
            true
        } else {
            false
        }
    }

    /// Idempotent physical delete of the local byte file. Invoked by the evictor
    /// after `try_mark_for_deletion` succeeded, outside the LRU's lock.
    pub async fn finalize_delete(&self, local_fs: &dyn LocalFs) -> std::io::Result<()> {
        local_fs.remove_file(&self.local_path).await?;
        self.changed.notify_waiters();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cache_fs::Kind;

    fn new_file() -> ManagedFile {
        ManagedFile::new_amorphous(
            Utf8PathBuf::from("/cache/hdfs/h_1/f"),
            "hdfs://h:1/f".to_string(),
            RemotePath::from_string("f").unwrap(),
            FileSystemDescriptor::new(Kind::Hdfs, "h", 1),
            None,
            100,
            SystemTime::now(),
        )
    }

    #[tokio::test]
    async fn happy_path_lifecycle() {
        let f = new_file();
        assert!(f.claim_for_download());
        assert!(!f.claim_for_download(), "second claim must fail");

        f.publish_download(
            DownloadOutcome::Success { size_local: 100 },
            Duration::from_secs(1),
        );
        assert_eq!(f.state(), State::SyncJustHappened);
        assert!(f.compatible());

        assert!(f.pin().await);
        assert_eq!(f.state(), State::InUse);
        assert_eq!(f.open_handles(), 1);

        f.unpin();
        assert_eq!(f.state(), State::Idle);
        assert_eq!(f.open_handles(), 0);

        assert!(f.try_mark_for_deletion());
        assert_eq!(f.state(), State::MarkedForDeletion);
        assert!(!f.pin().await, "pin on MarkedForDeletion must fail");
    }

    #[tokio::test]
    async fn failed_download_is_forbidden_and_unpinnable() {
        let f = new_file();
        assert!(f.claim_for_download());
        f.publish_download(
            DownloadOutcome::Failure(SyncFailure::RemoteIoError("boom".into())),
            Duration::from_secs(30),
        );
        assert_eq!(f.state(), State::Forbidden);
        assert!(!f.pin().await);
        assert!(!f.is_past_cooldown());
    }

    #[tokio::test]
    async fn mark_for_deletion_requires_idle_and_no_handles() {
        let f = new_file();
        f.claim_for_download();
        f.publish_download(
            DownloadOutcome::Success { size_local: 10 },
            Duration::from_secs(1),
        );
        f.demote_if_just_synced();
        assert!(f.pin().await);
        assert!(
            !f.try_mark_for_deletion(),
            "pinned file must not be markable"
        );
        f.unpin();
        assert!(f.try_mark_for_deletion());
    }

    #[tokio::test]
    async fn second_pin_waits_for_in_progress_download() {
        use std::sync::Arc;
        let f = Arc::new(new_file());
        assert!(f.claim_for_download());

        let f2 = Arc::clone(&f);
        let waiter = tokio::spawn(async move { f2.pin().await });

        tokio::task::yield_now().await;
        f.publish_download(
            DownloadOutcome::Success { size_local: 5 },
            Duration::from_secs(1),
        );

        assert!(waiter.await.unwrap());
    }
}
