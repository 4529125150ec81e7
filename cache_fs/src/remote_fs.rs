//! The `RemoteFs` capability the Cache Engine core depends on (spec.md §1
//! "the core depends on an abstract `RemoteFs` capability exposing open/read/close/
//! stat and returning byte streams").

use std::pin::Pin;
use std::time::SystemTime;

use bytes::Bytes;
use tokio_stream::Stream;
use tokio_util::sync::CancellationToken;

use crate::descriptor::FileSystemDescriptor;
use crate::error::FsError;
use crate::path::RemotePath;

#[derive(Debug, Clone, Copy)]
pub struct RemoteStat {
    pub size: u64,
    pub mtime: SystemTime,
}

/// A cancellable stream of bytes from an open remote object.
pub type RemoteReadStream = Pin<Box<dyn Stream<Item = Result<Bytes, FsError>> + Send>>;

/// Connection-pool-backed access to one or more remote filesystems.
///
/// Implementations own connection lifetime: a call that acquires a connection must
/// release it by the time the returned future/stream completes or is dropped,
/// regardless of success (spec.md §5 "the core treats connections as RAII handles").
#[allow(async_fn_in_trait)]
pub trait RemoteFs: Send + Sync + 'static {
    /// Idempotent registration of a remote filesystem. Implementations that need no
    /// up-front connection setup may no-op.
    async fn register(&self, descriptor: &FileSystemDescriptor) -> Result<(), FsError>;

    async fn stat(
        &self,
        descriptor: &FileSystemDescriptor,
        path: &RemotePath,
    ) -> Result<RemoteStat, FsError>;

    /// Opens `path` for reading starting at `start_offset` bytes in (used by the
    /// downloader's retry path to resume after a transient I/O error without
    /// re-reading bytes already written locally).
    async fn open_read(
        &self,
        descriptor: &FileSystemDescriptor,
        path: &RemotePath,
        start_offset: u64,
        cancel: CancellationToken,
    ) -> Result<RemoteReadStream, FsError>;
}
