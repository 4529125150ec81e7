//! A [`RemoteFs`] backed by a local directory tree.
//!
//! This plays two roles: it *is* the adapter for [`Kind::Local`] remote filesystems,
//! and it doubles as a deterministic test double standing in for HDFS/S3 in the
//! cache engine's integration tests (grounded on the teacher's
//! `remote_storage::LocalFs`, which plays the same dual role for the page server).
//! Optional fault injection (grounded on the teacher's `simulate_failures::
//! UnreliableWrapper`) lets tests exercise the downloader's retry path.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use camino::Utf8PathBuf;
use tokio::io::{AsyncRead, AsyncSeekExt};
use tokio_stream::Stream;
use tokio_util::sync::CancellationToken;

use crate::descriptor::FileSystemDescriptor;
use crate::error::FsError;
use crate::path::RemotePath;
use crate::remote_fs::{RemoteFs, RemoteReadStream, RemoteStat};

const CHUNK_SIZE: usize = 17 * 1024;

/// Injects a simulated I/O failure into reads of one remote path, for a bounded
/// number of attempts, at a given byte offset.
#[derive(Debug, Clone, Copy)]
pub struct FaultSpec {
    pub fail_at_byte: u64,
    pub remaining_failures: u32,
}

pub struct LocalDirFs {
    root: Utf8PathBuf,
    faults: Mutex<HashMap<(String, String), FaultSpec>>,
    open_read_count: AtomicU64,
}

impl LocalDirFs {
    pub fn new(root: Utf8PathBuf) -> Self {
        Self {
            root,
            faults: Mutex::new(HashMap::new()),
            open_read_count: AtomicU64::new(0),
        }
    }

    /// Test hook: how many times `open_read` has been called, total. Used to
    /// assert a single-downloader guarantee wasn't violated by a duplicate
    /// fetch of the same object.
    pub fn open_read_count(&self) -> u64 {
        self.open_read_count.load(Ordering::SeqCst)
    }

    fn resolve(&self, descriptor: &FileSystemDescriptor, path: &RemotePath) -> Utf8PathBuf {
        self.root
            .join(descriptor.kind.to_string())
            .join(format!("{}_{}", descriptor.host, descriptor.port))
            .join(path.get_path())
    }

    /// Test hook: the next `remaining_failures` reads of `path` on `descriptor` that
    /// cross `fail_at_byte` fail with a simulated I/O error.
    pub fn inject_fault(
        &self,
        descriptor: &FileSystemDescriptor,
        path: &RemotePath,
        spec: FaultSpec,
    ) {
        self.faults
            .lock()
            .unwrap()
            .insert((descriptor.canonical(), path.to_string()), spec);
    }

    fn take_fault(
        &self,
        descriptor: &FileSystemDescriptor,
        path: &RemotePath,
    ) -> Option<FaultSpec> {
        let key = (descriptor.canonical(), path.to_string());
        let mut faults = self.faults.lock().unwrap();
        let spec = *faults.get(&key)?;
        if spec.remaining_failures <= 1 {
            faults.remove(&key);
        } else {
            faults.insert(
                key,
                FaultSpec {
                    remaining_failures: spec.remaining_failures - 1,
                    ..spec
                },
            );
        }
        Some(spec)
    }
}

impl RemoteFs for LocalDirFs {
    async fn register(&self, _descriptor: &FileSystemDescriptor) -> Result<(), FsError> {
        Ok(())
    }

    async fn stat(
        &self,
        descriptor: &FileSystemDescriptor,
        path: &RemotePath,
    ) -> Result<RemoteStat, FsError> {
        let full = self.resolve(descriptor, path);
        let meta = tokio::fs::metadata(&full)
            .await
            .map_err(|_| FsError::NotFound(path.to_string()))?;
        Ok(RemoteStat {
            size: meta.len(),
            mtime: meta.modified().unwrap_or(std::time::SystemTime::UNIX_EPOCH),
        })
    }

    async fn open_read(
        &self,
        descriptor: &FileSystemDescriptor,
        path: &RemotePath,
        start_offset: u64,
        cancel: CancellationToken,
    ) -> Result<RemoteReadStream, FsError> {
        self.open_read_count.fetch_add(1, Ordering::SeqCst);
        let full = self.resolve(descriptor, path);
        let mut file = tokio::fs::File::open(&full)
            .await
            .map_err(|_| FsError::NotFound(path.to_string()))?;
        file.seek(std::io::SeekFrom::Start(start_offset))
            .await
            .map_err(FsError::Io)?;

        let fault = self.take_fault(descriptor, path);

        Ok(Box::pin(LocalReadStream {
            file,
            position: start_offset,
            fault,
            cancel,
        }))
    }
}

struct LocalReadStream {
    file: tokio::fs::File,
    position: u64,
    fault: Option<FaultSpec>,
    cancel: CancellationToken,
}

impl Stream for LocalReadStream {
    type Item = Result<Bytes, FsError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        if this.cancel.is_cancelled() {
            return Poll::Ready(Some(Err(FsError::Cancelled)));
        }

        if let Some(fault) = this.fault {
            if this.position >= fault.fail_at_byte {
                this.fault = None;
                return Poll::Ready(Some(Err(FsError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "simulated remote I/O error",
                )))));
            }
        }

        let mut buf = BytesMut::zeroed(CHUNK_SIZE);
        let mut read_buf = tokio::io::ReadBuf::new(&mut buf);
        match Pin::new(&mut this.file).poll_read(cx, &mut read_buf) {
            Poll::Ready(Ok(())) => {
                let n = read_buf.filled().len();
                if n == 0 {
                    Poll::Ready(None)
                } else {
                    this.position += n as u64;
                    buf.truncate(n);
                    Poll::Ready(Some(Ok(buf.freeze())))
                }
            }
            Poll::Ready(Err(e)) => Poll::Ready(Some(Err(FsError::Io(e)))),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::Kind;
    use tokio_stream::StreamExt;

    async fn write_remote_file(root: &Utf8PathBuf, desc: &FileSystemDescriptor, rel: &str, bytes: &[u8]) {
        let dir = root
            .join(desc.kind.to_string())
            .join(format!("{}_{}", desc.host, desc.port));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        tokio::fs::write(dir.join(rel), bytes).await.unwrap();
    }

    #[tokio::test]
    async fn reads_whole_file() {
        let tmp = camino_tempfile::tempdir().unwrap();
        let root = tmp.path().to_path_buf();
        let fs = LocalDirFs::new(root.clone());
        let desc = FileSystemDescriptor::new(Kind::Hdfs, "nn1", 8020);
        let path = RemotePath::from_string("dir/file.txt").unwrap();
        write_remote_file(&root, &desc, "dir/file.txt", b"hello world").await;

        let stat = fs.stat(&desc, &path).await.unwrap();
        assert_eq!(stat.size, 11);

        let mut stream = fs
            .open_read(&desc, &path, 0, CancellationToken::new())
            .await
            .unwrap();
        let mut collected = Vec::new();
        while let Some(chunk) = stream.next().await {
            collected.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(collected, b"hello world");
    }

    #[tokio::test]
    async fn resumes_from_offset() {
        let tmp = camino_tempfile::tempdir().unwrap();
        let root = tmp.path().to_path_buf();
        let fs = LocalDirFs::new(root.clone());
        let desc = FileSystemDescriptor::local();
        let path = RemotePath::from_string("f").unwrap();
        write_remote_file(&root, &desc, "f", b"0123456789").await;

        let mut stream = fs
            .open_read(&desc, &path, 5, CancellationToken::new())
            .await
            .unwrap();
        let mut collected = Vec::new();
        while let Some(chunk) = stream.next().await {
            collected.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(collected, b"56789");
    }

    #[tokio::test]
    async fn injected_fault_fires_once() {
        let tmp = camino_tempfile::tempdir().unwrap();
        let root = tmp.path().to_path_buf();
        let fs = LocalDirFs::new(root.clone());
        let desc = FileSystemDescriptor::local();
        let path = RemotePath::from_string("f").unwrap();
        write_remote_file(&root, &desc, "f", &vec![7u8; 100_000]).await;

        fs.inject_fault(
            &desc,
            &path,
            FaultSpec {
                fail_at_byte: 50_000,
                remaining_failures: 1,
            },
        );

        let mut stream = fs
            .open_read(&desc, &path, 0, CancellationToken::new())
            .await
            .unwrap();
        let mut saw_error = false;
        while let Some(chunk) = stream.next().await {
            if chunk.is_err() {
                saw_error = true;
                break;
            }
        }
        assert!(saw_error);

        // Second attempt: fault consumed, should read cleanly.
        let mut stream = fs
            .open_read(&desc, &path, 0, CancellationToken::new())
            .await
            .unwrap();
        let mut total = 0usize;
        while let Some(chunk) = stream.next().await {
            total += chunk.unwrap().len();
        }
        assert_eq!(total, 100_000);
    }
}
