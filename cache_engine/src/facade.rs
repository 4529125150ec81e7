//! The boundary API (spec.md §4.5, §6.1, §6.2): `open`/`read`/`write`/`seek`/
//! `tell`/`close` on a file handle, plus `list`/`stat`/`delete`/`rename`/`mkdir`/
//! `chmod`/`chown` keyed by `(descriptor, remote_path)`. Only `open` (on miss)
//! drives the Downloader; everything else requires the object already resident
//! or reports `ObjectDoesNotExist`/`CacheObjectNotFound`.

use std::io::SeekFrom;

use camino::Utf8PathBuf;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::debug;

use cache_fs::{FileSystemDescriptor, RemoteFs, RemotePath};

use crate::error::{Error, Result};
use crate::local_fs::LocalFs;
use crate::registry::{Pin, Registry};

/// spec.md §6.1 "Flags supported": `O_RDONLY`, `O_WRONLY`, `O_CREAT`
/// (local-only convenience). `O_RDWR` and `O_EXCL|O_CREAT` are rejected.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenFlags {
    pub write: bool,
    pub create: bool,
    pub excl: bool,
}

impl OpenFlags {
    pub fn read_only() -> Self {
        Self::default()
    }

    pub fn write_only(create: bool) -> Self {
        Self {
            write: true,
            create,
            ..Default::default()
        }
    }

    fn validate(&self) -> Result<()> {
        if self.excl && self.create {
            return Err(Error::NotSupported("O_EXCL|O_CREAT".to_string()));
        }
        Ok(())
    }
}

/// An open file (spec.md §6.1 "opaque file handle").
pub struct FileHandle {
    local_path: Utf8PathBuf,
    file: tokio::fs::File,
    position: u64,
    /// Held for the handle's lifetime so the managed file stays pinned (and thus
    /// unevictable) while open; `None` for the `O_CREAT` local-only convenience
    /// path and for the missing-remote placeholder (spec.md §6.5 Open Questions #1).
    pin: Option<Pin>,
    /// When true, `close` deletes the local byte file (the placeholder case).
    remove_on_close: bool,
}

impl FileHandle {
    pub fn local_path(&self) -> &Utf8PathBuf {
        &self.local_path
    }
}

pub struct Facade<F: RemoteFs, L: LocalFs> {
    registry: std::sync::Arc<Registry<F, L>>,
}

impl<F: RemoteFs, L: LocalFs> Facade<F, L> {
    pub fn new(registry: std::sync::Arc<Registry<F, L>>) -> Self {
        Self { registry }
    }

    #[tracing::instrument(skip(self))]
    pub async fn open(
        &self,
        descriptor: FileSystemDescriptor,
        remote_rel: RemotePath,
        flags: OpenFlags,
    ) -> Result<FileHandle> {
        flags.validate()?;
        let local_path = self.registry.local_path_for(&descriptor, &remote_rel);

        if flags.create {
            self.registry
                .local_fs()
                .create_parent_dirs(&local_path)
                .await?;
            let file = tokio::fs::OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .read(true)
                .open(&local_path)
                .await?;
            return Ok(FileHandle {
                local_path,
                file,
                position: 0,
                pin: None,
                remove_on_close: false,
            });
        }

        let network_path = crate::canonical_path::network_path_of(&descriptor, &remote_rel);
        match self
            .registry
            .get_or_load(descriptor.clone(), remote_rel.clone(), network_path)
            .await
        {
            Ok(pin) => {
                let mut open_opts = tokio::fs::OpenOptions::new();
                open_opts.read(true);
                if flags.write {
                    open_opts.write(true);
                }
                let file = open_opts.open(&local_path).await?;
                Ok(FileHandle {
                    local_path,
                    file,
                    position: 0,
                    pin: Some(pin),
                    remove_on_close: false,
                })
            }
            // spec.md §6.5 Open Questions #1: preserved literally. See DESIGN.md.
            Err(Error::ObjectDoesNotExist(_)) if !flags.write => {
                debug!(%local_path, "remote object missing, creating placeholder per preserved open-question behavior");
                self.registry
                    .local_fs()
                    .create_parent_dirs(&local_path)
                    .await?;
                let file = tokio::fs::OpenOptions::new()
                    .create(true)
                    .truncate(true)
                    .write(true)
                    .read(true)
                    .open(&local_path)
                    .await?;
                Ok(FileHandle {
                    local_path,
                    file,
                    position: 0,
                    pin: None,
                    remove_on_close: true,
                })
            }
            Err(e) => Err(e),
        }
    }

    pub async fn read(&self, handle: &mut FileHandle, max_len: usize) -> Result<Vec<u8>> {
        handle
            .file
            .seek(SeekFrom::Start(handle.position))
            .await
            .map_err(Error::from)?;
        let mut buf = vec![0u8; max_len];
        let n = handle.file.read(&mut buf).await.map_err(Error::from)?;
        buf.truncate(n);
        handle.position += n as u64;
        Ok(buf)
    }

    pub async fn write(&self, handle: &mut FileHandle, bytes: &[u8]) -> Result<usize> {
        handle
            .file
            .seek(SeekFrom::Start(handle.position))
            .await
            .map_err(Error::from)?;
        handle.file.write_all(bytes).await.map_err(Error::from)?;
        handle.position += bytes.len() as u64;
        Ok(bytes.len())
    }

    pub fn seek(&self, handle: &mut FileHandle, pos: u64) {
        handle.position = pos;
    }

    pub fn tell(&self, handle: &FileHandle) -> u64 {
        handle.position
    }

    pub async fn close(&self, handle: FileHandle) -> Result<()> {
        let FileHandle {
            local_path,
            file,
            pin,
            remove_on_close,
            ..
        } = handle;
        drop(file);
        drop(pin);
        if remove_on_close {
            self.registry.local_fs().remove_file(&local_path).await?;
        }
        Ok(())
    }

    pub async fn list(
        &self,
        descriptor: &FileSystemDescriptor,
        remote_rel: &RemotePath,
    ) -> Result<Vec<String>> {
        let local_path = self.registry.local_path_for(descriptor, remote_rel);
        Ok(self.registry.local_fs().list_dir(&local_path).await?)
    }

    pub async fn stat(
        &self,
        descriptor: &FileSystemDescriptor,
        remote_rel: &RemotePath,
    ) -> Result<crate::registry::FileSnapshot> {
        let local_path = self.registry.local_path_for(descriptor, remote_rel);
        self.registry
            .snapshot(&local_path)
            .await
            .ok_or(Error::CacheObjectNotFound)
    }

    pub async fn delete(
        &self,
        descriptor: &FileSystemDescriptor,
        remote_rel: &RemotePath,
    ) -> Result<()> {
        let local_path = self.registry.local_path_for(descriptor, remote_rel);
        self.registry.remove(&local_path, true).await
    }

    pub async fn rename(
        &self,
        descriptor: &FileSystemDescriptor,
        from_rel: &RemotePath,
        to_rel: &RemotePath,
    ) -> Result<()> {
        let from_path = self.registry.local_path_for(descriptor, from_rel);
        let to_path = self.registry.local_path_for(descriptor, to_rel);
        self.registry
            .local_fs()
            .create_parent_dirs(&to_path)
            .await?;
        self.registry.local_fs().rename(&from_path, &to_path).await?;
        self.registry.forget_local(&from_path).await;
        Ok(())
    }

    pub async fn mkdir(
        &self,
        descriptor: &FileSystemDescriptor,
        remote_rel: &RemotePath,
    ) -> Result<()> {
        let local_path = self.registry.local_path_for(descriptor, remote_rel);
        Ok(self.registry.local_fs().mkdir(&local_path).await?)
    }

    pub async fn chmod(
        &self,
        descriptor: &FileSystemDescriptor,
        remote_rel: &RemotePath,
        mode: u32,
    ) -> Result<()> {
        let local_path = self.registry.local_path_for(descriptor, remote_rel);
        Ok(self.registry.local_fs().set_unix_mode(&local_path, mode).await?)
    }

    /// No uid/gid-aware crate is part of this stack (spec.md's `chown` row is a
    /// local-convenience pass-through only); see DESIGN.md.
    pub async fn chown(
        &self,
        _descriptor: &FileSystemDescriptor,
        _remote_rel: &RemotePath,
        _uid: u32,
        _gid: u32,
    ) -> Result<()> {
        Err(Error::NotSupported("chown".to_string()))
    }
}
