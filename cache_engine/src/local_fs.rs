//! The local filesystem manager the core depends on abstractly (spec.md §1
//! "local open/read/write/close/rename/delete"). Out of scope as a component in its
//! own right; this is the thin `tokio::fs`-backed default the Facade and Downloader
//! use when no other implementation is wired in (tests substitute nothing here —
//! they run against the real local filesystem under a temp dir, same as the
//! teacher's integration tests do for on-disk layer state).

use camino::{Utf8Path, Utf8PathBuf};
use tokio::io::AsyncWriteExt;

#[allow(async_fn_in_trait)]
pub trait LocalFs: Send + Sync + 'static {
    async fn create_parent_dirs(&self, path: &Utf8Path) -> std::io::Result<()>;
    async fn rename(&self, from: &Utf8Path, to: &Utf8Path) -> std::io::Result<()>;
    async fn remove_file(&self, path: &Utf8Path) -> std::io::Result<()>;
    async fn metadata_len(&self, path: &Utf8Path) -> std::io::Result<u64>;
    async fn write_all(&self, path: &Utf8Path, bytes: &[u8]) -> std::io::Result<()>;
    async fn read_to_vec(&self, path: &Utf8Path) -> std::io::Result<Vec<u8>>;
    async fn mkdir(&self, path: &Utf8Path) -> std::io::Result<()>;
    async fn exists(&self, path: &Utf8Path) -> bool;
    async fn list_dir(&self, path: &Utf8Path) -> std::io::Result<Vec<String>>;
    async fn set_unix_mode(&self, path: &Utf8Path, mode: u32) -> std::io::Result<()>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TokioLocalFs;

impl LocalFs for TokioLocalFs {
    async fn create_parent_dirs(&self, path: &Utf8Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            match tokio::fs::create_dir_all(parent).await {
                Ok(()) => Ok(()),
                // Double-creation races are tolerated (spec.md §6.2).
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
                Err(e) => {
                    if tokio::fs::metadata(parent).await.is_ok() {
                        Ok(())
                    } else {
                        Err(e)
                    }
                }
            }
        } else {
            Ok(())
        }
    }

    async fn rename(&self, from: &Utf8Path, to: &Utf8Path) -> std::io::Result<()> {
        tokio::fs::rename(from, to).await
    }

    async fn remove_file(&self, path: &Utf8Path) -> std::io::Result<()> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn metadata_len(&self, path: &Utf8Path) -> std::io::Result<u64> {
        Ok(tokio::fs::metadata(path).await?.len())
    }

    async fn write_all(&self, path: &Utf8Path, bytes: &[u8]) -> std::io::Result<()> {
        let mut f = tokio::fs::File::create(path).await?;
        f.write_all(bytes).await?;
        f.flush().await
    }

    async fn read_to_vec(&self, path: &Utf8Path) -> std::io::Result<Vec<u8>> {
        tokio::fs::read(path).await
    }

    async fn mkdir(&self, path: &Utf8Path) -> std::io::Result<()> {
        match tokio::fs::create_dir_all(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn exists(&self, path: &Utf8Path) -> bool {
        tokio::fs::metadata(path).await.is_ok()
    }

    async fn list_dir(&self, path: &Utf8Path) -> std::io::Result<Vec<String>> {
        let mut entries = tokio::fs::read_dir(path).await?;
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if let Ok(name) = entry.file_name().into_string() {
                names.push(name);
            }
        }
        Ok(names)
    }

    #[cfg(unix)]
    async fn set_unix_mode(&self, path: &Utf8Path, mode: u32) -> std::io::Result<()> {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await
    }

    #[cfg(not(unix))]
    async fn set_unix_mode(&self, _path: &Utf8Path, _mode: u32) -> std::io::Result<()> {
        Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "unix file modes are not supported on this platform",
        ))
    }
}

/// `<target>_tmp`: the temp-file naming convention used while a download is in
/// flight (spec.md §4.4 step 3, §6.2).
pub fn tmp_path_for(local_path: &Utf8Path) -> Utf8PathBuf {
    let mut s = local_path.as_str().to_string();
    s.push_str("_tmp");
    Utf8PathBuf::from(s)
}
