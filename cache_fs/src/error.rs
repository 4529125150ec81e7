use thiserror::Error;

/// Errors surfaced by a [`crate::RemoteFs`] implementation. The downloader (in
/// `cache_engine`) maps these onto the spec.md §7 error kinds.
#[derive(Debug, Error)]
pub enum FsError {
    #[error("object does not exist: {0}")]
    NotFound(String),
    #[error("remote filesystem unreachable: {0}")]
    Unreachable(String),
    #[error("remote connection failed: {0}")]
    ConnectionFailed(String),
    #[error("remote filesystem not configured: {0}")]
    NotConfigured(String),
    #[error("remote I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("operation cancelled")]
    Cancelled,
}
