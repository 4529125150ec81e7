//! The single result type carrying the error kinds enumerated in spec.md §7. No
//! exceptions escape the public API (spec.md §9 "Exceptions for control flow").

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("async request scheduled")]
    AsyncScheduled,
    #[error("async request rejected, engine is shutting down")]
    AsyncRejected,
    #[error("cache finalization already in progress")]
    FinalizationInProgress,
    #[error("request not found")]
    RequestNotFound,
    #[error("request failed: {0}")]
    RequestFailed(String),
    #[error("remote filesystem not configured: {0}")]
    RemoteNotConfigured(String),
    #[error("remote filesystem unreachable: {0}")]
    RemoteUnreachable(String),
    #[error("remote connection failed: {0}")]
    RemoteConnectionFailed(String),
    #[error("adapter not configured")]
    AdapterNotConfigured,
    #[error("object does not exist: {0}")]
    ObjectDoesNotExist(String),
    #[error("local file operation failed: {0}")]
    LocalFileOpFailure(String),
    #[error("cache object not found")]
    CacheObjectNotFound,
    #[error("cache object forbidden (last sync attempt failed)")]
    CacheObjectForbidden,
    #[error("cache object incompatible with remote content")]
    CacheObjectIncompatible,
    #[error("cache object under finalization, retry")]
    CacheObjectUnderFinalization,
    #[error("downloaded content inconsistent with remote size")]
    InconsistentData,
    #[error("operation not supported: {0}")]
    NotSupported(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<cache_fs::FsError> for Error {
    fn from(e: cache_fs::FsError) -> Self {
        match e {
            cache_fs::FsError::NotFound(p) => Error::ObjectDoesNotExist(p),
            cache_fs::FsError::Unreachable(m) => Error::RemoteUnreachable(m),
            cache_fs::FsError::ConnectionFailed(m) => Error::RemoteConnectionFailed(m),
            cache_fs::FsError::NotConfigured(m) => Error::RemoteNotConfigured(m),
            cache_fs::FsError::Io(e) => Error::LocalFileOpFailure(e.to_string()),
            cache_fs::FsError::Cancelled => Error::RequestFailed("cancelled".to_string()),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::LocalFileOpFailure(e.to_string())
    }
}
