//! Per-file progress record exposed to callers of the prepare/estimate API
//! (spec.md §6.5).

use std::time::Duration;

use camino::Utf8PathBuf;

use cache_fs::FileSystemDescriptor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressStatus {
    NotRun,
    CompletedOk,
    MissedRemotely,
    RemoteUnreachable,
    LocalFailure,
    GeneralFailure,
    InconsistentData,
}

#[derive(Debug, Clone)]
pub struct FileProgress {
    pub local_bytes: u64,
    pub estimated_bytes: u64,
    pub local_path: Utf8PathBuf,
    pub remote_path: String,
    pub descriptor: FileSystemDescriptor,
    pub process_time: Duration,
    pub status: ProgressStatus,
    pub error: bool,
    pub error_descr: String,
}

impl FileProgress {
    pub fn not_run(
        local_path: Utf8PathBuf,
        remote_path: String,
        descriptor: FileSystemDescriptor,
        estimated_bytes: u64,
    ) -> Self {
        Self {
            local_bytes: 0,
            estimated_bytes,
            local_path,
            remote_path,
            descriptor,
            process_time: Duration::ZERO,
            status: ProgressStatus::NotRun,
            error: false,
            error_descr: String::new(),
        }
    }

    /// spec.md §6.5 "Ready predicate".
    pub fn ready(&self) -> bool {
        self.local_bytes == self.estimated_bytes
            && self.status == ProgressStatus::CompletedOk
            && !self.error
    }

    pub(crate) fn fail(&mut self, status: ProgressStatus, descr: impl Into<String>) {
        self.status = status;
        self.error = true;
        self.error_descr = descr.into();
    }

    pub(crate) fn succeed(&mut self, local_bytes: u64, elapsed: Duration) {
        self.local_bytes = local_bytes;
        self.process_time = elapsed;
        self.status = ProgressStatus::CompletedOk;
        self.error = false;
        self.error_descr.clear();
    }
}

impl From<&crate::error::Error> for ProgressStatus {
    fn from(e: &crate::error::Error) -> Self {
        use crate::error::Error;
        match e {
            Error::ObjectDoesNotExist(_) => ProgressStatus::MissedRemotely,
            Error::RemoteUnreachable(_) | Error::RemoteConnectionFailed(_) => {
                ProgressStatus::RemoteUnreachable
            }
            Error::LocalFileOpFailure(_) => ProgressStatus::LocalFailure,
            Error::InconsistentData => ProgressStatus::InconsistentData,
            _ => ProgressStatus::GeneralFailure,
        }
    }
}
