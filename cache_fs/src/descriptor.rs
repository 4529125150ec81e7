//! [`FileSystemDescriptor`]: the identifier for a remote filesystem (spec.md §3.1).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// The kind of remote filesystem a [`FileSystemDescriptor`] points at.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Kind {
    Hdfs,
    S3n,
    Local,
    /// Resolved through the adapter layer to a concrete kind before registration
    /// (spec.md §4.3 `register_remote_fs`); never stored past that point.
    Default,
    /// Any scheme not recognized above, kept verbatim so round-tripping through the
    /// canonical string form never loses information.
    Other(String),
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Kind::Hdfs => write!(f, "hdfs"),
            Kind::S3n => write!(f, "s3n"),
            Kind::Local => write!(f, "file"),
            Kind::Default => write!(f, "default"),
            Kind::Other(s) => write!(f, "{s}"),
        }
    }
}

impl FromStr for Kind {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "hdfs" => Kind::Hdfs,
            "s3n" => Kind::S3n,
            "file" | "local" => Kind::Local,
            "default" => Kind::Default,
            other => Kind::Other(other.to_string()),
        })
    }
}

/// Identifies one remote filesystem. Two descriptors are equal iff `kind`, `host`,
/// and `port` are equal (spec.md §3.1) — `credentials` does not participate in
/// equality, matching the spec's statement that only those three fields are
/// compared.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileSystemDescriptor {
    pub kind: Kind,
    /// Empty for `Local`, `"default"` for the cluster default.
    pub host: String,
    /// `0` means unspecified.
    pub port: u32,
    pub credentials: Option<String>,
}

impl PartialEq for FileSystemDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && self.host == other.host && self.port == other.port
    }
}
impl Eq for FileSystemDescriptor {}

impl std::hash::Hash for FileSystemDescriptor {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.kind.hash(state);
        self.host.hash(state);
        self.port.hash(state);
    }
}

impl FileSystemDescriptor {
    pub fn local() -> Self {
        Self {
            kind: Kind::Local,
            host: String::new(),
            port: 0,
            credentials: None,
        }
    }

    pub fn new(kind: Kind, host: impl Into<String>, port: u32) -> Self {
        Self {
            kind,
            host: host.into(),
            port,
            credentials: None,
        }
    }

    pub fn with_credentials(mut self, credentials: impl Into<String>) -> Self {
        self.credentials = Some(credentials.into());
        self
    }

    pub fn is_local(&self) -> bool {
        matches!(self.kind, Kind::Local)
    }

    /// Canonical string form: `"{kind}://{host}:{port}"`.
    pub fn canonical(&self) -> String {
        format!("{}://{}:{}", self.kind, self.host, self.port)
    }
}

impl fmt::Display for FileSystemDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.canonical())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equality_ignores_credentials() {
        let a = FileSystemDescriptor::new(Kind::Hdfs, "nn1", 8020).with_credentials("a");
        let b = FileSystemDescriptor::new(Kind::Hdfs, "nn1", 8020).with_credentials("b");
        assert_eq!(a, b);
    }

    #[test]
    fn canonical_round_trips_kind() {
        let d = FileSystemDescriptor::new(Kind::S3n, "bucket", 0);
        assert_eq!(d.canonical(), "s3n://bucket:0");
    }

    #[test]
    fn local_canonical_is_file_scheme() {
        assert_eq!(FileSystemDescriptor::local().canonical(), "file://:0");
    }
}
