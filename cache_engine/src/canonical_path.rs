//! The deterministic, reversible mapping between a remote URI and its local cache
//! path (spec.md §3.2, §6.2). The cache root mirrors `(scheme, host, port,
//! remote_path)` so that `reverse(local_path)` is well-defined.

use camino::{Utf8Path, Utf8PathBuf};

use cache_fs::{FileSystemDescriptor, Kind, RemotePath};

/// `local_of(desc, remote_rel)`: cache_root/{kind}/{host}_{port}/{remote_rel}.
///
/// The host/port segment is folded into one path component (rather than two nested
/// directories) so that a `Local` descriptor, whose host is empty, still produces a
/// valid single path component (`_0`) instead of an empty directory name.
pub fn local_of(cache_root: &Utf8Path, desc: &FileSystemDescriptor, remote_rel: &RemotePath) -> Utf8PathBuf {
    cache_root
        .join(desc.kind.to_string())
        .join(format!("{}_{}", sanitize_host(&desc.host), desc.port))
        .join(remote_rel.get_path())
}

fn sanitize_host(host: &str) -> String {
    if host.is_empty() {
        "_".to_string()
    } else {
        host.to_string()
    }
}

/// Inverse of [`local_of`]: recovers `(descriptor, remote_rel)` from a local path
/// known to live under `cache_root`. Returns `None` if `local_path` is not under
/// `cache_root` or doesn't have the `{kind}/{host}_{port}/...` shape — callers treat
/// this as "file cannot be reconstructed", per spec.md §4.3 `configure`'s skip rule.
pub fn reverse(
    cache_root: &Utf8Path,
    local_path: &Utf8Path,
) -> Option<(FileSystemDescriptor, RemotePath)> {
    let rel = local_path.strip_prefix(cache_root).ok()?;
    let mut components = rel.components();

    let kind_str = components.next()?.as_str().to_string();
    let host_port = components.next()?.as_str();
    let (host, port_str) = host_port.rsplit_once('_')?;
    let port: u32 = port_str.parse().ok()?;

    let remaining: Utf8PathBuf = components.as_path().to_path_buf();
    if remaining.as_str().is_empty() {
        return None;
    }

    let host = if host == "_" { String::new() } else { host.to_string() };
    let descriptor = FileSystemDescriptor::new(kind_str.parse().ok()?, host, port);
    let remote_rel = RemotePath::new(&remaining).ok()?;
    Some((descriptor, remote_rel))
}

/// Renders the canonical network URI for display/logging/`network_path` storage:
/// `"{kind}://{host}[:{port}]/{remote_rel}"`.
pub fn network_path_of(desc: &FileSystemDescriptor, remote_rel: &RemotePath) -> String {
    if matches!(desc.kind, Kind::Local) {
        format!("file:///{}", remote_rel)
    } else {
        format!("{}://{}:{}/{}", desc.kind, desc.host, desc.port, remote_rel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_hdfs_path() {
        let root = Utf8PathBuf::from("/var/cache");
        let desc = FileSystemDescriptor::new(Kind::Hdfs, "nn1.example.com", 8020);
        let rel = RemotePath::from_string("warehouse/table/part-0000.parquet").unwrap();

        let local = local_of(&root, &desc, &rel);
        assert!(local.starts_with(&root));

        let (desc2, rel2) = reverse(&root, &local).expect("must reverse");
        assert_eq!(desc2, desc);
        assert_eq!(rel2, rel);
    }

    #[test]
    fn round_trips_local_descriptor_with_empty_host() {
        let root = Utf8PathBuf::from("/var/cache");
        let desc = FileSystemDescriptor::local();
        let rel = RemotePath::from_string("a/b/c").unwrap();

        let local = local_of(&root, &desc, &rel);
        let (desc2, rel2) = reverse(&root, &local).expect("must reverse");
        assert_eq!(desc2, desc);
        assert_eq!(rel2, rel);
    }

    #[test]
    fn reverse_rejects_paths_outside_root() {
        let root = Utf8PathBuf::from("/var/cache");
        assert!(reverse(&root, Utf8Path::new("/elsewhere/hdfs/h_1/x")).is_none());
    }

    #[test]
    fn reverse_rejects_malformed_shape() {
        let root = Utf8PathBuf::from("/var/cache");
        // missing remote_rel component entirely
        assert!(reverse(&root, Utf8Path::new("/var/cache/hdfs/h_1")).is_none());
    }
}
