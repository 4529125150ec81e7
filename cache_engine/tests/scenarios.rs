//! End-to-end scenarios, seeded literally from the six cases this engine's
//! design was validated against: a fresh open of a file missing on the
//! simulated remote, a concurrent double-open of the same object, a batch
//! prepare of a shared file list, a download that exhausts its retry budget,
//! an age-bucketed eviction run under a tight capacity limit, and rediscovery
//! of a populated cache root after a restart.

use std::sync::Arc;
use std::time::Duration;

use cache_engine::{CacheConfig, CacheEngine, OpenFlags, RetryPolicy};
use cache_fs::{FileSystemDescriptor, Kind, LocalDirFs, RemotePath};
use cache_engine::local_fs::TokioLocalFs;

async fn write_remote_file(remote_root: &camino::Utf8Path, desc: &FileSystemDescriptor, rel: &str, bytes: &[u8]) {
    let dir = remote_root
        .join(desc.kind.to_string())
        .join(format!("{}_{}", desc.host, desc.port));
    tokio::fs::create_dir_all(&dir).await.unwrap();
    tokio::fs::write(dir.join(rel), bytes).await.unwrap();
}

async fn engine(cache_root: &camino::Utf8Path, remote_root: &camino::Utf8Path, capacity: u64) -> CacheEngine<LocalDirFs, TokioLocalFs> {
    let mut config = CacheConfig::new(cache_root.to_path_buf(), capacity);
    config.retry = RetryPolicy {
        max_attempts: 2,
        backoff: Duration::from_millis(5),
    };
    CacheEngine::init(config, LocalDirFs::new(remote_root.to_path_buf()), TokioLocalFs)
        .await
        .unwrap()
}

#[tokio::test]
async fn scenario_1_fresh_open_of_missing_remote_file_yields_placeholder() {
    let cache_dir = camino_tempfile::tempdir().unwrap();
    let remote_dir = camino_tempfile::tempdir().unwrap();
    let e = engine(cache_dir.path(), remote_dir.path(), 10_000_000).await;

    let desc = FileSystemDescriptor::new(Kind::Hdfs, "h", 8020);
    e.configure_file_system(desc.clone()).await.unwrap();
    let rel = RemotePath::from_string("test.txt").unwrap();

    let handle = e
        .facade()
        .open(desc.clone(), rel.clone(), OpenFlags::read_only())
        .await
        .expect("placeholder open must succeed even though the remote object is absent");

    let local_path = handle.local_path().clone();
    assert!(tokio::fs::metadata(&local_path).await.is_ok());

    e.facade().close(handle).await.unwrap();
    assert!(
        tokio::fs::metadata(&local_path).await.is_err(),
        "placeholder must be removed on close"
    );
}

#[tokio::test]
async fn scenario_2_concurrent_opens_of_same_object_share_one_download() {
    let cache_dir = camino_tempfile::tempdir().unwrap();
    let remote_dir = camino_tempfile::tempdir().unwrap();
    let desc = FileSystemDescriptor::new(Kind::S3n, "bucket", 0);
    let payload = vec![7u8; 100 * 1024];
    write_remote_file(remote_dir.path(), &desc, "obj", &payload).await;

    let e = Arc::new(engine(cache_dir.path(), remote_dir.path(), 10_000_000).await);
    e.configure_file_system(desc.clone()).await.unwrap();
    let rel = RemotePath::from_string("obj").unwrap();

    let (e1, e2) = (Arc::clone(&e), Arc::clone(&e));
    let (d1, d2) = (desc.clone(), desc.clone());
    let (r1, r2) = (rel.clone(), rel.clone());

    let (h1, h2) = tokio::join!(
        tokio::spawn(async move { e1.facade().open(d1, r1, OpenFlags::read_only()).await }),
        tokio::spawn(async move { e2.facade().open(d2, r2, OpenFlags::read_only()).await }),
    );
    let h1 = h1.unwrap().unwrap();
    let h2 = h2.unwrap().unwrap();
    assert_eq!(h1.local_path(), h2.local_path());

    let on_disk = tokio::fs::read(h1.local_path()).await.unwrap();
    assert_eq!(on_disk.len(), payload.len());

    assert_eq!(
        e.registry().remote_fs().open_read_count(),
        1,
        "only one of the two racing opens may open a network byte stream (spec.md §8 invariant 7)"
    );
    assert_eq!(
        e.registry().lru_stats().hard_item_count,
        1,
        "the loser of the race must not leave an orphan entry outside the index"
    );

    e.facade().close(h1).await.unwrap();
    e.facade().close(h2).await.unwrap();
}

#[tokio::test]
async fn scenario_3_prepare_dataset_resolves_all_paths() {
    let cache_dir = camino_tempfile::tempdir().unwrap();
    let remote_dir = camino_tempfile::tempdir().unwrap();
    let desc = FileSystemDescriptor::new(Kind::Hdfs, "h", 8020);
    for name in ["a", "b", "c"] {
        write_remote_file(remote_dir.path(), &desc, name, format!("content-{name}").as_bytes()).await;
    }

    let e = engine(cache_dir.path(), remote_dir.path(), 10_000_000).await;
    e.configure_file_system(desc.clone()).await.unwrap();
    let paths: Vec<_> = ["a", "b", "c"]
        .iter()
        .map(|n| RemotePath::from_string(n).unwrap())
        .collect();

    let (tx, rx) = tokio::sync::oneshot::channel();
    let id = e
        .prepare_data(desc, paths, move |progress| {
            let _ = tx.send(progress);
        })
        .await
        .unwrap();

    let progress = rx.await.unwrap();
    assert_eq!(progress.len(), 3);
    assert!(cache_engine::prepare::overall_ready(&progress));

    let (status_progress, done) = e.check_prepare_status(id).await.unwrap();
    assert!(done);
    assert_eq!(status_progress.len(), 3);
}

#[tokio::test]
async fn scenario_4_retry_exhaustion_leaves_file_forbidden_and_capacity_unchanged() {
    let cache_dir = camino_tempfile::tempdir().unwrap();
    let remote_dir = camino_tempfile::tempdir().unwrap();
    let desc = FileSystemDescriptor::new(Kind::Hdfs, "h", 8020);
    let payload = vec![1u8; 10_000];
    write_remote_file(remote_dir.path(), &desc, "flaky", &payload).await;

    let remote_fs = LocalDirFs::new(remote_dir.path().to_path_buf());
    let rel = RemotePath::from_string("flaky").unwrap();
    remote_fs.inject_fault(
        &desc,
        &rel,
        cache_fs::local_dir::FaultSpec {
            fail_at_byte: 5_000,
            remaining_failures: 10,
        },
    );

    let mut config = CacheConfig::new(cache_dir.path().to_path_buf(), 10_000_000);
    config.retry = RetryPolicy {
        max_attempts: 2,
        backoff: Duration::from_millis(5),
    };
    let e = CacheEngine::init(config, remote_fs, TokioLocalFs).await.unwrap();
    e.configure_file_system(desc.clone()).await.unwrap();

    let result = e.facade().open(desc.clone(), rel.clone(), OpenFlags::read_only()).await;
    assert!(result.is_err(), "every attempt is faulted, retries must exhaust");

    let local_path = e.registry().local_path_for(&desc, &rel);
    assert!(
        tokio::fs::metadata(format!("{local_path}_tmp")).await.is_err(),
        "temp file must be removed after retry exhaustion"
    );
    assert_eq!(e.registry().lru_stats().current_capacity, 0);
}

#[tokio::test(start_paused = true)]
async fn scenario_5_eviction_holds_capacity_under_tight_limit() {
    let cache_dir = camino_tempfile::tempdir().unwrap();
    let remote_dir = camino_tempfile::tempdir().unwrap();
    let desc = FileSystemDescriptor::new(Kind::Hdfs, "h", 8020);

    let mut config = CacheConfig::new(cache_dir.path().to_path_buf(), 1024 * 1024);
    config.slice_duration = Duration::from_secs(10);
    let e = CacheEngine::init(config, LocalDirFs::new(remote_dir.path().to_path_buf()), TokioLocalFs)
        .await
        .unwrap();
    e.configure_file_system(desc.clone()).await.unwrap();

    let file_size = 100 * 1024;
    let mut max_buckets_seen = 0usize;
    let mut total_evicted = 0usize;
    for i in 0..12u32 {
        let name = format!("f{i}");
        write_remote_file(remote_dir.path(), &desc, &name, &vec![9u8; file_size]).await;
        let rel = RemotePath::from_string(&name).unwrap();
        let handle = e
            .facade()
            .open(desc.clone(), rel, OpenFlags::read_only())
            .await
            .unwrap();
        e.facade().close(handle).await.unwrap();

        max_buckets_seen = max_buckets_seen.max(e.registry().lru_stats().bucket_count);

        if i % 3 == 2 {
            tokio::time::advance(Duration::from_secs(11)).await;
        }
        let outcome = e.run_eviction_sweep().await;
        total_evicted += outcome.evicted_count;
    }

    let stats = e.registry().lru_stats();
    assert!(
        stats.current_capacity as u64 <= 1024 * 1024 + file_size as u64,
        "current_capacity {} exceeds the one-file margin",
        stats.current_capacity
    );
    assert!(
        max_buckets_seen >= 3,
        "expected at least 3 age buckets to have existed at some point; saw {max_buckets_seen}"
    );
    assert!(total_evicted > 0, "tight capacity limit should have forced at least one eviction");
}

#[tokio::test]
async fn scenario_6_reload_after_restart_rediscovers_all_files() {
    let cache_dir = camino_tempfile::tempdir().unwrap();
    let remote_dir = camino_tempfile::tempdir().unwrap();
    let desc = FileSystemDescriptor::new(Kind::Hdfs, "h", 8020);

    {
        let e = engine(cache_dir.path(), remote_dir.path(), 10_000_000).await;
        e.configure_file_system(desc.clone()).await.unwrap();
        for i in 0..10u32 {
            let name = format!("f{i}");
            write_remote_file(remote_dir.path(), &desc, &name, &vec![3u8; 1024]).await;
            let rel = RemotePath::from_string(&name).unwrap();
            let handle = e.facade().open(desc.clone(), rel, OpenFlags::read_only()).await.unwrap();
            e.facade().close(handle).await.unwrap();
        }
        // `e` drops here, simulating process exit; nothing persists beyond the
        // cache files themselves (spec.md §6.3).
    }

    let reloaded = engine(cache_dir.path(), remote_dir.path(), 10_000_000).await;
    let stats = reloaded.registry().lru_stats();
    assert_eq!(stats.hard_item_count, 10);
    assert_eq!(stats.current_capacity as u64, 10 * 1024);

    for i in 0..10u32 {
        let rel = RemotePath::from_string(&format!("f{i}")).unwrap();
        let snapshot = reloaded.facade().stat(&desc, &rel).await.unwrap();
        assert_eq!(snapshot.state, cache_engine::State::Idle);
    }
}
