//! Chaos testing for mirrorvault
//!
//! Interrupted uploads, failing remotes, corrupted objects and concurrent
//! writers. Every scenario checks that nothing incomplete ends up under a
//! final name and that a later run recovers.

use ::mirrorvault::*;
use mirrorvault::remote::{object_path, TransferResult, MANIFESTS_DIR, OBJECTS_DIR, PARTIAL_SUFFIX};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::fs;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tracing::info;
use walkdir::WalkDir;

/// Mirror with a few hundred kilobytes of random content already snapshotted
pub struct ChaosEnv {
    pub temp_dir: TempDir,
    pub source: PathBuf,
    pub mirror: Mirror,
}

impl ChaosEnv {
    pub fn new(seed: u64, files: usize) -> Self {
        let temp_dir = TempDir::new().unwrap();
        let source = temp_dir.path().join("source");
        let mut rng = StdRng::seed_from_u64(seed);
        for i in 0..files {
            let dir = source.join(format!("d{}", i % 4));
            fs::create_dir_all(&dir).unwrap();
            let len = rng.random_range(100..8192);
            let content: Vec<u8> = (0..len).map(|_| rng.random()).collect();
            fs::write(dir.join(format!("f{}.bin", i)), content).unwrap();
        }

        let mirror = MirrorBuilder::new()
            .parallel_workers(4)
            .init(temp_dir.path().join("mirror"))
            .unwrap();
        mirror.snapshot(&source, &SnapshotOptions::default()).unwrap();
        Self {
            temp_dir,
            source,
            mirror,
        }
    }

    pub fn remote_root(&self) -> PathBuf {
        self.temp_dir.path().join("remote")
    }

    pub fn remote(&self) -> LocalDirTransport {
        LocalDirTransport::new(self.remote_root()).unwrap()
    }
}

fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(5),
        multiplier: 2.0,
    }
}

/// Writer that accepts `remaining` bytes, then fails like a dropped link
struct DroppingWriter {
    inner: Box<dyn Write + Send>,
    remaining: usize,
}

impl Write for DroppingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.remaining == 0 {
            return Err(io::Error::new(io::ErrorKind::ConnectionReset, "link dropped"));
        }
        let n = buf.len().min(self.remaining);
        let written = self.inner.write(&buf[..n])?;
        self.remaining -= written;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Transport whose first `drops` object uploads die mid-stream
struct DroppingTransport {
    inner: LocalDirTransport,
    drops: AtomicU32,
}

impl DroppingTransport {
    fn new(inner: LocalDirTransport, drops: u32) -> Self {
        Self {
            inner,
            drops: AtomicU32::new(drops),
        }
    }
}

impl RemoteTransport for DroppingTransport {
    fn list(&self, path: &str) -> TransferResult<Vec<String>> {
        self.inner.list(path)
    }

    fn open_write(&self, path: &str) -> TransferResult<Box<dyn Write + Send>> {
        let writer = self.inner.open_write(path)?;
        let drop_this = path.starts_with(OBJECTS_DIR)
            && self
                .drops
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
        if drop_this {
            Ok(Box::new(DroppingWriter {
                inner: writer,
                remaining: 16,
            }))
        } else {
            Ok(writer)
        }
    }

    fn open_read(&self, path: &str) -> TransferResult<Box<dyn Read + Send>> {
        self.inner.open_read(path)
    }

    fn rename(&self, from: &str, to: &str) -> TransferResult<()> {
        self.inner.rename(from, to)
    }

    fn delete(&self, path: &str) -> TransferResult<()> {
        self.inner.delete(path)
    }
}

/// Transport that loses permission to publish anything
struct NoRenameTransport {
    inner: LocalDirTransport,
}

impl RemoteTransport for NoRenameTransport {
    fn list(&self, path: &str) -> TransferResult<Vec<String>> {
        self.inner.list(path)
    }

    fn open_write(&self, path: &str) -> TransferResult<Box<dyn Write + Send>> {
        self.inner.open_write(path)
    }

    fn open_read(&self, path: &str) -> TransferResult<Box<dyn Read + Send>> {
        self.inner.open_read(path)
    }

    fn rename(&self, _from: &str, _to: &str) -> TransferResult<()> {
        Err(io::Error::new(io::ErrorKind::PermissionDenied, "bucket is read-only").into())
    }

    fn delete(&self, path: &str) -> TransferResult<()> {
        self.inner.delete(path)
    }
}

/// Every final-named remote object hashes to its name
fn assert_remote_objects_intact(root: &std::path::Path) {
    for entry in WalkDir::new(root.join(OBJECTS_DIR)).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.ends_with(PARTIAL_SUFFIX) {
            continue;
        }
        let bytes = fs::read(entry.path()).unwrap();
        assert_eq!(
            mirrorvault::digest::digest_bytes(&bytes).to_hex(),
            name,
            "corrupt final object {:?}",
            entry.path()
        );
    }
}

#[test]
fn test_interrupted_sync_resumes_cleanly() {
    let env = ChaosEnv::new(7, 24);
    let flaky = DroppingTransport::new(env.remote(), 5);

    let options = SyncOptions {
        retry: RetryPolicy::no_retry(),
        concurrency: 3,
        ..Default::default()
    };
    let interrupted = env.mirror.sync(&flaky, &options).unwrap();
    info!("interrupted run: {:?}", interrupted.status());
    assert_eq!(interrupted.status(), OperationStatus::Partial);
    assert_eq!(interrupted.failures.len(), 5);
    assert_eq!(interrupted.manifests_blocked.len(), 1);
    assert!(interrupted
        .failures
        .iter()
        .all(|f| f.kind == FailureKind::RemoteTransfer));
    assert_remote_objects_intact(&env.remote_root());

    let resumed = env.mirror.sync(&env.remote(), &options).unwrap();
    assert_eq!(resumed.status(), OperationStatus::Success);
    assert_eq!(resumed.objects_transferred, 5);
    assert_eq!(resumed.manifests_transferred.len(), 1);
    assert_remote_objects_intact(&env.remote_root());
    assert!(sync::verify_remote(&env.remote(), true).unwrap().is_valid());
}

#[test]
fn test_retries_absorb_dropped_links() {
    let env = ChaosEnv::new(11, 12);
    let flaky = DroppingTransport::new(env.remote(), 3);

    let options = SyncOptions {
        retry: fast_retry(4),
        concurrency: 2,
        ..Default::default()
    };
    let report = env.mirror.sync(&flaky, &options).unwrap();
    assert_eq!(report.status(), OperationStatus::Success);
    assert_eq!(report.retries, 3);
    assert_eq!(report.objects_transferred, report.local_objects);
    assert_remote_objects_intact(&env.remote_root());
}

#[test]
fn test_fatal_remote_error_publishes_nothing() {
    let env = ChaosEnv::new(13, 8);
    let locked = NoRenameTransport { inner: env.remote() };

    let result = env.mirror.sync(&locked, &SyncOptions::default());
    match result {
        Err(MirrorError::RemoteTransfer(e)) => assert_eq!(e.kind, TransferErrorKind::Fatal),
        other => panic!("expected fatal transfer error, got {:?}", other.map(|r| r.status())),
    }

    assert!(sync::remote_inventory(&env.remote()).unwrap().is_empty());
    assert!(env.remote().list(MANIFESTS_DIR).unwrap().is_empty());

    let report = env.mirror.sync(&env.remote(), &SyncOptions::default()).unwrap();
    assert_eq!(report.status(), OperationStatus::Success);
    assert_remote_objects_intact(&env.remote_root());
}

#[test]
fn test_cancel_during_sync_then_resume() {
    let env = ChaosEnv::new(17, 16);
    let token = CancellationToken::new();
    let trigger = token.clone();

    let options = SyncOptions {
        retry: RetryPolicy::no_retry(),
        concurrency: 1,
        skip_space_check: false,
        cancel: Some(token),
        progress: Some(Arc::new(move |info: ProgressInfo| {
            if info.processed >= 4 {
                trigger.cancel();
            }
        })),
    };
    let result = env.mirror.sync(&env.remote(), &options);
    assert!(matches!(result, Err(MirrorError::Cancelled)));
    assert!(env.remote().list(MANIFESTS_DIR).unwrap().is_empty());
    assert_remote_objects_intact(&env.remote_root());

    let report = env.mirror.sync(&env.remote(), &SyncOptions::default()).unwrap();
    assert_eq!(report.status(), OperationStatus::Success);
    assert!(report.objects_transferred < report.local_objects);
    assert!(sync::verify_remote(&env.remote(), true).unwrap().is_valid());
}

#[test]
fn test_random_corruption_detected() {
    let env = ChaosEnv::new(23, 20);
    let mut rng = StdRng::seed_from_u64(99);

    let mut digests: Vec<Digest> = env.mirror.store().inventory().unwrap().into_iter().collect();
    digests.sort();
    digests.shuffle(&mut rng);
    let mut victims: Vec<Digest> = digests[..3].to_vec();
    victims.sort();

    for digest in &victims {
        let path = env.mirror.store().object_path(digest);
        let mut bytes = fs::read(&path).unwrap();
        let at = rng.random_range(0..bytes.len());
        bytes[at] ^= 0xFF;
        fs::write(&path, bytes).unwrap();
    }

    let shallow = env.mirror.verify(false).unwrap();
    assert!(shallow.is_valid());

    let deep = env.mirror.verify(true).unwrap();
    assert_eq!(deep.corrupt_objects, victims);

    let dest = env.temp_dir.path().join("restored");
    let report = env.mirror.restore("latest", &dest, &RestoreOptions::default()).unwrap();
    assert_eq!(report.status(), OperationStatus::Partial);
    assert_eq!(report.failures.len(), 3);
    assert!(report
        .failures
        .iter()
        .all(|f| f.kind == FailureKind::ContentCollision));
    for failure in &report.failures {
        assert!(!dest.join(&failure.path).exists());
    }
}

#[test]
fn test_corrupt_manifest_reported() {
    let env = ChaosEnv::new(29, 4);
    let id = env.mirror.list_manifests().unwrap().remove(0);
    let path = env.mirror.manifests().dir().join(format!("{}.json", id));
    fs::write(&path, b"{ not json").unwrap();

    let report = env.mirror.verify(false).unwrap();
    assert_eq!(report.corrupt_manifests, vec![id.clone()]);
    assert!(matches!(
        env.mirror.load_manifest(&id),
        Err(MirrorError::ManifestCorrupt(_))
    ));
}

#[test]
fn test_stale_temporaries_ignored_and_purged() {
    let env = ChaosEnv::new(31, 4);
    let before = env.mirror.stats().unwrap();
    let digest = env.mirror.store().list().next().unwrap().unwrap();
    let shard = env.mirror.store().object_path(&digest).parent().unwrap().to_path_buf();
    fs::write(shard.join(".tmpABC123"), b"half an object").unwrap();
    fs::write(env.mirror.store().root().join(".tmpXYZ"), b"orphan").unwrap();

    assert_eq!(env.mirror.stats().unwrap().object_count, before.object_count);
    assert!(env.mirror.verify(true).unwrap().is_valid());
    assert_eq!(env.mirror.cleanup().unwrap(), 2);
    assert!(!shard.join(".tmpABC123").exists());
}

#[test]
fn test_concurrent_snapshots_share_store() {
    let env = ChaosEnv::new(37, 8);
    let other = env.temp_dir.path().join("other");
    fs::create_dir_all(&other).unwrap();
    for entry in fs::read_dir(env.source.join("d0")).unwrap() {
        let entry = entry.unwrap();
        fs::copy(entry.path(), other.join(entry.file_name())).unwrap();
    }
    fs::write(other.join("unique.txt"), "only here").unwrap();

    let objects_before = env.mirror.stats().unwrap().object_count;
    let handles: Vec<_> = [env.source.clone(), other.clone()]
        .into_iter()
        .map(|src| {
            let mirror = env.mirror.clone();
            std::thread::spawn(move || {
                mirror
                    .snapshot(
                        &src,
                        &SnapshotOptions {
                            verify: true,
                            ..Default::default()
                        },
                    )
                    .unwrap()
            })
        })
        .collect();
    let reports: Vec<SnapshotReport> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert!(reports.iter().all(|r| r.status == OperationStatus::Success));
    assert_eq!(env.mirror.stats().unwrap().object_count, objects_before + 1);
    assert_eq!(env.mirror.list_manifests().unwrap().len(), 3);
    assert!(env.mirror.verify(true).unwrap().is_valid());
}

#[test]
fn test_remote_object_path_layout() {
    let env = ChaosEnv::new(41, 2);
    env.mirror.sync(&env.remote(), &SyncOptions::default()).unwrap();
    for digest in env.mirror.store().inventory().unwrap() {
        let hex = digest.to_hex();
        let expected = env
            .remote_root()
            .join(OBJECTS_DIR)
            .join(&hex[..2])
            .join(&hex[2..4])
            .join(&hex);
        assert!(expected.is_file());
        assert_eq!(env.remote_root().join(object_path(&digest)), expected);
    }
}

/// Reader that yields `remaining` bytes, then fails like a dropped link
struct DroppingReader {
    inner: Box<dyn Read + Send>,
    remaining: usize,
}

impl Read for DroppingReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining == 0 {
            return Err(io::Error::new(io::ErrorKind::ConnectionReset, "link dropped"));
        }
        let n = buf.len().min(self.remaining);
        let read = self.inner.read(&mut buf[..n])?;
        self.remaining -= read;
        Ok(read)
    }
}

/// Transport whose first `drops` object downloads die mid-stream
struct DroppingReadTransport {
    inner: LocalDirTransport,
    drops: AtomicU32,
}

impl RemoteTransport for DroppingReadTransport {
    fn list(&self, path: &str) -> TransferResult<Vec<String>> {
        self.inner.list(path)
    }

    fn open_write(&self, path: &str) -> TransferResult<Box<dyn Write + Send>> {
        self.inner.open_write(path)
    }

    fn open_read(&self, path: &str) -> TransferResult<Box<dyn Read + Send>> {
        let reader = self.inner.open_read(path)?;
        let drop_this = path.starts_with(OBJECTS_DIR)
            && self
                .drops
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
        if drop_this {
            Ok(Box::new(DroppingReader {
                inner: reader,
                remaining: 16,
            }))
        } else {
            Ok(reader)
        }
    }

    fn rename(&self, from: &str, to: &str) -> TransferResult<()> {
        self.inner.rename(from, to)
    }

    fn delete(&self, path: &str) -> TransferResult<()> {
        self.inner.delete(path)
    }
}

fn no_partials_left(root: &std::path::Path) -> bool {
    WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .all(|e| !e.file_name().to_string_lossy().ends_with(PARTIAL_SUFFIX))
}

#[test]
fn test_exhausted_uploads_leave_no_partials() {
    let env = ChaosEnv::new(43, 10);
    let flaky = DroppingTransport::new(env.remote(), 4);
    let options = SyncOptions {
        retry: RetryPolicy::no_retry(),
        concurrency: 2,
        ..Default::default()
    };

    let report = env.mirror.sync(&flaky, &options).unwrap();
    assert_eq!(report.failures.len(), 4);
    assert!(no_partials_left(&env.remote_root()));
    assert_remote_objects_intact(&env.remote_root());
}

#[test]
fn test_interrupted_pull_resumes_cleanly() {
    let env = ChaosEnv::new(47, 16);
    env.mirror.sync(&env.remote(), &SyncOptions::default()).unwrap();
    let id = env.mirror.list_manifests().unwrap().remove(0);

    let rebuilt = Mirror::init(env.temp_dir.path().join("rebuilt")).unwrap();
    let flaky = DroppingReadTransport {
        inner: env.remote(),
        drops: AtomicU32::new(6),
    };
    let options = SyncOptions {
        retry: RetryPolicy::no_retry(),
        concurrency: 3,
        ..Default::default()
    };

    let interrupted = rebuilt.pull(&flaky, None, &options).unwrap();
    assert_eq!(interrupted.status(), OperationStatus::Partial);
    assert_eq!(interrupted.failures.len(), 6);
    assert!(interrupted
        .failures
        .iter()
        .all(|f| f.kind == FailureKind::RemoteTransfer));
    assert_eq!(interrupted.manifests_blocked, vec![id.clone()]);
    assert!(rebuilt.list_manifests().unwrap().is_empty());
    assert_eq!(rebuilt.cleanup().unwrap(), 0, "failed downloads leave no temp files");
    assert!(rebuilt.verify(true).unwrap().is_valid());

    let resumed = rebuilt.pull(&env.remote(), None, &options).unwrap();
    assert_eq!(resumed.status(), OperationStatus::Success);
    assert_eq!(resumed.objects_transferred, 6);
    assert_eq!(resumed.manifests_transferred, vec![id]);

    let dest = env.temp_dir.path().join("restored");
    rebuilt.restore("latest", &dest, &RestoreOptions::default()).unwrap();
    for entry in WalkDir::new(&env.source).into_iter().filter_map(|e| e.ok()) {
        if entry.file_type().is_file() {
            let relative = entry.path().strip_prefix(&env.source).unwrap();
            assert_eq!(fs::read(entry.path()).unwrap(), fs::read(dest.join(relative)).unwrap());
        }
    }
}

#[test]
fn test_pull_retries_absorb_dropped_reads() {
    let env = ChaosEnv::new(53, 8);
    env.mirror.sync(&env.remote(), &SyncOptions::default()).unwrap();
    let rebuilt = Mirror::init(env.temp_dir.path().join("rebuilt")).unwrap();
    let flaky = DroppingReadTransport {
        inner: env.remote(),
        drops: AtomicU32::new(3),
    };
    let options = SyncOptions {
        retry: fast_retry(4),
        concurrency: 2,
        ..Default::default()
    };

    let report = rebuilt.pull(&flaky, Some("latest"), &options).unwrap();
    assert_eq!(report.status(), OperationStatus::Success);
    assert_eq!(report.retries, 3);
    assert_eq!(report.objects_transferred, env.mirror.stats().unwrap().object_count);
}

#[cfg(unix)]
#[test]
fn test_concurrent_sources_with_colliding_names() {
    use std::ffi::OsStr;
    use std::os::unix::ffi::OsStrExt;

    let env = ChaosEnv::new(59, 4);
    let stamp = filetime::FileTime::from_unix_time(1_650_000_000, 0);
    let trees: Vec<PathBuf> = (0..2).map(|i| env.temp_dir.path().join(format!("tree{}", i))).collect();
    for (i, tree) in trees.iter().enumerate() {
        fs::create_dir_all(tree).unwrap();
        let file = tree.join("same.txt");
        fs::write(&file, format!("tree {}", i)).unwrap();
        filetime::set_file_mtime(&file, stamp).unwrap();
    }
    let odd_name = fs::write(trees[1].join(OsStr::from_bytes(b"odd\xfe")), "odd").is_ok();

    // Seed history for tree0 so tree1 has a same-named, same-mtime candidate
    env.mirror.snapshot(&trees[0], &SnapshotOptions::default()).unwrap();

    let handles: Vec<_> = trees
        .iter()
        .cloned()
        .map(|tree| {
            let mirror = env.mirror.clone();
            std::thread::spawn(move || mirror.snapshot(&tree, &SnapshotOptions::default()).unwrap())
        })
        .collect();
    let reports: Vec<SnapshotReport> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_eq!(reports[0].status, OperationStatus::Success);
    if odd_name {
        assert_eq!(reports[1].status, OperationStatus::Partial);
        assert_eq!(reports[1].failures[0].kind, FailureKind::UnsupportedPath);
    }
    for (i, report) in reports.iter().enumerate() {
        let dest = env.temp_dir.path().join(format!("out{}", i));
        env.mirror
            .restore(&report.manifest_id, &dest, &RestoreOptions::default())
            .unwrap();
        assert_eq!(fs::read_to_string(dest.join("same.txt")).unwrap(), format!("tree {}", i));
    }
    assert!(env.mirror.verify(true).unwrap().is_valid());
}
