//! Integration tests for mirrorvault
//!
//! End-to-end scenarios through the public API: snapshot, restore, sync and
//! verify against real temp directories.

use ::mirrorvault::*;
use filetime::FileTime;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing_test::traced_test;
use walkdir::WalkDir;

/// A source tree, a mirror and scratch space under one temp dir
pub struct TestEnv {
    pub temp_dir: TempDir,
    pub source: PathBuf,
    pub mirror: Mirror,
}

impl TestEnv {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().unwrap();
        let source = temp_dir.path().join("source");
        fs::create_dir_all(&source).unwrap();
        let mirror = MirrorBuilder::new()
            .parallel_workers(4)
            .init(temp_dir.path().join("mirror"))
            .unwrap();
        Self {
            temp_dir,
            source,
            mirror,
        }
    }

    pub fn write(&self, relative: &str, content: impl AsRef<[u8]>) {
        let path = self.source.join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, content).unwrap();
    }

    pub fn snapshot(&self) -> SnapshotReport {
        self.mirror.snapshot(&self.source, &SnapshotOptions::default()).unwrap()
    }

    pub fn scratch(&self, name: &str) -> PathBuf {
        self.temp_dir.path().join(name)
    }
}

/// Relative path -> file content for every regular file under `root`
pub fn tree_contents(root: &Path) -> BTreeMap<PathBuf, Vec<u8>> {
    WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| {
            let relative = e.path().strip_prefix(root).unwrap().to_path_buf();
            (relative, fs::read(e.path()).unwrap())
        })
        .collect()
}

#[traced_test]
#[test]
fn test_basic_workflow() {
    let env = TestEnv::new();
    env.write("README.md", "# My Project");
    env.write("src/main.rs", "fn main() {}");
    env.write("src/lib.rs", "pub fn hello() {}");

    let first = env.snapshot();
    assert_eq!(first.status, OperationStatus::Success);
    assert_eq!(first.entries, 4);
    assert_eq!(first.objects_written, 3);

    env.write("src/main.rs", "fn main() { println!(\"Hello\"); }");
    let second = env.snapshot();
    assert_eq!(second.changes.entries_modified, 1);
    assert_eq!(second.objects_written, 1);

    let dest = env.scratch("restored");
    env.mirror
        .restore(&first.manifest_id, &dest, &RestoreOptions::default())
        .unwrap();
    assert_eq!(fs::read_to_string(dest.join("src/main.rs")).unwrap(), "fn main() {}");
}

#[test]
fn test_duplicate_files_stored_once() {
    let env = TestEnv::new();
    let content = vec![0xABu8; 64 * 1024];
    for i in 0..10 {
        env.write(&format!("copies/copy{}.bin", i), &content);
    }

    let report = env.snapshot();
    assert_eq!(report.objects_written, 1);
    assert_eq!(env.mirror.stats().unwrap().object_count, 1);
    assert_eq!(env.mirror.stats().unwrap().total_bytes, content.len() as u64);

    let manifest = env.mirror.latest().unwrap().unwrap();
    let digests: Vec<_> = manifest.file_digests().collect();
    assert_eq!(digests.len(), 10);
    assert!(digests.windows(2).all(|w| w[0] == w[1]));
}

#[test]
fn test_single_modification_is_one_change() {
    let env = TestEnv::new();
    for i in 0..20 {
        env.write(&format!("file{:02}.txt", i), format!("content {}", i));
    }
    let first = env.snapshot();

    env.write("file07.txt", "changed content, different length");
    let second = env.snapshot();

    let diff = env.mirror.diff(&first.manifest_id, &second.manifest_id).unwrap();
    assert_eq!(diff.modified.len(), 1);
    assert!(diff.added.is_empty());
    assert!(diff.removed.is_empty());
    assert_eq!(diff.modified[0].1.path, PathBuf::from("file07.txt"));
    assert_eq!(second.files_reused, 19);
}

#[test]
fn test_unchanged_tree_writes_nothing() {
    let env = TestEnv::new();
    env.write("a/b/c.txt", "c");
    env.write("d.txt", "d");
    let first = env.snapshot();
    let second = env.snapshot();

    assert_eq!(second.objects_written, 0);
    assert!(!second.changes.has_changes());
    let m1 = env.mirror.load_manifest(&first.manifest_id).unwrap();
    let m2 = env.mirror.load_manifest(&second.manifest_id).unwrap();
    assert_eq!(m1.entries, m2.entries);
    assert_eq!(m2.predecessor.as_deref(), Some(m1.id.as_str()));
}

#[test]
fn test_no_dangling_digests() {
    let env = TestEnv::new();
    for i in 0..50 {
        env.write(&format!("dir{}/file{}.dat", i % 5, i), vec![i as u8; 100 + i]);
    }
    env.snapshot();

    let manifest = env.mirror.latest().unwrap().unwrap();
    for digest in manifest.file_digests() {
        assert!(env.mirror.store().has(digest), "dangling {}", digest);
    }
    assert!(env.mirror.verify(true).unwrap().is_valid());
}

#[test]
fn test_restore_reproduces_tree() {
    let env = TestEnv::new();
    env.write("docs/guide.md", "# Guide");
    env.write("docs/api/index.html", "<html></html>");
    env.write("data.bin", (0..=255u8).collect::<Vec<_>>());
    env.write("empty.txt", "");

    let old = FileTime::from_unix_time(1_500_000_000, 123_456_789);
    filetime::set_file_mtime(env.source.join("docs/guide.md"), old).unwrap();
    env.snapshot();

    let dest = env.scratch("restored");
    let report = env.mirror.restore("latest", &dest, &RestoreOptions::default()).unwrap();
    assert_eq!(report.status(), OperationStatus::Success);
    assert_eq!(tree_contents(&env.source), tree_contents(&dest));

    let restored = FileTime::from_last_modification_time(&fs::metadata(dest.join("docs/guide.md")).unwrap());
    assert_eq!(restored.unix_seconds(), old.unix_seconds());

    // Restoring again finds everything in place
    let again = env.mirror.restore("latest", &dest, &RestoreOptions::default()).unwrap();
    assert_eq!(again.files_restored, 0);
    assert_eq!(again.unchanged, again.entries_selected);
}

#[test]
fn test_restore_subtree_only() {
    let env = TestEnv::new();
    env.write("docs/a.md", "a");
    env.write("docs/deep/b.md", "b");
    env.write("src/main.rs", "fn main() {}");
    env.snapshot();

    let dest = env.scratch("partial");
    let options = RestoreOptions {
        filter: Some(PathFilter::Prefix(PathBuf::from("docs"))),
        ..Default::default()
    };
    let report = env.mirror.restore("latest", &dest, &options).unwrap();
    assert_eq!(report.files_restored, 2);
    assert!(dest.join("docs/deep/b.md").exists());
    assert!(!dest.join("src").exists());
}

#[test]
fn test_missing_object_reported_rest_restored() {
    let env = TestEnv::new();
    env.write("keep1.txt", "keep one");
    env.write("lost.txt", "this object goes missing");
    env.write("keep2.txt", "keep two");
    env.snapshot();

    let manifest = env.mirror.latest().unwrap().unwrap();
    let lost = manifest.find(Path::new("lost.txt")).unwrap();
    let digest = *lost.kind.digest().unwrap();
    fs::remove_file(env.mirror.store().object_path(&digest)).unwrap();

    let dest = env.scratch("restored");
    let report = env.mirror.restore("latest", &dest, &RestoreOptions::default()).unwrap();
    assert_eq!(report.status(), OperationStatus::Partial);
    assert_eq!(report.files_restored, 2);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].kind, FailureKind::ObjectNotFound);
    assert_eq!(report.failures[0].path, PathBuf::from("lost.txt"));
    assert!(dest.join("keep1.txt").exists());
    assert!(dest.join("keep2.txt").exists());
}

#[test]
fn test_verify_catches_change_fast_path_misses() {
    let env = TestEnv::new();
    env.write("config.ini", "mode=alpha");
    let first = env.snapshot();

    let path = env.source.join("config.ini");
    let mtime = FileTime::from_last_modification_time(&fs::metadata(&path).unwrap());
    fs::write(&path, "mode=omega").unwrap();
    filetime::set_file_mtime(&path, mtime).unwrap();

    let fast = env.snapshot();
    assert_eq!(fast.files_reused, 1);
    let fast_diff = env.mirror.diff(&first.manifest_id, &fast.manifest_id).unwrap();
    assert!(fast_diff.is_empty());

    let verified = env
        .mirror
        .snapshot(
            &env.source,
            &SnapshotOptions {
                verify: true,
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(verified.changes.entries_modified, 1);

    let dest = env.scratch("restored");
    env.mirror
        .restore(&verified.manifest_id, &dest, &RestoreOptions::default())
        .unwrap();
    assert_eq!(fs::read_to_string(dest.join("config.ini")).unwrap(), "mode=omega");
}

#[test]
fn test_sync_twice_transfers_nothing() {
    let env = TestEnv::new();
    env.write("a.txt", "alpha");
    env.write("b/c.txt", "gamma");
    env.snapshot();

    let remote = LocalDirTransport::new(env.scratch("offsite")).unwrap();
    let first = env.mirror.sync(&remote, &SyncOptions::default()).unwrap();
    assert_eq!(first.objects_transferred, 2);
    assert_eq!(first.manifests_transferred.len(), 1);

    let second = env.mirror.sync(&remote, &SyncOptions::default()).unwrap();
    assert_eq!(second.status(), OperationStatus::Success);
    assert_eq!(second.objects_transferred, 0);
    assert_eq!(second.bytes_transferred, 0);
    assert!(second.manifests_transferred.is_empty());
}

#[test]
fn test_offsite_copy_is_a_usable_mirror() {
    let env = TestEnv::new();
    env.write("photos/1.jpg", vec![1u8; 2048]);
    env.write("photos/2.jpg", vec![2u8; 2048]);
    let snap = env.snapshot();

    let offsite = env.scratch("offsite");
    let remote = LocalDirTransport::new(&offsite).unwrap();
    env.mirror.sync(&remote, &SyncOptions::default()).unwrap();

    // The remote has the mirror layout; read it back with the library types
    let store = ContentStore::open(offsite.join("objects")).unwrap();
    let manifests = ManifestStore::open(offsite.join("manifests"), ManifestFormat::Json).unwrap();
    let manifest = manifests.load(&snap.manifest_id).unwrap();

    let dest = env.scratch("from-offsite");
    let report = restore::restore(&store, &manifest, &dest, &RestoreOptions::default()).unwrap();
    assert_eq!(report.files_restored, 2);
    assert_eq!(tree_contents(&env.source), tree_contents(&dest));
}

#[test]
fn test_history_sync_in_order() {
    let env = TestEnv::new();
    let mut ids = Vec::new();
    for round in 0..3 {
        env.write(&format!("round{}.txt", round), format!("round {}", round));
        ids.push(env.snapshot().manifest_id);
    }

    let remote = LocalDirTransport::new(env.scratch("offsite")).unwrap();
    let report = env.mirror.sync(&remote, &SyncOptions::default()).unwrap();
    assert_eq!(report.manifests_transferred, ids);
    assert!(sync::verify_remote(&remote, false).unwrap().is_valid());
}

#[test]
fn test_two_sources_share_one_mirror() {
    let env = TestEnv::new();
    let other = env.scratch("other-source");
    fs::create_dir_all(&other).unwrap();

    // Same name, size and mtime in both trees, different bytes
    let stamp = FileTime::from_unix_time(1_600_000_000, 0);
    env.write("notes.txt", "ours");
    fs::write(other.join("notes.txt"), "them").unwrap();
    fs::write(other.join("shared.bin"), vec![9u8; 512]).unwrap();
    env.write("shared.bin", vec![9u8; 512]);
    filetime::set_file_mtime(env.source.join("notes.txt"), stamp).unwrap();
    filetime::set_file_mtime(other.join("notes.txt"), stamp).unwrap();

    let first = env.snapshot();
    let theirs = env.mirror.snapshot(&other, &SnapshotOptions::default()).unwrap();
    assert_eq!(theirs.files_reused, 0);
    assert_eq!(theirs.objects_written, 1, "shared.bin dedups across sources");
    let manifest = env.mirror.load_manifest(&theirs.manifest_id).unwrap();
    assert!(manifest.predecessor.is_none());

    let again = env.snapshot();
    assert_eq!(again.files_reused, 2);
    let manifest = env.mirror.load_manifest(&again.manifest_id).unwrap();
    assert_eq!(manifest.predecessor.as_deref(), Some(first.manifest_id.as_str()));

    let dest = env.scratch("theirs");
    env.mirror
        .restore(&theirs.manifest_id, &dest, &RestoreOptions::default())
        .unwrap();
    assert_eq!(fs::read_to_string(dest.join("notes.txt")).unwrap(), "them");
}

#[cfg(unix)]
#[traced_test]
#[test]
fn test_non_utf8_name_is_reported_not_fatal() {
    use std::ffi::OsStr;
    use std::os::unix::ffi::OsStrExt;

    let env = TestEnv::new();
    env.write("fine.txt", "fine");
    if fs::write(env.source.join(OsStr::from_bytes(b"caf\xe9.txt")), "latin-1").is_err() {
        return;
    }

    let report = env.snapshot();
    assert_eq!(report.status, OperationStatus::Partial);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].kind, FailureKind::UnsupportedPath);
    assert!(report.failures[0].path.to_str().is_some());

    let dest = env.scratch("restored");
    let restored = env
        .mirror
        .restore(&report.manifest_id, &dest, &RestoreOptions::default())
        .unwrap();
    assert_eq!(restored.files_restored, 1);
    assert_eq!(fs::read_to_string(dest.join("fine.txt")).unwrap(), "fine");
}

#[test]
fn test_pull_into_fresh_mirror_then_relocate() {
    let env = TestEnv::new();
    env.write("home/alice/todo.txt", "buy milk");
    env.write("etc/app.conf", "debug=false");
    let snap = env.snapshot();

    let remote = LocalDirTransport::new(env.scratch("offsite")).unwrap();
    env.mirror.sync(&remote, &SyncOptions::default()).unwrap();

    let rebuilt = Mirror::init(env.scratch("rebuilt")).unwrap();
    let report = rebuilt.pull(&remote, Some("latest"), &SyncOptions::default()).unwrap();
    assert_eq!(report.status(), OperationStatus::Success);
    assert_eq!(report.manifests_transferred, vec![snap.manifest_id.clone()]);
    assert_eq!(report.objects_transferred, 2);

    let dest = env.scratch("restored");
    let options = RestoreOptions {
        substitutions: vec![PathSubstitution::new("home/alice", "home/bob")],
        ..Default::default()
    };
    let restored = rebuilt.restore("latest", &dest, &options).unwrap();
    assert_eq!(restored.status(), OperationStatus::Success);
    assert_eq!(fs::read_to_string(dest.join("home/bob/todo.txt")).unwrap(), "buy milk");
    assert_eq!(fs::read_to_string(dest.join("etc/app.conf")).unwrap(), "debug=false");
    assert!(!dest.join("home/alice").exists());
}
