//! Main test module for mirrorvault
//!
//! This module includes all test suites:
//! - Integration tests for end-to-end scenarios
//! - Chaos tests for interrupted transfers and corrupted stores
//! - Property-based tests for invariants
//! - Edge cases for unusual trees

pub mod integration;
pub mod chaos;

#[cfg(test)]
mod edge_cases {
    use ::mirrorvault::*;
    use std::fs;
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;

    fn mirror_and_source() -> (Mirror, PathBuf, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let source = temp_dir.path().join("source");
        fs::create_dir_all(&source).unwrap();
        let mirror = MirrorBuilder::new()
            .parallel_workers(2)
            .init(temp_dir.path().join("mirror"))
            .unwrap();
        (mirror, source, temp_dir)
    }

    #[test]
    fn test_empty_directory() {
        let (mirror, source, temp_dir) = mirror_and_source();

        let report = mirror.snapshot(&source, &SnapshotOptions::default()).unwrap();
        assert_eq!(report.entries, 0);
        assert_eq!(report.status, OperationStatus::Success);

        let dest = temp_dir.path().join("out");
        let restored = mirror.restore("latest", &dest, &RestoreOptions::default()).unwrap();
        assert_eq!(restored.entries_selected, 0);
        assert!(dest.is_dir());
        assert_eq!(fs::read_dir(&dest).unwrap().count(), 0);
    }

    #[test]
    fn test_empty_files_share_one_object() {
        let (mirror, source, _temp_dir) = mirror_and_source();
        fs::write(source.join("a.empty"), b"").unwrap();
        fs::write(source.join("b.empty"), b"").unwrap();

        let report = mirror.snapshot(&source, &SnapshotOptions::default()).unwrap();
        assert_eq!(report.entries, 2);
        assert_eq!(report.objects_written, 1);
        assert_eq!(mirror.stats().unwrap().total_bytes, 0);
    }

    #[test]
    fn test_special_filenames() {
        let (mirror, source, temp_dir) = mirror_and_source();
        let names = [
            "file with spaces.txt",
            "file-with-dashes.txt",
            "file.multiple.dots.txt",
            ".hidden",
            "UPPER.TXT",
            "résumé.pdf",
            "日本語.txt",
            "emoji_🎉.md",
        ];
        for name in &names {
            fs::write(source.join(name), name.as_bytes()).unwrap();
        }

        mirror.snapshot(&source, &SnapshotOptions::default()).unwrap();
        let dest = temp_dir.path().join("out");
        let report = mirror.restore("latest", &dest, &RestoreOptions::default()).unwrap();
        assert_eq!(report.files_restored, names.len());
        for name in &names {
            assert_eq!(fs::read(dest.join(name)).unwrap(), name.as_bytes(), "{}", name);
        }
    }

    #[test]
    fn test_deep_nesting() {
        let (mirror, source, temp_dir) = mirror_and_source();
        let mut deep = source.clone();
        for i in 0..30 {
            deep = deep.join(format!("level{}", i));
        }
        fs::create_dir_all(&deep).unwrap();
        fs::write(deep.join("bottom.txt"), "found me").unwrap();

        let report = mirror.snapshot(&source, &SnapshotOptions::default()).unwrap();
        assert_eq!(report.directories, 30);

        let dest = temp_dir.path().join("out");
        mirror.restore("latest", &dest, &RestoreOptions::default()).unwrap();
        let relative = deep.strip_prefix(&source).unwrap();
        assert_eq!(fs::read_to_string(dest.join(relative).join("bottom.txt")).unwrap(), "found me");
    }

    #[cfg(unix)]
    #[test]
    fn test_permission_preservation() {
        use std::os::unix::fs::PermissionsExt;

        let (mirror, source, temp_dir) = mirror_and_source();
        let script = source.join("run.sh");
        fs::write(&script, "#!/bin/sh\necho hi\n").unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o750)).unwrap();
        let private = source.join("private");
        fs::create_dir(&private).unwrap();
        fs::write(private.join("key"), "secret").unwrap();
        fs::set_permissions(private.join("key"), fs::Permissions::from_mode(0o600)).unwrap();
        fs::set_permissions(&private, fs::Permissions::from_mode(0o700)).unwrap();

        mirror.snapshot(&source, &SnapshotOptions::default()).unwrap();
        let dest = temp_dir.path().join("out");
        mirror.restore("latest", &dest, &RestoreOptions::default()).unwrap();

        let mode = |p: &Path| fs::metadata(p).unwrap().permissions().mode() & 0o7777;
        assert_eq!(mode(&dest.join("run.sh")), 0o750);
        assert_eq!(mode(&dest.join("private/key")), 0o600);
        assert_eq!(mode(&dest.join("private")), 0o700);
    }

    #[test]
    fn test_binary_manifest_format() {
        let temp_dir = TempDir::new().unwrap();
        let source = temp_dir.path().join("source");
        fs::create_dir_all(source.join("sub")).unwrap();
        fs::write(source.join("sub/x"), "x").unwrap();

        let mirror = MirrorBuilder::new()
            .manifest_format(ManifestFormat::Binary)
            .init(temp_dir.path().join("mirror"))
            .unwrap();
        let report = mirror.snapshot(&source, &SnapshotOptions::default()).unwrap();

        let path = temp_dir
            .path()
            .join("mirror/manifests")
            .join(format!("{}.bin", report.manifest_id));
        assert!(path.exists());

        let reopened = Mirror::open(temp_dir.path().join("mirror")).unwrap();
        let manifest = reopened.load_manifest(&report.manifest_id).unwrap();
        assert_eq!(manifest.entries.len(), 2);
    }

    #[test]
    fn test_manifest_prefix_resolution() {
        let (mirror, source, _temp_dir) = mirror_and_source();
        fs::write(source.join("f"), "1").unwrap();
        let first = mirror.snapshot(&source, &SnapshotOptions::default()).unwrap();

        // Ids start with a timestamp, so a long enough prefix is unique
        let prefix = &first.manifest_id[..first.manifest_id.len() - 4];
        assert_eq!(mirror.load_manifest(prefix).unwrap().id, first.manifest_id);
        assert!(matches!(
            mirror.load_manifest("19990101"),
            Err(MirrorError::ManifestNotFound(_))
        ));
    }

    #[test]
    fn test_restore_unknown_manifest() {
        let (mirror, _source, temp_dir) = mirror_and_source();
        let result = mirror.restore("latest", &temp_dir.path().join("out"), &RestoreOptions::default());
        assert!(matches!(result, Err(MirrorError::ManifestNotFound(_))));
    }
}
