//! Incremental snapshot builder
//!
//! A snapshot walks the source tree, makes sure every regular file's content
//! is in the store, and commits a manifest describing the tree.
//!
//! ## Fast path
//!
//! The previous manifest is the newest one taken from the same source root.
//! A file whose size and modification time (to the nanosecond) match the
//! previous manifest's entry for the same path is not read again; its
//! recorded digest is reused, provided the store still has that object.
//! This is what makes repeated snapshots of a large, mostly unchanged tree
//! cheap.
//!
//! The fast path can miss an edit that keeps the size and restores the old
//! mtime (tools that preserve timestamps, coarse filesystem clocks). Snapshots
//! taken with `verify` set re-hash every file and catch such changes.
//!
//! ## Failures
//!
//! - A file that cannot be read or vanishes is recorded in the report and
//!   left out of the manifest. So is a path a manifest cannot hold (a name
//!   that is not valid UTF-8).
//! - New content is hashed in the same pass that copies it into the store,
//!   so the recorded digest always matches the stored bytes.
//! - A failure writing into the store aborts the snapshot. No manifest is
//!   committed, so the history never references missing content.
//! - Cancellation aborts the same way, with [`MirrorError::Cancelled`].

use crate::cancel::{self, CancellationToken};
use crate::collections::{shared_digest_set, DigestSet, HashMap, HashMapExt, HashSetExt};
use crate::digest::{digest_file, Digest};
use crate::error::{MirrorError, Result};
use crate::manifest::{diff, EntryKind, Manifest, ManifestEntry, ManifestStore};
use crate::scanner::{ScannedEntry, ScannedKind, TreeScanner};
use crate::storage::{ContentStore, PutOutcome};
use crate::types::{ChangeStats, EntryFailure, OperationStatus, ProgressInfo, SnapshotOptions, SnapshotReport};
use crate::utils;
use rayon::prelude::*;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;
use tracing::{debug, info, trace, warn};

/// Builds snapshots of one source tree into one mirror
pub struct SnapshotBuilder<'a> {
    store: &'a ContentStore,
    manifests: &'a ManifestStore,
    scanner: TreeScanner,
    parallel_workers: usize,
}

/// Per-run counters shared by the worker threads
#[derive(Default)]
struct Counters {
    processed: AtomicUsize,
    files_hashed: AtomicUsize,
    files_reused: AtomicUsize,
    objects_written: AtomicUsize,
    bytes_stored: AtomicU64,
    bytes_processed: AtomicU64,
}

impl<'a> SnapshotBuilder<'a> {
    pub fn new(store: &'a ContentStore, manifests: &'a ManifestStore, scanner: TreeScanner) -> Self {
        Self {
            store,
            manifests,
            scanner,
            parallel_workers: num_cpus::get(),
        }
    }

    pub fn with_parallel_workers(mut self, workers: usize) -> Self {
        self.parallel_workers = workers.max(1);
        self
    }

    /// Snapshot the tree against the latest manifest taken from the same source.
    ///
    /// Manifests of other trees sharing the mirror are never used for the
    /// fast path; the first snapshot of a source hashes everything.
    pub fn build(&self, options: &SnapshotOptions) -> Result<(Manifest, SnapshotReport)> {
        let previous = self.manifests.latest_for_source(&self.source_path()?)?;
        self.build_against(previous.as_ref(), options)
    }

    /// Canonical source root, as recorded in manifests
    fn source_path(&self) -> Result<PathBuf> {
        let root = self.scanner.root();
        let source = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());
        if source.to_str().is_none() {
            return Err(MirrorError::UnsupportedPath(format!(
                "source {} is not valid UTF-8",
                source.to_string_lossy()
            )));
        }
        Ok(source)
    }

    /// Snapshot the tree, reusing digests from `previous`
    pub fn build_against(
        &self,
        previous: Option<&Manifest>,
        options: &SnapshotOptions,
    ) -> Result<(Manifest, SnapshotReport)> {
        let start = Instant::now();
        let cancel = options.cancel.as_ref();
        cancel::check(cancel)?;
        let source = self.source_path()?;

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.parallel_workers)
            .build()
            .map_err(|e| MirrorError::internal(format!("failed to build worker pool: {}", e)))?;

        let scan = pool.install(|| self.scanner.scan(cancel))?;
        debug!(
            "Scanned {} entries from {:?} ({} unreadable)",
            scan.entries.len(),
            self.scanner.root(),
            scan.failures.len()
        );

        let mut previous_index: HashMap<&Path, &ManifestEntry> =
            HashMap::with_capacity(previous.map_or(0, |p| p.entries.len()));
        if let Some(prev) = previous {
            for entry in &prev.entries {
                previous_index.insert(entry.path.as_path(), entry);
            }
        }

        let counters = Counters::default();
        let stored_this_run = shared_digest_set();
        let total = scan.entries.len();

        let outcomes: Vec<Result<std::result::Result<ManifestEntry, EntryFailure>>> = pool.install(|| {
            scan.entries
                .par_iter()
                .map(|scanned| {
                    cancel::check(cancel)?;
                    let outcome = match &scanned.kind {
                        ScannedKind::RegularFile => {
                            let prior = previous_index.get(scanned.path.as_path()).copied();
                            self.snapshot_file(scanned, prior, options.verify, &counters, &stored_this_run)?
                        }
                        ScannedKind::Symlink { target } => Ok(metadata_entry(
                            scanned,
                            EntryKind::Symlink {
                                target: target.clone(),
                            },
                        )),
                        ScannedKind::Directory => Ok(metadata_entry(scanned, EntryKind::Directory)),
                    };

                    let processed = counters.processed.fetch_add(1, Ordering::Relaxed) + 1;
                    if let Some(progress) = &options.progress {
                        progress(ProgressInfo {
                            operation: "Snapshotting".to_string(),
                            current_item: Some(scanned.path.to_string_lossy().into_owned()),
                            processed,
                            total: Some(total),
                            bytes_processed: counters.bytes_processed.load(Ordering::Relaxed),
                        });
                    }
                    Ok(outcome)
                })
                .collect()
        });

        let mut entries = Vec::with_capacity(total);
        let mut failures = scan.failures;
        for outcome in outcomes {
            match outcome? {
                Ok(entry) => entries.push(entry),
                Err(failure) => failures.push(failure),
            }
        }
        cancel::check(cancel)?;

        // No manifest may reference content the store does not hold
        let mut referenced = DigestSet::with_capacity(entries.len());
        for digest in entries.iter().filter_map(|e| e.kind.digest()) {
            if referenced.insert(*digest) && !self.store.has(digest) {
                warn!("Object {} vanished before commit", digest.short());
                return Err(MirrorError::ObjectNotFound(*digest));
            }
        }

        let manifest = Manifest::build(entries, previous.map(|p| p.id.as_str()), source)?;
        cancel::check(cancel)?;
        self.manifests.commit(&manifest)?;

        let changes = match previous {
            Some(prev) => diff(prev, &manifest).stats,
            None => ChangeStats {
                entries_added: manifest.entries.len(),
                bytes_added: manifest.total_size(),
                ..Default::default()
            },
        };

        failures.sort_by(|a, b| a.path.cmp(&b.path));
        let report = SnapshotReport {
            manifest_id: manifest.id.clone(),
            status: OperationStatus::from_failures(failures.len()),
            entries: manifest.entries.len(),
            files_hashed: counters.files_hashed.load(Ordering::Relaxed),
            files_reused: counters.files_reused.load(Ordering::Relaxed),
            objects_written: counters.objects_written.load(Ordering::Relaxed),
            bytes_stored: counters.bytes_stored.load(Ordering::Relaxed),
            directories: manifest.entries.iter().filter(|e| e.kind.is_dir()).count(),
            symlinks: manifest
                .entries
                .iter()
                .filter(|e| matches!(e.kind, EntryKind::Symlink { .. }))
                .count(),
            changes,
            failures,
            duration_ms: start.elapsed().as_millis() as u64,
        };

        info!(
            "Created snapshot {} in {:?} ({} entries, {} new objects, {})",
            manifest.id,
            start.elapsed(),
            report.entries,
            report.objects_written,
            utils::format_bytes(report.bytes_stored)
        );
        Ok((manifest, report))
    }

    /// Make sure one regular file's content is stored.
    ///
    /// The outer `Result` carries fatal errors; the inner one a failure that
    /// only affects this entry.
    fn snapshot_file(
        &self,
        scanned: &ScannedEntry,
        prior: Option<&ManifestEntry>,
        verify: bool,
        counters: &Counters,
        stored_this_run: &crate::collections::SharedDigestSet,
    ) -> Result<std::result::Result<ManifestEntry, EntryFailure>> {
        if !verify {
            if let Some(digest) = reusable_digest(scanned, prior) {
                if stored_this_run.contains(&digest) || self.store.has(&digest) {
                    trace!("Reusing digest {} for {:?}", digest.short(), scanned.path);
                    counters.files_reused.fetch_add(1, Ordering::Relaxed);
                    return Ok(Ok(file_entry(scanned, digest, scanned.size)));
                }
            }
        }

        if verify {
            // Re-verified content is usually stored already; hash before copying anything
            let (digest, size) = match digest_file(&scanned.absolute) {
                Ok(v) => v,
                Err(e) => return per_entry(scanned, e),
            };
            if stored_this_run.contains(&digest) || self.store.has(&digest) {
                counters.files_hashed.fetch_add(1, Ordering::Relaxed);
                counters.bytes_processed.fetch_add(size, Ordering::Relaxed);
                stored_this_run.insert(digest);
                return Ok(Ok(file_entry(scanned, digest, size)));
            }
        }

        let inserted = match self.store.insert_file(&scanned.absolute) {
            Ok(inserted) => inserted,
            Err(e @ MirrorError::Io(_)) => return per_entry(scanned, e),
            Err(e) => return Err(e),
        };
        counters.files_hashed.fetch_add(1, Ordering::Relaxed);
        counters.bytes_processed.fetch_add(inserted.size, Ordering::Relaxed);
        if let PutOutcome::Stored { bytes } = inserted.outcome {
            counters.objects_written.fetch_add(1, Ordering::Relaxed);
            counters.bytes_stored.fetch_add(bytes, Ordering::Relaxed);
        }
        stored_this_run.insert(inserted.digest);

        Ok(Ok(file_entry(scanned, inserted.digest, inserted.size)))
    }
}

/// Digest from the previous manifest, when size and mtime still match
fn reusable_digest(scanned: &ScannedEntry, prior: Option<&ManifestEntry>) -> Option<Digest> {
    let prior = prior?;
    match &prior.kind {
        EntryKind::File { digest } if prior.size == scanned.size && prior.modified == scanned.modified => {
            Some(*digest)
        }
        _ => None,
    }
}

fn per_entry(
    scanned: &ScannedEntry,
    err: MirrorError,
) -> Result<std::result::Result<ManifestEntry, EntryFailure>> {
    warn!("Skipping {:?}: {}", scanned.path, err);
    Ok(Err(EntryFailure::new(&scanned.path, &err)))
}

fn file_entry(scanned: &ScannedEntry, digest: Digest, size: u64) -> ManifestEntry {
    ManifestEntry {
        path: scanned.path.clone(),
        kind: EntryKind::File { digest },
        size,
        modified: scanned.modified,
        permissions: scanned.permissions,
    }
}

fn metadata_entry(scanned: &ScannedEntry, kind: EntryKind) -> ManifestEntry {
    ManifestEntry {
        path: scanned.path.clone(),
        kind,
        size: 0,
        modified: scanned.modified,
        permissions: scanned.permissions,
    }
}
