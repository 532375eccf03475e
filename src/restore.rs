//! Restore engine
//!
//! Materializes the entries of a manifest under a destination root. Runs in
//! three phases:
//!
//! 1. Directories, in sorted order so parents exist before children.
//! 2. Files and symlinks, in parallel. File content is streamed from the store
//!    into a temp file beside the target, hashed on the way, and only moved
//!    into place when the digest matches.
//! 3. Directory permissions and mtimes, deepest first, so writing children
//!    does not disturb them afterwards.
//!
//! Entry paths can be relocated with [`PathSubstitution`]s, and unless told
//! otherwise the run first checks that the destination filesystem can hold
//! the bytes it is about to write.
//!
//! Problems with a single entry (missing object, conflicting destination,
//! unwritable path) are collected in the [`RestoreReport`]; the run keeps
//! going. Only cancellation, a bad option and an unusable destination root
//! abort it.

use crate::cancel;
use crate::digest::{copy_chunked, digest_file, Digest, HashingWriter};
use crate::error::{MirrorError, Result};
use crate::manifest::{EntryKind, Manifest, ManifestEntry};
use crate::storage::ContentStore;
use crate::types::{EntryFailure, ProgressInfo, RestoreOptions, RestoreReport};
use crate::utils;
use globset::{Glob, GlobSetBuilder};
use rayon::prelude::*;
use std::fs;
use std::io::{self, BufWriter, Write};
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

/// Selects the part of a manifest to restore
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathFilter {
    /// An entry and everything beneath it
    Prefix(PathBuf),
    /// Entries whose logical path matches any of the glob patterns
    Glob(Vec<String>),
}

impl PathFilter {
    /// Entries of `manifest` that pass the filter, in manifest order
    pub fn select<'m>(&self, manifest: &'m Manifest) -> Result<Vec<&'m ManifestEntry>> {
        match self {
            PathFilter::Prefix(prefix) => Ok(manifest.entries_under(prefix).iter().collect()),
            PathFilter::Glob(patterns) => {
                let mut builder = GlobSetBuilder::new();
                for pattern in patterns {
                    builder.add(Glob::new(pattern)?);
                }
                let set = builder.build()?;
                Ok(manifest.entries.iter().filter(|e| set.is_match(&e.path)).collect())
            }
        }
    }
}

/// Restores everything under `from` beneath `to` instead.
///
/// Matching is by whole path components, so `docs` relocates `docs/a.txt`
/// but not `docs-old/a.txt`. `to` must be a relative path that stays inside
/// the destination root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathSubstitution {
    pub from: PathBuf,
    pub to: PathBuf,
}

impl PathSubstitution {
    pub fn new(from: impl Into<PathBuf>, to: impl Into<PathBuf>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
        }
    }

    /// `path` relocated, if it lies under `from`
    pub fn apply(&self, path: &Path) -> Option<PathBuf> {
        let rest = path.strip_prefix(&self.from).ok()?;
        Some(self.to.join(rest))
    }

    fn validate(&self) -> Result<()> {
        let mut normal = 0;
        for component in self.to.components() {
            match component {
                Component::Normal(_) => normal += 1,
                Component::CurDir => {}
                _ => {
                    return Err(MirrorError::InvalidConfiguration(format!(
                        "substitution target {:?} must be a relative path inside the destination",
                        self.to
                    )))
                }
            }
        }
        if normal == 0 {
            return Err(MirrorError::InvalidConfiguration(format!(
                "substitution target for {:?} is empty",
                self.from
            )));
        }
        Ok(())
    }
}

impl FromStr for PathSubstitution {
    type Err = MirrorError;

    /// Parses `FROM=TO`
    fn from_str(s: &str) -> Result<Self> {
        let (from, to) = s
            .split_once('=')
            .ok_or_else(|| MirrorError::InvalidConfiguration(format!("expected FROM=TO, got {:?}", s)))?;
        let substitution = Self::new(from, to);
        substitution.validate()?;
        Ok(substitution)
    }
}

/// Destination-relative path of `path` after the first matching substitution
pub fn relocate(path: &Path, substitutions: &[PathSubstitution]) -> PathBuf {
    substitutions
        .iter()
        .find_map(|s| s.apply(path))
        .unwrap_or_else(|| path.to_path_buf())
}

/// What was found at a destination path
enum Existing {
    Missing,
    /// Already matches the entry
    Same,
    /// Something else is there
    Differs { is_dir: bool },
}

/// What happened to one file or symlink entry
enum Applied {
    Written(u64),
    Linked,
    Unchanged,
}

/// Restore `manifest` (or the filtered part of it) under `dest`
#[instrument(skip(store, manifest, options), fields(manifest = %manifest.id))]
pub fn restore(
    store: &ContentStore,
    manifest: &Manifest,
    dest: &Path,
    options: &RestoreOptions,
) -> Result<RestoreReport> {
    let start = Instant::now();
    let cancel = options.cancel.as_ref();
    cancel::check(cancel)?;
    for substitution in &options.substitutions {
        substitution.validate()?;
    }
    let target_of = |entry: &ManifestEntry| dest.join(relocate(&entry.path, &options.substitutions));

    let selected = match &options.filter {
        Some(filter) => filter.select(manifest)?,
        None => manifest.entries.iter().collect(),
    };
    debug!("Selected {} of {} entries", selected.len(), manifest.entries.len());

    let mut report = RestoreReport {
        manifest_id: manifest.id.clone(),
        entries_selected: selected.len(),
        dry_run: options.dry_run,
        ..Default::default()
    };

    if options.dry_run {
        plan(store, &selected, dest, options, &mut report)?;
        report.planned.sort();
        report.duration_ms = start.elapsed().as_millis() as u64;
        return Ok(report);
    }

    if !options.skip_space_check {
        let required = bytes_to_write(&selected, &target_of);
        utils::check_space(dest, required, utils::available_space(dest))?;
    }

    fs::create_dir_all(dest)?;
    let total = selected.len();
    let processed = AtomicUsize::new(0);
    let report_progress = |entry: &ManifestEntry| {
        let done = processed.fetch_add(1, Ordering::Relaxed) + 1;
        if let Some(progress) = &options.progress {
            progress(ProgressInfo {
                operation: "Restoring".to_string(),
                current_item: Some(entry.path.to_string_lossy().into_owned()),
                processed: done,
                total: Some(total),
                bytes_processed: 0,
            });
        }
    };

    // Phase 1: directories
    let (dirs, others): (Vec<&ManifestEntry>, Vec<&ManifestEntry>) =
        selected.into_iter().partition(|e| e.kind.is_dir());
    let mut ready_dirs = Vec::with_capacity(dirs.len());
    for entry in &dirs {
        cancel::check(cancel)?;
        match restore_dir(entry, &target_of(entry), options.overwrite) {
            Ok(true) => {
                report.directories_created += 1;
                report.planned.push(relocate(&entry.path, &options.substitutions));
                ready_dirs.push(*entry);
            }
            Ok(false) => {
                report.unchanged += 1;
                ready_dirs.push(*entry);
            }
            Err(e) => record(&mut report, entry, e),
        }
        report_progress(entry);
    }

    // Phase 2: files and symlinks
    let outcomes: Vec<Result<(&ManifestEntry, Result<Applied>)>> = others
        .par_iter()
        .map(|entry| {
            cancel::check(cancel)?;
            let target = target_of(entry);
            let applied = match &entry.kind {
                EntryKind::File { digest } => restore_file(store, entry, digest, &target, options.overwrite),
                EntryKind::Symlink { target: link_target } => {
                    restore_symlink(entry, link_target, &target, options.overwrite)
                }
                EntryKind::Directory => Ok(Applied::Unchanged),
            };
            report_progress(entry);
            Ok((*entry, applied))
        })
        .collect();

    for outcome in outcomes {
        let (entry, applied) = outcome?;
        if matches!(applied, Ok(Applied::Written(_)) | Ok(Applied::Linked)) {
            report.planned.push(relocate(&entry.path, &options.substitutions));
        }
        match applied {
            Ok(Applied::Written(bytes)) => {
                report.files_restored += 1;
                report.bytes_written += bytes;
            }
            Ok(Applied::Linked) => report.symlinks_created += 1,
            Ok(Applied::Unchanged) => report.unchanged += 1,
            Err(e) => record(&mut report, entry, e),
        }
    }
    cancel::check(cancel)?;

    // Phase 3: directory metadata, deepest first
    for entry in ready_dirs.iter().rev() {
        let target = target_of(entry);
        let applied = utils::set_permissions(&target, entry.permissions)
            .and_then(|_| utils::set_mtime(&target, entry.modified, false));
        if let Err(e) = applied {
            record(&mut report, entry, e);
        }
    }

    report.planned.sort();
    report.failures.sort_by(|a, b| a.path.cmp(&b.path));
    report.duration_ms = start.elapsed().as_millis() as u64;
    info!(
        "Restored {} to {:?} in {:?} ({} files, {} written, {} failures)",
        manifest.id,
        dest,
        start.elapsed(),
        report.files_restored,
        utils::format_bytes(report.bytes_written),
        report.failures.len()
    );
    Ok(report)
}

/// Fill `report.planned` without touching the destination
fn plan(
    store: &ContentStore,
    selected: &[&ManifestEntry],
    dest: &Path,
    options: &RestoreOptions,
    report: &mut RestoreReport,
) -> Result<()> {
    for entry in selected {
        cancel::check(options.cancel.as_ref())?;
        let relocated = relocate(&entry.path, &options.substitutions);
        let target = dest.join(&relocated);
        let outcome = inspect(entry, &target).and_then(|existing| match existing {
            Existing::Same => Ok(false),
            Existing::Differs { .. } if !options.overwrite => Err(MirrorError::DestinationConflict {
                path: entry.path.clone(),
            }),
            _ => match entry.kind.digest() {
                Some(digest) if !store.has(digest) => Err(MirrorError::ObjectNotFound(*digest)),
                _ => Ok(true),
            },
        });
        match outcome {
            Ok(true) => report.planned.push(relocated),
            Ok(false) => report.unchanged += 1,
            Err(e) => record(report, entry, e),
        }
    }
    Ok(())
}

/// Bytes of file content the selection would write.
///
/// A destination that is already a file of the right size is assumed to
/// match; hashing it here would read the whole tree twice.
fn bytes_to_write(selected: &[&ManifestEntry], target_of: &dyn Fn(&ManifestEntry) -> PathBuf) -> u64 {
    let mut required = 0;
    for &entry in selected {
        if entry.kind.digest().is_none() {
            continue;
        }
        let in_place = fs::metadata(target_of(entry)).is_ok_and(|meta| meta.is_file() && meta.len() == entry.size);
        if !in_place {
            required += entry.size;
        }
    }
    required
}

fn record(report: &mut RestoreReport, entry: &ManifestEntry, err: MirrorError) {
    warn!("Could not restore {:?}: {}", entry.path, err);
    report.failures.push(EntryFailure::new(&entry.path, &err));
}

fn inspect(entry: &ManifestEntry, target: &Path) -> Result<Existing> {
    let meta = match fs::symlink_metadata(target) {
        Ok(m) => m,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Existing::Missing),
        Err(e) => return Err(e.into()),
    };
    let file_type = meta.file_type();

    let same = match &entry.kind {
        EntryKind::Directory => file_type.is_dir(),
        EntryKind::Symlink { target: link_target } => {
            file_type.is_symlink() && fs::read_link(target)? == *link_target
        }
        EntryKind::File { digest } => {
            file_type.is_file() && meta.len() == entry.size && digest_file(target)?.0 == *digest
        }
    };

    Ok(if same {
        Existing::Same
    } else {
        Existing::Differs {
            is_dir: file_type.is_dir(),
        }
    })
}

/// Clear the way for an entry, or refuse with a conflict
fn make_room(entry: &ManifestEntry, target: &Path, is_dir: bool, overwrite: bool) -> Result<()> {
    if !overwrite {
        return Err(MirrorError::DestinationConflict {
            path: entry.path.clone(),
        });
    }
    debug!("Replacing {:?}", target);
    if is_dir {
        fs::remove_dir_all(target)?;
    } else {
        fs::remove_file(target)?;
    }
    Ok(())
}

/// Returns whether the directory had to be created
fn restore_dir(entry: &ManifestEntry, target: &Path, overwrite: bool) -> Result<bool> {
    match inspect(entry, target)? {
        Existing::Same => return Ok(false),
        Existing::Differs { is_dir } => make_room(entry, target, is_dir, overwrite)?,
        Existing::Missing => {}
    }
    fs::create_dir_all(target)?;
    Ok(true)
}

fn restore_file(
    store: &ContentStore,
    entry: &ManifestEntry,
    digest: &Digest,
    target: &Path,
    overwrite: bool,
) -> Result<Applied> {
    match inspect(entry, target)? {
        Existing::Same => return Ok(Applied::Unchanged),
        // A file or link in the way is replaced by the rename below
        Existing::Differs { is_dir: false } if overwrite => {}
        Existing::Differs { is_dir } => make_room(entry, target, is_dir, overwrite)?,
        Existing::Missing => {}
    }

    let source = store.get(digest)?;
    let parent = target
        .parent()
        .ok_or_else(|| MirrorError::internal(format!("{:?} has no parent directory", target)))?;
    fs::create_dir_all(parent)?;

    let temp = tempfile::Builder::new().prefix(".tmp").tempfile_in(parent)?;
    let mut writer = HashingWriter::new(BufWriter::new(temp));
    copy_chunked(source, &mut writer)?;
    writer.flush()?;
    let (buffered, actual, bytes) = writer.finish();
    let temp = buffered.into_inner().map_err(|e| MirrorError::Io(e.into_error()))?;

    if actual != *digest {
        // Dropping `temp` removes it
        return Err(MirrorError::ContentCollision {
            expected: *digest,
            actual,
        });
    }

    temp.as_file().sync_all()?;
    utils::set_permissions(temp.path(), entry.permissions)?;
    temp.persist(target).map_err(|e| MirrorError::Io(e.error))?;
    utils::set_mtime(target, entry.modified, false)?;
    Ok(Applied::Written(bytes))
}

fn restore_symlink(entry: &ManifestEntry, link_target: &Path, target: &Path, overwrite: bool) -> Result<Applied> {
    match inspect(entry, target)? {
        Existing::Same => return Ok(Applied::Unchanged),
        Existing::Differs { is_dir } => make_room(entry, target, is_dir, overwrite)?,
        Existing::Missing => {}
    }
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    utils::create_symlink(link_target, target)?;
    utils::set_mtime(target, entry.modified, true)?;
    Ok(Applied::Linked)
}
