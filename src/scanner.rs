//! Source tree traversal
//!
//! [`TreeScanner`] walks a source directory and classifies every path it
//! finds as a regular file, a symlink or a directory at traversal time.
//! Contents are not read here; the snapshot builder decides what to hash.
//!
//! ## Filtering
//!
//! - **Exclude patterns** use gitignore syntax and are applied as walker
//!   overrides, so an excluded directory is never descended into.
//! - **Include globs** (globset) restrict which files and symlinks are kept.
//!   Directories survive only if something beneath them was kept.
//! - **`.gitignore` files** in the source are honored only when asked for.
//! - **Excluded directories** (for instance a mirror root living inside the
//!   source) are pruned by path.
//!
//! ## Example
//!
//! ```rust,ignore
//! use crate::scanner::TreeScanner;
//!
//! let result = TreeScanner::new("./project")
//!     .with_exclude_patterns(vec!["target/".to_string(), "*.tmp".to_string()])
//!     .with_max_file_size(100 * 1024 * 1024)
//!     .scan(None)?;
//! println!("{} entries, {} unreadable", result.entries.len(), result.failures.len());
//! ```

use crate::cancel::CancellationToken;
use crate::error::{MirrorError, Result};
use crate::types::{EntryFailure, FailureKind};
use crate::utils;
use chrono::{DateTime, Utc};
use globset::{Glob, GlobSet, GlobSetBuilder};
use ignore::{overrides::OverrideBuilder, WalkBuilder, WalkState};
use parking_lot::Mutex;
use rayon::prelude::*;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, trace, warn};

/// What a scanned path is
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScannedKind {
    RegularFile,
    Symlink { target: PathBuf },
    Directory,
}

/// One path found under the source root
#[derive(Debug, Clone)]
pub struct ScannedEntry {
    /// Path relative to the source root
    pub path: PathBuf,
    /// Path on disk
    pub absolute: PathBuf,
    pub kind: ScannedKind,
    /// File size, 0 for symlinks and directories
    pub size: u64,
    pub modified: DateTime<Utc>,
    pub permissions: u32,
}

/// Entries found plus paths that could not be inspected
#[derive(Debug, Default)]
pub struct ScanResult {
    /// Sorted by path
    pub entries: Vec<ScannedEntry>,
    pub failures: Vec<EntryFailure>,
}

/// Walks a source tree
#[derive(Debug, Clone)]
pub struct TreeScanner {
    root: PathBuf,
    exclude_patterns: Vec<String>,
    include_patterns: Vec<String>,
    respect_gitignore: bool,
    max_file_size: u64,
    follow_symlinks: bool,
    parallel_workers: usize,
    excluded_dirs: Vec<PathBuf>,
}

impl TreeScanner {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            exclude_patterns: Vec::new(),
            include_patterns: Vec::new(),
            respect_gitignore: false,
            max_file_size: 0,
            follow_symlinks: false,
            parallel_workers: num_cpus::get(),
            excluded_dirs: Vec::new(),
        }
    }

    /// Gitignore-style patterns to leave out
    pub fn with_exclude_patterns(mut self, patterns: Vec<String>) -> Self {
        self.exclude_patterns = patterns;
        self
    }

    /// Only keep files matching one of these globs
    pub fn with_include_patterns(mut self, patterns: Vec<String>) -> Self {
        self.include_patterns = patterns;
        self
    }

    pub fn with_gitignore(mut self, respect: bool) -> Self {
        self.respect_gitignore = respect;
        self
    }

    /// Skip files larger than `size` bytes (0 = unlimited)
    pub fn with_max_file_size(mut self, size: u64) -> Self {
        self.max_file_size = size;
        self
    }

    pub fn with_follow_symlinks(mut self, follow: bool) -> Self {
        self.follow_symlinks = follow;
        self
    }

    pub fn with_parallel_workers(mut self, workers: usize) -> Self {
        self.parallel_workers = workers.max(1);
        self
    }

    /// Never descend into `dir`, if it lies inside the root
    pub fn with_excluded_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.excluded_dirs.push(dir.into());
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Walk the tree. Cancellation is checked while walking and per entry.
    pub fn scan(&self, cancel: Option<&CancellationToken>) -> Result<ScanResult> {
        let start = Instant::now();
        if !self.root.is_dir() {
            return Err(MirrorError::InvalidConfiguration(format!(
                "source {:?} is not a directory",
                self.root
            )));
        }

        let include = build_include_set(&self.include_patterns)?;
        let pruned = Arc::new(self.pruned_dirs());

        let mut walker_builder = WalkBuilder::new(&self.root);
        walker_builder
            .follow_links(self.follow_symlinks)
            .hidden(false)
            .parents(self.respect_gitignore)
            .ignore(self.respect_gitignore)
            .git_ignore(self.respect_gitignore)
            .git_global(false)
            .git_exclude(false)
            .require_git(false)
            .threads(self.parallel_workers);

        // In override globs a leading `!` excludes
        let mut override_builder = OverrideBuilder::new(&self.root);
        for pattern in &self.exclude_patterns {
            let final_pattern = match pattern.strip_prefix('!') {
                Some(keep) => keep.to_string(),
                None => format!("!{}", pattern),
            };
            override_builder
                .add(&final_pattern)
                .map_err(|e| MirrorError::InvalidPattern(format!("{}: {}", pattern, e)))?;
        }
        let overrides = override_builder
            .build()
            .map_err(|e| MirrorError::InvalidPattern(e.to_string()))?;
        walker_builder.overrides(overrides);

        {
            let pruned = Arc::clone(&pruned);
            walker_builder.filter_entry(move |entry| !pruned.iter().any(|p| entry.path() == p));
        }

        let paths = Arc::new(Mutex::new(Vec::<PathBuf>::new()));
        let walk_failures = Arc::new(Mutex::new(Vec::<EntryFailure>::new()));

        walker_builder.build_parallel().run(|| {
            let paths = Arc::clone(&paths);
            let walk_failures = Arc::clone(&walk_failures);
            let root = self.root.clone();
            let cancel = cancel.cloned();

            Box::new(move |entry_result| {
                if cancel.as_ref().is_some_and(|c| c.is_cancelled()) {
                    return WalkState::Quit;
                }
                match entry_result {
                    Ok(entry) => {
                        if entry.depth() > 0 {
                            paths.lock().push(entry.into_path());
                        }
                    }
                    Err(e) => {
                        let path = error_path(&e)
                            .and_then(|p| utils::make_relative(&p, &root).ok())
                            .map(|p| lossy(&p))
                            .unwrap_or_default();
                        warn!("Walk error at {:?}: {}", path, e);
                        walk_failures.lock().push(EntryFailure {
                            path,
                            kind: FailureKind::Io,
                            message: e.to_string(),
                        });
                    }
                }
                WalkState::Continue
            })
        });

        crate::cancel::check(cancel)?;

        let paths = std::mem::take(&mut *paths.lock());
        let outcomes: Vec<Result<ProcessOutcome>> = paths
            .par_iter()
            .map(|path| {
                crate::cancel::check(cancel)?;
                Ok(self.process_path(path))
            })
            .collect();

        let mut result = ScanResult {
            entries: Vec::with_capacity(outcomes.len()),
            failures: std::mem::take(&mut *walk_failures.lock()),
        };
        for (outcome, path) in outcomes.into_iter().zip(paths.iter()) {
            match outcome? {
                Ok(Some(entry)) => result.entries.push(entry),
                Ok(None) => trace!("Skipped {:?}", path),
                Err(failure) => result.failures.push(failure),
            }
        }

        if let Some(include) = include {
            retain_included(&mut result.entries, &include);
        }

        result.entries.sort_by(|a, b| a.path.cmp(&b.path));
        result.failures.sort_by(|a, b| a.path.cmp(&b.path));

        debug!(
            "Scanned {} entries ({} failures) under {:?} in {:?}",
            result.entries.len(),
            result.failures.len(),
            self.root,
            start.elapsed()
        );
        Ok(result)
    }

    /// Inspect one path. `Ok(None)` means deliberately skipped.
    fn process_path(&self, path: &Path) -> ProcessOutcome {
        let failed = |e: MirrorError| EntryFailure {
            path: lossy(&utils::make_relative(path, &self.root).unwrap_or_else(|_| path.to_path_buf())),
            kind: FailureKind::from(&e),
            message: e.to_string(),
        };

        let relative = utils::make_relative(path, &self.root).map_err(failed)?;
        // Manifests store paths as UTF-8 strings
        if relative.to_str().is_none() {
            warn!("Skipping {:?}: name is not valid UTF-8", relative);
            return Err(failed(MirrorError::UnsupportedPath(format!(
                "{} is not valid UTF-8",
                relative.to_string_lossy()
            ))));
        }
        let link_meta = utils::get_file_metadata(path).map_err(failed)?;

        let metadata = if link_meta.is_symlink && self.follow_symlinks {
            // Dangling links are kept as links
            utils::get_followed_metadata(path).unwrap_or(link_meta)
        } else {
            link_meta
        };

        let kind = if metadata.is_symlink {
            let target = utils::read_symlink(path).map_err(failed)?;
            if target.to_str().is_none() {
                return Err(failed(MirrorError::UnsupportedPath(format!(
                    "link target {} is not valid UTF-8",
                    target.to_string_lossy()
                ))));
            }
            ScannedKind::Symlink { target }
        } else if metadata.is_dir {
            ScannedKind::Directory
        } else {
            ScannedKind::RegularFile
        };

        if kind == ScannedKind::RegularFile && self.max_file_size > 0 && metadata.size > self.max_file_size {
            trace!("Skipping large file {:?} ({} bytes)", path, metadata.size);
            return Ok(None);
        }

        let size = if kind == ScannedKind::RegularFile { metadata.size } else { 0 };
        Ok(Some(ScannedEntry {
            path: relative,
            absolute: path.to_path_buf(),
            kind,
            size,
            modified: metadata.modified_utc(),
            permissions: metadata.permissions,
        }))
    }

    /// Excluded directories expressed under the walk root
    fn pruned_dirs(&self) -> Vec<PathBuf> {
        let Ok(root_canon) = self.root.canonicalize() else {
            return Vec::new();
        };
        self.excluded_dirs
            .iter()
            .filter_map(|dir| dir.canonicalize().ok())
            .filter_map(|dir| dir.strip_prefix(&root_canon).ok().map(|rel| self.root.join(rel)))
            .filter(|dir| dir != &self.root)
            .collect()
    }
}

/// Display form of a path that may not be UTF-8, safe to put in a report
fn lossy(path: &Path) -> PathBuf {
    PathBuf::from(path.to_string_lossy().into_owned())
}

type ProcessOutcome = std::result::Result<Option<ScannedEntry>, EntryFailure>;

fn build_include_set(patterns: &[String]) -> Result<Option<GlobSet>> {
    if patterns.is_empty() {
        return Ok(None);
    }
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(Some(builder.build()?))
}

/// Keep included files and symlinks, plus the directories leading to them
fn retain_included(entries: &mut Vec<ScannedEntry>, include: &GlobSet) {
    let mut needed_dirs = BTreeSet::new();
    for entry in entries.iter() {
        if entry.kind != ScannedKind::Directory && include.is_match(&entry.path) {
            let mut parent = entry.path.parent();
            while let Some(p) = parent {
                if p.as_os_str().is_empty() {
                    break;
                }
                needed_dirs.insert(p.to_path_buf());
                parent = p.parent();
            }
        }
    }
    entries.retain(|e| match e.kind {
        ScannedKind::Directory => needed_dirs.contains(&e.path),
        _ => include.is_match(&e.path),
    });
}

fn error_path(err: &ignore::Error) -> Option<PathBuf> {
    match err {
        ignore::Error::WithPath { path, .. } => Some(path.clone()),
        ignore::Error::WithDepth { err, .. } | ignore::Error::WithLineNumber { err, .. } => error_path(err),
        ignore::Error::Loop { child, .. } => Some(child.clone()),
        ignore::Error::Partial(errs) => errs.iter().find_map(error_path),
        _ => None,
    }
}
