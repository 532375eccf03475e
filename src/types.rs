//! Shared data types: options, reports and persisted configuration
//!
//! Every top-level operation (snapshot, restore, sync, verify) takes an
//! options struct and returns a report. Reports carry an
//! [`OperationStatus`] plus the per-entry failures that did not stop the
//! run, so callers can surface partial success instead of a bare error.
//!
//! ## Examples
//!
//! ```rust
//! use mirrorvault::types::{OperationStatus, RestoreOptions};
//! use mirrorvault::restore::PathFilter;
//!
//! let options = RestoreOptions {
//!     filter: Some(PathFilter::Prefix("docs".into())),
//!     overwrite: true,
//!     ..Default::default()
//! };
//! assert!(!options.dry_run);
//! assert_eq!(OperationStatus::from_failures(0).exit_code(), 0);
//! ```

use crate::cancel::CancellationToken;
use crate::digest::Digest;
use crate::error::MirrorError;
use crate::manifest::ManifestFormat;
use crate::restore::{PathFilter, PathSubstitution};
use crate::retry::RetryPolicy;
use crate::storage::PutPolicy;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

/// Overall outcome of an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationStatus {
    /// Everything requested was done
    Success,
    /// Done, but some entries failed and are listed in the report
    Partial,
    /// Aborted; nothing was committed
    Fatal,
}

impl OperationStatus {
    /// `Success` when there are no failures, `Partial` otherwise
    pub fn from_failures(failures: usize) -> Self {
        if failures == 0 {
            OperationStatus::Success
        } else {
            OperationStatus::Partial
        }
    }

    /// Process exit code used by the CLI
    pub fn exit_code(self) -> i32 {
        match self {
            OperationStatus::Success => 0,
            OperationStatus::Partial => 2,
            OperationStatus::Fatal => 1,
        }
    }
}

/// Category of a per-entry failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    Io,
    ObjectNotFound,
    ContentCollision,
    DestinationConflict,
    RemoteTransfer,
    UnsupportedPath,
    /// A manifest that could not be parsed
    ManifestCorrupt,
    Other,
}

impl From<&MirrorError> for FailureKind {
    fn from(err: &MirrorError) -> Self {
        match err {
            MirrorError::Io(_) | MirrorError::WalkDir(_) => FailureKind::Io,
            MirrorError::ObjectNotFound(_) => FailureKind::ObjectNotFound,
            MirrorError::ContentCollision { .. } => FailureKind::ContentCollision,
            MirrorError::DestinationConflict { .. } => FailureKind::DestinationConflict,
            MirrorError::RemoteTransfer(_) => FailureKind::RemoteTransfer,
            MirrorError::UnsupportedPath(_) => FailureKind::UnsupportedPath,
            MirrorError::ManifestCorrupt(_) | MirrorError::Json(_) | MirrorError::Bincode(_) => {
                FailureKind::ManifestCorrupt
            }
            _ => FailureKind::Other,
        }
    }
}

/// One entry that could not be processed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryFailure {
    /// Logical path (or remote object path for sync)
    pub path: PathBuf,
    pub kind: FailureKind,
    pub message: String,
}

impl EntryFailure {
    pub fn new(path: impl Into<PathBuf>, err: &MirrorError) -> Self {
        Self {
            path: path.into(),
            kind: FailureKind::from(err),
            message: err.to_string(),
        }
    }
}

/// Counts of what changed between two manifests
///
/// # Examples
///
/// ```rust
/// # use mirrorvault::types::ChangeStats;
/// let stats = ChangeStats {
///     entries_added: 3,
///     entries_modified: 1,
///     entries_removed: 2,
///     bytes_added: 3000,
///     bytes_modified: 500,
///     bytes_removed: 1000,
/// };
/// assert_eq!(stats.total_operations(), 6);
/// assert_eq!(stats.net_size_change(), 2500);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeStats {
    pub entries_added: usize,
    pub entries_modified: usize,
    pub entries_removed: usize,
    /// Total size of added entries
    pub bytes_added: u64,
    /// Total size of modified entries (new size)
    pub bytes_modified: u64,
    /// Total size of removed entries
    pub bytes_removed: u64,
}

impl ChangeStats {
    pub fn has_changes(&self) -> bool {
        self.total_operations() > 0
    }

    pub fn total_operations(&self) -> usize {
        self.entries_added + self.entries_modified + self.entries_removed
    }

    /// Growth in bytes; negative when the tree shrank
    pub fn net_size_change(&self) -> i64 {
        (self.bytes_added + self.bytes_modified) as i64 - self.bytes_removed as i64
    }
}

/// Progress callback for long-running operations
pub type ProgressCallback = Arc<dyn Fn(ProgressInfo) + Send + Sync>;

/// Information passed to progress callbacks
#[derive(Debug, Clone)]
pub struct ProgressInfo {
    /// Operation being performed
    pub operation: String,
    /// Current item being processed
    pub current_item: Option<String>,
    /// Items processed so far
    pub processed: usize,
    /// Total items to process (if known)
    pub total: Option<usize>,
    /// Bytes processed so far
    pub bytes_processed: u64,
}

impl ProgressInfo {
    /// Get progress as a percentage (0-100)
    pub fn percentage(&self) -> Option<f32> {
        match self.total {
            Some(total) if total > 0 => Some((self.processed as f32 / total as f32) * 100.0),
            _ => None,
        }
    }
}

/// Options for a snapshot run
#[derive(Clone, Default)]
pub struct SnapshotOptions {
    /// Re-hash every file instead of trusting size and mtime
    pub verify: bool,
    pub cancel: Option<CancellationToken>,
    pub progress: Option<ProgressCallback>,
}

impl std::fmt::Debug for SnapshotOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotOptions")
            .field("verify", &self.verify)
            .field("cancel", &self.cancel.is_some())
            .field("progress", &self.progress.is_some())
            .finish()
    }
}

/// Options for restore operations
#[derive(Clone, Default)]
pub struct RestoreOptions {
    /// Restrict the restore to a subset of entries
    pub filter: Option<PathFilter>,
    /// Replace destination files that differ
    pub overwrite: bool,
    /// Report what would be written without touching the destination
    pub dry_run: bool,
    /// Directory rewrites applied to entry paths, first match wins
    pub substitutions: Vec<PathSubstitution>,
    /// Do not compare the bytes to write against free space at the destination
    pub skip_space_check: bool,
    pub cancel: Option<CancellationToken>,
    pub progress: Option<ProgressCallback>,
}

impl std::fmt::Debug for RestoreOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestoreOptions")
            .field("filter", &self.filter)
            .field("overwrite", &self.overwrite)
            .field("dry_run", &self.dry_run)
            .field("substitutions", &self.substitutions)
            .field("skip_space_check", &self.skip_space_check)
            .field("cancel", &self.cancel.is_some())
            .field("progress", &self.progress.is_some())
            .finish()
    }
}

/// Options for an offsite sync or pull
#[derive(Clone)]
pub struct SyncOptions {
    pub retry: RetryPolicy,
    /// Objects transferred at once
    pub concurrency: usize,
    /// Transfer even when the receiving side reports too little free space
    pub skip_space_check: bool,
    pub cancel: Option<CancellationToken>,
    pub progress: Option<ProgressCallback>,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            concurrency: 4,
            skip_space_check: false,
            cancel: None,
            progress: None,
        }
    }
}

impl std::fmt::Debug for SyncOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncOptions")
            .field("retry", &self.retry)
            .field("concurrency", &self.concurrency)
            .field("skip_space_check", &self.skip_space_check)
            .field("cancel", &self.cancel.is_some())
            .field("progress", &self.progress.is_some())
            .finish()
    }
}

/// Result of a snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotReport {
    pub manifest_id: String,
    pub status: OperationStatus,
    /// Entries recorded in the manifest
    pub entries: usize,
    /// Files streamed through the digest engine
    pub files_hashed: usize,
    /// Files whose digest was taken from the previous manifest
    pub files_reused: usize,
    /// New objects added to the store by this run
    pub objects_written: usize,
    pub bytes_stored: u64,
    pub directories: usize,
    pub symlinks: usize,
    /// Changes against the predecessor manifest
    pub changes: ChangeStats,
    pub failures: Vec<EntryFailure>,
    pub duration_ms: u64,
}

/// Result of a restore
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RestoreReport {
    pub manifest_id: String,
    /// Entries selected by the filter
    pub entries_selected: usize,
    pub files_restored: usize,
    pub directories_created: usize,
    pub symlinks_created: usize,
    /// Destinations that already matched the manifest
    pub unchanged: usize,
    pub bytes_written: u64,
    pub dry_run: bool,
    /// Paths written, or in a dry run the paths that would be written
    pub planned: Vec<PathBuf>,
    pub failures: Vec<EntryFailure>,
    pub duration_ms: u64,
}

impl RestoreReport {
    pub fn status(&self) -> OperationStatus {
        OperationStatus::from_failures(self.failures.len())
    }
}

/// Result of an offsite sync or pull
///
/// For a pull the roles swap: "local" is still the vault on this machine
/// and transfers run from the remote into it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncReport {
    pub local_objects: usize,
    /// Objects present remotely before this run
    pub remote_objects: usize,
    pub objects_transferred: usize,
    pub bytes_transferred: u64,
    pub failures: Vec<EntryFailure>,
    pub manifests_transferred: Vec<String>,
    /// Manifests held back because some of their objects did not arrive
    pub manifests_blocked: Vec<String>,
    /// Retries spent across all transfers
    pub retries: u32,
    pub duration_ms: u64,
}

impl SyncReport {
    pub fn status(&self) -> OperationStatus {
        OperationStatus::from_failures(self.failures.len() + self.manifests_blocked.len())
    }
}

/// A manifest entry whose object is missing from a store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MissingObject {
    pub manifest_id: String,
    pub path: PathBuf,
    pub digest: Digest,
}

/// Result of checking manifests against a store, locally or remotely
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VerifyReport {
    pub manifests_checked: usize,
    pub objects_checked: usize,
    /// Referenced objects that do not exist
    pub missing_objects: Vec<MissingObject>,
    /// Objects whose bytes no longer hash to their name (deep mode only)
    pub corrupt_objects: Vec<Digest>,
    /// Manifests that could not be loaded
    pub corrupt_manifests: Vec<String>,
    pub deep: bool,
    pub duration_ms: u64,
}

impl VerifyReport {
    pub fn is_valid(&self) -> bool {
        self.missing_objects.is_empty()
            && self.corrupt_objects.is_empty()
            && self.corrupt_manifests.is_empty()
    }

    pub fn status(&self) -> OperationStatus {
        if self.is_valid() {
            OperationStatus::Success
        } else {
            OperationStatus::Partial
        }
    }
}

/// Mirror configuration, persisted in `mirror.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MirrorConfig {
    /// Skip files larger than this (0 = unlimited)
    pub max_file_size: u64,
    /// Worker threads for hashing and restore
    pub parallel_workers: usize,
    /// Gitignore-style exclude patterns
    pub exclude_patterns: Vec<String>,
    /// Only snapshot files matching one of these globs (empty = all)
    pub include_patterns: Vec<String>,
    /// Honor `.gitignore` files in the source tree
    pub respect_gitignore: bool,
    pub follow_symlinks: bool,
    pub manifest_format: ManifestFormat,
    pub put_policy: PutPolicy,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            max_file_size: 0,
            parallel_workers: num_cpus::get(),
            exclude_patterns: Vec::new(),
            include_patterns: Vec::new(),
            respect_gitignore: false,
            follow_symlinks: false,
            manifest_format: ManifestFormat::default(),
            put_policy: PutPolicy::default(),
        }
    }
}

/// Contents of `mirror.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MirrorMetadata {
    pub format_version: u32,
    /// Crate version that created the mirror
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub config: MirrorConfig,
}
