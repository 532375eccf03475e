//! Mirror facade
//!
//! A mirror is a directory holding a content store, a manifest history and
//! its configuration:
//!
//! ```text
//! <mirror>/
//!   mirror.json     MirrorMetadata (format version, config)
//!   objects/        content store
//!   manifests/      committed manifests
//! ```
//!
//! [`Mirror`] ties the engines together so callers (the CLI, tests, other
//! programs) deal with one handle instead of wiring stores by hand.
//!
//! ## Examples
//!
//! ```rust,no_run
//! use mirrorvault::{Mirror, MirrorBuilder, RestoreOptions, SnapshotOptions};
//! use std::path::Path;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mirror = MirrorBuilder::new()
//!     .exclude_patterns(vec!["target/".to_string()])
//!     .init("/backups/project")?;
//!
//! let report = mirror.snapshot(Path::new("/home/user/project"), &SnapshotOptions::default())?;
//! println!("snapshot {} ({} entries)", report.manifest_id, report.entries);
//!
//! let mirror = Mirror::open("/backups/project")?;
//! mirror.restore("latest", Path::new("/tmp/restored"), &RestoreOptions::default())?;
//! # Ok(())
//! # }
//! ```

use crate::error::{MirrorError, Result};
use crate::manifest::{diff, Manifest, ManifestDiff, ManifestFormat, ManifestStore};
use crate::remote::{RemoteTransport, MANIFESTS_DIR, OBJECTS_DIR};
use crate::pull;
use crate::restore;
use crate::scanner::TreeScanner;
use crate::snapshot::SnapshotBuilder;
use crate::storage::{ContentStore, PutPolicy, StoreStats};
use crate::sync;
use crate::types::{
    MirrorConfig, MirrorMetadata, MissingObject, RestoreOptions, RestoreReport, SnapshotOptions, SnapshotReport,
    SyncOptions, SyncReport, VerifyReport,
};
use crate::utils;
use chrono::Utc;
use rayon::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

/// Name of the metadata file at the mirror root
pub const METADATA_FILE: &str = "mirror.json";

/// On-disk layout version written by this crate
pub const FORMAT_VERSION: u32 = 1;

/// Handle on an initialized mirror
#[derive(Debug, Clone)]
pub struct Mirror {
    root: PathBuf,
    store: ContentStore,
    manifests: ManifestStore,
    config: MirrorConfig,
}

impl Mirror {
    /// Initialize a mirror at `root` with the default configuration
    pub fn init(root: impl Into<PathBuf>) -> Result<Self> {
        MirrorBuilder::new().init(root)
    }

    /// Open an existing mirror
    #[instrument(skip_all, fields(root = ?root.as_ref()))]
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let metadata_path = root.join(METADATA_FILE);
        let bytes = match fs::read(&metadata_path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(MirrorError::MirrorNotInitialized(root));
            }
            Err(e) => return Err(e.into()),
        };
        let metadata: MirrorMetadata = serde_json::from_slice(&bytes)?;
        if metadata.format_version > FORMAT_VERSION {
            return Err(MirrorError::InvalidConfiguration(format!(
                "mirror format {} is newer than supported format {}",
                metadata.format_version, FORMAT_VERSION
            )));
        }

        debug!("Opened mirror at {:?} (created {})", root, metadata.created_at);
        Self::assemble(root, metadata.config)
    }

    fn assemble(root: PathBuf, config: MirrorConfig) -> Result<Self> {
        let store = ContentStore::open(root.join(OBJECTS_DIR))?.with_policy(config.put_policy);
        let manifests = ManifestStore::open(root.join(MANIFESTS_DIR), config.manifest_format)?;
        Ok(Self {
            root,
            store,
            manifests,
            config,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &MirrorConfig {
        &self.config
    }

    /// Adjust the configuration for this handle only; `mirror.json` is untouched
    pub fn config_mut(&mut self) -> &mut MirrorConfig {
        &mut self.config
    }

    pub fn store(&self) -> &ContentStore {
        &self.store
    }

    pub fn manifests(&self) -> &ManifestStore {
        &self.manifests
    }

    /// Snapshot `source` into the mirror
    #[instrument(skip(self, options))]
    pub fn snapshot(&self, source: &Path, options: &SnapshotOptions) -> Result<SnapshotReport> {
        let scanner = TreeScanner::new(source)
            .with_exclude_patterns(self.config.exclude_patterns.clone())
            .with_include_patterns(self.config.include_patterns.clone())
            .with_gitignore(self.config.respect_gitignore)
            .with_max_file_size(self.config.max_file_size)
            .with_follow_symlinks(self.config.follow_symlinks)
            .with_parallel_workers(self.config.parallel_workers)
            .with_excluded_dir(&self.root);

        let (_, report) = SnapshotBuilder::new(&self.store, &self.manifests, scanner)
            .with_parallel_workers(self.config.parallel_workers)
            .build(options)?;
        Ok(report)
    }

    /// Restore the manifest named by `selector` (`latest`, an id, or a unique prefix)
    #[instrument(skip(self, options))]
    pub fn restore(&self, selector: &str, dest: &Path, options: &RestoreOptions) -> Result<RestoreReport> {
        let manifest = self.load_manifest(selector)?;
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.parallel_workers.max(1))
            .build()
            .map_err(|e| MirrorError::internal(format!("failed to build worker pool: {}", e)))?;
        pool.install(|| restore::restore(&self.store, &manifest, dest, options))
    }

    /// Push missing objects and manifests through `transport`
    #[instrument(skip_all)]
    pub fn sync(&self, transport: &dyn RemoteTransport, options: &SyncOptions) -> Result<SyncReport> {
        sync::sync(&self.store, &self.manifests, transport, options)
    }

    /// Bring remote snapshots (all, or the one `selector` names) and their
    /// objects back into this mirror
    #[instrument(skip(self, transport, options))]
    pub fn pull(
        &self,
        transport: &dyn RemoteTransport,
        selector: Option<&str>,
        options: &SyncOptions,
    ) -> Result<SyncReport> {
        pull::pull(&self.store, &self.manifests, transport, selector, options)
    }

    /// Compare two manifests
    pub fn diff(&self, from: &str, to: &str) -> Result<ManifestDiff> {
        let older = self.load_manifest(from)?;
        let newer = self.load_manifest(to)?;
        Ok(diff(&older, &newer))
    }

    /// Committed manifest ids, oldest first
    pub fn list_manifests(&self) -> Result<Vec<String>> {
        self.manifests.list()
    }

    pub fn load_manifest(&self, selector: &str) -> Result<Manifest> {
        let id = self.manifests.resolve(selector)?;
        self.manifests.load(&id)
    }

    pub fn latest(&self) -> Result<Option<Manifest>> {
        self.manifests.latest()
    }

    /// Check every manifest against the store.
    ///
    /// With `deep`, every object is re-hashed as well.
    #[instrument(skip(self))]
    pub fn verify(&self, deep: bool) -> Result<VerifyReport> {
        let start = Instant::now();
        let mut report = VerifyReport {
            deep,
            ..Default::default()
        };

        for id in self.manifests.list()? {
            report.manifests_checked += 1;
            let manifest = match self.manifests.load(&id) {
                Ok(m) => m,
                Err(e) if e.is_corruption() => {
                    warn!("Manifest {} is corrupt: {}", id, e);
                    report.corrupt_manifests.push(id);
                    continue;
                }
                Err(e) => return Err(e),
            };
            for entry in &manifest.entries {
                if let Some(digest) = entry.kind.digest() {
                    if !self.store.has(digest) {
                        report.missing_objects.push(MissingObject {
                            manifest_id: manifest.id.clone(),
                            path: entry.path.clone(),
                            digest: *digest,
                        });
                    }
                }
            }
        }

        let mut digests = self.store.list().collect::<Result<Vec<_>>>()?;
        digests.sort();
        report.objects_checked = digests.len();
        if deep {
            let checked: Vec<Result<Option<crate::digest::Digest>>> = digests
                .par_iter()
                .map(|digest| Ok((!self.store.verify_object(digest)?).then_some(*digest)))
                .collect();
            for result in checked {
                if let Some(corrupt) = result? {
                    report.corrupt_objects.push(corrupt);
                }
            }
        }

        report.duration_ms = start.elapsed().as_millis() as u64;
        info!(
            "Verified {} manifests and {} objects in {:?} ({} missing, {} corrupt)",
            report.manifests_checked,
            report.objects_checked,
            start.elapsed(),
            report.missing_objects.len(),
            report.corrupt_objects.len() + report.corrupt_manifests.len()
        );
        Ok(report)
    }

    pub fn stats(&self) -> Result<StoreStats> {
        self.store.stats()
    }

    /// Remove temp files left behind by interrupted writes
    #[instrument(skip(self))]
    pub fn cleanup(&self) -> Result<usize> {
        let removed = self.store.purge_temporaries()?;
        info!("Removed {} stale temporary files", removed);
        Ok(removed)
    }
}

/// Builder for a new mirror's configuration
///
/// # Examples
///
/// ```rust,no_run
/// use mirrorvault::{MirrorBuilder, ManifestFormat};
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let mirror = MirrorBuilder::new()
///     .manifest_format(ManifestFormat::Binary)
///     .max_file_size(512 * 1024 * 1024)
///     .parallel_workers(4)
///     .init("/backups/photos")?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct MirrorBuilder {
    config: MirrorConfig,
}

impl MirrorBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Gitignore-style patterns to leave out of snapshots
    pub fn exclude_patterns(mut self, patterns: Vec<String>) -> Self {
        self.config.exclude_patterns = patterns;
        self
    }

    /// Only snapshot files matching one of these globs
    pub fn include_patterns(mut self, patterns: Vec<String>) -> Self {
        self.config.include_patterns = patterns;
        self
    }

    /// Skip files larger than `size` bytes (0 = no limit)
    pub fn max_file_size(mut self, size: u64) -> Self {
        self.config.max_file_size = size;
        self
    }

    /// Values below 1 are raised to 1
    pub fn parallel_workers(mut self, count: usize) -> Self {
        self.config.parallel_workers = count.max(1);
        self
    }

    pub fn follow_symlinks(mut self, follow: bool) -> Self {
        self.config.follow_symlinks = follow;
        self
    }

    pub fn respect_gitignore(mut self, respect: bool) -> Self {
        self.config.respect_gitignore = respect;
        self
    }

    pub fn manifest_format(mut self, format: ManifestFormat) -> Self {
        self.config.manifest_format = format;
        self
    }

    pub fn put_policy(mut self, policy: PutPolicy) -> Self {
        self.config.put_policy = policy;
        self
    }

    /// Create the mirror at `root`. Fails if one is already there.
    #[instrument(skip_all)]
    pub fn init(self, root: impl Into<PathBuf>) -> Result<Mirror> {
        let root = root.into();
        let metadata_path = root.join(METADATA_FILE);
        if metadata_path.exists() {
            return Err(MirrorError::MirrorAlreadyExists(root));
        }
        info!("Initializing mirror at {:?}", root);

        fs::create_dir_all(&root)?;
        let metadata = MirrorMetadata {
            format_version: FORMAT_VERSION,
            created_by: format!("mirrorvault {}", env!("CARGO_PKG_VERSION")),
            created_at: Utc::now(),
            config: self.config,
        };
        let mirror = Mirror::assemble(root, metadata.config.clone())?;
        utils::atomic_write(&metadata_path, &serde_json::to_vec_pretty(&metadata)?)?;
        Ok(mirror)
    }
}
