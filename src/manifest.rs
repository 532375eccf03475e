//! Snapshot manifests and their on-disk history
//!
//! A [`Manifest`] records one snapshot of a tree: every file, symlink and
//! directory under the source, keyed by relative path, with file entries
//! pointing at content digests in the store. Entries are kept sorted by
//! path (component-wise, which is [`PathBuf`]'s ordering), so identical trees
//! always produce identical entry lists and a subtree is a contiguous range.
//!
//! [`ManifestStore`] is the append-only history under `manifests/`. Each
//! manifest is one file named after its id, written through a temp file that
//! is fsynced and then persisted without clobbering. Once committed a
//! manifest is never rewritten.
//!
//! Ids look like `20260118T093012.123456Z-1a2b3c4d`: a UTC timestamp followed
//! by a random suffix, so sorting ids sorts manifests chronologically.

use crate::collections::{HashMap, HashMapExt};
use crate::digest::Digest;
use crate::error::{MirrorError, Result};
use crate::types::ChangeStats;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, trace, warn};

/// What a manifest entry is
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    /// Regular file whose content lives in the store
    File { digest: Digest },
    /// Symbolic link, stored as its target
    Symlink { target: PathBuf },
    /// Directory, metadata only
    Directory,
}

impl EntryKind {
    pub fn digest(&self) -> Option<&Digest> {
        match self {
            EntryKind::File { digest } => Some(digest),
            _ => None,
        }
    }

    pub fn is_file(&self) -> bool {
        matches!(self, EntryKind::File { .. })
    }

    pub fn is_dir(&self) -> bool {
        matches!(self, EntryKind::Directory)
    }
}

/// One path in a snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Path relative to the snapshot source
    pub path: PathBuf,
    pub kind: EntryKind,
    /// Content size for files, 0 otherwise
    pub size: u64,
    pub modified: DateTime<Utc>,
    /// Unix permission bits
    pub permissions: u32,
}

impl ManifestEntry {
    /// Whether `other` describes a different state of the same path.
    ///
    /// Directory mtimes move whenever a child changes, so directories only
    /// compare kind and permissions.
    pub fn differs_from(&self, other: &ManifestEntry) -> bool {
        if self.kind != other.kind || self.permissions != other.permissions {
            return true;
        }
        if self.kind.is_dir() {
            return false;
        }
        self.size != other.size || self.modified != other.modified
    }
}

/// Persisted form of a manifest
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ManifestFormat {
    /// Pretty printed JSON, `.json`
    #[default]
    Json,
    /// bincode, `.bin`
    Binary,
}

impl ManifestFormat {
    pub fn extension(self) -> &'static str {
        match self {
            ManifestFormat::Json => "json",
            ManifestFormat::Binary => "bin",
        }
    }

    /// Format implied by a file's extension
    pub fn from_path(path: &Path) -> Option<Self> {
        match path.extension()?.to_str()? {
            "json" => Some(ManifestFormat::Json),
            "bin" => Some(ManifestFormat::Binary),
            _ => None,
        }
    }
}

/// A committed (or about to be committed) snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub id: String,
    pub created_at: DateTime<Utc>,
    /// Id of the snapshot this one was built against
    pub predecessor: Option<String>,
    pub hostname: String,
    /// Root that was snapshotted
    pub source: PathBuf,
    /// Sorted by path, unique
    pub entries: Vec<ManifestEntry>,
}

impl Manifest {
    /// Sort `entries`, stamp the header and assign a fresh id.
    ///
    /// Fails with [`MirrorError::ManifestCorrupt`] on duplicate or unsafe paths.
    pub fn build(
        mut entries: Vec<ManifestEntry>,
        predecessor: Option<&str>,
        source: impl Into<PathBuf>,
    ) -> Result<Self> {
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        let created_at = Utc::now();
        let manifest = Self {
            id: new_manifest_id(created_at),
            created_at,
            predecessor: predecessor.map(str::to_string),
            hostname: local_hostname(),
            source: source.into(),
            entries,
        };
        manifest.validate()?;
        Ok(manifest)
    }

    /// Check the structural invariants a persisted manifest must hold
    pub fn validate(&self) -> Result<()> {
        if !is_valid_id(&self.id) {
            return Err(MirrorError::manifest_corrupt(format!("invalid manifest id {:?}", self.id)));
        }
        for entry in &self.entries {
            check_relative(&entry.path)?;
        }
        for pair in self.entries.windows(2) {
            match pair[0].path.cmp(&pair[1].path) {
                std::cmp::Ordering::Less => {}
                std::cmp::Ordering::Equal => {
                    return Err(MirrorError::manifest_corrupt(format!(
                        "duplicate path {:?}",
                        pair[1].path
                    )))
                }
                std::cmp::Ordering::Greater => {
                    return Err(MirrorError::manifest_corrupt(format!(
                        "entries out of order at {:?}",
                        pair[1].path
                    )))
                }
            }
        }
        Ok(())
    }

    /// Entry for `path`, by binary search
    pub fn find(&self, path: &Path) -> Option<&ManifestEntry> {
        self.entries
            .binary_search_by(|e| e.path.as_path().cmp(path))
            .ok()
            .map(|i| &self.entries[i])
    }

    /// `prefix` itself and everything beneath it, as a contiguous slice
    pub fn entries_under(&self, prefix: &Path) -> &[ManifestEntry] {
        if prefix.as_os_str().is_empty() {
            return &self.entries;
        }
        let start = self.entries.partition_point(|e| e.path.as_path() < prefix);
        let len = self.entries[start..].partition_point(|e| e.path.starts_with(prefix));
        &self.entries[start..start + len]
    }

    /// Digests of all file entries, in entry order (may repeat)
    pub fn file_digests(&self) -> impl Iterator<Item = &Digest> + '_ {
        self.entries.iter().filter_map(|e| e.kind.digest())
    }

    pub fn file_count(&self) -> usize {
        self.entries.iter().filter(|e| e.kind.is_file()).count()
    }

    /// Sum of file sizes
    pub fn total_size(&self) -> u64 {
        self.entries
            .iter()
            .filter(|e| e.kind.is_file())
            .map(|e| e.size)
            .sum()
    }

    pub fn to_bytes(&self, format: ManifestFormat) -> Result<Vec<u8>> {
        match format {
            ManifestFormat::Json => Ok(serde_json::to_vec_pretty(self)?),
            ManifestFormat::Binary => Ok(bincode::serde::encode_to_vec(self, bincode::config::standard())?),
        }
    }

    /// Parse and validate a persisted manifest
    pub fn from_bytes(bytes: &[u8], format: ManifestFormat) -> Result<Self> {
        let manifest: Manifest = match format {
            ManifestFormat::Json => serde_json::from_slice(bytes)
                .map_err(|e| MirrorError::manifest_corrupt(format!("invalid JSON: {}", e)))?,
            ManifestFormat::Binary => {
                let (manifest, read) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                    .map_err(|e| MirrorError::manifest_corrupt(format!("invalid binary manifest: {}", e)))?;
                if read != bytes.len() {
                    return Err(MirrorError::manifest_corrupt("trailing bytes after manifest"));
                }
                manifest
            }
        };
        manifest.validate()?;
        Ok(manifest)
    }
}

/// Differences between two manifests, by path
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestDiff {
    pub from_id: String,
    pub to_id: String,
    pub added: Vec<ManifestEntry>,
    /// (old, new)
    pub modified: Vec<(ManifestEntry, ManifestEntry)>,
    pub removed: Vec<ManifestEntry>,
    pub stats: ChangeStats,
}

impl ManifestDiff {
    pub fn is_empty(&self) -> bool {
        !self.stats.has_changes()
    }
}

/// Compare `older` with `newer`. Each list comes out sorted by path.
pub fn diff(older: &Manifest, newer: &Manifest) -> ManifestDiff {
    let mut old_index: HashMap<&Path, &ManifestEntry> = HashMap::with_capacity(older.entries.len());
    for entry in &older.entries {
        old_index.insert(entry.path.as_path(), entry);
    }

    let mut added = Vec::new();
    let mut modified = Vec::new();
    let mut stats = ChangeStats::default();

    for entry in &newer.entries {
        match old_index.remove(entry.path.as_path()) {
            None => {
                stats.entries_added += 1;
                stats.bytes_added += entry.size;
                added.push(entry.clone());
            }
            Some(old) if old.differs_from(entry) => {
                stats.entries_modified += 1;
                stats.bytes_modified += entry.size;
                modified.push((old.clone(), entry.clone()));
            }
            Some(_) => {}
        }
    }

    // Whatever is left in the index was removed; walk `older` to keep order
    let removed: Vec<ManifestEntry> = older
        .entries
        .iter()
        .filter(|e| old_index.contains_key(e.path.as_path()))
        .cloned()
        .collect();
    stats.entries_removed = removed.len();
    stats.bytes_removed = removed.iter().map(|e| e.size).sum();

    ManifestDiff {
        from_id: older.id.clone(),
        to_id: newer.id.clone(),
        added,
        modified,
        removed,
        stats,
    }
}

/// Append-only manifest history in a directory
#[derive(Debug, Clone)]
pub struct ManifestStore {
    dir: PathBuf,
    format: ManifestFormat,
}

impl ManifestStore {
    /// Open the history at `dir`, creating it if needed. New manifests are
    /// written in `format`; existing ones are read in whatever format they have.
    pub fn open(dir: impl Into<PathBuf>, format: ManifestFormat) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir, format })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn format(&self) -> ManifestFormat {
        self.format
    }

    /// Atomically persist `manifest`. Committing an existing id is an error.
    pub fn commit(&self, manifest: &Manifest) -> Result<PathBuf> {
        manifest.validate()?;
        if self.contains(&manifest.id) {
            return Err(MirrorError::internal(format!(
                "manifest {} is already committed",
                manifest.id
            )));
        }

        let bytes = manifest.to_bytes(self.format)?;
        let path = self.dir.join(format!("{}.{}", manifest.id, self.format.extension()));

        let mut temp = tempfile::Builder::new().prefix(".tmp").tempfile_in(&self.dir)?;
        temp.write_all(&bytes)?;
        temp.flush()?;
        temp.as_file().sync_all()?;
        persist(temp, &path)?;

        debug!(
            "Committed manifest {} ({} entries, {} bytes)",
            manifest.id,
            manifest.entries.len(),
            bytes.len()
        );
        Ok(path)
    }

    /// Load and validate a manifest by exact id
    pub fn load(&self, id: &str) -> Result<Manifest> {
        let path = self.path_of(id)?;
        let format = ManifestFormat::from_path(&path)
            .ok_or_else(|| MirrorError::manifest_corrupt(format!("unknown manifest file {:?}", path)))?;
        let bytes = fs::read(&path)?;
        let manifest = Manifest::from_bytes(&bytes, format)?;
        if manifest.id != id {
            return Err(MirrorError::manifest_corrupt(format!(
                "file for {} holds manifest {}",
                id, manifest.id
            )));
        }
        trace!("Loaded manifest {} ({} entries)", id, manifest.entries.len());
        Ok(manifest)
    }

    /// All committed ids, oldest first
    pub fn list(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if ManifestFormat::from_path(&path).is_none() {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                if is_valid_id(stem) {
                    ids.push(stem.to_string());
                }
            }
        }
        ids.sort();
        ids.dedup();
        Ok(ids)
    }

    pub fn latest_id(&self) -> Result<Option<String>> {
        Ok(self.list()?.pop())
    }

    pub fn latest(&self) -> Result<Option<Manifest>> {
        match self.latest_id()? {
            Some(id) => Ok(Some(self.load(&id)?)),
            None => Ok(None),
        }
    }

    /// Newest manifest taken from `source`. Histories of other sources
    /// sharing the mirror are skipped, and so are unreadable manifests.
    pub fn latest_for_source(&self, source: &Path) -> Result<Option<Manifest>> {
        for id in self.list()?.iter().rev() {
            match self.load(id) {
                Ok(manifest) if manifest.source == source => return Ok(Some(manifest)),
                Ok(_) => {}
                Err(e) if e.is_corruption() => warn!("Ignoring manifest {}: {}", id, e),
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.path_of(id).is_ok()
    }

    /// Resolve `latest`, an exact id, or a unique id prefix
    pub fn resolve(&self, selector: &str) -> Result<String> {
        let ids = self.list()?;
        if selector == "latest" {
            return ids
                .last()
                .cloned()
                .ok_or_else(|| MirrorError::ManifestNotFound(selector.to_string()));
        }
        if ids.iter().any(|id| id == selector) {
            return Ok(selector.to_string());
        }

        let matches: Vec<&String> = ids.iter().filter(|id| id.starts_with(selector)).collect();
        match matches.as_slice() {
            [only] => Ok((*only).clone()),
            [] => Err(MirrorError::ManifestNotFound(selector.to_string())),
            many => Err(MirrorError::ManifestNotFound(format!(
                "{} is ambiguous ({} snapshots match)",
                selector,
                many.len()
            ))),
        }
    }

    /// File name of a committed manifest, e.g. `<id>.json`
    pub fn file_name(&self, id: &str) -> Result<String> {
        let path = self.path_of(id)?;
        path.file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string)
            .ok_or_else(|| MirrorError::internal(format!("unprintable manifest path {:?}", path)))
    }

    /// Persisted bytes of a committed manifest, exactly as on disk
    pub fn raw_bytes(&self, id: &str) -> Result<Vec<u8>> {
        Ok(fs::read(self.path_of(id)?)?)
    }

    fn path_of(&self, id: &str) -> Result<PathBuf> {
        if !is_valid_id(id) {
            return Err(MirrorError::ManifestNotFound(id.to_string()));
        }
        [ManifestFormat::Json, ManifestFormat::Binary]
            .iter()
            .map(|f| self.dir.join(format!("{}.{}", id, f.extension())))
            .find(|p| p.is_file())
            .ok_or_else(|| MirrorError::ManifestNotFound(id.to_string()))
    }
}

fn persist(temp: NamedTempFile, path: &Path) -> Result<()> {
    temp.persist_noclobber(path).map_err(|e| {
        if e.error.kind() == io::ErrorKind::AlreadyExists {
            MirrorError::internal(format!("manifest file {:?} already exists", path))
        } else {
            MirrorError::Io(e.error)
        }
    })?;
    Ok(())
}

/// Fresh id for a manifest created at `at`
pub fn new_manifest_id(at: DateTime<Utc>) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", at.format("%Y%m%dT%H%M%S%.6fZ"), &suffix[..8])
}

/// Ids are plain ASCII names; anything that could escape the directory is rejected
pub(crate) fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && !id.starts_with('.')
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_')
}

fn check_relative(path: &Path) -> Result<()> {
    if path.as_os_str().is_empty() {
        return Err(MirrorError::manifest_corrupt("empty entry path"));
    }
    for component in path.components() {
        match component {
            Component::Normal(_) => {}
            Component::ParentDir => {
                return Err(MirrorError::manifest_corrupt(format!(
                    "entry path {:?} escapes the root",
                    path
                )))
            }
            _ => {
                return Err(MirrorError::manifest_corrupt(format!(
                    "entry path {:?} is not relative",
                    path
                )))
            }
        }
    }
    Ok(())
}

fn local_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}
