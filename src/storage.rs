//! Content-addressed object store
//!
//! Every distinct file content is stored exactly once, under its
//! [`Digest`]. Objects never change after they are written, and this
//! module never deletes one.
//!
//! ## Layout
//!
//! ```text
//! objects/
//! ├── ab/
//! │   └── cd/
//! │       └── abcd0123...   # 64 hex chars, raw file bytes
//! └── .tmp*                 # in-flight writes, ignored by list()
//! ```
//!
//! The two-level fan-out keeps directories small for stores with millions of
//! objects. The layout is shared with remote mirrors (see
//! [`crate::remote::object_path`]).
//!
//! ## Writes
//!
//! A put streams into a uniquely named temp file next to its final location,
//! hashing as it writes. Only when the hash equals the claimed digest is the
//! temp file persisted, and the persist refuses to clobber: two writers
//! racing on the same digest both succeed, one reporting
//! [`PutOutcome::AlreadyPresent`]. A failed or dropped write leaves at most a
//! `.tmp*` file behind, which [`ContentStore::purge_temporaries`] removes.
//!
//! ## Example
//!
//! ```rust,no_run
//! use mirrorvault::storage::{ContentStore, PutOutcome};
//! use mirrorvault::digest::digest_bytes;
//! use std::io::Read;
//!
//! # fn main() -> mirrorvault::Result<()> {
//! let store = ContentStore::open("./mirror/objects")?;
//! let data = b"hello";
//! let digest = digest_bytes(data);
//!
//! assert!(matches!(store.put(&digest, &data[..])?, PutOutcome::Stored { .. }));
//! assert!(matches!(store.put(&digest, &data[..])?, PutOutcome::AlreadyPresent));
//!
//! let mut back = Vec::new();
//! store.get(&digest)?.read_to_end(&mut back)?;
//! assert_eq!(back, data);
//! # Ok(())
//! # }
//! ```

use crate::collections::{DigestSet, HashSetExt};
use crate::digest::{digest_reader, Digest, HashingWriter, CHUNK_SIZE};
use crate::error::{MirrorError, Result};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, trace, warn};
use walkdir::WalkDir;

/// Prefix of temp files inside the store
pub const TEMP_PREFIX: &str = ".tmp";

/// How `put` treats content whose digest is already stored
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PutPolicy {
    /// Hash the incoming stream and fail on mismatch
    #[default]
    Rehash,
    /// Trust the caller's digest and skip reading the stream
    TrustDigest,
}

/// What a `put` did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// New object written
    Stored { bytes: u64 },
    /// Object was already there; nothing written
    AlreadyPresent,
}

/// Object counts for a store
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    pub object_count: usize,
    pub total_bytes: u64,
}

/// Result of storing content whose digest was not known up front
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Inserted {
    pub digest: Digest,
    /// Bytes read from the source
    pub size: u64,
    pub outcome: PutOutcome,
}

/// Content-addressed store rooted at an `objects/` directory
#[derive(Debug, Clone)]
pub struct ContentStore {
    root: PathBuf,
    policy: PutPolicy,
}

impl ContentStore {
    /// Open the store at `root`, creating the directory if needed
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| MirrorError::store(&root, e))?;
        Ok(Self {
            root,
            policy: PutPolicy::default(),
        })
    }

    /// Use `policy` for puts of already-present digests
    pub fn with_policy(mut self, policy: PutPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn policy(&self) -> PutPolicy {
        self.policy
    }

    /// Final location of `digest`
    pub fn object_path(&self, digest: &Digest) -> PathBuf {
        let hex = digest.to_hex();
        self.root.join(&hex[0..2]).join(&hex[2..4]).join(hex)
    }

    /// Whether `digest` is stored. Reads no content.
    pub fn has(&self, digest: &Digest) -> bool {
        self.object_path(digest).is_file()
    }

    /// Store the content read from `reader` under `digest` if absent.
    ///
    /// Errors reading `reader` are returned as [`MirrorError::Io`]; errors
    /// writing into the store as [`MirrorError::Store`]. Bytes that do not
    /// hash to `digest` give [`MirrorError::ContentCollision`] and nothing is
    /// stored.
    pub fn put<R: Read>(&self, digest: &Digest, mut reader: R) -> Result<PutOutcome> {
        if self.has(digest) {
            return self.check_present(digest, reader);
        }

        let final_path = self.object_path(digest);
        let shard = final_path
            .parent()
            .ok_or_else(|| MirrorError::internal("object path has no parent"))?;
        fs::create_dir_all(shard).map_err(|e| MirrorError::store(shard, e))?;

        let temp = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .tempfile_in(shard)
            .map_err(|e| MirrorError::store(shard, e))?;

        let (temp, actual, bytes) = stream_into(temp, &mut reader)?;
        if actual != *digest {
            debug!("Rejected put for {}: content hashes to {}", digest.short(), actual.short());
            return Err(MirrorError::ContentCollision {
                expected: *digest,
                actual,
            });
        }

        self.promote(temp, digest, bytes)
    }

    /// Store everything `reader` yields, computing the digest on the way
    pub fn insert_reader<R: Read>(&self, mut reader: R) -> Result<Inserted> {
        let temp = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .tempfile_in(&self.root)
            .map_err(|e| MirrorError::store(&self.root, e))?;

        let (temp, digest, size) = stream_into(temp, &mut reader)?;
        if self.has(&digest) {
            return Ok(Inserted {
                digest,
                size,
                outcome: PutOutcome::AlreadyPresent,
            });
        }

        let final_path = self.object_path(&digest);
        if let Some(shard) = final_path.parent() {
            fs::create_dir_all(shard).map_err(|e| MirrorError::store(shard, e))?;
        }
        let outcome = self.promote(temp, &digest, size)?;
        Ok(Inserted { digest, size, outcome })
    }

    /// Store a file's content in a single pass. A missing or unreadable
    /// file is [`MirrorError::Io`].
    pub fn insert_file(&self, path: &Path) -> Result<Inserted> {
        let file = File::open(path)?;
        self.insert_reader(file)
    }

    /// Open the object for reading
    pub fn get(&self, digest: &Digest) -> Result<File> {
        match File::open(self.object_path(digest)) {
            Ok(file) => Ok(file),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(MirrorError::ObjectNotFound(*digest)),
            Err(e) => Err(MirrorError::Io(e)),
        }
    }

    /// Read the whole object, failing if it no longer hashes to `digest`
    pub fn read_verified(&self, digest: &Digest) -> Result<Vec<u8>> {
        let mut data = Vec::new();
        self.get(digest)?.read_to_end(&mut data)?;
        let actual = crate::digest::digest_bytes(&data);
        if actual != *digest {
            return Err(MirrorError::ContentCollision {
                expected: *digest,
                actual,
            });
        }
        Ok(data)
    }

    /// Re-hash a stored object. `Ok(false)` means the bytes are corrupt.
    pub fn verify_object(&self, digest: &Digest) -> Result<bool> {
        let (actual, _) = digest_reader(self.get(digest)?)?;
        Ok(actual == *digest)
    }

    /// Size of a stored object in bytes
    pub fn object_size(&self, digest: &Digest) -> Result<u64> {
        match fs::metadata(self.object_path(digest)) {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(MirrorError::ObjectNotFound(*digest)),
            Err(e) => Err(MirrorError::Io(e)),
        }
    }

    /// Lazily enumerate stored digests.
    ///
    /// Each call starts a fresh walk. Temp files and names that are not a
    /// digest in the right shard are skipped.
    pub fn list(&self) -> ObjectIter {
        let walker = WalkDir::new(&self.root)
            .min_depth(3)
            .max_depth(3)
            .sort_by_file_name()
            .into_iter();
        ObjectIter { walker }
    }

    /// Collect the full inventory of stored digests
    pub fn inventory(&self) -> Result<DigestSet> {
        let mut set = DigestSet::new();
        for digest in self.list() {
            set.insert(digest?);
        }
        Ok(set)
    }

    /// Count objects and bytes
    pub fn stats(&self) -> Result<StoreStats> {
        let mut stats = StoreStats::default();
        for digest in self.list() {
            let digest = digest?;
            stats.object_count += 1;
            stats.total_bytes += self.object_size(&digest)?;
        }
        Ok(stats)
    }

    /// Remove temp files left by interrupted writes. Returns how many went.
    pub fn purge_temporaries(&self) -> Result<usize> {
        let mut removed = 0;
        for entry in WalkDir::new(&self.root).max_depth(3) {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let is_temp = entry
                .file_name()
                .to_str()
                .is_some_and(|n| n.starts_with(TEMP_PREFIX));
            if is_temp {
                match fs::remove_file(entry.path()) {
                    Ok(()) => removed += 1,
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(MirrorError::Io(e)),
                }
            }
        }
        if removed > 0 {
            debug!("Purged {} temporary files from {:?}", removed, self.root);
        }
        Ok(removed)
    }

    fn check_present<R: Read>(&self, digest: &Digest, reader: R) -> Result<PutOutcome> {
        if self.policy == PutPolicy::Rehash {
            let (actual, _) = digest_reader(reader)?;
            if actual != *digest {
                return Err(MirrorError::ContentCollision {
                    expected: *digest,
                    actual,
                });
            }
        }
        trace!("Object {} already present", digest.short());
        Ok(PutOutcome::AlreadyPresent)
    }

    fn promote(&self, temp: NamedTempFile, digest: &Digest, bytes: u64) -> Result<PutOutcome> {
        let final_path = self.object_path(digest);
        match temp.persist_noclobber(&final_path) {
            Ok(_) => {
                trace!("Stored object {} ({} bytes)", digest.short(), bytes);
                Ok(PutOutcome::Stored { bytes })
            }
            Err(e) if final_path.is_file() => {
                trace!("Lost race for {} ({}), keeping existing object", digest.short(), e.error);
                Ok(PutOutcome::AlreadyPresent)
            }
            Err(e) => {
                warn!("Failed to persist object {}: {}", digest.short(), e.error);
                Err(MirrorError::store(final_path, e.error))
            }
        }
    }
}

/// Copy `reader` into `temp`, hashing on the way, and sync it to disk
fn stream_into<R: Read>(temp: NamedTempFile, reader: &mut R) -> Result<(NamedTempFile, Digest, u64)> {
    let temp_path = temp.path().to_path_buf();
    let mut writer = HashingWriter::new(BufWriter::new(temp));
    let mut buffer = vec![0u8; CHUNK_SIZE];

    loop {
        let n = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(MirrorError::Io(e)),
        };
        writer
            .write_all(&buffer[..n])
            .map_err(|e| MirrorError::store(&temp_path, e))?;
    }

    let (buffered, digest, bytes) = writer.finish();
    let temp = buffered
        .into_inner()
        .map_err(|e| MirrorError::store(&temp_path, e.into_error()))?;
    temp.as_file()
        .sync_all()
        .map_err(|e| MirrorError::store(&temp_path, e))?;
    Ok((temp, digest, bytes))
}

/// Iterator returned by [`ContentStore::list`]
pub struct ObjectIter {
    walker: walkdir::IntoIter,
}

impl Iterator for ObjectIter {
    type Item = Result<Digest>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let entry = match self.walker.next()? {
                Ok(entry) => entry,
                Err(e) => return Some(Err(MirrorError::WalkDir(e))),
            };
            if !entry.file_type().is_file() {
                continue;
            }
            if let Some(digest) = digest_from_object_path(entry.path()) {
                return Some(Ok(digest));
            }
        }
    }
}

/// Digest named by `.../ab/cd/abcd...`, if the name and shards agree
fn digest_from_object_path(path: &Path) -> Option<Digest> {
    let name = path.file_name()?.to_str()?;
    let digest = Digest::from_hex(name).ok()?;
    let shard2 = path.parent()?;
    let shard1 = shard2.parent()?;
    let ok = shard1.file_name()?.to_str()? == &name[0..2] && shard2.file_name()?.to_str()? == &name[2..4];
    ok.then_some(digest)
}
