//! Remote transfer collaborator
//!
//! The sync engine never speaks a network protocol itself. It is handed a
//! [`RemoteTransport`] that already has whatever session or credentials it
//! needs, and only ever asks it to list, stream, rename and delete paths
//! relative to the remote mirror root. Paths are `/`-separated strings.
//!
//! The remote side uses the same layout as a local mirror:
//!
//! ```text
//! objects/ab/cd/abcd...  (64 hex chars)
//! manifests/<id>.json | <id>.bin
//! ```
//!
//! [`LocalDirTransport`] implements the trait over a plain directory (a
//! mounted drive, a network share) and is what the CLI uses.

use crate::digest::Digest;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tracing::trace;

/// Top-level directory holding content objects, locally and remotely
pub const OBJECTS_DIR: &str = "objects";

/// Top-level directory holding manifests, locally and remotely
pub const MANIFESTS_DIR: &str = "manifests";

/// Suffix of an in-flight remote upload
pub const PARTIAL_SUFFIX: &str = ".partial";

/// Whether retrying a failed transfer may help
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferErrorKind {
    /// Transient: timeouts, dropped connections, interrupted writes
    Retryable,
    /// Permanent: authentication, permissions, bad paths
    Fatal,
}

impl fmt::Display for TransferErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferErrorKind::Retryable => write!(f, "retryable"),
            TransferErrorKind::Fatal => write!(f, "fatal"),
        }
    }
}

/// Error raised by a [`RemoteTransport`]
#[derive(Debug, Clone, Error)]
#[error("{kind} transfer failure: {message}")]
pub struct TransferError {
    pub kind: TransferErrorKind,
    pub message: String,
}

impl TransferError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            kind: TransferErrorKind::Retryable,
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            kind: TransferErrorKind::Fatal,
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind == TransferErrorKind::Retryable
    }
}

impl From<io::Error> for TransferError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::PermissionDenied => TransferError::fatal(err.to_string()),
            _ => TransferError::retryable(err.to_string()),
        }
    }
}

/// Result type for transport calls
pub type TransferResult<T> = std::result::Result<T, TransferError>;

/// Remote file-transfer collaborator
pub trait RemoteTransport: Send + Sync {
    /// Names directly under `path`. A missing directory lists as empty.
    fn list(&self, path: &str) -> TransferResult<Vec<String>>;

    /// Open `path` for writing, replacing anything already there
    fn open_write(&self, path: &str) -> TransferResult<Box<dyn Write + Send>>;

    /// Open `path` for reading
    fn open_read(&self, path: &str) -> TransferResult<Box<dyn Read + Send>>;

    /// Move `from` to `to`, replacing `to`
    fn rename(&self, from: &str, to: &str) -> TransferResult<()>;

    /// Remove `path`. Removing something absent is not an error.
    fn delete(&self, path: &str) -> TransferResult<()>;

    /// Size of `path` in bytes, `None` when it does not exist.
    ///
    /// The default reads the whole stream; transports with a cheap stat
    /// should override it.
    fn size(&self, path: &str) -> TransferResult<Option<u64>> {
        let mut reader = match self.open_read(path) {
            Ok(r) => r,
            Err(_) => return Ok(None),
        };
        let n = io::copy(&mut reader, &mut io::sink())?;
        Ok(Some(n))
    }

    /// Free bytes on the remote side, `None` when the remote cannot tell
    fn available_space(&self) -> TransferResult<Option<u64>> {
        Ok(None)
    }
}

/// Remote path of an object: `objects/ab/cd/<hex>`
pub fn object_path(digest: &Digest) -> String {
    let hex = digest.to_hex();
    format!("{}/{}/{}/{}", OBJECTS_DIR, &hex[0..2], &hex[2..4], hex)
}

/// Remote path of a manifest file
pub fn manifest_path(file_name: &str) -> String {
    format!("{}/{}", MANIFESTS_DIR, file_name)
}

/// [`RemoteTransport`] over a local or mounted directory
#[derive(Debug, Clone)]
pub struct LocalDirTransport {
    root: PathBuf,
}

impl LocalDirTransport {
    /// Use `root` as the remote mirror root, creating it if needed
    pub fn new(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> TransferResult<PathBuf> {
        let relative = Path::new(path);
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(TransferError::fatal(format!("invalid remote path: {}", path)));
        }
        Ok(self.root.join(relative))
    }
}

impl RemoteTransport for LocalDirTransport {
    fn list(&self, path: &str) -> TransferResult<Vec<String>> {
        let dir = self.resolve(path)?;
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    fn open_write(&self, path: &str) -> TransferResult<Box<dyn Write + Send>> {
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        trace!("Remote open_write {}", path);
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(target)?;
        Ok(Box::new(file))
    }

    fn open_read(&self, path: &str) -> TransferResult<Box<dyn Read + Send>> {
        let file = File::open(self.resolve(path)?)?;
        Ok(Box::new(file))
    }

    fn rename(&self, from: &str, to: &str) -> TransferResult<()> {
        let to_path = self.resolve(to)?;
        if let Some(parent) = to_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(self.resolve(from)?, to_path)?;
        Ok(())
    }

    fn delete(&self, path: &str) -> TransferResult<()> {
        match fs::remove_file(self.resolve(path)?) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn size(&self, path: &str) -> TransferResult<Option<u64>> {
        match fs::metadata(self.resolve(path)?) {
            Ok(meta) => Ok(Some(meta.len())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn available_space(&self) -> TransferResult<Option<u64>> {
        Ok(crate::utils::available_space(&self.root))
    }
}
