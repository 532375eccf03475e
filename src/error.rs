//! Error types for mirrorvault
//!
//! Every fallible operation in the crate returns [`Result<T>`]. Failures that
//! only affect one entry (a file that vanished during a scan, a restore target
//! that already exists) are collected into the operation's report instead of
//! being returned here; this enum carries what ends up in those reports as well
//! as the fatal conditions that abort an operation outright.

use crate::digest::Digest;
use crate::remote::{TransferError, TransferErrorKind};
use std::path::PathBuf;
use thiserror::Error;

/// Type alias for Results in mirrorvault
pub type Result<T> = std::result::Result<T, MirrorError>;

/// Main error type for all mirror operations
#[derive(Debug, Error)]
pub enum MirrorError {
    /// Local read or write failure
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Write into the content store failed (disk full, store unavailable)
    #[error("Content store write failed at {path:?}: {source}")]
    Store {
        /// Path inside the store that could not be written
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// Errors during JSON serialization/deserialization
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Errors during bincode serialization/deserialization
    #[error("Bincode error: {0}")]
    Bincode(String),

    /// Digest referenced but absent from a content store
    #[error("Object not found: {0}")]
    ObjectNotFound(Digest),

    /// Stored or streamed bytes do not hash to the claimed digest
    #[error("Content collision - expected: {expected}, actual: {actual}")]
    ContentCollision {
        /// Digest the caller claimed
        expected: Digest,
        /// Digest of the bytes actually seen
        actual: Digest,
    },

    /// Restore target exists, differs, and overwriting is not permitted
    #[error("Destination conflict: {path:?} already exists and differs")]
    DestinationConflict {
        /// Destination path that was left untouched
        path: PathBuf,
    },

    /// Remote transfer collaborator failed
    #[error("Remote transfer error: {0}")]
    RemoteTransfer(#[from] TransferError),

    /// Persisted manifest fails to parse or violates its structure
    #[error("Manifest corrupt: {0}")]
    ManifestCorrupt(String),

    /// No manifest with the given id (or prefix)
    #[error("Manifest not found: {0}")]
    ManifestNotFound(String),

    /// String is not a valid hex digest
    #[error("Invalid digest: {0}")]
    InvalidDigest(String),

    /// Mirror root has not been initialized
    #[error("Mirror not initialized at path: {0:?}")]
    MirrorNotInitialized(PathBuf),

    /// Mirror root already holds a mirror
    #[error("Mirror already exists at path: {0:?}")]
    MirrorAlreadyExists(PathBuf),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Include/exclude or restore pattern could not be compiled
    #[error("Invalid pattern: {0}")]
    InvalidPattern(String),

    /// Source path that a manifest cannot record (not valid UTF-8)
    #[error("Unsupported path: {0}")]
    UnsupportedPath(String),

    /// Destination filesystem lacks room for the data about to be copied
    #[error("Insufficient space at {path:?}: {required} bytes required, {available} available")]
    InsufficientSpace {
        /// Directory whose filesystem was checked
        path: PathBuf,
        /// Bytes the operation needs
        required: u64,
        /// Bytes free on that filesystem
        available: u64,
    },

    /// Walk directory error from walkdir crate
    #[error("Walk directory error: {0}")]
    WalkDir(#[from] walkdir::Error),

    /// Operation was cancelled between units of work
    #[error("Operation cancelled")]
    Cancelled,

    /// Generic error for unexpected conditions
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<bincode::error::DecodeError> for MirrorError {
    fn from(err: bincode::error::DecodeError) -> Self {
        MirrorError::Bincode(err.to_string())
    }
}

impl From<bincode::error::EncodeError> for MirrorError {
    fn from(err: bincode::error::EncodeError) -> Self {
        MirrorError::Bincode(err.to_string())
    }
}

impl From<globset::Error> for MirrorError {
    fn from(err: globset::Error) -> Self {
        MirrorError::InvalidPattern(err.to_string())
    }
}

impl MirrorError {
    /// Create a store write error for `path`
    pub fn store(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        MirrorError::Store {
            path: path.into(),
            source,
        }
    }

    /// Create a corrupt-manifest error with a custom message
    pub fn manifest_corrupt(msg: impl Into<String>) -> Self {
        MirrorError::ManifestCorrupt(msg.into())
    }

    /// Create an internal error with a custom message
    pub fn internal(msg: impl Into<String>) -> Self {
        MirrorError::Internal(msg.into())
    }

    /// Check if retrying the same operation may succeed
    pub fn is_recoverable(&self) -> bool {
        match self {
            MirrorError::RemoteTransfer(e) => e.kind == TransferErrorKind::Retryable,
            MirrorError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::WouldBlock
            ),
            _ => false,
        }
    }

    /// Check if this error indicates the store and manifests have diverged
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            MirrorError::ContentCollision { .. }
                | MirrorError::ManifestCorrupt(_)
                | MirrorError::ObjectNotFound(_)
        )
    }

    /// Get a user-friendly error message with suggestions
    pub fn user_message(&self) -> String {
        match self {
            MirrorError::MirrorNotInitialized(path) => {
                format!("No mirror at {:?}. Run 'mirrorvault init' first.", path)
            }
            MirrorError::ManifestNotFound(id) => {
                format!("Snapshot '{}' not found. Use 'mirrorvault list' to see available snapshots.", id)
            }
            MirrorError::DestinationConflict { path } => {
                format!("{:?} already exists with different content. Pass --overwrite to replace it.", path)
            }
            MirrorError::ContentCollision { expected, .. } => {
                format!(
                    "Content for {} does not match its digest. Run 'mirrorvault verify --deep' to check the store.",
                    expected.short()
                )
            }
            MirrorError::InsufficientSpace { path, required, available } => {
                format!(
                    "Not enough space at {:?}: need {}, have {}. Free some space or pass --skip-space-check.",
                    path,
                    crate::utils::format_bytes(*required),
                    crate::utils::format_bytes(*available)
                )
            }
            _ => self.to_string(),
        }
    }
}
