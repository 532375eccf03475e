//! # mirrorvault - deduplicating mirror snapshots with offsite sync
//!
//! mirrorvault keeps point-in-time copies of a directory tree in a local
//! mirror and pushes that mirror to a remote location.
//!
//! ## Overview
//!
//! - Every regular file's content is stored once, under its SHA-256 digest,
//!   in a sharded content-addressed store. Identical files across the tree
//!   and across snapshots share one object.
//! - A snapshot commits a manifest: the sorted list of entries (files,
//!   directories, symlinks) with their digests and metadata. Manifests are
//!   append-only and each names its predecessor.
//! - Unchanged files (same size and mtime as the previous snapshot) are not
//!   read again, so repeat snapshots of a large tree are cheap.
//! - A restore rebuilds any snapshot, or part of one, under a destination
//!   directory, verifying every byte against its digest.
//! - An offsite sync uploads whatever objects and manifests the remote lacks,
//!   through a [`RemoteTransport`] supplied by the caller, with retries and
//!   crash-safe temp-then-rename uploads. A pull brings snapshots back from
//!   the remote into a fresh or damaged mirror.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use mirrorvault::{LocalDirTransport, Mirror, RestoreOptions, SnapshotOptions, SyncOptions};
//! use std::path::Path;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mirror = Mirror::init("/backups/project")?;
//!
//! let snap = mirror.snapshot(Path::new("/home/user/project"), &SnapshotOptions::default())?;
//! println!("{}: {} entries, {} new objects", snap.manifest_id, snap.entries, snap.objects_written);
//!
//! let offsite = LocalDirTransport::new("/mnt/offsite/project")?;
//! let sync = mirror.sync(&offsite, &SyncOptions::default())?;
//! println!("uploaded {} objects", sync.objects_transferred);
//!
//! mirror.restore(&snap.manifest_id, Path::new("/tmp/project"), &RestoreOptions::default())?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Failure model
//!
//! Operations return a report rather than stopping at the first bad entry.
//! A file that vanished mid-snapshot, a restore target that conflicts, or an
//! object upload that ran out of retries is recorded in the report's
//! `failures` and the status becomes [`OperationStatus::Partial`]. Conditions
//! that would break an invariant (the store cannot be written, the remote
//! refuses access, cancellation) abort the operation with a
//! [`MirrorError`] instead.
//!
//! ## Module Organization
//!
//! - [`digest`]: SHA-256 digests and streaming hashers
//! - [`storage`]: content-addressed object store
//! - [`manifest`]: manifests, diffs and the manifest history
//! - [`scanner`]: source tree walking and filtering
//! - [`snapshot`]: incremental snapshot builder
//! - [`restore`]: restore engine
//! - [`sync`]: offsite sync and remote verification
//! - [`pull`]: offsite restore into the local mirror
//! - [`remote`]: the remote transport trait and a directory implementation
//! - [`mirror`]: the facade tying it all together

pub mod cancel;
pub mod digest;
pub mod error;
pub mod manifest;
pub mod mirror;
pub mod remote;
pub mod restore;
pub mod retry;
pub mod scanner;
pub mod snapshot;
pub mod storage;
pub mod pull;
pub mod sync;
pub mod types;

mod collections;
pub mod utils;

pub use cancel::CancellationToken;
pub use digest::Digest;
pub use error::{MirrorError, Result};
pub use manifest::{EntryKind, Manifest, ManifestDiff, ManifestEntry, ManifestFormat, ManifestStore};
pub use mirror::{Mirror, MirrorBuilder};
pub use remote::{LocalDirTransport, RemoteTransport, TransferError, TransferErrorKind};
pub use restore::{PathFilter, PathSubstitution};
pub use retry::RetryPolicy;
pub use storage::{ContentStore, Inserted, PutOutcome, PutPolicy};
pub use types::*;
