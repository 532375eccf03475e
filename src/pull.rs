//! Offsite restore
//!
//! Brings snapshots back from a remote copy into the local mirror, the
//! reverse of [`crate::sync`]. Typical use is rebuilding a lost mirror:
//! initialize an empty one, pull, then restore from it as usual.
//!
//! 1. List the remote manifests and pick the ones asked for (all of them,
//!    `latest`, an id or a unique id prefix). Manifests the mirror already
//!    has are skipped.
//! 2. Collect the objects those manifests reference that the local store
//!    lacks, check that the local filesystem can hold them, then download
//!    them on a bounded pool. Every object goes through
//!    [`ContentStore::put`], so bytes that do not hash to their name never
//!    enter the store.
//! 3. Commit each pulled manifest locally, oldest first, once all of its
//!    objects are present. The others are reported as blocked.

use crate::cancel::{self, CancellationToken};
use crate::collections::{DigestSet, HashSetExt};
use crate::digest::Digest;
use crate::error::{MirrorError, Result};
use crate::manifest::{self, Manifest, ManifestFormat, ManifestStore};
use crate::remote::{manifest_path, object_path, RemoteTransport, TransferError, MANIFESTS_DIR};
use crate::retry::{RetryOutcome, RetryPolicy};
use crate::storage::{ContentStore, PutOutcome};
use crate::sync::remote_inventory;
use crate::types::{EntryFailure, ProgressInfo, SyncOptions, SyncReport};
use crate::utils;
use rayon::prelude::*;
use std::io::Read;
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

/// A manifest file found on the remote
#[derive(Debug, Clone, PartialEq, Eq)]
struct RemoteManifest {
    id: String,
    file_name: String,
    format: ManifestFormat,
}

/// How one object download ended
enum FetchOutcome {
    Stored { bytes: u64, attempts: u32 },
    /// Another manifest in this run already brought the object in
    Present { attempts: u32 },
    Failed { error: MirrorError, attempts: u32 },
    Fatal(MirrorError),
    Cancelled,
    /// Not attempted because another download failed fatally
    Skipped,
}

/// Pull the remote manifests named by `selector` (all of them when `None`)
/// and every object they need into the local mirror
#[instrument(skip(store, manifests, transport, options))]
pub fn pull(
    store: &ContentStore,
    manifests: &ManifestStore,
    transport: &dyn RemoteTransport,
    selector: Option<&str>,
    options: &SyncOptions,
) -> Result<SyncReport> {
    let start = Instant::now();
    let cancel = options.cancel.as_ref();
    cancel::check(cancel)?;

    let available = remote_manifests(transport)?;
    let chosen = select(&available, selector)?;
    let wanted: Vec<&RemoteManifest> = chosen.into_iter().filter(|m| !manifests.contains(&m.id)).collect();
    debug!("Pulling {} manifests ({} on remote)", wanted.len(), available.len());

    let remote = remote_inventory(transport)?;
    let mut report = SyncReport {
        local_objects: store.inventory()?.len(),
        remote_objects: remote.len(),
        ..Default::default()
    };

    let mut fetched: Vec<Manifest> = Vec::with_capacity(wanted.len());
    for entry in wanted {
        cancel::check(cancel)?;
        match fetch_manifest(transport, entry, &options.retry, cancel) {
            Ok(manifest) => fetched.push(manifest),
            Err(MirrorError::Cancelled) => return Err(MirrorError::Cancelled),
            Err(MirrorError::RemoteTransfer(e)) if !e.is_retryable() => return Err(MirrorError::RemoteTransfer(e)),
            Err(e) => {
                warn!("Skipping remote manifest {}: {}", entry.file_name, e);
                report
                    .failures
                    .push(EntryFailure::new(manifest_path(&entry.file_name), &e));
            }
        }
    }

    let mut needed = DigestSet::new();
    for manifest in &fetched {
        needed.extend(manifest.file_digests().filter(|d| !store.has(d)).copied());
    }
    let mut missing: Vec<Digest> = needed.into_iter().collect();
    missing.sort();

    let (present, absent): (Vec<Digest>, Vec<Digest>) = missing.into_iter().partition(|d| remote.contains(d));
    for digest in &absent {
        warn!("Object {} is referenced but not on the remote", digest.short());
        report
            .failures
            .push(EntryFailure::new(object_path(digest), &MirrorError::ObjectNotFound(*digest)));
    }

    if !options.skip_space_check && !present.is_empty() {
        let mut required = 0u64;
        for digest in &present {
            required += transport.size(&object_path(digest))?.unwrap_or(0);
        }
        utils::check_space(store.root(), required, utils::available_space(store.root()))?;
    }

    download_objects(store, transport, &present, options, &mut report)?;

    for manifest in fetched {
        cancel::check(cancel)?;
        let absent = manifest.file_digests().find(|d| !store.has(d)).copied();
        if let Some(absent) = absent {
            debug!("Manifest {} blocked: object {} not local", manifest.id, absent.short());
            report.manifests_blocked.push(manifest.id);
            continue;
        }
        manifests.commit(&manifest)?;
        report.manifests_transferred.push(manifest.id);
    }

    report.duration_ms = start.elapsed().as_millis() as u64;
    info!(
        "Pulled {} objects ({}) and {} manifests in {:?} ({} failed, {} blocked)",
        report.objects_transferred,
        utils::format_bytes(report.bytes_transferred),
        report.manifests_transferred.len(),
        start.elapsed(),
        report.failures.len(),
        report.manifests_blocked.len()
    );
    Ok(report)
}

/// Manifest files on the remote, oldest first
fn remote_manifests(transport: &dyn RemoteTransport) -> Result<Vec<RemoteManifest>> {
    let mut found = Vec::new();
    for name in transport.list(MANIFESTS_DIR)? {
        let Some(format) = ManifestFormat::from_path(Path::new(&name)) else {
            continue;
        };
        let Some((id, _)) = name.rsplit_once('.') else {
            continue;
        };
        if manifest::is_valid_id(id) {
            found.push(RemoteManifest {
                id: id.to_string(),
                file_name: name.clone(),
                format,
            });
        }
    }
    found.sort_by(|a, b| a.id.cmp(&b.id));
    found.dedup_by(|a, b| a.id == b.id);
    Ok(found)
}

/// Resolve `selector` the way local manifests are resolved
fn select<'a>(available: &'a [RemoteManifest], selector: Option<&str>) -> Result<Vec<&'a RemoteManifest>> {
    let Some(selector) = selector else {
        return Ok(available.iter().collect());
    };
    if selector == "latest" {
        return available
            .last()
            .map(|m| vec![m])
            .ok_or_else(|| MirrorError::ManifestNotFound(format!("{} (remote)", selector)));
    }
    if let Some(exact) = available.iter().find(|m| m.id == selector) {
        return Ok(vec![exact]);
    }
    let matches: Vec<&RemoteManifest> = available.iter().filter(|m| m.id.starts_with(selector)).collect();
    match matches.len() {
        1 => Ok(matches),
        0 => Err(MirrorError::ManifestNotFound(format!("{} (remote)", selector))),
        n => Err(MirrorError::ManifestNotFound(format!(
            "{} is ambiguous ({} remote snapshots match)",
            selector, n
        ))),
    }
}

fn fetch_manifest(
    transport: &dyn RemoteTransport,
    entry: &RemoteManifest,
    policy: &RetryPolicy,
    cancel: Option<&CancellationToken>,
) -> Result<Manifest> {
    let path = manifest_path(&entry.file_name);
    let outcome = policy.run(cancel, |_| {
        let mut bytes = Vec::new();
        transport.open_read(&path)?.read_to_end(&mut bytes)?;
        Ok(bytes)
    });
    let bytes = match outcome {
        RetryOutcome::Success { value, .. } => value,
        RetryOutcome::Exhausted { last_error, .. } => return Err(MirrorError::RemoteTransfer(last_error)),
        RetryOutcome::Cancelled { .. } => return Err(MirrorError::Cancelled),
    };

    let manifest = Manifest::from_bytes(&bytes, entry.format)?;
    if manifest.id != entry.id {
        return Err(MirrorError::manifest_corrupt(format!(
            "remote file {} holds manifest {}",
            entry.file_name, manifest.id
        )));
    }
    Ok(manifest)
}

fn download_objects(
    store: &ContentStore,
    transport: &dyn RemoteTransport,
    digests: &[Digest],
    options: &SyncOptions,
    report: &mut SyncReport,
) -> Result<()> {
    let cancel = options.cancel.as_ref();
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(options.concurrency.max(1))
        .build()
        .map_err(|e| MirrorError::internal(format!("failed to build transfer pool: {}", e)))?;

    let abort = CancellationToken::new();
    let processed = AtomicUsize::new(0);
    let bytes_received = AtomicU64::new(0);
    let total = digests.len();

    let outcomes: Vec<(Digest, FetchOutcome)> = pool.install(|| {
        digests
            .par_iter()
            .map(|digest| {
                let outcome = if cancel.is_some_and(|c| c.is_cancelled()) {
                    FetchOutcome::Cancelled
                } else if abort.is_cancelled() {
                    FetchOutcome::Skipped
                } else {
                    fetch_object(store, transport, digest, &options.retry, cancel)
                };

                match &outcome {
                    FetchOutcome::Fatal(_) => abort.cancel(),
                    FetchOutcome::Stored { bytes, .. } => {
                        bytes_received.fetch_add(*bytes, Ordering::Relaxed);
                    }
                    _ => {}
                }
                let done = processed.fetch_add(1, Ordering::Relaxed) + 1;
                if let Some(progress) = &options.progress {
                    progress(ProgressInfo {
                        operation: "Downloading".to_string(),
                        current_item: Some(digest.short()),
                        processed: done,
                        total: Some(total),
                        bytes_processed: bytes_received.load(Ordering::Relaxed),
                    });
                }
                (*digest, outcome)
            })
            .collect()
    });

    let mut cancelled = false;
    for (digest, outcome) in outcomes {
        match outcome {
            FetchOutcome::Stored { bytes, attempts } => {
                report.objects_transferred += 1;
                report.bytes_transferred += bytes;
                report.retries += attempts.saturating_sub(1);
            }
            FetchOutcome::Present { attempts } => report.retries += attempts.saturating_sub(1),
            FetchOutcome::Failed { error, attempts } => {
                warn!("Giving up on object {} after {} attempts: {}", digest.short(), attempts, error);
                report.retries += attempts.saturating_sub(1);
                report.failures.push(EntryFailure::new(object_path(&digest), &error));
            }
            FetchOutcome::Fatal(error) => return Err(error),
            FetchOutcome::Cancelled => cancelled = true,
            FetchOutcome::Skipped => {}
        }
    }
    if cancelled {
        return Err(MirrorError::Cancelled);
    }
    Ok(())
}

fn fetch_object(
    store: &ContentStore,
    transport: &dyn RemoteTransport,
    digest: &Digest,
    policy: &RetryPolicy,
    cancel: Option<&CancellationToken>,
) -> FetchOutcome {
    let path = object_path(digest);

    // The inner result carries errors that retrying cannot fix
    let outcome = policy.run(cancel, |attempt| {
        if attempt > 1 {
            debug!("Retrying download of {} (attempt {})", digest.short(), attempt);
        }
        let reader = transport.open_read(&path)?;
        match store.put(digest, reader) {
            Ok(put) => Ok(Ok(put)),
            Err(MirrorError::Io(e)) => Err(TransferError::from(e)),
            Err(e) => Ok(Err(e)),
        }
    });

    match outcome {
        RetryOutcome::Success {
            value: Ok(PutOutcome::Stored { bytes }),
            attempts,
        } => FetchOutcome::Stored { bytes, attempts },
        RetryOutcome::Success {
            value: Ok(PutOutcome::AlreadyPresent),
            attempts,
        } => FetchOutcome::Present { attempts },
        RetryOutcome::Success {
            value: Err(error @ MirrorError::ContentCollision { .. }),
            attempts,
        } => FetchOutcome::Failed { error, attempts },
        RetryOutcome::Success { value: Err(error), .. } => FetchOutcome::Fatal(error),
        RetryOutcome::Exhausted { last_error, .. } if !last_error.is_retryable() => {
            FetchOutcome::Fatal(MirrorError::RemoteTransfer(last_error))
        }
        RetryOutcome::Exhausted { last_error, attempts } => FetchOutcome::Failed {
            error: MirrorError::RemoteTransfer(last_error),
            attempts,
        },
        RetryOutcome::Cancelled { .. } => FetchOutcome::Cancelled,
    }
}
