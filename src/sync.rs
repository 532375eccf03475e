//! Offsite sync engine
//!
//! Pushes a mirror to a remote copy through a [`RemoteTransport`]:
//!
//! 1. Inventory both sides. The remote inventory is a listing of the sharded
//!    `objects/` tree; anything that is not a well-formed object name
//!    (including leftover `.partial` uploads) is ignored.
//! 2. Unless told otherwise, compare the bytes about to be sent against the
//!    free space the remote reports. Then upload every object the remote
//!    lacks, in digest order, on a bounded pool. Each upload goes to
//!    `<object>.partial`, is re-hashed while it streams and size-checked,
//!    then renamed into place, so the final name only ever holds complete
//!    data. A `.partial` left behind by an object that ran out of retries is
//!    deleted.
//! 3. Upload missing manifests oldest first, but only once every object they
//!    reference is known to be on the remote. The others are reported as
//!    blocked and picked up by the next run.
//!
//! Re-running after an interruption simply recomputes the inventory.

use crate::cancel::{self, CancellationToken};
use crate::collections::{DigestSet, HashSet, HashSetExt};
use crate::digest::{digest_reader, Digest, HashingReader, CHUNK_SIZE};
use crate::error::{MirrorError, Result};
use crate::manifest::{Manifest, ManifestFormat, ManifestStore};
use crate::remote::{
    manifest_path, object_path, RemoteTransport, TransferError, TransferResult, MANIFESTS_DIR, OBJECTS_DIR,
    PARTIAL_SUFFIX,
};
use crate::retry::{RetryOutcome, RetryPolicy};
use crate::storage::ContentStore;
use crate::types::{EntryFailure, MissingObject, ProgressInfo, SyncOptions, SyncReport, VerifyReport};
use crate::utils;
use rayon::prelude::*;
use std::io::{self, Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

/// How one object upload ended
enum ObjectOutcome {
    Sent { bytes: u64, attempts: u32 },
    Failed { error: TransferError, attempts: u32 },
    Fatal(TransferError),
    Cancelled,
    /// Not attempted because another upload failed fatally
    Skipped,
}

/// Push every object and manifest the remote lacks
#[instrument(skip_all)]
pub fn sync(
    store: &ContentStore,
    manifests: &ManifestStore,
    transport: &dyn RemoteTransport,
    options: &SyncOptions,
) -> Result<SyncReport> {
    let start = Instant::now();
    let cancel = options.cancel.as_ref();
    cancel::check(cancel)?;

    let local = store.inventory()?;
    let remote = remote_inventory(transport)?;
    let mut missing: Vec<Digest> = local.iter().filter(|d| !remote.contains(d)).copied().collect();
    missing.sort();
    debug!(
        "Sync inventory: {} local, {} remote, {} to send",
        local.len(),
        remote.len(),
        missing.len()
    );

    let mut report = SyncReport {
        local_objects: local.len(),
        remote_objects: remote.len(),
        ..Default::default()
    };

    if !options.skip_space_check && !missing.is_empty() {
        let mut required = 0u64;
        for digest in &missing {
            required += store.object_size(digest)?;
        }
        let available = transport.available_space()?;
        utils::check_space(Path::new(OBJECTS_DIR), required, available)?;
    }

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(options.concurrency.max(1))
        .build()
        .map_err(|e| MirrorError::internal(format!("failed to build transfer pool: {}", e)))?;

    let abort = CancellationToken::new();
    let processed = AtomicUsize::new(0);
    let bytes_sent = AtomicU64::new(0);
    let total = missing.len();

    let outcomes: Vec<(Digest, ObjectOutcome)> = pool.install(|| {
        missing
            .par_iter()
            .map(|digest| {
                let outcome = if cancel.is_some_and(|c| c.is_cancelled()) {
                    ObjectOutcome::Cancelled
                } else if abort.is_cancelled() {
                    ObjectOutcome::Skipped
                } else {
                    send_object(store, transport, digest, &options.retry, cancel)
                };

                match &outcome {
                    ObjectOutcome::Fatal(_) => abort.cancel(),
                    ObjectOutcome::Sent { bytes, .. } => {
                        bytes_sent.fetch_add(*bytes, Ordering::Relaxed);
                    }
                    _ => {}
                }
                let done = processed.fetch_add(1, Ordering::Relaxed) + 1;
                if let Some(progress) = &options.progress {
                    progress(ProgressInfo {
                        operation: "Uploading".to_string(),
                        current_item: Some(digest.short()),
                        processed: done,
                        total: Some(total),
                        bytes_processed: bytes_sent.load(Ordering::Relaxed),
                    });
                }
                (*digest, outcome)
            })
            .collect()
    });

    let mut confirmed = remote;
    let mut cancelled = false;
    for (digest, outcome) in outcomes {
        match outcome {
            ObjectOutcome::Sent { bytes, attempts } => {
                report.objects_transferred += 1;
                report.bytes_transferred += bytes;
                report.retries += attempts.saturating_sub(1);
                confirmed.insert(digest);
            }
            ObjectOutcome::Failed { error, attempts } => {
                warn!("Giving up on object {} after {} attempts: {}", digest.short(), attempts, error);
                report.retries += attempts.saturating_sub(1);
                report
                    .failures
                    .push(EntryFailure::new(object_path(&digest), &MirrorError::RemoteTransfer(error)));
            }
            ObjectOutcome::Fatal(error) => return Err(MirrorError::RemoteTransfer(error)),
            ObjectOutcome::Cancelled => cancelled = true,
            ObjectOutcome::Skipped => {}
        }
    }
    if cancelled {
        return Err(MirrorError::Cancelled);
    }

    send_manifests(manifests, transport, &confirmed, options, &mut report)?;

    report.duration_ms = start.elapsed().as_millis() as u64;
    info!(
        "Synced {} objects ({}) and {} manifests in {:?} ({} failed, {} blocked)",
        report.objects_transferred,
        utils::format_bytes(report.bytes_transferred),
        report.manifests_transferred.len(),
        start.elapsed(),
        report.failures.len(),
        report.manifests_blocked.len()
    );
    Ok(report)
}

/// Digests present under the remote `objects/` tree
pub fn remote_inventory(transport: &dyn RemoteTransport) -> TransferResult<DigestSet> {
    let mut found = DigestSet::new();
    for shard in transport.list(OBJECTS_DIR)?.iter().filter(|s| is_shard(s)) {
        let shard_path = format!("{}/{}", OBJECTS_DIR, shard);
        for sub in transport.list(&shard_path)?.iter().filter(|s| is_shard(s)) {
            let prefix = format!("{}{}", shard, sub);
            for name in transport.list(&format!("{}/{}", shard_path, sub))? {
                match Digest::from_hex(&name) {
                    Ok(digest) if name.starts_with(&prefix) => {
                        found.insert(digest);
                    }
                    _ => {}
                }
            }
        }
    }
    Ok(found)
}

fn is_shard(name: &str) -> bool {
    name.len() == 2 && name.bytes().all(|b| b.is_ascii_hexdigit())
}

fn send_object(
    store: &ContentStore,
    transport: &dyn RemoteTransport,
    digest: &Digest,
    policy: &RetryPolicy,
    cancel: Option<&CancellationToken>,
) -> ObjectOutcome {
    let final_path = object_path(digest);
    let partial_path = format!("{}{}", final_path, PARTIAL_SUFFIX);

    let outcome = policy.run(cancel, |attempt| {
        if attempt > 1 {
            debug!("Retrying upload of {} (attempt {})", digest.short(), attempt);
        }
        let source = store
            .get(digest)
            .map_err(|e| TransferError::retryable(format!("local object unreadable: {}", e)))?;
        let (actual, sent) = upload(transport, source, &partial_path)?;
        if actual != *digest {
            return Err(TransferError::retryable(format!(
                "local object {} reads back as {}",
                digest.short(),
                actual.short()
            )));
        }
        check_remote_size(transport, &partial_path, sent)?;
        transport.rename(&partial_path, &final_path)?;
        Ok(sent)
    });

    match outcome {
        RetryOutcome::Success { value, attempts } => ObjectOutcome::Sent { bytes: value, attempts },
        RetryOutcome::Exhausted { last_error, .. } if !last_error.is_retryable() => ObjectOutcome::Fatal(last_error),
        RetryOutcome::Exhausted { last_error, attempts } => {
            discard_partial(transport, &partial_path);
            ObjectOutcome::Failed {
                error: last_error,
                attempts,
            }
        }
        RetryOutcome::Cancelled { .. } => ObjectOutcome::Cancelled,
    }
}

fn discard_partial(transport: &dyn RemoteTransport, partial_path: &str) {
    if let Err(e) = transport.delete(partial_path) {
        debug!("Could not remove {}: {}", partial_path, e);
    }
}

/// Stream `source` to `path`, returning the digest and length of what was sent.
///
/// Failing to read `source` is retryable: the local side may recover and
/// the remote is not to blame. Remote errors keep their own classification.
fn upload<R: Read>(transport: &dyn RemoteTransport, source: R, path: &str) -> TransferResult<(Digest, u64)> {
    let mut writer = transport.open_write(path)?;
    let mut reader = HashingReader::new(source);
    let mut buffer = vec![0u8; CHUNK_SIZE];
    loop {
        let n = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(TransferError::retryable(format!("local read failed: {}", e))),
        };
        writer.write_all(&buffer[..n])?;
    }
    writer.flush()?;
    drop(writer);
    Ok(reader.finalize())
}

fn check_remote_size(transport: &dyn RemoteTransport, path: &str, expected: u64) -> TransferResult<()> {
    match transport.size(path)? {
        Some(actual) if actual == expected => Ok(()),
        Some(actual) => Err(TransferError::retryable(format!(
            "remote {} has {} bytes, expected {}",
            path, actual, expected
        ))),
        None => Err(TransferError::retryable(format!("remote {} vanished after upload", path))),
    }
}

fn send_manifests(
    manifests: &ManifestStore,
    transport: &dyn RemoteTransport,
    confirmed: &DigestSet,
    options: &SyncOptions,
    report: &mut SyncReport,
) -> Result<()> {
    let remote_names: HashSet<String> = transport.list(MANIFESTS_DIR)?.into_iter().collect();

    for id in manifests.list()? {
        cancel::check(options.cancel.as_ref())?;
        let file_name = manifests.file_name(&id)?;
        if remote_names.contains(&file_name) {
            continue;
        }

        let manifest = manifests.load(&id)?;
        if let Some(absent) = manifest.file_digests().find(|d| !confirmed.contains(*d)) {
            debug!("Manifest {} blocked: object {} not on remote", id, absent.short());
            report.manifests_blocked.push(id);
            continue;
        }

        let bytes = manifests.raw_bytes(&id)?;
        let final_path = manifest_path(&file_name);
        let partial_path = format!("{}{}", final_path, PARTIAL_SUFFIX);
        let outcome = options.retry.run(options.cancel.as_ref(), |_| {
            let (_, sent) = upload(transport, bytes.as_slice(), &partial_path)?;
            check_remote_size(transport, &partial_path, sent)?;
            transport.rename(&partial_path, &final_path)
        });

        report.retries += outcome.attempts().saturating_sub(1);
        match outcome {
            RetryOutcome::Success { .. } => report.manifests_transferred.push(id),
            RetryOutcome::Exhausted { last_error, .. } if !last_error.is_retryable() => {
                return Err(MirrorError::RemoteTransfer(last_error));
            }
            RetryOutcome::Exhausted { last_error, .. } => {
                warn!("Giving up on manifest {}: {}", id, last_error);
                report
                    .failures
                    .push(EntryFailure::new(final_path, &MirrorError::RemoteTransfer(last_error)));
            }
            RetryOutcome::Cancelled { .. } => return Err(MirrorError::Cancelled),
        }
    }
    Ok(())
}

/// Check the remote copy.
///
/// Every remote manifest is parsed and its objects looked up in the remote
/// inventory. With `deep`, every remote object is also read back and
/// re-hashed.
#[instrument(skip(transport))]
pub fn verify_remote(transport: &dyn RemoteTransport, deep: bool) -> Result<VerifyReport> {
    let start = Instant::now();
    let inventory = remote_inventory(transport)?;
    let mut report = VerifyReport {
        deep,
        objects_checked: inventory.len(),
        ..Default::default()
    };

    for name in transport.list(MANIFESTS_DIR)? {
        let Some(format) = ManifestFormat::from_path(Path::new(&name)) else {
            continue;
        };
        let id = name.rsplit_once('.').map_or(name.as_str(), |(stem, _)| stem).to_string();
        report.manifests_checked += 1;

        let manifest = match read_remote_manifest(transport, &name, format) {
            Ok(m) => m,
            Err(e) => {
                warn!("Remote manifest {} unreadable: {}", name, e);
                report.corrupt_manifests.push(id);
                continue;
            }
        };
        for entry in &manifest.entries {
            if let Some(digest) = entry.kind.digest() {
                if !inventory.contains(digest) {
                    report.missing_objects.push(MissingObject {
                        manifest_id: manifest.id.clone(),
                        path: entry.path.clone(),
                        digest: *digest,
                    });
                }
            }
        }
    }

    if deep {
        let mut digests: Vec<Digest> = inventory.into_iter().collect();
        digests.sort();
        let corrupt: Vec<Digest> = digests
            .par_iter()
            .filter(|digest| !remote_object_intact(transport, digest))
            .copied()
            .collect();
        report.corrupt_objects = corrupt;
    }

    report.duration_ms = start.elapsed().as_millis() as u64;
    info!(
        "Verified remote: {} manifests, {} objects, {} missing, {} corrupt",
        report.manifests_checked,
        report.objects_checked,
        report.missing_objects.len(),
        report.corrupt_objects.len() + report.corrupt_manifests.len()
    );
    Ok(report)
}

fn read_remote_manifest(transport: &dyn RemoteTransport, name: &str, format: ManifestFormat) -> Result<Manifest> {
    let mut bytes = Vec::new();
    transport
        .open_read(&manifest_path(name))?
        .read_to_end(&mut bytes)?;
    Manifest::from_bytes(&bytes, format)
}

fn remote_object_intact(transport: &dyn RemoteTransport, digest: &Digest) -> bool {
    let reader = match transport.open_read(&object_path(digest)) {
        Ok(r) => r,
        Err(e) => {
            warn!("Cannot read remote object {}: {}", digest.short(), e);
            return false;
        }
    };
    matches!(digest_reader(reader), Ok((actual, _)) if actual == *digest)
}
