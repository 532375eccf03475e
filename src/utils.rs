//! Filesystem helpers shared by the scanner, restore engine and mirror facade.
//!
//! Permission handling differs per platform: on Unix the full mode bits are
//! read and written; on Windows only the read-only attribute maps onto them.

use crate::error::{MirrorError, Result};
use chrono::{DateTime, Utc};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, trace, warn};

/// Metadata captured for a path without following symlinks
#[derive(Debug, Clone)]
pub struct FileMetadata {
    /// Size in bytes (0 for directories)
    pub size: u64,
    /// Unix-style permission bits
    pub permissions: u32,
    pub modified: SystemTime,
    pub is_symlink: bool,
    pub is_dir: bool,
}

impl FileMetadata {
    pub fn modified_utc(&self) -> DateTime<Utc> {
        DateTime::<Utc>::from(self.modified)
    }
}

/// Read metadata for `path` (the link itself, for symlinks)
pub fn get_file_metadata(path: &Path) -> Result<FileMetadata> {
    let metadata = fs::symlink_metadata(path)?;
    Ok(from_metadata(&metadata)?)
}

/// Read metadata for `path`, following symlinks
pub fn get_followed_metadata(path: &Path) -> Result<FileMetadata> {
    let metadata = fs::metadata(path)?;
    Ok(from_metadata(&metadata)?)
}

fn from_metadata(metadata: &fs::Metadata) -> std::io::Result<FileMetadata> {
    let is_dir = metadata.is_dir();
    Ok(FileMetadata {
        size: if is_dir { 0 } else { metadata.len() },
        permissions: get_permissions(metadata),
        modified: metadata.modified()?,
        is_symlink: metadata.file_type().is_symlink(),
        is_dir,
    })
}

#[cfg(unix)]
fn get_permissions(metadata: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

#[cfg(windows)]
fn get_permissions(metadata: &fs::Metadata) -> u32 {
    let mut mode = if metadata.permissions().readonly() { 0o444 } else { 0o644 };
    if metadata.is_dir() {
        mode |= 0o111;
    }
    mode
}

/// Apply permission bits to `path`
#[cfg(unix)]
pub fn set_permissions(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    Ok(())
}

/// Apply permission bits to `path`. Only owner-write maps to a Windows attribute.
#[cfg(windows)]
pub fn set_permissions(path: &Path, mode: u32) -> Result<()> {
    let mut perms = fs::metadata(path)?.permissions();
    perms.set_readonly(mode & 0o200 == 0);
    fs::set_permissions(path, perms)?;
    Ok(())
}

/// Set the modification time of `path` (the link itself for symlinks)
pub fn set_mtime(path: &Path, modified: DateTime<Utc>, is_symlink: bool) -> Result<()> {
    let mtime = filetime::FileTime::from_system_time(SystemTime::from(modified));
    if is_symlink {
        filetime::set_symlink_file_times(path, mtime, mtime)?;
    } else {
        filetime::set_file_mtime(path, mtime)?;
    }
    Ok(())
}

/// Make `path` relative to `base`.
///
/// A lexical strip is tried first so symlinked paths keep their own name;
/// canonicalizing is only the fallback.
pub fn make_relative(path: &Path, base: &Path) -> Result<PathBuf> {
    if let Ok(relative) = path.strip_prefix(base) {
        return Ok(relative.to_path_buf());
    }

    let path_canon = path.canonicalize()?;
    let base_canon = base.canonicalize()?;
    path_canon
        .strip_prefix(&base_canon)
        .map(Path::to_path_buf)
        .map_err(|_| MirrorError::internal(format!("Path {:?} is not under {:?}", path_canon, base_canon)))
}

/// Human readable byte count, e.g. `1.50 KB`
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB", "PB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    if unit_idx == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.2} {}", size, UNITS[unit_idx])
    }
}

/// Replace `path` with `content` through an fsynced temp file in the same directory
pub fn atomic_write(path: &Path, content: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| MirrorError::internal(format!("{:?} has no parent directory", path)))?;
    let mut temp = tempfile::Builder::new().prefix(".tmp").tempfile_in(dir)?;
    temp.write_all(content)?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| MirrorError::Io(e.error))?;
    trace!("Atomically wrote {:?} ({} bytes)", path, content.len());
    Ok(())
}

#[cfg(unix)]
pub fn create_symlink(target: &Path, link: &Path) -> Result<()> {
    std::os::unix::fs::symlink(target, link)?;
    Ok(())
}

#[cfg(windows)]
pub fn create_symlink(target: &Path, link: &Path) -> Result<()> {
    use std::os::windows::fs::{symlink_dir, symlink_file};

    let resolved = match link.parent() {
        Some(parent) if target.is_relative() => parent.join(target),
        _ => target.to_path_buf(),
    };
    if resolved.is_dir() {
        symlink_dir(target, link)?;
    } else {
        symlink_file(target, link)?;
    }
    Ok(())
}

pub fn read_symlink(path: &Path) -> Result<PathBuf> {
    Ok(fs::read_link(path)?)
}

/// Share of the free space an operation may plan to fill
pub const SPACE_HEADROOM: f64 = 0.85;

/// Bytes available to this user on the filesystem holding `path`.
///
/// `path` need not exist yet; its nearest existing ancestor (or the working
/// directory, for a relative path with none) is queried.
/// `None` when the filesystem cannot say.
pub fn available_space(path: &Path) -> Option<u64> {
    let existing = path
        .ancestors()
        .find(|p| p.exists())
        .unwrap_or_else(|| Path::new("."));
    match fs4::available_space(existing) {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            warn!("Cannot query free space at {:?}: {}", existing, e);
            None
        }
    }
}

/// Fail with [`MirrorError::InsufficientSpace`] unless `required` bytes fit
/// within the headroom of `available`
pub fn check_space(path: &Path, required: u64, available: Option<u64>) -> Result<()> {
    let Some(available) = available else {
        return Ok(());
    };
    debug!(
        "Space check at {:?}: {} required, {} available",
        path,
        format_bytes(required),
        format_bytes(available)
    );
    if required > 0 && (available as f64 * SPACE_HEADROOM) <= required as f64 {
        return Err(MirrorError::InsufficientSpace {
            path: path.to_path_buf(),
            required,
            available,
        });
    }
    Ok(())
}
