//! # mirrorvault CLI
//!
//! Command-line front end for the mirrorvault library.
//!
//! ## Usage
//! ```bash
//! # Create a mirror
//! mirrorvault init /backups/project --exclude target/
//!
//! # Snapshot a tree into it
//! mirrorvault snapshot ~/project /backups/project
//!
//! # Restore part of the latest snapshot
//! mirrorvault restore /backups/project latest /tmp/out --path docs
//!
//! # Push the mirror offsite
//! mirrorvault sync /backups/project /mnt/offsite/project --retries 6
//!
//! # Rebuild a lost mirror from the offsite copy, then restore from it
//! mirrorvault init /backups/rebuilt
//! mirrorvault pull /backups/rebuilt /mnt/offsite/project
//! mirrorvault restore /backups/rebuilt latest /tmp/out --substitute home/old=home/new
//! ```
//!
//! Exit status is 0 on success, 2 when some entries failed, 1 on a fatal error.

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use colored::*;
use humantime::format_duration;
use indicatif::{ProgressBar, ProgressStyle};
use mirrorvault::sync::verify_remote;
use mirrorvault::utils::format_bytes;
use mirrorvault::{
    CancellationToken, EntryFailure, EntryKind, LocalDirTransport, ManifestFormat, Mirror, MirrorBuilder,
    MirrorError, OperationStatus, PathFilter, PathSubstitution, ProgressCallback, ProgressInfo, PutPolicy, RestoreOptions,
    RetryPolicy, SnapshotOptions, SyncOptions, VerifyReport,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Deduplicating mirror snapshots with offsite sync
#[derive(Parser)]
#[command(name = "mirrorvault")]
#[command(version)]
#[command(about = "Snapshot directory trees into a deduplicating mirror and sync it offsite")]
#[command(long_about = None)]
struct Cli {
    /// Enable debug logging (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new mirror
    Init {
        mirror: PathBuf,

        /// Exclude patterns (gitignore syntax)
        #[arg(short, long)]
        exclude: Vec<String>,

        /// Only snapshot files matching these globs
        #[arg(short, long)]
        include: Vec<String>,

        /// Honor .gitignore files in the source tree
        #[arg(long)]
        gitignore: bool,

        /// Skip files larger than this many bytes (0 = no limit)
        #[arg(long, default_value_t = 0)]
        max_file_size: u64,

        /// Manifest encoding
        #[arg(long, value_enum, default_value = "json")]
        format: FormatMode,

        /// Skip re-hashing objects that are already stored
        #[arg(long)]
        trust_digests: bool,
    },

    /// Snapshot a directory into a mirror
    Snapshot {
        source: PathBuf,
        mirror: PathBuf,

        /// Re-hash every file instead of trusting size and mtime
        #[arg(long)]
        verify: bool,

        /// Extra exclude patterns for this run
        #[arg(short, long)]
        exclude: Vec<String>,

        /// Extra include globs for this run
        #[arg(short, long)]
        include: Vec<String>,

        /// Show progress
        #[arg(short, long)]
        progress: bool,
    },

    /// Restore a snapshot
    Restore {
        mirror: PathBuf,

        /// Manifest id, unique id prefix, or "latest"
        manifest: String,

        dest: PathBuf,

        /// Only restore this path and everything under it
        #[arg(long, conflicts_with = "glob")]
        path: Option<PathBuf>,

        /// Only restore entries matching these globs
        #[arg(long)]
        glob: Vec<String>,

        /// Replace destination files that differ
        #[arg(long)]
        overwrite: bool,

        /// Report what would be written without writing
        #[arg(long)]
        dry_run: bool,

        /// Restore entries under FROM beneath TO instead (FROM=TO, repeatable)
        #[arg(long = "substitute", value_name = "FROM=TO")]
        substitutions: Vec<PathSubstitution>,

        /// Do not check free space at the destination first
        #[arg(long)]
        skip_space_check: bool,

        /// Show progress
        #[arg(short, long)]
        progress: bool,
    },

    /// Push a mirror to a remote directory
    Sync {
        mirror: PathBuf,
        remote: PathBuf,

        /// Attempts per object before giving up
        #[arg(long, default_value_t = 4)]
        retries: u32,

        /// Initial backoff between attempts
        #[arg(long, default_value = "250ms", value_parser = humantime::parse_duration)]
        backoff: Duration,

        /// Objects uploaded at once
        #[arg(long, default_value_t = 4)]
        concurrency: usize,

        /// Do not check free space on the remote first
        #[arg(long)]
        skip_space_check: bool,

        /// Show progress
        #[arg(short, long)]
        progress: bool,
    },

    /// Bring snapshots back from a remote directory into a mirror
    Pull {
        mirror: PathBuf,
        remote: PathBuf,

        /// Remote manifest id, unique id prefix, or "latest" (default: all)
        manifest: Option<String>,

        /// Attempts per object before giving up
        #[arg(long, default_value_t = 4)]
        retries: u32,

        /// Initial backoff between attempts
        #[arg(long, default_value = "250ms", value_parser = humantime::parse_duration)]
        backoff: Duration,

        /// Objects downloaded at once
        #[arg(long, default_value_t = 4)]
        concurrency: usize,

        /// Do not check free space in the mirror first
        #[arg(long)]
        skip_space_check: bool,

        /// Show progress
        #[arg(short, long)]
        progress: bool,
    },

    /// List snapshots
    List {
        mirror: PathBuf,

        /// Only show the most recent N
        #[arg(short = 'n', long)]
        limit: Option<usize>,
    },

    /// Show one snapshot's entries
    Show {
        mirror: PathBuf,
        manifest: String,

        /// Print the manifest as JSON
        #[arg(long)]
        json: bool,
    },

    /// Compare two snapshots
    Diff {
        mirror: PathBuf,
        from: String,
        to: String,
    },

    /// Check manifests and objects in a mirror
    Verify {
        mirror: PathBuf,

        /// Re-hash every object
        #[arg(long)]
        deep: bool,
    },

    /// Check a remote copy
    VerifyRemote {
        remote: PathBuf,

        /// Read back and re-hash every remote object
        #[arg(long)]
        deep: bool,
    },

    /// Remove temp files left by interrupted runs
    Cleanup { mirror: PathBuf },
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
enum FormatMode {
    Json,
    Binary,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if std::env::var("NO_COLOR").is_ok() {
        colored::control::set_override(false);
    }

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("{}", "Interrupted, stopping...".yellow());
            on_interrupt.cancel();
        }
    });

    let code = match tokio::task::spawn_blocking(move || run(cli, cancel)).await {
        Ok(Ok(status)) => status.exit_code(),
        Ok(Err(e)) => {
            let message = match e.downcast_ref::<MirrorError>() {
                Some(err) => err.user_message(),
                None => format!("{:#}", e),
            };
            eprintln!("{}: {}", "Error".red().bold(), message);
            OperationStatus::Fatal.exit_code()
        }
        Err(e) => {
            eprintln!("{}: worker thread failed: {}", "Error".red().bold(), e);
            OperationStatus::Fatal.exit_code()
        }
    };
    std::process::exit(code);
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn run(cli: Cli, cancel: CancellationToken) -> anyhow::Result<OperationStatus> {
    match cli.command {
        Commands::Init {
            mirror,
            exclude,
            include,
            gitignore,
            max_file_size,
            format,
            trust_digests,
        } => {
            let format = match format {
                FormatMode::Json => ManifestFormat::Json,
                FormatMode::Binary => ManifestFormat::Binary,
            };
            let policy = if trust_digests {
                PutPolicy::TrustDigest
            } else {
                PutPolicy::Rehash
            };
            MirrorBuilder::new()
                .exclude_patterns(exclude)
                .include_patterns(include)
                .respect_gitignore(gitignore)
                .max_file_size(max_file_size)
                .manifest_format(format)
                .put_policy(policy)
                .init(&mirror)?;

            println!("{} Initialized mirror at {}", "✓".green().bold(), mirror.display().to_string().cyan());
            println!("\nNext: {}", format!("mirrorvault snapshot <source> {}", mirror.display()).yellow());
            Ok(OperationStatus::Success)
        }
        Commands::Snapshot {
            source,
            mirror,
            verify,
            exclude,
            include,
            progress,
        } => {
            let mut mirror = open_mirror(&mirror)?;
            mirror.config_mut().exclude_patterns.extend(exclude);
            mirror.config_mut().include_patterns.extend(include);

            println!("{} {}", "Snapshotting".blue().bold(), source.display());
            let bar = progress_bar(progress)?;
            let options = SnapshotOptions {
                verify,
                cancel: Some(cancel),
                progress: bar.as_ref().map(progress_callback),
            };
            let report = mirror.snapshot(&source, &options);
            finish(bar);
            let report = report?;

            println!("{} Created snapshot {}", "✓".green().bold(), report.manifest_id.yellow().bold());
            println!("  Entries: {}", report.entries.to_string().cyan());
            println!(
                "  Hashed: {}  Reused: {}",
                report.files_hashed.to_string().cyan(),
                report.files_reused.to_string().cyan()
            );
            println!(
                "  New objects: {} ({})",
                report.objects_written.to_string().cyan(),
                format_bytes(report.bytes_stored).cyan()
            );
            if report.changes.has_changes() {
                println!(
                    "  Changes: {} {} {}",
                    format!("+{}", report.changes.entries_added).green(),
                    format!("~{}", report.changes.entries_modified).yellow(),
                    format!("-{}", report.changes.entries_removed).red()
                );
            }
            println!("  Time: {}", millis(report.duration_ms).cyan());
            print_failures(&report.failures);
            Ok(report.status)
        }
        Commands::Restore {
            mirror,
            manifest,
            dest,
            path,
            glob,
            overwrite,
            dry_run,
            substitutions,
            skip_space_check,
            progress,
        } => {
            let mirror = open_mirror(&mirror)?;
            let filter = match (path, glob.is_empty()) {
                (Some(prefix), _) => Some(PathFilter::Prefix(prefix)),
                (None, false) => Some(PathFilter::Glob(glob)),
                (None, true) => None,
            };

            let bar = progress_bar(progress)?;
            let options = RestoreOptions {
                filter,
                overwrite,
                dry_run,
                substitutions,
                skip_space_check,
                cancel: Some(cancel),
                progress: bar.as_ref().map(progress_callback),
            };
            let report = mirror.restore(&manifest, &dest, &options);
            finish(bar);
            let report = report?;

            if report.dry_run {
                println!("{} {} entries would be written:", "Dry run:".blue().bold(), report.planned.len());
                for path in &report.planned {
                    println!("  {}", path.display());
                }
            } else {
                println!("{} Restored {}", "✓".green().bold(), report.manifest_id.yellow());
                println!("  Files: {}", report.files_restored.to_string().cyan());
                println!("  Directories: {}", report.directories_created.to_string().cyan());
                println!("  Symlinks: {}", report.symlinks_created.to_string().cyan());
                println!("  Bytes written: {}", format_bytes(report.bytes_written).cyan());
                println!("  Time: {}", millis(report.duration_ms).cyan());
            }
            println!("  Unchanged: {}", report.unchanged.to_string().cyan());
            print_failures(&report.failures);
            Ok(report.status())
        }
        Commands::Sync {
            mirror,
            remote,
            retries,
            backoff,
            concurrency,
            skip_space_check,
            progress,
        } => {
            let mirror = open_mirror(&mirror)?;
            let transport = LocalDirTransport::new(&remote)
                .with_context(|| format!("cannot use {} as a remote", remote.display()))?;

            let bar = progress_bar(progress)?;
            let options = SyncOptions {
                retry: retry_policy(retries, backoff),
                concurrency,
                skip_space_check,
                cancel: Some(cancel),
                progress: bar.as_ref().map(progress_callback),
            };
            let report = mirror.sync(&transport, &options);
            finish(bar);
            let report = report?;

            println!("{} Synced to {}", "✓".green().bold(), remote.display().to_string().cyan());
            println!(
                "  Objects: {} sent ({}), {} already remote",
                report.objects_transferred.to_string().cyan(),
                format_bytes(report.bytes_transferred).cyan(),
                report.remote_objects
            );
            println!("  Manifests: {} sent", report.manifests_transferred.len().to_string().cyan());
            if report.retries > 0 {
                println!("  Retries: {}", report.retries.to_string().yellow());
            }
            for id in &report.manifests_blocked {
                println!("  {} {} (objects missing remotely)", "Blocked:".yellow().bold(), id);
            }
            println!("  Time: {}", millis(report.duration_ms).cyan());
            print_failures(&report.failures);
            Ok(report.status())
        }
        Commands::Pull {
            mirror,
            remote,
            manifest,
            retries,
            backoff,
            concurrency,
            skip_space_check,
            progress,
        } => {
            let mirror = open_mirror(&mirror)?;
            let transport = LocalDirTransport::new(&remote)
                .with_context(|| format!("cannot use {} as a remote", remote.display()))?;

            let bar = progress_bar(progress)?;
            let options = SyncOptions {
                retry: retry_policy(retries, backoff),
                concurrency,
                skip_space_check,
                cancel: Some(cancel),
                progress: bar.as_ref().map(progress_callback),
            };
            let report = mirror.pull(&transport, manifest.as_deref(), &options);
            finish(bar);
            let report = report?;

            println!("{} Pulled from {}", "✓".green().bold(), remote.display().to_string().cyan());
            println!(
                "  Objects: {} received ({})",
                report.objects_transferred.to_string().cyan(),
                format_bytes(report.bytes_transferred).cyan()
            );
            for id in &report.manifests_transferred {
                println!("  {} {}", "Snapshot:".green(), id.yellow());
            }
            if report.retries > 0 {
                println!("  Retries: {}", report.retries.to_string().yellow());
            }
            for id in &report.manifests_blocked {
                println!("  {} {} (objects did not arrive)", "Blocked:".yellow().bold(), id);
            }
            println!("  Time: {}", millis(report.duration_ms).cyan());
            print_failures(&report.failures);
            Ok(report.status())
        }
        Commands::List { mirror, limit } => {
            let mirror = open_mirror(&mirror)?;
            let ids = mirror.list_manifests()?;
            if ids.is_empty() {
                println!("{}", "No snapshots yet.".yellow());
                return Ok(OperationStatus::Success);
            }
            let skip = limit.map_or(0, |n| ids.len().saturating_sub(n));
            println!("{}", "Snapshots:".blue().bold());
            for id in &ids[skip..] {
                let manifest = mirror.load_manifest(id)?;
                println!(
                    "  {}  {}  {} files  {}  {}",
                    id.yellow(),
                    manifest.created_at.format("%Y-%m-%d %H:%M:%S"),
                    manifest.file_count(),
                    format_bytes(manifest.total_size()),
                    manifest.hostname.dimmed()
                );
            }
            Ok(OperationStatus::Success)
        }
        Commands::Show { mirror, manifest, json } => {
            let mirror = open_mirror(&mirror)?;
            let manifest = mirror.load_manifest(&manifest)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&manifest)?);
                return Ok(OperationStatus::Success);
            }

            println!("{} {}", "Snapshot".blue().bold(), manifest.id.yellow().bold());
            println!("  Created: {}", manifest.created_at.to_rfc3339());
            println!("  Host: {}", manifest.hostname);
            println!("  Source: {}", manifest.source.display());
            if let Some(prev) = &manifest.predecessor {
                println!("  Predecessor: {}", prev);
            }
            println!();
            for entry in &manifest.entries {
                let (tag, detail) = match &entry.kind {
                    EntryKind::File { digest } => ("f".normal(), format!("{:>10}  {}", format_bytes(entry.size), digest.short())),
                    EntryKind::Directory => ("d".blue(), String::new()),
                    EntryKind::Symlink { target } => ("l".cyan(), format!("-> {}", target.display())),
                };
                println!("{} {:o} {}  {}", tag, entry.permissions, entry.path.display(), detail.dimmed());
            }
            Ok(OperationStatus::Success)
        }
        Commands::Diff { mirror, from, to } => {
            let mirror = open_mirror(&mirror)?;
            let diff = mirror.diff(&from, &to)?;
            println!("{} {} -> {}", "Diff".blue().bold(), diff.from_id.yellow(), diff.to_id.yellow());
            for entry in &diff.added {
                println!("  {} {}", "+".green(), entry.path.display());
            }
            for (_, entry) in &diff.modified {
                println!("  {} {}", "~".yellow(), entry.path.display());
            }
            for entry in &diff.removed {
                println!("  {} {}", "-".red(), entry.path.display());
            }
            let stats = &diff.stats;
            println!(
                "\n  {} added, {} modified, {} removed ({:+} bytes)",
                stats.entries_added, stats.entries_modified, stats.entries_removed,
                stats.net_size_change()
            );
            Ok(OperationStatus::Success)
        }
        Commands::Verify { mirror, deep } => {
            let mirror = open_mirror(&mirror)?;
            let report = mirror.verify(deep)?;
            print_verify(&report);
            Ok(report.status())
        }
        Commands::VerifyRemote { remote, deep } => {
            let transport = LocalDirTransport::new(&remote)
                .with_context(|| format!("cannot use {} as a remote", remote.display()))?;
            let report = verify_remote(&transport, deep)?;
            print_verify(&report);
            Ok(report.status())
        }
        Commands::Cleanup { mirror } => {
            let mirror = open_mirror(&mirror)?;
            let removed = mirror.cleanup()?;
            let stats = mirror.stats()?;
            println!("{} Removed {} temporary files", "✓".green().bold(), removed);
            println!(
                "  Store: {} objects, {}",
                stats.object_count.to_string().cyan(),
                format_bytes(stats.total_bytes).cyan()
            );
            Ok(OperationStatus::Success)
        }
    }
}

fn retry_policy(retries: u32, backoff: Duration) -> RetryPolicy {
    RetryPolicy {
        max_attempts: retries.max(1),
        initial_backoff: backoff,
        ..RetryPolicy::default()
    }
}

fn open_mirror(path: &Path) -> anyhow::Result<Mirror> {
    Ok(Mirror::open(path)?)
}

fn progress_bar(show: bool) -> anyhow::Result<Option<ProgressBar>> {
    if !show {
        return Ok(None);
    }
    let pb = ProgressBar::new(0);
    pb.set_style(ProgressStyle::with_template(
        "{spinner:.green} {msg:20} [{bar:30.cyan/blue}] {pos}/{len}",
    )?);
    Ok(Some(pb))
}

fn progress_callback(pb: &ProgressBar) -> ProgressCallback {
    let pb = pb.clone();
    Arc::new(move |info: ProgressInfo| {
        if let Some(total) = info.total {
            pb.set_length(total as u64);
        }
        pb.set_position(info.processed as u64);
        pb.set_message(info.operation);
    })
}

fn finish(bar: Option<ProgressBar>) {
    if let Some(pb) = bar {
        pb.finish_and_clear();
    }
}

fn millis(ms: u64) -> String {
    format_duration(Duration::from_millis(ms)).to_string()
}

fn print_failures(failures: &[EntryFailure]) {
    const SHOWN: usize = 20;
    if failures.is_empty() {
        return;
    }
    println!("\n{} {}", "Failures:".red().bold(), failures.len());
    for failure in failures.iter().take(SHOWN) {
        println!("  {} {:?}: {}", failure.path.display(), failure.kind, failure.message.dimmed());
    }
    if failures.len() > SHOWN {
        println!("  ... and {} more", failures.len() - SHOWN);
    }
}

fn print_verify(report: &VerifyReport) {
    let mode = if report.deep { "deep" } else { "standard" };
    if report.is_valid() {
        println!("{} Verified ({})", "✓".green().bold(), mode);
    } else {
        println!("{} Problems found ({})", "✗".red().bold(), mode);
    }
    println!("  Manifests: {}", report.manifests_checked.to_string().cyan());
    println!("  Objects: {}", report.objects_checked.to_string().cyan());
    for missing in &report.missing_objects {
        println!(
            "  {} {} in {}: {}",
            "missing".red(),
            missing.path.display(),
            missing.manifest_id,
            missing.digest.short()
        );
    }
    for digest in &report.corrupt_objects {
        println!("  {} object {}", "corrupt".red(), digest);
    }
    for id in &report.corrupt_manifests {
        println!("  {} manifest {}", "corrupt".red(), id);
    }
}
