#![forbid(unsafe_code)]

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use lsfs_core::check::check_image;
use lsfs_core::format::{format_image, FormatConfig};
use lsfs_core::inspect::{inspect_image, inspect_inode};
use lsfs_core::{Lsfs, MountConfig};
use lsfs_fuse::MountOptions;
use std::path::PathBuf;
use tracing::info;

// ── CLI definition ──────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "lsfs", about = "LSFS — log-structured filesystem toolkit")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a fresh LSFS image.
    Format {
        /// Path of the image file to create.
        image: PathBuf,
        /// Image size in MiB (at least 21 for the minimum 4 segments).
        #[arg(long, default_value_t = 64)]
        size_mib: u64,
        /// Output in JSON format.
        #[arg(long)]
        json: bool,
    },
    /// Mount an image via FUSE and serve until unmounted.
    Mount {
        /// Path to the image file.
        image: PathBuf,
        /// Mountpoint directory.
        mountpoint: PathBuf,
        /// Mount read-only.
        #[arg(long)]
        read_only: bool,
        /// Allow other users to access the mount.
        #[arg(long)]
        allow_other: bool,
        /// Unmount automatically when the process exits.
        #[arg(long)]
        auto_unmount: bool,
    },
    /// Validate an image, optionally repairing what can be repaired.
    Check {
        /// Path to the image file.
        image: PathBuf,
        /// Fix free-count mismatches and a corrupt active checkpoint.
        #[arg(long)]
        repair: bool,
        /// Output in JSON format.
        #[arg(long)]
        json: bool,
    },
    /// Dump image metadata: superblock, checkpoints, inode map, segments.
    Inspect {
        /// Path to the image file.
        image: PathBuf,
        /// Dump a single inode record instead of the overview.
        #[arg(long)]
        inode: Option<u32>,
        /// Output in JSON format.
        #[arg(long)]
        json: bool,
    },
}

// ── Main ────────────────────────────────────────────────────────────────────

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Format {
            image,
            size_mib,
            json,
        } => format_cmd(&image, size_mib, json),
        Command::Mount {
            image,
            mountpoint,
            read_only,
            allow_other,
            auto_unmount,
        } => mount_cmd(&image, &mountpoint, read_only, allow_other, auto_unmount),
        Command::Check {
            image,
            repair,
            json,
        } => check_cmd(&image, repair, json),
        Command::Inspect { image, inode, json } => inspect_cmd(&image, inode, json),
    }
}

fn format_cmd(image: &PathBuf, size_mib: u64, json: bool) -> Result<()> {
    let report = format_image(image, size_mib, FormatConfig::default())
        .with_context(|| format!("failed to format {}", image.display()))?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("serialize report")?
        );
    } else {
        println!("Created LSFS image {}", image.display());
        println!("  Size: {} MiB", report.size_bytes / (1024 * 1024));
        println!("  Blocks: {}", report.total_blocks);
        println!("  Segments: {}", report.total_segments);
        println!("  UUID: {}", report.uuid);
    }
    Ok(())
}

fn mount_cmd(
    image: &PathBuf,
    mountpoint: &PathBuf,
    read_only: bool,
    allow_other: bool,
    auto_unmount: bool,
) -> Result<()> {
    let fs = Lsfs::mount(
        image,
        MountConfig {
            read_only,
            ..MountConfig::default()
        },
    )
    .with_context(|| format!("failed to mount {}", image.display()))?;

    let recovery = fs.recovery();
    info!(
        sequence = recovery.new_sequence,
        replayed = recovery.replayed_segments,
        "filesystem recovered"
    );

    lsfs_fuse::mount(
        fs,
        mountpoint,
        &MountOptions {
            read_only,
            allow_other,
            auto_unmount,
        },
    )
    .with_context(|| format!("FUSE session on {} failed", mountpoint.display()))?;
    Ok(())
}

fn check_cmd(image: &PathBuf, repair: bool, json: bool) -> Result<()> {
    let report = check_image(image, repair)
        .with_context(|| format!("failed to check {}", image.display()))?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("serialize report")?
        );
    } else {
        println!("Checking LSFS image {}", image.display());
        println!("  Valid segments: {}", report.valid_segments);
        println!("  Free segments: {}", report.free_segments);
        println!("  Inode map entries: {}", report.imap_entries);
        for warning in &report.warnings {
            println!("  WARNING: {warning}");
        }
        for repair in &report.repairs {
            println!("  REPAIRED: {repair}");
        }
        for error in &report.errors {
            println!("  ERROR: {error}");
        }
        println!(
            "Filesystem check complete: {} errors, {} warnings",
            report.errors.len(),
            report.warnings.len()
        );
    }

    if !report.passed() {
        bail!("filesystem check failed");
    }
    Ok(())
}

fn inspect_cmd(image: &PathBuf, inode: Option<u32>, json: bool) -> Result<()> {
    if let Some(ino) = inode {
        let report = inspect_inode(image, ino)
            .with_context(|| format!("failed to inspect inode {ino} in {}", image.display()))?;
        if json {
            println!(
                "{}",
                serde_json::to_string_pretty(&report).context("serialize report")?
            );
        } else {
            println!("Inode {} @ block {}", report.ino, report.location);
            println!("  Mode: 0o{:o}  uid/gid: {}/{}", report.mode, report.uid, report.gid);
            println!("  Size: {} bytes in {} blocks", report.size, report.blocks);
            println!("  Links: {}  version: {}", report.nlink, report.version);
            println!("  Generation: {:#x}", report.generation);
            println!("  Direct: {:?}", report.direct);
            println!(
                "  Indirect: {}  double: {}",
                report.indirect, report.double_indirect
            );
            if !report.symlink.is_empty() {
                println!("  Symlink target: {}", report.symlink);
            }
        }
        return Ok(());
    }

    let report =
        inspect_image(image).with_context(|| format!("failed to inspect {}", image.display()))?;
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("serialize report")?
        );
    } else {
        let sb = &report.superblock;
        println!("LSFS image {}", image.display());
        println!("  UUID: {}", report.uuid);
        println!("  Blocks: {}  segments: {}", sb.total_blocks, sb.total_segments);
        println!("  Inodes: {}  free segments: {}", sb.inode_count, sb.free_segments);
        println!(
            "  Log head: {}  active checkpoint: {}  state: {}",
            sb.log_head,
            sb.active_checkpoint,
            if sb.state == 0 { "clean" } else { "dirty" }
        );
        for cp in &report.checkpoints {
            match (&cp.header, cp.valid) {
                (Some(header), true) => println!(
                    "  Checkpoint {}: sequence {} (log head {}, {} imap entries)",
                    cp.region, header.sequence, header.log_head, header.imap_entries
                ),
                (Some(header), false) => println!(
                    "  Checkpoint {}: INVALID (sequence {}, complete {})",
                    cp.region, header.sequence, header.complete
                ),
                (None, _) => println!("  Checkpoint {}: unreadable", cp.region),
            }
        }
        println!("  Inode map: {} entries", report.imap_entries);
        for entry in &report.imap_sample {
            println!(
                "    ino {} -> block {} (v{})",
                entry.ino, entry.location, entry.version
            );
        }
        for segment in &report.segments {
            if segment.state != "free" {
                println!(
                    "  Segment {}: {} live {} ts {}",
                    segment.segment_id, segment.state, segment.live_blocks, segment.timestamp
                );
            }
        }
    }
    Ok(())
}
