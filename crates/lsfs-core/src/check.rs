//! Image checker.
//!
//! Validates the superblock, both checkpoint headers, segment summaries and
//! free-segment accounting, inode-map location invariants, and the root
//! directory. With repair enabled it fixes free-count mismatches and
//! switches away from a corrupt active checkpoint.

use lsfs_block::{BlockDevice, ByteBlockDevice, FileByteDevice};
use lsfs_error::Result;
use lsfs_imap::InodeMap;
use lsfs_ondisk::{inode_record_in_block, CheckpointHeader, SegmentSummary, Superblock};
use lsfs_segment::SegmentTable;
use lsfs_types::{BlockNumber, InodeNumber, ROOT_INO, SUPERBLOCK_BLOCK};
use serde::Serialize;
use std::path::Path;
use tracing::info;

/// Findings of one checker run.
#[derive(Debug, Default, Clone, Serialize)]
pub struct CheckReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub repairs: Vec<String>,
    pub valid_segments: u32,
    pub free_segments: u32,
    pub imap_entries: u32,
}

impl CheckReport {
    #[must_use]
    pub fn passed(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Validate the image at `path`; with `repair`, fix what can be fixed.
pub fn check_image(path: impl AsRef<Path>, repair: bool) -> Result<CheckReport> {
    let file = if repair {
        FileByteDevice::open(path.as_ref())?
    } else {
        FileByteDevice::open_read_only(path.as_ref())?
    };
    let dev = ByteBlockDevice::new(file, lsfs_types::BLOCK_SIZE as u32)?;
    let mut report = CheckReport::default();

    // Superblock.
    let mut sb = match Superblock::parse_from_block(&dev.read_block(BlockNumber(SUPERBLOCK_BLOCK))?)
    {
        Ok(sb) => sb,
        Err(err) => {
            report.errors.push(format!("superblock invalid: {err}"));
            return Ok(report);
        }
    };
    if sb.total_blocks > dev.block_count() {
        report.errors.push(format!(
            "superblock claims {} blocks, image holds {}",
            sb.total_blocks,
            dev.block_count()
        ));
        return Ok(report);
    }
    let geometry = sb.geometry();
    let mut sb_dirty = false;

    // Checkpoint headers.
    let mut headers: [Option<CheckpointHeader>; 2] = [None, None];
    for region in 0..2_u32 {
        let raw = dev.read_block(sb.checkpoint_start(region))?;
        match CheckpointHeader::parse_from_block(&raw) {
            Ok(header) if header.is_valid(&raw) => headers[region as usize] = Some(header),
            Ok(header) if header.complete != 1 => {
                report
                    .warnings
                    .push(format!("checkpoint region {region} is incomplete"));
            }
            Ok(_) => {
                report
                    .warnings
                    .push(format!("checkpoint region {region} fails its checksum"));
            }
            Err(err) => {
                report
                    .warnings
                    .push(format!("checkpoint region {region} unreadable: {err}"));
            }
        }
    }

    let best = match (headers[0], headers[1]) {
        (Some(a), Some(b)) => Some(if a.sequence >= b.sequence { (a, 0) } else { (b, 1) }),
        (Some(a), None) => Some((a, 0_u32)),
        (None, Some(b)) => Some((b, 1)),
        (None, None) => {
            report.errors.push("no valid checkpoint in either region".into());
            None
        }
    };

    if let Some((_, region)) = best {
        if headers[sb.active_checkpoint as usize].is_none() {
            report.errors.push(format!(
                "active checkpoint region {} is invalid",
                sb.active_checkpoint
            ));
            if repair {
                sb.active_checkpoint = region;
                sb_dirty = true;
                report
                    .repairs
                    .push(format!("switched active checkpoint to region {region}"));
            }
        }
    }

    // Segment summaries and free accounting.
    let table = SegmentTable::load_from(&dev, geometry)?;
    let mut free = 0_u32;
    for entry in table.snapshot() {
        match entry.state {
            lsfs_ondisk::SegmentState::Free => free += 1,
            lsfs_ondisk::SegmentState::Full => {
                let raw = dev.read_block(geometry.segment_start(entry.segment_id))?;
                match SegmentSummary::parse_from_block(&raw) {
                    Ok(summary) if SegmentSummary::checksum_ok(&raw, &summary.header) => {
                        report.valid_segments += 1;
                        if summary.header.segment_id != entry.segment_id {
                            report.errors.push(format!(
                                "segment {} summary names segment {}",
                                entry.segment_id, summary.header.segment_id
                            ));
                        }
                        if entry.live_blocks > summary.header.block_count.saturating_sub(1) {
                            report.warnings.push(format!(
                                "segment {} live count {} exceeds payload {}",
                                entry.segment_id,
                                entry.live_blocks,
                                summary.header.block_count.saturating_sub(1)
                            ));
                        }
                    }
                    _ => {
                        report.warnings.push(format!(
                            "full segment {} has an invalid summary",
                            entry.segment_id
                        ));
                    }
                }
            }
            _ => {}
        }
    }
    report.free_segments = free;

    if u64::from(free) != sb.free_segments {
        report.warnings.push(format!(
            "superblock free-segment count {} disagrees with table {}",
            sb.free_segments, free
        ));
        if repair {
            sb.free_segments = u64::from(free);
            sb_dirty = true;
            report
                .repairs
                .push(format!("updated free-segment count to {free}"));
        }
    }

    // Inode map invariants.
    if let Some((header, region)) = best {
        let imap = InodeMap::new();
        match imap.load_from(
            &dev,
            BlockNumber(sb.checkpoint_start(region).0 + 1),
            header.imap_entries,
        ) {
            Ok(()) => {
                report.imap_entries = header.imap_entries;
                for entry in imap.snapshot() {
                    if !geometry.in_log(entry.location) {
                        report.errors.push(format!(
                            "inode {} maps outside the log (block {})",
                            entry.ino, entry.location
                        ));
                        continue;
                    }
                    let block = dev.read_block(entry.location)?;
                    match inode_record_in_block(&block, entry.ino) {
                        Ok(record) if record.ino == entry.ino => {}
                        Ok(record) => report.errors.push(format!(
                            "inode {} slot holds record for inode {}",
                            entry.ino, record.ino
                        )),
                        Err(err) => report
                            .errors
                            .push(format!("inode {} record unreadable: {err}", entry.ino)),
                    }
                }

                // Root reachability.
                match imap.get(InodeNumber(ROOT_INO)) {
                    None => report.errors.push("root inode is not mapped".into()),
                    Some((location, _)) => {
                        let block = dev.read_block(location)?;
                        match inode_record_in_block(&block, InodeNumber(ROOT_INO)) {
                            Ok(root) if root.is_dir() => {
                                if root.nlink < 2 {
                                    report.warnings.push(format!(
                                        "root link count {} below 2",
                                        root.nlink
                                    ));
                                }
                            }
                            Ok(_) => report.errors.push("root inode is not a directory".into()),
                            Err(err) => {
                                report.errors.push(format!("root inode unreadable: {err}"));
                            }
                        }
                    }
                }
            }
            Err(err) => report.errors.push(format!("inode map unreadable: {err}")),
        }

        // The chosen checkpoint's log head must sit inside or at the end of
        // the log.
        if header.log_head < geometry.log_start || header.log_head > geometry.log_end().0 {
            report
                .errors
                .push(format!("checkpoint log head {} out of range", header.log_head));
        }
    }

    if sb_dirty {
        dev.write_block(BlockNumber(SUPERBLOCK_BLOCK), &sb.to_block())?;
        dev.sync()?;
    }

    info!(
        target: "lsfs::check",
        errors = report.errors.len(),
        warnings = report.warnings.len(),
        repairs = report.repairs.len(),
        "check complete"
    );
    Ok(report)
}
