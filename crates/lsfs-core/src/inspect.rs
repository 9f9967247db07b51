//! Image inspector.
//!
//! Read-only dumps of the superblock, checkpoint headers, inode map,
//! segment summaries, and individual inode records.

use lsfs_block::{BlockDevice, ByteBlockDevice, FileByteDevice};
use lsfs_error::{LsfsError, Result};
use lsfs_imap::InodeMap;
use lsfs_ondisk::{
    format_uuid, inode_record_in_block, CheckpointHeader, ImapEntry, SegmentSummary, Superblock,
};
use lsfs_segment::SegmentTable;
use lsfs_types::{BlockNumber, InodeNumber, SUPERBLOCK_BLOCK};
use serde::Serialize;
use std::path::Path;

/// How many inode-map entries a dump includes verbatim.
const IMAP_SAMPLE: usize = 32;

#[derive(Debug, Clone, Serialize)]
pub struct CheckpointInfo {
    pub region: u32,
    pub valid: bool,
    pub header: Option<CheckpointHeader>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SegmentInfo {
    pub segment_id: u32,
    pub state: String,
    pub live_blocks: u32,
    pub timestamp: u64,
    /// Summary block count, when the summary decodes.
    pub summary_blocks: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct InspectReport {
    pub superblock: Superblock,
    pub uuid: String,
    pub checkpoints: Vec<CheckpointInfo>,
    pub imap_entries: u32,
    pub imap_sample: Vec<ImapEntry>,
    pub segments: Vec<SegmentInfo>,
}

/// Inode record dump, with the raw symlink area rendered printable.
#[derive(Debug, Clone, Serialize)]
pub struct InodeReport {
    pub ino: u32,
    pub location: u64,
    pub version: u32,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub blocks: u64,
    pub nlink: u32,
    pub flags: u32,
    pub atime: u64,
    pub mtime: u64,
    pub ctime: u64,
    pub generation: u64,
    pub direct: Vec<u64>,
    pub indirect: u64,
    pub double_indirect: u64,
    pub symlink: String,
}

fn open_image(path: &Path) -> Result<ByteBlockDevice<FileByteDevice>> {
    let file = FileByteDevice::open_read_only(path)?;
    ByteBlockDevice::new(file, lsfs_types::BLOCK_SIZE as u32)
}

fn load_superblock(dev: &dyn BlockDevice) -> Result<Superblock> {
    Ok(Superblock::parse_from_block(
        &dev.read_block(BlockNumber(SUPERBLOCK_BLOCK))?,
    )?)
}

/// Dump the image's metadata structures.
pub fn inspect_image(path: impl AsRef<Path>) -> Result<InspectReport> {
    let dev = open_image(path.as_ref())?;
    let sb = load_superblock(&dev)?;
    let geometry = sb.geometry();

    let mut checkpoints = Vec::with_capacity(2);
    let mut best: Option<(CheckpointHeader, u32)> = None;
    for region in 0..2_u32 {
        let raw = dev.read_block(sb.checkpoint_start(region))?;
        match CheckpointHeader::parse_from_block(&raw) {
            Ok(header) => {
                let valid = header.is_valid(&raw);
                if valid && best.map_or(true, |(b, _)| header.sequence > b.sequence) {
                    best = Some((header, region));
                }
                checkpoints.push(CheckpointInfo {
                    region,
                    valid,
                    header: Some(header),
                });
            }
            Err(_) => checkpoints.push(CheckpointInfo {
                region,
                valid: false,
                header: None,
            }),
        }
    }

    let (imap_entries, imap_sample) = match best {
        Some((header, region)) => {
            let imap = InodeMap::new();
            imap.load_from(
                &dev,
                BlockNumber(sb.checkpoint_start(region).0 + 1),
                header.imap_entries,
            )?;
            let mut sample = imap.snapshot();
            sample.truncate(IMAP_SAMPLE);
            (header.imap_entries, sample)
        }
        None => (0, Vec::new()),
    };

    let table = SegmentTable::load_from(&dev, geometry)?;
    let mut segments = Vec::new();
    for entry in table.snapshot() {
        let summary_blocks = dev
            .read_block(geometry.segment_start(entry.segment_id))
            .ok()
            .and_then(|raw| SegmentSummary::parse_from_block(&raw).ok())
            .map(|summary| summary.header.block_count);
        segments.push(SegmentInfo {
            segment_id: entry.segment_id.0,
            state: format!("{:?}", entry.state).to_lowercase(),
            live_blocks: entry.live_blocks,
            timestamp: entry.timestamp,
            summary_blocks,
        });
    }

    Ok(InspectReport {
        uuid: format_uuid(&sb.uuid),
        superblock: sb,
        checkpoints,
        imap_entries,
        imap_sample,
        segments,
    })
}

/// Dump one inode record, resolved through the newest checkpoint's map.
pub fn inspect_inode(path: impl AsRef<Path>, ino: u32) -> Result<InodeReport> {
    let dev = open_image(path.as_ref())?;
    let sb = load_superblock(&dev)?;

    let mut best: Option<(CheckpointHeader, u32)> = None;
    for region in 0..2_u32 {
        let raw = dev.read_block(sb.checkpoint_start(region))?;
        if let Ok(header) = CheckpointHeader::parse_from_block(&raw) {
            if header.is_valid(&raw) && best.map_or(true, |(b, _)| header.sequence > b.sequence) {
                best = Some((header, region));
            }
        }
    }
    let (header, region) = best.ok_or_else(|| LsfsError::Corruption {
        block: sb.checkpoint_region[0],
        detail: "no valid checkpoint".into(),
    })?;

    let imap = InodeMap::new();
    imap.load_from(
        &dev,
        BlockNumber(sb.checkpoint_start(region).0 + 1),
        header.imap_entries,
    )?;
    let ino = InodeNumber(ino);
    let Some((location, version)) = imap.get(ino) else {
        return Err(LsfsError::NoEntry(format!("inode {ino}")));
    };

    let block = dev.read_block(location)?;
    let record = inode_record_in_block(&block, ino)?;

    let symlink_len = record
        .symlink
        .iter()
        .position(|b| *b == 0)
        .unwrap_or(record.symlink.len());
    Ok(InodeReport {
        ino: ino.0,
        location: location.0,
        version,
        mode: record.mode,
        uid: record.uid,
        gid: record.gid,
        size: record.size,
        blocks: record.blocks,
        nlink: record.nlink,
        flags: record.flags,
        atime: record.atime,
        mtime: record.mtime,
        ctime: record.ctime,
        generation: record.generation,
        direct: record.direct.to_vec(),
        indirect: record.indirect,
        double_indirect: record.double_indirect,
        symlink: String::from_utf8_lossy(&record.symlink[..symlink_len]).into_owned(),
    })
}
