//! Image formatter.
//!
//! Lays down a fresh image: superblock, a seeded segment 0 holding the
//! root inode and its directory block, a complete checkpoint in region 0,
//! and an initialised segment table.

use lsfs_block::{BlockDevice, ByteBlockDevice, FileByteDevice};
use lsfs_error::{LsfsError, Result};
use lsfs_imap::InodeMap;
use lsfs_ondisk::{
    BlockInfo, BlockKind, CheckpointHeader, DiskInode, SegmentHeader, SegmentSummary, Superblock,
    SB_STATE_CLEAN,
};
use lsfs_segment::SegmentTable;
use lsfs_types::{
    now_secs, BlockNumber, FileType, InodeNumber, SegmentId, BLOCK_SIZE, CHECKPOINT0_START,
    CHECKPOINT1_START, CHECKPOINT_MAGIC, INODE_SIZE, LOG_START, LSFS_MAGIC, LSFS_VERSION,
    MAX_SEGMENTS, ROOT_INO, SEGMENT_BLOCKS, SEGMENT_MAGIC, SUPERBLOCK_BLOCK, S_IFDIR,
};
use serde::Serialize;
use std::path::Path;
use tracing::info;

/// Ownership stamped on the seeded root directory.
#[derive(Debug, Clone, Copy, Default)]
pub struct FormatConfig {
    pub uid: u32,
    pub gid: u32,
}

/// What the formatter produced.
#[derive(Debug, Clone, Serialize)]
pub struct FormatReport {
    pub size_bytes: u64,
    pub total_blocks: u64,
    pub total_segments: u64,
    pub uuid: String,
}

/// Create and format an image of `size_mib` MiB at `path`.
pub fn format_image(
    path: impl AsRef<Path>,
    size_mib: u64,
    config: FormatConfig,
) -> Result<FormatReport> {
    let size_bytes = size_mib
        .checked_mul(1024 * 1024)
        .ok_or(LsfsError::InvalidArgument("image size overflows"))?;
    let total_blocks_raw = size_bytes / BLOCK_SIZE as u64;
    if total_blocks_raw <= LOG_START {
        return Err(LsfsError::InvalidArgument(
            "image too small for the fixed regions",
        ));
    }

    let mut total_segments = (total_blocks_raw - LOG_START) / SEGMENT_BLOCKS;
    if total_segments < 4 {
        return Err(LsfsError::InvalidArgument(
            "image too small: at least 4 segments required",
        ));
    }
    total_segments = total_segments.min(MAX_SEGMENTS);
    let total_blocks = LOG_START + total_segments * SEGMENT_BLOCKS;

    let file = FileByteDevice::create(path.as_ref(), size_bytes)?;
    let dev = ByteBlockDevice::new(file, BLOCK_SIZE as u32)?;

    let now = now_secs();
    let uuid = new_uuid();
    let root = InodeNumber(ROOT_INO);

    // Segment 0: summary, root inode record, root directory block.
    let inode_block_addr = BlockNumber(LOG_START + 1);
    let dir_block_addr = BlockNumber(LOG_START + 2);

    let mut root_inode = DiskInode::new(root, S_IFDIR | 0o755);
    root_inode.uid = config.uid;
    root_inode.gid = config.gid;
    root_inode.size = BLOCK_SIZE as u64;
    root_inode.blocks = 1;
    root_inode.atime = now * 1_000_000_000;
    root_inode.mtime = root_inode.atime;
    root_inode.ctime = root_inode.atime;
    root_inode.nlink = 2; // "." plus the self-parent ".."
    root_inode.direct[0] = dir_block_addr.0;
    root_inode.generation = rand::random();

    let mut inode_block = vec![0_u8; BLOCK_SIZE];
    let slot = root.block_offset();
    inode_block[slot..slot + INODE_SIZE].copy_from_slice(&root_inode.to_bytes());

    let dir_block = root_directory_block(root);

    let summary = SegmentSummary {
        header: SegmentHeader {
            magic: SEGMENT_MAGIC,
            segment_id: SegmentId(0),
            timestamp: now,
            block_count: 3,
            checksum: 0,
        },
        entries: vec![
            BlockInfo {
                ino: root,
                offset: 0,
                kind: BlockKind::Inode,
            },
            BlockInfo {
                ino: root,
                offset: 0,
                kind: BlockKind::Dirent,
            },
        ],
    };

    dev.write_block(BlockNumber(LOG_START), &summary.to_block())?;
    dev.write_block(inode_block_addr, &inode_block)?;
    dev.write_block(dir_block_addr, &dir_block)?;

    // Checkpoint region 0: header plus a one-entry inode map.
    let log_head = LOG_START + 3;
    let imap = InodeMap::new();
    imap.set(root, inode_block_addr);
    let imap_entries = imap.save_to(&dev, BlockNumber(CHECKPOINT0_START + 1))?;

    let sb = Superblock {
        magic: LSFS_MAGIC,
        version: LSFS_VERSION,
        block_size: BLOCK_SIZE as u32,
        segment_size: SEGMENT_BLOCKS as u32,
        total_blocks,
        total_segments,
        inode_count: 1,
        checkpoint_region: [CHECKPOINT0_START, CHECKPOINT1_START],
        active_checkpoint: 0,
        log_head,
        free_segments: total_segments - 1,
        uuid,
        created_at: now,
        mounted_at: 0,
        mount_count: 0,
        state: SB_STATE_CLEAN,
    };

    // Segment table: segment 0 full (inode + dirent payload), rest free.
    let table = SegmentTable::new(sb.geometry());
    table.set_full(SegmentId(0), 2, now);
    let segment_entries = table.save_to(&dev)?;

    let header = CheckpointHeader {
        magic: CHECKPOINT_MAGIC,
        version: LSFS_VERSION,
        sequence: 1,
        timestamp: now,
        log_head,
        imap_entries,
        segment_entries,
        checksum: 0,
        complete: 1,
    };
    dev.write_block(BlockNumber(CHECKPOINT0_START), &header.to_block())?;

    dev.write_block(BlockNumber(SUPERBLOCK_BLOCK), &sb.to_block())?;
    dev.sync()?;

    let report = FormatReport {
        size_bytes,
        total_blocks,
        total_segments,
        uuid: lsfs_ondisk::format_uuid(&uuid),
    };
    info!(
        target: "lsfs::format",
        path = %path.as_ref().display(),
        blocks = total_blocks,
        segments = total_segments,
        uuid = %report.uuid,
        "formatted image"
    );
    Ok(report)
}

fn root_directory_block(root: InodeNumber) -> Vec<u8> {
    let mut block = vec![0_u8; BLOCK_SIZE];
    let dot = lsfs_ondisk::Dirent {
        ino: root,
        rec_len: lsfs_ondisk::dirent_record_size(1) as u16,
        file_type: FileType::Directory,
        name: b".".to_vec(),
    };
    dot.encode_at(&mut block, 0);

    let dotdot = lsfs_ondisk::Dirent {
        ino: root,
        rec_len: (BLOCK_SIZE - lsfs_ondisk::dirent_record_size(1)) as u16,
        file_type: FileType::Directory,
        name: b"..".to_vec(),
    };
    dotdot.encode_at(&mut block, lsfs_ondisk::dirent_record_size(1));
    block
}

/// Random RFC-4122 style version-4 UUID.
fn new_uuid() -> [u8; 16] {
    let mut uuid: [u8; 16] = rand::random();
    uuid[6] = (uuid[6] & 0x0F) | 0x40;
    uuid[8] = (uuid[8] & 0x3F) | 0x80;
    uuid
}
