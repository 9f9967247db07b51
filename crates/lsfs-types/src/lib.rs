#![forbid(unsafe_code)]
//! Core types for LSFS.
//!
//! Newtypes for block/inode/segment identifiers, the on-disk layout
//! constants, little-endian read helpers, and the log geometry math shared
//! by every other crate in the workspace.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

// ── On-disk constants ───────────────────────────────────────────────────────

/// Superblock magic ("LSFS").
pub const LSFS_MAGIC: u32 = 0x4C53_4653;
/// Segment summary magic ("SEGM").
pub const SEGMENT_MAGIC: u32 = 0x5345_474D;
/// Checkpoint header magic ("CHKP").
pub const CHECKPOINT_MAGIC: u32 = 0x4348_4B50;

/// On-disk format version.
pub const LSFS_VERSION: u32 = 1;

/// Fixed block size in bytes.
pub const BLOCK_SIZE: usize = 4096;
/// Blocks per segment (4 MiB segments).
pub const SEGMENT_BLOCKS: u64 = 1024;
/// Upper bound on segments per image (1 GiB of log).
pub const MAX_SEGMENTS: u64 = 256;
/// Upper bound on inode numbers.
pub const MAX_INODES: u32 = 65536;

/// Block address of the superblock.
pub const SUPERBLOCK_BLOCK: u64 = 0;
/// First block of checkpoint region 0.
pub const CHECKPOINT0_START: u64 = 1;
/// First block of checkpoint region 1.
pub const CHECKPOINT1_START: u64 = 257;
/// Blocks per checkpoint region.
pub const CHECKPOINT_REGION_BLOCKS: u64 = 256;
/// First block of the segment table region.
pub const SEGTABLE_START: u64 = 513;
/// Blocks in the segment table region.
pub const SEGTABLE_BLOCKS: u64 = 512;
/// First block of the log.
pub const LOG_START: u64 = 1025;

/// Inode number of the root directory.
pub const ROOT_INO: u32 = 1;
/// Direct block pointers per inode.
pub const DIRECT_BLOCKS: usize = 12;
/// Maximum inline symlink target length.
pub const SYMLINK_INLINE_MAX: usize = 64;
/// Maximum file name length.
pub const NAME_MAX: usize = 255;

/// Size of one on-disk inode record.
pub const INODE_SIZE: usize = 256;
/// Inode records per block.
pub const INODES_PER_BLOCK: u32 = (BLOCK_SIZE / INODE_SIZE) as u32;
/// Block pointers per indirect block.
pub const POINTERS_PER_BLOCK: u64 = (BLOCK_SIZE / 8) as u64;

/// Highest file block index addressable through the inode's pointer tree.
pub const MAX_FILE_BLOCKS: u64 =
    DIRECT_BLOCKS as u64 + POINTERS_PER_BLOCK + POINTERS_PER_BLOCK * POINTERS_PER_BLOCK;

// ── Identifier newtypes ─────────────────────────────────────────────────────

/// Absolute block address within the backing image.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct BlockNumber(pub u64);

/// Inode number. Zero is never a valid inode; dirents use it for tombstones.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct InodeNumber(pub u32);

/// Segment index within the log.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct SegmentId(pub u32);

impl InodeNumber {
    pub const ROOT: Self = Self(ROOT_INO);

    #[must_use]
    pub fn is_valid(self) -> bool {
        self.0 != 0 && self.0 < MAX_INODES
    }

    /// Record slot within the inode's containing block.
    #[must_use]
    pub fn block_slot(self) -> u32 {
        self.0 % INODES_PER_BLOCK
    }

    /// Byte offset of this inode's record within its containing block.
    #[must_use]
    pub fn block_offset(self) -> usize {
        self.block_slot() as usize * INODE_SIZE
    }
}

impl fmt::Display for BlockNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for InodeNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── File types & modes ──────────────────────────────────────────────────────

/// File type mask (upper bits of mode).
pub const S_IFMT: u32 = 0o170_000;
/// Named pipe (FIFO).
pub const S_IFIFO: u32 = 0o010_000;
/// Character device.
pub const S_IFCHR: u32 = 0o020_000;
/// Directory.
pub const S_IFDIR: u32 = 0o040_000;
/// Block device.
pub const S_IFBLK: u32 = 0o060_000;
/// Regular file.
pub const S_IFREG: u32 = 0o100_000;
/// Symbolic link.
pub const S_IFLNK: u32 = 0o120_000;
/// Socket.
pub const S_IFSOCK: u32 = 0o140_000;

/// Directory entry file type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum FileType {
    Unknown = 0,
    RegularFile = 1,
    Directory = 2,
    CharDevice = 3,
    BlockDevice = 4,
    Fifo = 5,
    Socket = 6,
    Symlink = 7,
}

impl FileType {
    #[must_use]
    pub fn from_code(code: u8) -> Self {
        match code {
            1 => Self::RegularFile,
            2 => Self::Directory,
            3 => Self::CharDevice,
            4 => Self::BlockDevice,
            5 => Self::Fifo,
            6 => Self::Socket,
            7 => Self::Symlink,
            _ => Self::Unknown,
        }
    }

    #[must_use]
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Derive the dirent type code from an inode mode.
    #[must_use]
    pub fn from_mode(mode: u32) -> Self {
        match mode & S_IFMT {
            S_IFREG => Self::RegularFile,
            S_IFDIR => Self::Directory,
            S_IFCHR => Self::CharDevice,
            S_IFBLK => Self::BlockDevice,
            S_IFIFO => Self::Fifo,
            S_IFSOCK => Self::Socket,
            S_IFLNK => Self::Symlink,
            _ => Self::Unknown,
        }
    }
}

/// Inode flag: inode has been deleted and awaits reclamation.
pub const INODE_FLAG_DELETED: u32 = 1 << 0;

// ── Log geometry ────────────────────────────────────────────────────────────

/// Log geometry derived from superblock fields.
///
/// All segment/block address math goes through this so that region offsets
/// are computed in one place rather than re-derived per component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Geometry {
    pub block_size: u32,
    pub segment_blocks: u64,
    pub total_blocks: u64,
    pub total_segments: u64,
    pub log_start: u64,
}

impl Geometry {
    /// Absolute block address of a segment's first block (the summary).
    #[must_use]
    pub fn segment_start(&self, segment: SegmentId) -> BlockNumber {
        BlockNumber(self.log_start + u64::from(segment.0) * self.segment_blocks)
    }

    /// Absolute block address of a slot within a segment.
    #[must_use]
    pub fn segment_block(&self, segment: SegmentId, slot: u32) -> BlockNumber {
        BlockNumber(self.segment_start(segment).0 + u64::from(slot))
    }

    /// Map an absolute block address back to `(segment, slot)`.
    ///
    /// Returns `None` for addresses outside the log region.
    #[must_use]
    pub fn block_to_segment(&self, block: BlockNumber) -> Option<(SegmentId, u32)> {
        if block.0 < self.log_start {
            return None;
        }
        let log_block = block.0 - self.log_start;
        let segment = log_block / self.segment_blocks;
        if segment >= self.total_segments {
            return None;
        }
        #[allow(clippy::cast_possible_truncation)]
        Some((
            SegmentId(segment as u32),
            (log_block % self.segment_blocks) as u32,
        ))
    }

    /// First block past the end of the log.
    #[must_use]
    pub fn log_end(&self) -> BlockNumber {
        BlockNumber(self.log_start + self.total_segments * self.segment_blocks)
    }

    /// True when `block` lies inside the log region.
    #[must_use]
    pub fn in_log(&self, block: BlockNumber) -> bool {
        block.0 >= self.log_start && block.0 < self.log_end().0
    }
}

// ── Arithmetic helpers ──────────────────────────────────────────────────────

/// Round `value` up to the nearest multiple of `alignment` (a power of two).
#[must_use]
pub fn align_up(value: usize, alignment: usize) -> usize {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

/// Number of blocks needed to hold `size` bytes.
#[must_use]
pub fn blocks_for_size(size: u64) -> u64 {
    size.div_ceil(BLOCK_SIZE as u64)
}

// ── Time ────────────────────────────────────────────────────────────────────

/// Seconds since the Unix epoch.
#[must_use]
pub fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Nanoseconds since the Unix epoch (inode timestamp resolution).
#[must_use]
pub fn now_nanos() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

// ── Parse errors & LE read helpers ──────────────────────────────────────────

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid magic: expected {expected:#x}, got {actual:#x}")]
    InvalidMagic { expected: u32, actual: u32 },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
}

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
pub fn read_le_u16(data: &[u8], offset: usize) -> Result<u16, ParseError> {
    let bytes = ensure_slice(data, offset, 2)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_le_u64(data: &[u8], offset: usize) -> Result<u64, ParseError> {
    let bytes = ensure_slice(data, offset, 8)?;
    Ok(u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]))
}

#[inline]
pub fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N], ParseError> {
    let bytes = ensure_slice(data, offset, N)?;
    let mut out = [0_u8; N];
    out.copy_from_slice(bytes);
    Ok(out)
}
