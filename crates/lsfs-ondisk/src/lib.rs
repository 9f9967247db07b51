#![forbid(unsafe_code)]
//! On-disk structures for the LSFS image format.
//!
//! Everything here is packed little-endian with invariant offsets: the
//! superblock, checkpoint headers, segment summaries, 256-byte inode
//! records, inode map entries, segment usage entries, and directory
//! records. Parsing never trusts length fields without bounds checks, and
//! checkpoint headers and segment summaries carry CRC32C checksums.

use lsfs_types::{
    read_fixed, read_le_u16, read_le_u32, read_le_u64, BlockNumber, FileType, Geometry,
    InodeNumber, ParseError, SegmentId, BLOCK_SIZE, CHECKPOINT0_START, CHECKPOINT1_START,
    CHECKPOINT_MAGIC, DIRECT_BLOCKS, INODE_SIZE, LOG_START, LSFS_MAGIC, LSFS_VERSION, NAME_MAX,
    SEGMENT_MAGIC, SYMLINK_INLINE_MAX,
};
use serde::{Deserialize, Serialize};

// ── Superblock ──────────────────────────────────────────────────────────────

/// In-memory copy of the superblock (block 0).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Superblock {
    pub magic: u32,
    pub version: u32,
    pub block_size: u32,
    /// Segment size in blocks.
    pub segment_size: u32,
    pub total_blocks: u64,
    pub total_segments: u64,
    /// Count of currently allocated inodes.
    pub inode_count: u64,
    /// Block addresses of the two alternating checkpoint regions.
    pub checkpoint_region: [u64; 2],
    /// Which checkpoint region is current (0 or 1).
    pub active_checkpoint: u32,
    /// Next block address at which a segment boundary begins.
    pub log_head: u64,
    pub free_segments: u64,
    pub uuid: [u8; 16],
    pub created_at: u64,
    pub mounted_at: u64,
    pub mount_count: u32,
    /// 0 = cleanly unmounted, 1 = dirty.
    pub state: u32,
}

/// Superblock `state` value for a cleanly unmounted image.
pub const SB_STATE_CLEAN: u32 = 0;
/// Superblock `state` value while mounted.
pub const SB_STATE_DIRTY: u32 = 1;

impl Superblock {
    /// Parse and validate a superblock from its 4 KiB block.
    pub fn parse_from_block(data: &[u8]) -> Result<Self, ParseError> {
        let magic = read_le_u32(data, 0)?;
        if magic != LSFS_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: LSFS_MAGIC,
                actual: magic,
            });
        }
        let version = read_le_u32(data, 4)?;
        if version != LSFS_VERSION {
            return Err(ParseError::InvalidField {
                field: "version",
                reason: "unsupported version",
            });
        }

        let sb = Self {
            magic,
            version,
            block_size: read_le_u32(data, 8)?,
            segment_size: read_le_u32(data, 12)?,
            total_blocks: read_le_u64(data, 16)?,
            total_segments: read_le_u64(data, 24)?,
            inode_count: read_le_u64(data, 32)?,
            checkpoint_region: [read_le_u64(data, 40)?, read_le_u64(data, 48)?],
            active_checkpoint: read_le_u32(data, 56)?,
            log_head: read_le_u64(data, 64)?,
            free_segments: read_le_u64(data, 72)?,
            uuid: read_fixed::<16>(data, 80)?,
            created_at: read_le_u64(data, 96)?,
            mounted_at: read_le_u64(data, 104)?,
            mount_count: read_le_u32(data, 112)?,
            state: read_le_u32(data, 116)?,
        };
        sb.validate_geometry()?;
        Ok(sb)
    }

    fn validate_geometry(&self) -> Result<(), ParseError> {
        if self.block_size as usize != BLOCK_SIZE {
            return Err(ParseError::InvalidField {
                field: "block_size",
                reason: "must be 4096",
            });
        }
        if u64::from(self.segment_size) != lsfs_types::SEGMENT_BLOCKS {
            return Err(ParseError::InvalidField {
                field: "segment_size",
                reason: "must be 1024 blocks",
            });
        }
        if self.total_segments == 0 || self.total_segments > lsfs_types::MAX_SEGMENTS {
            return Err(ParseError::InvalidField {
                field: "total_segments",
                reason: "out of range",
            });
        }
        let log_blocks = self.total_segments * u64::from(self.segment_size);
        if self.total_blocks < LOG_START + log_blocks {
            return Err(ParseError::InvalidField {
                field: "total_blocks",
                reason: "smaller than fixed regions plus log",
            });
        }
        if self.active_checkpoint > 1 {
            return Err(ParseError::InvalidField {
                field: "active_checkpoint",
                reason: "must be 0 or 1",
            });
        }
        if self.checkpoint_region != [CHECKPOINT0_START, CHECKPOINT1_START] {
            return Err(ParseError::InvalidField {
                field: "checkpoint_region",
                reason: "unexpected region addresses",
            });
        }
        Ok(())
    }

    /// Serialize into a zero-padded 4 KiB block.
    #[must_use]
    pub fn to_block(&self) -> Vec<u8> {
        let mut buf = vec![0_u8; BLOCK_SIZE];
        buf[0..4].copy_from_slice(&self.magic.to_le_bytes());
        buf[4..8].copy_from_slice(&self.version.to_le_bytes());
        buf[8..12].copy_from_slice(&self.block_size.to_le_bytes());
        buf[12..16].copy_from_slice(&self.segment_size.to_le_bytes());
        buf[16..24].copy_from_slice(&self.total_blocks.to_le_bytes());
        buf[24..32].copy_from_slice(&self.total_segments.to_le_bytes());
        buf[32..40].copy_from_slice(&self.inode_count.to_le_bytes());
        buf[40..48].copy_from_slice(&self.checkpoint_region[0].to_le_bytes());
        buf[48..56].copy_from_slice(&self.checkpoint_region[1].to_le_bytes());
        buf[56..60].copy_from_slice(&self.active_checkpoint.to_le_bytes());
        buf[64..72].copy_from_slice(&self.log_head.to_le_bytes());
        buf[72..80].copy_from_slice(&self.free_segments.to_le_bytes());
        buf[80..96].copy_from_slice(&self.uuid);
        buf[96..104].copy_from_slice(&self.created_at.to_le_bytes());
        buf[104..112].copy_from_slice(&self.mounted_at.to_le_bytes());
        buf[112..116].copy_from_slice(&self.mount_count.to_le_bytes());
        buf[116..120].copy_from_slice(&self.state.to_le_bytes());
        buf
    }

    /// Log geometry derived from this superblock.
    #[must_use]
    pub fn geometry(&self) -> Geometry {
        Geometry {
            block_size: self.block_size,
            segment_blocks: u64::from(self.segment_size),
            total_blocks: self.total_blocks,
            total_segments: self.total_segments,
            log_start: LOG_START,
        }
    }

    /// Block address of a checkpoint region's header.
    #[must_use]
    pub fn checkpoint_start(&self, region: u32) -> BlockNumber {
        BlockNumber(self.checkpoint_region[usize::from(region != 0)])
    }
}

/// Render a UUID as the usual hex form.
#[must_use]
pub fn format_uuid(uuid: &[u8; 16]) -> String {
    format!(
        "{:02x}{:02x}{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
        uuid[0], uuid[1], uuid[2], uuid[3], uuid[4], uuid[5], uuid[6], uuid[7],
        uuid[8], uuid[9], uuid[10], uuid[11], uuid[12], uuid[13], uuid[14], uuid[15],
    )
}

// ── Checkpoint header ───────────────────────────────────────────────────────

/// Size of the packed checkpoint header.
pub const CHECKPOINT_HEADER_SIZE: usize = 48;

/// Header block of a checkpoint region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointHeader {
    pub magic: u32,
    pub version: u32,
    pub sequence: u64,
    pub timestamp: u64,
    pub log_head: u64,
    pub imap_entries: u32,
    pub segment_entries: u32,
    pub checksum: u32,
    pub complete: u32,
}

impl CheckpointHeader {
    /// Parse from the first bytes of a checkpoint header block.
    ///
    /// Only the magic is checked here; completeness and checksum are
    /// policy for the recovery path, which also wants to inspect stale
    /// headers.
    pub fn parse_from_block(data: &[u8]) -> Result<Self, ParseError> {
        let magic = read_le_u32(data, 0)?;
        if magic != CHECKPOINT_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: CHECKPOINT_MAGIC,
                actual: magic,
            });
        }
        Ok(Self {
            magic,
            version: read_le_u32(data, 4)?,
            sequence: read_le_u64(data, 8)?,
            timestamp: read_le_u64(data, 16)?,
            log_head: read_le_u64(data, 24)?,
            imap_entries: read_le_u32(data, 32)?,
            segment_entries: read_le_u32(data, 36)?,
            checksum: read_le_u32(data, 40)?,
            complete: read_le_u32(data, 44)?,
        })
    }

    /// Serialize into a zero-padded 4 KiB block, stamping the checksum.
    #[must_use]
    pub fn to_block(&self) -> Vec<u8> {
        let mut buf = vec![0_u8; BLOCK_SIZE];
        self.encode_into(&mut buf);
        let checksum = checkpoint_checksum(&buf);
        buf[40..44].copy_from_slice(&checksum.to_le_bytes());
        buf
    }

    fn encode_into(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&self.magic.to_le_bytes());
        buf[4..8].copy_from_slice(&self.version.to_le_bytes());
        buf[8..16].copy_from_slice(&self.sequence.to_le_bytes());
        buf[16..24].copy_from_slice(&self.timestamp.to_le_bytes());
        buf[24..32].copy_from_slice(&self.log_head.to_le_bytes());
        buf[32..36].copy_from_slice(&self.imap_entries.to_le_bytes());
        buf[36..40].copy_from_slice(&self.segment_entries.to_le_bytes());
        buf[40..44].copy_from_slice(&self.checksum.to_le_bytes());
        buf[44..48].copy_from_slice(&self.complete.to_le_bytes());
    }

    /// True when the header is complete and its checksum holds.
    ///
    /// The checksum excludes the `complete` flag, so flipping the flag in
    /// step 5 of the checkpoint protocol does not invalidate it.
    #[must_use]
    pub fn is_valid(&self, raw_block: &[u8]) -> bool {
        self.magic == CHECKPOINT_MAGIC
            && self.complete == 1
            && self.checksum == checkpoint_checksum(raw_block)
    }
}

/// CRC32C of a checkpoint header block with checksum and complete zeroed.
#[must_use]
pub fn checkpoint_checksum(raw_block: &[u8]) -> u32 {
    let mut scratch = [0_u8; CHECKPOINT_HEADER_SIZE];
    let len = raw_block.len().min(CHECKPOINT_HEADER_SIZE);
    scratch[..len].copy_from_slice(&raw_block[..len]);
    scratch[40..48].fill(0);
    crc32c::crc32c(&scratch)
}

// ── Segment summary ─────────────────────────────────────────────────────────

/// Size of the packed segment summary header.
pub const SEGMENT_HEADER_SIZE: usize = 24;
/// Size of one per-block descriptor in the summary.
pub const BLOCK_INFO_SIZE: usize = 12;
/// Descriptors that fit in the single summary block.
///
/// This bounds how many payload blocks one segment may carry while keeping
/// its summary self-consistent; the writer flushes when it is reached.
pub const SUMMARY_CAPACITY: usize = (BLOCK_SIZE - SEGMENT_HEADER_SIZE) / BLOCK_INFO_SIZE;

/// Block type codes recorded in segment summaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum BlockKind {
    Data = 0,
    Inode = 1,
    Indirect = 2,
    Dirent = 3,
}

impl BlockKind {
    pub fn from_code(code: u8) -> Result<Self, ParseError> {
        match code {
            0 => Ok(Self::Data),
            1 => Ok(Self::Inode),
            2 => Ok(Self::Indirect),
            3 => Ok(Self::Dirent),
            _ => Err(ParseError::InvalidField {
                field: "block_type",
                reason: "unknown code",
            }),
        }
    }

    #[must_use]
    pub fn code(self) -> u8 {
        self as u8
    }
}

/// Per-block descriptor within a segment summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockInfo {
    /// Owning inode; zero means the slot is unused.
    pub ino: InodeNumber,
    /// Intra-file block index for data blocks.
    pub offset: u32,
    pub kind: BlockKind,
}

/// Header of a segment summary block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentHeader {
    pub magic: u32,
    pub segment_id: SegmentId,
    pub timestamp: u64,
    /// Blocks used in the segment, summary included.
    pub block_count: u32,
    pub checksum: u32,
}

impl SegmentHeader {
    pub fn parse_from_block(data: &[u8]) -> Result<Self, ParseError> {
        let magic = read_le_u32(data, 0)?;
        if magic != SEGMENT_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: SEGMENT_MAGIC,
                actual: magic,
            });
        }
        Ok(Self {
            magic,
            segment_id: SegmentId(read_le_u32(data, 4)?),
            timestamp: read_le_u64(data, 8)?,
            block_count: read_le_u32(data, 16)?,
            checksum: read_le_u32(data, 20)?,
        })
    }
}

/// Decoded segment summary: header plus one descriptor per payload block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentSummary {
    pub header: SegmentHeader,
    pub entries: Vec<BlockInfo>,
}

impl SegmentSummary {
    /// Parse a summary block, bounds-checking the descriptor count.
    pub fn parse_from_block(data: &[u8]) -> Result<Self, ParseError> {
        let header = SegmentHeader::parse_from_block(data)?;
        if header.block_count == 0 || header.block_count as u64 > lsfs_types::SEGMENT_BLOCKS {
            return Err(ParseError::InvalidField {
                field: "block_count",
                reason: "out of range",
            });
        }
        let payload = header.block_count as usize - 1;
        if payload > SUMMARY_CAPACITY {
            return Err(ParseError::InvalidField {
                field: "block_count",
                reason: "exceeds summary capacity",
            });
        }

        let mut entries = Vec::with_capacity(payload);
        for i in 0..payload {
            let base = SEGMENT_HEADER_SIZE + i * BLOCK_INFO_SIZE;
            let kind = lsfs_types::ensure_slice(data, base + 8, 1)?[0];
            entries.push(BlockInfo {
                ino: InodeNumber(read_le_u32(data, base)?),
                offset: read_le_u32(data, base + 4)?,
                kind: BlockKind::from_code(kind)?,
            });
        }
        Ok(Self { header, entries })
    }

    /// Serialize into a zero-padded 4 KiB summary block, stamping the
    /// checksum.
    #[must_use]
    pub fn to_block(&self) -> Vec<u8> {
        let mut buf = vec![0_u8; BLOCK_SIZE];
        buf[0..4].copy_from_slice(&self.header.magic.to_le_bytes());
        buf[4..8].copy_from_slice(&self.header.segment_id.0.to_le_bytes());
        buf[8..16].copy_from_slice(&self.header.timestamp.to_le_bytes());
        buf[16..20].copy_from_slice(&self.header.block_count.to_le_bytes());

        for (i, info) in self.entries.iter().enumerate() {
            let base = SEGMENT_HEADER_SIZE + i * BLOCK_INFO_SIZE;
            buf[base..base + 4].copy_from_slice(&info.ino.0.to_le_bytes());
            buf[base + 4..base + 8].copy_from_slice(&info.offset.to_le_bytes());
            buf[base + 8] = info.kind.code();
        }

        let checksum = summary_checksum(&buf);
        buf[20..24].copy_from_slice(&checksum.to_le_bytes());
        buf
    }

    /// Verify the stored checksum against the raw block.
    #[must_use]
    pub fn checksum_ok(raw_block: &[u8], header: &SegmentHeader) -> bool {
        header.checksum == summary_checksum(raw_block)
    }
}

/// CRC32C of a summary block with the checksum field zeroed.
#[must_use]
pub fn summary_checksum(raw_block: &[u8]) -> u32 {
    let mut scratch = raw_block.to_vec();
    if scratch.len() >= SEGMENT_HEADER_SIZE {
        scratch[20..24].fill(0);
    }
    crc32c::crc32c(&scratch)
}

// ── Segment usage table ─────────────────────────────────────────────────────

/// Size of one packed segment usage entry.
pub const SEGMENT_USAGE_SIZE: usize = 24;

/// Segment lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum SegmentState {
    Free = 0,
    Active = 1,
    Full = 2,
    Cleaning = 3,
}

impl SegmentState {
    pub fn from_code(code: u32) -> Result<Self, ParseError> {
        match code {
            0 => Ok(Self::Free),
            1 => Ok(Self::Active),
            2 => Ok(Self::Full),
            3 => Ok(Self::Cleaning),
            _ => Err(ParseError::InvalidField {
                field: "segment_state",
                reason: "unknown code",
            }),
        }
    }

    #[must_use]
    pub fn code(self) -> u32 {
        self as u32
    }
}

/// Per-segment state tracked in the segment table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentUsage {
    pub segment_id: SegmentId,
    pub state: SegmentState,
    pub live_blocks: u32,
    pub timestamp: u64,
}

impl SegmentUsage {
    #[must_use]
    pub fn free(segment_id: SegmentId) -> Self {
        Self {
            segment_id,
            state: SegmentState::Free,
            live_blocks: 0,
            timestamp: 0,
        }
    }

    pub fn parse_at(data: &[u8], offset: usize) -> Result<Self, ParseError> {
        Ok(Self {
            segment_id: SegmentId(read_le_u32(data, offset)?),
            state: SegmentState::from_code(read_le_u32(data, offset + 4)?)?,
            live_blocks: read_le_u32(data, offset + 8)?,
            timestamp: read_le_u64(data, offset + 16)?,
        })
    }

    pub fn encode_at(&self, data: &mut [u8], offset: usize) {
        data[offset..offset + 4].copy_from_slice(&self.segment_id.0.to_le_bytes());
        data[offset + 4..offset + 8].copy_from_slice(&self.state.code().to_le_bytes());
        data[offset + 8..offset + 12].copy_from_slice(&self.live_blocks.to_le_bytes());
        data[offset + 12..offset + 16].fill(0);
        data[offset + 16..offset + 24].copy_from_slice(&self.timestamp.to_le_bytes());
    }
}

// ── Inode map entry ─────────────────────────────────────────────────────────

/// Size of one packed inode map entry.
pub const IMAP_ENTRY_SIZE: usize = 16;
/// Inode map entries per block.
pub const IMAP_ENTRIES_PER_BLOCK: usize = BLOCK_SIZE / IMAP_ENTRY_SIZE;

/// Maps an inode number to its current on-disk location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImapEntry {
    pub ino: InodeNumber,
    /// Increments on every overwrite; seeds stale-read detection.
    pub version: u32,
    /// Block address of the block containing the inode record.
    pub location: BlockNumber,
}

impl ImapEntry {
    pub fn parse_at(data: &[u8], offset: usize) -> Result<Self, ParseError> {
        Ok(Self {
            ino: InodeNumber(read_le_u32(data, offset)?),
            version: read_le_u32(data, offset + 4)?,
            location: BlockNumber(read_le_u64(data, offset + 8)?),
        })
    }

    pub fn encode_at(&self, data: &mut [u8], offset: usize) {
        data[offset..offset + 4].copy_from_slice(&self.ino.0.to_le_bytes());
        data[offset + 4..offset + 8].copy_from_slice(&self.version.to_le_bytes());
        data[offset + 8..offset + 16].copy_from_slice(&self.location.0.to_le_bytes());
    }
}

// ── Inode record ────────────────────────────────────────────────────────────

/// On-disk inode record, exactly 256 bytes.
///
/// Sixteen records share a block; a record always lives at slot
/// `ino % 16` within its containing block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskInode {
    pub ino: InodeNumber,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub blocks: u64,
    /// Nanoseconds since the epoch.
    pub atime: u64,
    pub mtime: u64,
    pub ctime: u64,
    pub nlink: u32,
    pub flags: u32,
    pub direct: [u64; DIRECT_BLOCKS],
    pub indirect: u64,
    pub double_indirect: u64,
    pub symlink: [u8; SYMLINK_INLINE_MAX],
    pub generation: u64,
}

impl DiskInode {
    /// A zeroed record with the given identity and mode.
    #[must_use]
    pub fn new(ino: InodeNumber, mode: u32) -> Self {
        Self {
            ino,
            mode,
            uid: 0,
            gid: 0,
            size: 0,
            blocks: 0,
            atime: 0,
            mtime: 0,
            ctime: 0,
            nlink: 0,
            flags: 0,
            direct: [0; DIRECT_BLOCKS],
            indirect: 0,
            double_indirect: 0,
            symlink: [0; SYMLINK_INLINE_MAX],
            generation: 0,
        }
    }

    pub fn parse_from_bytes(data: &[u8]) -> Result<Self, ParseError> {
        if data.len() < INODE_SIZE {
            return Err(ParseError::InsufficientData {
                needed: INODE_SIZE,
                offset: 0,
                actual: data.len(),
            });
        }

        let mut direct = [0_u64; DIRECT_BLOCKS];
        for (i, slot) in direct.iter_mut().enumerate() {
            *slot = read_le_u64(data, 64 + i * 8)?;
        }

        Ok(Self {
            ino: InodeNumber(read_le_u32(data, 0)?),
            mode: read_le_u32(data, 4)?,
            uid: read_le_u32(data, 8)?,
            gid: read_le_u32(data, 12)?,
            size: read_le_u64(data, 16)?,
            blocks: read_le_u64(data, 24)?,
            atime: read_le_u64(data, 32)?,
            mtime: read_le_u64(data, 40)?,
            ctime: read_le_u64(data, 48)?,
            nlink: read_le_u32(data, 56)?,
            flags: read_le_u32(data, 60)?,
            direct,
            indirect: read_le_u64(data, 160)?,
            double_indirect: read_le_u64(data, 168)?,
            symlink: read_fixed::<SYMLINK_INLINE_MAX>(data, 176)?,
            generation: read_le_u64(data, 240)?,
        })
    }

    /// Serialize into exactly `INODE_SIZE` bytes.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; INODE_SIZE] {
        let mut buf = [0_u8; INODE_SIZE];
        buf[0..4].copy_from_slice(&self.ino.0.to_le_bytes());
        buf[4..8].copy_from_slice(&self.mode.to_le_bytes());
        buf[8..12].copy_from_slice(&self.uid.to_le_bytes());
        buf[12..16].copy_from_slice(&self.gid.to_le_bytes());
        buf[16..24].copy_from_slice(&self.size.to_le_bytes());
        buf[24..32].copy_from_slice(&self.blocks.to_le_bytes());
        buf[32..40].copy_from_slice(&self.atime.to_le_bytes());
        buf[40..48].copy_from_slice(&self.mtime.to_le_bytes());
        buf[48..56].copy_from_slice(&self.ctime.to_le_bytes());
        buf[56..60].copy_from_slice(&self.nlink.to_le_bytes());
        buf[60..64].copy_from_slice(&self.flags.to_le_bytes());
        for (i, slot) in self.direct.iter().enumerate() {
            buf[64 + i * 8..72 + i * 8].copy_from_slice(&slot.to_le_bytes());
        }
        buf[160..168].copy_from_slice(&self.indirect.to_le_bytes());
        buf[168..176].copy_from_slice(&self.double_indirect.to_le_bytes());
        buf[176..240].copy_from_slice(&self.symlink);
        buf[240..248].copy_from_slice(&self.generation.to_le_bytes());
        buf
    }

    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.mode & lsfs_types::S_IFMT == lsfs_types::S_IFDIR
    }

    #[must_use]
    pub fn is_regular(&self) -> bool {
        self.mode & lsfs_types::S_IFMT == lsfs_types::S_IFREG
    }

    #[must_use]
    pub fn is_symlink(&self) -> bool {
        self.mode & lsfs_types::S_IFMT == lsfs_types::S_IFLNK
    }

    #[must_use]
    pub fn file_type(&self) -> FileType {
        FileType::from_mode(self.mode)
    }
}

/// Extract the record for `ino` from its containing block.
pub fn inode_record_in_block(block: &[u8], ino: InodeNumber) -> Result<DiskInode, ParseError> {
    let offset = ino.block_offset();
    let raw = lsfs_types::ensure_slice(block, offset, INODE_SIZE)?;
    DiskInode::parse_from_bytes(raw)
}

// ── Directory records ───────────────────────────────────────────────────────

/// Fixed header bytes of a directory record (before the name).
pub const DIRENT_HEADER_SIZE: usize = 8;

/// Bytes needed for a record with `name_len` name bytes, 4-byte aligned.
#[must_use]
pub fn dirent_record_size(name_len: usize) -> usize {
    lsfs_types::align_up(DIRENT_HEADER_SIZE + name_len, 4)
}

/// A decoded directory record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dirent {
    /// Zero marks a tombstoned slot.
    pub ino: InodeNumber,
    /// Total slot length, including any trailing slack.
    pub rec_len: u16,
    pub file_type: FileType,
    pub name: Vec<u8>,
}

impl Dirent {
    /// Parse the record starting at `offset` within a directory block.
    ///
    /// A zero `rec_len` is returned as-is (the caller treats it as end of
    /// valid records); all other length fields are bounds-checked.
    pub fn parse_at(block: &[u8], offset: usize) -> Result<Self, ParseError> {
        let ino = InodeNumber(read_le_u32(block, offset)?);
        let rec_len = read_le_u16(block, offset + 4)?;
        let tail = lsfs_types::ensure_slice(block, offset + 6, 2)?;
        let name_len = usize::from(tail[0]);
        let type_code = tail[1];

        if rec_len != 0 {
            if usize::from(rec_len) < dirent_record_size(name_len) {
                return Err(ParseError::InvalidField {
                    field: "rec_len",
                    reason: "smaller than record contents",
                });
            }
            if offset + usize::from(rec_len) > block.len() {
                return Err(ParseError::InvalidField {
                    field: "rec_len",
                    reason: "extends past block",
                });
            }
            if name_len > NAME_MAX {
                return Err(ParseError::InvalidField {
                    field: "name_len",
                    reason: "exceeds NAME_MAX",
                });
            }
        }

        let name = if rec_len == 0 || name_len == 0 {
            Vec::new()
        } else {
            lsfs_types::ensure_slice(block, offset + DIRENT_HEADER_SIZE, name_len)?.to_vec()
        };

        Ok(Self {
            ino,
            rec_len,
            file_type: FileType::from_code(type_code),
            name,
        })
    }

    /// Encode this record at `offset`, leaving slack bytes untouched.
    pub fn encode_at(&self, block: &mut [u8], offset: usize) {
        block[offset..offset + 4].copy_from_slice(&self.ino.0.to_le_bytes());
        block[offset + 4..offset + 6].copy_from_slice(&self.rec_len.to_le_bytes());
        #[allow(clippy::cast_possible_truncation)]
        {
            block[offset + 6] = self.name.len() as u8;
        }
        block[offset + 7] = self.file_type.code();
        block[offset + DIRENT_HEADER_SIZE..offset + DIRENT_HEADER_SIZE + self.name.len()]
            .copy_from_slice(&self.name);
    }

    /// Space this record's contents occupy, excluding slack.
    #[must_use]
    pub fn used_size(&self) -> usize {
        dirent_record_size(self.name.len())
    }

    #[must_use]
    pub fn is_dot_or_dotdot(&self) -> bool {
        self.name == b"." || self.name == b".."
    }
}
