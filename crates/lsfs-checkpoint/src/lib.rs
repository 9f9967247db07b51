#![forbid(unsafe_code)]
//! Checkpointing and crash recovery for LSFS.
//!
//! A checkpoint is a durable snapshot of the inode map and segment table,
//! written to one of two alternating regions so that a crash mid-emit
//! always leaves the previous checkpoint intact. Recovery picks the newest
//! complete checkpoint and rolls forward through segments written after its
//! log head.

use lsfs_block::BlockDevice;
use lsfs_error::{LsfsError, Result};
use lsfs_imap::InodeMap;
use lsfs_ondisk::{CheckpointHeader, SegmentSummary, Superblock};
use lsfs_segment::{SegmentTable, SegmentWriter};
use lsfs_types::{
    now_secs, BlockNumber, InodeNumber, SegmentId, CHECKPOINT_MAGIC, CHECKPOINT_REGION_BLOCKS,
    LSFS_VERSION,
};
use parking_lot::Mutex;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info, warn};

// ── Trigger policy ──────────────────────────────────────────────────────────

/// When to emit a checkpoint.
#[derive(Debug, Clone, Copy)]
pub struct CheckpointConfig {
    /// Emit after this many appends since the last checkpoint.
    pub write_threshold: u64,
    /// Emit after this much wall-clock time since the last checkpoint.
    pub interval: Duration,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            write_threshold: 100,
            interval: Duration::from_secs(30),
        }
    }
}

struct CpState {
    sequence: u64,
    last_checkpoint_secs: u64,
}

/// Serialises checkpoint emission and tracks the current sequence.
pub struct CheckpointManager {
    config: CheckpointConfig,
    state: Mutex<CpState>,
    /// Held across an entire emit; checkpoint bodies never interleave.
    emit_lock: Mutex<()>,
}

impl CheckpointManager {
    #[must_use]
    pub fn new(config: CheckpointConfig) -> Self {
        Self {
            config,
            state: Mutex::new(CpState {
                sequence: 0,
                last_checkpoint_secs: now_secs(),
            }),
            emit_lock: Mutex::new(()),
        }
    }

    /// Sequence of the most recent checkpoint.
    #[must_use]
    pub fn sequence(&self) -> u64 {
        self.state.lock().sequence
    }

    /// Whether the write-count or time trigger has fired.
    #[must_use]
    pub fn needed(&self, writer: &SegmentWriter) -> bool {
        if writer.appends_since_checkpoint() >= self.config.write_threshold {
            return true;
        }
        let last = self.state.lock().last_checkpoint_secs;
        now_secs().saturating_sub(last) >= self.config.interval.as_secs()
    }

    /// Emit a checkpoint to the inactive region.
    ///
    /// Protocol: flush the writer, write the header with `complete = 0`,
    /// then the IMAP blocks and segment table, sync, flip `complete = 1`,
    /// sync, repoint the superblock, sync. Returns the new sequence.
    pub fn write(
        &self,
        dev: &dyn BlockDevice,
        writer: &SegmentWriter,
        table: &SegmentTable,
        imap: &InodeMap,
        sb: &Mutex<Superblock>,
    ) -> Result<u64> {
        let _emit = self.emit_lock.lock();

        // 1. Nothing staged may be left behind the snapshot.
        writer.flush(dev, table)?;

        let (region, cp_start) = {
            let sb = sb.lock();
            let region = sb.active_checkpoint ^ 1;
            (region, sb.checkpoint_start(region))
        };
        let sequence = self.state.lock().sequence + 1;
        let timestamp = now_secs();

        // 2. IMAP blocks first (their count feeds the header), bounded by
        //    the region size.
        let imap_blocks =
            lsfs_types::blocks_for_size((imap.len() * lsfs_ondisk::IMAP_ENTRY_SIZE) as u64);
        if imap_blocks >= CHECKPOINT_REGION_BLOCKS {
            return Err(LsfsError::NoSpace);
        }
        let imap_entries = imap.save_to(dev, BlockNumber(cp_start.0 + 1))?;
        let segment_entries = table.save_to(dev)?;

        // 3. Header, not yet complete.
        let mut header = CheckpointHeader {
            magic: CHECKPOINT_MAGIC,
            version: LSFS_VERSION,
            sequence,
            timestamp,
            log_head: writer.log_head().0,
            imap_entries,
            segment_entries,
            checksum: 0,
            complete: 0,
        };
        dev.write_block(cp_start, &header.to_block())?;

        // 4. Barrier, then mark complete, then barrier again.
        dev.sync()?;
        header.complete = 1;
        dev.write_block(cp_start, &header.to_block())?;
        dev.sync()?;

        // 5. Repoint the superblock at the new checkpoint.
        {
            let mut sb = sb.lock();
            sb.active_checkpoint = region;
            sb.log_head = writer.log_head().0;
            sb.free_segments = u64::from(table.free_count());
            dev.write_block(BlockNumber(lsfs_types::SUPERBLOCK_BLOCK), &sb.to_block())?;
        }
        dev.sync()?;

        {
            let mut state = self.state.lock();
            state.sequence = sequence;
            state.last_checkpoint_secs = timestamp;
        }
        writer.reset_append_counter();

        info!(
            target: "lsfs::checkpoint",
            sequence,
            region,
            imap_entries,
            "checkpoint written"
        );
        Ok(sequence)
    }

    /// Read both checkpoint headers and pick the authoritative one.
    ///
    /// A header counts iff its magic matches, `complete = 1`, and its
    /// checksum holds; of two valid headers the higher sequence wins,
    /// regardless of which the superblock names.
    pub fn load(
        &self,
        dev: &dyn BlockDevice,
        sb: &Superblock,
    ) -> Result<(CheckpointHeader, u32)> {
        let mut best: Option<(CheckpointHeader, u32)> = None;
        for region in 0..2_u32 {
            let raw = dev.read_block(sb.checkpoint_start(region))?;
            let Ok(header) = CheckpointHeader::parse_from_block(&raw) else {
                continue;
            };
            if !header.is_valid(&raw) {
                continue;
            }
            if best.map_or(true, |(b, _)| header.sequence > b.sequence) {
                best = Some((header, region));
            }
        }
        best.ok_or_else(|| LsfsError::Corruption {
            block: sb.checkpoint_region[0],
            detail: "no valid checkpoint in either region".into(),
        })
    }

    /// Restore state from the newest checkpoint and roll the log forward.
    ///
    /// Runs once at mount, before any user operation; finishes by emitting
    /// a fresh checkpoint.
    pub fn recover(
        &self,
        dev: &dyn BlockDevice,
        writer: &SegmentWriter,
        table: &SegmentTable,
        imap: &InodeMap,
        sb: &Mutex<Superblock>,
    ) -> Result<RecoveryReport> {
        let mut report = self.replay(dev, writer, table, imap, sb)?;

        // The filesystem only becomes available once a fresh checkpoint
        // persists.
        report.new_sequence = self.write(dev, writer, table, imap, sb)?;
        info!(
            target: "lsfs::checkpoint",
            replayed = report.replayed_segments,
            log_head = report.log_head,
            sequence = report.new_sequence,
            "recovery complete"
        );
        Ok(report)
    }

    /// The in-memory half of recovery: load the newest checkpoint and roll
    /// forward, without writing anything. Read-only mounts stop here.
    pub fn replay(
        &self,
        dev: &dyn BlockDevice,
        writer: &SegmentWriter,
        table: &SegmentTable,
        imap: &InodeMap,
        sb: &Mutex<Superblock>,
    ) -> Result<RecoveryReport> {
        let geometry = table.geometry();
        let (header, region) = {
            let sb = sb.lock();
            self.load(dev, &sb)?
        };
        info!(
            target: "lsfs::checkpoint",
            region,
            sequence = header.sequence,
            log_head = header.log_head,
            "recovering from checkpoint"
        );

        let cp_start = {
            let sb = sb.lock();
            sb.checkpoint_start(region)
        };
        imap.load_from(dev, BlockNumber(cp_start.0 + 1), header.imap_entries)?;

        {
            let mut state = self.state.lock();
            state.sequence = header.sequence;
            state.last_checkpoint_secs = header.timestamp;
        }
        writer.set_log_head(BlockNumber(header.log_head));
        {
            let mut sb = sb.lock();
            sb.active_checkpoint = region;
            sb.log_head = header.log_head;
        }

        // Roll forward through segments written after the checkpoint. A
        // log head in the middle of a segment means that segment was
        // flushed before the checkpoint and is already covered by it; the
        // scan starts at the next boundary.
        let mut replayed = 0_u32;
        let mut log_head = BlockNumber(header.log_head);
        if let Some((cursor, slot)) = geometry.block_to_segment(log_head) {
            let start_segment = if slot == 0 { cursor.0 } else { cursor.0 + 1 };
            #[allow(clippy::cast_possible_truncation)]
            let total = geometry.total_segments as u32;
            for seg in start_segment..total {
                let segment = SegmentId(seg);
                let seg_start = geometry.segment_start(segment);
                let raw = dev.read_block(seg_start)?;

                let Ok(summary) = SegmentSummary::parse_from_block(&raw) else {
                    break; // end of log
                };
                if summary.header.segment_id != segment {
                    break;
                }
                if !SegmentSummary::checksum_ok(&raw, &summary.header) {
                    warn!(
                        target: "lsfs::checkpoint",
                        segment = seg,
                        "segment summary checksum mismatch; stopping roll-forward"
                    );
                    break;
                }
                if summary.header.timestamp < header.timestamp {
                    break; // older than the checkpoint: stale log tail
                }

                for (i, info) in summary.entries.iter().enumerate() {
                    if info.kind == lsfs_ondisk::BlockKind::Inode && info.ino != InodeNumber(0) {
                        let address = BlockNumber(seg_start.0 + 1 + i as u64);
                        imap.set(info.ino, address);
                    }
                }
                table.set_full(
                    segment,
                    summary.header.block_count - 1,
                    summary.header.timestamp,
                );
                log_head = BlockNumber(seg_start.0 + u64::from(summary.header.block_count));
                replayed += 1;
                debug!(
                    target: "lsfs::checkpoint",
                    segment = seg,
                    blocks = summary.header.block_count,
                    "replayed segment"
                );
            }
        }

        writer.set_log_head(log_head);
        sb.lock().log_head = log_head.0;
        // New segments should land on the roll-forward frontier.
        if let Some((cursor, slot)) = geometry.block_to_segment(log_head) {
            let hint = if slot == 0 { cursor.0 } else { cursor.0 + 1 };
            table.set_alloc_hint(SegmentId(hint));
        }

        Ok(RecoveryReport {
            region,
            loaded_sequence: header.sequence,
            new_sequence: header.sequence,
            replayed_segments: replayed,
            log_head: log_head.0,
        })
    }
}

/// Outcome of a mount-time recovery pass.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct RecoveryReport {
    /// Region the checkpoint was loaded from.
    pub region: u32,
    /// Sequence of the loaded checkpoint.
    pub loaded_sequence: u64,
    /// Sequence of the fresh checkpoint emitted after roll-forward.
    pub new_sequence: u64,
    pub replayed_segments: u32,
    pub log_head: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use lsfs_block::{ByteBlockDevice, MemByteDevice};
    use lsfs_ondisk::{BlockKind, SegmentState, SB_STATE_CLEAN};
    use lsfs_segment::GcSignal;
    use lsfs_types::{
        BLOCK_SIZE, CHECKPOINT0_START, CHECKPOINT1_START, LOG_START, LSFS_MAGIC, SEGMENT_BLOCKS,
    };

    struct Fixture {
        dev: ByteBlockDevice<MemByteDevice>,
        writer: SegmentWriter,
        table: SegmentTable,
        imap: InodeMap,
        sb: Mutex<Superblock>,
        manager: CheckpointManager,
    }

    fn superblock(segments: u64) -> Superblock {
        Superblock {
            magic: LSFS_MAGIC,
            version: LSFS_VERSION,
            block_size: BLOCK_SIZE as u32,
            segment_size: SEGMENT_BLOCKS as u32,
            total_blocks: LOG_START + segments * SEGMENT_BLOCKS,
            total_segments: segments,
            inode_count: 0,
            checkpoint_region: [CHECKPOINT0_START, CHECKPOINT1_START],
            active_checkpoint: 0,
            log_head: LOG_START,
            free_segments: segments,
            uuid: [7; 16],
            created_at: 1,
            mounted_at: 0,
            mount_count: 0,
            state: SB_STATE_CLEAN,
        }
    }

    impl Fixture {
        fn new(segments: u64) -> Self {
            let sb = superblock(segments);
            let geometry = sb.geometry();
            Self {
                dev: ByteBlockDevice::new(
                    MemByteDevice::new(sb.total_blocks as usize * BLOCK_SIZE),
                    BLOCK_SIZE as u32,
                )
                .unwrap(),
                writer: SegmentWriter::new(geometry, GcSignal::new()),
                table: SegmentTable::new(geometry),
                imap: InodeMap::new(),
                sb: Mutex::new(sb),
                manager: CheckpointManager::new(CheckpointConfig::default()),
            }
        }

        fn append_inode_block(&self, ino: u32) -> BlockNumber {
            let mut block = vec![0_u8; BLOCK_SIZE];
            block[0..4].copy_from_slice(&ino.to_le_bytes());
            let addr = self
                .writer
                .append(
                    &self.dev,
                    &self.table,
                    &block,
                    InodeNumber(ino),
                    0,
                    BlockKind::Inode,
                )
                .unwrap();
            self.imap.set(InodeNumber(ino), addr);
            addr
        }
    }

    #[test]
    fn write_emits_complete_alternating_checkpoints() {
        let f = Fixture::new(4);
        f.append_inode_block(5);

        let seq1 = f
            .manager
            .write(&f.dev, &f.writer, &f.table, &f.imap, &f.sb)
            .unwrap();
        assert_eq!(seq1, 1);
        assert_eq!(f.sb.lock().active_checkpoint, 1);

        let raw = f.dev.read_block(BlockNumber(CHECKPOINT1_START)).unwrap();
        let header = CheckpointHeader::parse_from_block(&raw).unwrap();
        assert!(header.is_valid(&raw));
        assert_eq!(header.sequence, 1);
        assert_eq!(header.imap_entries, 1);

        // Second checkpoint flips back to region 0 with a higher sequence.
        f.append_inode_block(6);
        let seq2 = f
            .manager
            .write(&f.dev, &f.writer, &f.table, &f.imap, &f.sb)
            .unwrap();
        assert_eq!(seq2, 2);
        assert_eq!(f.sb.lock().active_checkpoint, 0);

        let raw0 = f.dev.read_block(BlockNumber(CHECKPOINT0_START)).unwrap();
        let h0 = CheckpointHeader::parse_from_block(&raw0).unwrap();
        assert!(h0.is_valid(&raw0));
        assert_eq!(h0.sequence, 2);
        // Both regions hold complete checkpoints; the higher wins on load.
        let (best, region) = f.manager.load(&f.dev, &f.sb.lock()).unwrap();
        assert_eq!(best.sequence, 2);
        assert_eq!(region, 0);
    }

    #[test]
    fn needed_fires_on_write_threshold() {
        let f = Fixture::new(4);
        let manager = CheckpointManager::new(CheckpointConfig {
            write_threshold: 3,
            interval: Duration::from_secs(3600),
        });
        assert!(!manager.needed(&f.writer));
        for ino in 10..13 {
            f.append_inode_block(ino);
        }
        assert!(manager.needed(&f.writer));

        manager
            .write(&f.dev, &f.writer, &f.table, &f.imap, &f.sb)
            .unwrap();
        assert!(!manager.needed(&f.writer));
    }

    #[test]
    fn load_rejects_incomplete_and_corrupt_headers() {
        let f = Fixture::new(4);
        // No checkpoint at all.
        assert!(matches!(
            f.manager.load(&f.dev, &f.sb.lock()),
            Err(LsfsError::Corruption { .. })
        ));

        f.manager
            .write(&f.dev, &f.writer, &f.table, &f.imap, &f.sb)
            .unwrap();
        // Corrupt the (now active) region 1 header: load falls back nowhere,
        // since region 0 never held a checkpoint.
        let mut raw = f.dev.read_block(BlockNumber(CHECKPOINT1_START)).unwrap();
        raw[8] ^= 0xFF; // sequence byte; checksum no longer matches
        f.dev
            .write_block(BlockNumber(CHECKPOINT1_START), &raw)
            .unwrap();
        assert!(f.manager.load(&f.dev, &f.sb.lock()).is_err());
    }

    #[test]
    fn recover_replays_segments_after_checkpoint() {
        let f = Fixture::new(4);
        f.append_inode_block(5);
        f.manager
            .write(&f.dev, &f.writer, &f.table, &f.imap, &f.sb)
            .unwrap();

        // Post-checkpoint work: two more inodes, flushed but NOT
        // checkpointed (simulating a crash before the next checkpoint).
        let addr6 = f.append_inode_block(6);
        let addr7 = f.append_inode_block(7);
        f.writer.flush(&f.dev, &f.table).unwrap();

        // Fresh in-memory state, as a new mount would build.
        let sb = Mutex::new({
            let raw = f.dev.read_block(BlockNumber(0));
            // Superblock was written by the checkpoint.
            Superblock::parse_from_block(&raw.unwrap()).unwrap()
        });
        let geometry = sb.lock().geometry();
        let table = SegmentTable::load_from(&f.dev, geometry).unwrap();
        let imap = InodeMap::new();
        let writer = SegmentWriter::new(geometry, GcSignal::new());
        let manager = CheckpointManager::new(CheckpointConfig::default());

        let report = manager
            .recover(&f.dev, &writer, &table, &imap, &sb)
            .unwrap();
        assert_eq!(report.loaded_sequence, 1);
        assert_eq!(report.new_sequence, 2);
        // The cursor segment is covered by the checkpoint; only the
        // post-checkpoint segment replays.
        assert_eq!(report.replayed_segments, 1);

        // The replayed IMAP sees all three inodes at their log addresses.
        assert_eq!(imap.get(InodeNumber(6)).unwrap().0, addr6);
        assert_eq!(imap.get(InodeNumber(7)).unwrap().0, addr7);
        assert!(imap.get(InodeNumber(5)).is_some());

        // Replayed segment is accounted full.
        assert_eq!(
            table.entry(SegmentId(0)).unwrap().state,
            SegmentState::Full
        );
    }

    #[test]
    fn recover_is_idempotent() {
        let f = Fixture::new(4);
        f.append_inode_block(5);
        f.append_inode_block(6);
        f.writer.flush(&f.dev, &f.table).unwrap();
        f.manager
            .write(&f.dev, &f.writer, &f.table, &f.imap, &f.sb)
            .unwrap();

        let run = |seq_offset: u64| {
            let sb = Mutex::new(
                Superblock::parse_from_block(&f.dev.read_block(BlockNumber(0)).unwrap()).unwrap(),
            );
            let geometry = sb.lock().geometry();
            let table = SegmentTable::load_from(&f.dev, geometry).unwrap();
            let imap = InodeMap::new();
            let writer = SegmentWriter::new(geometry, GcSignal::new());
            let manager = CheckpointManager::new(CheckpointConfig::default());
            let report = manager.recover(&f.dev, &writer, &table, &imap, &sb).unwrap();
            assert_eq!(report.new_sequence, report.loaded_sequence + seq_offset);
            imap.snapshot()
        };

        let first = run(1);
        let second = run(1);
        assert_eq!(first, second);
    }

    #[test]
    fn torn_checkpoint_leaves_previous_authoritative() {
        let f = Fixture::new(4);
        f.append_inode_block(5);
        f.manager
            .write(&f.dev, &f.writer, &f.table, &f.imap, &f.sb)
            .unwrap(); // seq 1, region 1

        // Simulate a crash between steps 3 and 5 of the next emit: region 0
        // holds a header with complete = 0.
        let torn = CheckpointHeader {
            magic: CHECKPOINT_MAGIC,
            version: LSFS_VERSION,
            sequence: 2,
            timestamp: now_secs(),
            log_head: f.writer.log_head().0,
            imap_entries: 0,
            segment_entries: 4,
            checksum: 0,
            complete: 0,
        };
        f.dev
            .write_block(BlockNumber(CHECKPOINT0_START), &torn.to_block())
            .unwrap();

        let (best, region) = f.manager.load(&f.dev, &f.sb.lock()).unwrap();
        assert_eq!(best.sequence, 1);
        assert_eq!(region, 1);
    }
}
