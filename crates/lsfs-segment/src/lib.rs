#![forbid(unsafe_code)]
//! Segment management for LSFS.
//!
//! Two pieces live here: the segment table, which tracks the lifecycle and
//! live-block count of every segment, and the segment writer, which owns the
//! single `active` segment and appends blocks to its in-memory staging
//! buffer until flush. The cleaner wake signal is shared out of this crate
//! so the writer can wake the cleaner on allocation failure without a
//! dependency cycle.

use lsfs_block::BlockDevice;
use lsfs_error::{LsfsError, Result};
use lsfs_ondisk::{
    BlockInfo, BlockKind, SegmentHeader, SegmentState, SegmentSummary, SegmentUsage,
    SEGMENT_USAGE_SIZE, SUMMARY_CAPACITY,
};
use lsfs_types::{
    blocks_for_size, now_secs, BlockNumber, Geometry, InodeNumber, SegmentId, BLOCK_SIZE,
    SEGMENT_MAGIC, SEGTABLE_BLOCKS, SEGTABLE_START,
};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Payload blocks one segment may carry: bounded by what the single summary
/// block can describe, so a full segment's summary is always self-consistent.
pub const SEGMENT_PAYLOAD_CAPACITY: u32 = SUMMARY_CAPACITY as u32;

/// Free segments held back from ordinary data allocation so that deletions
/// and the cleaner can always append the metadata they need to make
/// progress.
pub const RESERVED_SEGMENTS: u32 = 1;

// ── Cleaner wake signal ─────────────────────────────────────────────────────

/// Condition-variable wake shared between the segment writer and the
/// cleaner thread.
#[derive(Default)]
pub struct GcSignal {
    pending: Mutex<bool>,
    cond: Condvar,
}

impl GcSignal {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Wake the cleaner.
    pub fn notify(&self) {
        let mut pending = self.pending.lock();
        *pending = true;
        self.cond.notify_one();
    }

    /// Block until notified or `timeout` elapses. Returns `true` when an
    /// explicit wake was consumed.
    pub fn wait(&self, timeout: Duration) -> bool {
        let mut pending = self.pending.lock();
        if !*pending {
            self.cond.wait_for(&mut pending, timeout);
        }
        std::mem::take(&mut pending)
    }
}

// ── Segment table ───────────────────────────────────────────────────────────

struct TableInner {
    entries: Vec<SegmentUsage>,
    free_count: u32,
    /// Allocation scans start here so the writer's slots stay ahead of the
    /// roll-forward cursor between checkpoints.
    alloc_hint: u32,
}

/// Per-segment state: lifecycle, live-block count, and age.
pub struct SegmentTable {
    geometry: Geometry,
    inner: Mutex<TableInner>,
}

impl SegmentTable {
    /// A table with every segment free.
    #[must_use]
    pub fn new(geometry: Geometry) -> Self {
        #[allow(clippy::cast_possible_truncation)]
        let total = geometry.total_segments as u32;
        let entries = (0..total).map(|i| SegmentUsage::free(SegmentId(i))).collect();
        Self {
            geometry,
            inner: Mutex::new(TableInner {
                entries,
                free_count: total,
                alloc_hint: 0,
            }),
        }
    }

    /// Load the table from its dedicated region.
    pub fn load_from(dev: &dyn BlockDevice, geometry: Geometry) -> Result<Self> {
        let table_bytes = geometry.total_segments as usize * SEGMENT_USAGE_SIZE;
        let blocks = blocks_for_size(table_bytes as u64);
        if blocks > SEGTABLE_BLOCKS {
            return Err(LsfsError::Corruption {
                block: SEGTABLE_START,
                detail: "segment table exceeds its region".into(),
            });
        }

        let buf = dev.read_range(
            BlockNumber(SEGTABLE_START),
            u32::try_from(blocks).map_err(|_| LsfsError::InvalidArgument("segment table size"))?,
        )?;

        let mut entries = Vec::with_capacity(geometry.total_segments as usize);
        let mut free_count = 0_u32;
        for i in 0..geometry.total_segments as usize {
            let mut entry = SegmentUsage::parse_at(&buf, i * SEGMENT_USAGE_SIZE).map_err(|e| {
                LsfsError::Corruption {
                    block: SEGTABLE_START,
                    detail: format!("segment table entry {i}: {e}"),
                }
            })?;
            #[allow(clippy::cast_possible_truncation)]
            {
                entry.segment_id = SegmentId(i as u32);
            }
            // A crash can leave a stale `active` or `cleaning` state behind;
            // neither survives a mount, so fold them back.
            match entry.state {
                SegmentState::Active => entry.state = SegmentState::Full,
                SegmentState::Cleaning => entry.state = SegmentState::Full,
                SegmentState::Free | SegmentState::Full => {}
            }
            if entry.state == SegmentState::Free {
                free_count += 1;
            }
            entries.push(entry);
        }

        debug!(
            target: "lsfs::segment",
            total = entries.len(),
            free = free_count,
            "segment table loaded"
        );
        Ok(Self {
            geometry,
            inner: Mutex::new(TableInner {
                entries,
                free_count,
                alloc_hint: 0,
            }),
        })
    }

    /// Write the table to its dedicated region.
    pub fn save_to(&self, dev: &dyn BlockDevice) -> Result<u32> {
        let entries = self.snapshot();
        let blocks = blocks_for_size((entries.len() * SEGMENT_USAGE_SIZE) as u64);
        let mut buf = vec![0_u8; usize::try_from(blocks).unwrap_or(0) * BLOCK_SIZE];
        for (i, entry) in entries.iter().enumerate() {
            entry.encode_at(&mut buf, i * SEGMENT_USAGE_SIZE);
        }
        dev.write_range(BlockNumber(SEGTABLE_START), &buf)?;
        u32::try_from(entries.len()).map_err(|_| LsfsError::InvalidArgument("segment count"))
    }

    #[must_use]
    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    /// Allocate a free segment, transitioning it to `active`.
    ///
    /// Keeps [`RESERVED_SEGMENTS`] back; use [`SegmentTable::alloc_reserved`]
    /// for metadata and reclaim allocations that may dip into the reserve.
    /// The scan starts at the hint (one past the previous allocation) so
    /// that, between checkpoints, successive segments land at increasing
    /// slots; the writer checkpoints when the scan wraps.
    pub fn alloc(&self) -> Result<(SegmentId, bool)> {
        self.alloc_inner(false)
    }

    /// Allocate a free segment, allowed to consume the reserve.
    pub fn alloc_reserved(&self) -> Result<(SegmentId, bool)> {
        self.alloc_inner(true)
    }

    fn alloc_inner(&self, allow_reserve: bool) -> Result<(SegmentId, bool)> {
        let mut inner = self.inner.lock();
        if inner.free_count == 0 || (!allow_reserve && inner.free_count <= RESERVED_SEGMENTS) {
            return Err(LsfsError::NoSpace);
        }

        let total = inner.entries.len() as u32;
        let hint = inner.alloc_hint.min(total.saturating_sub(1));
        let mut wrapped = false;
        for step in 0..total {
            let idx = (hint + step) % total;
            if idx < hint {
                wrapped = true;
            }
            if inner.entries[idx as usize].state == SegmentState::Free {
                inner.entries[idx as usize].state = SegmentState::Active;
                inner.entries[idx as usize].live_blocks = 0;
                inner.entries[idx as usize].timestamp = now_secs();
                inner.free_count -= 1;
                inner.alloc_hint = (idx + 1) % total;
                trace!(
                    target: "lsfs::segment",
                    segment = idx,
                    free = inner.free_count,
                    wrapped,
                    "allocated segment"
                );
                return Ok((SegmentId(idx), wrapped));
            }
        }
        Err(LsfsError::NoSpace)
    }

    /// Start allocation scans at `segment`.
    ///
    /// Recovery points this at the roll-forward cursor so post-mount
    /// segments land at or after it; a wrap below the cursor forces a
    /// checkpoint.
    pub fn set_alloc_hint(&self, segment: SegmentId) {
        let mut inner = self.inner.lock();
        let total = inner.entries.len() as u32;
        inner.alloc_hint = if total == 0 { 0 } else { segment.0 % total };
    }

    /// Return a segment to the free pool.
    pub fn release(&self, segment: SegmentId) {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.entries.get_mut(segment.0 as usize) else {
            return;
        };
        if entry.state != SegmentState::Free {
            entry.state = SegmentState::Free;
            entry.live_blocks = 0;
            inner.free_count += 1;
        }
        trace!(target: "lsfs::segment", segment = segment.0, free = inner.free_count, "freed segment");
    }

    /// Mark a flushed segment `full`.
    pub fn set_full(&self, segment: SegmentId, live_blocks: u32, timestamp: u64) {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.entries.get_mut(segment.0 as usize) else {
            return;
        };
        // Recovery re-incorporates segments the table still thinks are free.
        let was_free = entry.state == SegmentState::Free;
        entry.state = SegmentState::Full;
        entry.live_blocks = live_blocks;
        entry.timestamp = timestamp;
        if was_free {
            inner.free_count = inner.free_count.saturating_sub(1);
        }
    }

    /// Atomically transition `full -> cleaning`. Returns `false` when the
    /// segment is in any other state.
    pub fn begin_cleaning(&self, segment: SegmentId) -> bool {
        let mut inner = self.inner.lock();
        match inner.entries.get_mut(segment.0 as usize) {
            Some(entry) if entry.state == SegmentState::Full => {
                entry.state = SegmentState::Cleaning;
                true
            }
            _ => false,
        }
    }

    /// Roll a failed cleaning pass back to `full`.
    pub fn abort_cleaning(&self, segment: SegmentId) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.entries.get_mut(segment.0 as usize) {
            if entry.state == SegmentState::Cleaning {
                entry.state = SegmentState::Full;
            }
        }
    }

    /// Decrement the live count of the segment containing `block`.
    ///
    /// Called by inode and file-block writes to annotate the previous
    /// incarnation of a block. Saturates at zero.
    pub fn mark_dead(&self, block: BlockNumber) {
        let Some((segment, _slot)) = self.geometry.block_to_segment(block) else {
            return;
        };
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.entries.get_mut(segment.0 as usize) {
            entry.live_blocks = entry.live_blocks.saturating_sub(1);
            trace!(
                target: "lsfs::segment",
                block = block.0,
                segment = segment.0,
                live = entry.live_blocks,
                "marked block dead"
            );
        }
    }

    #[must_use]
    pub fn entry(&self, segment: SegmentId) -> Option<SegmentUsage> {
        self.inner.lock().entries.get(segment.0 as usize).copied()
    }

    #[must_use]
    pub fn snapshot(&self) -> Vec<SegmentUsage> {
        self.inner.lock().entries.clone()
    }

    /// `(free, total)` segment counts.
    #[must_use]
    pub fn counts(&self) -> (u32, u32) {
        let inner = self.inner.lock();
        (inner.free_count, inner.entries.len() as u32)
    }

    #[must_use]
    pub fn free_count(&self) -> u32 {
        self.inner.lock().free_count
    }
}

// ── Segment writer ──────────────────────────────────────────────────────────

/// Outcome of a writer flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushOutcome {
    /// A segment body was written.
    pub flushed: bool,
    /// The flushed segment sits off the roll-forward frontier; the caller
    /// must checkpoint so recovery does not skip it.
    pub wrapped: bool,
}

struct WriterState {
    /// Current `active` segment, if one could be allocated.
    segment: Option<SegmentId>,
    /// Staging buffer sized to the per-segment payload capacity.
    buf: Vec<u8>,
    /// Descriptor per staged payload block.
    infos: Vec<BlockInfo>,
    /// Blocks used in the staging buffer, slot 0 (summary) included.
    block_count: u32,
}

/// Owner of the single `active` segment.
///
/// Appends copy a block into the staging buffer and record its descriptor;
/// the segment is written out contiguously at flush, summary first in the
/// buffer but ordered after the body on the transition to `full`.
pub struct SegmentWriter {
    geometry: Geometry,
    state: Mutex<WriterState>,
    log_head: AtomicU64,
    appends_since_checkpoint: AtomicU64,
    /// Nonzero while a cleaner pass runs; its appends may use the reserve.
    reclaim_depth: AtomicU64,
    /// Set when a flushed segment is off the roll-forward frontier; a
    /// checkpoint must follow so recovery can see it. Cleared by the next
    /// checkpoint.
    wrap_pending: std::sync::atomic::AtomicBool,
    gc_signal: Arc<GcSignal>,
}

impl SegmentWriter {
    #[must_use]
    pub fn new(geometry: Geometry, gc_signal: Arc<GcSignal>) -> Self {
        let capacity_blocks = SEGMENT_PAYLOAD_CAPACITY as usize + 1;
        Self {
            geometry,
            state: Mutex::new(WriterState {
                segment: None,
                buf: vec![0_u8; capacity_blocks * BLOCK_SIZE],
                infos: Vec::with_capacity(SEGMENT_PAYLOAD_CAPACITY as usize),
                block_count: 1,
            }),
            log_head: AtomicU64::new(geometry.log_start),
            appends_since_checkpoint: AtomicU64::new(0),
            reclaim_depth: AtomicU64::new(0),
            wrap_pending: std::sync::atomic::AtomicBool::new(false),
            gc_signal,
        }
    }

    /// Enter reclaim mode: subsequent appends may allocate from the
    /// reserve. Balanced by [`SegmentWriter::end_reclaim`].
    pub fn begin_reclaim(&self) {
        self.reclaim_depth.fetch_add(1, Ordering::AcqRel);
    }

    pub fn end_reclaim(&self) {
        self.reclaim_depth.fetch_sub(1, Ordering::AcqRel);
    }

    fn in_reclaim(&self) -> bool {
        self.reclaim_depth.load(Ordering::Acquire) > 0
    }

    /// Consume the wrap flag; a `true` return obliges the caller to emit a
    /// checkpoint so roll-forward cannot skip the lower-slot segment.
    #[must_use]
    pub fn take_wrap_pending(&self) -> bool {
        self.wrap_pending.swap(false, Ordering::AcqRel)
    }

    /// Current log head: the next block address at which a segment boundary
    /// begins.
    #[must_use]
    pub fn log_head(&self) -> BlockNumber {
        BlockNumber(self.log_head.load(Ordering::Acquire))
    }

    pub fn set_log_head(&self, head: BlockNumber) {
        self.log_head.store(head.0, Ordering::Release);
    }

    /// Appends recorded since the last checkpoint reset.
    #[must_use]
    pub fn appends_since_checkpoint(&self) -> u64 {
        self.appends_since_checkpoint.load(Ordering::Relaxed)
    }

    /// Reset the checkpoint trigger state; called when a checkpoint lands.
    pub fn reset_append_counter(&self) {
        self.appends_since_checkpoint.store(0, Ordering::Relaxed);
        // The fresh checkpoint re-anchors the roll-forward frontier.
        self.wrap_pending.store(false, Ordering::Release);
    }

    /// Stage one block into the active segment.
    ///
    /// Returns the absolute block address the data will occupy. Flushes
    /// synchronously when the segment fills; fails with out-of-space (after
    /// waking the cleaner) when no segment can be allocated.
    pub fn append(
        &self,
        dev: &dyn BlockDevice,
        table: &SegmentTable,
        data: &[u8],
        ino: InodeNumber,
        offset: u32,
        kind: BlockKind,
    ) -> Result<BlockNumber> {
        if data.len() != BLOCK_SIZE {
            return Err(LsfsError::InvalidArgument("append requires one full block"));
        }

        // Data appends stop at the reserve floor; metadata and reclaim
        // appends may consume it, so deletions can free space on a full
        // image.
        let allow_reserve = kind != BlockKind::Data || self.in_reclaim();

        let mut state = self.state.lock();

        if state.block_count > SEGMENT_PAYLOAD_CAPACITY {
            self.flush_locked(dev, table, &mut state)?;
        }
        if state.segment.is_none() {
            self.open_segment(table, &mut state, allow_reserve)?;
        }
        let Some(segment) = state.segment else {
            return Err(LsfsError::NoSpace);
        };

        let slot = state.block_count;
        let at = slot as usize * BLOCK_SIZE;
        state.buf[at..at + BLOCK_SIZE].copy_from_slice(data);
        state.infos.push(BlockInfo { ino, offset, kind });
        state.block_count += 1;
        self.appends_since_checkpoint.fetch_add(1, Ordering::Relaxed);

        let address = self.geometry.segment_block(segment, slot);
        trace!(
            target: "lsfs::segment",
            block = address.0,
            segment = segment.0,
            slot,
            ino = ino.0,
            kind = ?kind,
            "appended block"
        );
        Ok(address)
    }

    /// Flush the staged segment, if it holds any payload.
    pub fn flush(&self, dev: &dyn BlockDevice, table: &SegmentTable) -> Result<FlushOutcome> {
        let mut state = self.state.lock();
        self.flush_locked(dev, table, &mut state)
    }

    /// Read a block, serving it from the staging buffer when it belongs to
    /// the active segment and has not reached the device yet.
    ///
    /// Every metadata read that can race the writer (inode records,
    /// indirect blocks, directory bodies) must come through here.
    pub fn read_block(&self, dev: &dyn BlockDevice, address: BlockNumber) -> Result<Vec<u8>> {
        {
            let state = self.state.lock();
            if let Some(segment) = state.segment {
                let start = self.geometry.segment_start(segment);
                if address.0 >= start.0 {
                    let slot = address.0 - start.0;
                    if slot < u64::from(state.block_count) {
                        let at = usize::try_from(slot).unwrap_or(usize::MAX) * BLOCK_SIZE;
                        return Ok(state.buf[at..at + BLOCK_SIZE].to_vec());
                    }
                }
            }
        }
        dev.read_block(address)
    }

    /// Number of staged payload blocks (tests and the checkpoint trigger).
    #[must_use]
    pub fn staged_blocks(&self) -> u32 {
        self.state.lock().block_count.saturating_sub(1)
    }

    fn open_segment(
        &self,
        table: &SegmentTable,
        state: &mut WriterState,
        allow_reserve: bool,
    ) -> Result<()> {
        let attempt = if allow_reserve {
            table.alloc_reserved()
        } else {
            table.alloc()
        };
        match attempt {
            Ok((segment, _wrapped)) => {
                state.segment = Some(segment);
                Ok(())
            }
            Err(LsfsError::NoSpace) => {
                warn!(target: "lsfs::segment", "no free segment; waking cleaner");
                self.gc_signal.notify();
                Err(LsfsError::NoSpace)
            }
            Err(err) => Err(err),
        }
    }

    fn flush_locked(
        &self,
        dev: &dyn BlockDevice,
        table: &SegmentTable,
        state: &mut WriterState,
    ) -> Result<FlushOutcome> {
        if state.block_count <= 1 {
            return Ok(FlushOutcome {
                flushed: false,
                wrapped: false,
            });
        }
        let Some(segment) = state.segment else {
            return Ok(FlushOutcome {
                flushed: false,
                wrapped: false,
            });
        };

        // Roll-forward scans ascending slots from the checkpoint's log head
        // and stops at the first stale summary. A segment flushed anywhere
        // other than that frontier would be skipped on replay, so it must be
        // covered by a checkpoint before the next crash window.
        let frontier = match self.geometry.block_to_segment(self.log_head()) {
            Some((cursor, 0)) => Some(cursor.0),
            Some((cursor, _)) => Some(cursor.0 + 1),
            None => None,
        };
        let replayable = frontier == Some(segment.0);

        let timestamp = now_secs();
        let summary = SegmentSummary {
            header: SegmentHeader {
                magic: SEGMENT_MAGIC,
                segment_id: segment,
                timestamp,
                block_count: state.block_count,
                checksum: 0,
            },
            entries: state.infos.clone(),
        };
        let summary_block = summary.to_block();
        state.buf[..BLOCK_SIZE].copy_from_slice(&summary_block);

        // Body and summary are written before the segment table entry flips
        // to `full` and before the log head moves; a torn write leaves the
        // segment invisible to recovery.
        let start = self.geometry.segment_start(segment);
        let used = state.block_count as usize * BLOCK_SIZE;
        dev.write_range(start, &state.buf[..used])?;

        table.set_full(segment, state.block_count - 1, timestamp);
        self.log_head
            .store(start.0 + u64::from(state.block_count), Ordering::Release);

        debug!(
            target: "lsfs::segment",
            segment = segment.0,
            blocks = state.block_count,
            log_head = start.0 + u64::from(state.block_count),
            "flushed segment"
        );

        if !replayable {
            self.wrap_pending.store(true, Ordering::Release);
        }

        // Reset staging and line up the next active segment.
        state.buf.fill(0);
        state.infos.clear();
        state.block_count = 1;
        state.segment = None;

        let realloc = if self.in_reclaim() {
            table.alloc_reserved()
        } else {
            table.alloc()
        };
        match realloc {
            Ok((next, _)) => state.segment = Some(next),
            Err(LsfsError::NoSpace) => {
                warn!(target: "lsfs::segment", "no free segment after flush; waking cleaner");
                self.gc_signal.notify();
            }
            Err(err) => return Err(err),
        }

        Ok(FlushOutcome {
            flushed: true,
            wrapped: !replayable,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lsfs_block::{ByteBlockDevice, MemByteDevice};
    use lsfs_types::{LOG_START, SEGMENT_BLOCKS};

    fn small_geometry(segments: u64) -> Geometry {
        Geometry {
            block_size: BLOCK_SIZE as u32,
            segment_blocks: SEGMENT_BLOCKS,
            total_blocks: LOG_START + segments * SEGMENT_BLOCKS,
            total_segments: segments,
            log_start: LOG_START,
        }
    }

    fn mem_device(geometry: &Geometry) -> ByteBlockDevice<MemByteDevice> {
        ByteBlockDevice::new(
            MemByteDevice::new(geometry.total_blocks as usize * BLOCK_SIZE),
            BLOCK_SIZE as u32,
        )
        .expect("device")
    }

    fn writer_with(geometry: Geometry) -> (SegmentWriter, SegmentTable) {
        let table = SegmentTable::new(geometry);
        let writer = SegmentWriter::new(geometry, GcSignal::new());
        (writer, table)
    }

    #[test]
    fn alloc_and_release_track_free_count() {
        let table = SegmentTable::new(small_geometry(4));
        assert_eq!(table.counts(), (4, 4));

        let (seg, wrapped) = table.alloc().unwrap();
        assert_eq!(seg, SegmentId(0));
        assert!(!wrapped);
        assert_eq!(table.free_count(), 3);
        assert_eq!(table.entry(seg).unwrap().state, SegmentState::Active);

        table.release(seg);
        assert_eq!(table.free_count(), 4);
        assert_eq!(table.entry(seg).unwrap().state, SegmentState::Free);
    }

    #[test]
    fn alloc_exhaustion_respects_reserve() {
        let table = SegmentTable::new(small_geometry(2));
        table.alloc().unwrap();
        // One segment left: ordinary allocation stops at the reserve floor,
        // reserved allocation may take it.
        assert!(matches!(table.alloc(), Err(LsfsError::NoSpace)));
        table.alloc_reserved().unwrap();
        assert!(matches!(table.alloc_reserved(), Err(LsfsError::NoSpace)));
    }

    #[test]
    fn alloc_hint_wraps() {
        let table = SegmentTable::new(small_geometry(3));
        let (a, _) = table.alloc().unwrap();
        let (b, _) = table.alloc().unwrap();
        table.release(a);
        let (c, _) = table.alloc().unwrap();
        // Hint moved past b; c should be the slot after b, not a reuse of a.
        assert_ne!(c, b);
        assert_ne!(c, a);
        let (d, wrapped) = table.alloc_reserved().unwrap();
        assert_eq!(d, a);
        assert!(wrapped);
    }

    #[test]
    fn mark_dead_saturates() {
        let geometry = small_geometry(2);
        let table = SegmentTable::new(geometry);
        let (seg, _) = table.alloc().unwrap();
        table.set_full(seg, 2, 123);

        let block = geometry.segment_block(seg, 1);
        table.mark_dead(block);
        assert_eq!(table.entry(seg).unwrap().live_blocks, 1);
        table.mark_dead(block);
        table.mark_dead(block);
        assert_eq!(table.entry(seg).unwrap().live_blocks, 0);

        // Blocks outside the log are ignored.
        table.mark_dead(BlockNumber(0));
    }

    #[test]
    fn cleaning_transitions() {
        let table = SegmentTable::new(small_geometry(2));
        let (seg, _) = table.alloc().unwrap();
        assert!(!table.begin_cleaning(seg)); // active, not full
        table.set_full(seg, 5, 1);
        assert!(table.begin_cleaning(seg));
        assert!(!table.begin_cleaning(seg)); // already cleaning
        table.abort_cleaning(seg);
        assert_eq!(table.entry(seg).unwrap().state, SegmentState::Full);
    }

    #[test]
    fn table_save_load_round_trip() {
        let geometry = small_geometry(4);
        let dev = mem_device(&geometry);
        let table = SegmentTable::new(geometry);
        let (seg, _) = table.alloc().unwrap();
        table.set_full(seg, 7, 42);

        table.save_to(&dev).unwrap();
        let restored = SegmentTable::load_from(&dev, geometry).unwrap();
        assert_eq!(restored.counts(), (3, 4));
        let entry = restored.entry(seg).unwrap();
        assert_eq!(entry.state, SegmentState::Full);
        assert_eq!(entry.live_blocks, 7);
        assert_eq!(entry.timestamp, 42);
    }

    #[test]
    fn stale_active_state_folds_to_full_on_load() {
        let geometry = small_geometry(4);
        let dev = mem_device(&geometry);
        let table = SegmentTable::new(geometry);
        let (seg, _) = table.alloc().unwrap();
        // Persist while still `active` (simulates a crash mid-write).
        table.save_to(&dev).unwrap();

        let restored = SegmentTable::load_from(&dev, geometry).unwrap();
        assert_eq!(restored.entry(seg).unwrap().state, SegmentState::Full);
        assert_eq!(restored.free_count(), 3);
    }

    #[test]
    fn append_returns_sequential_addresses() {
        let geometry = small_geometry(4);
        let dev = mem_device(&geometry);
        let (writer, table) = writer_with(geometry);

        let data = vec![0x11_u8; BLOCK_SIZE];
        let first = writer
            .append(&dev, &table, &data, InodeNumber(2), 0, BlockKind::Data)
            .unwrap();
        let second = writer
            .append(&dev, &table, &data, InodeNumber(2), 1, BlockKind::Data)
            .unwrap();
        // Slot 0 is the summary.
        assert_eq!(first, BlockNumber(LOG_START + 1));
        assert_eq!(second, BlockNumber(LOG_START + 2));
        assert_eq!(writer.staged_blocks(), 2);
        assert_eq!(writer.appends_since_checkpoint(), 2);
    }

    #[test]
    fn flush_writes_summary_and_marks_full() {
        let geometry = small_geometry(4);
        let dev = mem_device(&geometry);
        let (writer, table) = writer_with(geometry);

        let data_a = vec![0xAA_u8; BLOCK_SIZE];
        let data_b = vec![0xBB_u8; BLOCK_SIZE];
        writer
            .append(&dev, &table, &data_a, InodeNumber(7), 0, BlockKind::Data)
            .unwrap();
        writer
            .append(&dev, &table, &data_b, InodeNumber(7), 0, BlockKind::Inode)
            .unwrap();

        let outcome = writer.flush(&dev, &table).unwrap();
        assert!(outcome.flushed);

        // Summary decodes with both descriptors and a valid checksum.
        let raw = dev.read_block(BlockNumber(LOG_START)).unwrap();
        let summary = SegmentSummary::parse_from_block(&raw).unwrap();
        assert_eq!(summary.header.segment_id, SegmentId(0));
        assert_eq!(summary.header.block_count, 3);
        assert!(SegmentSummary::checksum_ok(&raw, &summary.header));
        assert_eq!(summary.entries[0].kind, BlockKind::Data);
        assert_eq!(summary.entries[1].kind, BlockKind::Inode);

        // Body blocks landed at their addresses.
        assert_eq!(dev.read_block(BlockNumber(LOG_START + 1)).unwrap(), data_a);
        assert_eq!(dev.read_block(BlockNumber(LOG_START + 2)).unwrap(), data_b);

        // Table entry went full with payload-only live count.
        let entry = table.entry(SegmentId(0)).unwrap();
        assert_eq!(entry.state, SegmentState::Full);
        assert_eq!(entry.live_blocks, 2);

        // Log head advanced past the used blocks.
        assert_eq!(writer.log_head(), BlockNumber(LOG_START + 3));

        // A fresh active segment is lined up.
        assert_eq!(table.entry(SegmentId(1)).unwrap().state, SegmentState::Active);
    }

    /// Device wrapper that records every written log block since the last
    /// sync, to show the log never rewrites an address in place.
    struct RecordingDevice {
        inner: ByteBlockDevice<MemByteDevice>,
        geometry: Geometry,
        written: Mutex<Vec<u64>>,
    }

    impl RecordingDevice {
        fn record(&self, start: BlockNumber, count: u64) {
            let mut written = self.written.lock();
            for block in start.0..start.0 + count {
                if self.geometry.in_log(BlockNumber(block)) {
                    written.push(block);
                }
            }
        }
    }

    impl BlockDevice for RecordingDevice {
        fn read_block(&self, block: BlockNumber) -> lsfs_error::Result<Vec<u8>> {
            self.inner.read_block(block)
        }
        fn write_block(&self, block: BlockNumber, data: &[u8]) -> lsfs_error::Result<()> {
            self.record(block, 1);
            self.inner.write_block(block, data)
        }
        fn read_range(&self, start: BlockNumber, count: u32) -> lsfs_error::Result<Vec<u8>> {
            self.inner.read_range(start, count)
        }
        fn write_range(&self, start: BlockNumber, data: &[u8]) -> lsfs_error::Result<()> {
            self.record(start, (data.len() / BLOCK_SIZE) as u64);
            self.inner.write_range(start, data)
        }
        fn block_size(&self) -> u32 {
            self.inner.block_size()
        }
        fn block_count(&self) -> u64 {
            self.inner.block_count()
        }
        fn sync(&self) -> lsfs_error::Result<()> {
            self.written.lock().clear();
            self.inner.sync()
        }
    }

    #[test]
    fn no_log_address_is_rewritten_between_syncs() {
        let geometry = small_geometry(4);
        let dev = RecordingDevice {
            inner: mem_device(&geometry),
            geometry,
            written: Mutex::new(Vec::new()),
        };
        let (writer, table) = writer_with(geometry);

        let data = vec![0x61_u8; BLOCK_SIZE];
        // Enough appends to roll through two whole segments plus a tail.
        for i in 0..(2 * SEGMENT_PAYLOAD_CAPACITY + 10) {
            writer
                .append(&dev, &table, &data, InodeNumber(4), i, BlockKind::Data)
                .unwrap();
        }
        writer.flush(&dev, &table).unwrap();

        let written = dev.written.lock().clone();
        let mut deduped = written.clone();
        deduped.sort_unstable();
        deduped.dedup();
        assert_eq!(
            deduped.len(),
            written.len(),
            "a log address was written twice without an intervening sync"
        );
    }

    #[test]
    fn staged_blocks_are_readable_before_flush() {
        let geometry = small_geometry(4);
        let dev = mem_device(&geometry);
        let (writer, table) = writer_with(geometry);

        let data = vec![0x77_u8; BLOCK_SIZE];
        let addr = writer
            .append(&dev, &table, &data, InodeNumber(9), 0, BlockKind::Indirect)
            .unwrap();

        // Device still holds zeros, but the writer serves the staged copy.
        assert_eq!(dev.read_block(addr).unwrap(), vec![0_u8; BLOCK_SIZE]);
        assert_eq!(writer.read_block(&dev, addr).unwrap(), data);

        // After flush both agree.
        writer.flush(&dev, &table).unwrap();
        assert_eq!(writer.read_block(&dev, addr).unwrap(), data);
        assert_eq!(dev.read_block(addr).unwrap(), data);
    }

    #[test]
    fn empty_flush_is_a_no_op() {
        let geometry = small_geometry(2);
        let dev = mem_device(&geometry);
        let (writer, table) = writer_with(geometry);
        let outcome = writer.flush(&dev, &table).unwrap();
        assert!(!outcome.flushed);
        assert_eq!(writer.log_head(), BlockNumber(LOG_START));
    }

    #[test]
    fn append_flushes_at_payload_capacity() {
        let geometry = small_geometry(4);
        let dev = mem_device(&geometry);
        let (writer, table) = writer_with(geometry);

        let data = vec![0x33_u8; BLOCK_SIZE];
        for i in 0..SEGMENT_PAYLOAD_CAPACITY {
            writer
                .append(&dev, &table, &data, InodeNumber(3), i, BlockKind::Data)
                .unwrap();
        }
        assert_eq!(writer.staged_blocks(), SEGMENT_PAYLOAD_CAPACITY);

        // The next append rolls the segment.
        let address = writer
            .append(
                &dev,
                &table,
                &data,
                InodeNumber(3),
                SEGMENT_PAYLOAD_CAPACITY,
                BlockKind::Data,
            )
            .unwrap();
        assert_eq!(address, geometry.segment_block(SegmentId(1), 1));
        assert_eq!(table.entry(SegmentId(0)).unwrap().state, SegmentState::Full);
        assert_eq!(
            table.entry(SegmentId(0)).unwrap().live_blocks,
            SEGMENT_PAYLOAD_CAPACITY
        );
    }

    #[test]
    fn out_of_space_wakes_cleaner_and_fails_append() {
        let geometry = small_geometry(1);
        let dev = mem_device(&geometry);
        let signal = GcSignal::new();
        let table = SegmentTable::new(geometry);
        let writer = SegmentWriter::new(geometry, Arc::clone(&signal));

        // The sole segment is the reserve: data appends fail immediately.
        let data = vec![0x44_u8; BLOCK_SIZE];
        let err = writer
            .append(&dev, &table, &data, InodeNumber(3), 0, BlockKind::Data)
            .unwrap_err();
        assert!(matches!(err, LsfsError::NoSpace));
        // The cleaner wake was signalled.
        assert!(signal.wait(Duration::from_millis(0)));

        // Metadata appends may consume the reserve.
        writer
            .append(&dev, &table, &data, InodeNumber(3), 0, BlockKind::Inode)
            .unwrap();

        // Reclaim mode lets data appends through as well.
        writer.begin_reclaim();
        writer
            .append(&dev, &table, &data, InodeNumber(3), 1, BlockKind::Data)
            .unwrap();
        writer.end_reclaim();
    }
}
