#![forbid(unsafe_code)]
//! Cost-benefit segment cleaner for LSFS.
//!
//! A background thread watches the free-segment ratio and, under pressure,
//! picks under-utilised segments by `age * (1 - u) / (1 + u)`, copies their
//! live blocks to the log head, and returns them to the free pool. Liveness
//! is proven through current metadata only: the IMAP for inode blocks, the
//! owner's block index for data blocks, and the owner's pointer tree for
//! indirect blocks. Anything the cleaner cannot prove live is left alone
//! and collected on a later pass.

use lsfs_block::BlockDevice;
use lsfs_checkpoint::CheckpointManager;
use lsfs_error::{LsfsError, Result};
use lsfs_imap::InodeMap;
use lsfs_inode::{write_inode, InodeCache, InodeHandle, StoreCtx};
use lsfs_ondisk::{BlockKind, SegmentState, SegmentSummary, Superblock};
use lsfs_segment::{GcSignal, SegmentTable, SegmentWriter};
use lsfs_types::{now_secs, BlockNumber, Geometry, SegmentId, BLOCK_SIZE};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

// ── Configuration ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct CleanerConfig {
    /// Start cleaning below this free-segment percentage.
    pub low_water_pct: u32,
    /// Stop cleaning at or above this free-segment percentage.
    pub high_water_pct: u32,
    /// Only segments at or below this utilisation percentage are candidates.
    pub utilisation_cap_pct: u32,
    /// Per-pass work budget, in segments.
    pub max_segments_per_pass: u32,
    /// Watchdog wake interval.
    pub idle_wake: Duration,
}

impl Default for CleanerConfig {
    fn default() -> Self {
        Self {
            low_water_pct: 10,
            high_water_pct: 20,
            utilisation_cap_pct: 50,
            max_segments_per_pass: 5,
            idle_wake: Duration::from_secs(5),
        }
    }
}

// ── Context ─────────────────────────────────────────────────────────────────

/// Shared storage-engine components the cleaner operates on.
#[derive(Clone)]
pub struct GcContext {
    pub dev: Arc<dyn BlockDevice>,
    pub writer: Arc<SegmentWriter>,
    pub table: Arc<SegmentTable>,
    pub imap: Arc<InodeMap>,
    pub icache: Arc<InodeCache>,
    pub checkpoint: Arc<CheckpointManager>,
    pub sb: Arc<Mutex<Superblock>>,
    pub geometry: Geometry,
}

impl GcContext {
    fn store(&self) -> StoreCtx<'_> {
        StoreCtx {
            dev: self.dev.as_ref(),
            writer: &self.writer,
            table: &self.table,
            imap: &self.imap,
            geometry: &self.geometry,
        }
    }
}

// ── Selection ───────────────────────────────────────────────────────────────

/// True when the free-segment ratio is below the low-water mark.
#[must_use]
pub fn needed(table: &SegmentTable, config: &CleanerConfig) -> bool {
    let (free, total) = table.counts();
    total > 0 && free * 100 / total < config.low_water_pct
}

fn reached_high_water(table: &SegmentTable, config: &CleanerConfig) -> bool {
    let (free, total) = table.counts();
    total == 0 || free * 100 / total >= config.high_water_pct
}

/// Cost-benefit utility: prefers older and emptier segments.
#[must_use]
pub fn utility(live_blocks: u32, timestamp: u64, segment_blocks: u64, now: u64) -> f64 {
    let payload = (segment_blocks - 1) as f64;
    let utilisation = f64::from(live_blocks) / payload;
    if utilisation >= 1.0 {
        return -1.0;
    }
    let age = now.saturating_sub(timestamp) as f64;
    age * (1.0 - utilisation) / (1.0 + utilisation)
}

/// Pick the best cleaning candidate: full, at or below the utilisation cap,
/// maximising utility, ties to the lower segment id.
#[must_use]
pub fn select(table: &SegmentTable, config: &CleanerConfig, now: u64) -> Option<SegmentId> {
    let geometry = table.geometry();
    let payload = geometry.segment_blocks - 1;
    let mut best: Option<(SegmentId, f64)> = None;

    for entry in table.snapshot() {
        if entry.state != SegmentState::Full {
            continue;
        }
        let utilisation_pct = u64::from(entry.live_blocks) * 100 / payload;
        if utilisation_pct > u64::from(config.utilisation_cap_pct) {
            continue;
        }
        let score = utility(entry.live_blocks, entry.timestamp, geometry.segment_blocks, now);
        // Strictly-greater keeps the lowest id on ties (ascending scan).
        if best.map_or(true, |(_, b)| score > b) {
            best = Some((entry.segment_id, score));
        }
    }
    best.map(|(id, _)| id)
}

// ── Cleaning ────────────────────────────────────────────────────────────────

/// Counters from one segment clean.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CleanStats {
    pub relocated_blocks: u32,
    pub dead_blocks: u32,
}

/// Clean one segment: relocate provably-live blocks, then free it.
///
/// Corruption in the segment summary aborts the pass and leaves the
/// segment `full`.
pub fn clean_segment(ctx: &GcContext, segment: SegmentId) -> Result<CleanStats> {
    if !ctx.table.begin_cleaning(segment) {
        return Ok(CleanStats::default());
    }

    let Some(entry) = ctx.table.entry(segment) else {
        ctx.table.abort_cleaning(segment);
        return Ok(CleanStats::default());
    };

    if entry.live_blocks == 0 {
        free_segment(ctx, segment);
        debug!(target: "lsfs::gc", segment = segment.0, "freed empty segment");
        return Ok(CleanStats::default());
    }

    let seg_start = ctx.geometry.segment_start(segment);
    let raw_summary = match ctx.dev.read_block(seg_start) {
        Ok(raw) => raw,
        Err(err) => {
            ctx.table.abort_cleaning(segment);
            return Err(err);
        }
    };
    let summary = match SegmentSummary::parse_from_block(&raw_summary) {
        Ok(summary) if SegmentSummary::checksum_ok(&raw_summary, &summary.header) => summary,
        Ok(_) | Err(_) => {
            ctx.table.abort_cleaning(segment);
            return Err(LsfsError::Corruption {
                block: seg_start.0,
                detail: format!("segment {segment} summary invalid during cleaning"),
            });
        }
    };

    let body = match ctx.dev.read_range(seg_start, summary.header.block_count) {
        Ok(body) => body,
        Err(err) => {
            ctx.table.abort_cleaning(segment);
            return Err(err);
        }
    };

    info!(
        target: "lsfs::gc",
        segment = segment.0,
        live = entry.live_blocks,
        blocks = summary.header.block_count,
        "cleaning segment"
    );

    let mut stats = CleanStats::default();
    let mut touched: HashMap<u32, InodeHandle> = HashMap::new();
    let outcome = relocate_live_blocks(ctx, segment, &summary, &body, &mut touched, &mut stats);

    // Persist every inode whose pointers we rewrote before the segment is
    // reused; the end-of-pass checkpoint then captures a consistent image.
    let store = ctx.store();
    for handle in touched.values() {
        write_inode(&store, handle)?;
    }

    match outcome {
        Ok(()) => {
            free_segment(ctx, segment);
            info!(
                target: "lsfs::gc",
                segment = segment.0,
                relocated = stats.relocated_blocks,
                dead = stats.dead_blocks,
                "cleaned segment"
            );
            Ok(stats)
        }
        Err(err) => {
            // Blocks already relocated stay valid; the segment keeps its
            // remaining live data and another pass will retry.
            ctx.table.abort_cleaning(segment);
            Err(err)
        }
    }
}

fn free_segment(ctx: &GcContext, segment: SegmentId) {
    ctx.table.release(segment);
    let start = ctx.geometry.segment_start(segment);
    ctx.dev.invalidate_range(start, ctx.geometry.segment_blocks);
}

fn relocate_live_blocks(
    ctx: &GcContext,
    segment: SegmentId,
    summary: &SegmentSummary,
    body: &[u8],
    touched: &mut HashMap<u32, InodeHandle>,
    stats: &mut CleanStats,
) -> Result<()> {
    let store = ctx.store();
    let seg_start = ctx.geometry.segment_start(segment);

    for (i, info) in summary.entries.iter().enumerate() {
        if info.ino.0 == 0 {
            continue;
        }
        let slot = i + 1;
        let address = BlockNumber(seg_start.0 + slot as u64);
        let data = &body[slot * BLOCK_SIZE..(slot + 1) * BLOCK_SIZE];

        let handle = match ctx.icache.get(&store, info.ino) {
            Ok(handle) => handle,
            Err(LsfsError::NoEntry(_)) => {
                // Owner unlinked since the segment was written.
                stats.dead_blocks += 1;
                continue;
            }
            Err(err) => return Err(err),
        };

        // The per-inode lock makes the liveness check and the pointer
        // update atomic with respect to foreground writes.
        let mut state = handle.lock();
        let relocated = match info.kind {
            BlockKind::Inode => {
                if state.disk_location == address {
                    let new = ctx.writer.append(
                        ctx.dev.as_ref(),
                        &ctx.table,
                        data,
                        info.ino,
                        info.offset,
                        BlockKind::Inode,
                    )?;
                    ctx.imap.set(info.ino, new);
                    state.disk_location = new;
                    state.version += 1;
                    true
                } else {
                    false
                }
            }
            BlockKind::Data | BlockKind::Dirent => {
                let index = u64::from(info.offset);
                let current =
                    lsfs_index::lookup(ctx.dev.as_ref(), &ctx.writer, &state.disk, index)?;
                if current == Some(address) {
                    let new = ctx.writer.append(
                        ctx.dev.as_ref(),
                        &ctx.table,
                        data,
                        info.ino,
                        info.offset,
                        info.kind,
                    )?;
                    lsfs_index::set_leaf_pointer(
                        ctx.dev.as_ref(),
                        &ctx.writer,
                        &ctx.table,
                        &mut state.disk,
                        index,
                        new,
                    )?;
                    state.dirty = true;
                    true
                } else {
                    false
                }
            }
            BlockKind::Indirect => {
                if lsfs_index::references_indirect(
                    ctx.dev.as_ref(),
                    &ctx.writer,
                    &state.disk,
                    address,
                )? {
                    let new = ctx.writer.append(
                        ctx.dev.as_ref(),
                        &ctx.table,
                        data,
                        info.ino,
                        0,
                        BlockKind::Indirect,
                    )?;
                    let repointed = lsfs_index::repoint_indirect(
                        ctx.dev.as_ref(),
                        &ctx.writer,
                        &ctx.table,
                        &mut state.disk,
                        address,
                        new,
                    )?;
                    if repointed {
                        state.dirty = true;
                    }
                    repointed
                } else {
                    false
                }
            }
        };
        drop(state);

        if relocated {
            stats.relocated_blocks += 1;
            touched.insert(info.ino.0, handle);
        } else {
            stats.dead_blocks += 1;
        }
    }
    Ok(())
}

// ── Pass driver ─────────────────────────────────────────────────────────────

/// Counters from one cleaner pass.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassStats {
    pub segments_cleaned: u32,
    pub blocks_relocated: u32,
}

/// Clean segments until the high-water mark, the work budget, or the
/// candidate supply runs out. Ends with a flush and a checkpoint when
/// anything was cleaned.
pub fn run_pass(ctx: &GcContext, config: &CleanerConfig) -> Result<PassStats> {
    let mut stats = PassStats::default();

    // Relocation appends may use the segment reserve for the duration of
    // the pass.
    ctx.writer.begin_reclaim();
    let outcome = run_pass_inner(ctx, config, &mut stats);
    ctx.writer.end_reclaim();
    outcome?;

    if stats.segments_cleaned > 0 {
        ctx.writer.flush(ctx.dev.as_ref(), &ctx.table)?;
        ctx.checkpoint
            .write(ctx.dev.as_ref(), &ctx.writer, &ctx.table, &ctx.imap, &ctx.sb)?;
        info!(
            target: "lsfs::gc",
            cleaned = stats.segments_cleaned,
            relocated = stats.blocks_relocated,
            "cleaner pass complete"
        );
    }
    Ok(stats)
}

fn run_pass_inner(ctx: &GcContext, config: &CleanerConfig, stats: &mut PassStats) -> Result<()> {
    // Sweep fully-dead segments first: freeing them needs no append space,
    // so the pass makes progress even when the log is wedged.
    for entry in ctx.table.snapshot() {
        if entry.state == SegmentState::Full && entry.live_blocks == 0 {
            clean_segment(ctx, entry.segment_id)?;
            stats.segments_cleaned += 1;
        }
    }

    while !reached_high_water(&ctx.table, config) {
        let Some(candidate) = select(&ctx.table, config, now_secs()) else {
            debug!(target: "lsfs::gc", "no suitable cleaning candidate");
            break;
        };

        match clean_segment(ctx, candidate) {
            Ok(cleaned) => {
                stats.segments_cleaned += 1;
                stats.blocks_relocated += cleaned.relocated_blocks;
            }
            Err(err) => {
                warn!(target: "lsfs::gc", segment = candidate.0, %err, "cleaning failed");
                break;
            }
        }

        if stats.segments_cleaned >= config.max_segments_per_pass {
            break;
        }
    }
    Ok(())
}

// ── Background thread ───────────────────────────────────────────────────────

struct CleanerShared {
    running: AtomicBool,
    signal: Arc<GcSignal>,
}

/// Handle to the background cleaner thread.
pub struct Cleaner {
    shared: Arc<CleanerShared>,
    handle: Option<JoinHandle<()>>,
}

impl Cleaner {
    /// Start the cleaner. It wakes on `signal` (fired by the segment
    /// writer on allocation failure) or every `config.idle_wake`.
    pub fn spawn(ctx: GcContext, config: CleanerConfig, signal: Arc<GcSignal>) -> Result<Self> {
        let shared = Arc::new(CleanerShared {
            running: AtomicBool::new(true),
            signal,
        });

        let thread_shared = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name("lsfs-cleaner".into())
            .spawn(move || {
                info!(target: "lsfs::gc", "cleaner thread started");
                while thread_shared.running.load(Ordering::Acquire) {
                    let explicit = thread_shared.signal.wait(config.idle_wake);
                    if !thread_shared.running.load(Ordering::Acquire) {
                        break;
                    }
                    if explicit || needed(&ctx.table, &config) {
                        if let Err(err) = run_pass(&ctx, &config) {
                            error!(target: "lsfs::gc", %err, "cleaner pass failed");
                        }
                    }
                }
                info!(target: "lsfs::gc", "cleaner thread stopped");
            })
            .map_err(LsfsError::Io)?;

        Ok(Self {
            shared,
            handle: Some(handle),
        })
    }

    /// Request an immediate pass.
    pub fn trigger(&self) {
        self.shared.signal.notify();
    }

    /// Cooperative shutdown: clear the running flag, wake the thread, and
    /// wait for it to exit.
    pub fn shutdown(mut self) {
        self.shared.running.store(false, Ordering::Release);
        self.shared.signal.notify();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Cleaner {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        self.shared.signal.notify();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lsfs_block::{ByteBlockDevice, CachedBlockDevice, MemByteDevice};
    use lsfs_checkpoint::CheckpointConfig;
    use lsfs_types::{
        FileType, InodeNumber, CHECKPOINT0_START, CHECKPOINT1_START, LOG_START, LSFS_MAGIC,
        LSFS_VERSION, SEGMENT_BLOCKS, S_IFDIR, S_IFREG,
    };

    fn fixture(segments: u64) -> GcContext {
        let sb = Superblock {
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
            uuid: [1; 16],
            created_at: 1,
            mounted_at: 0,
            mount_count: 0,
            state: 0,
        };
        let geometry = sb.geometry();
        let raw = ByteBlockDevice::new(
            MemByteDevice::new(sb.total_blocks as usize * BLOCK_SIZE),
            BLOCK_SIZE as u32,
        )
        .unwrap();
        let dev: Arc<dyn BlockDevice> =
            Arc::new(CachedBlockDevice::new(raw, 128).unwrap());
        let signal = GcSignal::new();

        GcContext {
            dev,
            writer: Arc::new(SegmentWriter::new(geometry, signal)),
            table: Arc::new(SegmentTable::new(geometry)),
            imap: Arc::new(InodeMap::new()),
            icache: Arc::new(InodeCache::new(64)),
            checkpoint: Arc::new(CheckpointManager::new(CheckpointConfig::default())),
            sb: Arc::new(Mutex::new(sb)),
            geometry,
        }
    }

    fn default_config() -> CleanerConfig {
        CleanerConfig::default()
    }

    #[test]
    fn utility_prefers_older_and_emptier() {
        let now = 1000;
        // Emptier wins at equal age.
        let sparse = utility(10, 500, SEGMENT_BLOCKS, now);
        let dense = utility(500, 500, SEGMENT_BLOCKS, now);
        assert!(sparse > dense);
        // Older wins at equal utilisation.
        let old = utility(100, 100, SEGMENT_BLOCKS, now);
        let young = utility(100, 900, SEGMENT_BLOCKS, now);
        assert!(old > young);
        // Fully live is never a candidate.
        assert!(utility(1023, 0, SEGMENT_BLOCKS, now) < 0.0);
    }

    #[test]
    fn select_respects_cap_state_and_ties() {
        let ctx = fixture(6);
        let now = now_secs();

        // seg 0: full, empty-ish, old -> candidate
        let (s0, _) = ctx.table.alloc().unwrap();
        ctx.table.set_full(s0, 10, now - 100);
        // seg 1: full but over the 50% utilisation cap
        let (s1, _) = ctx.table.alloc().unwrap();
        ctx.table.set_full(s1, 900, now - 1000);
        // seg 2: active, not a candidate
        let (_s2, _) = ctx.table.alloc().unwrap();

        assert_eq!(select(&ctx.table, &default_config(), now), Some(s0));

        // Equal utility ties break to the lower id.
        let (s3, _) = ctx.table.alloc().unwrap();
        ctx.table.set_full(s3, 10, now - 100);
        assert_eq!(select(&ctx.table, &default_config(), now), Some(s0));
    }

    #[test]
    fn needed_tracks_low_water() {
        let ctx = fixture(10);
        let config = default_config();
        assert!(!needed(&ctx.table, &config));
        // Allocate down to the reserve, then take the reserve too:
        // 0 free out of 10 is below the 10% low-water mark.
        for _ in 0..9 {
            ctx.table.alloc().unwrap();
        }
        ctx.table.alloc_reserved().unwrap();
        assert!(needed(&ctx.table, &config));
    }

    #[test]
    fn clean_frees_fully_dead_segment() {
        let ctx = fixture(4);
        let store = ctx.store();

        // Build a file, flush, then delete it so the segment is all dead.
        let file = ctx.icache.alloc(&store, S_IFREG | 0o644, 0, 0).unwrap();
        {
            let mut state = file.lock();
            lsfs_index::write_block(
                ctx.dev.as_ref(),
                &ctx.writer,
                &ctx.table,
                &mut state.disk,
                0,
                &vec![9_u8; BLOCK_SIZE],
                BlockKind::Data,
            )
            .unwrap();
        }
        write_inode(&store, &file).unwrap();
        ctx.writer.flush(ctx.dev.as_ref(), &ctx.table).unwrap();

        lsfs_inode::free_inode(&store, &ctx.icache, &file).unwrap();
        drop(file);

        let seg = SegmentId(0);
        assert_eq!(ctx.table.entry(seg).unwrap().live_blocks, 0);
        let stats = clean_segment(&ctx, seg).unwrap();
        assert_eq!(stats.relocated_blocks, 0);
        assert_eq!(ctx.table.entry(seg).unwrap().state, SegmentState::Free);
    }

    #[test]
    fn clean_relocates_live_inode_and_data() {
        let ctx = fixture(4);
        let store = ctx.store();

        let file = ctx.icache.alloc(&store, S_IFREG | 0o644, 0, 0).unwrap();
        let ino = file.ino();
        let payload = vec![0x5C_u8; BLOCK_SIZE];
        {
            let mut state = file.lock();
            lsfs_index::write_block(
                ctx.dev.as_ref(),
                &ctx.writer,
                &ctx.table,
                &mut state.disk,
                0,
                &payload,
                BlockKind::Data,
            )
            .unwrap();
            state.disk.size = 11;
        }
        write_inode(&store, &file).unwrap();
        ctx.writer.flush(ctx.dev.as_ref(), &ctx.table).unwrap();
        drop(file);

        let seg = SegmentId(0);
        let live_before = ctx.table.entry(seg).unwrap().live_blocks;
        assert_eq!(live_before, 2);

        let stats = clean_segment(&ctx, seg).unwrap();
        assert_eq!(stats.relocated_blocks, 2);
        assert_eq!(ctx.table.entry(seg).unwrap().state, SegmentState::Free);

        // The file is intact through the relocated metadata.
        ctx.writer.flush(ctx.dev.as_ref(), &ctx.table).unwrap();
        let reloaded = ctx.icache.get(&store, ino).unwrap();
        let state = reloaded.lock();
        assert_eq!(state.disk.size, 11);
        let data = lsfs_index::read_block(ctx.dev.as_ref(), &ctx.writer, &state.disk, 0).unwrap();
        assert_eq!(data, payload);

        // The IMAP no longer points into the cleaned segment.
        let (location, _) = ctx.imap.get(ino).unwrap();
        let (loc_seg, _) = ctx.geometry.block_to_segment(location).unwrap();
        assert_ne!(loc_seg, seg);
    }

    #[test]
    fn clean_relocates_directory_bodies() {
        let ctx = fixture(4);
        let store = ctx.store();

        let dir = ctx.icache.alloc(&store, S_IFDIR | 0o755, 0, 0).unwrap();
        lsfs_dir::init(&store, &dir, InodeNumber(1)).unwrap();
        lsfs_dir::add(&store, &dir, b"kept", InodeNumber(33), FileType::RegularFile).unwrap();
        write_inode(&store, &dir).unwrap();
        ctx.writer.flush(ctx.dev.as_ref(), &ctx.table).unwrap();
        let ino = dir.ino();
        drop(dir);

        let stats = clean_segment(&ctx, SegmentId(0)).unwrap();
        assert!(stats.relocated_blocks >= 2); // dirent body + inode record

        ctx.writer.flush(ctx.dev.as_ref(), &ctx.table).unwrap();
        let reloaded = ctx.icache.get(&store, ino).unwrap();
        assert_eq!(
            lsfs_dir::lookup(&store, &reloaded, b"kept").unwrap(),
            Some((InodeNumber(33), FileType::RegularFile))
        );
    }

    #[test]
    fn corrupt_summary_aborts_and_leaves_full() {
        let ctx = fixture(4);
        let store = ctx.store();

        let file = ctx.icache.alloc(&store, S_IFREG | 0o644, 0, 0).unwrap();
        write_inode(&store, &file).unwrap();
        ctx.writer.flush(ctx.dev.as_ref(), &ctx.table).unwrap();
        drop(file);

        // Smash the summary magic.
        let seg_start = ctx.geometry.segment_start(SegmentId(0));
        let mut raw = ctx.dev.read_block(seg_start).unwrap();
        raw[0] ^= 0xFF;
        ctx.dev.write_block(seg_start, &raw).unwrap();
        ctx.dev.sync().unwrap();

        assert!(matches!(
            clean_segment(&ctx, SegmentId(0)),
            Err(LsfsError::Corruption { .. })
        ));
        assert_eq!(
            ctx.table.entry(SegmentId(0)).unwrap().state,
            SegmentState::Full
        );
    }

    #[test]
    fn run_pass_checkpoints_after_cleaning() {
        let ctx = fixture(4);
        let store = ctx.store();

        // Two sparse full segments built from short-lived files.
        for round in 0..2 {
            let file = ctx.icache.alloc(&store, S_IFREG | 0o644, 0, 0).unwrap();
            {
                let mut state = file.lock();
                lsfs_index::write_block(
                    ctx.dev.as_ref(),
                    &ctx.writer,
                    &ctx.table,
                    &mut state.disk,
                    0,
                    &vec![round as u8; BLOCK_SIZE],
                    BlockKind::Data,
                )
                .unwrap();
            }
            write_inode(&store, &file).unwrap();
            ctx.writer.flush(ctx.dev.as_ref(), &ctx.table).unwrap();
        }

        // Make the table look pressured: everything allocated.
        while ctx.table.alloc().is_ok() {}
        let config = CleanerConfig {
            high_water_pct: 100,
            ..CleanerConfig::default()
        };

        let seq_before = ctx.checkpoint.sequence();
        let stats = run_pass(&ctx, &config).unwrap();
        assert!(stats.segments_cleaned > 0);
        assert_eq!(ctx.checkpoint.sequence(), seq_before + 1);
    }

    #[test]
    fn cleaner_thread_shuts_down_cooperatively() {
        let ctx = fixture(4);
        let signal = GcSignal::new();
        let cleaner = Cleaner::spawn(
            ctx,
            CleanerConfig {
                idle_wake: Duration::from_millis(20),
                ..CleanerConfig::default()
            },
            Arc::clone(&signal),
        )
        .unwrap();
        cleaner.trigger();
        std::thread::sleep(Duration::from_millis(50));
        cleaner.shutdown();
    }
}
