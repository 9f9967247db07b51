#![forbid(unsafe_code)]
//! In-memory inodes and the inode cache for LSFS.
//!
//! Cached inodes are shared out as `Arc` handles; the reference count
//! doubles as the pin count, so eviction only considers entries no caller
//! holds. Dirty inodes are appended to the log (never written in place),
//! which moves their on-disk location and updates the inode map.

use lsfs_block::BlockDevice;
use lsfs_error::{LsfsError, Result};
use lsfs_imap::InodeMap;
use lsfs_ondisk::{inode_record_in_block, BlockKind, DiskInode};
use lsfs_segment::{SegmentTable, SegmentWriter};
use lsfs_types::{now_nanos, BlockNumber, Geometry, InodeNumber, BLOCK_SIZE, INODE_SIZE};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Default inode cache capacity.
pub const DEFAULT_INODE_CACHE_SIZE: usize = 1024;

// ── Store context ───────────────────────────────────────────────────────────

/// The storage-engine components an inode operation needs.
///
/// Passed explicitly rather than through ambient state; the mount owns the
/// referenced pieces.
#[derive(Clone, Copy)]
pub struct StoreCtx<'a> {
    pub dev: &'a dyn BlockDevice,
    pub writer: &'a SegmentWriter,
    pub table: &'a SegmentTable,
    pub imap: &'a InodeMap,
    pub geometry: &'a Geometry,
}

// ── In-memory inode ─────────────────────────────────────────────────────────

/// Mutable state of a cached inode, guarded by the per-inode lock.
#[derive(Debug, Clone)]
pub struct InodeState {
    pub disk: DiskInode,
    /// Block address the record was read from; zero before the first write.
    pub disk_location: BlockNumber,
    /// Mirrors the IMAP version for stale-read detection.
    pub version: u32,
    pub dirty: bool,
}

/// A cached inode. Clone the `Arc` to take a reference.
#[derive(Debug)]
pub struct CachedInode {
    ino: InodeNumber,
    state: Mutex<InodeState>,
}

/// Shared handle to a cached inode.
pub type InodeHandle = Arc<CachedInode>;

impl CachedInode {
    #[must_use]
    pub fn ino(&self) -> InodeNumber {
        self.ino
    }

    /// Lock the inode for mutation or a consistent read.
    pub fn lock(&self) -> parking_lot::MutexGuard<'_, InodeState> {
        self.state.lock()
    }
}

// ── Inode cache ─────────────────────────────────────────────────────────────

struct CacheSlot {
    handle: InodeHandle,
    tick: u64,
}

struct CacheInner {
    map: HashMap<u32, CacheSlot>,
    tick: u64,
}

/// Fixed-capacity inode cache with LRU eviction.
pub struct InodeCache {
    capacity: usize,
    inner: Mutex<CacheInner>,
}

impl InodeCache {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(CacheInner {
                map: HashMap::new(),
                tick: 0,
            }),
        }
    }

    /// Number of resident inodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().map.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().map.is_empty()
    }

    /// Fetch `ino`, reading it through the IMAP on a miss.
    pub fn get(&self, ctx: &StoreCtx<'_>, ino: InodeNumber) -> Result<InodeHandle> {
        if let Some(handle) = self.lookup(ino) {
            return Ok(handle);
        }

        // Miss: resolve through the IMAP and read the containing block
        // outside the cache lock. The record may still be staged in the
        // active segment.
        let Some((location, version)) = ctx.imap.get(ino) else {
            return Err(LsfsError::NoEntry(format!("inode {ino}")));
        };
        let block = ctx.writer.read_block(ctx.dev, location)?;
        let disk = inode_record_in_block(&block, ino)?;
        if disk.ino != ino {
            return Err(LsfsError::Corruption {
                block: location.0,
                detail: format!("inode record slot holds {} instead of {ino}", disk.ino),
            });
        }

        let handle = Arc::new(CachedInode {
            ino,
            state: Mutex::new(InodeState {
                disk,
                disk_location: location,
                version,
                dirty: false,
            }),
        });
        self.install(ctx, ino, handle)
    }

    /// Allocate a fresh inode: new number, current timestamps, random
    /// generation, installed dirty.
    pub fn alloc(&self, ctx: &StoreCtx<'_>, mode: u32, uid: u32, gid: u32) -> Result<InodeHandle> {
        let ino = ctx.imap.alloc_ino().ok_or(LsfsError::NoSpace)?;
        let now = now_nanos();

        let mut disk = DiskInode::new(ino, mode);
        disk.uid = uid;
        disk.gid = gid;
        disk.atime = now;
        disk.mtime = now;
        disk.ctime = now;
        disk.nlink = 1;
        disk.generation = rand::random();

        let handle = Arc::new(CachedInode {
            ino,
            state: Mutex::new(InodeState {
                disk,
                disk_location: BlockNumber(0),
                version: 0,
                dirty: true,
            }),
        });
        debug!(target: "lsfs::inode", ino = ino.0, mode, "allocated inode");
        self.install(ctx, ino, handle)
    }

    fn lookup(&self, ino: InodeNumber) -> Option<InodeHandle> {
        let mut inner = self.inner.lock();
        inner.tick += 1;
        let tick = inner.tick;
        let slot = inner.map.get_mut(&ino.0)?;
        slot.tick = tick;
        Some(Arc::clone(&slot.handle))
    }

    fn install(
        &self,
        ctx: &StoreCtx<'_>,
        ino: InodeNumber,
        handle: InodeHandle,
    ) -> Result<InodeHandle> {
        loop {
            let victim = {
                let mut inner = self.inner.lock();
                if inner.map.contains_key(&ino.0) {
                    // Lost a race with a concurrent miss; use the resident
                    // entry and drop ours.
                    inner.tick += 1;
                    let tick = inner.tick;
                    let slot = inner.map.get_mut(&ino.0).unwrap();
                    slot.tick = tick;
                    return Ok(Arc::clone(&slot.handle));
                }
                if inner.map.len() < self.capacity {
                    inner.tick += 1;
                    let tick = inner.tick;
                    inner.map.insert(
                        ino.0,
                        CacheSlot {
                            handle: Arc::clone(&handle),
                            tick,
                        },
                    );
                    return Ok(handle);
                }
                // Pick the least-recently-used unpinned entry.
                inner
                    .map
                    .values()
                    .filter(|slot| Arc::strong_count(&slot.handle) == 1)
                    .min_by_key(|slot| slot.tick)
                    .map(|slot| Arc::clone(&slot.handle))
            };

            match victim {
                Some(victim) => self.evict(ctx, &victim)?,
                None => {
                    // Everything pinned; admit over capacity.
                    warn!(
                        target: "lsfs::inode",
                        capacity = self.capacity,
                        "inode cache over capacity: all entries pinned"
                    );
                    let mut inner = self.inner.lock();
                    inner.tick += 1;
                    let tick = inner.tick;
                    inner.map.insert(
                        ino.0,
                        CacheSlot {
                            handle: Arc::clone(&handle),
                            tick,
                        },
                    );
                    return Ok(handle);
                }
            }
        }
    }

    /// Write back (if dirty) and drop one unpinned entry.
    fn evict(&self, ctx: &StoreCtx<'_>, victim: &InodeHandle) -> Result<()> {
        write_inode(ctx, victim)?;
        let mut inner = self.inner.lock();
        let evict = inner.map.get(&victim.ino.0).is_some_and(|slot| {
            Arc::ptr_eq(&slot.handle, victim) && Arc::strong_count(&slot.handle) == 2
        });
        if evict {
            inner.map.remove(&victim.ino.0);
            trace!(target: "lsfs::inode", ino = victim.ino.0, "evicted inode");
        }
        Ok(())
    }

    /// Drop a reclaimed inode from the cache.
    pub fn forget(&self, ino: InodeNumber) {
        self.inner.lock().map.remove(&ino.0);
    }

    /// Write back every dirty resident inode (unmount, checkpoint barrier).
    pub fn flush_dirty(&self, ctx: &StoreCtx<'_>) -> Result<usize> {
        let handles: Vec<InodeHandle> = {
            let inner = self.inner.lock();
            inner
                .map
                .values()
                .map(|slot| Arc::clone(&slot.handle))
                .collect()
        };

        let mut written = 0_usize;
        for handle in handles {
            if handle.lock().dirty {
                write_inode(ctx, &handle)?;
                written += 1;
            }
        }
        Ok(written)
    }
}

// ── Inode persistence ───────────────────────────────────────────────────────

/// Append a dirty inode's record to the log and update the IMAP.
///
/// The record occupies slot `ino % 16` of a freshly-zeroed block; the rest
/// of the block is zero. The previous location is marked dead first.
pub fn write_inode(ctx: &StoreCtx<'_>, handle: &InodeHandle) -> Result<()> {
    let mut state = handle.lock();
    if !state.dirty {
        return Ok(());
    }

    let mut block = vec![0_u8; BLOCK_SIZE];
    let offset = handle.ino().block_offset();
    block[offset..offset + INODE_SIZE].copy_from_slice(&state.disk.to_bytes());

    let new_location = ctx.writer.append(
        ctx.dev,
        ctx.table,
        &block,
        handle.ino(),
        0,
        BlockKind::Inode,
    )?;

    if state.disk_location.0 != 0 {
        ctx.table.mark_dead(state.disk_location);
    }
    ctx.imap.set(handle.ino(), new_location);

    state.disk_location = new_location;
    state.version += 1;
    state.dirty = false;
    trace!(
        target: "lsfs::inode",
        ino = handle.ino().0,
        block = new_location.0,
        "wrote inode record"
    );
    Ok(())
}

/// Reclaim an inode whose link count reached zero.
///
/// Marks all referenced blocks and the record itself dead, removes the IMAP
/// entry, and flags the in-memory copy deleted.
pub fn free_inode(ctx: &StoreCtx<'_>, cache: &InodeCache, handle: &InodeHandle) -> Result<()> {
    let ino = handle.ino();
    {
        let mut state = handle.lock();
        lsfs_index::free_all(ctx.dev, ctx.writer, ctx.table, &mut state.disk)?;
        if state.disk_location.0 != 0 {
            ctx.table.mark_dead(state.disk_location);
            state.disk_location = BlockNumber(0);
        }
        state.disk.flags |= lsfs_types::INODE_FLAG_DELETED;
        state.dirty = false;
    }
    // An inode that was allocated but never persisted has no map entry.
    if ctx.imap.contains(ino) {
        ctx.imap.remove(ino)?;
    }
    cache.forget(ino);
    debug!(target: "lsfs::inode", ino = ino.0, "freed inode");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use lsfs_block::{ByteBlockDevice, MemByteDevice};
    use lsfs_segment::GcSignal;
    use lsfs_types::{Geometry, LOG_START, SEGMENT_BLOCKS, S_IFDIR, S_IFREG};

    struct Fixture {
        dev: ByteBlockDevice<MemByteDevice>,
        writer: SegmentWriter,
        table: SegmentTable,
        imap: InodeMap,
        geometry: Geometry,
    }

    impl Fixture {
        fn new() -> Self {
            let geometry = Geometry {
                block_size: BLOCK_SIZE as u32,
                segment_blocks: SEGMENT_BLOCKS,
                total_blocks: LOG_START + 8 * SEGMENT_BLOCKS,
                total_segments: 8,
                log_start: LOG_START,
            };
            Self {
                dev: ByteBlockDevice::new(
                    MemByteDevice::new(geometry.total_blocks as usize * BLOCK_SIZE),
                    BLOCK_SIZE as u32,
                )
                .unwrap(),
                writer: SegmentWriter::new(geometry, GcSignal::new()),
                table: SegmentTable::new(geometry),
                imap: InodeMap::new(),
                geometry,
            }
        }

        fn ctx(&self) -> StoreCtx<'_> {
            StoreCtx {
                dev: &self.dev,
                writer: &self.writer,
                table: &self.table,
                imap: &self.imap,
                geometry: &self.geometry,
            }
        }
    }

    #[test]
    fn alloc_initialises_fields() {
        let f = Fixture::new();
        let cache = InodeCache::new(16);
        let handle = cache.alloc(&f.ctx(), S_IFREG | 0o644, 1000, 1000).unwrap();

        let state = handle.lock();
        assert_eq!(state.disk.mode, S_IFREG | 0o644);
        assert_eq!(state.disk.uid, 1000);
        assert_eq!(state.disk.nlink, 1);
        assert!(state.dirty);
        assert!(state.disk.atime > 0);
        assert_eq!(state.disk_location, BlockNumber(0));
        assert!(handle.ino().is_valid());
    }

    #[test]
    fn write_then_get_round_trips_through_disk() {
        let f = Fixture::new();
        let cache = InodeCache::new(16);
        let handle = cache.alloc(&f.ctx(), S_IFREG | 0o600, 42, 43).unwrap();
        let ino = handle.ino();
        handle.lock().disk.size = 12345;

        write_inode(&f.ctx(), &handle).unwrap();
        f.writer.flush(&f.dev, &f.table).unwrap();

        // The IMAP points at the appended record block.
        let (location, version) = f.imap.get(ino).unwrap();
        assert_eq!(version, 1);
        assert_eq!(handle.lock().disk_location, location);
        assert!(!handle.lock().dirty);

        // A cold cache re-reads the record from disk.
        let cold = InodeCache::new(16);
        let reloaded = cold.get(&f.ctx(), ino).unwrap();
        let state = reloaded.lock();
        assert_eq!(state.disk.size, 12345);
        assert_eq!(state.disk.uid, 42);
        assert_eq!(state.disk_location, location);
    }

    #[test]
    fn record_lands_in_its_slot() {
        let f = Fixture::new();
        let cache = InodeCache::new(16);
        let handle = cache.alloc(&f.ctx(), S_IFREG | 0o644, 0, 0).unwrap();
        let ino = handle.ino();

        write_inode(&f.ctx(), &handle).unwrap();
        f.writer.flush(&f.dev, &f.table).unwrap();

        let (location, _) = f.imap.get(ino).unwrap();
        let block = f.dev.read_block(location).unwrap();
        let record = inode_record_in_block(&block, ino).unwrap();
        assert_eq!(record.ino, ino);

        // Other slots of the block stay zero.
        let other_slot = (ino.0 + 1) % lsfs_types::INODES_PER_BLOCK;
        let offset = other_slot as usize * INODE_SIZE;
        assert!(block[offset..offset + INODE_SIZE].iter().all(|b| *b == 0));
    }

    #[test]
    fn rewrite_bumps_version_and_kills_old_location() {
        let f = Fixture::new();
        let cache = InodeCache::new(16);
        let handle = cache.alloc(&f.ctx(), S_IFREG | 0o644, 0, 0).unwrap();

        write_inode(&f.ctx(), &handle).unwrap();
        let first = handle.lock().disk_location;

        handle.lock().dirty = true;
        write_inode(&f.ctx(), &handle).unwrap();
        let second = handle.lock().disk_location;

        assert_ne!(first, second);
        assert_eq!(f.imap.get(handle.ino()).unwrap().1, 2);
        assert_eq!(handle.lock().version, 2);
    }

    #[test]
    fn clean_write_is_a_no_op() {
        let f = Fixture::new();
        let cache = InodeCache::new(16);
        let handle = cache.alloc(&f.ctx(), S_IFREG | 0o644, 0, 0).unwrap();
        write_inode(&f.ctx(), &handle).unwrap();

        let before = f.writer.appends_since_checkpoint();
        write_inode(&f.ctx(), &handle).unwrap();
        assert_eq!(f.writer.appends_since_checkpoint(), before);
    }

    #[test]
    fn get_missing_inode_is_no_entry() {
        let f = Fixture::new();
        let cache = InodeCache::new(16);
        assert!(matches!(
            cache.get(&f.ctx(), InodeNumber(99)),
            Err(LsfsError::NoEntry(_))
        ));
    }

    #[test]
    fn eviction_writes_back_dirty_entries() {
        let f = Fixture::new();
        let cache = InodeCache::new(2);

        let a = cache.alloc(&f.ctx(), S_IFREG | 0o644, 0, 0).unwrap();
        let ino_a = a.ino();
        a.lock().disk.size = 777;
        drop(a); // unpin

        let _b = cache.alloc(&f.ctx(), S_IFREG | 0o644, 0, 0).unwrap();
        // Third allocation evicts the LRU unpinned entry (a), writing it.
        let _c = cache.alloc(&f.ctx(), S_IFREG | 0o644, 0, 0).unwrap();
        assert!(cache.len() <= 2);

        f.writer.flush(&f.dev, &f.table).unwrap();
        let cold = InodeCache::new(4);
        let reloaded = cold.get(&f.ctx(), ino_a).unwrap();
        assert_eq!(reloaded.lock().disk.size, 777);
    }

    #[test]
    fn flush_dirty_writes_everything() {
        let f = Fixture::new();
        let cache = InodeCache::new(8);
        let mut inos = Vec::new();
        for i in 0..3_u64 {
            let handle = cache.alloc(&f.ctx(), S_IFREG | 0o644, 0, 0).unwrap();
            handle.lock().disk.size = i * 100;
            inos.push(handle.ino());
        }

        let written = cache.flush_dirty(&f.ctx()).unwrap();
        assert_eq!(written, 3);
        assert_eq!(cache.flush_dirty(&f.ctx()).unwrap(), 0);
        for ino in inos {
            assert!(f.imap.get(ino).is_some());
        }
    }

    #[test]
    fn free_inode_reclaims_blocks_and_mapping() {
        let f = Fixture::new();
        let cache = InodeCache::new(8);
        let handle = cache.alloc(&f.ctx(), S_IFDIR | 0o755, 0, 0).unwrap();
        let ino = handle.ino();

        // Give it a data block and persist.
        {
            let mut state = handle.lock();
            lsfs_index::write_block(
                &f.dev,
                &f.writer,
                &f.table,
                &mut state.disk,
                0,
                &vec![7_u8; BLOCK_SIZE],
                BlockKind::Data,
            )
            .unwrap();
        }
        write_inode(&f.ctx(), &handle).unwrap();
        f.writer.flush(&f.dev, &f.table).unwrap();
        let live_before = f.table.entry(lsfs_types::SegmentId(0)).unwrap().live_blocks;
        assert_eq!(live_before, 2);

        free_inode(&f.ctx(), &cache, &handle).unwrap();
        assert!(f.imap.get(ino).is_none());
        assert_eq!(f.table.entry(lsfs_types::SegmentId(0)).unwrap().live_blocks, 0);
        assert!(handle.lock().disk.flags & lsfs_types::INODE_FLAG_DELETED != 0);

        // The cache no longer serves it.
        drop(handle);
        assert!(cache.get(&f.ctx(), ino).is_err());
    }
}
