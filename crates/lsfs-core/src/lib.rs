#![forbid(unsafe_code)]
//! The LSFS storage engine.
//!
//! `Lsfs` owns the mounted filesystem: the block device and buffer cache,
//! the inode map, the segment writer and table, the inode cache, the
//! checkpoint manager, and the background cleaner. The [`FsOps`] trait is
//! the upcall surface the FUSE adapter drives; `format`, `check`, and
//! `inspect` are the image utilities.

pub mod check;
pub mod format;
pub mod inspect;

use lsfs_block::{BlockDevice, ByteBlockDevice, CachedBlockDevice, FileByteDevice};
use lsfs_checkpoint::{CheckpointConfig, CheckpointManager, RecoveryReport};
use lsfs_error::{LsfsError, Result};
use lsfs_gc::{Cleaner, CleanerConfig, GcContext};
use lsfs_imap::InodeMap;
use lsfs_inode::{free_inode, write_inode, InodeCache, InodeHandle, StoreCtx};
use lsfs_ondisk::{dirent_record_size, BlockKind, Superblock, SB_STATE_CLEAN, SB_STATE_DIRTY};
use lsfs_segment::{GcSignal, SegmentTable, SegmentWriter};
use lsfs_types::{
    blocks_for_size, now_nanos, FileType, Geometry, InodeNumber, BLOCK_SIZE, MAX_INODES, NAME_MAX,
    ROOT_INO, SUPERBLOCK_BLOCK, S_IFDIR, S_IFMT, S_IFREG,
};
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

pub use lsfs_inode::DEFAULT_INODE_CACHE_SIZE;

// ── Upcall types ────────────────────────────────────────────────────────────

/// Attributes of one inode, as the adapter reports them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InodeAttr {
    pub ino: InodeNumber,
    pub size: u64,
    /// 512-byte units, as `stat` reports them.
    pub blocks: u64,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
    pub kind: FileType,
    pub perm: u16,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub blksize: u32,
    pub generation: u64,
}

/// One directory entry from `readdir`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub ino: InodeNumber,
    pub kind: FileType,
    pub name: Vec<u8>,
    /// Cookie to resume listing after this entry.
    pub next_offset: u64,
}

/// Fields a `setattr` call may change. Timestamps are nanoseconds since
/// the epoch.
#[derive(Debug, Default, Clone, Copy)]
pub struct SetAttrRequest {
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub size: Option<u64>,
    pub atime: Option<u64>,
    pub mtime: Option<u64>,
}

/// Filesystem-level statistics for `statfs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsStats {
    pub block_size: u32,
    pub total_blocks: u64,
    pub free_blocks: u64,
    pub total_inodes: u64,
    pub free_inodes: u64,
    pub name_max: u32,
}

/// The operation surface consumed by the kernel-bridge adapter.
pub trait FsOps: Send + Sync {
    fn lookup(&self, parent: InodeNumber, name: &[u8]) -> Result<InodeAttr>;
    fn getattr(&self, ino: InodeNumber) -> Result<InodeAttr>;
    fn setattr(&self, ino: InodeNumber, request: &SetAttrRequest) -> Result<InodeAttr>;
    fn readdir(&self, ino: InodeNumber, offset: u64, size: u32) -> Result<Vec<DirEntry>>;
    fn open(&self, ino: InodeNumber) -> Result<()>;
    fn read(&self, ino: InodeNumber, offset: u64, size: u32) -> Result<Vec<u8>>;
    fn write(&self, ino: InodeNumber, offset: u64, data: &[u8]) -> Result<u32>;
    fn create(
        &self,
        parent: InodeNumber,
        name: &[u8],
        mode: u32,
        uid: u32,
        gid: u32,
    ) -> Result<InodeAttr>;
    fn mkdir(
        &self,
        parent: InodeNumber,
        name: &[u8],
        mode: u32,
        uid: u32,
        gid: u32,
    ) -> Result<InodeAttr>;
    fn unlink(&self, parent: InodeNumber, name: &[u8]) -> Result<()>;
    fn rmdir(&self, parent: InodeNumber, name: &[u8]) -> Result<()>;
    fn rename(
        &self,
        parent: InodeNumber,
        name: &[u8],
        new_parent: InodeNumber,
        new_name: &[u8],
    ) -> Result<()>;
    fn statfs(&self) -> Result<FsStats>;
    fn fsync(&self, ino: InodeNumber) -> Result<()>;
}

// ── Mount configuration ─────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct MountConfig {
    pub read_only: bool,
    /// Buffer cache capacity in blocks.
    pub cache_blocks: usize,
    /// Inode cache capacity.
    pub inode_cache: usize,
    pub checkpoint: CheckpointConfig,
    pub cleaner: CleanerConfig,
    /// Start the background cleaner thread (tests drive passes manually).
    pub background_cleaner: bool,
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            read_only: false,
            cache_blocks: lsfs_block::DEFAULT_CACHE_BLOCKS,
            inode_cache: DEFAULT_INODE_CACHE_SIZE,
            checkpoint: CheckpointConfig::default(),
            cleaner: CleanerConfig::default(),
            background_cleaner: true,
        }
    }
}

// ── Filesystem context ──────────────────────────────────────────────────────

struct FsInner {
    dev: Arc<dyn BlockDevice>,
    sb: Arc<Mutex<Superblock>>,
    geometry: Geometry,
    imap: Arc<InodeMap>,
    table: Arc<SegmentTable>,
    writer: Arc<SegmentWriter>,
    icache: Arc<InodeCache>,
    checkpoint: Arc<CheckpointManager>,
    gc_signal: Arc<GcSignal>,
    cleaner_config: CleanerConfig,
    /// Serialises the ordering-sensitive prefix of durability events.
    write_lock: Mutex<()>,
    read_only: bool,
}

/// A mounted LSFS filesystem.
pub struct Lsfs {
    inner: Arc<FsInner>,
    cleaner: Mutex<Option<Cleaner>>,
    recovery: RecoveryReport,
}

impl Lsfs {
    /// Open an image and bring the filesystem to a servable state.
    ///
    /// Recovery (checkpoint load plus roll-forward) runs to completion
    /// before this returns; no user operation observes a pre-recovery
    /// image.
    pub fn mount(path: impl AsRef<Path>, config: MountConfig) -> Result<Self> {
        let path = path.as_ref();
        let file = if config.read_only {
            FileByteDevice::open_read_only(path)?
        } else {
            FileByteDevice::open(path)?
        };
        let read_only = config.read_only || !file.is_writable();

        let raw = ByteBlockDevice::new(file, BLOCK_SIZE as u32)?;
        let cached = CachedBlockDevice::new(raw, config.cache_blocks)?;

        let sb = Superblock::parse_from_block(&cached.read_block(lsfs_types::BlockNumber(
            SUPERBLOCK_BLOCK,
        ))?)?;
        if sb.total_blocks > cached.block_count() {
            return Err(LsfsError::Corruption {
                block: SUPERBLOCK_BLOCK,
                detail: format!(
                    "superblock claims {} blocks but the image holds {}",
                    sb.total_blocks,
                    cached.block_count()
                ),
            });
        }
        if sb.state == SB_STATE_DIRTY {
            // Unclean shutdown is not an error; roll-forward handles it.
            warn!(target: "lsfs::core", "image was not cleanly unmounted");
        }
        let geometry = sb.geometry();

        let dev: Arc<dyn BlockDevice> = Arc::new(cached);
        let table = Arc::new(SegmentTable::load_from(dev.as_ref(), geometry)?);
        let gc_signal = GcSignal::new();
        let writer = Arc::new(SegmentWriter::new(geometry, Arc::clone(&gc_signal)));
        let imap = Arc::new(InodeMap::new());
        let icache = Arc::new(InodeCache::new(config.inode_cache));
        let checkpoint = Arc::new(CheckpointManager::new(config.checkpoint));
        let sb = Arc::new(Mutex::new(sb));

        let recovery = if read_only {
            checkpoint.replay(dev.as_ref(), &writer, &table, &imap, &sb)?
        } else {
            checkpoint.recover(dev.as_ref(), &writer, &table, &imap, &sb)?
        };

        if !read_only {
            let mut guard = sb.lock();
            guard.mounted_at = lsfs_types::now_secs();
            guard.mount_count += 1;
            guard.state = SB_STATE_DIRTY;
            dev.write_block(lsfs_types::BlockNumber(SUPERBLOCK_BLOCK), &guard.to_block())?;
            drop(guard);
            dev.sync()?;
        }

        let inner = Arc::new(FsInner {
            dev,
            sb,
            geometry,
            imap,
            table,
            writer,
            icache,
            checkpoint,
            gc_signal: Arc::clone(&gc_signal),
            cleaner_config: config.cleaner,
            write_lock: Mutex::new(()),
            read_only,
        });

        let cleaner = if !read_only && config.background_cleaner {
            Some(Cleaner::spawn(inner.gc_context(), config.cleaner, gc_signal)?)
        } else {
            None
        };

        info!(
            target: "lsfs::core",
            path = %path.display(),
            read_only,
            segments = geometry.total_segments,
            "mounted"
        );
        Ok(Self {
            inner,
            cleaner: Mutex::new(cleaner),
            recovery,
        })
    }

    /// Recovery outcome of this mount.
    #[must_use]
    pub fn recovery(&self) -> RecoveryReport {
        self.recovery
    }

    /// Cleanly unmount: final checkpoint, clean flag, durable superblock.
    pub fn unmount(self) -> Result<()> {
        self.stop_cleaner();
        if self.inner.read_only {
            return Ok(());
        }

        let inner = &self.inner;
        let store = inner.store();
        inner.icache.flush_dirty(&store)?;
        inner.writer.flush(inner.dev.as_ref(), &inner.table)?;
        inner.checkpoint.write(
            inner.dev.as_ref(),
            &inner.writer,
            &inner.table,
            &inner.imap,
            &inner.sb,
        )?;

        {
            let mut sb = inner.sb.lock();
            sb.state = SB_STATE_CLEAN;
            inner
                .dev
                .write_block(lsfs_types::BlockNumber(SUPERBLOCK_BLOCK), &sb.to_block())?;
        }
        inner.dev.sync()?;
        info!(target: "lsfs::core", "unmounted cleanly");
        Ok(())
    }

    /// Flush the active segment and force durability, without emitting a
    /// checkpoint. Dropping the handle afterwards models a crash.
    pub fn sync_data(&self) -> Result<()> {
        let inner = &self.inner;
        let store = inner.store();
        inner.icache.flush_dirty(&store)?;
        {
            let _durability = inner.write_lock.lock();
            inner.writer.flush(inner.dev.as_ref(), &inner.table)?;
        }
        inner.dev.sync()
    }

    /// Run one synchronous cleaner pass (tests and pressure handling when
    /// the background thread is disabled).
    pub fn run_cleaner_pass(&self) -> Result<lsfs_gc::PassStats> {
        lsfs_gc::run_pass(&self.inner.gc_context(), &self.inner.cleaner_config)
    }

    /// Free/total segment counts.
    #[must_use]
    pub fn segment_counts(&self) -> (u32, u32) {
        self.inner.table.counts()
    }

    /// Sequence of the most recent checkpoint.
    #[must_use]
    pub fn checkpoint_sequence(&self) -> u64 {
        self.inner.checkpoint.sequence()
    }

    fn stop_cleaner(&self) {
        if let Some(cleaner) = self.cleaner.lock().take() {
            cleaner.shutdown();
        }
    }
}

impl Drop for Lsfs {
    fn drop(&mut self) {
        // An un-unmounted drop behaves like a crash, but the cleaner thread
        // must not outlive the handle.
        self.stop_cleaner();
    }
}

impl FsInner {
    fn store(&self) -> StoreCtx<'_> {
        StoreCtx {
            dev: self.dev.as_ref(),
            writer: &self.writer,
            table: &self.table,
            imap: &self.imap,
            geometry: &self.geometry,
        }
    }

    fn gc_context(&self) -> GcContext {
        GcContext {
            dev: Arc::clone(&self.dev),
            writer: Arc::clone(&self.writer),
            table: Arc::clone(&self.table),
            imap: Arc::clone(&self.imap),
            icache: Arc::clone(&self.icache),
            checkpoint: Arc::clone(&self.checkpoint),
            sb: Arc::clone(&self.sb),
            geometry: self.geometry,
        }
    }

    fn require_writable(&self) -> Result<()> {
        if self.read_only {
            Err(LsfsError::ReadOnly)
        } else {
            Ok(())
        }
    }

    fn get(&self, ino: InodeNumber) -> Result<InodeHandle> {
        let ino = if ino.0 == 0 { InodeNumber(ROOT_INO) } else { ino };
        self.icache.get(&self.store(), ino)
    }

    fn attr_of(&self, handle: &InodeHandle) -> InodeAttr {
        let state = handle.lock();
        let disk = &state.disk;
        InodeAttr {
            ino: handle.ino(),
            size: disk.size,
            blocks: disk.size.div_ceil(512),
            atime: nanos_to_time(disk.atime),
            mtime: nanos_to_time(disk.mtime),
            ctime: nanos_to_time(disk.ctime),
            kind: disk.file_type(),
            perm: (disk.mode & 0o7777) as u16,
            nlink: disk.nlink,
            uid: disk.uid,
            gid: disk.gid,
            blksize: BLOCK_SIZE as u32,
            generation: disk.generation,
        }
    }

    /// Post-mutation housekeeping: emit a checkpoint when the trigger fires
    /// or the writer wrapped to a lower log slot.
    fn after_mutation(&self) -> Result<()> {
        if self.writer.take_wrap_pending() || self.checkpoint.needed(&self.writer) {
            let _durability = self.write_lock.lock();
            self.checkpoint.write(
                self.dev.as_ref(),
                &self.writer,
                &self.table,
                &self.imap,
                &self.sb,
            )?;
        }
        Ok(())
    }

    fn adjust_inode_count(&self, delta: i64) {
        let mut sb = self.sb.lock();
        if delta >= 0 {
            sb.inode_count = sb.inode_count.saturating_add(delta as u64);
        } else {
            sb.inode_count = sb.inode_count.saturating_sub(delta.unsigned_abs());
        }
    }
}

fn nanos_to_time(nanos: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_nanos(nanos)
}

// ── Operations ──────────────────────────────────────────────────────────────

impl FsOps for Lsfs {
    fn lookup(&self, parent: InodeNumber, name: &[u8]) -> Result<InodeAttr> {
        let inner = &self.inner;
        let dir = inner.get(parent)?;
        let store = inner.store();
        let Some((ino, _)) = lsfs_dir::lookup(&store, &dir, name)? else {
            return Err(LsfsError::NoEntry(
                String::from_utf8_lossy(name).into_owned(),
            ));
        };
        let child = inner.get(ino)?;
        Ok(inner.attr_of(&child))
    }

    fn getattr(&self, ino: InodeNumber) -> Result<InodeAttr> {
        let inner = &self.inner;
        let handle = inner.get(ino)?;
        Ok(inner.attr_of(&handle))
    }

    fn setattr(&self, ino: InodeNumber, request: &SetAttrRequest) -> Result<InodeAttr> {
        let inner = &self.inner;
        inner.require_writable()?;
        let handle = inner.get(ino)?;
        let store = inner.store();

        {
            let mut state = handle.lock();
            let mut changed = false;

            if let Some(mode) = request.mode {
                state.disk.mode = (state.disk.mode & S_IFMT) | (mode & !S_IFMT);
                changed = true;
            }
            if let Some(uid) = request.uid {
                state.disk.uid = uid;
                changed = true;
            }
            if let Some(gid) = request.gid {
                state.disk.gid = gid;
                changed = true;
            }
            if let Some(size) = request.size {
                if size < state.disk.size {
                    lsfs_index::truncate(
                        inner.dev.as_ref(),
                        &inner.writer,
                        &inner.table,
                        &mut state.disk,
                        blocks_for_size(size),
                    )?;
                    // Zero the tail of a partial last block so a later
                    // extension reads back zeros.
                    let tail = (size % BLOCK_SIZE as u64) as usize;
                    if tail != 0 {
                        let last = size / BLOCK_SIZE as u64;
                        let have = lsfs_index::lookup(
                            inner.dev.as_ref(),
                            &inner.writer,
                            &state.disk,
                            last,
                        )?;
                        if have.is_some() {
                            let mut block = lsfs_index::read_block(
                                inner.dev.as_ref(),
                                &inner.writer,
                                &state.disk,
                                last,
                            )?;
                            block[tail..].fill(0);
                            lsfs_index::write_block(
                                inner.dev.as_ref(),
                                &inner.writer,
                                &inner.table,
                                &mut state.disk,
                                last,
                                &block,
                                BlockKind::Data,
                            )?;
                        }
                    }
                }
                state.disk.size = size;
                changed = true;
            }
            if let Some(atime) = request.atime {
                state.disk.atime = atime;
                changed = true;
            }
            if let Some(mtime) = request.mtime {
                state.disk.mtime = mtime;
                changed = true;
            }

            if changed {
                state.disk.ctime = now_nanos();
                state.dirty = true;
            }
        }
        write_inode(&store, &handle)?;
        inner.after_mutation()?;
        Ok(inner.attr_of(&handle))
    }

    fn readdir(&self, ino: InodeNumber, offset: u64, size: u32) -> Result<Vec<DirEntry>> {
        let inner = &self.inner;
        let dir = inner.get(ino)?;
        let store = inner.store();

        let mut budget = size as usize;
        let mut out = Vec::new();
        for entry in lsfs_dir::iterate(&store, &dir, offset)? {
            let record = dirent_record_size(entry.name.len());
            if record > budget {
                break;
            }
            budget -= record;
            out.push(DirEntry {
                ino: entry.ino,
                kind: entry.file_type,
                name: entry.name,
                next_offset: entry.next_offset,
            });
        }
        Ok(out)
    }

    fn open(&self, ino: InodeNumber) -> Result<()> {
        self.inner.get(ino).map(|_| ())
    }

    fn read(&self, ino: InodeNumber, offset: u64, size: u32) -> Result<Vec<u8>> {
        let inner = &self.inner;
        let handle = inner.get(ino)?;
        let mut state = handle.lock();

        if state.disk.is_dir() {
            return Err(LsfsError::IsDirectory);
        }
        let file_size = state.disk.size;
        if offset >= file_size {
            return Ok(Vec::new());
        }
        let want = (size as u64).min(file_size - offset) as usize;

        let mut out = Vec::with_capacity(want);
        while out.len() < want {
            let position = offset + out.len() as u64;
            let block_idx = position / BLOCK_SIZE as u64;
            let block_off = (position % BLOCK_SIZE as u64) as usize;
            let chunk = (BLOCK_SIZE - block_off).min(want - out.len());

            let block =
                lsfs_index::read_block(inner.dev.as_ref(), &inner.writer, &state.disk, block_idx)?;
            out.extend_from_slice(&block[block_off..block_off + chunk]);
        }

        // Relaxed atime: updated in memory, persisted with the next real
        // write of this inode.
        state.disk.atime = now_nanos();
        Ok(out)
    }

    fn write(&self, ino: InodeNumber, offset: u64, data: &[u8]) -> Result<u32> {
        let inner = &self.inner;
        inner.require_writable()?;
        let handle = inner.get(ino)?;
        let store = inner.store();

        let written = {
            let mut state = handle.lock();
            if state.disk.is_dir() {
                return Err(LsfsError::IsDirectory);
            }

            let mut written = 0_usize;
            while written < data.len() {
                let position = offset + written as u64;
                let block_idx = position / BLOCK_SIZE as u64;
                let block_off = (position % BLOCK_SIZE as u64) as usize;
                let chunk = (BLOCK_SIZE - block_off).min(data.len() - written);

                let mut block = if chunk < BLOCK_SIZE {
                    lsfs_index::read_block(
                        inner.dev.as_ref(),
                        &inner.writer,
                        &state.disk,
                        block_idx,
                    )?
                } else {
                    vec![0_u8; BLOCK_SIZE]
                };
                block[block_off..block_off + chunk]
                    .copy_from_slice(&data[written..written + chunk]);

                match lsfs_index::write_block(
                    inner.dev.as_ref(),
                    &inner.writer,
                    &inner.table,
                    &mut state.disk,
                    block_idx,
                    &block,
                    BlockKind::Data,
                ) {
                    Ok(_) => written += chunk,
                    Err(LsfsError::NoSpace) if written > 0 => break,
                    Err(err) => return Err(err),
                }
            }

            let end = offset + written as u64;
            if end > state.disk.size {
                state.disk.size = end;
            }
            let now = now_nanos();
            state.disk.mtime = now;
            state.disk.ctime = now;
            state.dirty = true;
            written
        };

        write_inode(&store, &handle)?;
        inner.after_mutation()?;
        u32::try_from(written).map_err(|_| LsfsError::InvalidArgument("write length"))
    }

    fn create(
        &self,
        parent: InodeNumber,
        name: &[u8],
        mode: u32,
        uid: u32,
        gid: u32,
    ) -> Result<InodeAttr> {
        let inner = &self.inner;
        inner.require_writable()?;
        let dir = inner.get(parent)?;
        let store = inner.store();

        if lsfs_dir::lookup(&store, &dir, name)?.is_some() {
            return Err(LsfsError::Exists);
        }

        let child = inner
            .icache
            .alloc(&store, S_IFREG | (mode & 0o7777), uid, gid)?;
        if let Err(err) = lsfs_dir::add(&store, &dir, name, child.ino(), FileType::RegularFile) {
            free_inode(&store, &inner.icache, &child)?;
            return Err(err);
        }

        write_inode(&store, &child)?;
        write_inode(&store, &dir)?;
        inner.adjust_inode_count(1);
        inner.after_mutation()?;
        debug!(
            target: "lsfs::core",
            parent = parent.0,
            ino = child.ino().0,
            "created file"
        );
        Ok(inner.attr_of(&child))
    }

    fn mkdir(
        &self,
        parent: InodeNumber,
        name: &[u8],
        mode: u32,
        uid: u32,
        gid: u32,
    ) -> Result<InodeAttr> {
        let inner = &self.inner;
        inner.require_writable()?;
        let dir = inner.get(parent)?;
        let store = inner.store();

        if lsfs_dir::lookup(&store, &dir, name)?.is_some() {
            return Err(LsfsError::Exists);
        }

        let child = inner
            .icache
            .alloc(&store, S_IFDIR | (mode & 0o7777), uid, gid)?;
        let parent_ino = dir.ino();
        lsfs_dir::init(&store, &child, parent_ino)?;
        if let Err(err) = lsfs_dir::add(&store, &dir, name, child.ino(), FileType::Directory) {
            free_inode(&store, &inner.icache, &child)?;
            return Err(err);
        }

        // The child's `..` adds a link to the parent.
        {
            let mut state = dir.lock();
            state.disk.nlink += 1;
            state.dirty = true;
        }

        write_inode(&store, &child)?;
        write_inode(&store, &dir)?;
        inner.adjust_inode_count(1);
        inner.after_mutation()?;
        debug!(
            target: "lsfs::core",
            parent = parent.0,
            ino = child.ino().0,
            "created directory"
        );
        Ok(inner.attr_of(&child))
    }

    fn unlink(&self, parent: InodeNumber, name: &[u8]) -> Result<()> {
        let inner = &self.inner;
        inner.require_writable()?;
        let dir = inner.get(parent)?;
        let store = inner.store();

        let Some((ino, _)) = lsfs_dir::lookup(&store, &dir, name)? else {
            return Err(LsfsError::NoEntry(
                String::from_utf8_lossy(name).into_owned(),
            ));
        };
        let child = inner.get(ino)?;
        if child.lock().disk.is_dir() {
            return Err(LsfsError::IsDirectory);
        }

        lsfs_dir::remove(&store, &dir, name)?;

        let now_unlinked = {
            let mut state = child.lock();
            state.disk.nlink = state.disk.nlink.saturating_sub(1);
            state.disk.ctime = now_nanos();
            state.dirty = true;
            state.disk.nlink == 0
        };

        if now_unlinked {
            free_inode(&store, &inner.icache, &child)?;
            inner.adjust_inode_count(-1);
        } else {
            write_inode(&store, &child)?;
        }
        write_inode(&store, &dir)?;
        inner.after_mutation()?;
        Ok(())
    }

    fn rmdir(&self, parent: InodeNumber, name: &[u8]) -> Result<()> {
        let inner = &self.inner;
        inner.require_writable()?;
        let dir = inner.get(parent)?;
        let store = inner.store();

        let Some((ino, _)) = lsfs_dir::lookup(&store, &dir, name)? else {
            return Err(LsfsError::NoEntry(
                String::from_utf8_lossy(name).into_owned(),
            ));
        };
        let child = inner.get(ino)?;
        if !child.lock().disk.is_dir() {
            return Err(LsfsError::NotDirectory);
        }
        if !lsfs_dir::is_empty(&store, &child)? {
            return Err(LsfsError::NotEmpty);
        }

        lsfs_dir::remove(&store, &dir, name)?;

        // The removed directory's `..` no longer links to the parent.
        {
            let mut state = dir.lock();
            state.disk.nlink = state.disk.nlink.saturating_sub(1);
            state.dirty = true;
        }

        free_inode(&store, &inner.icache, &child)?;
        inner.adjust_inode_count(-1);
        write_inode(&store, &dir)?;
        inner.after_mutation()?;
        Ok(())
    }

    fn rename(
        &self,
        parent: InodeNumber,
        name: &[u8],
        new_parent: InodeNumber,
        new_name: &[u8],
    ) -> Result<()> {
        let inner = &self.inner;
        inner.require_writable()?;
        if parent == new_parent && name == new_name {
            return Ok(());
        }
        let store = inner.store();

        let old_dir = inner.get(parent)?;
        let same_parent = parent == new_parent;
        let new_dir = if same_parent {
            Arc::clone(&old_dir)
        } else {
            inner.get(new_parent)?
        };

        let Some((ino, kind)) = lsfs_dir::lookup(&store, &old_dir, name)? else {
            return Err(LsfsError::NoEntry(
                String::from_utf8_lossy(name).into_owned(),
            ));
        };

        // Replace an existing destination, POSIX style.
        if let Some((dest_ino, _)) = lsfs_dir::lookup(&store, &new_dir, new_name)? {
            let dest = inner.get(dest_ino)?;
            let dest_is_dir = dest.lock().disk.is_dir();
            if dest_is_dir {
                if !lsfs_dir::is_empty(&store, &dest)? {
                    return Err(LsfsError::NotEmpty);
                }
                lsfs_dir::remove(&store, &new_dir, new_name)?;
                {
                    let mut state = new_dir.lock();
                    state.disk.nlink = state.disk.nlink.saturating_sub(1);
                    state.dirty = true;
                }
                free_inode(&store, &inner.icache, &dest)?;
                inner.adjust_inode_count(-1);
            } else {
                lsfs_dir::remove(&store, &new_dir, new_name)?;
                let gone = {
                    let mut state = dest.lock();
                    state.disk.nlink = state.disk.nlink.saturating_sub(1);
                    state.disk.ctime = now_nanos();
                    state.dirty = true;
                    state.disk.nlink == 0
                };
                if gone {
                    free_inode(&store, &inner.icache, &dest)?;
                    inner.adjust_inode_count(-1);
                } else {
                    write_inode(&store, &dest)?;
                }
            }
        }

        lsfs_dir::add(&store, &new_dir, new_name, ino, kind)?;
        lsfs_dir::remove(&store, &old_dir, name)?;

        // A directory that changed parents rewrites its `..` and moves one
        // link between the parents.
        if !same_parent && kind == FileType::Directory {
            let moved = inner.get(ino)?;
            lsfs_dir::set_parent(&store, &moved, new_dir.ino())?;
            {
                let mut state = old_dir.lock();
                state.disk.nlink = state.disk.nlink.saturating_sub(1);
                state.dirty = true;
            }
            {
                let mut state = new_dir.lock();
                state.disk.nlink += 1;
                state.dirty = true;
            }
            write_inode(&store, &moved)?;
        }

        write_inode(&store, &old_dir)?;
        if !same_parent {
            write_inode(&store, &new_dir)?;
        }
        inner.after_mutation()?;
        Ok(())
    }

    fn statfs(&self) -> Result<FsStats> {
        let inner = &self.inner;
        let sb = inner.sb.lock();
        let free_segments = u64::from(inner.table.free_count());
        Ok(FsStats {
            block_size: sb.block_size,
            total_blocks: sb.total_blocks,
            free_blocks: free_segments * u64::from(sb.segment_size),
            total_inodes: u64::from(MAX_INODES),
            free_inodes: u64::from(MAX_INODES).saturating_sub(sb.inode_count),
            name_max: NAME_MAX as u32,
        })
    }

    fn fsync(&self, _ino: InodeNumber) -> Result<()> {
        let inner = &self.inner;
        if inner.read_only {
            return Ok(());
        }
        self.sync_data()?;

        // Space pressure surfaces here: wake the cleaner, or clean inline
        // when no background thread is running.
        if lsfs_gc::needed(&inner.table, &inner.cleaner_config) {
            if self.cleaner.lock().is_some() {
                inner.gc_signal.notify();
            } else {
                self.run_cleaner_pass()?;
            }
        }

        inner.after_mutation()
    }
}
