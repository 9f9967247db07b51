#![forbid(unsafe_code)]
//! Block I/O layer for LSFS.
//!
//! Provides the `ByteDevice` and `BlockDevice` traits, the file-backed
//! implementations over `pread`/`pwrite`, and `CachedBlockDevice`: a
//! fixed-capacity buffer cache with refcounted handles, LRU eviction, and
//! write-back dirty tracking.

use lsfs_error::{LsfsError, Result};
use lsfs_types::BlockNumber;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};

// ── Byte device ─────────────────────────────────────────────────────────────

/// Byte-addressed device with positional I/O (pread/pwrite semantics).
pub trait ByteDevice: Send + Sync {
    /// Total length in bytes.
    fn len_bytes(&self) -> u64;

    /// Read exactly `buf.len()` bytes from `offset`.
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write all bytes in `buf` at `offset`.
    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()>;

    /// Force preceding writes to stable storage.
    fn sync(&self) -> Result<()>;
}

fn out_of_bounds(what: &str, offset: u64, len: usize, device_len: u64) -> LsfsError {
    LsfsError::Io(io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("{what} out of bounds: offset={offset} len={len} device_len={device_len}"),
    ))
}

/// File-backed byte device.
///
/// Uses `std::os::unix::fs::FileExt`, which is thread-safe and does not
/// share a seek position.
#[derive(Debug)]
pub struct FileByteDevice {
    file: File,
    len: u64,
    writable: bool,
}

impl FileByteDevice {
    /// Open an existing image read-write, falling back to read-only.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let (file, writable) = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map(|file| (file, true))
            .or_else(|_| {
                OpenOptions::new()
                    .read(true)
                    .open(path)
                    .map(|file| (file, false))
            })?;
        let len = file.metadata()?.len();
        debug!(
            target: "lsfs::block",
            path = %path.display(),
            len,
            writable,
            "opened backing image"
        );
        Ok(Self {
            file,
            len,
            writable,
        })
    }

    /// Open an existing image, forcing read-only regardless of permissions.
    pub fn open_read_only(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new().read(true).open(path.as_ref())?;
        let len = file.metadata()?.len();
        Ok(Self {
            file,
            len,
            writable: false,
        })
    }

    /// Create (or truncate) an image of exactly `len` bytes.
    pub fn create(path: impl AsRef<Path>, len: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())?;
        file.set_len(len)?;
        Ok(Self {
            file,
            len,
            writable: true,
        })
    }

    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.writable
    }
}

impl ByteDevice for FileByteDevice {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let end = offset
            .checked_add(buf.len() as u64)
            .ok_or_else(|| out_of_bounds("read", offset, buf.len(), self.len))?;
        if end > self.len {
            return Err(out_of_bounds("read", offset, buf.len(), self.len));
        }
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(LsfsError::ReadOnly);
        }
        let end = offset
            .checked_add(buf.len() as u64)
            .ok_or_else(|| out_of_bounds("write", offset, buf.len(), self.len))?;
        if end > self.len {
            return Err(out_of_bounds("write", offset, buf.len(), self.len));
        }
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

/// In-memory byte device for tests.
#[derive(Debug)]
pub struct MemByteDevice {
    data: Mutex<Vec<u8>>,
    writable: bool,
}

impl MemByteDevice {
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self {
            data: Mutex::new(vec![0_u8; len]),
            writable: true,
        }
    }

    #[must_use]
    pub fn read_only(len: usize) -> Self {
        Self {
            data: Mutex::new(vec![0_u8; len]),
            writable: false,
        }
    }
}

impl ByteDevice for MemByteDevice {
    fn len_bytes(&self) -> u64 {
        self.data.lock().len() as u64
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let data = self.data.lock();
        let offset = usize::try_from(offset)
            .map_err(|_| out_of_bounds("read", u64::MAX, buf.len(), data.len() as u64))?;
        let end = offset
            .checked_add(buf.len())
            .filter(|end| *end <= data.len())
            .ok_or_else(|| out_of_bounds("read", offset as u64, buf.len(), data.len() as u64))?;
        buf.copy_from_slice(&data[offset..end]);
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(LsfsError::ReadOnly);
        }
        let mut data = self.data.lock();
        let len = data.len();
        let offset = usize::try_from(offset)
            .map_err(|_| out_of_bounds("write", u64::MAX, buf.len(), len as u64))?;
        let end = offset
            .checked_add(buf.len())
            .filter(|end| *end <= len)
            .ok_or_else(|| out_of_bounds("write", offset as u64, buf.len(), len as u64))?;
        data[offset..end].copy_from_slice(buf);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

// ── Block device ────────────────────────────────────────────────────────────

/// Block-addressed I/O interface.
pub trait BlockDevice: Send + Sync {
    /// Read one block.
    fn read_block(&self, block: BlockNumber) -> Result<Vec<u8>>;

    /// Write one block. `data.len()` must equal `block_size()`.
    fn write_block(&self, block: BlockNumber, data: &[u8]) -> Result<()>;

    /// Read `count` contiguous blocks.
    fn read_range(&self, start: BlockNumber, count: u32) -> Result<Vec<u8>>;

    /// Write contiguous blocks starting at `start`. `data.len()` must be a
    /// multiple of `block_size()`.
    fn write_range(&self, start: BlockNumber, data: &[u8]) -> Result<()>;

    /// Device block size in bytes.
    fn block_size(&self) -> u32;

    /// Total number of blocks.
    fn block_count(&self) -> u64;

    /// Force preceding writes to stable storage.
    fn sync(&self) -> Result<()>;

    /// Drop any cached copies of `[start, start + count)`.
    ///
    /// Called when a log segment returns to the free pool; uncached
    /// devices have nothing to do.
    fn invalidate_range(&self, start: BlockNumber, count: u64) {
        let _ = (start, count);
    }
}

/// Adapts a `ByteDevice` to block-addressed I/O.
#[derive(Debug)]
pub struct ByteBlockDevice<D: ByteDevice> {
    inner: D,
    block_size: u32,
    block_count: u64,
}

impl<D: ByteDevice> ByteBlockDevice<D> {
    pub fn new(inner: D, block_size: u32) -> Result<Self> {
        if block_size == 0 || !block_size.is_power_of_two() {
            return Err(LsfsError::InvalidArgument(
                "block size must be a power of two",
            ));
        }
        let block_count = inner.len_bytes() / u64::from(block_size);
        Ok(Self {
            inner,
            block_size,
            block_count,
        })
    }

    #[must_use]
    pub fn inner(&self) -> &D {
        &self.inner
    }

    fn byte_offset(&self, block: BlockNumber, blocks: u64) -> Result<u64> {
        let in_bounds = block
            .0
            .checked_add(blocks)
            .is_some_and(|end| end <= self.block_count);
        if !in_bounds {
            return Err(out_of_bounds(
                "block range",
                block.0,
                usize::try_from(blocks).unwrap_or(usize::MAX),
                self.block_count,
            ));
        }
        Ok(block.0 * u64::from(self.block_size))
    }
}

impl<D: ByteDevice> BlockDevice for ByteBlockDevice<D> {
    fn read_block(&self, block: BlockNumber) -> Result<Vec<u8>> {
        let offset = self.byte_offset(block, 1)?;
        let mut buf = vec![0_u8; self.block_size as usize];
        self.inner.read_exact_at(offset, &mut buf)?;
        Ok(buf)
    }

    fn write_block(&self, block: BlockNumber, data: &[u8]) -> Result<()> {
        if data.len() != self.block_size as usize {
            return Err(LsfsError::InvalidArgument("write_block length mismatch"));
        }
        let offset = self.byte_offset(block, 1)?;
        self.inner.write_all_at(offset, data)
    }

    fn read_range(&self, start: BlockNumber, count: u32) -> Result<Vec<u8>> {
        let offset = self.byte_offset(start, u64::from(count))?;
        let mut buf = vec![0_u8; count as usize * self.block_size as usize];
        self.inner.read_exact_at(offset, &mut buf)?;
        Ok(buf)
    }

    fn write_range(&self, start: BlockNumber, data: &[u8]) -> Result<()> {
        if data.is_empty() || data.len() % self.block_size as usize != 0 {
            return Err(LsfsError::InvalidArgument(
                "write_range length must be a nonzero multiple of the block size",
            ));
        }
        let blocks = (data.len() / self.block_size as usize) as u64;
        let offset = self.byte_offset(start, blocks)?;
        self.inner.write_all_at(offset, data)
    }

    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn sync(&self) -> Result<()> {
        self.inner.sync()
    }
}

// ── Buffer cache ────────────────────────────────────────────────────────────

/// Cumulative cache counters.
#[derive(Debug, Default, Clone, Copy)]
pub struct CacheMetrics {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub writebacks: u64,
}

#[derive(Debug, Default)]
struct MetricCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    writebacks: AtomicU64,
}

/// One cached block. Shared out to callers via [`BufferHandle`].
#[derive(Debug)]
pub struct Buffer {
    block: BlockNumber,
    data: Mutex<Vec<u8>>,
    dirty: AtomicBool,
}

impl Buffer {
    #[must_use]
    pub fn block(&self) -> BlockNumber {
        self.block
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }
}

/// Refcounted handle to a cached block.
///
/// The underlying buffer stays stable while any handle is alive; dropping
/// the handle releases the reference.
#[derive(Debug, Clone)]
pub struct BufferHandle {
    buf: Arc<Buffer>,
}

impl BufferHandle {
    #[must_use]
    pub fn block(&self) -> BlockNumber {
        self.buf.block
    }

    /// Copy the buffer contents out.
    #[must_use]
    pub fn to_vec(&self) -> Vec<u8> {
        self.buf.data.lock().clone()
    }

    /// Run `f` over the buffer contents without copying.
    pub fn with_data<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(&self.buf.data.lock())
    }
}

struct Slot {
    buf: Arc<Buffer>,
    tick: u64,
}

struct CacheState {
    map: HashMap<u64, Slot>,
    tick: u64,
}

/// Fixed-capacity write-back buffer cache over a `BlockDevice`.
///
/// Single-block reads and writes go through the pool; range I/O bypasses it
/// (segment-sized transfers would evict the whole pool) while staying
/// coherent with cached entries. `sync` flushes dirty buffers before forcing
/// the device, so checkpoint barriers see every preceding write.
pub struct CachedBlockDevice<D: BlockDevice> {
    inner: D,
    capacity: usize,
    state: Mutex<CacheState>,
    metrics: MetricCounters,
}

/// Default pool capacity in blocks (1 MiB of 4 KiB blocks).
pub const DEFAULT_CACHE_BLOCKS: usize = 256;

impl<D: BlockDevice> CachedBlockDevice<D> {
    pub fn new(inner: D, capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(LsfsError::InvalidArgument("cache capacity must be nonzero"));
        }
        Ok(Self {
            inner,
            capacity,
            state: Mutex::new(CacheState {
                map: HashMap::with_capacity(capacity),
                tick: 0,
            }),
            metrics: MetricCounters::default(),
        })
    }

    #[must_use]
    pub fn inner(&self) -> &D {
        &self.inner
    }

    #[must_use]
    pub fn metrics(&self) -> CacheMetrics {
        CacheMetrics {
            hits: self.metrics.hits.load(Ordering::Relaxed),
            misses: self.metrics.misses.load(Ordering::Relaxed),
            evictions: self.metrics.evictions.load(Ordering::Relaxed),
            writebacks: self.metrics.writebacks.load(Ordering::Relaxed),
        }
    }

    /// Number of resident buffers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().map.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.lock().map.is_empty()
    }

    /// Fetch a refcounted handle for `block`, reading it on a miss.
    pub fn get(&self, block: BlockNumber) -> Result<BufferHandle> {
        if let Some(handle) = self.lookup(block) {
            self.metrics.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(handle);
        }

        // Miss: read outside the cache lock, then insert (another thread may
        // have raced us; its copy wins).
        self.metrics.misses.fetch_add(1, Ordering::Relaxed);
        let data = self.inner.read_block(block)?;
        self.insert(block, data, false)
    }

    fn lookup(&self, block: BlockNumber) -> Option<BufferHandle> {
        let mut state = self.state.lock();
        state.tick += 1;
        let tick = state.tick;
        let slot = state.map.get_mut(&block.0)?;
        slot.tick = tick;
        Some(BufferHandle {
            buf: Arc::clone(&slot.buf),
        })
    }

    fn insert(&self, block: BlockNumber, data: Vec<u8>, dirty: bool) -> Result<BufferHandle> {
        loop {
            let victim = {
                let mut state = self.state.lock();
                if state.map.contains_key(&block.0) {
                    state.tick += 1;
                    let tick = state.tick;
                    let slot = state.map.get_mut(&block.0).unwrap();
                    // Raced with another miss; adopt the resident copy. A
                    // dirty insert still overwrites the contents.
                    if dirty {
                        *slot.buf.data.lock() = data;
                        slot.buf.dirty.store(true, Ordering::Release);
                    }
                    slot.tick = tick;
                    return Ok(BufferHandle {
                        buf: Arc::clone(&slot.buf),
                    });
                }

                if state.map.len() < self.capacity {
                    state.tick += 1;
                    let tick = state.tick;
                    let buf = Arc::new(Buffer {
                        block,
                        data: Mutex::new(data),
                        dirty: AtomicBool::new(dirty),
                    });
                    state.map.insert(
                        block.0,
                        Slot {
                            buf: Arc::clone(&buf),
                            tick,
                        },
                    );
                    return Ok(BufferHandle { buf });
                }

                self.pick_victim(&mut state)
            };

            match victim {
                Some(buf) => self.retire(&buf)?,
                None => {
                    // Every buffer is pinned; admit over capacity rather
                    // than failing the read.
                    warn!(
                        target: "lsfs::block::cache",
                        capacity = self.capacity,
                        "cache over capacity: all buffers pinned"
                    );
                    let mut state = self.state.lock();
                    state.tick += 1;
                    let tick = state.tick;
                    let buf = Arc::new(Buffer {
                        block,
                        data: Mutex::new(data),
                        dirty: AtomicBool::new(dirty),
                    });
                    state.map.insert(
                        block.0,
                        Slot {
                            buf: Arc::clone(&buf),
                            tick,
                        },
                    );
                    return Ok(BufferHandle { buf });
                }
            }
        }
    }

    /// Choose the least-recently-used unpinned buffer.
    fn pick_victim(&self, state: &mut CacheState) -> Option<Arc<Buffer>> {
        state
            .map
            .values()
            .filter(|slot| Arc::strong_count(&slot.buf) == 1)
            .min_by_key(|slot| slot.tick)
            .map(|slot| Arc::clone(&slot.buf))
    }

    /// Write back (if dirty) and drop one buffer.
    ///
    /// Write-back happens while the buffer is still resident so a
    /// concurrent `get` can never observe the device's stale copy.
    fn retire(&self, buf: &Arc<Buffer>) -> Result<()> {
        if buf.dirty.swap(false, Ordering::AcqRel) {
            let snapshot = buf.data.lock().clone();
            if let Err(err) = self.inner.write_block(buf.block, &snapshot) {
                buf.dirty.store(true, Ordering::Release);
                return Err(err);
            }
            self.metrics.writebacks.fetch_add(1, Ordering::Relaxed);
        }

        let mut state = self.state.lock();
        // Only remove if nobody re-pinned or re-dirtied it meanwhile.
        let evict = state.map.get(&buf.block.0).is_some_and(|slot| {
            Arc::ptr_eq(&slot.buf, buf)
                && Arc::strong_count(&slot.buf) == 2
                && !buf.dirty.load(Ordering::Acquire)
        });
        if evict {
            state.map.remove(&buf.block.0);
            self.metrics.evictions.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Write back every dirty buffer.
    pub fn flush(&self) -> Result<()> {
        let dirty: Vec<Arc<Buffer>> = {
            let state = self.state.lock();
            state
                .map
                .values()
                .filter(|slot| slot.buf.is_dirty())
                .map(|slot| Arc::clone(&slot.buf))
                .collect()
        };

        for buf in dirty {
            if buf.dirty.swap(false, Ordering::AcqRel) {
                let snapshot = buf.data.lock().clone();
                if let Err(err) = self.inner.write_block(buf.block, &snapshot) {
                    buf.dirty.store(true, Ordering::Release);
                    return Err(err);
                }
                self.metrics.writebacks.fetch_add(1, Ordering::Relaxed);
            }
        }
        Ok(())
    }

}

impl<D: BlockDevice> BlockDevice for CachedBlockDevice<D> {
    fn read_block(&self, block: BlockNumber) -> Result<Vec<u8>> {
        Ok(self.get(block)?.to_vec())
    }

    fn write_block(&self, block: BlockNumber, data: &[u8]) -> Result<()> {
        if data.len() != self.inner.block_size() as usize {
            return Err(LsfsError::InvalidArgument("write_block length mismatch"));
        }
        if block.0 >= self.inner.block_count() {
            return Err(out_of_bounds(
                "write",
                block.0,
                data.len(),
                self.inner.block_count(),
            ));
        }
        self.insert(block, data.to_vec(), true)?;
        Ok(())
    }

    fn read_range(&self, start: BlockNumber, count: u32) -> Result<Vec<u8>> {
        let mut data = self.inner.read_range(start, count)?;

        // Overlay any dirty resident blocks; the device copy is stale for
        // those until the next flush.
        let bs = self.inner.block_size() as usize;
        let overlays: Vec<(u64, Arc<Buffer>)> = {
            let state = self.state.lock();
            state
                .map
                .values()
                .filter(|slot| {
                    slot.buf.is_dirty()
                        && slot.buf.block.0 >= start.0
                        && slot.buf.block.0 < start.0 + u64::from(count)
                })
                .map(|slot| (slot.buf.block.0 - start.0, Arc::clone(&slot.buf)))
                .collect()
        };
        for (index, buf) in overlays {
            let at = usize::try_from(index).unwrap_or(usize::MAX) * bs;
            data[at..at + bs].copy_from_slice(&buf.data.lock());
        }
        Ok(data)
    }

    fn write_range(&self, start: BlockNumber, data: &[u8]) -> Result<()> {
        self.inner.write_range(start, data)?;

        // Keep resident copies coherent with the bulk write.
        let bs = self.inner.block_size() as usize;
        let blocks = (data.len() / bs) as u64;
        let state = self.state.lock();
        for slot in state.map.values() {
            let block = slot.buf.block.0;
            if block >= start.0 && block < start.0 + blocks {
                let at = usize::try_from(block - start.0).unwrap_or(usize::MAX) * bs;
                *slot.buf.data.lock() = data[at..at + bs].to_vec();
                slot.buf.dirty.store(false, Ordering::Release);
            }
        }
        Ok(())
    }

    fn block_size(&self) -> u32 {
        self.inner.block_size()
    }

    fn block_count(&self) -> u64 {
        self.inner.block_count()
    }

    fn sync(&self) -> Result<()> {
        self.flush()?;
        self.inner.sync()
    }

    /// Drop cached blocks whose segment returned to the free pool: their
    /// contents are dead and must not be served once the range is rewritten.
    fn invalidate_range(&self, start: BlockNumber, count: u64) {
        let mut state = self.state.lock();
        let end = start.0.saturating_add(count);
        state.map.retain(|block, slot| {
            *block < start.0 || *block >= end || Arc::strong_count(&slot.buf) > 1
        });
        trace!(
            target: "lsfs::block::cache",
            start = start.0,
            count,
            "invalidated cached range"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lsfs_types::BLOCK_SIZE;

    fn mem_device(blocks: usize) -> ByteBlockDevice<MemByteDevice> {
        ByteBlockDevice::new(MemByteDevice::new(blocks * BLOCK_SIZE), BLOCK_SIZE as u32)
            .expect("device")
    }

    fn pattern(byte: u8) -> Vec<u8> {
        vec![byte; BLOCK_SIZE]
    }

    #[test]
    fn byte_block_device_round_trip() {
        let dev = mem_device(8);
        dev.write_block(BlockNumber(3), &pattern(0x42)).unwrap();
        assert_eq!(dev.read_block(BlockNumber(3)).unwrap(), pattern(0x42));
        assert_eq!(dev.read_block(BlockNumber(4)).unwrap(), pattern(0));
        assert_eq!(dev.block_count(), 8);
    }

    #[test]
    fn byte_block_device_bounds() {
        let dev = mem_device(4);
        assert!(dev.read_block(BlockNumber(4)).is_err());
        assert!(dev.write_block(BlockNumber(4), &pattern(1)).is_err());
        assert!(dev.read_range(BlockNumber(2), 3).is_err());
        assert!(dev.read_range(BlockNumber(2), 2).is_ok());
        assert!(dev.write_block(BlockNumber(0), &[0; 100]).is_err());
    }

    #[test]
    fn read_only_device_rejects_writes() {
        let dev = ByteBlockDevice::new(
            MemByteDevice::read_only(4 * BLOCK_SIZE),
            BLOCK_SIZE as u32,
        )
        .unwrap();
        assert!(matches!(
            dev.write_block(BlockNumber(0), &pattern(1)),
            Err(LsfsError::ReadOnly)
        ));
        assert!(dev.read_block(BlockNumber(0)).is_ok());
    }

    #[test]
    fn file_byte_device_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("image.lsfs");
        let dev = FileByteDevice::create(&path, 16 * BLOCK_SIZE as u64).unwrap();
        dev.write_all_at(4096, &pattern(0x5A)).unwrap();
        dev.sync().unwrap();
        drop(dev);

        let dev = FileByteDevice::open(&path).unwrap();
        assert_eq!(dev.len_bytes(), 16 * BLOCK_SIZE as u64);
        let mut buf = vec![0_u8; BLOCK_SIZE];
        dev.read_exact_at(4096, &mut buf).unwrap();
        assert_eq!(buf, pattern(0x5A));
    }

    #[test]
    fn cache_hit_and_miss_metrics() {
        let cache = CachedBlockDevice::new(mem_device(8), 4).unwrap();
        cache.inner().write_block(BlockNumber(1), &pattern(7)).unwrap();

        assert_eq!(cache.read_block(BlockNumber(1)).unwrap(), pattern(7));
        assert_eq!(cache.read_block(BlockNumber(1)).unwrap(), pattern(7));
        let metrics = cache.metrics();
        assert_eq!(metrics.misses, 1);
        assert_eq!(metrics.hits, 1);
    }

    #[test]
    fn cache_write_back_on_eviction() {
        let cache = CachedBlockDevice::new(mem_device(16), 2).unwrap();
        cache.write_block(BlockNumber(0), &pattern(0xA0)).unwrap();
        cache.write_block(BlockNumber(1), &pattern(0xA1)).unwrap();
        // Device must not see the writes yet (write-back).
        assert_eq!(cache.inner().read_block(BlockNumber(0)).unwrap(), pattern(0));

        // Filling past capacity evicts and writes back.
        cache.write_block(BlockNumber(2), &pattern(0xA2)).unwrap();
        cache.write_block(BlockNumber(3), &pattern(0xA3)).unwrap();
        assert!(cache.len() <= 2);
        let flushed_0 = cache.inner().read_block(BlockNumber(0)).unwrap();
        let flushed_1 = cache.inner().read_block(BlockNumber(1)).unwrap();
        assert!(flushed_0 == pattern(0xA0) || flushed_1 == pattern(0xA1));

        // After an explicit flush everything is durable.
        cache.flush().unwrap();
        for (block, byte) in [(0_u64, 0xA0), (1, 0xA1), (2, 0xA2), (3, 0xA3)] {
            assert_eq!(
                cache.inner().read_block(BlockNumber(block)).unwrap(),
                pattern(byte),
                "block {block}"
            );
        }
    }

    #[test]
    fn pinned_buffers_are_not_evicted() {
        let cache = CachedBlockDevice::new(mem_device(16), 2).unwrap();
        let pinned = cache.get(BlockNumber(0)).unwrap();
        let _also_pinned = cache.get(BlockNumber(1)).unwrap();

        // Capacity exhausted and everything pinned: the cache admits over
        // capacity rather than failing.
        cache.write_block(BlockNumber(2), &pattern(1)).unwrap();
        assert_eq!(pinned.block(), BlockNumber(0));
        assert!(cache.len() >= 2);
    }

    #[test]
    fn sync_flushes_dirty_buffers() {
        let cache = CachedBlockDevice::new(mem_device(8), 4).unwrap();
        cache.write_block(BlockNumber(5), &pattern(0xEE)).unwrap();
        assert_eq!(cache.inner().read_block(BlockNumber(5)).unwrap(), pattern(0));
        cache.sync().unwrap();
        assert_eq!(
            cache.inner().read_block(BlockNumber(5)).unwrap(),
            pattern(0xEE)
        );
    }

    #[test]
    fn read_range_overlays_dirty_blocks() {
        let cache = CachedBlockDevice::new(mem_device(8), 4).unwrap();
        cache.write_block(BlockNumber(2), &pattern(0xCC)).unwrap();

        let range = cache.read_range(BlockNumber(0), 4).unwrap();
        assert_eq!(&range[2 * BLOCK_SIZE..3 * BLOCK_SIZE], &pattern(0xCC)[..]);
        assert_eq!(&range[BLOCK_SIZE..2 * BLOCK_SIZE], &pattern(0)[..]);
    }

    #[test]
    fn write_range_updates_resident_copies() {
        let cache = CachedBlockDevice::new(mem_device(8), 4).unwrap();
        // Make block 1 resident (and clean).
        assert_eq!(cache.read_block(BlockNumber(1)).unwrap(), pattern(0));

        let mut bulk = Vec::new();
        for byte in [0x10_u8, 0x11, 0x12] {
            bulk.extend_from_slice(&pattern(byte));
        }
        cache.write_range(BlockNumber(0), &bulk).unwrap();

        // Cached copy must reflect the bulk write.
        assert_eq!(cache.read_block(BlockNumber(1)).unwrap(), pattern(0x11));
        assert_eq!(
            cache.inner().read_block(BlockNumber(2)).unwrap(),
            pattern(0x12)
        );
    }

    #[test]
    fn invalidate_range_drops_resident_blocks() {
        let cache = CachedBlockDevice::new(mem_device(8), 8).unwrap();
        for block in 0..4_u64 {
            cache.read_block(BlockNumber(block)).unwrap();
        }
        assert_eq!(cache.len(), 4);

        cache.invalidate_range(BlockNumber(1), 2);
        assert_eq!(cache.len(), 2);

        // Invalidated blocks re-read from the device.
        cache.inner().write_block(BlockNumber(1), &pattern(9)).unwrap();
        assert_eq!(cache.read_block(BlockNumber(1)).unwrap(), pattern(9));
    }
}
