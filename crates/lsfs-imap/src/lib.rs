#![forbid(unsafe_code)]
//! Inode map (IMAP) for LSFS.
//!
//! The authoritative mapping from inode number to the on-disk block holding
//! that inode's record. Kept as a dense array sorted by inode number under a
//! reader-writer lock: reads binary-search, writes update in place or shift
//! the tail for inserts. Persisted by packing entries contiguously into the
//! checkpoint region.

use lsfs_block::BlockDevice;
use lsfs_error::{LsfsError, Result};
use lsfs_ondisk::{ImapEntry, IMAP_ENTRIES_PER_BLOCK, IMAP_ENTRY_SIZE};
use lsfs_types::{blocks_for_size, BlockNumber, InodeNumber, BLOCK_SIZE, MAX_INODES, ROOT_INO};
use parking_lot::RwLock;
use tracing::{debug, trace};

struct ImapInner {
    /// Sorted by inode number.
    entries: Vec<ImapEntry>,
    /// Monotonic allocation cursor; linear scan once saturated.
    next_ino: u32,
}

impl ImapInner {
    fn find(&self, ino: InodeNumber) -> std::result::Result<usize, usize> {
        self.entries.binary_search_by_key(&ino.0, |e| e.ino.0)
    }
}

/// In-memory inode map.
pub struct InodeMap {
    inner: RwLock<ImapInner>,
}

impl Default for InodeMap {
    fn default() -> Self {
        Self::new()
    }
}

impl InodeMap {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(ImapInner {
                entries: Vec::new(),
                next_ino: ROOT_INO + 1,
            }),
        }
    }

    /// Current location and version for `ino`.
    #[must_use]
    pub fn get(&self, ino: InodeNumber) -> Option<(BlockNumber, u32)> {
        let inner = self.inner.read();
        inner
            .find(ino)
            .ok()
            .map(|idx| (inner.entries[idx].location, inner.entries[idx].version))
    }

    #[must_use]
    pub fn contains(&self, ino: InodeNumber) -> bool {
        self.inner.read().find(ino).is_ok()
    }

    /// Point `ino` at `location`, bumping the version on overwrite.
    pub fn set(&self, ino: InodeNumber, location: BlockNumber) {
        let mut inner = self.inner.write();
        match inner.find(ino) {
            Ok(idx) => {
                inner.entries[idx].location = location;
                inner.entries[idx].version += 1;
            }
            Err(idx) => {
                inner.entries.insert(
                    idx,
                    ImapEntry {
                        ino,
                        version: 1,
                        location,
                    },
                );
            }
        }
        trace!(target: "lsfs::imap", ino = ino.0, location = location.0, "imap set");
    }

    /// Drop `ino` from the map.
    pub fn remove(&self, ino: InodeNumber) -> Result<()> {
        let mut inner = self.inner.write();
        match inner.find(ino) {
            Ok(idx) => {
                inner.entries.remove(idx);
                Ok(())
            }
            Err(_) => Err(LsfsError::NoEntry(format!("inode {ino} not mapped"))),
        }
    }

    /// Allocate an unused inode number.
    ///
    /// Uses the monotonic counter until it saturates, then falls back to a
    /// linear scan for the lowest free number below the ceiling.
    #[must_use]
    pub fn alloc_ino(&self) -> Option<InodeNumber> {
        let mut inner = self.inner.write();
        if inner.next_ino < MAX_INODES {
            let ino = InodeNumber(inner.next_ino);
            inner.next_ino += 1;
            return Some(ino);
        }

        for candidate in (ROOT_INO + 1)..MAX_INODES {
            if inner.find(InodeNumber(candidate)).is_err() {
                return Some(InodeNumber(candidate));
            }
        }
        None
    }

    /// Number of mapped inodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.read().entries.is_empty()
    }

    /// Copy of the sorted entry array (checkpoint emit, checker, tests).
    #[must_use]
    pub fn snapshot(&self) -> Vec<ImapEntry> {
        self.inner.read().entries.clone()
    }

    /// Replace the whole map, recomputing the allocation cursor.
    pub fn load(&self, mut entries: Vec<ImapEntry>) {
        entries.sort_by_key(|e| e.ino.0);
        let next_ino = entries
            .iter()
            .map(|e| e.ino.0 + 1)
            .max()
            .unwrap_or(ROOT_INO + 1)
            .max(ROOT_INO + 1);
        let mut inner = self.inner.write();
        inner.entries = entries;
        inner.next_ino = next_ino;
        debug!(
            target: "lsfs::imap",
            entries = inner.entries.len(),
            next_ino,
            "imap loaded"
        );
    }

    /// Pack the map into blocks and write them starting at `start`.
    ///
    /// Returns the number of entries written.
    pub fn save_to(&self, dev: &dyn BlockDevice, start: BlockNumber) -> Result<u32> {
        let entries = self.snapshot();
        let blocks = blocks_for_size((entries.len() * IMAP_ENTRY_SIZE) as u64);
        if blocks == 0 {
            return Ok(0);
        }

        let mut buf = vec![0_u8; usize::try_from(blocks).unwrap_or(0) * BLOCK_SIZE];
        for (i, entry) in entries.iter().enumerate() {
            entry.encode_at(&mut buf, i * IMAP_ENTRY_SIZE);
        }
        dev.write_range(start, &buf)?;

        debug!(
            target: "lsfs::imap",
            entries = entries.len(),
            blocks,
            start = start.0,
            "imap saved"
        );
        u32::try_from(entries.len()).map_err(|_| LsfsError::InvalidArgument("imap entry count"))
    }

    /// Load `entry_count` packed entries starting at `start`.
    pub fn load_from(
        &self,
        dev: &dyn BlockDevice,
        start: BlockNumber,
        entry_count: u32,
    ) -> Result<()> {
        if entry_count == 0 {
            self.load(Vec::new());
            return Ok(());
        }
        if entry_count > MAX_INODES {
            return Err(LsfsError::Corruption {
                block: start.0,
                detail: format!("imap entry count {entry_count} exceeds inode ceiling"),
            });
        }

        let blocks = (entry_count as usize).div_ceil(IMAP_ENTRIES_PER_BLOCK);
        let buf = dev.read_range(
            start,
            u32::try_from(blocks).map_err(|_| LsfsError::InvalidArgument("imap block count"))?,
        )?;

        let mut entries = Vec::with_capacity(entry_count as usize);
        for i in 0..entry_count as usize {
            let entry = ImapEntry::parse_at(&buf, i * IMAP_ENTRY_SIZE)?;
            if !entry.ino.is_valid() {
                return Err(LsfsError::Corruption {
                    block: start.0,
                    detail: format!("imap entry {i} has invalid inode {}", entry.ino),
                });
            }
            entries.push(entry);
        }
        self.load(entries);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lsfs_block::{ByteBlockDevice, MemByteDevice};
    use lsfs_types::LOG_START;

    fn mem_device(blocks: usize) -> ByteBlockDevice<MemByteDevice> {
        ByteBlockDevice::new(MemByteDevice::new(blocks * BLOCK_SIZE), BLOCK_SIZE as u32)
            .expect("device")
    }

    #[test]
    fn set_get_remove() {
        let imap = InodeMap::new();
        assert_eq!(imap.get(InodeNumber(5)), None);

        imap.set(InodeNumber(5), BlockNumber(LOG_START + 1));
        assert_eq!(
            imap.get(InodeNumber(5)),
            Some((BlockNumber(LOG_START + 1), 1))
        );

        imap.set(InodeNumber(5), BlockNumber(LOG_START + 9));
        assert_eq!(
            imap.get(InodeNumber(5)),
            Some((BlockNumber(LOG_START + 9), 2))
        );

        imap.remove(InodeNumber(5)).unwrap();
        assert_eq!(imap.get(InodeNumber(5)), None);
        assert!(imap.remove(InodeNumber(5)).is_err());
    }

    #[test]
    fn entries_stay_sorted() {
        let imap = InodeMap::new();
        for ino in [9_u32, 3, 7, 1, 8, 2] {
            imap.set(InodeNumber(ino), BlockNumber(LOG_START + u64::from(ino)));
        }
        let snapshot = imap.snapshot();
        let inos: Vec<u32> = snapshot.iter().map(|e| e.ino.0).collect();
        assert_eq!(inos, vec![1, 2, 3, 7, 8, 9]);
    }

    #[test]
    fn version_increments_monotonically() {
        let imap = InodeMap::new();
        imap.set(InodeNumber(4), BlockNumber(LOG_START));
        for i in 2..10_u32 {
            imap.set(InodeNumber(4), BlockNumber(LOG_START + u64::from(i)));
            assert_eq!(imap.get(InodeNumber(4)).unwrap().1, i);
        }
    }

    #[test]
    fn alloc_is_monotonic_then_scans() {
        let imap = InodeMap::new();
        assert_eq!(imap.alloc_ino(), Some(InodeNumber(ROOT_INO + 1)));
        assert_eq!(imap.alloc_ino(), Some(InodeNumber(ROOT_INO + 2)));

        // Saturate the cursor; scan should find the lowest unused number.
        {
            let mut inner = imap.inner.write();
            inner.next_ino = MAX_INODES;
        }
        imap.set(InodeNumber(2), BlockNumber(LOG_START));
        let allocated = imap.alloc_ino().unwrap();
        assert_eq!(allocated, InodeNumber(3));
    }

    #[test]
    fn load_recomputes_next_ino() {
        let imap = InodeMap::new();
        imap.load(vec![
            ImapEntry {
                ino: InodeNumber(1),
                version: 1,
                location: BlockNumber(LOG_START + 1),
            },
            ImapEntry {
                ino: InodeNumber(40),
                version: 3,
                location: BlockNumber(LOG_START + 2),
            },
        ]);
        assert_eq!(imap.alloc_ino(), Some(InodeNumber(41)));
    }

    #[test]
    fn save_and_load_round_trip() {
        let dev = mem_device(16);
        let imap = InodeMap::new();
        for ino in 1..=300_u32 {
            imap.set(InodeNumber(ino), BlockNumber(LOG_START + u64::from(ino)));
        }

        // 300 entries * 16 bytes = 2 blocks.
        let written = imap.save_to(&dev, BlockNumber(2)).unwrap();
        assert_eq!(written, 300);

        let restored = InodeMap::new();
        restored.load_from(&dev, BlockNumber(2), written).unwrap();
        assert_eq!(restored.snapshot(), imap.snapshot());
        assert_eq!(restored.alloc_ino(), Some(InodeNumber(301)));
    }

    #[test]
    fn load_from_rejects_garbage() {
        let dev = mem_device(16);
        // All-zero entries decode as ino 0, which is invalid.
        assert!(matches!(
            InodeMap::new().load_from(&dev, BlockNumber(2), 4),
            Err(LsfsError::Corruption { .. })
        ));
    }
}
