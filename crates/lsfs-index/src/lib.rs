#![forbid(unsafe_code)]
//! File block index for LSFS.
//!
//! Maps an intra-file block index to a log block address through an inode's
//! direct, single-indirect, and double-indirect pointers. All pointer
//! updates are copy-on-write: touched indirect blocks are re-appended to
//! the log and their previous incarnations marked dead.

use lsfs_block::BlockDevice;
use lsfs_error::{LsfsError, Result};
use lsfs_ondisk::{BlockKind, DiskInode};
use lsfs_segment::{SegmentTable, SegmentWriter};
use lsfs_types::{
    read_le_u64, BlockNumber, BLOCK_SIZE, DIRECT_BLOCKS, MAX_FILE_BLOCKS, POINTERS_PER_BLOCK,
};
use tracing::trace;

const DIRECT_LIMIT: u64 = DIRECT_BLOCKS as u64;
const SINGLE_LIMIT: u64 = DIRECT_LIMIT + POINTERS_PER_BLOCK;

fn ptr_at(block: &[u8], index: u64) -> BlockNumber {
    let offset = usize::try_from(index).unwrap_or(usize::MAX) * 8;
    BlockNumber(read_le_u64(block, offset).unwrap_or(0))
}

fn set_ptr(block: &mut [u8], index: u64, value: BlockNumber) {
    let offset = usize::try_from(index).unwrap_or(usize::MAX) * 8;
    block[offset..offset + 8].copy_from_slice(&value.0.to_le_bytes());
}

fn read_pointer_block(
    dev: &dyn BlockDevice,
    writer: &SegmentWriter,
    addr: u64,
) -> Result<Vec<u8>> {
    if addr == 0 {
        Ok(vec![0_u8; BLOCK_SIZE])
    } else {
        // Indirect blocks may still sit in the writer's staging buffer.
        writer.read_block(dev, BlockNumber(addr))
    }
}

fn check_index(index: u64) -> Result<()> {
    if index >= MAX_FILE_BLOCKS {
        return Err(LsfsError::InvalidArgument("file block index out of range"));
    }
    Ok(())
}

// ── Lookup ──────────────────────────────────────────────────────────────────

/// Resolve a file block index to its log address, if mapped.
pub fn lookup(
    dev: &dyn BlockDevice,
    writer: &SegmentWriter,
    inode: &DiskInode,
    index: u64,
) -> Result<Option<BlockNumber>> {
    check_index(index)?;

    let addr = if index < DIRECT_LIMIT {
        inode.direct[index as usize]
    } else if index < SINGLE_LIMIT {
        if inode.indirect == 0 {
            return Ok(None);
        }
        let block = read_pointer_block(dev, writer, inode.indirect)?;
        ptr_at(&block, index - DIRECT_LIMIT).0
    } else {
        if inode.double_indirect == 0 {
            return Ok(None);
        }
        let rel = index - SINGLE_LIMIT;
        let outer = rel / POINTERS_PER_BLOCK;
        let within = rel % POINTERS_PER_BLOCK;

        let double = read_pointer_block(dev, writer, inode.double_indirect)?;
        let inner_addr = ptr_at(&double, outer);
        if inner_addr.0 == 0 {
            return Ok(None);
        }
        let inner = writer.read_block(dev, inner_addr)?;
        ptr_at(&inner, within).0
    };

    Ok((addr != 0).then_some(BlockNumber(addr)))
}

/// Read a file block; unmapped indexes yield a zero-filled block.
pub fn read_block(
    dev: &dyn BlockDevice,
    writer: &SegmentWriter,
    inode: &DiskInode,
    index: u64,
) -> Result<Vec<u8>> {
    match lookup(dev, writer, inode, index)? {
        Some(addr) => writer.read_block(dev, addr),
        None => Ok(vec![0_u8; BLOCK_SIZE]),
    }
}

// ── Write ───────────────────────────────────────────────────────────────────

/// Append `data` as the file block at `index`, updating the pointer tree.
///
/// The previous block at that index (and any rewritten indirect blocks) are
/// marked dead for the cleaner. Returns the new log address.
pub fn write_block(
    dev: &dyn BlockDevice,
    writer: &SegmentWriter,
    table: &SegmentTable,
    inode: &mut DiskInode,
    index: u64,
    data: &[u8],
    kind: BlockKind,
) -> Result<BlockNumber> {
    check_index(index)?;
    let old = lookup(dev, writer, inode, index)?;

    #[allow(clippy::cast_possible_truncation)]
    let addr = writer.append(dev, table, data, inode.ino, index as u32, kind)?;
    set_leaf_pointer(dev, writer, table, inode, index, addr)?;

    if let Some(old) = old {
        table.mark_dead(old);
    }
    inode.blocks = inode.blocks.max(index + 1);
    trace!(
        target: "lsfs::index",
        ino = inode.ino.0,
        index,
        block = addr.0,
        "wrote file block"
    );
    Ok(addr)
}

/// Point the leaf slot at `index` to `leaf`, rewriting indirect blocks
/// copy-on-write as needed.
///
/// Also used by the cleaner to repoint a relocated data block without
/// re-appending its contents.
pub fn set_leaf_pointer(
    dev: &dyn BlockDevice,
    writer: &SegmentWriter,
    table: &SegmentTable,
    inode: &mut DiskInode,
    index: u64,
    leaf: BlockNumber,
) -> Result<()> {
    check_index(index)?;

    if index < DIRECT_LIMIT {
        inode.direct[index as usize] = leaf.0;
        return Ok(());
    }

    if index < SINGLE_LIMIT {
        let mut block = read_pointer_block(dev, writer, inode.indirect)?;
        set_ptr(&mut block, index - DIRECT_LIMIT, leaf);
        let new_indirect = writer.append(dev, table, &block, inode.ino, 0, BlockKind::Indirect)?;
        if inode.indirect != 0 {
            table.mark_dead(BlockNumber(inode.indirect));
        }
        inode.indirect = new_indirect.0;
        return Ok(());
    }

    let rel = index - SINGLE_LIMIT;
    let outer = rel / POINTERS_PER_BLOCK;
    let within = rel % POINTERS_PER_BLOCK;

    let mut double = read_pointer_block(dev, writer, inode.double_indirect)?;
    let inner_addr = ptr_at(&double, outer);
    let mut inner = read_pointer_block(dev, writer, inner_addr.0)?;

    set_ptr(&mut inner, within, leaf);
    let new_inner = writer.append(dev, table, &inner, inode.ino, 0, BlockKind::Indirect)?;
    if inner_addr.0 != 0 {
        table.mark_dead(inner_addr);
    }

    set_ptr(&mut double, outer, new_inner);
    let new_double = writer.append(dev, table, &double, inode.ino, 0, BlockKind::Indirect)?;
    if inode.double_indirect != 0 {
        table.mark_dead(BlockNumber(inode.double_indirect));
    }
    inode.double_indirect = new_double.0;
    Ok(())
}

// ── Cleaner support ─────────────────────────────────────────────────────────

/// Whether the inode currently references `addr` as an indirect block at
/// any level.
pub fn references_indirect(
    dev: &dyn BlockDevice,
    writer: &SegmentWriter,
    inode: &DiskInode,
    addr: BlockNumber,
) -> Result<bool> {
    if inode.indirect == addr.0 || inode.double_indirect == addr.0 {
        return Ok(true);
    }
    if inode.double_indirect != 0 {
        let double = writer.read_block(dev, BlockNumber(inode.double_indirect))?;
        for outer in 0..POINTERS_PER_BLOCK {
            if ptr_at(&double, outer) == addr {
                return Ok(true);
            }
        }
    }
    Ok(false)
}

/// Swap a relocated indirect block's address in the owner's pointer tree.
///
/// Returns `false` when the inode does not reference `old` (the block died
/// while the cleaner held its copy).
pub fn repoint_indirect(
    dev: &dyn BlockDevice,
    writer: &SegmentWriter,
    table: &SegmentTable,
    inode: &mut DiskInode,
    old: BlockNumber,
    new: BlockNumber,
) -> Result<bool> {
    if inode.indirect == old.0 {
        inode.indirect = new.0;
        return Ok(true);
    }
    if inode.double_indirect == old.0 {
        inode.double_indirect = new.0;
        return Ok(true);
    }
    if inode.double_indirect == 0 {
        return Ok(false);
    }

    let mut double = writer.read_block(dev, BlockNumber(inode.double_indirect))?;
    for outer in 0..POINTERS_PER_BLOCK {
        if ptr_at(&double, outer) == old {
            set_ptr(&mut double, outer, new);
            let new_double =
                writer.append(dev, table, &double, inode.ino, 0, BlockKind::Indirect)?;
            table.mark_dead(BlockNumber(inode.double_indirect));
            inode.double_indirect = new_double.0;
            return Ok(true);
        }
    }
    Ok(false)
}

// ── Truncate ────────────────────────────────────────────────────────────────

/// Shrink the mapped extent to `new_blocks` file blocks.
///
/// Every trimmed leaf and every indirect block that becomes unreferenced is
/// marked dead; partially-trimmed indirect blocks are rewritten
/// copy-on-write. Growth is a no-op (files are sparse).
pub fn truncate(
    dev: &dyn BlockDevice,
    writer: &SegmentWriter,
    table: &SegmentTable,
    inode: &mut DiskInode,
    new_blocks: u64,
) -> Result<()> {
    // Direct pointers past the new end.
    for index in new_blocks..DIRECT_LIMIT {
        let slot = index as usize;
        if inode.direct[slot] != 0 {
            table.mark_dead(BlockNumber(inode.direct[slot]));
            inode.direct[slot] = 0;
        }
    }

    // Single-indirect region.
    if inode.indirect != 0 && new_blocks < SINGLE_LIMIT {
        let keep = new_blocks.saturating_sub(DIRECT_LIMIT);
        let mut block = writer.read_block(dev, BlockNumber(inode.indirect))?;
        let mut trimmed = false;
        for i in keep..POINTERS_PER_BLOCK {
            let leaf = ptr_at(&block, i);
            if leaf.0 != 0 {
                table.mark_dead(leaf);
                set_ptr(&mut block, i, BlockNumber(0));
                trimmed = true;
            }
        }
        if keep == 0 {
            table.mark_dead(BlockNumber(inode.indirect));
            inode.indirect = 0;
        } else if trimmed {
            let new_indirect =
                writer.append(dev, table, &block, inode.ino, 0, BlockKind::Indirect)?;
            table.mark_dead(BlockNumber(inode.indirect));
            inode.indirect = new_indirect.0;
        }
    }

    // Double-indirect region.
    if inode.double_indirect != 0 {
        let keep = new_blocks.saturating_sub(SINGLE_LIMIT);
        let keep_outer = keep / POINTERS_PER_BLOCK;
        let keep_within = keep % POINTERS_PER_BLOCK;

        let mut double = writer.read_block(dev, BlockNumber(inode.double_indirect))?;
        let mut changed = false;

        for outer in 0..POINTERS_PER_BLOCK {
            let inner_addr = ptr_at(&double, outer);
            if inner_addr.0 == 0 {
                continue;
            }

            if outer > keep_outer || (outer == keep_outer && keep_within == 0) {
                // Entire inner block trimmed.
                let inner = writer.read_block(dev, inner_addr)?;
                for i in 0..POINTERS_PER_BLOCK {
                    let leaf = ptr_at(&inner, i);
                    if leaf.0 != 0 {
                        table.mark_dead(leaf);
                    }
                }
                table.mark_dead(inner_addr);
                set_ptr(&mut double, outer, BlockNumber(0));
                changed = true;
            } else if outer == keep_outer {
                // Partially trimmed inner block.
                let mut inner = writer.read_block(dev, inner_addr)?;
                let mut trimmed = false;
                for i in keep_within..POINTERS_PER_BLOCK {
                    let leaf = ptr_at(&inner, i);
                    if leaf.0 != 0 {
                        table.mark_dead(leaf);
                        set_ptr(&mut inner, i, BlockNumber(0));
                        trimmed = true;
                    }
                }
                if trimmed {
                    let new_inner =
                        writer.append(dev, table, &inner, inode.ino, 0, BlockKind::Indirect)?;
                    table.mark_dead(inner_addr);
                    set_ptr(&mut double, outer, new_inner);
                    changed = true;
                }
            }
        }

        if keep == 0 {
            table.mark_dead(BlockNumber(inode.double_indirect));
            inode.double_indirect = 0;
        } else if changed {
            let new_double =
                writer.append(dev, table, &double, inode.ino, 0, BlockKind::Indirect)?;
            table.mark_dead(BlockNumber(inode.double_indirect));
            inode.double_indirect = new_double.0;
        }
    }

    inode.blocks = inode.blocks.min(new_blocks);
    Ok(())
}

/// Mark every block the inode references dead (inode reclamation).
pub fn free_all(
    dev: &dyn BlockDevice,
    writer: &SegmentWriter,
    table: &SegmentTable,
    inode: &mut DiskInode,
) -> Result<()> {
    truncate(dev, writer, table, inode, 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use lsfs_block::{ByteBlockDevice, MemByteDevice};
    use lsfs_segment::GcSignal;
    use lsfs_types::{Geometry, InodeNumber, LOG_START, SEGMENT_BLOCKS, S_IFREG};

    struct Fixture {
        dev: ByteBlockDevice<MemByteDevice>,
        writer: SegmentWriter,
        table: SegmentTable,
    }

    fn fixture() -> Fixture {
        let geometry = Geometry {
            block_size: BLOCK_SIZE as u32,
            segment_blocks: SEGMENT_BLOCKS,
            total_blocks: LOG_START + 8 * SEGMENT_BLOCKS,
            total_segments: 8,
            log_start: LOG_START,
        };
        Fixture {
            dev: ByteBlockDevice::new(
                MemByteDevice::new(geometry.total_blocks as usize * BLOCK_SIZE),
                BLOCK_SIZE as u32,
            )
            .unwrap(),
            writer: SegmentWriter::new(geometry, GcSignal::new()),
            table: SegmentTable::new(geometry),
        }
    }

    fn test_inode() -> DiskInode {
        DiskInode::new(InodeNumber(5), S_IFREG | 0o644)
    }

    fn block_of(byte: u8) -> Vec<u8> {
        vec![byte; BLOCK_SIZE]
    }

    #[test]
    fn unmapped_reads_are_zero() {
        let f = fixture();
        let inode = test_inode();
        assert_eq!(lookup(&f.dev, &f.writer, &inode, 0).unwrap(), None);
        assert_eq!(lookup(&f.dev, &f.writer, &inode, 100).unwrap(), None);
        assert_eq!(lookup(&f.dev, &f.writer, &inode, 100_000).unwrap(), None);
        assert_eq!(read_block(&f.dev, &f.writer, &inode, 3).unwrap(), block_of(0));
    }

    #[test]
    fn index_out_of_range() {
        let f = fixture();
        let mut inode = test_inode();
        assert!(lookup(&f.dev, &f.writer, &inode, MAX_FILE_BLOCKS).is_err());
        assert!(write_block(
            &f.dev,
            &f.writer,
            &f.table,
            &mut inode,
            MAX_FILE_BLOCKS,
            &block_of(1),
            BlockKind::Data
        )
        .is_err());
    }

    #[test]
    fn direct_write_read_round_trip() {
        let f = fixture();
        let mut inode = test_inode();

        let addr = write_block(
            &f.dev,
            &f.writer,
            &f.table,
            &mut inode,
            0,
            &block_of(0xAA),
            BlockKind::Data,
        )
        .unwrap();
        assert_eq!(inode.direct[0], addr.0);
        assert_eq!(inode.blocks, 1);

        f.writer.flush(&f.dev, &f.table).unwrap();
        assert_eq!(read_block(&f.dev, &f.writer, &inode, 0).unwrap(), block_of(0xAA));
    }

    #[test]
    fn rewrite_marks_old_block_dead() {
        let f = fixture();
        let mut inode = test_inode();

        let first = write_block(
            &f.dev,
            &f.writer,
            &f.table,
            &mut inode,
            2,
            &block_of(1),
            BlockKind::Data,
        )
        .unwrap();
        f.writer.flush(&f.dev, &f.table).unwrap();
        let live_before = f.table.entry(lsfs_types::SegmentId(0)).unwrap().live_blocks;

        let second = write_block(
            &f.dev,
            &f.writer,
            &f.table,
            &mut inode,
            2,
            &block_of(2),
            BlockKind::Data,
        )
        .unwrap();
        assert_ne!(first, second);
        let live_after = f.table.entry(lsfs_types::SegmentId(0)).unwrap().live_blocks;
        assert_eq!(live_after, live_before - 1);
    }

    #[test]
    fn single_indirect_round_trip() {
        let f = fixture();
        let mut inode = test_inode();
        let index = DIRECT_LIMIT + 3;

        write_block(
            &f.dev,
            &f.writer,
            &f.table,
            &mut inode,
            index,
            &block_of(0xBB),
            BlockKind::Data,
        )
        .unwrap();
        assert_ne!(inode.indirect, 0);
        assert_eq!(inode.blocks, index + 1);

        f.writer.flush(&f.dev, &f.table).unwrap();
        assert_eq!(read_block(&f.dev, &f.writer, &inode, index).unwrap(), block_of(0xBB));
        // Neighbouring indexes stay unmapped.
        assert_eq!(lookup(&f.dev, &f.writer, &inode, index + 1).unwrap(), None);
    }

    #[test]
    fn single_indirect_rewrite_replaces_indirect_block() {
        let f = fixture();
        let mut inode = test_inode();

        write_block(
            &f.dev,
            &f.writer,
            &f.table,
            &mut inode,
            DIRECT_LIMIT,
            &block_of(1),
            BlockKind::Data,
        )
        .unwrap();
        let first_indirect = inode.indirect;

        write_block(
            &f.dev,
            &f.writer,
            &f.table,
            &mut inode,
            DIRECT_LIMIT + 1,
            &block_of(2),
            BlockKind::Data,
        )
        .unwrap();
        // Copy-on-write: the indirect block moved.
        assert_ne!(inode.indirect, first_indirect);

        f.writer.flush(&f.dev, &f.table).unwrap();
        assert_eq!(
            read_block(&f.dev, &f.writer, &inode, DIRECT_LIMIT).unwrap(),
            block_of(1)
        );
        assert_eq!(
            read_block(&f.dev, &f.writer, &inode, DIRECT_LIMIT + 1).unwrap(),
            block_of(2)
        );
    }

    #[test]
    fn double_indirect_round_trip() {
        let f = fixture();
        let mut inode = test_inode();
        // One index in the first inner block, one far into the tree.
        let near = SINGLE_LIMIT;
        let far = SINGLE_LIMIT + POINTERS_PER_BLOCK * 3 + 17;

        write_block(
            &f.dev,
            &f.writer,
            &f.table,
            &mut inode,
            near,
            &block_of(0xC1),
            BlockKind::Data,
        )
        .unwrap();
        write_block(
            &f.dev,
            &f.writer,
            &f.table,
            &mut inode,
            far,
            &block_of(0xC2),
            BlockKind::Data,
        )
        .unwrap();
        assert_ne!(inode.double_indirect, 0);

        f.writer.flush(&f.dev, &f.table).unwrap();
        assert_eq!(read_block(&f.dev, &f.writer, &inode, near).unwrap(), block_of(0xC1));
        assert_eq!(read_block(&f.dev, &f.writer, &inode, far).unwrap(), block_of(0xC2));
        assert_eq!(lookup(&f.dev, &f.writer, &inode, far - 1).unwrap(), None);
    }

    #[test]
    fn references_indirect_walks_levels() {
        let f = fixture();
        let mut inode = test_inode();

        write_block(
            &f.dev,
            &f.writer,
            &f.table,
            &mut inode,
            DIRECT_LIMIT,
            &block_of(1),
            BlockKind::Data,
        )
        .unwrap();
        write_block(
            &f.dev,
            &f.writer,
            &f.table,
            &mut inode,
            SINGLE_LIMIT,
            &block_of(2),
            BlockKind::Data,
        )
        .unwrap();
        f.writer.flush(&f.dev, &f.table).unwrap();

        assert!(references_indirect(&f.dev, &f.writer, &inode, BlockNumber(inode.indirect)).unwrap());
        assert!(
            references_indirect(&f.dev, &f.writer, &inode, BlockNumber(inode.double_indirect)).unwrap()
        );

        // The inner block hanging off the double-indirect root.
        let double = f.dev.read_block(BlockNumber(inode.double_indirect)).unwrap();
        let inner = ptr_at(&double, 0);
        assert!(references_indirect(&f.dev, &f.writer, &inode, inner).unwrap());

        assert!(!references_indirect(&f.dev, &f.writer, &inode, BlockNumber(LOG_START + 999)).unwrap());
    }

    #[test]
    fn repoint_indirect_updates_tree() {
        let f = fixture();
        let mut inode = test_inode();

        write_block(
            &f.dev,
            &f.writer,
            &f.table,
            &mut inode,
            SINGLE_LIMIT + 2,
            &block_of(0xDD),
            BlockKind::Data,
        )
        .unwrap();
        f.writer.flush(&f.dev, &f.table).unwrap();

        let double = f.dev.read_block(BlockNumber(inode.double_indirect)).unwrap();
        let inner = ptr_at(&double, 0);

        // Pretend the cleaner copied the inner block to a new address.
        let inner_data = f.dev.read_block(inner).unwrap();
        let new_inner = f
            .writer
            .append(&f.dev, &f.table, &inner_data, inode.ino, 0, BlockKind::Indirect)
            .unwrap();
        assert!(repoint_indirect(&f.dev, &f.writer, &f.table, &mut inode, inner, new_inner).unwrap());
        f.writer.flush(&f.dev, &f.table).unwrap();

        // Data still resolves through the relocated inner block.
        assert_eq!(
            read_block(&f.dev, &f.writer, &inode, SINGLE_LIMIT + 2).unwrap(),
            block_of(0xDD)
        );
        assert!(!repoint_indirect(
            &f.dev,
            &f.writer,
            &f.table,
            &mut inode,
            BlockNumber(LOG_START + 777),
            new_inner
        )
        .unwrap());
    }

    #[test]
    fn truncate_to_zero_frees_everything() {
        let f = fixture();
        let mut inode = test_inode();

        for index in [0, 5, DIRECT_LIMIT + 1, SINGLE_LIMIT + 1] {
            write_block(
                &f.dev,
                &f.writer,
                &f.table,
                &mut inode,
                index,
                &block_of(0xEE),
                BlockKind::Data,
            )
            .unwrap();
        }
        f.writer.flush(&f.dev, &f.table).unwrap();

        truncate(&f.dev, &f.writer, &f.table, &mut inode, 0).unwrap();
        assert_eq!(inode.direct, [0; DIRECT_BLOCKS]);
        assert_eq!(inode.indirect, 0);
        assert_eq!(inode.double_indirect, 0);
        assert_eq!(inode.blocks, 0);
        assert_eq!(lookup(&f.dev, &f.writer, &inode, 0).unwrap(), None);
    }

    #[test]
    fn partial_truncate_keeps_prefix() {
        let f = fixture();
        let mut inode = test_inode();

        for index in 0..(DIRECT_LIMIT + 4) {
            #[allow(clippy::cast_possible_truncation)]
            write_block(
                &f.dev,
                &f.writer,
                &f.table,
                &mut inode,
                index,
                &block_of(index as u8),
                BlockKind::Data,
            )
            .unwrap();
        }
        f.writer.flush(&f.dev, &f.table).unwrap();

        truncate(&f.dev, &f.writer, &f.table, &mut inode, DIRECT_LIMIT + 2).unwrap();
        f.writer.flush(&f.dev, &f.table).unwrap();

        // Kept blocks still resolve.
        for index in 0..(DIRECT_LIMIT + 2) {
            #[allow(clippy::cast_possible_truncation)]
            let expected = block_of(index as u8);
            assert_eq!(read_block(&f.dev, &f.writer, &inode, index).unwrap(), expected);
        }
        // Trimmed region is unmapped.
        assert_eq!(lookup(&f.dev, &f.writer, &inode, DIRECT_LIMIT + 2).unwrap(), None);
        assert_eq!(lookup(&f.dev, &f.writer, &inode, DIRECT_LIMIT + 3).unwrap(), None);
        assert_eq!(inode.blocks, DIRECT_LIMIT + 2);
    }
}
