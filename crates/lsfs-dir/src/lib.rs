#![forbid(unsafe_code)]
//! Directory operations for LSFS.
//!
//! A directory's body is regular file content: a sequence of 4-byte-aligned
//! variable-length records, one block at a time, where `ino == 0` marks a
//! tombstoned slot. Records never span blocks; the last record of a block
//! carries the trailing slack in its `rec_len`.

use lsfs_error::{LsfsError, Result};
use lsfs_inode::{InodeHandle, InodeState, StoreCtx};
use lsfs_ondisk::{dirent_record_size, BlockKind, Dirent};
use lsfs_types::{now_nanos, FileType, InodeNumber, BLOCK_SIZE, NAME_MAX};
use tracing::{debug, trace};

/// One visible entry yielded by [`iterate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntryAt {
    pub ino: InodeNumber,
    pub file_type: FileType,
    pub name: Vec<u8>,
    /// Byte offset of this record within the directory body.
    pub offset: u64,
    /// Cookie to resume iteration after this entry.
    pub next_offset: u64,
}

fn check_name(name: &[u8]) -> Result<()> {
    if name.is_empty() {
        return Err(LsfsError::InvalidArgument("empty file name"));
    }
    if name.len() > NAME_MAX {
        return Err(LsfsError::NameTooLong);
    }
    Ok(())
}

fn require_dir(state: &InodeState) -> Result<()> {
    if state.disk.is_dir() {
        Ok(())
    } else {
        Err(LsfsError::NotDirectory)
    }
}

fn touch(state: &mut InodeState) {
    let now = now_nanos();
    state.disk.mtime = now;
    state.disk.ctime = now;
    state.dirty = true;
}

// ── Lookup ──────────────────────────────────────────────────────────────────

/// Find `name`, returning its inode number and record type.
pub fn lookup(
    ctx: &StoreCtx<'_>,
    dir: &InodeHandle,
    name: &[u8],
) -> Result<Option<(InodeNumber, FileType)>> {
    check_name(name)?;
    let state = dir.lock();
    require_dir(&state)?;
    lookup_locked(ctx, &state, name)
}

fn lookup_locked(
    ctx: &StoreCtx<'_>,
    state: &InodeState,
    name: &[u8],
) -> Result<Option<(InodeNumber, FileType)>> {
    let dir_size = state.disk.size;
    let mut offset = 0_u64;
    let mut block = Vec::new();

    while offset < dir_size {
        let block_idx = offset / BLOCK_SIZE as u64;
        let block_offset = (offset % BLOCK_SIZE as u64) as usize;
        if block_offset == 0 {
            block = lsfs_index::read_block(ctx.dev, ctx.writer, &state.disk, block_idx)?;
        }

        let entry = Dirent::parse_at(&block, block_offset)?;
        if entry.rec_len == 0 {
            // End of valid records in this directory.
            break;
        }
        if entry.ino.0 != 0 && entry.name == name {
            return Ok(Some((entry.ino, entry.file_type)));
        }
        offset += u64::from(entry.rec_len);
    }
    Ok(None)
}

// ── Add ─────────────────────────────────────────────────────────────────────

/// Insert `(name, ino, file_type)`, reusing tombstones or record slack.
///
/// Fails with `Exists` when the name is already present.
pub fn add(
    ctx: &StoreCtx<'_>,
    dir: &InodeHandle,
    name: &[u8],
    ino: InodeNumber,
    file_type: FileType,
) -> Result<()> {
    check_name(name)?;
    let mut state = dir.lock();
    require_dir(&state)?;

    if lookup_locked(ctx, &state, name)?.is_some() {
        return Err(LsfsError::Exists);
    }

    let needed = dirent_record_size(name.len());
    let dir_size = state.disk.size;
    let mut offset = 0_u64;
    let mut block = Vec::new();

    while offset < dir_size {
        let block_idx = offset / BLOCK_SIZE as u64;
        let block_offset = (offset % BLOCK_SIZE as u64) as usize;
        if block_offset == 0 {
            block = lsfs_index::read_block(ctx.dev, ctx.writer, &state.disk, block_idx)?;
        }

        let entry = Dirent::parse_at(&block, block_offset)?;

        if entry.rec_len == 0 {
            // Unused tail of the block.
            let space = BLOCK_SIZE - block_offset;
            if space >= needed {
                let record = Dirent {
                    ino,
                    rec_len: u16::try_from(space)
                        .map_err(|_| LsfsError::InvalidArgument("record length"))?,
                    file_type,
                    name: name.to_vec(),
                };
                record.encode_at(&mut block, block_offset);
                return commit_block(ctx, &mut state, block_idx, &block, name, ino);
            }
            break;
        }

        let rec_len = usize::from(entry.rec_len);

        // A tombstone large enough for the new record.
        if entry.ino.0 == 0 && rec_len >= needed {
            let remaining = rec_len - needed;
            if remaining >= dirent_record_size(1) {
                // Split off the tail as a fresh tombstone.
                let record = Dirent {
                    ino,
                    rec_len: needed as u16,
                    file_type,
                    name: name.to_vec(),
                };
                record.encode_at(&mut block, block_offset);
                let tomb = Dirent {
                    ino: InodeNumber(0),
                    rec_len: remaining as u16,
                    file_type: FileType::Unknown,
                    name: Vec::new(),
                };
                tomb.encode_at(&mut block, block_offset + needed);
            } else {
                let record = Dirent {
                    ino,
                    rec_len: entry.rec_len,
                    file_type,
                    name: name.to_vec(),
                };
                record.encode_at(&mut block, block_offset);
            }
            return commit_block(ctx, &mut state, block_idx, &block, name, ino);
        }

        // Slack behind a live record.
        if entry.ino.0 != 0 {
            let used = entry.used_size();
            let slack = rec_len - used;
            if slack >= needed {
                let mut shrunk = entry.clone();
                shrunk.rec_len = used as u16;
                shrunk.encode_at(&mut block, block_offset);

                let record = Dirent {
                    ino,
                    rec_len: slack as u16,
                    file_type,
                    name: name.to_vec(),
                };
                record.encode_at(&mut block, block_offset + used);
                return commit_block(ctx, &mut state, block_idx, &block, name, ino);
            }
        }

        offset += u64::from(entry.rec_len);
    }

    // No slot found: start a fresh block whose single record owns it all.
    let new_block_idx = dir_size / BLOCK_SIZE as u64;
    let mut fresh = vec![0_u8; BLOCK_SIZE];
    let record = Dirent {
        ino,
        rec_len: BLOCK_SIZE as u16,
        file_type,
        name: name.to_vec(),
    };
    record.encode_at(&mut fresh, 0);

    lsfs_index::write_block(
        ctx.dev,
        ctx.writer,
        ctx.table,
        &mut state.disk,
        new_block_idx,
        &fresh,
        BlockKind::Dirent,
    )?;
    state.disk.size = (new_block_idx + 1) * BLOCK_SIZE as u64;
    touch(&mut state);
    debug!(
        target: "lsfs::dir",
        dir = dir.ino().0,
        ino = ino.0,
        "added entry in new directory block"
    );
    Ok(())
}

fn commit_block(
    ctx: &StoreCtx<'_>,
    state: &mut InodeState,
    block_idx: u64,
    block: &[u8],
    name: &[u8],
    ino: InodeNumber,
) -> Result<()> {
    lsfs_index::write_block(
        ctx.dev,
        ctx.writer,
        ctx.table,
        &mut state.disk,
        block_idx,
        block,
        BlockKind::Dirent,
    )?;
    touch(state);
    trace!(
        target: "lsfs::dir",
        ino = ino.0,
        name = %String::from_utf8_lossy(name),
        block = block_idx,
        "directory entry written"
    );
    Ok(())
}

// ── Remove ──────────────────────────────────────────────────────────────────

/// Remove `name`, tombstoning its record (merging into the preceding record
/// of the same block when possible).
pub fn remove(ctx: &StoreCtx<'_>, dir: &InodeHandle, name: &[u8]) -> Result<()> {
    check_name(name)?;
    let mut state = dir.lock();
    require_dir(&state)?;

    let dir_size = state.disk.size;
    let mut offset = 0_u64;
    let mut block = Vec::new();
    let mut prev_offset: Option<usize> = None;

    while offset < dir_size {
        let block_idx = offset / BLOCK_SIZE as u64;
        let block_offset = (offset % BLOCK_SIZE as u64) as usize;
        if block_offset == 0 {
            block = lsfs_index::read_block(ctx.dev, ctx.writer, &state.disk, block_idx)?;
            prev_offset = None;
        }

        let entry = Dirent::parse_at(&block, block_offset)?;
        if entry.rec_len == 0 {
            break;
        }

        if entry.ino.0 != 0 && entry.name == name {
            if let Some(prev) = prev_offset {
                // Fold this slot into the preceding record's slack.
                let mut prev_entry = Dirent::parse_at(&block, prev)?;
                prev_entry.rec_len += entry.rec_len;
                prev_entry.encode_at(&mut block, prev);
            } else {
                let tomb = Dirent {
                    ino: InodeNumber(0),
                    rec_len: entry.rec_len,
                    file_type: FileType::Unknown,
                    name: Vec::new(),
                };
                tomb.encode_at(&mut block, block_offset);
            }

            lsfs_index::write_block(
                ctx.dev,
                ctx.writer,
                ctx.table,
                &mut state.disk,
                block_idx,
                &block,
                BlockKind::Dirent,
            )?;
            touch(&mut state);
            debug!(
                target: "lsfs::dir",
                dir = dir.ino().0,
                name = %String::from_utf8_lossy(name),
                "removed entry"
            );
            return Ok(());
        }

        prev_offset = Some(block_offset);
        offset += u64::from(entry.rec_len);
    }

    Err(LsfsError::NoEntry(
        String::from_utf8_lossy(name).into_owned(),
    ))
}

// ── Queries ─────────────────────────────────────────────────────────────────

/// True when only `.` and `..` remain.
pub fn is_empty(ctx: &StoreCtx<'_>, dir: &InodeHandle) -> Result<bool> {
    let state = dir.lock();
    require_dir(&state)?;

    let dir_size = state.disk.size;
    let mut offset = 0_u64;
    let mut block = Vec::new();

    while offset < dir_size {
        let block_idx = offset / BLOCK_SIZE as u64;
        let block_offset = (offset % BLOCK_SIZE as u64) as usize;
        if block_offset == 0 {
            block = lsfs_index::read_block(ctx.dev, ctx.writer, &state.disk, block_idx)?;
        }

        let entry = Dirent::parse_at(&block, block_offset)?;
        if entry.rec_len == 0 {
            break;
        }
        if entry.ino.0 != 0 && !entry.is_dot_or_dotdot() {
            return Ok(false);
        }
        offset += u64::from(entry.rec_len);
    }
    Ok(true)
}

/// Walk visible records starting at byte offset `start`.
///
/// `start` must be zero or a `next_offset` from a previous call.
pub fn iterate(ctx: &StoreCtx<'_>, dir: &InodeHandle, start: u64) -> Result<Vec<DirEntryAt>> {
    let state = dir.lock();
    require_dir(&state)?;

    let dir_size = state.disk.size;
    let mut offset = start;
    let mut block = Vec::new();
    let mut loaded_block = u64::MAX;
    let mut entries = Vec::new();

    while offset < dir_size {
        let block_idx = offset / BLOCK_SIZE as u64;
        let block_offset = (offset % BLOCK_SIZE as u64) as usize;
        if block_idx != loaded_block {
            block = lsfs_index::read_block(ctx.dev, ctx.writer, &state.disk, block_idx)?;
            loaded_block = block_idx;
        }

        let entry = Dirent::parse_at(&block, block_offset)?;
        if entry.rec_len == 0 {
            break;
        }
        let next_offset = offset + u64::from(entry.rec_len);
        if entry.ino.0 != 0 && !entry.name.is_empty() {
            entries.push(DirEntryAt {
                ino: entry.ino,
                file_type: entry.file_type,
                name: entry.name,
                offset,
                next_offset,
            });
        }
        offset = next_offset;
    }
    Ok(entries)
}

// ── Init & parent maintenance ───────────────────────────────────────────────

/// Populate a fresh directory with its `.` and `..` records.
pub fn init(ctx: &StoreCtx<'_>, dir: &InodeHandle, parent: InodeNumber) -> Result<()> {
    let mut state = dir.lock();

    let mut block = vec![0_u8; BLOCK_SIZE];
    let dot = Dirent {
        ino: dir.ino(),
        rec_len: dirent_record_size(1) as u16,
        file_type: FileType::Directory,
        name: b".".to_vec(),
    };
    dot.encode_at(&mut block, 0);

    let dotdot = Dirent {
        ino: parent,
        rec_len: (BLOCK_SIZE - dirent_record_size(1)) as u16,
        file_type: FileType::Directory,
        name: b"..".to_vec(),
    };
    dotdot.encode_at(&mut block, dirent_record_size(1));

    lsfs_index::write_block(
        ctx.dev,
        ctx.writer,
        ctx.table,
        &mut state.disk,
        0,
        &block,
        BlockKind::Dirent,
    )?;
    state.disk.size = BLOCK_SIZE as u64;
    // `.` plus the link from the parent.
    state.disk.nlink = 2;
    state.dirty = true;
    debug!(
        target: "lsfs::dir",
        dir = dir.ino().0,
        parent = parent.0,
        "initialised directory"
    );
    Ok(())
}

/// Rewrite the `..` entry after a cross-directory rename.
pub fn set_parent(ctx: &StoreCtx<'_>, dir: &InodeHandle, new_parent: InodeNumber) -> Result<()> {
    let mut state = dir.lock();
    require_dir(&state)?;

    let mut block = lsfs_index::read_block(ctx.dev, ctx.writer, &state.disk, 0)?;
    let dot = Dirent::parse_at(&block, 0)?;
    let dotdot_offset = usize::from(dot.rec_len);
    let mut dotdot = Dirent::parse_at(&block, dotdot_offset)?;
    if dotdot.name != b".." {
        return Err(LsfsError::Corruption {
            block: 0,
            detail: format!("directory {} first block lacks a '..' record", dir.ino()),
        });
    }
    dotdot.ino = new_parent;
    dotdot.encode_at(&mut block, dotdot_offset);

    lsfs_index::write_block(
        ctx.dev,
        ctx.writer,
        ctx.table,
        &mut state.disk,
        0,
        &block,
        BlockKind::Dirent,
    )?;
    touch(&mut state);
    Ok(())
}

/// Resolve the parent recorded in `..` (directory lookup support).
pub fn parent_of(ctx: &StoreCtx<'_>, dir: &InodeHandle) -> Result<InodeNumber> {
    let state = dir.lock();
    require_dir(&state)?;
    let block = lsfs_index::read_block(ctx.dev, ctx.writer, &state.disk, 0)?;
    let dot = Dirent::parse_at(&block, 0)?;
    let dotdot = Dirent::parse_at(&block, usize::from(dot.rec_len))?;
    if dotdot.name != b".." {
        return Err(LsfsError::Corruption {
            block: 0,
            detail: format!("directory {} first block lacks a '..' record", dir.ino()),
        });
    }
    Ok(dotdot.ino)
}
