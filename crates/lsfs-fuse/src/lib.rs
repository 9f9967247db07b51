#![forbid(unsafe_code)]
//! FUSE adapter for LSFS.
//!
//! A thin translation layer: kernel requests arrive via the `fuser` crate,
//! get forwarded to the [`FsOps`] surface of a mounted [`Lsfs`], and errors
//! are mapped through `LsfsError::to_errno()`.

use fuser::{
    FileAttr, FileType, Filesystem, MountOption, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, Request,
    TimeOrNow,
};
use lsfs_core::{FsOps, InodeAttr, Lsfs, SetAttrRequest};
use lsfs_types::InodeNumber;
use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{error, info, warn};

/// TTL for cached attributes and entries.
const ATTR_TTL: Duration = Duration::from_secs(1);

// ── Error type ──────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum FuseError {
    #[error("invalid mountpoint: {0}")]
    InvalidMountpoint(String),
    #[error("mount I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ── Mount options ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct MountOptions {
    pub read_only: bool,
    pub allow_other: bool,
    pub auto_unmount: bool,
}

fn build_mount_options(options: &MountOptions) -> Vec<MountOption> {
    let mut out = vec![
        MountOption::FSName("lsfs".to_owned()),
        MountOption::DefaultPermissions,
    ];
    if options.read_only {
        out.push(MountOption::RO);
    }
    if options.allow_other {
        out.push(MountOption::AllowOther);
    }
    if options.auto_unmount {
        out.push(MountOption::AutoUnmount);
    }
    out
}

// ── Type conversions ────────────────────────────────────────────────────────

fn to_fuser_file_type(kind: lsfs_types::FileType) -> FileType {
    match kind {
        lsfs_types::FileType::Directory => FileType::Directory,
        lsfs_types::FileType::Symlink => FileType::Symlink,
        lsfs_types::FileType::CharDevice => FileType::CharDevice,
        lsfs_types::FileType::BlockDevice => FileType::BlockDevice,
        lsfs_types::FileType::Fifo => FileType::NamedPipe,
        lsfs_types::FileType::Socket => FileType::Socket,
        lsfs_types::FileType::RegularFile | lsfs_types::FileType::Unknown => {
            FileType::RegularFile
        }
    }
}

fn to_file_attr(attr: &InodeAttr) -> FileAttr {
    FileAttr {
        ino: u64::from(attr.ino.0),
        size: attr.size,
        blocks: attr.blocks,
        atime: attr.atime,
        mtime: attr.mtime,
        ctime: attr.ctime,
        crtime: attr.ctime,
        kind: to_fuser_file_type(attr.kind),
        perm: attr.perm,
        nlink: attr.nlink,
        uid: attr.uid,
        gid: attr.gid,
        rdev: 0,
        blksize: attr.blksize,
        flags: 0,
    }
}

fn time_to_nanos(time: TimeOrNow) -> u64 {
    let time = match time {
        TimeOrNow::SpecificTime(t) => t,
        TimeOrNow::Now => SystemTime::now(),
    };
    time.duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

#[allow(clippy::cast_possible_truncation)]
fn to_ino(raw: u64) -> InodeNumber {
    // FUSE_ROOT_ID and the LSFS root are both 1; inode numbers are 32-bit.
    InodeNumber(raw as u32)
}

// ── Filesystem implementation ───────────────────────────────────────────────

/// The adapter: owns the mounted filesystem for the session's lifetime.
pub struct LsfsFuse {
    fs: Option<Lsfs>,
}

impl LsfsFuse {
    #[must_use]
    pub fn new(fs: Lsfs) -> Self {
        Self { fs: Some(fs) }
    }

    fn ops(&self) -> Option<&Lsfs> {
        self.fs.as_ref()
    }
}

macro_rules! fs_or_reply {
    ($self:expr, $reply:expr) => {
        match $self.ops() {
            Some(fs) => fs,
            None => {
                $reply.error(libc::EIO);
                return;
            }
        }
    };
}

impl Filesystem for LsfsFuse {
    fn init(
        &mut self,
        _req: &Request<'_>,
        _config: &mut fuser::KernelConfig,
    ) -> Result<(), libc::c_int> {
        info!(target: "lsfs::fuse", "filesystem initialised");
        Ok(())
    }

    fn destroy(&mut self) {
        if let Some(fs) = self.fs.take() {
            if let Err(err) = fs.unmount() {
                error!(target: "lsfs::fuse", %err, "unmount failed");
            }
        }
        info!(target: "lsfs::fuse", "filesystem destroyed");
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let fs = fs_or_reply!(self, reply);
        match fs.lookup(to_ino(parent), name.as_bytes()) {
            Ok(attr) => reply.entry(&ATTR_TTL, &to_file_attr(&attr), attr.generation),
            Err(err) => reply.error(err.to_errno()),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        let fs = fs_or_reply!(self, reply);
        match fs.getattr(to_ino(ino)) {
            Ok(attr) => reply.attr(&ATTR_TTL, &to_file_attr(&attr)),
            Err(err) => reply.error(err.to_errno()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let fs = fs_or_reply!(self, reply);
        let request = SetAttrRequest {
            mode,
            uid,
            gid,
            size,
            atime: atime.map(time_to_nanos),
            mtime: mtime.map(time_to_nanos),
        };
        match fs.setattr(to_ino(ino), &request) {
            Ok(attr) => reply.attr(&ATTR_TTL, &to_file_attr(&attr)),
            Err(err) => reply.error(err.to_errno()),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let fs = fs_or_reply!(self, reply);
        let offset = u64::try_from(offset).unwrap_or(0);
        match fs.readdir(to_ino(ino), offset, 1 << 16) {
            Ok(entries) => {
                for entry in entries {
                    let next = i64::try_from(entry.next_offset).unwrap_or(i64::MAX);
                    let full = reply.add(
                        u64::from(entry.ino.0),
                        next,
                        to_fuser_file_type(entry.kind),
                        OsStr::from_bytes(&entry.name),
                    );
                    if full {
                        break;
                    }
                }
                reply.ok();
            }
            Err(err) => reply.error(err.to_errno()),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        let fs = fs_or_reply!(self, reply);
        match fs.open(to_ino(ino)) {
            Ok(()) => reply.opened(0, 0),
            Err(err) => reply.error(err.to_errno()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let fs = fs_or_reply!(self, reply);
        let offset = u64::try_from(offset).unwrap_or(0);
        match fs.read(to_ino(ino), offset, size) {
            Ok(data) => reply.data(&data),
            Err(err) => reply.error(err.to_errno()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let fs = fs_or_reply!(self, reply);
        let offset = u64::try_from(offset).unwrap_or(0);
        match fs.write(to_ino(ino), offset, data) {
            Ok(written) => reply.written(written),
            Err(err) => reply.error(err.to_errno()),
        }
    }

    fn create(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        let fs = fs_or_reply!(self, reply);
        match fs.create(to_ino(parent), name.as_bytes(), mode, req.uid(), req.gid()) {
            Ok(attr) => reply.created(&ATTR_TTL, &to_file_attr(&attr), attr.generation, 0, 0),
            Err(err) => reply.error(err.to_errno()),
        }
    }

    fn mkdir(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let fs = fs_or_reply!(self, reply);
        match fs.mkdir(to_ino(parent), name.as_bytes(), mode, req.uid(), req.gid()) {
            Ok(attr) => reply.entry(&ATTR_TTL, &to_file_attr(&attr), attr.generation),
            Err(err) => reply.error(err.to_errno()),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let fs = fs_or_reply!(self, reply);
        match fs.unlink(to_ino(parent), name.as_bytes()) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(err.to_errno()),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let fs = fs_or_reply!(self, reply);
        match fs.rmdir(to_ino(parent), name.as_bytes()) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(err.to_errno()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let fs = fs_or_reply!(self, reply);
        match fs.rename(
            to_ino(parent),
            name.as_bytes(),
            to_ino(newparent),
            newname.as_bytes(),
        ) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(err.to_errno()),
        }
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        let fs = fs_or_reply!(self, reply);
        match fs.statfs() {
            Ok(stats) => reply.statfs(
                stats.total_blocks,
                stats.free_blocks,
                stats.free_blocks,
                stats.total_inodes,
                stats.free_inodes,
                stats.block_size,
                stats.name_max,
                stats.block_size,
            ),
            Err(err) => reply.error(err.to_errno()),
        }
    }

    fn fsync(&mut self, _req: &Request<'_>, ino: u64, _fh: u64, _datasync: bool, reply: ReplyEmpty) {
        let fs = fs_or_reply!(self, reply);
        match fs.fsync(to_ino(ino)) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(err.to_errno()),
        }
    }

    fn flush(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        _lock_owner: u64,
        reply: ReplyEmpty,
    ) {
        let fs = fs_or_reply!(self, reply);
        match fs.fsync(to_ino(ino)) {
            Ok(()) => reply.ok(),
            Err(err) => {
                warn!(target: "lsfs::fuse", %err, "flush failed");
                reply.error(err.to_errno());
            }
        }
    }
}

// ── Mounting ────────────────────────────────────────────────────────────────

/// Serve `fs` at `mountpoint` until the session ends.
///
/// Unmounting the session triggers `destroy`, which performs the clean
/// LSFS unmount (final checkpoint, clean flag).
pub fn mount(
    fs: Lsfs,
    mountpoint: impl AsRef<Path>,
    options: &MountOptions,
) -> Result<(), FuseError> {
    let mountpoint = mountpoint.as_ref();
    if !mountpoint.is_dir() {
        return Err(FuseError::InvalidMountpoint(
            mountpoint.display().to_string(),
        ));
    }
    let mount_options = build_mount_options(options);
    info!(target: "lsfs::fuse", mountpoint = %mountpoint.display(), "mounting");
    fuser::mount2(LsfsFuse::new(fs), mountpoint, &mount_options)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_type_mapping() {
        assert_eq!(
            to_fuser_file_type(lsfs_types::FileType::Directory),
            FileType::Directory
        );
        assert_eq!(
            to_fuser_file_type(lsfs_types::FileType::RegularFile),
            FileType::RegularFile
        );
        assert_eq!(
            to_fuser_file_type(lsfs_types::FileType::Symlink),
            FileType::Symlink
        );
        // Unknown degrades to a regular file rather than panicking.
        assert_eq!(
            to_fuser_file_type(lsfs_types::FileType::Unknown),
            FileType::RegularFile
        );
    }

    #[test]
    fn time_conversion() {
        let t = UNIX_EPOCH + Duration::new(5, 42);
        assert_eq!(
            time_to_nanos(TimeOrNow::SpecificTime(t)),
            5_000_000_042
        );
        // "Now" resolves to something recent, not zero.
        assert!(time_to_nanos(TimeOrNow::Now) > 1_600_000_000_000_000_000);
    }

    #[test]
    fn mount_option_assembly() {
        let options = build_mount_options(&MountOptions {
            read_only: true,
            allow_other: false,
            auto_unmount: true,
        });
        assert!(options.contains(&MountOption::RO));
        assert!(options.contains(&MountOption::AutoUnmount));
        assert!(!options.contains(&MountOption::AllowOther));
    }
}
