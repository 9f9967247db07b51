#![forbid(unsafe_code)]
//! Error types for LSFS.
//!
//! Defines `LsfsError` and a `Result<T>` alias used throughout the
//! workspace. Includes errno mappings for FUSE response codes.

use lsfs_types::ParseError;
use thiserror::Error;

/// Unified error type for all LSFS operations.
#[derive(Debug, Error)]
pub enum LsfsError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt metadata at block {block}: {detail}")]
    Corruption { block: u64, detail: String },

    #[error("invalid on-disk format: {0}")]
    Format(#[from] ParseError),

    #[error("no space left in log")]
    NoSpace,

    #[error("no such entry: {0}")]
    NoEntry(String),

    #[error("file exists")]
    Exists,

    #[error("not a directory")]
    NotDirectory,

    #[error("is a directory")]
    IsDirectory,

    #[error("directory not empty")]
    NotEmpty,

    #[error("name too long")]
    NameTooLong,

    #[error("read-only filesystem")]
    ReadOnly,

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
}

impl LsfsError {
    /// Convert this error into a POSIX errno suitable for FUSE replies.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Corruption { .. } => libc::EIO,
            Self::Format(_) => libc::EINVAL,
            Self::NoSpace => libc::ENOSPC,
            Self::NoEntry(_) => libc::ENOENT,
            Self::Exists => libc::EEXIST,
            Self::NotDirectory => libc::ENOTDIR,
            Self::IsDirectory => libc::EISDIR,
            Self::NotEmpty => libc::ENOTEMPTY,
            Self::NameTooLong => libc::ENAMETOOLONG,
            Self::ReadOnly => libc::EROFS,
            Self::InvalidArgument(_) => libc::EINVAL,
        }
    }
}

/// Result alias using `LsfsError`.
pub type Result<T> = std::result::Result<T, LsfsError>;
