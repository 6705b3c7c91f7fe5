//! Library-wide error and result types.

use std::fmt;
use std::io;

/// Result alias used throughout savekit.
pub type Result<T> = std::result::Result<T, Error>;

/// All errors the library can produce.
///
/// Every storage layer passes the errors of the layer it wraps through
/// unchanged, so the variant a caller sees names the layer that actually
/// failed.
#[derive(Debug)]
pub enum Error {
    /// A magic/signature field did not match the expected value.
    BadMagic,
    /// A structure version is present in the data but not supported.
    UnsupportedVersion(u32),
    /// A record ended before all expected bytes could be read.
    UnexpectedEof,
    /// An offset or size field would reach outside the valid region.
    InvalidRange,
    /// A structural constraint was violated (message describes which one).
    Parse(&'static str),
    /// An underlying I/O operation failed.
    Io(io::Error),
    /// An offset was not a multiple of the sector size.
    Alignment { offset: u64, alignment: u64 },
    /// No free blocks, journal blocks or remap entries are left.
    OutOfSpace,
    /// An on-disk structure is inconsistent (message describes which one).
    Corrupted(&'static str),
    /// A hash-tree block did not match its stored hash.
    IntegrityMismatch {
        /// Level of the tree holding the bad block (1 is just below the
        /// master hash).
        level: usize,
    },
    /// The key needed to sign the container header is missing.
    Signing,
    /// The path does not exist.
    NotFound,
    /// The destination path already exists.
    AlreadyExists,
    /// The directory still has children.
    NotEmpty,
    /// The path is malformed or names something it may not.
    InvalidPath(&'static str),
    /// The file was not opened with the mode this operation needs.
    InvalidOpenMode,
    /// The storage does not implement this operation.
    Unsupported(&'static str),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::BadMagic => write!(f, "bad magic value"),
            Error::UnsupportedVersion(v) => write!(f, "unsupported version: {v:#x}"),
            Error::UnexpectedEof => write!(f, "unexpected end of data"),
            Error::InvalidRange => write!(f, "invalid offset or size"),
            Error::Parse(s) => write!(f, "parse error: {s}"),
            Error::Io(e) => write!(f, "I/O error: {e}"),
            Error::Alignment { offset, alignment } => {
                write!(f, "offset {offset:#x} is not aligned to {alignment:#x}")
            }
            Error::OutOfSpace => write!(f, "out of space"),
            Error::Corrupted(s) => write!(f, "corrupted structure: {s}"),
            Error::IntegrityMismatch { level } => {
                write!(f, "integrity verification failed at level {level}")
            }
            Error::Signing => write!(f, "missing key for header signature"),
            Error::NotFound => write!(f, "path not found"),
            Error::AlreadyExists => write!(f, "path already exists"),
            Error::NotEmpty => write!(f, "directory not empty"),
            Error::InvalidPath(s) => write!(f, "invalid path: {s}"),
            Error::InvalidOpenMode => write!(f, "operation not allowed by open mode"),
            Error::Unsupported(s) => write!(f, "unsupported operation: {s}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        if let Error::Io(e) = self {
            Some(e)
        } else {
            None
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            Error::UnexpectedEof
        } else {
            Error::Io(e)
        }
    }
}
