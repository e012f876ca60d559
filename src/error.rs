//! Typed errors for the streaming tar codec and secure extractor.
//!
//! Format errors (decoder), contract errors (pack controller), and security
//! errors (extractor) are all represented as variants of a single enum so
//! that callers can match on them without downcasting. See spec §7.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors returned from the public operations in this crate.
#[derive(Error, Debug)]
pub enum TarError {
    /// Underlying I/O failure reading or writing the archive or filesystem.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A header block's checksum did not match its contents (strict mode).
    #[error("bad checksum in header block")]
    BadChecksum,

    /// The stream ended mid-entry (strict mode) or with trailing non-zero
    /// bytes (strict mode).
    #[error("archive truncated")]
    Truncated,

    /// A single all-zero block was followed by non-zero data (strict mode).
    #[error("invalid zero block: expected end-of-archive marker")]
    InvalidZeroBlock,

    /// A pack entry's sink received more bytes than `header.size` declared.
    #[error("wrote more bytes than the declared entry size")]
    SizeOverflow,

    /// A pack entry's sink was closed with fewer bytes than `header.size`.
    #[error("wrote fewer bytes than the declared entry size")]
    SizeUnderflow,

    /// `add` was called while a previous entry's sink was still open.
    #[error("cannot start a new entry while the previous entry is still open")]
    OverlappingEntry,

    /// `strip` was negative.
    #[error("strip count must be non-negative")]
    InvalidStrip,

    /// A decoded malformed PAX record.
    #[error("malformed PAX record: {0}")]
    BadPaxRecord(String),

    /// An entry name normalized to an absolute path.
    #[error("absolute path denied: {0}")]
    AbsolutePathDenied(String),

    /// A resolved path fell outside the destination root.
    #[error("path escapes destination: {path}")]
    BoundsViolation { path: PathBuf },

    /// A path component along the parent chain was neither a directory, a
    /// missing entry, nor an in-bounds symlink.
    #[error("invalid directory component: {path}")]
    InvalidDirectoryComponent { path: PathBuf },

    /// An entry's normalized name has more path components than
    /// `maxDepth` allows.
    #[error("path depth exceeds limit: {path}")]
    DepthExceeded { path: String },

    /// An entry of `EntryType::Unsupported` (device, fifo, ...) was passed
    /// to `pack`; there is no wire representation for it to emit. Entries
    /// of this type only ever arise from decoding, which does not error on
    /// them — the extractor silently skips materializing them instead.
    #[error("unsupported entry type")]
    UnsupportedType,
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, TarError>;
