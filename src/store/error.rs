//! Error type shared across the store's sub-modules.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store is closed")]
    Closed,
    #[error("key is {len} bytes; this store needs more than {min} bytes with a random prefix")]
    KeyTooShort { len: usize, min: usize },
    #[error("key of {len} bytes does not fit the {expected}-byte fixed key width of this record format")]
    KeyWrongWidth { len: usize, expected: usize },
    #[error("key of {len} bytes exceeds the length-prefixed maximum of 255")]
    KeyTooLong { len: usize },
    #[error("value of {len} bytes does not fit the {expected}-byte fixed value width of this record format")]
    ValueWrongWidth { len: usize, expected: usize },
    #[error("trimmed index key of {len} bytes exceeds the 255-byte record limit; keys share too long a prefix")]
    TrimmedKeyTooLong { len: usize },
    #[error("record of {size} bytes exceeds the {max}-byte per-file cap")]
    RecordTooLarge { size: u64, max: u64 },
    #[error("buckets_bits {0} unsupported; byte multiples 8..=32 only")]
    InvalidBucketBits(u8),
    #[error("max_file_size {size} invalid; must be positive and at most {max}")]
    InvalidMaxFileSize { size: u64, max: u64 },
    #[error("{field} is immutable: stored {stored}, requested {requested}")]
    HeaderMismatch { field: &'static str, stored: u64, requested: u64 },
    #[error("unsupported store header version {0}")]
    UnsupportedVersion(u32),
    #[error("index header sidecar carries no BucketsBits field")]
    MissingBucketsBits,
    #[error("read of {len} bytes at position {pos} passes the log head {head}")]
    OutOfBounds { pos: u64, len: u64, head: u64 },
    #[error("record at position {pos} is corrupt: {detail}")]
    CorruptRecord { pos: u64, detail: &'static str },
    #[error("record list at position {pos} is corrupt: {detail}")]
    CorruptRecordList { pos: u64, detail: &'static str },
    #[error("file handle already closed")]
    AlreadyClosed,
    #[error("GC time budget exhausted; cycle aborted")]
    DeadlineExceeded,
    #[error("cancelled")]
    Cancelled,
    #[error("{path}: {source}")]
    File { path: PathBuf, source: io::Error },
    #[error("header sidecar: {0}")]
    Json(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl StoreError {
    pub(crate) fn at(path: &std::path::Path, source: io::Error) -> Self {
        Self::File { path: path.to_owned(), source }
    }
}
