//! Preindex — sharded last-writer-wins external sort-reduce.
//!
//! Ingestion pushes `(key, value)` tuples tagged with a process-wide
//! monotonic insertion index; the build step sorts each shard and keeps only
//! the record with the highest index per key. The reader then answers
//! "is `v` the value of the *last* push for key `k`?" in one binary search.
//!
//! # Shard files
//!
//! Phase 1 appends fixed 80-byte records to `shard-%04d.tmp`:
//!
//! ```text
//! Offset  Size  Field
//!    0     64   key
//!   64      4   value          (LE u32)
//!   68      8   insertion idx  (LE u64)
//! ```
//!
//! Phase 2 rewrites each shard as `shard-%04d.dat` holding one 68-byte
//! record per key, ascending by key:
//!
//! ```text
//!    0     64   key
//!   64      4   value          (LE u32)
//! ```
//!
//! `.dat` files appear via `.dat.tmp` + atomic rename; a missing shard file
//! simply means no key hashed into that shard.

mod reader;
mod writer;

pub use reader::PreIndexReader;
pub use writer::{PreIndexOptions, PreIndexWriter};

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use xxhash_rust::xxh64::xxh64;

/// Key width; matches the signature width used by ingestion.
pub const KEY_LEN: usize = 64;

/// Phase-1 record stride.
pub const TMP_RECORD_LEN: usize = KEY_LEN + 4 + 8;

/// Phase-2 record stride.
pub const DAT_RECORD_LEN: usize = KEY_LEN + 4;

#[derive(Error, Debug)]
pub enum PreIndexError {
    #[error("writer closed")]
    WriterClosed,
    #[error("shard file {path} holds {len} bytes, not a multiple of the {stride}-byte record stride")]
    CorruptShard { path: PathBuf, len: u64, stride: u64 },
    #[error("build cancelled")]
    Cancelled,
    #[error("{path}: {source}")]
    File { path: PathBuf, source: io::Error },
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl PreIndexError {
    pub(crate) fn at(path: &Path, source: io::Error) -> Self {
        Self::File { path: path.to_owned(), source }
    }
}

/// Which shard a key routes to.
#[inline]
pub(crate) fn shard_for_key(key: &[u8; KEY_LEN], num_shards: u64) -> u64 {
    xxh64(key, 0) % num_shards
}

pub(crate) fn tmp_path(dir: &Path, shard: u64) -> PathBuf {
    dir.join(format!("shard-{shard:04}.tmp"))
}

pub(crate) fn dat_path(dir: &Path, shard: u64) -> PathBuf {
    dir.join(format!("shard-{shard:04}.dat"))
}
