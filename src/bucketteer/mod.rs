//! Bucketteer — sharded signature-set for existence queries.
//!
//! Answers "was signature S ever seen in this epoch?" over up to ~10⁹
//! signatures. Signatures are sharded by their first two bytes (the
//! little-endian `u16` prefix) into 65 536 buckets; each bucket stores the
//! xxh64 of its signatures, sorted, deduplicated, and rearranged into
//! Eytzinger order for cache-friendly probes.
//!
//! # On-disk layout (version 2, all fields little-endian)
//!
//! ```text
//! Offset  Size  Field
//!    0      4   header_payload_size    bytes that follow, up to content
//!    4      8   magic = "buckette"
//!   12      8   version = 2
//!   20      M   metadata               see `crate::meta`
//!  20+M     8   num_prefixes_present
//!  per present prefix, ascending:
//!    +      2   prefix                 raw first-two-bytes
//!    +      8   offset_into_content    relative to end of header
//!  ── end of header ──
//!  per present prefix, same order:
//!    +      4   num_hashes_in_bucket
//!    +    N×8   xxh64 hashes, Eytzinger order
//! ```
//!
//! Bucket sizes are not stored: a bucket ends where the next present
//! prefix's content begins (or at end of file for the last one).
//!
//! # Sealing
//! The writer emits a draft header with zeroed offsets, streams the buckets
//! while recording where each landed, fsyncs, then overwrites the header in
//! place with the real offsets. The whole file is produced as a `.tmp`
//! sibling and atomically renamed into place.

mod reader;
mod writer;

pub use reader::BucketteerReader;
pub use writer::BucketteerWriter;

use std::io;

use thiserror::Error;
use xxhash_rust::xxh64::xxh64;

use crate::meta::MetaError;

/// 8-byte magic tag at the head of every bucketteer file.
pub const MAGIC: [u8; 8] = *b"buckette";

/// Current format version.
pub const VERSION: u64 = 2;

/// Sentinel in the in-memory prefix table: prefix not present.
pub const NO_OFFSET: u64 = u64::MAX;

/// Number of possible two-byte prefixes.
pub const NUM_PREFIXES: usize = 1 << 16;

#[derive(Error, Debug)]
pub enum BucketteerError {
    #[error("empty file")]
    EmptyFile,
    #[error("invalid magic {found:?} — not a bucketteer file")]
    InvalidMagic { found: [u8; 8] },
    #[error("unsupported bucketteer version {0} (this build reads v{VERSION})")]
    UnsupportedVersion(u64),
    #[error("header declares {declared} payload bytes but the file holds {available}")]
    TruncatedHeader { declared: u64, available: u64 },
    #[error("header prefix table is not strictly ascending at prefix {0:#06x}")]
    UnorderedPrefixes(u16),
    #[error("bucket for prefix {prefix:#06x} spans {size} bytes, not a valid `u32 count + N×8` region")]
    CorruptBucket { prefix: u16, size: u64 },
    #[error("bucket for prefix {prefix:#06x} declares {declared} hashes but spans {actual} slots")]
    BucketCountMismatch { prefix: u16, declared: u32, actual: u64 },
    #[error(transparent)]
    Meta(#[from] MetaError),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Two-byte little-endian prefix of a signature.
#[inline]
pub(crate) fn sig_prefix(sig: &[u8; 64]) -> u16 {
    u16::from_le_bytes([sig[0], sig[1]])
}

/// The 64-bit hash stored per signature.
#[inline]
pub(crate) fn sig_hash(sig: &[u8; 64]) -> u64 {
    xxh64(sig, 0)
}
