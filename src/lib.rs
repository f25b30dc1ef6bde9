//! # caridx — secondary indexes for content-addressed ledger archives
//!
//! Format guarantees (frozen):
//! - All numeric fields are little-endian; never negotiated
//! - Every index file opens with a magic tag and a version; mismatches abort
//! - Sealed files never mutate; writers go through `.tmp` + atomic rename
//! - Bucketteer buckets are sorted, deduplicated, and Eytzinger-ordered so a
//!   membership probe touches one or two cache lines
//! - Preindex `.dat` shards hold exactly one record per key, ascending by key
//! - The generic store's primary files are append-only; deletion is a
//!   tombstone bit plus a freelist entry, reclaimed by background GC
//!
//! The crate is the index layer only: it ingests `(key, value, offset, size)`
//! tuples produced elsewhere and answers point lookups. CAR parsing, RPC, and
//! CLI surfaces live outside.

#[cfg(target_endian = "big")]
compile_error!("caridx encodes every on-disk field little-endian and does not support big-endian hosts");

pub mod blocktime;
pub mod bucketteer;
pub mod cancel;
pub mod cidtooffset;
pub mod epochs;
pub mod eytzinger;
mod fsutil;
pub mod meta;
pub mod preindex;
pub mod sigtoepoch;
pub mod store;

// Flat re-exports for the most common types.
pub use blocktime::{epoch_bounds, epoch_for_slot, BlocktimeIndex, SLOTS_PER_EPOCH};
pub use bucketteer::{BucketteerReader, BucketteerWriter};
pub use cancel::CancelToken;
pub use cidtooffset::{CidToOffsetIndex, SubsetOffsetAndSize};
pub use epochs::EpochList;
pub use meta::IndexMeta;
pub use preindex::{PreIndexReader, PreIndexWriter};
pub use sigtoepoch::SigToEpochIndex;
pub use store::{Block, RecordFormat, Store, StoreOptions};

/// Width of a transaction signature, the key type shared by the bucketteer
/// and the sig→epoch index.
pub const SIGNATURE_LEN: usize = 64;
