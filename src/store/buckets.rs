//! In-memory bucket table and its clean-shutdown snapshot.
//!
//! `2^buckets_bits` positions into the index log, 0 meaning "no record list
//! yet" (index files open with a 2-byte preamble, so no list ever sits at
//! position 0). The table is persisted to `<base>.buckets` on clean close
//! and consumed — deleted — on open; a missing snapshot forces a rescan of
//! the index files.
//!
//! # Snapshot layout (little-endian)
//!
//! ```text
//! Offset  Size      Field
//!    0      8       magic = "idxbkts\0"
//!    8      8       version = 1
//!   16      1       buckets_bits
//!   17      8       index head the snapshot was taken at
//!   25  2^bits×8   bucket positions
//! ```

use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use tracing::{debug, warn};

use super::error::StoreError;
use super::types::Position;
use crate::fsutil;

pub(crate) const SNAPSHOT_MAGIC: [u8; 8] = *b"idxbkts\0";
pub(crate) const SNAPSHOT_VERSION: u64 = 1;

/// Valid bucket widths: byte multiples so prefix stripping and width
/// translation stay byte-granular.
pub(crate) fn validate_bits(bits: u8) -> Result<(), StoreError> {
    match bits {
        8 | 16 | 24 | 32 => Ok(()),
        other => Err(StoreError::InvalidBucketBits(other)),
    }
}

pub(crate) struct Buckets {
    bits: u8,
    table: Vec<Position>,
}

impl Buckets {
    pub(crate) fn new(bits: u8) -> Self {
        Self { bits, table: vec![0; 1usize << bits] }
    }

    pub(crate) fn bits(&self) -> u8 {
        self.bits
    }

    /// Bytes of a key consumed by the bucket prefix.
    pub(crate) fn prefix_bytes(&self) -> usize {
        usize::from(self.bits / 8)
    }

    /// Bucket of an index key: the low `bits` of the little-endian `u32`
    /// formed by its first four bytes.
    pub(crate) fn bucket_for(&self, index_key: &[u8]) -> u32 {
        debug_assert!(index_key.len() >= 4);
        let word = u32::from_le_bytes(index_key[..4].try_into().expect("4-byte prefix"));
        if self.bits == 32 {
            word
        } else {
            word & ((1u32 << self.bits) - 1)
        }
    }

    pub(crate) fn get(&self, bucket: u32) -> Option<Position> {
        match self.table[bucket as usize] {
            0 => None,
            pos => Some(pos),
        }
    }

    pub(crate) fn set(&mut self, bucket: u32, pos: Position) {
        self.table[bucket as usize] = pos;
    }

    pub(crate) fn len(&self) -> usize {
        self.table.len()
    }

    /// Buckets that point at a record list.
    pub(crate) fn occupied(&self) -> impl Iterator<Item = (u32, Position)> + '_ {
        self.table
            .iter()
            .enumerate()
            .filter(|(_, pos)| **pos != 0)
            .map(|(bucket, pos)| (bucket as u32, *pos))
    }

    /// Persist the table for the next open.
    pub(crate) fn write_snapshot(&self, path: &Path, head: Position) -> Result<(), StoreError> {
        let tmp = fsutil::tmp_sibling(path);
        let file = File::create(&tmp).map_err(|e| StoreError::at(&tmp, e))?;
        let mut w = BufWriter::new(file);
        w.write_all(&SNAPSHOT_MAGIC).map_err(|e| StoreError::at(&tmp, e))?;
        w.write_u64::<LittleEndian>(SNAPSHOT_VERSION).map_err(|e| StoreError::at(&tmp, e))?;
        w.write_u8(self.bits).map_err(|e| StoreError::at(&tmp, e))?;
        w.write_u64::<LittleEndian>(head).map_err(|e| StoreError::at(&tmp, e))?;
        for pos in &self.table {
            w.write_u64::<LittleEndian>(*pos).map_err(|e| StoreError::at(&tmp, e))?;
        }
        w.flush().map_err(|e| StoreError::at(&tmp, e))?;
        w.into_inner()
            .map_err(std::io::Error::from)?
            .sync_all()
            .map_err(|e| StoreError::at(&tmp, e))?;
        fs::rename(&tmp, path).map_err(|e| StoreError::at(path, e))?;
        fsutil::sync_parent_dir(path);
        Ok(())
    }

    /// Load and delete a snapshot. Any mismatch — absence, wrong magic or
    /// version, different bits, different head — discards it and the caller
    /// rescans instead.
    pub(crate) fn consume_snapshot(path: &Path, bits: u8, head: Position) -> Option<Self> {
        let loaded = Self::try_consume(path, bits, head);
        // Whatever happened, the snapshot must not survive to a later,
        // staler open.
        match fs::remove_file(path) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                warn!(target: "caridx::store", path = %path.display(), %err, "snapshot delete failed");
            }
        }
        loaded
    }

    fn try_consume(path: &Path, bits: u8, head: Position) -> Option<Self> {
        let file = File::open(path).ok()?;
        let mut r = std::io::BufReader::new(file);

        let mut magic = [0u8; 8];
        r.read_exact(&mut magic).ok()?;
        if magic != SNAPSHOT_MAGIC {
            warn!(target: "caridx::store", path = %path.display(), "snapshot magic mismatch");
            return None;
        }
        if r.read_u64::<LittleEndian>().ok()? != SNAPSHOT_VERSION {
            return None;
        }
        let stored_bits = r.read_u8().ok()?;
        let stored_head = r.read_u64::<LittleEndian>().ok()?;
        if stored_bits != bits || stored_head != head {
            debug!(
                target: "caridx::store",
                stored_bits, bits, stored_head, head,
                "snapshot stale; rescanning"
            );
            return None;
        }
        let mut table = vec![0u64; 1usize << bits];
        r.read_u64_into::<LittleEndian>(&mut table).ok()?;
        Some(Self { bits, table })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_selection_uses_low_bits() {
        let b16 = Buckets::new(16);
        let key = [0x34, 0x12, 0xff, 0xff, 9, 9];
        assert_eq!(b16.bucket_for(&key), 0x1234);
        assert_eq!(b16.prefix_bytes(), 2);

        let b24 = Buckets::new(24);
        assert_eq!(b24.bucket_for(&key), 0xff1234);
        assert_eq!(b24.prefix_bytes(), 3);

        let b32 = Buckets::new(32);
        assert_eq!(b32.bucket_for(&key), 0xffff1234);
    }

    #[test]
    fn zero_is_the_empty_sentinel() {
        let mut buckets = Buckets::new(8);
        assert_eq!(buckets.get(5), None);
        buckets.set(5, 42);
        assert_eq!(buckets.get(5), Some(42));
        assert_eq!(buckets.occupied().collect::<Vec<_>>(), vec![(5, 42)]);
    }

    #[test]
    fn snapshot_roundtrip_and_consumption() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.index.buckets");
        let mut buckets = Buckets::new(8);
        buckets.set(3, 99);
        buckets.write_snapshot(&path, 1234).unwrap();

        // Wrong head → discarded (and deleted).
        assert!(Buckets::consume_snapshot(&path, 8, 999).is_none());
        assert!(!path.exists());

        buckets.write_snapshot(&path, 1234).unwrap();
        let back = Buckets::consume_snapshot(&path, 8, 1234).unwrap();
        assert_eq!(back.get(3), Some(99));
        assert_eq!(back.get(4), None);
        // Consumed: a second open cannot use it.
        assert!(!path.exists());
    }

    #[test]
    fn rejects_unsupported_bits() {
        assert!(validate_bits(16).is_ok());
        assert!(matches!(validate_bits(12), Err(StoreError::InvalidBucketBits(12))));
        assert!(matches!(validate_bits(0), Err(StoreError::InvalidBucketBits(0))));
        assert!(matches!(validate_bits(40), Err(StoreError::InvalidBucketBits(40))));
    }
}
