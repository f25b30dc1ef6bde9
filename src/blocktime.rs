//! Dense per-epoch slot→blocktime index.
//!
//! # On-disk layout (all fields little-endian)
//!
//! ```text
//! Offset  Size      Field
//!    0      14      magic = "blocktimeindex"
//!   14       8      start slot     (LE u64)
//!   22       8      end slot       (LE u64, inclusive)
//!   30       8      epoch          (LE u64)
//!   38       8      capacity       (LE u64, = 432000)
//!   46  cap×4      blocktimes     (LE u32 each, slot - start indexed)
//! ```
//!
//! Exactly `14 + 32 + 432000×4 = 1 728 046` bytes per epoch. Blocktimes are
//! unix seconds stored as `u32` (overflow in 2106); zero means the slot was
//! skipped or the time is unknown.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Read, Write};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use thiserror::Error;

use crate::fsutil;

/// 14-byte magic tag.
pub const MAGIC: [u8; 14] = *b"blocktimeindex";

/// Slots per epoch; every index file covers exactly one epoch's worth.
pub const SLOTS_PER_EPOCH: u64 = 432_000;

/// Fixed file size: magic + four header words + the blocktime array.
pub const FILE_SIZE: u64 = 14 + 4 * 8 + SLOTS_PER_EPOCH * 4;

/// The epoch a slot belongs to.
pub fn epoch_for_slot(slot: u64) -> u64 {
    slot / SLOTS_PER_EPOCH
}

/// First and last (inclusive) slot of an epoch.
pub fn epoch_bounds(epoch: u64) -> (u64, u64) {
    let start = epoch * SLOTS_PER_EPOCH;
    (start, start + SLOTS_PER_EPOCH - 1)
}

/// Canonical file name for an epoch's index.
pub fn filename(epoch: u64, root_cid: &str, network: &str) -> String {
    format!("epoch-{epoch}-{root_cid}-{network}-slot-to-blocktime.index")
}

#[derive(Error, Debug)]
pub enum BlocktimeError {
    #[error("invalid magic — not a blocktime index")]
    InvalidMagic,
    #[error("file holds {len} bytes, expected {FILE_SIZE}")]
    BadFileSize { len: u64 },
    #[error("slot range {start}..={end} does not lie in epoch {epoch}")]
    EpochMismatch { start: u64, end: u64, epoch: u64 },
    #[error("capacity {0} stored, expected {SLOTS_PER_EPOCH}")]
    BadCapacity(u64),
    #[error("slot {slot} out of range {start}..={end}")]
    SlotOutOfRange { slot: u64, start: u64, end: u64 },
    #[error("blocktime {0} does not fit an unsigned 32-bit second count")]
    InvalidBlocktime(i64),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// One epoch's slot→blocktime array.
#[derive(Debug, Clone)]
pub struct BlocktimeIndex {
    epoch: u64,
    start: u64,
    end: u64,
    times: Vec<u32>,
}

impl BlocktimeIndex {
    /// Fresh all-zero index for an epoch.
    pub fn new_for_epoch(epoch: u64) -> Self {
        let (start, end) = epoch_bounds(epoch);
        Self {
            epoch,
            start,
            end,
            times: vec![0; SLOTS_PER_EPOCH as usize],
        }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// First slot covered.
    pub fn start(&self) -> u64 {
        self.start
    }

    /// Last slot covered, inclusive.
    pub fn end(&self) -> u64 {
        self.end
    }

    pub fn capacity(&self) -> u64 {
        self.times.len() as u64
    }

    fn slot_index(&self, slot: u64) -> Result<usize, BlocktimeError> {
        if slot < self.start || slot > self.end {
            return Err(BlocktimeError::SlotOutOfRange {
                slot,
                start: self.start,
                end: self.end,
            });
        }
        Ok((slot - self.start) as usize)
    }

    /// Record a blocktime. Negative values and values past `u32::MAX` are
    /// hard errors.
    pub fn set(&mut self, slot: u64, blocktime: i64) -> Result<(), BlocktimeError> {
        let i = self.slot_index(slot)?;
        let compact =
            u32::try_from(blocktime).map_err(|_| BlocktimeError::InvalidBlocktime(blocktime))?;
        self.times[i] = compact;
        Ok(())
    }

    /// The blocktime recorded for a slot (0 when never set).
    pub fn get(&self, slot: u64) -> Result<i64, BlocktimeError> {
        Ok(i64::from(self.times[self.slot_index(slot)?]))
    }

    /// Write atomically: `.tmp` sibling, fsync, rename, directory fsync.
    pub fn write_to_file(&self, path: &Path) -> Result<(), BlocktimeError> {
        let tmp = fsutil::tmp_sibling(path);
        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&tmp)?;
        let mut w = BufWriter::new(file);

        w.write_all(&MAGIC)?;
        w.write_u64::<LittleEndian>(self.start)?;
        w.write_u64::<LittleEndian>(self.end)?;
        w.write_u64::<LittleEndian>(self.epoch)?;
        w.write_u64::<LittleEndian>(self.capacity())?;
        for t in &self.times {
            w.write_u32::<LittleEndian>(*t)?;
        }
        w.flush()?;
        w.into_inner().map_err(io::Error::from)?.sync_all()?;

        fs::rename(&tmp, path)?;
        fsutil::sync_parent_dir(path);
        Ok(())
    }

    /// Load and validate: magic, exact file size, capacity, and that the
    /// stored slot range lies inside the stored epoch.
    pub fn open(path: &Path) -> Result<Self, BlocktimeError> {
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        if len != FILE_SIZE {
            return Err(BlocktimeError::BadFileSize { len });
        }
        let mut r = io::BufReader::new(file);

        let mut magic = [0u8; 14];
        r.read_exact(&mut magic)?;
        if magic != MAGIC {
            return Err(BlocktimeError::InvalidMagic);
        }
        let start = r.read_u64::<LittleEndian>()?;
        let end = r.read_u64::<LittleEndian>()?;
        let epoch = r.read_u64::<LittleEndian>()?;
        let capacity = r.read_u64::<LittleEndian>()?;
        if capacity != SLOTS_PER_EPOCH {
            return Err(BlocktimeError::BadCapacity(capacity));
        }
        if epoch_for_slot(start) != epoch || epoch_for_slot(end) != epoch {
            return Err(BlocktimeError::EpochMismatch { start, end, epoch });
        }

        let mut times = vec![0u32; capacity as usize];
        r.read_u32_into::<LittleEndian>(&mut times)?;
        Ok(Self { epoch, start, end, times })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Spec scenario: epoch 1 bounds and out-of-range slots.
    #[test]
    fn bounds_and_roundtrip() {
        let mut index = BlocktimeIndex::new_for_epoch(1);
        assert_eq!(index.start(), 432_000);
        assert_eq!(index.end(), 863_999);
        assert_eq!(index.capacity(), 432_000);

        index.set(432_000, 123).unwrap();
        assert_eq!(index.get(432_000).unwrap(), 123);
        assert_eq!(index.get(432_001).unwrap(), 0);
        assert!(matches!(
            index.set(864_000, 1),
            Err(BlocktimeError::SlotOutOfRange { slot: 864_000, .. })
        ));
        assert!(matches!(
            index.get(431_999),
            Err(BlocktimeError::SlotOutOfRange { .. })
        ));
    }

    #[test]
    fn rejects_unrepresentable_blocktimes() {
        let mut index = BlocktimeIndex::new_for_epoch(0);
        assert!(matches!(index.set(0, -5), Err(BlocktimeError::InvalidBlocktime(-5))));
        assert!(matches!(
            index.set(0, i64::from(u32::MAX) + 1),
            Err(BlocktimeError::InvalidBlocktime(_))
        ));
        index.set(0, i64::from(u32::MAX)).unwrap();
        assert_eq!(index.get(0).unwrap(), i64::from(u32::MAX));
    }

    #[test]
    fn file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(filename(3, "bafytest", "mainnet"));
        assert_eq!(
            path.file_name().unwrap().to_str().unwrap(),
            "epoch-3-bafytest-mainnet-slot-to-blocktime.index"
        );

        let (start, end) = epoch_bounds(3);
        let mut index = BlocktimeIndex::new_for_epoch(3);
        index.set(start, 1_700_000_000).unwrap();
        index.set(end, 1_700_000_400).unwrap();
        index.write_to_file(&path).unwrap();
        assert_eq!(fs::metadata(&path).unwrap().len(), 1_728_046);

        let back = BlocktimeIndex::open(&path).unwrap();
        assert_eq!(back.epoch(), 3);
        assert_eq!(back.get(start).unwrap(), 1_700_000_000);
        assert_eq!(back.get(end).unwrap(), 1_700_000_400);
        assert_eq!(back.get(start + 1).unwrap(), 0);
    }

    #[test]
    fn open_rejects_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.index");
        fs::write(&path, b"blocktimeindex").unwrap();
        assert!(matches!(
            BlocktimeIndex::open(&path),
            Err(BlocktimeError::BadFileSize { len: 14 })
        ));

        // Right size, wrong magic.
        let mut bytes = vec![0u8; FILE_SIZE as usize];
        bytes[..14].copy_from_slice(b"blocktimeXXXXX");
        fs::write(&path, &bytes).unwrap();
        assert!(matches!(
            BlocktimeIndex::open(&path),
            Err(BlocktimeError::InvalidMagic)
        ));

        // Cross-epoch slot range.
        let mut index = BlocktimeIndex::new_for_epoch(2);
        index.write_to_file(&path).unwrap();
        let mut bytes = fs::read(&path).unwrap();
        bytes[14..22].copy_from_slice(&0u64.to_le_bytes()); // start from epoch 0
        fs::write(&path, &bytes).unwrap();
        assert!(matches!(
            BlocktimeIndex::open(&path),
            Err(BlocktimeError::EpochMismatch { .. })
        ));
    }
}
