//! Append-only log of freed primary regions.
//!
//! Every record is `u64 LE offset, u32 LE size` — a [`Block`] released by a
//! delete or an overwrite. GC drains the file, tombstones the regions, and
//! only then truncates it; tombstoning twice is harmless, so a crash in
//! between loses nothing.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use byteorder::{ByteOrder, LittleEndian};
use tracing::debug;

use super::error::StoreError;
use super::types::Block;

/// Bytes per freelist entry.
pub(crate) const ENTRY_LEN: usize = 12;

pub(crate) struct Freelist {
    path: PathBuf,
    w: BufWriter<File>,
    /// Entries appended since the last truncate (including flushed ones).
    pending: u64,
}

impl Freelist {
    pub(crate) fn open(path: &Path) -> Result<Self, StoreError> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)
            .map_err(|e| StoreError::at(path, e))?;
        let len = file.metadata().map_err(|e| StoreError::at(path, e))?.len();
        if len % ENTRY_LEN as u64 != 0 {
            return Err(StoreError::CorruptRecord {
                pos: len,
                detail: "freelist length is not a multiple of the entry stride",
            });
        }
        Ok(Self {
            path: path.to_owned(),
            w: BufWriter::new(file),
            pending: len / ENTRY_LEN as u64,
        })
    }

    pub(crate) fn put(&mut self, blk: Block) -> Result<(), StoreError> {
        let mut entry = [0u8; ENTRY_LEN];
        LittleEndian::write_u64(&mut entry[..8], blk.offset);
        LittleEndian::write_u32(&mut entry[8..], blk.size);
        self.w.write_all(&entry).map_err(|e| StoreError::at(&self.path, e))?;
        self.pending += 1;
        Ok(())
    }

    /// Entries waiting for the next GC cycle.
    pub(crate) fn len(&self) -> u64 {
        self.pending
    }

    pub(crate) fn flush(&mut self) -> Result<(), StoreError> {
        self.w.flush().map_err(|e| StoreError::at(&self.path, e))
    }

    pub(crate) fn sync(&mut self) -> Result<(), StoreError> {
        self.flush()?;
        self.w
            .get_ref()
            .sync_all()
            .map_err(|e| StoreError::at(&self.path, e))
    }

    /// Flush and read back every entry. The file is left intact; call
    /// [`Self::truncate`] once the entries have been acted on.
    pub(crate) fn drain(&mut self) -> Result<Vec<Block>, StoreError> {
        self.flush()?;
        let bytes = std::fs::read(&self.path).map_err(|e| StoreError::at(&self.path, e))?;
        if bytes.len() % ENTRY_LEN != 0 {
            return Err(StoreError::CorruptRecord {
                pos: bytes.len() as u64,
                detail: "freelist length is not a multiple of the entry stride",
            });
        }
        Ok(bytes
            .chunks_exact(ENTRY_LEN)
            .map(|entry| {
                Block::new(
                    LittleEndian::read_u64(&entry[..8]),
                    LittleEndian::read_u32(&entry[8..]),
                )
            })
            .collect())
    }

    /// Discard all entries; the regions they named are tombstoned now.
    pub(crate) fn truncate(&mut self) -> Result<(), StoreError> {
        self.flush()?;
        self.w
            .get_ref()
            .set_len(0)
            .map_err(|e| StoreError::at(&self.path, e))?;
        self.w
            .get_ref()
            .sync_all()
            .map_err(|e| StoreError::at(&self.path, e))?;
        debug!(target: "caridx::store", drained = self.pending, "freelist truncated");
        self.pending = 0;
        Ok(())
    }
}
