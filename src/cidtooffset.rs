//! CID→offset index: where in which CAR subset a block lives.
//!
//! A typed facade over the generic store. Keys are raw CID bytes (length
//! prefixed by the record format); values are a fixed 16-byte locator:
//!
//! ```text
//! Offset  Size  Field
//!    0      4   subset_index   (LE u32) which CAR of the set
//!    4      8   offset         (LE u64) byte offset inside that CAR
//!   12      4   size           (LE u32) section length in bytes
//! ```
//!
//! CAR scanning itself lives outside this crate; ingestion hands
//! [`CidToOffsetIndex::index_blocks`] the `(cid, subset, offset, size)`
//! tuples it produced.

use std::path::Path;

use thiserror::Error;

use crate::store::{RecordFormat, Store, StoreError, StoreOptions};

/// Store base name under the index directory.
const STORE_BASE: &str = "cid-to-offset";

/// Encoded byte width of [`SubsetOffsetAndSize`].
pub const VALUE_LEN: usize = 16;

#[derive(Error, Debug)]
pub enum CidToOffsetError {
    #[error("stored locator is {0} bytes, expected {VALUE_LEN}")]
    BadValueWidth(usize),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Where a block lives: which CAR subset, and the byte region inside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubsetOffsetAndSize {
    pub subset: u32,
    pub offset: u64,
    pub size: u32,
}

impl SubsetOffsetAndSize {
    pub fn to_bytes(self) -> [u8; VALUE_LEN] {
        let mut out = [0u8; VALUE_LEN];
        out[..4].copy_from_slice(&self.subset.to_le_bytes());
        out[4..12].copy_from_slice(&self.offset.to_le_bytes());
        out[12..].copy_from_slice(&self.size.to_le_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CidToOffsetError> {
        if bytes.len() != VALUE_LEN {
            return Err(CidToOffsetError::BadValueWidth(bytes.len()));
        }
        Ok(Self {
            subset: u32::from_le_bytes(bytes[..4].try_into().expect("4-byte slice")),
            offset: u64::from_le_bytes(bytes[4..12].try_into().expect("8-byte slice")),
            size: u32::from_le_bytes(bytes[12..].try_into().expect("4-byte slice")),
        })
    }
}

pub struct CidToOffsetIndex {
    store: Store,
}

impl CidToOffsetIndex {
    /// Open or create under `dir` (`cid-to-offset.*`).
    pub fn open(dir: &Path, opts: StoreOptions) -> Result<Self, CidToOffsetError> {
        std::fs::create_dir_all(dir).map_err(|e| StoreError::at(dir, e))?;
        let store = Store::open(&dir.join(STORE_BASE), RecordFormat::CidToOffset, opts)?;
        Ok(Self { store })
    }

    pub fn put(&self, cid: &[u8], locator: SubsetOffsetAndSize) -> Result<(), CidToOffsetError> {
        self.store.put(cid, &locator.to_bytes())?;
        Ok(())
    }

    pub fn get(&self, cid: &[u8]) -> Result<Option<SubsetOffsetAndSize>, CidToOffsetError> {
        match self.store.get(cid)? {
            Some(value) => Ok(Some(SubsetOffsetAndSize::from_bytes(&value)?)),
            None => Ok(None),
        }
    }

    pub fn has(&self, cid: &[u8]) -> Result<bool, CidToOffsetError> {
        Ok(self.store.has(cid)?)
    }

    /// Bulk-ingest the tuples an external CAR scan produced. Flushes once
    /// at the end.
    pub fn index_blocks<I>(&self, blocks: I) -> Result<u64, CidToOffsetError>
    where
        I: IntoIterator<Item = (Vec<u8>, SubsetOffsetAndSize)>,
    {
        let mut written = 0u64;
        for (cid, locator) in blocks {
            if self.store.put(&cid, &locator.to_bytes())? {
                written += 1;
            }
        }
        self.store.flush()?;
        Ok(written)
    }

    pub fn flush(&self) -> Result<(), CidToOffsetError> {
        Ok(self.store.flush()?)
    }

    pub fn sync(&self) -> Result<(), CidToOffsetError> {
        Ok(self.store.sync()?)
    }

    pub fn close(self) -> Result<(), CidToOffsetError> {
        Ok(self.store.close()?)
    }
}
