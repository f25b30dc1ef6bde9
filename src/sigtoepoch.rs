//! Signature→epoch index: which epoch's archive holds a transaction.
//!
//! A typed facade over the generic store — 64-byte signature keys, `u16 LE`
//! epoch values — plus the `epoch-list` sidecar tracking the set of epochs
//! ever written, so "which epochs does this deployment know about" needs no
//! store scan.

use std::path::Path;

use thiserror::Error;

use crate::epochs::{EpochList, EpochListError};
use crate::store::{RecordFormat, Store, StoreError, StoreOptions};
use crate::SIGNATURE_LEN;

/// Store base name under the index directory.
const STORE_BASE: &str = "sig-to-epoch";
/// Sidecar file name.
const EPOCH_LIST: &str = "epoch-list";

#[derive(Error, Debug)]
pub enum SigToEpochError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    EpochList(#[from] EpochListError),
}

pub struct SigToEpochIndex {
    store: Store,
    epochs: EpochList,
}

impl SigToEpochIndex {
    /// Store options tuned for signature keys: fully random prefixes, so
    /// the wide default table pays off.
    pub fn default_options() -> StoreOptions {
        StoreOptions { buckets_bits: 24, ..Default::default() }
    }

    /// Open or create under `dir` (`sig-to-epoch.*` plus `epoch-list`).
    pub fn open(dir: &Path, opts: StoreOptions) -> Result<Self, SigToEpochError> {
        std::fs::create_dir_all(dir).map_err(|e| StoreError::at(dir, e))?;
        let store = Store::open(&dir.join(STORE_BASE), RecordFormat::SigToEpoch, opts)?;
        let epochs = EpochList::open(&dir.join(EPOCH_LIST))?;
        Ok(Self { store, epochs })
    }

    /// Record that `sig` lives in `epoch`.
    pub fn put(&mut self, sig: &[u8; SIGNATURE_LEN], epoch: u16) -> Result<(), SigToEpochError> {
        self.store.put(sig, &epoch.to_le_bytes())?;
        self.epochs.has_or_put(epoch)?;
        Ok(())
    }

    /// The epoch holding `sig`, if indexed.
    pub fn get(&self, sig: &[u8; SIGNATURE_LEN]) -> Result<Option<u16>, SigToEpochError> {
        let Some(value) = self.store.get(sig)? else {
            return Ok(None);
        };
        let raw: [u8; 2] = value.as_slice().try_into().map_err(|_| {
            StoreError::CorruptRecord { pos: 0, detail: "epoch value is not 2 bytes" }
        })?;
        Ok(Some(u16::from_le_bytes(raw)))
    }

    pub fn has(&self, sig: &[u8; SIGNATURE_LEN]) -> Result<bool, SigToEpochError> {
        Ok(self.store.has(sig)?)
    }

    /// Epochs ever written, ascending.
    pub fn epochs(&self) -> Vec<u16> {
        self.epochs.epochs().collect()
    }

    pub fn flush(&self) -> Result<(), SigToEpochError> {
        Ok(self.store.flush()?)
    }

    pub fn sync(&self) -> Result<(), SigToEpochError> {
        self.store.sync()?;
        self.epochs.sync()?;
        Ok(())
    }

    pub fn close(self) -> Result<(), SigToEpochError> {
        self.epochs.sync()?;
        self.store.close()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sig(seed: u8) -> [u8; SIGNATURE_LEN] {
        let mut s = [0u8; SIGNATURE_LEN];
        for (i, b) in s.iter_mut().enumerate() {
            *b = seed.wrapping_mul(37).wrapping_add(i as u8).wrapping_mul(13);
        }
        s
    }

    fn small_opts() -> StoreOptions {
        StoreOptions {
            buckets_bits: 8,
            gc_interval: std::time::Duration::ZERO,
            ..Default::default()
        }
    }

    #[test]
    fn put_get_and_epoch_list() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = SigToEpochIndex::open(dir.path(), small_opts()).unwrap();
        index.put(&sig(1), 0).unwrap();
        index.put(&sig(2), 413).unwrap();
        index.put(&sig(3), 413).unwrap();

        assert_eq!(index.get(&sig(1)).unwrap(), Some(0));
        assert_eq!(index.get(&sig(2)).unwrap(), Some(413));
        assert_eq!(index.get(&sig(9)).unwrap(), None);
        assert_eq!(index.epochs(), vec![0, 413]);
        index.close().unwrap();

        // Reopen: both the store and the epoch list survive.
        let index = SigToEpochIndex::open(dir.path(), small_opts()).unwrap();
        assert_eq!(index.get(&sig(3)).unwrap(), Some(413));
        assert_eq!(index.epochs(), vec![0, 413]);
    }

    #[test]
    fn reput_moves_a_signature() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = SigToEpochIndex::open(dir.path(), small_opts()).unwrap();
        index.put(&sig(5), 7).unwrap();
        index.put(&sig(5), 8).unwrap();
        assert_eq!(index.get(&sig(5)).unwrap(), Some(8));
        assert_eq!(index.epochs(), vec![7, 8]);
    }
}
