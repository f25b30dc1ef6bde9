//! Lookup side of the preindex.

use std::fs;
use std::io;
use std::path::Path;

use rayon::prelude::*;
use tracing::debug;

use super::{dat_path, shard_for_key, PreIndexError, DAT_RECORD_LEN, KEY_LEN};

/// Reads every built shard into memory and answers last-writer-wins
/// queries.
///
/// Missing shard files are normal — no key hashed there — and lookups into
/// them simply miss.
pub struct PreIndexReader {
    num_shards: u64,
    slabs: Vec<Option<Vec<u8>>>,
}

impl PreIndexReader {
    /// Load all `.dat` shards under `dir` in parallel. `num_shards` must
    /// match the writer's shard count or keys will route to the wrong slab.
    pub fn load(dir: &Path, num_shards: u64) -> Result<Self, PreIndexError> {
        let slabs = (0..num_shards)
            .into_par_iter()
            .map(|shard| {
                let path = dat_path(dir, shard);
                match fs::read(&path) {
                    Ok(bytes) => {
                        if bytes.len() % DAT_RECORD_LEN != 0 {
                            return Err(PreIndexError::CorruptShard {
                                path,
                                len: bytes.len() as u64,
                                stride: DAT_RECORD_LEN as u64,
                            });
                        }
                        Ok(Some(bytes))
                    }
                    Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
                    Err(err) => Err(PreIndexError::at(&path, err)),
                }
            })
            .collect::<Result<Vec<_>, _>>()?;

        let reader = Self { num_shards, slabs };
        debug!(
            target: "caridx::preindex",
            shards = reader.slabs.iter().filter(|s| s.is_some()).count(),
            records = reader.len(),
            "loaded"
        );
        Ok(reader)
    }

    /// The value of the last `push` for `key`, if the key was ever pushed.
    pub fn get(&self, key: &[u8; KEY_LEN]) -> Option<u32> {
        let shard = shard_for_key(key, self.num_shards);
        let slab = self.slabs[shard as usize].as_deref()?;

        let mut lo = 0usize;
        let mut hi = slab.len() / DAT_RECORD_LEN;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let at = mid * DAT_RECORD_LEN;
            match slab[at..at + KEY_LEN].cmp(key) {
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid,
                std::cmp::Ordering::Equal => {
                    let value = slab[at + KEY_LEN..at + DAT_RECORD_LEN]
                        .try_into()
                        .expect("record stride");
                    return Some(u32::from_le_bytes(value));
                }
            }
        }
        None
    }

    /// Whether `value` is what the *last* push for `key` carried. An absent
    /// key answers `false`.
    pub fn is_last(&self, key: &[u8; KEY_LEN], value: u32) -> bool {
        self.get(key) == Some(value)
    }

    /// Total records across all shards.
    pub fn len(&self) -> u64 {
        self.slabs
            .iter()
            .flatten()
            .map(|s| (s.len() / DAT_RECORD_LEN) as u64)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Records in one shard; 0 for missing shards.
    pub fn shard_len(&self, shard: u64) -> u64 {
        self.slabs[shard as usize]
            .as_deref()
            .map_or(0, |s| (s.len() / DAT_RECORD_LEN) as u64)
    }
}
