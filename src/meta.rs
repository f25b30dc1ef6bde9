//! Key/value metadata embedded in sealed index headers.
//!
//! # On-disk layout (all lengths are single bytes)
//!
//! ```text
//! Offset  Size  Field
//!    0      1   num_pairs            (max 255)
//!  per pair:
//!    +      1   key_len              (1..=255)
//!    +      N   key bytes
//!    +      1   value_len            (0..=255)
//!    +      M   value bytes
//! ```
//!
//! The block is deliberately tiny: it tags a sealed file with provenance
//! (epoch number, root CID, network name), not with bulk data. Pair order is
//! preserved on the wire; duplicate keys are rejected at insert time.

use std::io::{self, Read, Write};

use thiserror::Error;

/// Conventional key: the epoch number this index covers, as decimal ASCII.
pub const KEY_EPOCH: &str = "epoch";
/// Conventional key: the root CID of the CAR the index was built from.
pub const KEY_ROOT_CID: &str = "rootCid";
/// Conventional key: the cluster/network name ("mainnet", "testnet", ...).
pub const KEY_NETWORK: &str = "network";

/// Hard cap on pair count and on each key/value length.
pub const MAX_LEN: usize = 255;

#[derive(Error, Debug)]
pub enum MetaError {
    #[error("metadata holds {0} pairs; at most {MAX_LEN} fit the count byte")]
    TooManyPairs(usize),
    #[error("metadata key is empty or longer than {MAX_LEN} bytes: {0} bytes")]
    BadKeyLength(usize),
    #[error("metadata value longer than {MAX_LEN} bytes: {0} bytes")]
    BadValueLength(usize),
    #[error("duplicate metadata key {0:?}")]
    DuplicateKey(String),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Ordered key/value pairs carried in a sealed index header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexMeta {
    pairs: Vec<(Vec<u8>, Vec<u8>)>,
}

impl IndexMeta {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a pair. Rejects empty/oversized keys, oversized values,
    /// duplicates, and more pairs than the count byte can express.
    pub fn add(&mut self, key: impl AsRef<[u8]>, value: impl AsRef<[u8]>) -> Result<(), MetaError> {
        let key = key.as_ref();
        let value = value.as_ref();
        if key.is_empty() || key.len() > MAX_LEN {
            return Err(MetaError::BadKeyLength(key.len()));
        }
        if value.len() > MAX_LEN {
            return Err(MetaError::BadValueLength(value.len()));
        }
        if self.pairs.len() >= MAX_LEN {
            return Err(MetaError::TooManyPairs(self.pairs.len() + 1));
        }
        if self.get(key).is_some() {
            return Err(MetaError::DuplicateKey(String::from_utf8_lossy(key).into_owned()));
        }
        self.pairs.push((key.to_vec(), value.to_vec()));
        Ok(())
    }

    pub fn get(&self, key: impl AsRef<[u8]>) -> Option<&[u8]> {
        let key = key.as_ref();
        self.pairs.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_slice())
    }

    /// UTF-8 view of a value, if present and valid.
    pub fn get_str(&self, key: impl AsRef<[u8]>) -> Option<&str> {
        self.get(key).and_then(|v| std::str::from_utf8(v).ok())
    }

    /// The conventional `epoch` tag parsed as a number.
    pub fn epoch(&self) -> Option<u64> {
        self.get_str(KEY_EPOCH)?.parse().ok()
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Serialized size in bytes.
    pub fn encoded_len(&self) -> usize {
        1 + self
            .pairs
            .iter()
            .map(|(k, v)| 2 + k.len() + v.len())
            .sum::<usize>()
    }

    pub fn write_to<W: Write>(&self, mut w: W) -> io::Result<()> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        buf.push(self.pairs.len() as u8);
        for (k, v) in &self.pairs {
            buf.push(k.len() as u8);
            buf.extend_from_slice(k);
            buf.push(v.len() as u8);
            buf.extend_from_slice(v);
        }
        w.write_all(&buf)
    }

    /// Read a metadata block. Truncated input surfaces as `UnexpectedEof`.
    pub fn read_from<R: Read>(mut r: R) -> io::Result<Self> {
        let mut count = [0u8; 1];
        r.read_exact(&mut count)?;
        let mut pairs = Vec::with_capacity(count[0] as usize);
        for _ in 0..count[0] {
            let mut len = [0u8; 1];
            r.read_exact(&mut len)?;
            let mut key = vec![0u8; len[0] as usize];
            r.read_exact(&mut key)?;
            r.read_exact(&mut len)?;
            let mut value = vec![0u8; len[0] as usize];
            r.read_exact(&mut value)?;
            pairs.push((key, value));
        }
        Ok(Self { pairs })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let mut meta = IndexMeta::new();
        meta.add(KEY_EPOCH, "413").unwrap();
        meta.add(KEY_NETWORK, "mainnet").unwrap();
        meta.add("empty", "").unwrap();

        let mut buf = Vec::new();
        meta.write_to(&mut buf).unwrap();
        assert_eq!(buf.len(), meta.encoded_len());

        let back = IndexMeta::read_from(&buf[..]).unwrap();
        assert_eq!(back, meta);
        assert_eq!(back.epoch(), Some(413));
        assert_eq!(back.get_str(KEY_NETWORK), Some("mainnet"));
        assert_eq!(back.get("empty"), Some(&[][..]));
        assert_eq!(back.get("missing"), None);
    }

    #[test]
    fn encoded_len_matches_spec_example() {
        // {epoch: "test"} → 1 count + (1 + 5 + 1 + 4) = 12 bytes.
        let mut meta = IndexMeta::new();
        meta.add(KEY_EPOCH, "test").unwrap();
        assert_eq!(meta.encoded_len(), 12);
    }

    #[test]
    fn rejects_duplicates_and_oversize() {
        let mut meta = IndexMeta::new();
        meta.add("k", "v").unwrap();
        assert!(matches!(meta.add("k", "w"), Err(MetaError::DuplicateKey(_))));
        assert!(matches!(meta.add("", "v"), Err(MetaError::BadKeyLength(0))));
        assert!(matches!(
            meta.add("x", vec![0u8; 256]),
            Err(MetaError::BadValueLength(256))
        ));
    }
}
