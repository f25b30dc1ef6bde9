//! Record-list codec for the bucketed index.
//!
//! # On-disk layout (all fields little-endian)
//!
//! ```text
//! Offset  Size  Field
//!    0      4   payload_len        bytes of records that follow
//!    4      4   bucket             bucket this list belongs to (for rescans)
//!  per record:
//!    +      8   block offset       primary position
//!    +      4   block size         primary payload bytes
//!    +      1   key_len
//!    +      N   key                bucket-prefix-stripped, trimmed
//! ```
//!
//! Stored keys have the bucket-prefix bytes removed and are trimmed to the
//! shortest prefix that distinguishes them from every other key in the same
//! list (never less than one byte). Records are kept sorted by stored key.

use byteorder::{ByteOrder, LittleEndian};

use super::error::StoreError;
use super::types::Block;

/// Bytes ahead of the records: `payload_len` + `bucket`.
pub(crate) const LIST_HEADER_LEN: u64 = 8;

/// One index record: a trimmed key and the primary block it points at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct IndexRecord {
    pub key: Vec<u8>,
    pub block: Block,
}

/// Serialize a record list for appending to the index log.
pub(crate) fn encode_list(bucket: u32, records: &[IndexRecord]) -> Vec<u8> {
    let payload_len: usize = records.iter().map(|r| 8 + 4 + 1 + r.key.len()).sum();
    let mut out = Vec::with_capacity(LIST_HEADER_LEN as usize + payload_len);
    out.extend_from_slice(&(payload_len as u32).to_le_bytes());
    out.extend_from_slice(&bucket.to_le_bytes());
    for record in records {
        out.extend_from_slice(&record.block.offset.to_le_bytes());
        out.extend_from_slice(&record.block.size.to_le_bytes());
        out.push(record.key.len() as u8);
        out.extend_from_slice(&record.key);
    }
    out
}

/// Decode the records of a list payload (the bytes after the 8-byte
/// header). `pos` is only for error context.
pub(crate) fn decode_records(payload: &[u8], pos: u64) -> Result<Vec<IndexRecord>, StoreError> {
    let mut records = Vec::new();
    let mut at = 0usize;
    while at < payload.len() {
        if payload.len() - at < 13 {
            return Err(StoreError::CorruptRecordList { pos, detail: "truncated record header" });
        }
        let offset = LittleEndian::read_u64(&payload[at..]);
        let size = LittleEndian::read_u32(&payload[at + 8..]);
        let key_len = payload[at + 12] as usize;
        at += 13;
        if payload.len() - at < key_len {
            return Err(StoreError::CorruptRecordList { pos, detail: "truncated record key" });
        }
        records.push(IndexRecord {
            key: payload[at..at + key_len].to_vec(),
            block: Block::new(offset, size),
        });
        at += key_len;
    }
    Ok(records)
}

/// Length of the longest common prefix of two byte strings.
pub(crate) fn common_prefix_len(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let records = vec![
            IndexRecord { key: vec![1], block: Block::new(0, 10) },
            IndexRecord { key: vec![2, 3, 4], block: Block::new(14, 20) },
            IndexRecord { key: vec![], block: Block::new(38, 1) },
        ];
        let bytes = encode_list(7, &records);
        assert_eq!(LittleEndian::read_u32(&bytes[4..8]), 7);
        let payload_len = LittleEndian::read_u32(&bytes[0..4]) as usize;
        assert_eq!(bytes.len(), 8 + payload_len);

        let back = decode_records(&bytes[8..], 0).unwrap();
        assert_eq!(back, records);
    }

    #[test]
    fn truncated_payloads_error() {
        let records = vec![IndexRecord { key: vec![9, 9], block: Block::new(5, 5) }];
        let bytes = encode_list(0, &records);
        assert!(matches!(
            decode_records(&bytes[8..bytes.len() - 1], 0),
            Err(StoreError::CorruptRecordList { .. })
        ));
        assert!(matches!(
            decode_records(&bytes[8..12], 0),
            Err(StoreError::CorruptRecordList { .. })
        ));
    }

    #[test]
    fn common_prefixes() {
        assert_eq!(common_prefix_len(b"abcd", b"abxy"), 2);
        assert_eq!(common_prefix_len(b"abc", b"abc"), 3);
        assert_eq!(common_prefix_len(b"abc", b"abcd"), 3);
        assert_eq!(common_prefix_len(b"", b"abc"), 0);
    }
}
