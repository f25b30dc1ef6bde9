//! Mutable accumulator side of the bucketteer.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;

use byteorder::{LittleEndian, WriteBytesExt};
use tracing::debug;

use super::{sig_hash, sig_prefix, BucketteerError, MAGIC, VERSION};
use crate::eytzinger;
use crate::fsutil::{sync_parent_dir, tmp_sibling};
use crate::meta::IndexMeta;

/// Accumulates signatures in memory, then [`seal`](Self::seal)s them into an
/// immutable v2 file.
///
/// Exclusive access is part of the type: `put` takes `&mut self`, and `seal`
/// consumes the writer, so concurrent puts and put-after-seal cannot be
/// expressed.
#[derive(Debug, Default)]
pub struct BucketteerWriter {
    /// Prefix → hashes in insertion order. BTreeMap gives the stable
    /// ascending iteration order the header format requires.
    buckets: BTreeMap<u16, Vec<u64>>,
    len: u64,
}

impl BucketteerWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one signature. Duplicates are tolerated here and removed at
    /// seal time.
    pub fn put(&mut self, sig: &[u8; 64]) {
        self.buckets.entry(sig_prefix(sig)).or_default().push(sig_hash(sig));
        self.len += 1;
    }

    /// Whether the signature was put into this writer. Linear over the
    /// prefix's accumulated hashes.
    pub fn has(&self, sig: &[u8; 64]) -> bool {
        let hash = sig_hash(sig);
        self.buckets
            .get(&sig_prefix(sig))
            .is_some_and(|hashes| hashes.contains(&hash))
    }

    /// Signatures put so far, duplicates included.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of distinct prefixes with at least one signature.
    pub fn prefix_count(&self) -> usize {
        self.buckets.len()
    }

    /// Seal into `path` and return the final file size.
    ///
    /// Writes a `.tmp` sibling, then: draft header with zeroed offsets →
    /// buckets (sorted, deduplicated, Eytzinger) → fsync → in-place header
    /// rewrite with the real offsets → fsync → atomic rename → best-effort
    /// directory fsync.
    pub fn seal(self, path: &Path, meta: &IndexMeta) -> Result<u64, BucketteerError> {
        let tmp = tmp_sibling(path);
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(&tmp)?;

        let size = self.seal_into(&mut file, meta)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&tmp, path)?;
        sync_parent_dir(path);
        Ok(size)
    }

    /// Seal into an already-open file positioned anywhere; the writer seeks
    /// to the start itself. The final header rewrite is flushed but the file
    /// is not fsynced — [`seal`](Self::seal) layers durability and the
    /// atomic rename on top.
    pub fn seal_into(self, file: &mut File, meta: &IndexMeta) -> Result<u64, BucketteerError> {
        let prefixes: Vec<u16> = self.buckets.keys().copied().collect();

        // Draft header: correct length, zeroed offsets.
        let draft = encode_header(meta, prefixes.iter().map(|p| (*p, 0u64)))?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&draft)?;

        // Stream buckets, recording each one's offset into the content area.
        let mut offsets = Vec::with_capacity(prefixes.len());
        let mut content_pos = 0u64;
        {
            let mut w = std::io::BufWriter::new(&mut *file);
            for (prefix, mut hashes) in self.buckets {
                hashes.sort_unstable();
                hashes.dedup();
                let ordered = eytzinger::layout(&hashes);

                offsets.push((prefix, content_pos));
                w.write_u32::<LittleEndian>(ordered.len() as u32)?;
                for hash in &ordered {
                    w.write_u64::<LittleEndian>(*hash)?;
                }
                content_pos += 4 + 8 * ordered.len() as u64;
            }
            w.flush()?;
        }
        file.sync_all()?;

        // The header length only depends on the prefix set, so the final
        // encoding overwrites the draft byte for byte.
        let header = encode_header(meta, offsets.into_iter())?;
        debug_assert_eq!(header.len(), draft.len());
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&header)?;
        file.flush()?;

        let size = header.len() as u64 + content_pos;
        debug!(target: "caridx::bucketteer", prefixes = prefixes.len(), size, "sealed");
        Ok(size)
    }
}

/// Encode the header: `u32 payload_len` + payload (magic, version, meta,
/// prefix table).
fn encode_header(
    meta: &IndexMeta,
    entries: impl ExactSizeIterator<Item = (u16, u64)>,
) -> Result<Vec<u8>, BucketteerError> {
    let mut payload = Vec::with_capacity(8 + 8 + meta.encoded_len() + 8 + entries.len() * 10);
    payload.extend_from_slice(&MAGIC);
    payload.write_u64::<LittleEndian>(VERSION)?;
    meta.write_to(&mut payload)?;
    payload.write_u64::<LittleEndian>(entries.len() as u64)?;
    for (prefix, offset) in entries {
        payload.extend_from_slice(&prefix.to_le_bytes());
        payload.write_u64::<LittleEndian>(offset)?;
    }

    let mut out = Vec::with_capacity(4 + payload.len());
    out.write_u32::<LittleEndian>(payload.len() as u32)?;
    out.extend_from_slice(&payload);
    Ok(out)
}

