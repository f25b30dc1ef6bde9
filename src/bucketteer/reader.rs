//! Immutable mmapped side of the bucketteer.

use std::fs::File;
use std::path::Path;

use memmap2::{Advice, Mmap};
use positioned_io::ReadAt;
use tracing::{debug, warn};

use super::{sig_hash, sig_prefix, BucketteerError, MAGIC, NO_OFFSET, NUM_PREFIXES, VERSION};
use crate::eytzinger;
use crate::meta::IndexMeta;

/// Reader over a sealed v2 bucketteer file.
///
/// The file is memory-mapped; lookups touch at most one bucket. The full
/// 65 536-entry prefix→offset table lives in memory (512 KiB, `u64::MAX`
/// sentinel for absent prefixes) so a prefix miss costs one array load and
/// no I/O.
pub struct BucketteerReader {
    mmap: Mmap,
    /// Dense prefix → content offset table.
    offsets: Box<[u64; NUM_PREFIXES]>,
    /// Present prefixes with their offsets, ascending; consulted for the
    /// end of each bucket.
    entries: Vec<(u16, u64)>,
    content_start: usize,
    meta: IndexMeta,
}

impl BucketteerReader {
    /// Open and validate a sealed file, then warm up bucket metadata.
    pub fn open(path: &Path) -> Result<Self, BucketteerError> {
        let file = File::open(path)?;
        let file_len = file.metadata()?.len();
        if file_len == 0 {
            return Err(BucketteerError::EmptyFile);
        }
        // Safety: the file is sealed and never mutated after rename.
        let mmap = unsafe { Mmap::map(&file)? };

        let reader = Self::parse(mmap)?;
        reader.warmup(&file);
        Ok(reader)
    }

    fn parse(mmap: Mmap) -> Result<Self, BucketteerError> {
        let data = &mmap[..];
        if data.len() < 4 {
            return Err(BucketteerError::TruncatedHeader {
                declared: 4,
                available: data.len() as u64,
            });
        }
        let payload_len = u32::from_le_bytes(data[0..4].try_into().expect("4-byte slice")) as usize;
        let header_len = 4 + payload_len;
        if data.len() < header_len {
            return Err(BucketteerError::TruncatedHeader {
                declared: header_len as u64,
                available: data.len() as u64,
            });
        }

        let mut cursor = &data[4..header_len];
        let magic = take::<8>(&mut cursor)?;
        if magic != MAGIC {
            return Err(BucketteerError::InvalidMagic { found: magic });
        }
        let version = u64::from_le_bytes(take::<8>(&mut cursor)?);
        if version != VERSION {
            return Err(BucketteerError::UnsupportedVersion(version));
        }

        let meta = IndexMeta::read_from(&mut cursor)?;

        let num_prefixes = u64::from_le_bytes(take::<8>(&mut cursor)?);
        let mut offsets = vec![NO_OFFSET; NUM_PREFIXES].into_boxed_slice();
        let mut entries = Vec::with_capacity(num_prefixes as usize);
        let mut last: Option<u16> = None;
        for _ in 0..num_prefixes {
            let prefix = u16::from_le_bytes(take::<2>(&mut cursor)?);
            let offset = u64::from_le_bytes(take::<8>(&mut cursor)?);
            if last.is_some_and(|p| p >= prefix) {
                return Err(BucketteerError::UnorderedPrefixes(prefix));
            }
            last = Some(prefix);
            offsets[prefix as usize] = offset;
            entries.push((prefix, offset));
        }

        let offsets: Box<[u64; NUM_PREFIXES]> = offsets.try_into().expect("fixed-size table");
        debug!(target: "caridx::bucketteer", prefixes = entries.len(), file_len = mmap.len(), "opened");
        Ok(Self {
            mmap,
            offsets,
            entries,
            content_start: header_len,
            meta,
        })
    }

    /// Page in each present bucket's first byte and hint the kernel that
    /// accesses will be random. Both are best-effort.
    fn warmup(&self, file: &File) {
        if let Err(err) = self.mmap.advise(Advice::Random) {
            warn!(target: "caridx::bucketteer", %err, "madvise(RANDOM) failed");
        }
        let mut one = [0u8; 1];
        for (prefix, offset) in &self.entries {
            let at = self.content_start as u64 + offset;
            if let Err(err) = file.read_exact_at(at, &mut one) {
                warn!(target: "caridx::bucketteer", prefix, at, %err, "bucket warmup read failed");
                break;
            }
        }
    }

    /// Membership probe. A prefix miss answers without I/O; a present
    /// prefix costs one Eytzinger descent over the bucket.
    pub fn has(&self, sig: &[u8; 64]) -> Result<bool, BucketteerError> {
        let prefix = sig_prefix(sig);
        let offset = self.offsets[prefix as usize];
        if offset == NO_OFFSET {
            return Ok(false);
        }
        let bucket = self.bucket(prefix, offset)?;
        Ok(eytzinger::search(bucket, sig_hash(sig)))
    }

    /// The hash region of one present bucket, size-validated.
    fn bucket(&self, prefix: u16, offset: u64) -> Result<&[u8], BucketteerError> {
        let content_len = (self.mmap.len() - self.content_start) as u64;
        let i = self
            .entries
            .binary_search_by_key(&prefix, |(p, _)| *p)
            .unwrap_or_else(|_| unreachable!("offset table and entry list agree on present prefixes"));
        let end = self.entries.get(i + 1).map_or(content_len, |(_, next)| *next);
        let size = end.saturating_sub(offset);
        if end > content_len || size < 4 || (size - 4) % 8 != 0 {
            return Err(BucketteerError::CorruptBucket { prefix, size });
        }

        let start = self.content_start + offset as usize;
        let declared = u32::from_le_bytes(
            self.mmap[start..start + 4].try_into().expect("4-byte slice"),
        );
        let slots = (size - 4) / 8;
        if declared as u64 != slots {
            return Err(BucketteerError::BucketCountMismatch {
                prefix,
                declared,
                actual: slots,
            });
        }
        Ok(&self.mmap[start + 4..start + size as usize])
    }

    pub fn meta(&self) -> &IndexMeta {
        &self.meta
    }

    /// Number of prefixes with at least one signature.
    pub fn prefix_count(&self) -> usize {
        self.entries.len()
    }

    /// Distinct hashes stored for one prefix; 0 when absent.
    pub fn prefix_len(&self, prefix: u16) -> Result<u64, BucketteerError> {
        let offset = self.offsets[prefix as usize];
        if offset == NO_OFFSET {
            return Ok(0);
        }
        Ok(self.bucket(prefix, offset)?.len() as u64 / 8)
    }
}

/// Pop a fixed-size array off the front of a byte cursor.
fn take<const N: usize>(cursor: &mut &[u8]) -> Result<[u8; N], BucketteerError> {
    if cursor.len() < N {
        return Err(BucketteerError::TruncatedHeader {
            declared: N as u64,
            available: cursor.len() as u64,
        });
    }
    let (head, rest) = cursor.split_at(N);
    *cursor = rest;
    Ok(head.try_into().expect("split at N"))
}
