//! Bucketed index over the primary store.
//!
//! A key's bucket is the low `buckets_bits` bits of the little-endian `u32`
//! formed by its first four bytes; the in-memory table maps each bucket to
//! the newest record list in the index log. Updates never mutate old lists —
//! a fresh list is appended and the bucket pointer swings to it, leaving the
//! old region as garbage.
//!
//! Stored keys drop their bucket-prefix bytes and are trimmed to the
//! shortest distinguishing prefix, so lookups return *candidates* that the
//! store must verify against the primary's full keys. When a new key's trim
//! collides with a stored one, the full key is fetched from the primary and
//! both trims are extended past the divergence.
//!
//! The first index file opens with a two-byte `[version, buckets_bits]`
//! preamble so that no record list ever sits at position 0, which the
//! bucket table uses as its empty sentinel.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::buckets::{validate_bits, Buckets};
use super::error::StoreError;
use super::filecache::FileCache;
use super::log::AppendLog;
use super::primary::Primary;
use super::recordlist::{common_prefix_len, decode_records, encode_list, IndexRecord};
use super::types::{Block, Position};

/// First byte of the index preamble.
pub(crate) const PREAMBLE_VERSION: u8 = 1;
/// Bytes of `[version, buckets_bits]` at the head of the first index file.
pub(crate) const PREAMBLE_LEN: u64 = 2;

/// Upper bound a record-list header may declare; anything bigger is
/// corruption, not a real list.
const MAX_LIST_PAYLOAD: u32 = 1 << 28;

pub(crate) struct Index {
    log: AppendLog,
    buckets: Buckets,
}

impl Index {
    /// Open or create the index rooted at `base` (`<base>.<n>` files plus
    /// the `.info` and `.buckets` sidecars). A stored `BucketsBits`
    /// differing from `requested_bits` triggers a width translation, which
    /// needs the primary for full keys.
    pub(crate) fn open(
        base: &Path,
        requested_bits: u8,
        max_file_size: u64,
        cache: Arc<FileCache>,
        primary: &Primary,
    ) -> Result<Self, StoreError> {
        validate_bits(requested_bits)?;
        let (mut log, stored_bits) =
            AppendLog::open(base, max_file_size, Some(requested_bits), Arc::clone(&cache))?;

        if log.head() == 0 {
            // Fresh (or never-written) index: lay down the preamble so
            // position 0 is reserved. An empty index translates by just
            // rewriting the sidecar.
            if stored_bits.is_some_and(|bits| bits != requested_bits) {
                log.write_header(Some(requested_bits))?;
            }
            log.append(&[PREAMBLE_VERSION, requested_bits])?;
            return Ok(Self { log, buckets: Buckets::new(requested_bits) });
        }

        let stored_bits = stored_bits.ok_or(StoreError::MissingBucketsBits)?;
        validate_bits(stored_bits)?;
        verify_preamble(&log, stored_bits)?;

        let snapshot = snapshot_path(base);
        let buckets = Buckets::consume_snapshot(&snapshot, stored_bits, log.head())
            .map(Ok)
            .unwrap_or_else(|| rescan(&log, stored_bits))?;

        if stored_bits == requested_bits {
            return Ok(Self { log, buckets });
        }

        info!(
            target: "caridx::store",
            from = stored_bits,
            to = requested_bits,
            "translating index bucket width"
        );
        translate(base, max_file_size, cache, log, buckets, requested_bits, primary)
    }

    pub(crate) fn bits(&self) -> u8 {
        self.buckets.bits()
    }

    fn validate_key(&self, index_key: &[u8]) -> Result<(), StoreError> {
        let min = usize::max(3, self.buckets.prefix_bytes());
        if index_key.len() <= min {
            return Err(StoreError::KeyTooShort { len: index_key.len(), min });
        }
        Ok(())
    }

    fn fragment<'a>(&self, index_key: &'a [u8]) -> &'a [u8] {
        &index_key[self.buckets.prefix_bytes()..]
    }

    /// Primary blocks whose stored key could be `index_key`. The caller
    /// verifies against the primary's full keys.
    pub(crate) fn candidates(&self, index_key: &[u8]) -> Result<Vec<Block>, StoreError> {
        self.validate_key(index_key)?;
        let bucket = self.buckets.bucket_for(index_key);
        let Some(pos) = self.buckets.get(bucket) else {
            return Ok(Vec::new());
        };
        let fragment = self.fragment(index_key);
        let records = read_list(&self.log, pos)?.1;
        Ok(records
            .into_iter()
            .filter(|r| fragment.starts_with(&r.key))
            .map(|r| r.block)
            .collect())
    }

    /// Point `index_key` at `blk`. Returns the block it previously pointed
    /// at, if the key was already present.
    pub(crate) fn put(
        &mut self,
        primary: &Primary,
        index_key: &[u8],
        blk: Block,
    ) -> Result<Option<Block>, StoreError> {
        self.validate_key(index_key)?;
        let bucket = self.buckets.bucket_for(index_key);
        let mut records = match self.buckets.get(bucket) {
            Some(pos) => read_list(&self.log, pos)?.1,
            None => Vec::new(),
        };
        let fragment = self.fragment(index_key);

        // Same key already indexed? Prefix matches are ambiguous until the
        // primary's full key settles it.
        let mut same_key = None;
        for (i, record) in records.iter().enumerate() {
            if fragment.starts_with(&record.key)
                && primary.get_index_key(record.block)? == index_key
            {
                same_key = Some(i);
                break;
            }
        }
        if let Some(i) = same_key {
            let old = records[i].block;
            records[i].block = blk;
            self.append_list(bucket, &records)?;
            return Ok(Some(old));
        }

        // Genuine insert: trim the new fragment past its divergence from
        // every stored key, extending stored trims that are prefixes of it.
        let mut trim = 1usize;
        for record in records.iter_mut() {
            let cpl = common_prefix_len(&record.key, fragment);
            if cpl == record.key.len() {
                let full = primary.get_index_key(record.block)?;
                let other = &full[self.buckets.prefix_bytes()..];
                let div = common_prefix_len(other, fragment);
                let extended = usize::min(div + 1, other.len());
                if extended > 255 {
                    return Err(StoreError::TrimmedKeyTooLong { len: extended });
                }
                if extended > record.key.len() {
                    record.key = other[..extended].to_vec();
                }
                trim = trim.max(div + 1);
            } else {
                trim = trim.max(cpl + 1);
            }
        }
        let trim = trim.min(fragment.len());
        if trim > 255 {
            return Err(StoreError::TrimmedKeyTooLong { len: trim });
        }
        records.push(IndexRecord { key: fragment[..trim].to_vec(), block: blk });
        records.sort_by(|a, b| a.key.cmp(&b.key));
        self.append_list(bucket, &records)?;
        Ok(None)
    }

    /// Drop `index_key` from its bucket. Returns the block it pointed at.
    pub(crate) fn remove(
        &mut self,
        primary: &Primary,
        index_key: &[u8],
    ) -> Result<Option<Block>, StoreError> {
        self.validate_key(index_key)?;
        let bucket = self.buckets.bucket_for(index_key);
        let Some(pos) = self.buckets.get(bucket) else {
            return Ok(None);
        };
        let mut records = read_list(&self.log, pos)?.1;
        let fragment = self.fragment(index_key);

        let mut found = None;
        for (i, record) in records.iter().enumerate() {
            if fragment.starts_with(&record.key)
                && primary.get_index_key(record.block)? == index_key
            {
                found = Some(i);
                break;
            }
        }
        let Some(i) = found else {
            return Ok(None);
        };
        let removed = records.remove(i);
        // An empty list is still appended: rescans must see the bucket's
        // newest state, not its pre-removal one.
        self.append_list(bucket, &records)?;
        Ok(Some(removed.block))
    }

    /// Swing the record that points at `from` over to `to`. Used by GC
    /// after relocating a primary record; block identity is unambiguous,
    /// so no primary read is needed.
    pub(crate) fn remap_block(
        &mut self,
        index_key: &[u8],
        from: Block,
        to: Block,
    ) -> Result<(), StoreError> {
        self.validate_key(index_key)?;
        let bucket = self.buckets.bucket_for(index_key);
        let Some(pos) = self.buckets.get(bucket) else {
            warn!(
                target: "caridx::store",
                bucket,
                key = %hex::encode(index_key),
                "remap target bucket is empty"
            );
            return Ok(());
        };
        let mut records = read_list(&self.log, pos)?.1;
        let Some(record) = records.iter_mut().find(|r| r.block == from) else {
            warn!(
                target: "caridx::store",
                bucket,
                key = %hex::encode(index_key),
                "remap target record not indexed"
            );
            return Ok(());
        };
        record.block = to;
        self.append_list(bucket, &records)?;
        Ok(())
    }

    fn append_list(&mut self, bucket: u32, records: &[IndexRecord]) -> Result<Position, StoreError> {
        let bytes = encode_list(bucket, records);
        let pos = self.log.append(&bytes)?;
        self.buckets.set(bucket, pos);
        Ok(pos)
    }

    pub(crate) fn flush(&mut self) -> Result<u64, StoreError> {
        self.log.flush()
    }

    pub(crate) fn sync(&mut self) -> Result<(), StoreError> {
        self.log.sync()
    }

    /// Flush, fsync, and leave a bucket snapshot for the next open.
    pub(crate) fn close(&mut self) -> Result<(), StoreError> {
        self.sync()?;
        self.buckets
            .write_snapshot(&snapshot_path(self.log.base()), self.log.head())
    }
}

fn snapshot_path(base: &Path) -> PathBuf {
    let mut os = base.as_os_str().to_owned();
    os.push(".buckets");
    PathBuf::from(os)
}

fn verify_preamble(log: &AppendLog, bits: u8) -> Result<(), StoreError> {
    let mut preamble = [0u8; PREAMBLE_LEN as usize];
    log.read_exact_at(0, &mut preamble)?;
    if preamble != [PREAMBLE_VERSION, bits] {
        return Err(StoreError::CorruptRecordList {
            pos: 0,
            detail: "index preamble disagrees with the header sidecar",
        });
    }
    Ok(())
}

/// Read one record list at `pos`: `(bucket, records)`.
fn read_list(log: &AppendLog, pos: Position) -> Result<(u32, Vec<IndexRecord>), StoreError> {
    let mut header = [0u8; 8];
    log.read_exact_at(pos, &mut header)?;
    let payload_len = u32::from_le_bytes(header[..4].try_into().expect("4-byte slice"));
    let bucket = u32::from_le_bytes(header[4..].try_into().expect("4-byte slice"));
    if payload_len > MAX_LIST_PAYLOAD {
        return Err(StoreError::CorruptRecordList { pos, detail: "implausible payload length" });
    }
    let mut payload = vec![0u8; payload_len as usize];
    log.read_exact_at(pos + 8, &mut payload)?;
    Ok((bucket, decode_records(&payload, pos)?))
}

/// Rebuild the bucket table by walking every record list in log order;
/// later lists for a bucket win.
fn rescan(log: &AppendLog, bits: u8) -> Result<Buckets, StoreError> {
    let mut buckets = Buckets::new(bits);
    let layout = log.layout();
    let mut lists = 0u64;
    for num in log.files() {
        let disk_len = log.disk_len(num)?;
        let mut local = if num == 0 { PREAMBLE_LEN } else { 0 };
        while local + 8 <= disk_len {
            let pos = layout.absolute(num, local);
            let mut header = [0u8; 8];
            log.read_exact_at(pos, &mut header)?;
            let payload_len = u32::from_le_bytes(header[..4].try_into().expect("4-byte slice"));
            let bucket = u32::from_le_bytes(header[4..].try_into().expect("4-byte slice"));
            if u64::from(payload_len) + local + 8 > disk_len {
                return Err(StoreError::CorruptRecordList { pos, detail: "list overruns its file" });
            }
            if bucket as usize >= buckets.len() {
                return Err(StoreError::CorruptRecordList { pos, detail: "bucket out of range" });
            }
            buckets.set(bucket, pos);
            local += 8 + u64::from(payload_len);
            lists += 1;
        }
    }
    debug!(target: "caridx::store", lists, "index rescanned");
    Ok(buckets)
}

/// Rebuild the whole index under a different bucket width. Every live
/// record's full key is fetched from the primary, the old index files are
/// dropped, and fresh per-bucket lists are written with trims computed from
/// the full fragments.
fn translate(
    base: &Path,
    max_file_size: u64,
    cache: Arc<FileCache>,
    log: AppendLog,
    buckets: Buckets,
    new_bits: u8,
    primary: &Primary,
) -> Result<Index, StoreError> {
    // Collect (full key, block) for every live record.
    let mut entries: Vec<(Vec<u8>, Block)> = Vec::new();
    for (_, pos) in buckets.occupied() {
        for record in read_list(&log, pos)?.1 {
            let key = primary.get_index_key(record.block)?;
            entries.push((key, record.block));
        }
    }

    // Drop the old files; the sidecar is rewritten by the fresh open.
    let old_files = log.files();
    for num in &old_files {
        let path = log.file_path(*num);
        cache.remove(&path);
        fs::remove_file(&path).map_err(|e| StoreError::at(&path, e))?;
    }
    let info = super::log::InfoHeader::path_for(base);
    fs::remove_file(&info).map_err(|e| StoreError::at(&info, e))?;
    drop(log);

    let (mut log, _) = AppendLog::open(base, max_file_size, Some(new_bits), cache)?;
    log.append(&[PREAMBLE_VERSION, new_bits])?;
    let mut index = Index { log, buckets: Buckets::new(new_bits) };

    // Group by new bucket, then write each bucket's list once.
    let prefix_bytes = index.buckets.prefix_bytes();
    let mut by_bucket: BTreeMap<u32, Vec<(Vec<u8>, Block)>> = BTreeMap::new();
    for (key, block) in entries {
        if key.len() <= usize::max(3, prefix_bytes) {
            return Err(StoreError::KeyTooShort {
                len: key.len(),
                min: usize::max(3, prefix_bytes),
            });
        }
        let bucket = index.buckets.bucket_for(&key);
        by_bucket
            .entry(bucket)
            .or_default()
            .push((key[prefix_bytes..].to_vec(), block));
    }
    let bucket_count = by_bucket.len();

    for (bucket, mut fragments) in by_bucket {
        fragments.sort_by(|a, b| a.0.cmp(&b.0));
        let mut records = Vec::with_capacity(fragments.len());
        for i in 0..fragments.len() {
            let frag = &fragments[i].0;
            let left = if i > 0 { common_prefix_len(frag, &fragments[i - 1].0) } else { 0 };
            let right = if i + 1 < fragments.len() {
                common_prefix_len(frag, &fragments[i + 1].0)
            } else {
                0
            };
            let trim = usize::max(1, usize::max(left, right) + 1).min(frag.len());
            if trim > 255 {
                return Err(StoreError::TrimmedKeyTooLong { len: trim });
            }
            records.push(IndexRecord { key: frag[..trim].to_vec(), block: fragments[i].1 });
        }
        index.append_list(bucket, &records)?;
    }
    index.flush()?;
    debug!(
        target: "caridx::store",
        buckets = bucket_count,
        files_dropped = old_files.len(),
        "index translated"
    );
    Ok(index)
}
