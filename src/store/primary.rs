//! Primary storage: append-only record payloads addressed by [`Block`].
//!
//! A record on disk is `[u32 LE size_with_deleted_bit][payload]`; what the
//! payload looks like is the [`RecordFormat`]'s business. Backends are a
//! tagged enum — an in-memory vector for tests and the file-backed log for
//! everything else — configured once at open, no dynamic dispatch.

use std::fs::OpenOptions;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use byteorder::{LittleEndian, ReadBytesExt};
use positioned_io::{ReadAt, WriteAt};
use tracing::debug;

use super::error::StoreError;
use super::filecache::FileCache;
use super::log::AppendLog;
use super::types::{Block, DELETED_BIT, SIZE_PREFIX};

/// How `(key, value)` pairs serialize into a primary payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordFormat {
    /// 64-byte signature key, 2-byte little-endian epoch value.
    SigToEpoch,
    /// Length-prefixed CID key (≤ 255 bytes), fixed 16-byte locator value.
    CidToOffset,
    /// 32-byte account key, variable-length value.
    Gsfa,
}

impl RecordFormat {
    pub(crate) fn encode(&self, key: &[u8], value: &[u8]) -> Result<Vec<u8>, StoreError> {
        match self {
            RecordFormat::SigToEpoch => {
                if key.len() != 64 {
                    return Err(StoreError::KeyWrongWidth { len: key.len(), expected: 64 });
                }
                if value.len() != 2 {
                    return Err(StoreError::ValueWrongWidth { len: value.len(), expected: 2 });
                }
                let mut payload = Vec::with_capacity(66);
                payload.extend_from_slice(key);
                payload.extend_from_slice(value);
                Ok(payload)
            }
            RecordFormat::CidToOffset => {
                if key.len() > 255 {
                    return Err(StoreError::KeyTooLong { len: key.len() });
                }
                let mut payload = Vec::with_capacity(1 + key.len() + value.len());
                payload.push(key.len() as u8);
                payload.extend_from_slice(key);
                payload.extend_from_slice(value);
                Ok(payload)
            }
            RecordFormat::Gsfa => {
                if key.len() != 32 {
                    return Err(StoreError::KeyWrongWidth { len: key.len(), expected: 32 });
                }
                let mut payload = Vec::with_capacity(32 + value.len());
                payload.extend_from_slice(key);
                payload.extend_from_slice(value);
                Ok(payload)
            }
        }
    }

    /// Split a payload back into `(key, value)`.
    pub(crate) fn decode<'a>(
        &self,
        payload: &'a [u8],
        pos: u64,
    ) -> Result<(&'a [u8], &'a [u8]), StoreError> {
        match self {
            RecordFormat::SigToEpoch => {
                if payload.len() != 66 {
                    return Err(StoreError::CorruptRecord { pos, detail: "sig→epoch payload is not 66 bytes" });
                }
                Ok(payload.split_at(64))
            }
            RecordFormat::CidToOffset => {
                let Some((&key_len, rest)) = payload.split_first() else {
                    return Err(StoreError::CorruptRecord { pos, detail: "empty cid payload" });
                };
                if rest.len() < key_len as usize {
                    return Err(StoreError::CorruptRecord { pos, detail: "cid key overruns payload" });
                }
                Ok(rest.split_at(key_len as usize))
            }
            RecordFormat::Gsfa => {
                if payload.len() < 32 {
                    return Err(StoreError::CorruptRecord { pos, detail: "gsfa payload shorter than its key" });
                }
                Ok(payload.split_at(32))
            }
        }
    }
}

/// A record met while scanning one primary file.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ScannedRecord {
    pub local: u64,
    /// Payload bytes (deleted bit stripped).
    pub size: u32,
    pub deleted: bool,
}

/// One record relocated by GC.
pub(crate) struct Relocation {
    pub key: Vec<u8>,
    pub from: Block,
    pub to: Block,
}

pub(crate) struct FilePrimary {
    log: AppendLog,
    format: RecordFormat,
}

impl FilePrimary {
    pub(crate) fn open(
        base: &Path,
        format: RecordFormat,
        max_file_size: u64,
        cache: Arc<FileCache>,
    ) -> Result<Self, StoreError> {
        let (log, _) = AppendLog::open(base, max_file_size, None, cache)?;
        Ok(Self { log, format })
    }

    pub(crate) fn log(&self) -> &AppendLog {
        &self.log
    }

    pub(crate) fn format(&self) -> RecordFormat {
        self.format
    }

    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<Block, StoreError> {
        let payload = self.format.encode(key, value)?;
        let size = payload.len() as u64;
        if size >= u64::from(DELETED_BIT) {
            return Err(StoreError::RecordTooLarge { size, max: u64::from(DELETED_BIT) - 1 });
        }
        let mut envelope = Vec::with_capacity(4 + payload.len());
        envelope.extend_from_slice(&(size as u32).to_le_bytes());
        envelope.extend_from_slice(&payload);
        let pos = self.log.append(&envelope)?;
        Ok(Block::new(pos, size as u32))
    }

    fn get(&self, blk: Block) -> Result<(Vec<u8>, Vec<u8>), StoreError> {
        let mut size_word = [0u8; 4];
        self.log.read_exact_at(blk.offset, &mut size_word)?;
        let stored = u32::from_le_bytes(size_word);
        if stored & DELETED_BIT != 0 {
            return Err(StoreError::CorruptRecord {
                pos: blk.offset,
                detail: "record is tombstoned but still referenced",
            });
        }
        if stored != blk.size {
            return Err(StoreError::CorruptRecord {
                pos: blk.offset,
                detail: "stored size disagrees with the index",
            });
        }
        let mut payload = vec![0u8; blk.size as usize];
        self.log.read_exact_at(blk.offset + SIZE_PREFIX, &mut payload)?;
        let (key, value) = self.format.decode(&payload, blk.offset)?;
        Ok((key.to_vec(), value.to_vec()))
    }

    /// Set the deleted bit on a batch of records in one file, then fsync
    /// it. A missing file (already GC-deleted) is not an error.
    pub(crate) fn tombstone_batch(&self, num: u32, blocks: &[Block]) -> Result<(), StoreError> {
        let path = self.log.file_path(num);
        let file = match OpenOptions::new().read(true).write(true).open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(target: "caridx::store", file = %path.display(), "tombstone target already deleted");
                return Ok(());
            }
            Err(err) => return Err(StoreError::at(&path, err)),
        };
        let layout = self.log.layout();
        let len = file.metadata().map_err(|e| StoreError::at(&path, e))?.len();
        let mut file = file;
        for blk in blocks {
            let local = layout.local(blk.offset);
            if local + SIZE_PREFIX > len {
                // Already truncated away.
                continue;
            }
            let mut size_word = [0u8; 4];
            file.read_exact_at(local, &mut size_word)
                .map_err(|e| StoreError::at(&path, e))?;
            let stored = u32::from_le_bytes(size_word);
            file.write_all_at(local, &(stored | DELETED_BIT).to_le_bytes())
                .map_err(|e| StoreError::at(&path, e))?;
        }
        file.sync_all().map_err(|e| StoreError::at(&path, e))?;
        Ok(())
    }

    /// Walk one sealed file's records in disk order.
    pub(crate) fn scan_file(&self, num: u32) -> Result<Vec<ScannedRecord>, StoreError> {
        let path = self.log.file_path(num);
        let disk_len = self.log.disk_len(num)?;
        let file = std::fs::File::open(&path).map_err(|e| StoreError::at(&path, e))?;
        let mut r = BufReader::new(file);
        let mut records = Vec::new();
        let mut local = 0u64;
        while local + SIZE_PREFIX <= disk_len {
            let stored = r.read_u32::<LittleEndian>().map_err(|e| StoreError::at(&path, e))?;
            let deleted = stored & DELETED_BIT != 0;
            let size = stored & !DELETED_BIT;
            if local + SIZE_PREFIX + u64::from(size) > disk_len {
                return Err(StoreError::CorruptRecord {
                    pos: self.log.layout().absolute(num, local),
                    detail: "record overruns its file",
                });
            }
            records.push(ScannedRecord { local, size, deleted });
            local += SIZE_PREFIX + u64::from(size);
            r.seek_relative(i64::from(size)).map_err(|e| StoreError::at(&path, e))?;
        }
        Ok(records)
    }

    /// Re-append every live record of one sealed file to the log head.
    /// Returns the moves; the caller updates the index and freelists the
    /// originals.
    pub(crate) fn relocate_live(&mut self, num: u32) -> Result<Vec<Relocation>, StoreError> {
        let layout = self.log.layout();
        let mut moves = Vec::new();
        for rec in self.scan_file(num)? {
            if rec.deleted {
                continue;
            }
            let from = Block::new(layout.absolute(num, rec.local), rec.size);
            let (key, value) = self.get(from)?;
            let to = self.put(&key, &value)?;
            moves.push(Relocation { key, from, to });
        }
        Ok(moves)
    }
}

#[derive(Default)]
pub(crate) struct MemoryPrimary {
    records: Vec<(Vec<u8>, Vec<u8>)>,
    deleted: Vec<bool>,
}

impl MemoryPrimary {
    fn put(&mut self, key: &[u8], value: &[u8]) -> Block {
        self.records.push((key.to_vec(), value.to_vec()));
        self.deleted.push(false);
        Block::new(
            (self.records.len() - 1) as u64,
            (key.len() + value.len()) as u32,
        )
    }

    /// Live records, in insertion order.
    pub(crate) fn snapshot(&self) -> Vec<(Vec<u8>, Vec<u8>)> {
        self.records
            .iter()
            .zip(&self.deleted)
            .filter(|(_, deleted)| !**deleted)
            .map(|((key, value), _)| (key.clone(), value.clone()))
            .collect()
    }

    fn get(&self, blk: Block) -> Result<(Vec<u8>, Vec<u8>), StoreError> {
        let at = blk.offset as usize;
        let Some((key, value)) = self.records.get(at) else {
            return Err(StoreError::OutOfBounds {
                pos: blk.offset,
                len: 1,
                head: self.records.len() as u64,
            });
        };
        if self.deleted[at] {
            return Err(StoreError::CorruptRecord {
                pos: blk.offset,
                detail: "record is tombstoned but still referenced",
            });
        }
        Ok((key.clone(), value.clone()))
    }
}

/// Tagged primary backend.
pub(crate) enum Primary {
    Memory(MemoryPrimary),
    Files(FilePrimary),
}

impl Primary {
    pub(crate) fn put(&mut self, key: &[u8], value: &[u8]) -> Result<Block, StoreError> {
        match self {
            Primary::Memory(memory) => Ok(memory.put(key, value)),
            Primary::Files(files) => files.put(key, value),
        }
    }

    pub(crate) fn get(&self, blk: Block) -> Result<(Vec<u8>, Vec<u8>), StoreError> {
        match self {
            Primary::Memory(memory) => memory.get(blk),
            Primary::Files(files) => files.get(blk),
        }
    }

    /// The index key of the record at `blk` (identity of the stored key).
    pub(crate) fn get_index_key(&self, blk: Block) -> Result<Vec<u8>, StoreError> {
        Ok(self.get(blk)?.0)
    }

    /// Immediate tombstone, used when no GC runs for this backend.
    pub(crate) fn tombstone_now(&mut self, blk: Block) {
        if let Primary::Memory(memory) = self {
            if let Some(slot) = memory.deleted.get_mut(blk.offset as usize) {
                *slot = true;
            }
        }
    }

    pub(crate) fn flush(&mut self) -> Result<u64, StoreError> {
        match self {
            Primary::Memory(_) => Ok(0),
            Primary::Files(files) => files.log.flush(),
        }
    }

    pub(crate) fn sync(&mut self) -> Result<(), StoreError> {
        match self {
            Primary::Memory(_) => Ok(()),
            Primary::Files(files) => files.log.sync(),
        }
    }

    pub(crate) fn as_files(&self) -> Option<&FilePrimary> {
        match self {
            Primary::Files(files) => Some(files),
            Primary::Memory(_) => None,
        }
    }

    pub(crate) fn as_files_mut(&mut self) -> Option<&mut FilePrimary> {
        match self {
            Primary::Files(files) => Some(files),
            Primary::Memory(_) => None,
        }
    }
}

impl FilePrimary {
    pub(crate) fn log_mut(&mut self) -> &mut AppendLog {
        &mut self.log
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_roundtrip() {
        let sig = [7u8; 64];
        let payload = RecordFormat::SigToEpoch.encode(&sig, &5u16.to_le_bytes()).unwrap();
        let (k, v) = RecordFormat::SigToEpoch.decode(&payload, 0).unwrap();
        assert_eq!(k, sig);
        assert_eq!(v, 5u16.to_le_bytes());

        let cid = b"\x01\x71\x12 abcdefgh";
        let payload = RecordFormat::CidToOffset.encode(cid, b"valuebytes").unwrap();
        let (k, v) = RecordFormat::CidToOffset.decode(&payload, 0).unwrap();
        assert_eq!(k, cid.as_slice());
        assert_eq!(v, b"valuebytes");

        let account = [3u8; 32];
        let payload = RecordFormat::Gsfa.encode(&account, b"").unwrap();
        let (k, v) = RecordFormat::Gsfa.decode(&payload, 0).unwrap();
        assert_eq!(k, account);
        assert!(v.is_empty());
    }

    #[test]
    fn formats_reject_wrong_widths() {
        assert!(matches!(
            RecordFormat::SigToEpoch.encode(&[0u8; 63], &[0, 0]),
            Err(StoreError::KeyWrongWidth { len: 63, expected: 64 })
        ));
        assert!(matches!(
            RecordFormat::SigToEpoch.encode(&[0u8; 64], &[0]),
            Err(StoreError::ValueWrongWidth { len: 1, expected: 2 })
        ));
        assert!(matches!(
            RecordFormat::CidToOffset.encode(&[0u8; 256], b""),
            Err(StoreError::KeyTooLong { len: 256 })
        ));
        assert!(matches!(
            RecordFormat::Gsfa.encode(&[0u8; 31], b""),
            Err(StoreError::KeyWrongWidth { len: 31, expected: 32 })
        ));
    }

    #[test]
    fn file_primary_put_get_tombstone() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(FileCache::new(16));
        let base = dir.path().join("t.data");
        let mut primary =
            FilePrimary::open(&base, RecordFormat::Gsfa, 1 << 20, cache).unwrap();

        let key = [9u8; 32];
        let blk = primary.put(&key, b"hello").unwrap();
        assert_eq!(blk.size, 37);

        // Readable while staged and after flush.
        let (k, v) = primary.get(blk).unwrap();
        assert_eq!(k, key);
        assert_eq!(v, b"hello");
        primary.log.flush().unwrap();
        let (_, v) = primary.get(blk).unwrap();
        assert_eq!(v, b"hello");

        primary.tombstone_batch(0, &[blk]).unwrap();
        assert!(matches!(
            primary.get(blk),
            Err(StoreError::CorruptRecord { .. })
        ));
        let scans = primary.scan_file(0).unwrap();
        assert_eq!(scans.len(), 1);
        assert!(scans[0].deleted);
        assert_eq!(scans[0].size, 37);
    }
}
