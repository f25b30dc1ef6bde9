//! Phase 1 (append) and phase 2 (sort/reduce) of the preindex build.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use byteorder::{LittleEndian, WriteBytesExt};
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::{
    dat_path, shard_for_key, tmp_path, PreIndexError, DAT_RECORD_LEN, KEY_LEN, TMP_RECORD_LEN,
};
use crate::cancel::CancelToken;
use crate::fsutil;

#[derive(Debug, Clone)]
pub struct PreIndexOptions {
    /// Number of shard files keys hash across. Also bounds phase-2 peak RAM:
    /// one shard is sorted in memory at a time.
    pub num_shards: u64,
    /// A shard's appender is explicitly flushed once this many bytes
    /// accumulate behind it.
    pub shard_flush_bytes: u64,
    /// Process-wide soft cap on unflushed bytes; crossing it flushes the
    /// shard being written and is visible via
    /// [`PreIndexWriter::over_soft_cap`] so ingestion can throttle.
    pub soft_buffer_cap: u64,
}

impl Default for PreIndexOptions {
    fn default() -> Self {
        Self {
            num_shards: 256,
            shard_flush_bytes: 64 << 20,
            soft_buffer_cap: 512 << 20,
        }
    }
}

struct Shard {
    path: PathBuf,
    w: BufWriter<File>,
    /// Bytes written since the last explicit flush.
    unflushed: u64,
}

/// Accumulates `(key, value, insertion-index)` tuples across shard files.
///
/// `push` is safe from many threads: the shard map is locked only while a
/// shard is first created, and each shard serializes its own writes.
pub struct PreIndexWriter {
    dir: PathBuf,
    opts: PreIndexOptions,
    closed: AtomicBool,
    next_index: AtomicU64,
    unflushed_total: AtomicU64,
    shards: Mutex<HashMap<u64, Arc<Mutex<Shard>>>>,
}

impl PreIndexWriter {
    /// Create a writer over `dir`, creating the directory if needed.
    pub fn new(dir: &Path, opts: PreIndexOptions) -> Result<Self, PreIndexError> {
        fs::create_dir_all(dir).map_err(|e| PreIndexError::at(dir, e))?;
        Ok(Self {
            dir: dir.to_owned(),
            opts,
            closed: AtomicBool::new(false),
            next_index: AtomicU64::new(0),
            unflushed_total: AtomicU64::new(0),
            shards: Mutex::new(HashMap::new()),
        })
    }

    /// Append one tuple; returns the insertion index it was tagged with.
    pub fn push(&self, key: &[u8; KEY_LEN], value: u32) -> Result<u64, PreIndexError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PreIndexError::WriterClosed);
        }
        let index = self.next_index.fetch_add(1, Ordering::SeqCst);
        let shard_id = shard_for_key(key, self.opts.num_shards);
        let shard = self.shard(shard_id)?;

        let mut record = [0u8; TMP_RECORD_LEN];
        record[..KEY_LEN].copy_from_slice(key);
        record[KEY_LEN..KEY_LEN + 4].copy_from_slice(&value.to_le_bytes());
        record[KEY_LEN + 4..].copy_from_slice(&index.to_le_bytes());

        let mut guard = shard.lock();
        // Re-check under the shard lock: `build` marks the writer closed
        // before it flushes the shards, so a push that loses this race never
        // lands bytes behind a shard that was already processed.
        if self.closed.load(Ordering::Acquire) {
            return Err(PreIndexError::WriterClosed);
        }
        guard
            .w
            .write_all(&record)
            .map_err(|e| PreIndexError::at(&guard.path, e))?;
        guard.unflushed += TMP_RECORD_LEN as u64;
        let total = self
            .unflushed_total
            .fetch_add(TMP_RECORD_LEN as u64, Ordering::Relaxed)
            + TMP_RECORD_LEN as u64;

        if guard.unflushed >= self.opts.shard_flush_bytes || total >= self.opts.soft_buffer_cap {
            let drained = guard.unflushed;
            guard.w.flush().map_err(|e| PreIndexError::at(&guard.path, e))?;
            guard.unflushed = 0;
            self.unflushed_total.fetch_sub(drained, Ordering::Relaxed);
        }
        Ok(index)
    }

    /// Tuples pushed so far.
    pub fn len(&self) -> u64 {
        self.next_index.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes sitting behind shard appenders, process-wide.
    pub fn buffered_bytes(&self) -> u64 {
        self.unflushed_total.load(Ordering::Relaxed)
    }

    /// Whether ingestion should back off before pushing more.
    pub fn over_soft_cap(&self) -> bool {
        self.buffered_bytes() >= self.opts.soft_buffer_cap
    }

    fn shard(&self, id: u64) -> Result<Arc<Mutex<Shard>>, PreIndexError> {
        let mut shards = self.shards.lock();
        if let Some(shard) = shards.get(&id) {
            return Ok(Arc::clone(shard));
        }
        let path = tmp_path(&self.dir, id);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| PreIndexError::at(&path, e))?;
        let shard = Arc::new(Mutex::new(Shard {
            path,
            w: BufWriter::with_capacity(1 << 20, file),
            unflushed: 0,
        }));
        shards.insert(id, Arc::clone(&shard));
        Ok(shard)
    }

    /// Close the writer and turn every `.tmp` shard into a sorted, reduced
    /// `.dat` shard. Cancellation is honored between shards.
    ///
    /// Shards are processed one at a time: a whole shard is sorted in
    /// memory, so the worker cap and `num_shards` together bound peak RSS.
    pub fn build(&self, cancel: &CancelToken) -> Result<(), PreIndexError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(PreIndexError::WriterClosed);
        }

        // Flush, fsync, and drop every open appender.
        let mut shards: Vec<(u64, Arc<Mutex<Shard>>)> = self.shards.lock().drain().collect();
        shards.sort_by_key(|(id, _)| *id);
        let mut ids = Vec::with_capacity(shards.len());
        for (id, shard) in shards {
            let mut guard = shard.lock();
            guard.w.flush().map_err(|e| PreIndexError::at(&guard.path, e))?;
            fsync_best_effort(guard.w.get_ref(), &guard.path)?;
            ids.push(id);
        }
        self.unflushed_total.store(0, Ordering::Relaxed);

        for id in ids {
            if cancel.is_cancelled() {
                return Err(PreIndexError::Cancelled);
            }
            process_shard(&self.dir, id)?;
        }
        Ok(())
    }
}

/// Sort one shard's temp records, reduce to last-writer-wins, and publish
/// the `.dat` atomically.
fn process_shard(dir: &Path, shard: u64) -> Result<(), PreIndexError> {
    let tmp = tmp_path(dir, shard);
    let bytes = fs::read(&tmp).map_err(|e| PreIndexError::at(&tmp, e))?;
    if bytes.len() % TMP_RECORD_LEN != 0 {
        return Err(PreIndexError::CorruptShard {
            path: tmp,
            len: bytes.len() as u64,
            stride: TMP_RECORD_LEN as u64,
        });
    }

    let mut records: Vec<([u8; KEY_LEN], u32, u64)> = bytes
        .chunks_exact(TMP_RECORD_LEN)
        .map(|rec| {
            let key: [u8; KEY_LEN] = rec[..KEY_LEN].try_into().expect("record stride");
            let value = u32::from_le_bytes(rec[KEY_LEN..KEY_LEN + 4].try_into().expect("stride"));
            let index = u64::from_le_bytes(rec[KEY_LEN + 4..].try_into().expect("stride"));
            (key, value, index)
        })
        .collect();
    drop(bytes);
    records.sort_unstable_by(|a, b| a.0.cmp(&b.0).then(a.2.cmp(&b.2)));

    let dat = dat_path(dir, shard);
    let dat_tmp = {
        let mut os = dat.as_os_str().to_owned();
        os.push(".tmp");
        PathBuf::from(os)
    };
    let file = File::create(&dat_tmp).map_err(|e| PreIndexError::at(&dat_tmp, e))?;
    let mut w = BufWriter::new(file);

    let mut kept = 0u64;
    for (i, (key, value, _)) in records.iter().enumerate() {
        // Records for one key are ascending by insertion index; the last of
        // a run is the winner.
        if records.get(i + 1).is_some_and(|next| next.0 == *key) {
            continue;
        }
        w.write_all(key).map_err(|e| PreIndexError::at(&dat_tmp, e))?;
        w.write_u32::<LittleEndian>(*value)
            .map_err(|e| PreIndexError::at(&dat_tmp, e))?;
        kept += 1;
    }
    w.flush().map_err(|e| PreIndexError::at(&dat_tmp, e))?;
    let file = w.into_inner().map_err(|e| PreIndexError::at(&dat_tmp, e.into()))?;
    fsync_best_effort(&file, &dat_tmp)?;
    drop(file);

    fs::rename(&dat_tmp, &dat).map_err(|e| PreIndexError::at(&dat, e))?;
    fsutil::sync_parent_dir(&dat);
    fs::remove_file(&tmp).map_err(|e| PreIndexError::at(&tmp, e))?;

    debug!(
        target: "caridx::preindex",
        shard,
        records = records.len(),
        kept,
        bytes = kept * DAT_RECORD_LEN as u64,
        "shard built"
    );
    Ok(())
}

/// fsync that tolerates filesystems rejecting the call outright
/// (`EINVAL`, `ENOTSUP`, `EOPNOTSUPP`); every other failure propagates.
fn fsync_best_effort(file: &File, path: &Path) -> Result<(), PreIndexError> {
    use std::io::ErrorKind;
    match file.sync_all() {
        Ok(()) => Ok(()),
        Err(err) if matches!(err.kind(), ErrorKind::Unsupported | ErrorKind::InvalidInput) => {
            warn!(target: "caridx::preindex", path = %path.display(), %err, "fsync not supported");
            Ok(())
        }
        Err(err) => Err(PreIndexError::at(path, err)),
    }
}
