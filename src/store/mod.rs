//! Generic key→block store: append-only primary files, a bucketed index,
//! a freelist, and background GC.
//!
//! ```no_run
//! use caridx::store::{RecordFormat, Store, StoreOptions};
//!
//! let mut opts = StoreOptions::default();
//! opts.buckets_bits = 16;
//! let store = Store::open(std::path::Path::new("/tmp/idx/sig2epoch"),
//!     RecordFormat::SigToEpoch, opts)?;
//! store.put(&[7u8; 64], &5u16.to_le_bytes())?;
//! assert_eq!(store.get(&[7u8; 64])?, Some(5u16.to_le_bytes().to_vec()));
//! store.close()?;
//! # Ok::<(), caridx::store::StoreError>(())
//! ```
//!
//! On-disk artifacts for a store at `<base>`:
//!
//! | File | Contents |
//! |------|----------|
//! | `<base>.data.<n>` | primary records `[u32 size\|deleted][payload]` |
//! | `<base>.data.info` | primary JSON header |
//! | `<base>.index.<n>` | record lists (see `recordlist`) |
//! | `<base>.index.info` | index JSON header (adds `BucketsBits`) |
//! | `<base>.index.buckets` | bucket snapshot, written on clean close |
//! | `<base>.index.free` | freelist of released primary regions |

mod buckets;
mod error;
mod filecache;
mod freelist;
mod gc;
mod index;
mod log;
mod primary;
mod recordlist;
mod types;

pub use error::StoreError;
pub use filecache::{FileCache, FileHandle};
pub use primary::RecordFormat;
pub use types::{Block, Position};

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, tick, Sender};
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::cancel::CancelToken;
use freelist::Freelist;
use gc::GcConfig;
use index::Index;
use primary::{FilePrimary, MemoryPrimary, Primary};
use types::SIZE_PREFIX;

#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Bucket table width; byte multiples 8..=32.
    pub buckets_bits: u8,
    /// Per-file byte cap for primary and index files. Immutable once the
    /// store exists.
    pub max_file_size: u64,
    /// How often the GC thread wakes. Zero disables background GC.
    pub gc_interval: Duration,
    /// Per-cycle GC time budget; an exhausted budget aborts the cycle and
    /// the next tick resumes.
    pub gc_time_budget: Duration,
    /// A sealed file at least this percent free gets its records
    /// relocated.
    pub low_use_percent: u8,
    /// Open-file cache capacity; 0 opens and closes per read.
    pub file_cache_size: usize,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            buckets_bits: 24,
            max_file_size: 1 << 30,
            gc_interval: Duration::from_secs(30 * 60),
            gc_time_budget: Duration::from_secs(5 * 60),
            low_use_percent: 85,
            file_cache_size: 256,
        }
    }
}

struct Inner {
    primary: Primary,
    index: Index,
    freelist: Freelist,
    closed: bool,
}

impl Inner {
    fn check_open(&self) -> Result<(), StoreError> {
        if self.closed {
            return Err(StoreError::Closed);
        }
        Ok(())
    }
}

struct GcThread {
    stop: Sender<()>,
    handle: thread::JoinHandle<()>,
}

/// The store facade. Writers serialize behind one write lock; readers
/// share. Safe to share across threads behind an `Arc`.
pub struct Store {
    inner: Arc<RwLock<Inner>>,
    cache: Arc<FileCache>,
    cancel: CancelToken,
    gc_cfg: GcConfig,
    gc: Option<GcThread>,
}

fn suffixed(base: &Path, suffix: &str) -> PathBuf {
    let mut os = base.as_os_str().to_owned();
    os.push(suffix);
    PathBuf::from(os)
}

impl Store {
    /// Open or create a file-backed store rooted at `base`.
    pub fn open(base: &Path, format: RecordFormat, opts: StoreOptions) -> Result<Self, StoreError> {
        let cache = Arc::new(FileCache::new(opts.file_cache_size));
        let primary = Primary::Files(FilePrimary::open(
            &suffixed(base, ".data"),
            format,
            opts.max_file_size,
            Arc::clone(&cache),
        )?);
        Self::finish_open(base, primary, opts, cache)
    }

    /// A store whose primary lives in memory; the index and freelist still
    /// go to disk. Meant for tests and ephemeral ingestion runs.
    pub fn open_in_memory(base: &Path, opts: StoreOptions) -> Result<Self, StoreError> {
        let cache = Arc::new(FileCache::new(opts.file_cache_size));
        let primary = Primary::Memory(MemoryPrimary::default());
        Self::finish_open(base, primary, opts, cache)
    }

    fn finish_open(
        base: &Path,
        primary: Primary,
        opts: StoreOptions,
        cache: Arc<FileCache>,
    ) -> Result<Self, StoreError> {
        if let Some(parent) = base.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| StoreError::at(parent, e))?;
            }
        }
        let index_base = suffixed(base, ".index");
        let index = Index::open(
            &index_base,
            opts.buckets_bits,
            opts.max_file_size,
            Arc::clone(&cache),
            &primary,
        )?;
        let freelist = Freelist::open(&suffixed(base, ".index.free"))?;
        debug_assert_eq!(index.bits(), opts.buckets_bits);

        let inner = Arc::new(RwLock::new(Inner { primary, index, freelist, closed: false }));
        let cancel = CancelToken::new();
        let gc_cfg = GcConfig {
            time_budget: opts.gc_time_budget,
            low_use_percent: opts.low_use_percent.min(100),
        };
        let gc = if opts.gc_interval > Duration::ZERO && supports_gc(&inner) {
            Some(spawn_gc(
                Arc::clone(&inner),
                gc_cfg.clone(),
                opts.gc_interval,
                cancel.clone(),
            )?)
        } else {
            None
        };
        Ok(Self { inner, cache, cancel, gc_cfg, gc })
    }

    /// Insert or update. Returns `false` when the exact `(key, value)` pair
    /// is already stored (nothing written); an update freelists the
    /// replaced block.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<bool, StoreError> {
        let mut inner = self.inner.write();
        inner.check_open()?;

        for blk in inner.index.candidates(key)? {
            let (stored_key, stored_value) = inner.primary.get(blk)?;
            if stored_key == key {
                if stored_value == value {
                    return Ok(false);
                }
                break;
            }
        }

        let blk = inner.primary.put(key, value)?;
        let Inner { primary, index, freelist, .. } = &mut *inner;
        let replaced = index.put(primary, key, blk)?;
        if let Some(old) = replaced {
            freelist.put(old)?;
            primary.tombstone_now(old);
        }
        Ok(true)
    }

    /// The value stored for `key`.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let inner = self.inner.read();
        inner.check_open()?;
        for blk in inner.index.candidates(key)? {
            let (stored_key, value) = inner.primary.get(blk)?;
            if stored_key == key {
                return Ok(Some(value));
            }
        }
        Ok(None)
    }

    pub fn has(&self, key: &[u8]) -> Result<bool, StoreError> {
        Ok(self.get(key)?.is_some())
    }

    /// Byte length of the stored value, if present.
    pub fn size(&self, key: &[u8]) -> Result<Option<u32>, StoreError> {
        Ok(self.get(key)?.map(|value| value.len() as u32))
    }

    /// Delete a key. Returns whether it was present; the freed block lands
    /// on the freelist for the next GC cycle.
    pub fn remove(&self, key: &[u8]) -> Result<bool, StoreError> {
        let mut inner = self.inner.write();
        inner.check_open()?;
        let Inner { primary, index, freelist, .. } = &mut *inner;
        match index.remove(primary, key)? {
            Some(blk) => {
                freelist.put(blk)?;
                primary.tombstone_now(blk);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Write all staged bytes to the OS. Safe to call from any number of
    /// threads at once; calls serialize and each succeeds.
    pub fn flush(&self) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        inner.check_open()?;
        inner.primary.flush()?;
        inner.index.flush()?;
        inner.freelist.flush()?;
        Ok(())
    }

    /// Flush and fsync everything.
    pub fn sync(&self) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        inner.check_open()?;
        inner.primary.sync()?;
        inner.index.sync()?;
        inner.freelist.sync()?;
        Ok(())
    }

    /// Freelist entries waiting for GC.
    pub fn freelist_len(&self) -> u64 {
        self.inner.read().freelist.len()
    }

    /// Run one GC cycle right now on the calling thread.
    pub fn gc_now(&self, cancel: &CancelToken) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        inner.check_open()?;
        let Inner { primary, index, freelist, .. } = &mut *inner;
        gc::run_cycle(primary, index, freelist, &self.gc_cfg, cancel)?;
        Ok(())
    }

    /// Iterate a snapshot of the primary taken now. Records appended later
    /// are not yielded; records GC relocates during iteration may appear
    /// under both positions.
    pub fn iter(&self) -> Result<StoreIter, StoreError> {
        let mut inner = self.inner.write();
        inner.check_open()?;
        inner.primary.flush()?;

        match &inner.primary {
            Primary::Memory(memory) => {
                // Small by construction; snapshot eagerly.
                let items = memory.snapshot();
                Ok(StoreIter { state: IterState::Memory(items.into_iter()) })
            }
            Primary::Files(files) => {
                let mut plan = Vec::new();
                for num in files.log().files() {
                    plan.push((num, files.log().disk_len(num)?));
                }
                Ok(StoreIter {
                    state: IterState::Files {
                        inner: Arc::clone(&self.inner),
                        plan,
                        at: 0,
                        local: 0,
                    },
                })
            }
        }
    }

    /// Stop GC, flush, fsync, and snapshot the bucket table. The store is
    /// unusable afterwards.
    pub fn close(mut self) -> Result<(), StoreError> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<(), StoreError> {
        self.cancel.cancel();
        if let Some(gc) = self.gc.take() {
            let _ = gc.stop.send(());
            if gc.handle.join().is_err() {
                warn!(target: "caridx::store", "gc thread panicked");
            }
        }
        let mut inner = self.inner.write();
        if inner.closed {
            return Ok(());
        }
        inner.primary.sync()?;
        inner.index.close()?;
        inner.freelist.sync()?;
        inner.closed = true;
        self.cache.clear();
        Ok(())
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            warn!(target: "caridx::store", %err, "store shutdown on drop failed");
        }
    }
}

fn supports_gc(inner: &Arc<RwLock<Inner>>) -> bool {
    inner.read().primary.as_files().is_some()
}

fn spawn_gc(
    inner: Arc<RwLock<Inner>>,
    cfg: GcConfig,
    interval: Duration,
    cancel: CancelToken,
) -> Result<GcThread, StoreError> {
    let (stop_tx, stop_rx) = bounded::<()>(1);
    let ticker = tick(interval);
    let handle = thread::Builder::new()
        .name("caridx-gc".into())
        .spawn(move || loop {
            crossbeam_channel::select! {
                recv(stop_rx) -> _ => break,
                recv(ticker) -> _ => {
                    if cancel.is_cancelled() {
                        break;
                    }
                    let mut inner = inner.write();
                    if inner.closed {
                        break;
                    }
                    let Inner { primary, index, freelist, .. } = &mut *inner;
                    match gc::run_cycle(primary, index, freelist, &cfg, &cancel) {
                        Ok(_) => {}
                        Err(StoreError::DeadlineExceeded) => {
                            debug!(target: "caridx::store", "gc budget exhausted; resuming next tick");
                        }
                        Err(StoreError::Cancelled) => break,
                        Err(err) => {
                            warn!(target: "caridx::store", %err, "gc cycle failed");
                        }
                    }
                }
            }
        })?;
    Ok(GcThread { stop: stop_tx, handle })
}

/// Snapshot iterator over `(key, value)` pairs. See [`Store::iter`].
pub struct StoreIter {
    state: IterState,
}

enum IterState {
    Memory(std::vec::IntoIter<(Vec<u8>, Vec<u8>)>),
    Files {
        inner: Arc<RwLock<Inner>>,
        plan: Vec<(u32, u64)>,
        at: usize,
        local: u64,
    },
}

impl Iterator for StoreIter {
    type Item = Result<(Vec<u8>, Vec<u8>), StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        match &mut self.state {
            IterState::Memory(items) => items.next().map(Ok),
            IterState::Files { inner, plan, at, local } => loop {
                let (num, disk_len) = *plan.get(*at)?;
                if *local + SIZE_PREFIX > disk_len {
                    *at += 1;
                    *local = 0;
                    continue;
                }
                let guard = inner.read();
                if guard.closed {
                    return Some(Err(StoreError::Closed));
                }
                let files = guard.primary.as_files().expect("files-backed iterator");
                let pos = files.log().layout().absolute(num, *local);

                let mut size_word = [0u8; 4];
                match files.log().read_exact_at(pos, &mut size_word) {
                    Ok(()) => {}
                    Err(StoreError::File { source, .. })
                        if matches!(
                            source.kind(),
                            std::io::ErrorKind::NotFound | std::io::ErrorKind::UnexpectedEof
                        ) =>
                    {
                        // GC deleted or truncated the file under us; its
                        // records moved to the log head.
                        *at += 1;
                        *local = 0;
                        continue;
                    }
                    Err(err) => return Some(Err(err)),
                }
                let stored = u32::from_le_bytes(size_word);
                let deleted = stored & types::DELETED_BIT != 0;
                let size = stored & !types::DELETED_BIT;
                *local += SIZE_PREFIX + u64::from(size);

                if deleted {
                    continue;
                }
                let mut payload = vec![0u8; size as usize];
                if let Err(err) = files.log().read_exact_at(pos + SIZE_PREFIX, &mut payload) {
                    return Some(Err(err));
                }
                let parsed = files.format().decode(&payload, pos);
                return Some(parsed.map(|(k, v)| (k.to_vec(), v.to_vec())));
            },
        }
    }
}
