//! Reference-counted LRU of open read-only file handles.
//!
//! Shared by every component that does positioned reads. Eviction is
//! strictly reference-counted: an entry pushed out of the LRU while handles
//! are still outstanding is parked in a removed set and the `File` closes
//! only when the last handle is returned via [`FileCache::close`].
//!
//! Capacity 0 bypasses caching entirely: every `open` opens, every `close`
//! closes. A single mutex guards the whole structure; every critical
//! section is O(1) except [`FileCache::clear`].

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;

use super::error::StoreError;

/// A checked-out file. Reads go straight through [`Self::file`]; the handle
/// must be returned with [`FileCache::close`].
#[derive(Debug)]
pub struct FileHandle {
    id: u64,
    path: PathBuf,
    file: Arc<File>,
}

impl FileHandle {
    pub fn file(&self) -> &File {
        &self.file
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

struct Entry {
    file: Arc<File>,
    /// Ids of handles checked out against this entry.
    handles: HashSet<u64>,
}

struct Inner {
    capacity: usize,
    next_id: u64,
    cached: LruCache<PathBuf, Entry>,
    /// Handle ids whose entry was evicted (or never cached, at capacity 0);
    /// the mapped `Arc` keeps the file open until the handle comes back.
    removed: HashMap<u64, Arc<File>>,
}

pub struct FileCache {
    inner: Mutex<Inner>,
}

impl FileCache {
    pub fn new(capacity: usize) -> Self {
        let lru_cap = NonZeroUsize::new(capacity.max(1)).expect("max(1) is nonzero");
        Self {
            inner: Mutex::new(Inner {
                capacity,
                next_id: 0,
                cached: LruCache::new(lru_cap),
                removed: HashMap::new(),
            }),
        }
    }

    /// Open `path` read-only, reusing a cached handle when present.
    pub fn open(&self, path: &Path) -> Result<FileHandle, StoreError> {
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;

        if inner.capacity == 0 {
            let file = Arc::new(File::open(path).map_err(|e| StoreError::at(path, e))?);
            inner.removed.insert(id, Arc::clone(&file));
            return Ok(FileHandle { id, path: path.to_owned(), file });
        }

        if let Some(entry) = inner.cached.get_mut(path) {
            entry.handles.insert(id);
            let file = Arc::clone(&entry.file);
            return Ok(FileHandle { id, path: path.to_owned(), file });
        }

        let file = Arc::new(File::open(path).map_err(|e| StoreError::at(path, e))?);
        let mut handles = HashSet::new();
        handles.insert(id);
        let evicted = inner
            .cached
            .push(path.to_owned(), Entry { file: Arc::clone(&file), handles });
        if let Some((_, old)) = evicted {
            inner.park(old);
        }
        Ok(FileHandle { id, path: path.to_owned(), file })
    }

    /// Return a handle. The second return of the same handle is an
    /// [`StoreError::AlreadyClosed`] error.
    pub fn close(&self, handle: &FileHandle) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.cached.peek_mut(&handle.path) {
            if entry.handles.remove(&handle.id) {
                return Ok(());
            }
        }
        if inner.removed.remove(&handle.id).is_some() {
            return Ok(());
        }
        Err(StoreError::AlreadyClosed)
    }

    /// Forget a path (the file is being deleted). Outstanding handles keep
    /// their `File` open until closed.
    pub fn remove(&self, path: &Path) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.cached.pop(path) {
            inner.park(entry);
        }
    }

    /// Drop every cached entry, parking the ones with outstanding handles.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        while let Some((_, entry)) = inner.cached.pop_lru() {
            inner.park(entry);
        }
    }

    /// Entries currently cached (excluding parked ones).
    pub fn len(&self) -> usize {
        self.inner.lock().cached.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Inner {
    fn park(&mut self, entry: Entry) {
        for id in entry.handles {
            self.removed.insert(id, Arc::clone(&entry.file));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn touch(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, name).unwrap();
        path
    }

    /// Spec scenario: capacity 2, A pinned twice, C evicts B, B double-close.
    #[test]
    fn eviction_is_reference_counted() {
        let dir = tempfile::tempdir().unwrap();
        let (a, b, c) = (touch(dir.path(), "a"), touch(dir.path(), "b"), touch(dir.path(), "c"));
        let cache = FileCache::new(2);

        let ha1 = cache.open(&a).unwrap();
        let hb = cache.open(&b).unwrap();
        let ha2 = cache.open(&a).unwrap();
        assert_eq!(cache.len(), 2);

        // B is least recent; C's arrival parks it with its one handle.
        let hc = cache.open(&c).unwrap();
        assert_eq!(cache.len(), 2);

        cache.close(&hb).unwrap();
        assert!(matches!(cache.close(&hb), Err(StoreError::AlreadyClosed)));

        cache.close(&ha1).unwrap();
        cache.close(&ha2).unwrap();
        cache.close(&hc).unwrap();
        assert!(matches!(cache.close(&hc), Err(StoreError::AlreadyClosed)));
    }

    #[test]
    fn zero_capacity_bypasses() {
        let dir = tempfile::tempdir().unwrap();
        let a = touch(dir.path(), "a");
        let cache = FileCache::new(0);

        let h1 = cache.open(&a).unwrap();
        let h2 = cache.open(&a).unwrap();
        assert_eq!(cache.len(), 0);
        cache.close(&h1).unwrap();
        cache.close(&h2).unwrap();
        assert!(matches!(cache.close(&h2), Err(StoreError::AlreadyClosed)));
    }

    #[test]
    fn reads_through_cached_handle() {
        use positioned_io::ReadAt;
        let dir = tempfile::tempdir().unwrap();
        let a = touch(dir.path(), "abcdef");
        let cache = FileCache::new(4);
        let h = cache.open(&a).unwrap();
        let mut buf = [0u8; 3];
        h.file().read_exact_at(1, &mut buf).unwrap();
        assert_eq!(&buf, b"bcd");
        cache.close(&h).unwrap();
    }

    #[test]
    fn remove_parks_outstanding_handles() {
        let dir = tempfile::tempdir().unwrap();
        let a = touch(dir.path(), "a");
        let cache = FileCache::new(2);
        let h = cache.open(&a).unwrap();
        cache.remove(&a);
        assert_eq!(cache.len(), 0);
        cache.close(&h).unwrap();
        assert!(matches!(cache.close(&h), Err(StoreError::AlreadyClosed)));
    }

    #[test]
    fn clear_empties_the_cache() {
        let dir = tempfile::tempdir().unwrap();
        let a = touch(dir.path(), "a");
        let b = touch(dir.path(), "b");
        let cache = FileCache::new(4);
        let h = cache.open(&a).unwrap();
        cache.close(&h).unwrap();
        let h = cache.open(&b).unwrap();
        cache.clear();
        assert!(cache.is_empty());
        cache.close(&h).unwrap();
    }
}
