//! Bounded multi-file append log with a staged in-memory tail.
//!
//! Both the primary store and the index are built on this: numbered files
//! `<base>.<n>` capped at `max_file_size`, a JSON `.info` sidecar carrying
//! the immutable layout parameters, and an in-memory staging buffer that
//! holds appended bytes until the next flush. Records never span files —
//! the log rotates early instead, so a position always resolves to one
//! contiguous on-disk region.
//!
//! Reads are position-addressed: staged bytes are served from memory,
//! flushed bytes through the shared [`FileCache`].

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use positioned_io::ReadAt;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::error::StoreError;
use super::filecache::FileCache;
use super::types::{FileLayout, Position, MAX_FILE_SIZE_CAP};
use crate::fsutil;

/// Current `.info` header version.
pub(crate) const HEADER_VERSION: u32 = 1;

/// JSON sidecar describing one log's immutable layout. `BucketsBits` is
/// carried by index logs only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct InfoHeader {
    #[serde(rename = "version")]
    pub version: u32,
    #[serde(rename = "MaxFileSize")]
    pub max_file_size: u64,
    #[serde(rename = "FirstFile")]
    pub first_file: u32,
    #[serde(rename = "BucketsBits", default, skip_serializing_if = "Option::is_none")]
    pub buckets_bits: Option<u8>,
}

impl InfoHeader {
    pub(crate) fn path_for(base: &Path) -> PathBuf {
        let mut os = base.as_os_str().to_owned();
        os.push(".info");
        PathBuf::from(os)
    }

    pub(crate) fn load(base: &Path) -> Result<Option<Self>, StoreError> {
        let path = Self::path_for(base);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(StoreError::at(&path, err)),
        };
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    /// Write atomically: `.tmp` sibling, fsync, rename.
    pub(crate) fn store(&self, base: &Path) -> Result<(), StoreError> {
        let path = Self::path_for(base);
        let tmp = fsutil::tmp_sibling(&path);
        let bytes = serde_json::to_vec(self)?;
        let mut file = File::create(&tmp).map_err(|e| StoreError::at(&tmp, e))?;
        file.write_all(&bytes).map_err(|e| StoreError::at(&tmp, e))?;
        file.sync_all().map_err(|e| StoreError::at(&tmp, e))?;
        fs::rename(&tmp, &path).map_err(|e| StoreError::at(&path, e))?;
        fsutil::sync_parent_dir(&path);
        Ok(())
    }
}

pub(crate) struct AppendLog {
    base: PathBuf,
    layout: FileLayout,
    first_file: u32,
    active_num: u32,
    active: File,
    /// Logical position the next append lands at.
    head: Position,
    /// Logical position of the first staged (unflushed) byte; always inside
    /// the active file.
    flushed: Position,
    staged: Vec<u8>,
    cache: Arc<FileCache>,
}

impl AppendLog {
    /// Open or create the log rooted at `base` (files `<base>.<n>`).
    /// Returns the log and the `BucketsBits` value stored in its sidecar,
    /// if any. When creating, `buckets_bits` seeds the sidecar.
    pub(crate) fn open(
        base: &Path,
        max_file_size: u64,
        buckets_bits: Option<u8>,
        cache: Arc<FileCache>,
    ) -> Result<(Self, Option<u8>), StoreError> {
        if max_file_size == 0 || max_file_size > MAX_FILE_SIZE_CAP {
            return Err(StoreError::InvalidMaxFileSize {
                size: max_file_size,
                max: MAX_FILE_SIZE_CAP,
            });
        }

        let header = match InfoHeader::load(base)? {
            Some(header) => {
                if header.version != HEADER_VERSION {
                    return Err(StoreError::UnsupportedVersion(header.version));
                }
                if header.max_file_size != max_file_size {
                    return Err(StoreError::HeaderMismatch {
                        field: "MaxFileSize",
                        stored: header.max_file_size,
                        requested: max_file_size,
                    });
                }
                header
            }
            None => {
                let header = InfoHeader {
                    version: HEADER_VERSION,
                    max_file_size,
                    first_file: 0,
                    buckets_bits,
                };
                header.store(base)?;
                header
            }
        };

        // The active file is the highest-numbered one on disk; deleted
        // middles (GC) leave gaps that are simply skipped.
        let layout = FileLayout::new(max_file_size);
        let active_num = Self::scan_highest(base)?.unwrap_or(header.first_file);

        let active_path = Self::file_path_of(base, active_num);
        let active = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&active_path)
            .map_err(|e| StoreError::at(&active_path, e))?;
        let disk_len = active.metadata().map_err(|e| StoreError::at(&active_path, e))?.len();
        let head = layout.absolute(active_num, disk_len);

        debug!(
            target: "caridx::store",
            base = %base.display(),
            active = active_num,
            head,
            "log opened"
        );
        let stored_bits = header.buckets_bits;
        Ok((
            Self {
                base: base.to_owned(),
                layout,
                first_file: header.first_file,
                active_num,
                active,
                head,
                flushed: head,
                staged: Vec::new(),
                cache,
            },
            stored_bits,
        ))
    }

    pub(crate) fn layout(&self) -> FileLayout {
        self.layout
    }

    pub(crate) fn head(&self) -> Position {
        self.head
    }

    pub(crate) fn active_num(&self) -> u32 {
        self.active_num
    }

    pub(crate) fn base(&self) -> &Path {
        &self.base
    }

    /// Highest `<base>.<n>` present on disk, if any.
    fn scan_highest(base: &Path) -> Result<Option<u32>, StoreError> {
        let dir = base.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
        let Some(name) = base.file_name() else {
            return Ok(None);
        };
        let prefix = format!("{}.", name.to_string_lossy());
        let mut highest = None;
        for entry in fs::read_dir(dir).map_err(|e| StoreError::at(dir, e))? {
            let entry = entry.map_err(|e| StoreError::at(dir, e))?;
            let name = entry.file_name();
            let Some(rest) = name.to_string_lossy().strip_prefix(&prefix).map(str::to_owned) else {
                continue;
            };
            if let Ok(num) = rest.parse::<u32>() {
                highest = Some(highest.map_or(num, |h: u32| h.max(num)));
            }
        }
        Ok(highest)
    }

    fn file_path_of(base: &Path, num: u32) -> PathBuf {
        let mut os = base.as_os_str().to_owned();
        os.push(format!(".{num}"));
        PathBuf::from(os)
    }

    pub(crate) fn file_path(&self, num: u32) -> PathBuf {
        Self::file_path_of(&self.base, num)
    }

    /// Existing file numbers, ascending. Gaps from deleted files are
    /// skipped.
    pub(crate) fn files(&self) -> Vec<u32> {
        (self.first_file..=self.active_num)
            .filter(|num| self.file_path(*num).exists())
            .collect()
    }

    /// On-disk bytes of one file. For the active file this excludes the
    /// staged tail.
    pub(crate) fn disk_len(&self, num: u32) -> Result<u64, StoreError> {
        if num == self.active_num {
            // A to-the-byte-full active file leaves `flushed` on the next
            // file's boundary.
            if self.layout.file_num(self.flushed) != num {
                return Ok(self.layout.max_file_size());
            }
            return Ok(self.layout.local(self.flushed));
        }
        let path = self.file_path(num);
        Ok(fs::metadata(&path).map_err(|e| StoreError::at(&path, e))?.len())
    }

    /// Append `bytes` as one record; returns the record's position.
    /// Rotates to a fresh file first if the record would cross the cap.
    pub(crate) fn append(&mut self, bytes: &[u8]) -> Result<Position, StoreError> {
        let len = bytes.len() as u64;
        if len > self.layout.max_file_size() {
            return Err(StoreError::RecordTooLarge {
                size: len,
                max: self.layout.max_file_size(),
            });
        }
        // Rotate when the record would cross the cap, and also when the
        // active file filled to the byte — `head` then already sits on the
        // next file's boundary.
        if self.layout.file_num(self.head) != self.active_num
            || self.layout.local(self.head) + len > self.layout.max_file_size()
        {
            self.rotate()?;
        }
        let pos = self.head;
        self.staged.extend_from_slice(bytes);
        self.head += len;
        Ok(pos)
    }

    fn rotate(&mut self) -> Result<(), StoreError> {
        self.flush()?;
        let old_path = self.file_path(self.active_num);
        self.active.sync_all().map_err(|e| StoreError::at(&old_path, e))?;

        self.active_num += 1;
        let path = self.file_path(self.active_num);
        self.active = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| StoreError::at(&path, e))?;
        self.head = self.layout.absolute(self.active_num, 0);
        self.flushed = self.head;
        debug!(target: "caridx::store", file = %path.display(), "log rotated");
        Ok(())
    }

    /// Read `buf.len()` bytes at `pos`. The region must lie within one
    /// record, which by construction never spans files or the staged
    /// boundary.
    pub(crate) fn read_exact_at(&self, pos: Position, buf: &mut [u8]) -> Result<(), StoreError> {
        let len = buf.len() as u64;
        if pos + len > self.head {
            return Err(StoreError::OutOfBounds { pos, len, head: self.head });
        }
        if pos >= self.flushed {
            let start = (pos - self.flushed) as usize;
            buf.copy_from_slice(&self.staged[start..start + buf.len()]);
            return Ok(());
        }
        if pos + len > self.flushed {
            return Err(StoreError::CorruptRecord { pos, detail: "record straddles the staged boundary" });
        }
        let num = self.layout.file_num(pos);
        let local = self.layout.local(pos);
        if local + len > self.layout.max_file_size() {
            return Err(StoreError::CorruptRecord { pos, detail: "record straddles a file boundary" });
        }
        let path = self.file_path(num);
        let handle = self.cache.open(&path)?;
        let result = handle
            .file()
            .read_exact_at(local, buf)
            .map_err(|e| StoreError::at(&path, e));
        self.cache.close(&handle)?;
        result
    }

    /// Write the staged tail to the active file; returns bytes written.
    pub(crate) fn flush(&mut self) -> Result<u64, StoreError> {
        if self.staged.is_empty() {
            return Ok(0);
        }
        let path = self.file_path(self.active_num);
        self.active
            .write_all(&self.staged)
            .map_err(|e| StoreError::at(&path, e))?;
        let written = self.staged.len() as u64;
        self.staged.clear();
        self.flushed = self.head;
        Ok(written)
    }

    /// Flush and fsync the active file.
    pub(crate) fn sync(&mut self) -> Result<(), StoreError> {
        self.flush()?;
        let path = self.file_path(self.active_num);
        self.active.sync_all().map_err(|e| StoreError::at(&path, e))?;
        Ok(())
    }

    /// Truncate a sealed file's free tail. Refuses the active file.
    pub(crate) fn truncate_file(&self, num: u32, new_len: u64) -> Result<(), StoreError> {
        debug_assert_ne!(num, self.active_num);
        let path = self.file_path(num);
        let file = OpenOptions::new()
            .write(true)
            .open(&path)
            .map_err(|e| StoreError::at(&path, e))?;
        file.set_len(new_len).map_err(|e| StoreError::at(&path, e))?;
        file.sync_all().map_err(|e| StoreError::at(&path, e))?;
        self.cache.remove(&path);
        Ok(())
    }

    /// Delete a sealed, fully-free file and advance `FirstFile` past any
    /// leading gap.
    pub(crate) fn remove_file(&mut self, num: u32) -> Result<(), StoreError> {
        debug_assert_ne!(num, self.active_num);
        let path = self.file_path(num);
        fs::remove_file(&path).map_err(|e| StoreError::at(&path, e))?;
        self.cache.remove(&path);

        if num == self.first_file {
            let mut first = self.first_file;
            while first < self.active_num && !self.file_path(first).exists() {
                first += 1;
            }
            self.first_file = first;
            self.write_header(None)?;
        }
        debug!(target: "caridx::store", file = %path.display(), "log file deleted");
        Ok(())
    }

    /// Rewrite the `.info` sidecar, preserving or replacing `BucketsBits`.
    pub(crate) fn write_header(&self, buckets_bits: Option<u8>) -> Result<(), StoreError> {
        let stored = InfoHeader::load(&self.base)?.and_then(|h| h.buckets_bits);
        InfoHeader {
            version: HEADER_VERSION,
            max_file_size: self.layout.max_file_size(),
            first_file: self.first_file,
            buckets_bits: buckets_bits.or(stored),
        }
        .store(&self.base)
    }
}
