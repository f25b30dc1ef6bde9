//! Epoch-list sidecar — the set of epochs an index has seen.
//!
//! # On-disk layout
//!
//! ```text
//! Offset  Size  Field
//!    0      8   magic = "epochlst"
//!    8      8   version = 1        (LE u64)
//!   16    N×2   epochs             (LE u16 each, append order)
//! ```
//!
//! The body is append-only: `has_or_put` writes an epoch only the first
//! time it is seen. Duplicates on disk are tolerated on open (crash between
//! the in-memory insert and the append is harmless either way).

use std::collections::BTreeSet;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, WriteBytesExt};
use thiserror::Error;

/// 8-byte magic tag.
pub const MAGIC: [u8; 8] = *b"epochlst";

/// Current format version.
pub const VERSION: u64 = 1;

#[derive(Error, Debug)]
pub enum EpochListError {
    #[error("invalid magic — not an epoch list")]
    InvalidMagic,
    #[error("unsupported epoch-list version {0} (this build reads v{VERSION})")]
    UnsupportedVersion(u64),
    #[error("epoch list body holds {0} bytes, not a multiple of 2")]
    CorruptBody(u64),
    #[error("{path}: {source}")]
    File { path: PathBuf, source: io::Error },
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Observed-epoch set backed by an append-only sidecar file.
pub struct EpochList {
    file: File,
    epochs: BTreeSet<u16>,
}

impl EpochList {
    /// Open or create the sidecar, validating magic and version when the
    /// file already exists.
    pub fn open(path: &Path) -> Result<Self, EpochListError> {
        let at = |e: io::Error| EpochListError::File { path: path.to_owned(), source: e };
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)
            .map_err(at)?;

        let len = file.metadata().map_err(at)?.len();
        let mut epochs = BTreeSet::new();
        if len == 0 {
            file.write_all(&MAGIC).map_err(at)?;
            file.write_u64::<LittleEndian>(VERSION).map_err(at)?;
        } else {
            let mut header = [0u8; 16];
            file.read_exact(&mut header).map_err(at)?;
            if header[..8] != MAGIC {
                return Err(EpochListError::InvalidMagic);
            }
            let version = u64::from_le_bytes(header[8..16].try_into().expect("8-byte slice"));
            if version != VERSION {
                return Err(EpochListError::UnsupportedVersion(version));
            }
            let body = len - 16;
            if body % 2 != 0 {
                return Err(EpochListError::CorruptBody(body));
            }
            let mut bytes = Vec::with_capacity(body as usize);
            file.read_to_end(&mut bytes).map_err(at)?;
            for pair in bytes.chunks_exact(2) {
                epochs.insert(u16::from_le_bytes([pair[0], pair[1]]));
            }
        }
        Ok(Self { file, epochs })
    }

    /// Record an epoch; appends to disk only if it was not already present.
    /// Returns whether the epoch was already known.
    pub fn has_or_put(&mut self, epoch: u16) -> Result<bool, EpochListError> {
        if !self.epochs.insert(epoch) {
            return Ok(true);
        }
        self.file.write_all(&epoch.to_le_bytes())?;
        Ok(false)
    }

    pub fn has(&self, epoch: u16) -> bool {
        self.epochs.contains(&epoch)
    }

    /// All observed epochs, ascending.
    pub fn epochs(&self) -> impl Iterator<Item = u16> + '_ {
        self.epochs.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.epochs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.epochs.is_empty()
    }

    pub fn sync(&self) -> Result<(), EpochListError> {
        self.file.sync_all()?;
        Ok(())
    }
}
