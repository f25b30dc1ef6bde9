//! Small filesystem helpers shared by the index writers.

use std::fs::File;
use std::path::{Path, PathBuf};

use tracing::debug;

/// `<path>.tmp`, appended rather than substituted so `x.index` maps to
/// `x.index.tmp` and never collides with another artifact's temp file.
pub(crate) fn tmp_sibling(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(".tmp");
    PathBuf::from(os)
}

/// fsync the containing directory so a rename is durable. Best-effort:
/// some filesystems reject directory fsync.
pub(crate) fn sync_parent_dir(path: &Path) {
    let Some(parent) = path.parent() else { return };
    match File::open(parent).and_then(|d| d.sync_all()) {
        Ok(()) => {}
        Err(err) => {
            debug!(target: "caridx::fs", dir = %parent.display(), %err, "directory fsync skipped");
        }
    }
}
