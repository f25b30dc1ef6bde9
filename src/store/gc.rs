//! Background garbage collection for the primary files.
//!
//! A cycle: drain the freelist and tombstone every named region, then per
//! affected sealed file merge adjacent free spans, cut the trailing one,
//! and — once a file is mostly free — relocate its surviving records to the
//! log head so the next cycle can delete it outright. The index learns
//! about moves through the [`IndexRemap`] contract.
//!
//! Cycles are bounded by a time budget and a cancellation token, both
//! checked between files and between freelist batches. An aborted cycle is
//! harmless: tombstoning is idempotent and the freelist is only truncated
//! after its entries were acted on.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use tracing::debug;

use super::error::StoreError;
use super::freelist::Freelist;
use super::index::Index;
use super::primary::Primary;
use super::types::{Block, SIZE_PREFIX};
use crate::cancel::CancelToken;

/// Freelist entries tombstoned between budget checks.
const TOMBSTONE_BATCH: usize = 1024;

#[derive(Debug, Clone)]
pub(crate) struct GcConfig {
    pub time_budget: Duration,
    /// A sealed file at least this percent free gets its live records
    /// relocated.
    pub low_use_percent: u8,
}

/// How the index hears about records GC moved.
pub(crate) trait IndexRemap {
    fn remap(&mut self, key: &[u8], from: Block, to: Block) -> Result<(), StoreError>;
}

impl IndexRemap for Index {
    fn remap(&mut self, key: &[u8], from: Block, to: Block) -> Result<(), StoreError> {
        self.remap_block(key, from, to)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct GcStats {
    pub tombstoned: u64,
    pub truncated_bytes: u64,
    pub relocated: u64,
    pub files_deleted: u64,
}

struct Budget {
    deadline: Instant,
    cancel: CancelToken,
}

impl Budget {
    fn check(&self) -> Result<(), StoreError> {
        if self.cancel.is_cancelled() {
            return Err(StoreError::Cancelled);
        }
        if Instant::now() >= self.deadline {
            return Err(StoreError::DeadlineExceeded);
        }
        Ok(())
    }
}

/// One GC cycle over the store's components. The caller holds the store's
/// write lock for the duration.
pub(crate) fn run_cycle(
    primary: &mut Primary,
    index: &mut dyn IndexRemap,
    freelist: &mut Freelist,
    cfg: &GcConfig,
    cancel: &CancelToken,
) -> Result<GcStats, StoreError> {
    let mut stats = GcStats::default();
    if primary.as_files().is_none() {
        return Ok(stats);
    }
    let budget = Budget { deadline: Instant::now() + cfg.time_budget, cancel: cancel.clone() };

    // Everything GC touches must be on disk first.
    primary.flush()?;

    // (a) Freelist → tombstones, grouped per file.
    let entries = freelist.drain()?;
    let files = primary.as_files().expect("checked above");
    let layout = files.log().layout();
    let mut by_file: BTreeMap<u32, Vec<Block>> = BTreeMap::new();
    for blk in entries {
        by_file.entry(layout.file_num(blk.offset)).or_default().push(blk);
    }
    for (num, blocks) in &by_file {
        for batch in blocks.chunks(TOMBSTONE_BATCH) {
            budget.check()?;
            files.tombstone_batch(*num, batch)?;
            stats.tombstoned += batch.len() as u64;
        }
    }
    freelist.truncate()?;

    // (b)+(c) Per affected sealed file: merge spans, cut the tail, relocate
    // mostly-free files, delete empty ones.
    let active = files.log().active_num();
    for num in by_file.keys().copied().filter(|num| *num != active) {
        budget.check()?;
        collect_file(primary, index, freelist, num, cfg, &mut stats)?;
    }

    debug!(
        target: "caridx::store",
        tombstoned = stats.tombstoned,
        truncated = stats.truncated_bytes,
        relocated = stats.relocated,
        deleted = stats.files_deleted,
        "gc cycle"
    );
    Ok(stats)
}

fn collect_file(
    primary: &mut Primary,
    index: &mut dyn IndexRemap,
    freelist: &mut Freelist,
    num: u32,
    cfg: &GcConfig,
    stats: &mut GcStats,
) -> Result<(), StoreError> {
    let files = primary.as_files().expect("file-backed during GC");
    let mut disk_len = files.log().disk_len(num)?;
    if disk_len == 0 {
        primary.as_files_mut().expect("file-backed").log_mut().remove_file(num)?;
        stats.files_deleted += 1;
        return Ok(());
    }

    // Merge adjacent freed records into spans.
    let mut free_bytes = 0u64;
    let mut spans: Vec<(u64, u64)> = Vec::new();
    for rec in files.scan_file(num)? {
        if !rec.deleted {
            continue;
        }
        let len = SIZE_PREFIX + u64::from(rec.size);
        free_bytes += len;
        match spans.last_mut() {
            Some((start, span_len)) if *start + *span_len == rec.local => *span_len += len,
            _ => spans.push((rec.local, len)),
        }
    }

    // Cut the trailing span off the file.
    if let Some((start, span_len)) = spans.last().copied() {
        if start + span_len == disk_len {
            let files = primary.as_files_mut().expect("file-backed");
            files.log().truncate_file(num, start)?;
            stats.truncated_bytes += span_len;
            disk_len = start;
            free_bytes -= span_len;
            if disk_len == 0 {
                files.log_mut().remove_file(num)?;
                stats.files_deleted += 1;
                return Ok(());
            }
        }
    }

    // Mostly-free file: move the survivors out and freelist the originals
    // so the next cycle finds the file empty.
    if free_bytes * 100 >= disk_len * u64::from(cfg.low_use_percent) {
        let files = primary.as_files_mut().expect("file-backed");
        let moves = files.relocate_live(num)?;
        files.log_mut().flush()?;
        for relocation in &moves {
            index.remap(&relocation.key, relocation.from, relocation.to)?;
            freelist.put(relocation.from)?;
        }
        freelist.flush()?;
        stats.relocated += moves.len() as u64;
    }
    Ok(())
}
