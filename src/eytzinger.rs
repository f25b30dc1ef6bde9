//! Eytzinger (BFS) layout for branch-light binary search.
//!
//! A sorted array rearranged so that the implicit search tree's root sits at
//! index 0 and the children of node `k` sit at `2k+1` and `2k+2`. Probes walk
//! top-down with a single arithmetic step per level, touching one or two
//! cache lines for the bucket sizes this crate produces (a few thousand
//! 8-byte hashes per bucket).
//!
//! The search side reads `u64` values straight off an on-disk byte slab with
//! explicit little-endian loads — no alignment requirement, no pointer
//! reinterpretation.

/// Rearrange a sorted slice into Eytzinger order.
///
/// The input must already be sorted ascending; the output is a fresh vector
/// of the same length.
pub fn layout(sorted: &[u64]) -> Vec<u64> {
    let mut out = vec![0u64; sorted.len()];
    let mut next = 0usize;
    fill(sorted, &mut out, &mut next, 1);
    out
}

/// In-order walk of the implicit tree rooted at `k` (1-based), consuming the
/// sorted input left to right.
fn fill(sorted: &[u64], out: &mut [u64], next: &mut usize, k: usize) {
    if k > sorted.len() {
        return;
    }
    fill(sorted, out, next, 2 * k);
    out[k - 1] = sorted[*next];
    *next += 1;
    fill(sorted, out, next, 2 * k + 1);
}

/// Load element `i` of an Eytzinger-ordered bucket stored as consecutive
/// little-endian `u64`s.
#[inline]
fn load(bucket: &[u8], i: usize) -> u64 {
    let at = i * 8;
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bucket[at..at + 8]);
    u64::from_le_bytes(raw)
}

/// Search an Eytzinger-ordered byte slab (stride 8, little-endian) for
/// `needle`. `bucket.len()` must be a multiple of 8; callers validate the
/// slab size before searching.
pub fn search(bucket: &[u8], needle: u64) -> bool {
    let n = bucket.len() / 8;
    let mut i = 0usize;
    while i < n {
        let v = load(bucket, i);
        if v == needle {
            return true;
        }
        i = 2 * i + 1 + usize::from(v < needle);
    }
    false
}
