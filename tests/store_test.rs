use std::sync::Arc;
use std::time::Duration;

use caridx::cancel::CancelToken;
use caridx::store::{RecordFormat, Store, StoreOptions};

fn sig(seed: u8) -> [u8; 64] {
    let mut s = [0u8; 64];
    for (i, b) in s.iter_mut().enumerate() {
        *b = seed.wrapping_mul(167).wrapping_add(i as u8).wrapping_mul(29);
    }
    s
}

fn account(seed: u8) -> [u8; 32] {
    let mut a = [0u8; 32];
    for (i, b) in a.iter_mut().enumerate() {
        *b = seed.wrapping_mul(101).wrapping_add(i as u8);
    }
    a
}

fn no_gc_opts() -> StoreOptions {
    StoreOptions {
        buckets_bits: 16,
        gc_interval: Duration::ZERO,
        ..Default::default()
    }
}

#[test]
fn roundtrip_across_flush_sync_and_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("sig2epoch");

    let store = Store::open(&base, RecordFormat::SigToEpoch, no_gc_opts()).unwrap();
    assert!(store.put(&sig(1), &7u16.to_le_bytes()).unwrap());
    assert_eq!(store.get(&sig(1)).unwrap(), Some(7u16.to_le_bytes().to_vec()));

    store.flush().unwrap();
    store.sync().unwrap();
    assert_eq!(store.get(&sig(1)).unwrap(), Some(7u16.to_le_bytes().to_vec()));
    assert!(store.has(&sig(1)).unwrap());
    assert_eq!(store.size(&sig(1)).unwrap(), Some(2));
    assert!(!store.has(&sig(2)).unwrap());
    store.close().unwrap();

    let store = Store::open(&base, RecordFormat::SigToEpoch, no_gc_opts()).unwrap();
    assert_eq!(store.get(&sig(1)).unwrap(), Some(7u16.to_le_bytes().to_vec()));
    store.close().unwrap();
}

#[test]
fn put_dedupes_and_overwrites() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("sig2epoch");
    let store = Store::open(&base, RecordFormat::SigToEpoch, no_gc_opts()).unwrap();

    assert!(store.put(&sig(1), &1u16.to_le_bytes()).unwrap());
    // Identical pair: nothing written.
    assert!(!store.put(&sig(1), &1u16.to_le_bytes()).unwrap());
    assert_eq!(store.freelist_len(), 0);

    // New value: the old block is freed.
    assert!(store.put(&sig(1), &2u16.to_le_bytes()).unwrap());
    assert_eq!(store.get(&sig(1)).unwrap(), Some(2u16.to_le_bytes().to_vec()));
    assert_eq!(store.freelist_len(), 1);
    store.close().unwrap();
}

/// Spec scenario: delete → flush leaves the key gone, a second delete
/// answers false, and the freelist names the freed block.
#[test]
fn remove_feeds_the_freelist() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("sig2epoch");
    let store = Store::open(&base, RecordFormat::SigToEpoch, no_gc_opts()).unwrap();

    store.put(&sig(1), &1u16.to_le_bytes()).unwrap();
    assert!(store.remove(&sig(1)).unwrap());
    store.flush().unwrap();

    assert_eq!(store.get(&sig(1)).unwrap(), None);
    assert!(!store.remove(&sig(1)).unwrap());
    assert_eq!(store.freelist_len(), 1);
    store.close().unwrap();

    // The freelist entry names the first record: position 0, 66-byte
    // payload (64-byte key + 2-byte epoch).
    let free = std::fs::read(dir.path().join("sig2epoch.index.free")).unwrap();
    assert_eq!(free.len(), 12);
    assert_eq!(u64::from_le_bytes(free[..8].try_into().unwrap()), 0);
    assert_eq!(u32::from_le_bytes(free[8..].try_into().unwrap()), 66);
}

/// Spec scenario: 64 concurrent flushes all succeed and reads stay
/// consistent.
#[test]
fn concurrent_flushes_all_succeed() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("sig2epoch");
    let store = Arc::new(Store::open(&base, RecordFormat::SigToEpoch, no_gc_opts()).unwrap());
    for seed in 1..=3 {
        store.put(&sig(seed), &u16::from(seed).to_le_bytes()).unwrap();
    }

    let mut handles = Vec::new();
    for _ in 0..64 {
        let store = Arc::clone(&store);
        handles.push(std::thread::spawn(move || store.flush()));
    }
    for handle in handles {
        handle.join().unwrap().unwrap();
    }
    for seed in 1..=3 {
        assert_eq!(
            store.get(&sig(seed)).unwrap(),
            Some(u16::from(seed).to_le_bytes().to_vec())
        );
    }
}

/// Spec scenario: reopen with a different bucket width, then back.
#[test]
fn translate_bucket_width_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("gsfa");
    let opts = |bits: u8| StoreOptions {
        buckets_bits: bits,
        gc_interval: Duration::ZERO,
        ..Default::default()
    };

    let store = Store::open(&base, RecordFormat::Gsfa, opts(16)).unwrap();
    for seed in 0..5 {
        store.put(&account(seed), &[seed; 8]).unwrap();
    }
    assert!(store.remove(&account(0)).unwrap());
    store.close().unwrap();

    let store = Store::open(&base, RecordFormat::Gsfa, opts(24)).unwrap();
    assert_eq!(store.get(&account(0)).unwrap(), None);
    for seed in 1..5 {
        assert_eq!(store.get(&account(seed)).unwrap(), Some(vec![seed; 8]));
    }
    store.close().unwrap();

    let store = Store::open(&base, RecordFormat::Gsfa, opts(16)).unwrap();
    assert_eq!(store.get(&account(0)).unwrap(), None);
    for seed in 1..5 {
        assert_eq!(store.get(&account(seed)).unwrap(), Some(vec![seed; 8]));
    }
    store.close().unwrap();
}

#[test]
fn gc_deletes_fully_freed_files() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("gsfa");
    let opts = StoreOptions {
        buckets_bits: 8,
        // 4-byte size word + 32-byte key + 28-byte value = 64 per record;
        // four records per file.
        max_file_size: 256,
        gc_interval: Duration::ZERO,
        ..Default::default()
    };
    let store = Store::open(&base, RecordFormat::Gsfa, opts).unwrap();
    for seed in 0..8 {
        store.put(&account(seed), &[seed; 28]).unwrap();
    }
    store.flush().unwrap();
    assert!(dir.path().join("gsfa.data.0").exists());
    assert!(dir.path().join("gsfa.data.1").exists());

    for seed in 0..4 {
        assert!(store.remove(&account(seed)).unwrap());
    }
    assert_eq!(store.freelist_len(), 4);

    store.gc_now(&CancelToken::new()).unwrap();
    assert_eq!(store.freelist_len(), 0);
    assert!(!dir.path().join("gsfa.data.0").exists());
    for seed in 4..8 {
        assert_eq!(store.get(&account(seed)).unwrap(), Some(vec![seed; 28]));
    }
    store.close().unwrap();
}

#[test]
fn gc_relocates_mostly_free_files() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("gsfa");
    let opts = StoreOptions {
        buckets_bits: 8,
        max_file_size: 256,
        gc_interval: Duration::ZERO,
        low_use_percent: 50,
        ..Default::default()
    };
    let store = Store::open(&base, RecordFormat::Gsfa, opts).unwrap();
    for seed in 0..8 {
        store.put(&account(seed), &[seed; 28]).unwrap();
    }
    store.flush().unwrap();

    // Three of four records in file 0 freed: 75% ≥ 50%, so the survivor
    // moves out and its original lands on the freelist.
    for seed in 0..3 {
        assert!(store.remove(&account(seed)).unwrap());
    }
    store.gc_now(&CancelToken::new()).unwrap();
    assert_eq!(store.freelist_len(), 1);
    assert_eq!(store.get(&account(3)).unwrap(), Some(vec![3; 28]));

    // Next cycle finds file 0 fully free and deletes it.
    store.gc_now(&CancelToken::new()).unwrap();
    assert!(!dir.path().join("gsfa.data.0").exists());
    for seed in 3..8 {
        assert_eq!(store.get(&account(seed)).unwrap(), Some(vec![seed; 28]));
    }
    store.close().unwrap();
}

#[test]
fn gc_respects_cancellation() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("gsfa");
    let store = Store::open(&base, RecordFormat::Gsfa, no_gc_opts()).unwrap();
    store.put(&account(1), b"x").unwrap();
    store.remove(&account(1)).unwrap();

    let cancel = CancelToken::new();
    cancel.cancel();
    assert!(store.gc_now(&cancel).is_err());
    // Aborted cycle leaves the freelist intact.
    assert_eq!(store.freelist_len(), 1);
    store.close().unwrap();
}

#[test]
fn iteration_snapshots_live_records() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("gsfa");
    let store = Store::open(&base, RecordFormat::Gsfa, no_gc_opts()).unwrap();
    for seed in 0..6 {
        store.put(&account(seed), &[seed; 4]).unwrap();
    }
    store.remove(&account(2)).unwrap();
    store.gc_now(&CancelToken::new()).unwrap();

    let mut seen: Vec<(Vec<u8>, Vec<u8>)> =
        store.iter().unwrap().collect::<Result<_, _>>().unwrap();
    seen.sort();
    let mut expected: Vec<(Vec<u8>, Vec<u8>)> = (0..6)
        .filter(|seed| *seed != 2)
        .map(|seed| (account(seed).to_vec(), vec![seed; 4]))
        .collect();
    expected.sort();
    assert_eq!(seen, expected);
    store.close().unwrap();
}

#[test]
fn in_memory_primary_behaves_like_files() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("mem");
    let store = Store::open_in_memory(&base, no_gc_opts()).unwrap();

    store.put(&sig(1), b"alpha").unwrap();
    store.put(&sig(2), b"beta").unwrap();
    assert_eq!(store.get(&sig(1)).unwrap(), Some(b"alpha".to_vec()));
    assert!(store.remove(&sig(1)).unwrap());
    assert_eq!(store.get(&sig(1)).unwrap(), None);

    let mut seen: Vec<(Vec<u8>, Vec<u8>)> =
        store.iter().unwrap().collect::<Result<_, _>>().unwrap();
    seen.sort();
    assert_eq!(seen, vec![(sig(2).to_vec(), b"beta".to_vec())]);
    store.close().unwrap();
}

#[test]
fn background_gc_thread_runs() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("gsfa");
    let opts = StoreOptions {
        buckets_bits: 8,
        max_file_size: 256,
        gc_interval: Duration::from_millis(50),
        ..Default::default()
    };
    let store = Store::open(&base, RecordFormat::Gsfa, opts).unwrap();
    for seed in 0..8 {
        store.put(&account(seed), &[seed; 28]).unwrap();
    }
    store.flush().unwrap();
    for seed in 0..4 {
        store.remove(&account(seed)).unwrap();
    }

    // The ticker fires within a few intervals and drains the freelist.
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while store.freelist_len() > 0 && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(20));
    }
    assert_eq!(store.freelist_len(), 0);
    store.close().unwrap();
}
