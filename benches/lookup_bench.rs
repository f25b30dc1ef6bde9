use caridx::bucketteer::{BucketteerReader, BucketteerWriter};
use caridx::eytzinger;
use caridx::meta::IndexMeta;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use rand::{Rng, SeedableRng};

fn bench_lookups(c: &mut Criterion) {
    let mut rng = rand::rngs::StdRng::seed_from_u64(42);

    // Sealed bucketteer with 100k random signatures.
    let mut writer = BucketteerWriter::new();
    let mut sigs = Vec::with_capacity(100_000);
    for _ in 0..100_000 {
        let mut sig = [0u8; 64];
        rng.fill(&mut sig[..]);
        writer.put(&sig);
        sigs.push(sig);
    }
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bench.bucketteer");
    writer.seal(&path, &IndexMeta::new()).unwrap();
    let reader = BucketteerReader::open(&path).unwrap();

    c.bench_function("bucketteer_has_hit_100k", |b| {
        let mut i = 0;
        b.iter(|| {
            i = (i + 1) % sigs.len();
            reader.has(black_box(&sigs[i])).unwrap()
        })
    });
    c.bench_function("bucketteer_has_miss_100k", |b| {
        let mut sig = [0u8; 64];
        b.iter(|| {
            rng.fill(&mut sig[..]);
            reader.has(black_box(&sig)).unwrap()
        })
    });

    // Eytzinger search against std binary search on one 4k-hash bucket.
    let mut sorted: Vec<u64> = (0..4096).map(|_| rng.gen()).collect();
    sorted.sort_unstable();
    sorted.dedup();
    let bucket: Vec<u8> = eytzinger::layout(&sorted)
        .iter()
        .flat_map(|h| h.to_le_bytes())
        .collect();
    c.bench_function("eytzinger_search_4k", |b| {
        let mut i = 0;
        b.iter(|| {
            i = (i + 1) % sorted.len();
            eytzinger::search(black_box(&bucket), black_box(sorted[i]))
        })
    });
    c.bench_function("std_binary_search_4k", |b| {
        let mut i = 0;
        b.iter(|| {
            i = (i + 1) % sorted.len();
            black_box(&sorted).binary_search(black_box(&sorted[i])).is_ok()
        })
    });
}

criterion_group!(benches, bench_lookups);
criterion_main!(benches);
