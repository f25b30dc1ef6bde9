//! End-to-end pass over one fake epoch: every index built and queried the
//! way archive ingestion and the read path drive them together.

use caridx::blocktime::{epoch_bounds, BlocktimeIndex};
use caridx::bucketteer::{BucketteerReader, BucketteerWriter};
use caridx::cancel::CancelToken;
use caridx::cidtooffset::{CidToOffsetIndex, SubsetOffsetAndSize};
use caridx::meta::{IndexMeta, KEY_EPOCH, KEY_NETWORK};
use caridx::preindex::{PreIndexOptions, PreIndexReader, PreIndexWriter};
use caridx::sigtoepoch::SigToEpochIndex;
use caridx::store::StoreOptions;

const EPOCH: u64 = 0;
const TX_COUNT: u32 = 200;

fn sig(n: u32) -> [u8; 64] {
    let mut s = [0u8; 64];
    for (i, b) in s.iter_mut().enumerate() {
        *b = (n as u8)
            .wrapping_mul(151)
            .wrapping_add(i as u8)
            .wrapping_mul(7)
            .wrapping_add((n >> 8) as u8);
    }
    s
}

fn cid(n: u32) -> Vec<u8> {
    let mut bytes = vec![0x01, 0x71, 0x12, 0x20];
    bytes.extend(sig(n)[..32].iter().copied());
    bytes
}

fn store_opts() -> StoreOptions {
    StoreOptions {
        buckets_bits: 8,
        gc_interval: std::time::Duration::ZERO,
        ..Default::default()
    }
}

#[test]
fn one_epoch_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let (start_slot, _) = epoch_bounds(EPOCH);

    // Ingestion: every transaction feeds each index.
    let mut bucketteer = BucketteerWriter::new();
    let preindex = PreIndexWriter::new(
        &dir.path().join("preindex"),
        PreIndexOptions { num_shards: 8, ..Default::default() },
    )
    .unwrap();
    let mut blocktimes = BlocktimeIndex::new_for_epoch(EPOCH);
    let mut sig2epoch = SigToEpochIndex::open(&dir.path().join("sig2epoch"), store_opts()).unwrap();
    let cid2offset = CidToOffsetIndex::open(&dir.path().join("cid2offset"), store_opts()).unwrap();

    let mut car_offset = 0u64;
    for n in 0..TX_COUNT {
        let signature = sig(n);
        bucketteer.put(&signature);
        // Two pushes per key; the reader must only believe the second.
        preindex.push(&signature, n).unwrap();
        preindex.push(&signature, n + 1000).unwrap();

        let slot = start_slot + u64::from(n) * 17;
        blocktimes.set(slot, 1_700_000_000 + i64::from(n)).unwrap();
        sig2epoch.put(&signature, EPOCH as u16).unwrap();

        let section = 64 + u64::from(n % 7) * 32;
        cid2offset
            .put(
                &cid(n),
                SubsetOffsetAndSize {
                    subset: n % 3,
                    offset: car_offset,
                    size: section as u32,
                },
            )
            .unwrap();
        car_offset += section;
    }

    // Seal everything.
    let mut meta = IndexMeta::new();
    meta.add(KEY_EPOCH, EPOCH.to_string()).unwrap();
    meta.add(KEY_NETWORK, "mainnet").unwrap();
    let bucketteer_path = dir.path().join("epoch-0.bucketteer");
    bucketteer.seal(&bucketteer_path, &meta).unwrap();
    preindex.build(&CancelToken::new()).unwrap();
    let blocktime_path = dir.path().join("epoch-0-slot-to-blocktime.index");
    blocktimes.write_to_file(&blocktime_path).unwrap();
    sig2epoch.flush().unwrap();
    cid2offset.flush().unwrap();

    // Read path.
    let bucketteer = BucketteerReader::open(&bucketteer_path).unwrap();
    assert_eq!(bucketteer.meta().epoch(), Some(EPOCH));
    let preindex = PreIndexReader::load(&dir.path().join("preindex"), 8).unwrap();
    assert_eq!(preindex.len(), u64::from(TX_COUNT));
    let blocktimes = BlocktimeIndex::open(&blocktime_path).unwrap();

    let mut car_offset = 0u64;
    for n in 0..TX_COUNT {
        let signature = sig(n);
        assert!(bucketteer.has(&signature).unwrap(), "tx {n}");
        assert!(preindex.is_last(&signature, n + 1000));
        assert!(!preindex.is_last(&signature, n));
        assert_eq!(
            blocktimes.get(start_slot + u64::from(n) * 17).unwrap(),
            1_700_000_000 + i64::from(n)
        );
        assert_eq!(sig2epoch.get(&signature).unwrap(), Some(EPOCH as u16));

        let section = 64 + u64::from(n % 7) * 32;
        assert_eq!(
            cid2offset.get(&cid(n)).unwrap(),
            Some(SubsetOffsetAndSize {
                subset: n % 3,
                offset: car_offset,
                size: section as u32,
            })
        );
        car_offset += section;
    }
    assert_eq!(sig2epoch.epochs(), vec![EPOCH as u16]);

    // Unknown signatures miss everywhere. (Generated signatures always
    // vary across their bytes, so a constant one is never among them.)
    let unknown = [0xAA; 64];
    assert!(!bucketteer.has(&unknown).unwrap());
    assert!(preindex.get(&unknown).is_none());
    assert_eq!(sig2epoch.get(&unknown).unwrap(), None);

    sig2epoch.close().unwrap();
    cid2offset.close().unwrap();
}
