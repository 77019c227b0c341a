//! Randomized interleavings of put/get/del checked against a reference
//! `BTreeMap`, with periodic close/reopen, using a seeded RNG for
//! reproducibility.

use lsmkv::Store;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use tempfile::tempdir;

#[derive(Clone, Copy)]
enum Op {
    Put,
    Get,
    Del,
    Reopen,
}

fn pick_op(rng: &mut StdRng) -> Op {
    match rng.random_range(0..100) {
        0..=49 => Op::Put,
        50..=79 => Op::Get,
        80..=96 => Op::Del,
        _ => Op::Reopen,
    }
}

fn run_with_seed(seed: u64) {
    let dir = tempdir().unwrap();
    // small cap so flush/compaction actually exercise the on-disk path
    let max_table_size = 10_272 + 12 * 20;
    let mut store = Store::open_with_max_table_size(dir.path(), max_table_size).unwrap();
    let mut reference: BTreeMap<u64, Vec<u8>> = BTreeMap::new();

    let mut rng = StdRng::seed_from_u64(seed);
    let key_space = 64u64;

    for _ in 0..2_000 {
        match pick_op(&mut rng) {
            Op::Put => {
                let key = rng.random_range(0..key_space);
                let len = rng.random_range(0..24usize);
                let value: Vec<u8> = (0..len).map(|_| rng.random::<u8>()).collect();
                store.put(key, value.clone()).unwrap();
                reference.insert(key, value);
            }
            Op::Del => {
                let key = rng.random_range(0..key_space);
                let expected_existed = reference.remove(&key).is_some();
                let existed = store.del(key).unwrap();
                assert_eq!(existed, expected_existed, "del({key}) existed mismatch");
            }
            Op::Get => {
                let key = rng.random_range(0..key_space);
                assert_eq!(
                    store.get(key).unwrap(),
                    reference.get(&key).cloned(),
                    "get({key}) mismatch"
                );
            }
            Op::Reopen => {
                store.close().unwrap();
                store = Store::open_with_max_table_size(dir.path(), max_table_size).unwrap();
            }
        }
    }

    // final pass over the whole key space after one last reopen
    store.close().unwrap();
    let mut reopened = Store::open_with_max_table_size(dir.path(), max_table_size).unwrap();
    for key in 0..key_space {
        assert_eq!(
            reopened.get(key).unwrap(),
            reference.get(&key).cloned(),
            "final get({key}) mismatch after seed {seed}"
        );
    }
}

#[test]
fn random_interleavings_match_reference_map() {
    for seed in [1u64, 2, 42, 1337, 90210] {
        run_with_seed(seed);
    }
}
