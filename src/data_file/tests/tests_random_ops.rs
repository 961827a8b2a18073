//! Seeded random workloads checked against an in-memory oracle.
//!
//! Every step mixes insert, update, append, tail truncation and delete over
//! empty, single-block and multi-block sizes, then re-checks:
//!
//! - start blocks are strictly ascending,
//! - `item_size <= chain length * allocation unit` for every record,
//! - every record reads back exactly as the oracle holds it.
//!
//! The final state is verified once more after a reopen.

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use crate::block_store::BlockStore;
    use crate::data_file::tests::helpers::*;
    use crate::data_file::{ChainedDataFile, DataFileConfig};
    use tempfile::TempDir;

    fn random_len(rng: &mut StdRng) -> usize {
        match rng.random_range(0..4) {
            0 => 0,
            1 => rng.random_range(1..=16),
            2 => rng.random_range(17..=64),
            _ => rng.random_range(65..=200),
        }
    }

    fn random_bytes(rng: &mut StdRng, len: usize) -> Vec<u8> {
        (0..len).map(|_| rng.random()).collect()
    }

    fn pick(rng: &mut StdRng, oracle: &BTreeMap<u32, Vec<u8>>) -> Option<u32> {
        if oracle.is_empty() {
            return None;
        }
        oracle.keys().nth(rng.random_range(0..oracle.len())).copied()
    }

    fn check_against<S: BlockStore>(
        file: &mut ChainedDataFile<S>,
        oracle: &BTreeMap<u32, Vec<u8>>,
        step: usize,
    ) {
        let starts = file.start_blocks();
        assert!(
            starts.windows(2).all(|w| w[0] < w[1]),
            "step {step}: start blocks not ascending: {starts:?}"
        );
        assert_eq!(starts, oracle.keys().copied().collect::<Vec<_>>(), "step {step}");

        let unit = u64::from(file.allocation_unit());
        for (&start, expected) in oracle {
            assert!(file.contains(start), "step {step}: {start} missing");
            let size = u64::from(file.item_size(start).unwrap());
            let blocks = file.chain(start).unwrap().len() as u64;
            assert!(size <= blocks * unit, "step {step}: {start} oversized");
            assert_eq!(&file.read(start).unwrap(), expected, "step {step}: {start}");
        }
    }

    fn run_workload(config: DataFileConfig, seed: u64, steps: usize) {
        init_tracing();
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.db");
        let mut rng = StdRng::seed_from_u64(seed);
        let mut oracle: BTreeMap<u32, Vec<u8>> = BTreeMap::new();
        let mut file = ChainedDataFile::open(&path, config.clone()).unwrap();

        for step in 0..steps {
            let target = pick(&mut rng, &oracle);
            match (rng.random_range(0..5), target) {
                (0, _) | (_, None) => {
                    let len = random_len(&mut rng);
                    let data = random_bytes(&mut rng, len);
                    let start = file.insert(&data).unwrap();
                    assert!(oracle.insert(start, data).is_none(), "step {step}: reused live start");
                }
                (1, Some(start)) => {
                    let len = random_len(&mut rng);
                    let data = random_bytes(&mut rng, len);
                    file.update(start, &data).unwrap();
                    oracle.insert(start, data);
                }
                (2, Some(start)) => {
                    let len = random_len(&mut rng);
                    let data = random_bytes(&mut rng, len);
                    file.append(start, &data).unwrap();
                    oracle.get_mut(&start).unwrap().extend_from_slice(&data);
                }
                (3, Some(start)) => {
                    let current = oracle.get_mut(&start).unwrap();
                    let remove = rng.random_range(0..=current.len());
                    file.delete_partial_tail(start, remove as u32).unwrap();
                    current.truncate(current.len() - remove);
                }
                (_, Some(start)) => {
                    file.delete(start).unwrap();
                    oracle.remove(&start);
                }
            }
            check_against(&mut file, &oracle, step);
        }
        file.close().unwrap();

        let mut file = ChainedDataFile::open(&path, config).unwrap();
        assert!(file.recovery_report().is_clean());
        check_against(&mut file, &oracle, steps);
    }

    #[test]
    fn random_ops_with_data_checksums() {
        run_workload(small_config(), 0x5EED_0001, 400);
    }

    #[test]
    fn random_ops_without_data_checksums() {
        let config = DataFileConfig {
            use_data_checksums: false,
            ..small_config()
        };
        run_workload(config, 0x5EED_0002, 400);
    }

    #[test]
    fn random_ops_with_one_byte_blocks() {
        let config = DataFileConfig {
            allocation_unit_size: 1,
            ..small_config()
        };
        run_workload(config, 0x5EED_0003, 150);
    }
}
