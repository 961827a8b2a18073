use std::path::{Path, PathBuf};

use tracing_subscriber::EnvFilter;

use crate::data_file::{ChainedDataFile, DataFileConfig};
use crate::store::{KeyedRecordStore, StoreConfig};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// 32-byte index blocks, 16-byte data blocks, 8 blocks each.
pub fn small_config() -> StoreConfig {
    StoreConfig {
        index: DataFileConfig {
            allocation_unit_size: 32,
            initial_capacity: 8,
            ..DataFileConfig::default()
        },
        data: DataFileConfig {
            allocation_unit_size: 16,
            initial_capacity: 8,
            ..DataFileConfig::default()
        },
    }
}

pub fn read_only_config() -> StoreConfig {
    let mut config = small_config();
    config.index.read_only = true;
    config.data.read_only = true;
    config
}

pub fn index_path(dir: &Path) -> PathBuf {
    dir.join("store.index")
}

pub fn data_path(dir: &Path) -> PathBuf {
    dir.join("store.data")
}

pub fn open_store(dir: &Path) -> KeyedRecordStore {
    init_tracing();
    KeyedRecordStore::open(index_path(dir), data_path(dir), small_config()).unwrap()
}

/// Opens the data file of a closed store directly.
pub fn open_data_file(dir: &Path) -> ChainedDataFile {
    ChainedDataFile::open(data_path(dir), small_config().data).unwrap()
}

/// Opens the index file of a closed store directly.
pub fn open_index_file(dir: &Path) -> ChainedDataFile {
    ChainedDataFile::open(index_path(dir), small_config().index).unwrap()
}
