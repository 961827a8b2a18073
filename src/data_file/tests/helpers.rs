use std::fs::OpenOptions;
use std::io;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::SystemTime;

use tracing_subscriber::EnvFilter;

use crate::block_store::{BlockStore, BlockStoreError, FileBlockStore, RandomAccessFile};
use crate::data_file::format::{FILE_HEADER_SIZE, FileHeader};
use crate::data_file::{ChainedDataFile, DataFileConfig};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// 16-byte blocks, 8 blocks initially, data checksums on.
pub fn small_config() -> DataFileConfig {
    DataFileConfig {
        allocation_unit_size: 16,
        initial_capacity: 8,
        use_data_checksums: true,
        read_only: false,
    }
}

pub fn read_only(config: &DataFileConfig) -> DataFileConfig {
    DataFileConfig {
        read_only: true,
        ..config.clone()
    }
}

/// Deterministic non-zero test payload.
pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed) | 1)
        .collect()
}

/// Absolute file offset of block `index`.
pub fn block_offset(geometry: &FileHeader, index: u32) -> u64 {
    FILE_HEADER_SIZE as u64 + u64::from(index) * geometry.block_size() as u64
}

/// Overwrites raw bytes of the file at `offset`.
pub fn patch_file(path: &Path, offset: u64, bytes: &[u8]) {
    let mut file = OpenOptions::new().write(true).open(path).unwrap();
    file.seek(SeekFrom::Start(offset)).unwrap();
    file.write_all(bytes).unwrap();
    file.sync_all().unwrap();
}

/// Reads `len` raw bytes of the file at `offset`.
pub fn read_file(path: &Path, offset: u64, len: usize) -> Vec<u8> {
    let mut file = OpenOptions::new().read(true).open(path).unwrap();
    file.seek(SeekFrom::Start(offset)).unwrap();
    let mut buf = vec![0u8; len];
    file.read_exact(&mut buf).unwrap();
    buf
}

// ------------------------------------------------------------------------------------------------
// Failure injection
// ------------------------------------------------------------------------------------------------

/// [`FileBlockStore`] wrapper whose writes fail while `fail` is set, or
/// once `writes_left` calls have gone through.
pub struct FlakyStore {
    inner: FileBlockStore,
    fail: Arc<AtomicBool>,
    writes_left: AtomicUsize,
}

impl FlakyStore {
    fn check(&self) -> Result<(), BlockStoreError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(BlockStoreError::Io(io::Error::other("injected write failure")));
        }
        let left = self.writes_left.load(Ordering::SeqCst);
        if left == 0 {
            return Err(BlockStoreError::Io(io::Error::other("write budget exhausted")));
        }
        if left != usize::MAX {
            self.writes_left.store(left - 1, Ordering::SeqCst);
        }
        Ok(())
    }
}

impl BlockStore for FlakyStore {
    fn block_size(&self) -> usize {
        self.inner.block_size()
    }

    fn block_capacity(&self) -> u32 {
        self.inner.block_capacity()
    }

    fn set_block_capacity(&mut self, capacity: u32) -> Result<(), BlockStoreError> {
        self.check()?;
        self.inner.set_block_capacity(capacity)
    }

    fn read_block(&mut self, index: u32) -> Result<Vec<u8>, BlockStoreError> {
        self.inner.read_block(index)
    }

    fn read_blocks(&mut self, indices: &[u32]) -> Result<Vec<u8>, BlockStoreError> {
        self.inner.read_blocks(indices)
    }

    fn write_block(&mut self, index: u32, data: &[u8]) -> Result<(), BlockStoreError> {
        self.check()?;
        self.inner.write_block(index, data)
    }

    fn write_blocks(&mut self, indices: &[u32], data: &[u8]) -> Result<(), BlockStoreError> {
        self.check()?;
        self.inner.write_blocks(indices, data)
    }

    fn write_partial_block(
        &mut self,
        index: u32,
        offset_in_block: usize,
        data: &[u8],
    ) -> Result<(), BlockStoreError> {
        self.check()?;
        self.inner.write_partial_block(index, offset_in_block, data)
    }

    fn block_start_offset(&self, index: u32) -> u64 {
        self.inner.block_start_offset(index)
    }

    fn flush(&mut self) -> Result<(), BlockStoreError> {
        self.check()?;
        self.inner.flush()
    }

    fn last_modified(&self) -> Result<SystemTime, BlockStoreError> {
        self.inner.last_modified()
    }

    fn last_write(&self) -> SystemTime {
        self.inner.last_write()
    }

    fn is_modified_externally(&self) -> Result<bool, BlockStoreError> {
        self.inner.is_modified_externally()
    }

    fn name(&self) -> &str {
        self.inner.name()
    }

    fn is_read_only(&self) -> bool {
        false
    }

    fn close(&mut self) -> Result<(), BlockStoreError> {
        self.inner.close()
    }
}

/// Reopens an existing data file over a [`FlakyStore`]; the returned flag
/// switches write failures on.
pub fn open_flaky(
    path: &Path,
    config: &DataFileConfig,
) -> (ChainedDataFile<FlakyStore>, Arc<AtomicBool>) {
    let fail = Arc::new(AtomicBool::new(false));
    let data_file = open_over_flaky(path, config, Arc::clone(&fail), usize::MAX);
    (data_file, fail)
}

/// Reopens an existing data file whose store accepts only `writes` more
/// write calls, standing in for a process that dies mid-operation.
pub fn open_with_write_budget(
    path: &Path,
    config: &DataFileConfig,
    writes: usize,
) -> ChainedDataFile<FlakyStore> {
    open_over_flaky(path, config, Arc::new(AtomicBool::new(false)), writes)
}

fn open_over_flaky(
    path: &Path,
    config: &DataFileConfig,
    fail: Arc<AtomicBool>,
    writes: usize,
) -> ChainedDataFile<FlakyStore> {
    let geometry = FileHeader::new(config.allocation_unit_size, config.use_data_checksums);
    let file = RandomAccessFile::open(path, false).unwrap();
    let inner = FileBlockStore::new(file, geometry.block_size(), FILE_HEADER_SIZE as u64).unwrap();
    let store = FlakyStore {
        inner,
        fail,
        writes_left: AtomicUsize::new(writes),
    };
    ChainedDataFile::with_store(store, geometry, false, config).unwrap()
}
