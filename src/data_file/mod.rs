//! # Chained Data File
//!
//! A **variable-length record store** built from fixed-size blocks. Each
//! record (an *item*) occupies a chain of blocks linked through the
//! `next_block` field of every block header; only the first block of a chain
//! (the *start block*) carries the item's logical length. The start block
//! index is the record's handle.
//!
//! ## Design Overview
//!
//! ```text
//! ChainedDataFile
//!   ├── BlockStore        fixed-size block I/O (file prelude holds the FileHeader)
//!   ├── FreeListAllocator which block indices are free
//!   └── chains            BTreeMap<start block, Chain { blocks, size }>
//! ```
//!
//! The in-memory chain index is rebuilt by the recovery scan on every open
//! and is the only thing ordinary reads consult; block checksums are written
//! on every write but verified only during that scan.
//!
//! See [`format`] for the exact byte layout.
//!
//! ## Capacity policy
//!
//! - **Growth:** when an operation needs more free blocks than exist, the
//!   capacity becomes `max(required, current + increment)`, where the
//!   increment starts at `initial_capacity / 10` (clamped to `1..=1000`) and
//!   scales with the current block count afterwards.
//! - **Shrink:** after blocks are released, if the highest occupied block
//!   index is below half the capacity, the file is cut down to
//!   `max(initial_capacity, highest occupied + 1)`.
//!
//! ## Failure model
//!
//! Any I/O failure leaves the on-disk chains in an unknown state, so the
//! first one **poisons** the handle: every later call fails with
//! [`DataFileError::Poisoned`]. Closing and reopening runs recovery, which
//! repairs whatever the failed operation left behind.
//!
//! ## Guarantees
//!
//! - **Chain size invariant:** every live record satisfies
//!   `size <= chain_length * allocation_unit`.
//! - **Crash ordering:** new blocks are written before they are linked in,
//!   and start-block sizes are lowered before blocks are unlinked, so an
//!   interrupted write never leaves a touched record without a valid
//!   chain. Its bytes may mix old and new content.
//! - **Read-only mode** never writes to the medium, including during recovery.

pub mod format;
mod recovery;

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::{collections::BTreeMap, io, path::Path, time::SystemTime};

use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

use crate::allocator::{AllocatorError, BlockAllocator, FreeListAllocator};
use crate::block_store::{BlockStore, BlockStoreError, FileBlockStore, RandomAccessFile};
use crate::encoding::{self, EncodingError};
use format::{BLOCK_HEADER_SIZE, BlockHeader, FILE_HEADER_SIZE, FORMAT_VERSION, FileHeader};
pub use recovery::RecoveryReport;

/// Largest accepted allocation unit (16 MiB).
const MAX_ALLOCATION_UNIT: u32 = 16 * 1024 * 1024;

/// Upper clamp of the initial growth increment.
const MAX_BASE_INCREMENT: u32 = 1000;

/// Highest block count addressable by the signed 32-bit links on disk.
const MAX_BLOCKS: u32 = i32::MAX as u32;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by data file operations.
#[derive(Debug, Error)]
pub enum DataFileError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Block store failure.
    #[error("Block store error: {0}")]
    BlockStore(#[from] BlockStoreError),

    /// Allocator failure.
    #[error("Allocator error: {0}")]
    Allocator(#[from] AllocatorError),

    /// Encoding / decoding error.
    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// File header missing, corrupt, or of an unsupported version.
    #[error("Invalid header: {0}")]
    InvalidHeader(String),

    /// Caller passed an out-of-range size, offset or length.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Mutation attempted on a file opened read-only.
    #[error("Data file is read-only")]
    ReadOnly,

    /// No live record starts at the given block.
    #[error("No record starts at block {0}")]
    UnknownStartBlock(u32),

    /// An earlier I/O failure invalidated this handle.
    #[error("Data file is poisoned by an earlier I/O failure; close and reopen it")]
    Poisoned,
}

impl DataFileError {
    /// Whether this error leaves the on-disk state unknown.
    fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Io(_) | Self::BlockStore(_) | Self::Allocator(_) | Self::Encoding(_)
        )
    }
}

// ------------------------------------------------------------------------------------------------
// Configuration
// ------------------------------------------------------------------------------------------------

/// Configuration for a [`ChainedDataFile`].
///
/// `allocation_unit_size` and `use_data_checksums` only apply when a file is
/// created; an existing file keeps the geometry stored in its header.
#[derive(Debug, Clone)]
pub struct DataFileConfig {
    /// Payload bytes per block.
    ///
    /// Default: 256. Must be in `1..=16 MiB`.
    pub allocation_unit_size: u32,

    /// Block capacity of a new file, and the floor below which the file is
    /// never shrunk.
    ///
    /// Default: 64.
    pub initial_capacity: u32,

    /// Store a CRC32 footer over every block payload.
    ///
    /// Default: true.
    pub use_data_checksums: bool,

    /// Open without ever writing to the file.
    ///
    /// Default: false.
    pub read_only: bool,
}

impl Default for DataFileConfig {
    fn default() -> Self {
        Self {
            allocation_unit_size: 256,
            initial_capacity: 64,
            use_data_checksums: true,
            read_only: false,
        }
    }
}

impl DataFileConfig {
    /// Validates all configuration parameters.
    pub fn validate(&self) -> Result<(), DataFileError> {
        if self.allocation_unit_size == 0 || self.allocation_unit_size > MAX_ALLOCATION_UNIT {
            return Err(DataFileError::InvalidArgument(format!(
                "allocation_unit_size must be in 1..={MAX_ALLOCATION_UNIT}"
            )));
        }
        if self.initial_capacity > MAX_BLOCKS {
            return Err(DataFileError::InvalidArgument(format!(
                "initial_capacity must be <= {MAX_BLOCKS}"
            )));
        }
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// Chain index
// ------------------------------------------------------------------------------------------------

/// Blocks and logical size of one record.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Chain {
    /// Block indices in chain order; `blocks[0]` is the start block.
    blocks: Vec<u32>,

    /// Logical item size in bytes.
    size: u32,
}

/// Snapshot of data file statistics returned by [`ChainedDataFile::stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataFileStats {
    /// Blocks the file currently holds.
    pub block_capacity: u32,
    /// Blocks belonging to live chains.
    pub allocated_blocks: u32,
    /// Number of live records.
    pub record_count: usize,
    /// Sum of the logical sizes of all live records.
    pub bytes_stored: u64,
}

// ------------------------------------------------------------------------------------------------
// ChainedDataFile
// ------------------------------------------------------------------------------------------------

/// Variable-length record store over fixed-size checksummed blocks.
///
/// Not internally synchronized: every method takes `&mut self`. The keyed
/// store wraps two of these behind one mutex.
pub struct ChainedDataFile<S: BlockStore = FileBlockStore> {
    /// Block I/O.
    store: S,

    /// Free/occupied block tracking.
    allocator: FreeListAllocator,

    /// Live records by start block, ascending.
    chains: BTreeMap<u32, Chain>,

    /// Geometry read from (or written to) the file header.
    geometry: FileHeader,

    /// Capacity of a fresh file and shrink floor.
    initial_capacity: u32,

    /// Minimum growth step.
    base_increment: u32,

    /// Never write to the medium.
    read_only: bool,

    /// Set by the first fatal error.
    poisoned: bool,

    /// Outcome of the recovery scan run at open.
    recovery: RecoveryReport,
}

impl<S: BlockStore> std::fmt::Debug for ChainedDataFile<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainedDataFile")
            .field("name", &self.store.name())
            .field("records", &self.chains.len())
            .field("read_only", &self.read_only)
            .field("poisoned", &self.poisoned)
            .finish_non_exhaustive()
    }
}

impl ChainedDataFile<FileBlockStore> {
    /// Opens (or creates) a data file at `path`.
    ///
    /// # Behavior
    /// - A missing or header-less file is initialized with a fresh header
    ///   and `initial_capacity` free blocks (read/write mode only).
    /// - An existing file has its header checksum-verified, then the
    ///   recovery scan rebuilds the chain index and repairs damage.
    ///
    /// # Errors
    /// [`DataFileError::InvalidHeader`] when the file header is corrupt or
    /// of an unknown version. The file must not be used in that case.
    pub fn open(path: impl AsRef<Path>, config: DataFileConfig) -> Result<Self, DataFileError> {
        config.validate()?;
        let path = path.as_ref();
        let mut file = RandomAccessFile::open(path, config.read_only)?;
        let fresh = file.is_new() || file.length()? < FILE_HEADER_SIZE as u64;

        let geometry = if fresh {
            if config.read_only {
                return Err(DataFileError::InvalidHeader(format!(
                    "{} has no file header and cannot be initialized read-only",
                    path.display()
                )));
            }
            let header = FileHeader::new(config.allocation_unit_size, config.use_data_checksums);
            file.set_length(0)?;
            file.write(0, &encoding::encode_to_vec(&header)?)?;
            info!(
                file = %path.display(),
                allocation_unit = header.allocation_unit,
                data_checksums = header.data_checksums,
                "Created data file header"
            );
            header
        } else {
            let mut raw = [0u8; FILE_HEADER_SIZE];
            file.read_fully(0, &mut raw)?;
            let (header, _) = encoding::decode_from_slice::<FileHeader>(&raw).map_err(|e| {
                DataFileError::InvalidHeader(format!("{}: {e}", path.display()))
            })?;
            if header.version != FORMAT_VERSION {
                return Err(DataFileError::InvalidHeader(format!(
                    "{}: unsupported version {}",
                    path.display(),
                    header.version
                )));
            }
            if header.allocation_unit == 0 || header.allocation_unit > MAX_ALLOCATION_UNIT {
                return Err(DataFileError::InvalidHeader(format!(
                    "{}: invalid allocation unit {}",
                    path.display(),
                    header.allocation_unit
                )));
            }
            if header.allocation_unit != config.allocation_unit_size
                || header.data_checksums != config.use_data_checksums
            {
                warn!(
                    file = %path.display(),
                    allocation_unit = header.allocation_unit,
                    data_checksums = header.data_checksums,
                    "Existing file geometry differs from configuration; keeping file geometry"
                );
            }
            header
        };

        let store = FileBlockStore::new(file, geometry.block_size(), FILE_HEADER_SIZE as u64)?;
        Self::with_store(store, geometry, fresh, &config)
    }
}

impl<S: BlockStore> ChainedDataFile<S> {
    /// Builds a data file over an already opened block store.
    ///
    /// `fresh` formats the store to `initial_capacity` free blocks; otherwise
    /// the recovery scan runs over the existing blocks.
    pub fn with_store(
        store: S,
        geometry: FileHeader,
        fresh: bool,
        config: &DataFileConfig,
    ) -> Result<Self, DataFileError> {
        if store.block_size() != geometry.block_size() {
            return Err(DataFileError::InvalidArgument(format!(
                "block store uses {}-byte blocks, geometry needs {}",
                store.block_size(),
                geometry.block_size()
            )));
        }
        let read_only = config.read_only || store.is_read_only();
        if fresh && read_only {
            return Err(DataFileError::ReadOnly);
        }

        let mut file = Self {
            store,
            allocator: FreeListAllocator::new(0, &[])?,
            chains: BTreeMap::new(),
            geometry,
            initial_capacity: config.initial_capacity,
            base_increment: (config.initial_capacity / 10).clamp(1, MAX_BASE_INCREMENT),
            read_only,
            poisoned: false,
            recovery: RecoveryReport::default(),
        };

        if fresh {
            file.format()?;
        } else {
            file.recovery = file.recover()?;
        }

        info!(
            file = file.store.name(),
            records = file.chains.len(),
            capacity = file.allocator.number_of_blocks(),
            read_only = file.read_only,
            "Opened data file"
        );
        Ok(file)
    }

    // --------------------------------------------------------------------------------------------
    // Read accessors
    // --------------------------------------------------------------------------------------------

    /// Geometry stored in the file header.
    pub fn geometry(&self) -> FileHeader {
        self.geometry
    }

    /// Payload bytes per block.
    pub fn allocation_unit(&self) -> u32 {
        self.geometry.allocation_unit
    }

    /// Whether the file rejects mutations.
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Whether an earlier I/O failure invalidated this handle.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Outcome of the recovery scan run at open (empty for new files).
    pub fn recovery_report(&self) -> &RecoveryReport {
        &self.recovery
    }

    /// Side file holding copies of corrupt blocks found at open, if any.
    pub fn invalid_blocks_path(&self) -> Option<&Path> {
        self.recovery.invalid_blocks_path.as_deref()
    }

    /// Every live start block, ascending.
    pub fn start_blocks(&self) -> Vec<u32> {
        self.chains.keys().copied().collect()
    }

    /// `true` when a live record starts at `start`.
    pub fn contains(&self, start: u32) -> bool {
        self.chains.contains_key(&start)
    }

    /// Logical size of the record starting at `start`.
    pub fn item_size(&self, start: u32) -> Option<u32> {
        self.chains.get(&start).map(|c| c.size)
    }

    /// Block indices of the record starting at `start`, in chain order.
    pub fn chain(&self, start: u32) -> Option<&[u32]> {
        self.chains.get(&start).map(|c| c.blocks.as_slice())
    }

    /// Number of live records.
    pub fn len(&self) -> usize {
        self.chains.len()
    }

    /// `true` when the file holds no records.
    pub fn is_empty(&self) -> bool {
        self.chains.is_empty()
    }

    /// Capacity and usage counters.
    pub fn stats(&self) -> DataFileStats {
        DataFileStats {
            block_capacity: self.allocator.number_of_blocks(),
            allocated_blocks: self.allocator.number_of_allocated_blocks(),
            record_count: self.chains.len(),
            bytes_stored: self.chains.values().map(|c| u64::from(c.size)).sum(),
        }
    }

    // --------------------------------------------------------------------------------------------
    // Record operations
    // --------------------------------------------------------------------------------------------

    /// Stores `data` as a new record and returns its start block.
    pub fn insert(&mut self, data: &[u8]) -> Result<u32, DataFileError> {
        self.check_writable()?;
        let size = Self::checked_size(data.len())?;
        let result = self.insert_inner(data, size);
        self.track(result)
    }

    /// Stores a zero-filled record of `len` bytes and returns its start block.
    pub fn insert_blank(&mut self, len: u32) -> Result<u32, DataFileError> {
        self.check_writable()?;
        Self::checked_size(len as usize)?;
        self.insert(&vec![0u8; len as usize])
    }

    /// Replaces the content of the record starting at `start`.
    ///
    /// The chain is truncated or extended to fit; the start block never moves.
    pub fn update(&mut self, start: u32, data: &[u8]) -> Result<(), DataFileError> {
        self.check_writable()?;
        let size = Self::checked_size(data.len())?;
        let result = self.update_inner(start, data, size);
        self.track(result)
    }

    /// Overwrites `data.len()` bytes of the record at `offset`.
    ///
    /// The patched range must lie within the current record size.
    pub fn update_partial(
        &mut self,
        start: u32,
        offset: u32,
        data: &[u8],
    ) -> Result<(), DataFileError> {
        self.check_writable()?;
        let result = self.update_partial_inner(start, offset, data);
        self.track(result)
    }

    /// Appends `data` to the end of the record starting at `start`.
    pub fn append(&mut self, start: u32, data: &[u8]) -> Result<(), DataFileError> {
        self.check_writable()?;
        let result = self.append_inner(start, data);
        self.track(result)
    }

    /// Appends `len` zero bytes to the record starting at `start`.
    pub fn append_blank(&mut self, start: u32, len: u32) -> Result<(), DataFileError> {
        self.check_writable()?;
        let current = self.chain_entry(start)?.size;
        Self::checked_size(current as usize + len as usize)?;
        self.append(start, &vec![0u8; len as usize])
    }

    /// Removes the last `remove` bytes of the record starting at `start`.
    ///
    /// The record keeps at least its start block, even when shrunk to zero bytes.
    pub fn delete_partial_tail(&mut self, start: u32, remove: u32) -> Result<(), DataFileError> {
        self.check_writable()?;
        let result = self.delete_partial_tail_inner(start, remove);
        self.track(result)
    }

    /// Deletes the record starting at `start` and frees all of its blocks.
    pub fn delete(&mut self, start: u32) -> Result<(), DataFileError> {
        self.check_writable()?;
        let result = self.delete_inner(start);
        self.track(result)
    }

    /// Reads the whole record starting at `start`.
    pub fn read(&mut self, start: u32) -> Result<Vec<u8>, DataFileError> {
        self.check_usable()?;
        let size = self.chain_entry(start)?.size;
        let result = self.read_range(start, 0, size);
        self.track(result)
    }

    /// Reads `len` bytes of the record starting at `start`, from `offset`.
    ///
    /// Only the blocks covering the requested range are read.
    pub fn read_partial(
        &mut self,
        start: u32,
        offset: u32,
        len: u32,
    ) -> Result<Vec<u8>, DataFileError> {
        self.check_usable()?;
        let result = self.read_range(start, offset, len);
        self.track(result)
    }

    /// Deletes every record and reformats the file to its initial capacity.
    pub fn clear_all(&mut self) -> Result<(), DataFileError> {
        self.check_writable()?;
        let result = self.format();
        info!(file = self.store.name(), "Cleared data file");
        self.track(result)
    }

    // --------------------------------------------------------------------------------------------
    // Medium accessors
    // --------------------------------------------------------------------------------------------

    /// Forces buffered writes to the storage medium.
    pub fn flush(&mut self) -> Result<(), DataFileError> {
        self.check_usable()?;
        let result = self.store.flush().map_err(DataFileError::from);
        self.track(result)
    }

    /// Modification time of the medium.
    pub fn last_modified(&self) -> Result<SystemTime, DataFileError> {
        Ok(self.store.last_modified()?)
    }

    /// Time of the last write issued through this handle.
    pub fn last_write(&self) -> SystemTime {
        self.store.last_write()
    }

    /// `true` when something else changed the medium after our last write.
    pub fn is_modified_externally(&self) -> Result<bool, DataFileError> {
        Ok(self.store.is_modified_externally()?)
    }

    /// Flushes and closes the underlying store.
    pub fn close(mut self) -> Result<(), DataFileError> {
        self.store.close()?;
        info!(file = self.store.name(), "Closed data file");
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Internal helpers
    // --------------------------------------------------------------------------------------------

    fn check_usable(&self) -> Result<(), DataFileError> {
        if self.poisoned {
            return Err(DataFileError::Poisoned);
        }
        Ok(())
    }

    fn check_writable(&self) -> Result<(), DataFileError> {
        self.check_usable()?;
        if self.read_only {
            return Err(DataFileError::ReadOnly);
        }
        Ok(())
    }

    /// Poisons the handle when `result` carries a fatal error.
    fn track<T>(&mut self, result: Result<T, DataFileError>) -> Result<T, DataFileError> {
        if let Err(e) = &result {
            if e.is_fatal() && !self.poisoned {
                error!(file = self.store.name(), "Data file poisoned: {e}");
                self.poisoned = true;
            }
        }
        result
    }

    fn checked_size(len: usize) -> Result<u32, DataFileError> {
        u32::try_from(len)
            .ok()
            .filter(|&size| size <= i32::MAX as u32)
            .ok_or_else(|| {
                DataFileError::InvalidArgument(format!("record of {len} bytes exceeds i32::MAX"))
            })
    }

    fn unit(&self) -> usize {
        self.geometry.allocation_unit as usize
    }

    /// Blocks needed for `size` bytes; a record always owns at least one block.
    fn blocks_needed(&self, size: u32) -> usize {
        (size as usize).div_ceil(self.unit()).max(1)
    }

    fn chain_entry(&self, start: u32) -> Result<&Chain, DataFileError> {
        self.chains
            .get(&start)
            .ok_or(DataFileError::UnknownStartBlock(start))
    }

    /// Header of the block at position `pos` of `chain`.
    fn header_at(chain: &[u32], pos: usize, size: u32) -> BlockHeader {
        let next = chain.get(pos + 1).copied();
        if pos == 0 {
            BlockHeader::start(size, next)
        } else {
            BlockHeader::follow(next)
        }
    }

    /// Encodes every block of `chain` with `data` laid out from the start.
    fn encode_chain(&self, chain: &[u32], size: u32, data: &[u8]) -> Result<Vec<u8>, DataFileError> {
        let unit = self.unit();
        let mut buf = Vec::with_capacity(chain.len() * self.geometry.block_size());
        for pos in 0..chain.len() {
            let lo = (pos * unit).min(data.len());
            let hi = ((pos + 1) * unit).min(data.len());
            let header = Self::header_at(chain, pos, size);
            buf.extend(format::encode_block(&header, &data[lo..hi], &self.geometry)?);
        }
        Ok(buf)
    }

    /// Rewrites only the header of the block at `pos`.
    fn write_header(&mut self, chain: &[u32], pos: usize, size: u32) -> Result<(), DataFileError> {
        let bytes = Self::header_at(chain, pos, size).to_bytes()?;
        self.store.write_partial_block(chain[pos], 0, &bytes)?;
        Ok(())
    }

    /// Allocates `count` blocks, growing the file first when needed.
    fn allocate(&mut self, count: usize) -> Result<Vec<u32>, DataFileError> {
        self.ensure_free_blocks(count)?;
        let blocks = self.allocator.allocate_blocks(count);
        if blocks.len() != count {
            // Internal consistency failure: capacity was grown to fit `count`.
            panic!(
                "allocator returned {} of {} requested blocks in {}",
                blocks.len(),
                count,
                self.store.name()
            );
        }
        Ok(blocks)
    }

    /// Marks `blocks` free on disk and in the allocator.
    fn release(&mut self, blocks: &[u32]) -> Result<(), DataFileError> {
        let free = BlockHeader::FREE.to_bytes()?;
        for &block in blocks {
            self.store.write_partial_block(block, 0, &free)?;
        }
        self.allocator.deallocate_blocks(blocks);
        Ok(())
    }

    /// Writes `data` at byte `offset` of `chain`.
    ///
    /// Positions `>= fresh_from` are newly allocated blocks and are written
    /// whole (before any existing block is touched); existing blocks are
    /// patched in place, or re-encoded whole when data checksums are on.
    fn write_range(
        &mut self,
        chain: &[u32],
        size: u32,
        offset: usize,
        data: &[u8],
        fresh_from: usize,
    ) -> Result<(), DataFileError> {
        if data.is_empty() {
            return Ok(());
        }
        let unit = self.unit();
        let end = offset + data.len();
        let first_pos = offset / unit;
        let last_pos = (end - 1) / unit;

        let piece = move |pos: usize| {
            let block_start = pos * unit;
            let lo = offset.max(block_start);
            let hi = end.min(block_start + unit);
            (lo - block_start, &data[lo - offset..hi - offset])
        };

        let fresh: Vec<usize> = (first_pos.max(fresh_from)..=last_pos).collect();
        if !fresh.is_empty() {
            let mut indices = Vec::with_capacity(fresh.len());
            let mut buf = Vec::with_capacity(fresh.len() * self.geometry.block_size());
            for &pos in &fresh {
                let (_, bytes) = piece(pos);
                let header = Self::header_at(chain, pos, size);
                buf.extend(format::encode_block(&header, bytes, &self.geometry)?);
                indices.push(chain[pos]);
            }
            self.store.write_blocks(&indices, &buf)?;
        }

        for pos in (first_pos..=last_pos).take_while(|&pos| pos < fresh_from) {
            let (in_block, bytes) = piece(pos);
            let block = chain[pos];
            if self.geometry.data_checksums {
                let mut raw = self.store.read_block(block)?;
                let at = BLOCK_HEADER_SIZE + in_block;
                raw[at..at + bytes.len()].copy_from_slice(bytes);
                let payload = format::block_payload(&raw, &self.geometry);
                let header = Self::header_at(chain, pos, size);
                let encoded = format::encode_block(&header, payload, &self.geometry)?;
                self.store.write_block(block, &encoded)?;
            } else {
                self.store
                    .write_partial_block(block, BLOCK_HEADER_SIZE + in_block, bytes)?;
            }
        }
        Ok(())
    }

    fn insert_inner(&mut self, data: &[u8], size: u32) -> Result<u32, DataFileError> {
        let blocks = self.allocate(self.blocks_needed(size))?;
        let buf = self.encode_chain(&blocks, size, data)?;
        self.store.write_blocks(&blocks, &buf)?;

        let start = blocks[0];
        trace!(file = self.store.name(), start, size, blocks = blocks.len(), "Inserted record");
        self.chains.insert(start, Chain { blocks, size });
        Ok(start)
    }

    fn update_inner(&mut self, start: u32, data: &[u8], size: u32) -> Result<(), DataFileError> {
        let mut chain = self.chain_entry(start)?.blocks.clone();
        let old_len = chain.len();
        let needed = self.blocks_needed(size);

        let surplus = if needed < chain.len() {
            chain.split_off(needed)
        } else {
            if needed > chain.len() {
                let extra = self.allocate(needed - chain.len())?;
                chain.extend(extra);
            }
            Vec::new()
        };

        let buf = self.encode_chain(&chain, size, data)?;
        if chain.len() > old_len {
            // New tail first, then the kept blocks back to front: the start
            // block only links the grown chain once every link target exists.
            let block_size = self.geometry.block_size();
            self.store
                .write_blocks(&chain[old_len..], &buf[old_len * block_size..])?;
            for pos in (0..old_len).rev() {
                let bytes = &buf[pos * block_size..(pos + 1) * block_size];
                self.store.write_block(chain[pos], bytes)?;
            }
        } else {
            // Start block first: its size drops before the chain is cut.
            self.store.write_blocks(&chain, &buf)?;
        }
        self.release(&surplus)?;

        trace!(file = self.store.name(), start, size, blocks = chain.len(), "Updated record");
        self.chains.insert(start, Chain { blocks: chain, size });
        if !surplus.is_empty() {
            self.maybe_shrink()?;
        }
        Ok(())
    }

    fn update_partial_inner(
        &mut self,
        start: u32,
        offset: u32,
        data: &[u8],
    ) -> Result<(), DataFileError> {
        let entry = self.chain_entry(start)?.clone();
        let end = u64::from(offset) + data.len() as u64;
        if end > u64::from(entry.size) {
            return Err(DataFileError::InvalidArgument(format!(
                "patch of {} bytes at offset {offset} exceeds record size {}",
                data.len(),
                entry.size
            )));
        }
        let fresh_from = entry.blocks.len();
        self.write_range(&entry.blocks, entry.size, offset as usize, data, fresh_from)
    }

    fn append_inner(&mut self, start: u32, data: &[u8]) -> Result<(), DataFileError> {
        let entry = self.chain_entry(start)?.clone();
        if data.is_empty() {
            return Ok(());
        }
        let new_size = Self::checked_size(entry.size as usize + data.len())?;
        let needed = self.blocks_needed(new_size);

        let mut chain = entry.blocks;
        let old_last = chain.len() - 1;
        if needed > chain.len() {
            let extra = self.allocate(needed - chain.len())?;
            chain.extend(extra);
        }

        // New blocks first, then the relink of the old tail, then the size.
        self.write_range(&chain, new_size, entry.size as usize, data, old_last + 1)?;
        if old_last + 1 < chain.len() && old_last != 0 {
            self.write_header(&chain, old_last, new_size)?;
        }
        self.write_header(&chain, 0, new_size)?;

        trace!(file = self.store.name(), start, new_size, blocks = chain.len(), "Appended to record");
        self.chains.insert(start, Chain { blocks: chain, size: new_size });
        Ok(())
    }

    fn delete_partial_tail_inner(&mut self, start: u32, remove: u32) -> Result<(), DataFileError> {
        let entry = self.chain_entry(start)?.clone();
        if remove > entry.size {
            return Err(DataFileError::InvalidArgument(format!(
                "cannot remove {remove} bytes from a record of {} bytes",
                entry.size
            )));
        }
        let new_size = entry.size - remove;
        let needed = self.blocks_needed(new_size);

        let mut chain = entry.blocks;
        let surplus = if needed < chain.len() {
            chain.split_off(needed)
        } else {
            Vec::new()
        };

        // Lower the size first, then cut the chain, then free the tail.
        self.write_header(&chain, 0, new_size)?;
        let last = chain.len() - 1;
        if !surplus.is_empty() && last != 0 {
            self.write_header(&chain, last, new_size)?;
        }
        self.release(&surplus)?;

        trace!(file = self.store.name(), start, new_size, blocks = chain.len(), "Truncated record");
        self.chains.insert(start, Chain { blocks: chain, size: new_size });
        if !surplus.is_empty() {
            self.maybe_shrink()?;
        }
        Ok(())
    }

    fn delete_inner(&mut self, start: u32) -> Result<(), DataFileError> {
        let entry = self.chain_entry(start)?.clone();
        self.release(&entry.blocks)?;
        self.chains.remove(&start);
        trace!(file = self.store.name(), start, blocks = entry.blocks.len(), "Deleted record");
        self.maybe_shrink()
    }

    fn read_range(&mut self, start: u32, offset: u32, len: u32) -> Result<Vec<u8>, DataFileError> {
        let entry = self.chain_entry(start)?;
        let end = u64::from(offset) + u64::from(len);
        if end > u64::from(entry.size) {
            return Err(DataFileError::InvalidArgument(format!(
                "read of {len} bytes at offset {offset} exceeds record size {}",
                entry.size
            )));
        }
        if len == 0 {
            return Ok(Vec::new());
        }

        let unit = self.unit();
        let offset = offset as usize;
        let len = len as usize;
        let first = offset / unit;
        let last = (offset + len - 1) / unit;
        let blocks = entry.blocks[first..=last].to_vec();

        let raw = self.store.read_blocks(&blocks)?;
        let mut payload = Vec::with_capacity(blocks.len() * unit);
        for block in raw.chunks_exact(self.geometry.block_size()) {
            payload.extend_from_slice(format::block_payload(block, &self.geometry));
        }
        let skip = offset - first * unit;
        Ok(payload[skip..skip + len].to_vec())
    }

    /// Drops every record and resets the medium to `initial_capacity` free blocks.
    fn format(&mut self) -> Result<(), DataFileError> {
        self.chains.clear();
        self.allocator.deallocate_all_blocks();
        self.allocator.set_size(0)?;
        self.store.set_block_capacity(0)?;
        self.store.set_block_capacity(self.initial_capacity)?;
        self.allocator.set_size(self.initial_capacity)?;
        debug!(file = self.store.name(), capacity = self.initial_capacity, "Formatted data file");
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Capacity policy
    // --------------------------------------------------------------------------------------------

    fn growth_increment(&self) -> u32 {
        self.base_increment
            .max(self.allocator.number_of_blocks() / 10)
    }

    fn ensure_free_blocks(&mut self, needed: usize) -> Result<(), DataFileError> {
        let free = self.allocator.free_blocks() as usize;
        if free >= needed {
            return Ok(());
        }
        let capacity = self.allocator.number_of_blocks();
        let required = u64::from(capacity) + (needed - free) as u64;
        if required > u64::from(MAX_BLOCKS) {
            return Err(DataFileError::InvalidArgument(format!(
                "{needed} more blocks would exceed the {MAX_BLOCKS}-block limit"
            )));
        }
        let target = (required as u32)
            .max(capacity.saturating_add(self.growth_increment()))
            .min(MAX_BLOCKS);
        self.resize(target)
    }

    fn maybe_shrink(&mut self) -> Result<(), DataFileError> {
        let capacity = self.allocator.number_of_blocks();
        let in_use = self.allocator.space_in_use();
        if u64::from(in_use) * 2 < u64::from(capacity) {
            let target = in_use.max(self.initial_capacity);
            if target < capacity {
                self.resize(target)?;
            }
        }
        Ok(())
    }

    fn resize(&mut self, target: u32) -> Result<(), DataFileError> {
        let current = self.allocator.number_of_blocks();
        if target > current {
            self.store.set_block_capacity(target)?;
            self.allocator.set_size(target)?;
        } else if target < current {
            self.allocator.set_size(target)?;
            self.store.set_block_capacity(target)?;
        }
        debug!(file = self.store.name(), from = current, to = target, "Resized data file");
        Ok(())
    }
}
