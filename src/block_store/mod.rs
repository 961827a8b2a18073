//! Fixed-size block I/O.
//!
//! The [`BlockStore`] trait is the lowest layer of a data file: it reads and
//! writes whole blocks (or a byte range inside one block) by index, and
//! grows or shrinks the number of blocks the medium holds. It knows nothing
//! about block headers, chains or checksums.
//!
//! [`FileBlockStore`] implements the trait over a [`RandomAccessFile`].
//!
//! # On-disk layout
//!
//! ```text
//! [PRELUDE (data_offset bytes)][BLOCK 0][BLOCK 1]...[BLOCK capacity-1]
//! ```
//!
//! The prelude is owned by the caller (the data-file header lives there);
//! block `i` starts at `data_offset + i * block_size`.


use std::{
    fs::{File, OpenOptions},
    io::{self, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    time::SystemTime,
};

use thiserror::Error;
use tracing::{debug, error, trace};

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by block store operations.
#[derive(Debug, Error)]
pub enum BlockStoreError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Block index outside the current capacity.
    #[error("block {index} out of range (capacity {capacity})")]
    OutOfRange {
        /// Requested block index.
        index: u32,
        /// Current block capacity.
        capacity: u32,
    },

    /// Buffer length does not match the requested block range.
    #[error("invalid buffer: {0}")]
    InvalidBuffer(String),

    /// Write attempted on a store opened read-only.
    #[error("block store is read-only")]
    ReadOnly,
}

// ------------------------------------------------------------------------------------------------
// Traits
// ------------------------------------------------------------------------------------------------

/// Random-access storage of equally sized blocks.
pub trait BlockStore: Send {
    /// Size of every block in bytes.
    fn block_size(&self) -> usize;

    /// Number of blocks the medium currently holds.
    fn block_capacity(&self) -> u32;

    /// Grows or shrinks the medium to exactly `capacity` blocks.
    ///
    /// Newly added blocks read back as zeros.
    fn set_block_capacity(&mut self, capacity: u32) -> Result<(), BlockStoreError>;

    /// Reads one whole block.
    fn read_block(&mut self, index: u32) -> Result<Vec<u8>, BlockStoreError>;

    /// Reads the given blocks and returns them concatenated in the order requested.
    fn read_blocks(&mut self, indices: &[u32]) -> Result<Vec<u8>, BlockStoreError>;

    /// Writes one whole block.
    fn write_block(&mut self, index: u32, data: &[u8]) -> Result<(), BlockStoreError>;

    /// Writes `data` (exactly `indices.len()` blocks, concatenated) to the given blocks.
    fn write_blocks(&mut self, indices: &[u32], data: &[u8]) -> Result<(), BlockStoreError>;

    /// Writes `data` into block `index` starting at `offset_in_block`.
    fn write_partial_block(
        &mut self,
        index: u32,
        offset_in_block: usize,
        data: &[u8],
    ) -> Result<(), BlockStoreError>;

    /// Absolute byte offset of block `index` on the medium.
    fn block_start_offset(&self, index: u32) -> u64;

    /// Forces buffered writes down to the storage medium.
    fn flush(&mut self) -> Result<(), BlockStoreError>;

    /// Modification time reported by the medium.
    fn last_modified(&self) -> Result<SystemTime, BlockStoreError>;

    /// Time of the last write issued through this handle (or the open time).
    fn last_write(&self) -> SystemTime;

    /// `true` when the medium changed after the last write through this handle.
    fn is_modified_externally(&self) -> Result<bool, BlockStoreError>;

    /// Human-readable name of the medium (the file path for file stores).
    fn name(&self) -> &str;

    /// Whether the store rejects writes.
    fn is_read_only(&self) -> bool;

    /// Flushes and releases the medium. The store must not be used afterwards.
    fn close(&mut self) -> Result<(), BlockStoreError>;
}

// ------------------------------------------------------------------------------------------------
// RandomAccessFile
// ------------------------------------------------------------------------------------------------

/// A file handle addressed by absolute offsets.
#[derive(Debug)]
pub struct RandomAccessFile {
    file: File,
    path: PathBuf,
    name: String,
    read_only: bool,
    is_new: bool,
}

impl RandomAccessFile {
    /// Opens `path`, creating it when `read_only` is false and it does not exist.
    ///
    /// A file is considered *new* when it was empty at open time.
    pub fn open(path: impl AsRef<Path>, read_only: bool) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = if read_only {
            OpenOptions::new().read(true).open(&path)?
        } else {
            OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&path)?
        };
        let is_new = file.metadata()?.len() == 0;

        Ok(Self {
            file,
            name: path.display().to_string(),
            path,
            read_only,
            is_new,
        })
    }

    /// Fills `buf` from `offset`, failing on a short read.
    pub fn read_fully(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(buf)
    }

    /// Writes all of `data` at `offset`.
    pub fn write(&mut self, offset: u64, data: &[u8]) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data)
    }

    /// Current file length in bytes.
    pub fn length(&self) -> io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    /// Truncates or zero-extends the file to `len` bytes.
    pub fn set_length(&mut self, len: u64) -> io::Result<()> {
        self.file.set_len(len)
    }

    /// `true` when the file was empty at open time.
    pub fn is_new(&self) -> bool {
        self.is_new
    }

    /// Whether the file was opened read-only.
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Display name (the path as given).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Path the file was opened from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Modification time from the file metadata.
    pub fn modified(&self) -> io::Result<SystemTime> {
        self.file.metadata()?.modified()
    }

    /// Flushes file data to the device.
    pub fn sync_data(&self) -> io::Result<()> {
        self.file.sync_data()
    }

    /// Flushes file data and metadata to the device.
    pub fn sync_all(&self) -> io::Result<()> {
        self.file.sync_all()
    }
}

// ------------------------------------------------------------------------------------------------
// FileBlockStore
// ------------------------------------------------------------------------------------------------

/// [`BlockStore`] backed by a single file.
#[derive(Debug)]
pub struct FileBlockStore {
    file: RandomAccessFile,
    block_size: usize,
    data_offset: u64,
    capacity: u32,
    last_write: SystemTime,
    closed: bool,
}

impl FileBlockStore {
    /// Wraps `file`, treating everything after `data_offset` as blocks of
    /// `block_size` bytes.
    ///
    /// The capacity is derived from the file length; a trailing partial
    /// block is ignored and dropped on the next capacity change.
    pub fn new(
        file: RandomAccessFile,
        block_size: usize,
        data_offset: u64,
    ) -> Result<Self, BlockStoreError> {
        if block_size == 0 {
            return Err(BlockStoreError::InvalidBuffer(
                "block size must be non-zero".into(),
            ));
        }

        let len = file.length()?;
        let capacity = u32::try_from(len.saturating_sub(data_offset) / block_size as u64)
            .map_err(|_| BlockStoreError::InvalidBuffer(format!("file too large: {len} bytes")))?;
        let last_write = file.modified().unwrap_or_else(|_| SystemTime::now());

        debug!(
            file = file.name(),
            block_size, capacity, "opened block store"
        );

        Ok(Self {
            file,
            block_size,
            data_offset,
            capacity,
            last_write,
            closed: false,
        })
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        self.file.path()
    }

    fn check_index(&self, index: u32) -> Result<(), BlockStoreError> {
        if index >= self.capacity {
            return Err(BlockStoreError::OutOfRange {
                index,
                capacity: self.capacity,
            });
        }
        Ok(())
    }

    fn check_writable(&self) -> Result<(), BlockStoreError> {
        if self.file.is_read_only() {
            return Err(BlockStoreError::ReadOnly);
        }
        Ok(())
    }

    fn touch(&mut self) {
        self.last_write = SystemTime::now();
    }

    /// Splits `indices` into runs of consecutive block indices, returned as
    /// `(position in indices, first block, run length)`.
    fn runs(indices: &[u32]) -> Vec<(usize, u32, usize)> {
        let mut runs = Vec::new();
        let mut pos = 0;
        while pos < indices.len() {
            let first = indices[pos];
            let mut len = 1;
            while pos + len < indices.len() && indices[pos + len] == first.wrapping_add(len as u32) {
                len += 1;
            }
            runs.push((pos, first, len));
            pos += len;
        }
        runs
    }
}

impl BlockStore for FileBlockStore {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn block_capacity(&self) -> u32 {
        self.capacity
    }

    fn set_block_capacity(&mut self, capacity: u32) -> Result<(), BlockStoreError> {
        self.check_writable()?;
        let len = self.data_offset + u64::from(capacity) * self.block_size as u64;
        self.file.set_length(len)?;
        trace!(file = self.file.name(), from = self.capacity, to = capacity, "resized block store");
        self.capacity = capacity;
        self.touch();
        Ok(())
    }

    fn read_block(&mut self, index: u32) -> Result<Vec<u8>, BlockStoreError> {
        self.check_index(index)?;
        let offset = self.block_start_offset(index);
        let mut buf = vec![0u8; self.block_size];
        self.file.read_fully(offset, &mut buf)?;
        Ok(buf)
    }

    fn read_blocks(&mut self, indices: &[u32]) -> Result<Vec<u8>, BlockStoreError> {
        for &index in indices {
            self.check_index(index)?;
        }
        let mut buf = vec![0u8; indices.len() * self.block_size];
        for (pos, first, len) in Self::runs(indices) {
            let start = pos * self.block_size;
            let end = start + len * self.block_size;
            let offset = self.block_start_offset(first);
            self.file.read_fully(offset, &mut buf[start..end])?;
        }
        Ok(buf)
    }

    fn write_block(&mut self, index: u32, data: &[u8]) -> Result<(), BlockStoreError> {
        self.write_blocks(&[index], data)
    }

    fn write_blocks(&mut self, indices: &[u32], data: &[u8]) -> Result<(), BlockStoreError> {
        self.check_writable()?;
        if data.len() != indices.len() * self.block_size {
            return Err(BlockStoreError::InvalidBuffer(format!(
                "{} bytes supplied for {} blocks of {} bytes",
                data.len(),
                indices.len(),
                self.block_size
            )));
        }
        for &index in indices {
            self.check_index(index)?;
        }
        for (pos, first, len) in Self::runs(indices) {
            let start = pos * self.block_size;
            let end = start + len * self.block_size;
            let offset = self.block_start_offset(first);
            self.file.write(offset, &data[start..end])?;
        }
        self.touch();
        Ok(())
    }

    fn write_partial_block(
        &mut self,
        index: u32,
        offset_in_block: usize,
        data: &[u8],
    ) -> Result<(), BlockStoreError> {
        self.check_writable()?;
        self.check_index(index)?;
        if offset_in_block + data.len() > self.block_size {
            return Err(BlockStoreError::InvalidBuffer(format!(
                "partial write of {} bytes at {} overflows block of {} bytes",
                data.len(),
                offset_in_block,
                self.block_size
            )));
        }
        let offset = self.block_start_offset(index) + offset_in_block as u64;
        self.file.write(offset, data)?;
        self.touch();
        Ok(())
    }

    fn block_start_offset(&self, index: u32) -> u64 {
        self.data_offset + u64::from(index) * self.block_size as u64
    }

    fn flush(&mut self) -> Result<(), BlockStoreError> {
        if !self.file.is_read_only() {
            self.file.sync_data()?;
        }
        Ok(())
    }

    fn last_modified(&self) -> Result<SystemTime, BlockStoreError> {
        Ok(self.file.modified()?)
    }

    fn last_write(&self) -> SystemTime {
        self.last_write
    }

    fn is_modified_externally(&self) -> Result<bool, BlockStoreError> {
        Ok(self.file.modified()? > self.last_write)
    }

    fn name(&self) -> &str {
        self.file.name()
    }

    fn is_read_only(&self) -> bool {
        self.file.is_read_only()
    }

    fn close(&mut self) -> Result<(), BlockStoreError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if !self.file.is_read_only() {
            self.file.sync_all()?;
        }
        debug!(file = self.file.name(), "closed block store");
        Ok(())
    }
}

impl Drop for FileBlockStore {
    fn drop(&mut self) {
        if !self.closed && !self.file.is_read_only() {
            if let Err(e) = self.file.sync_all() {
                error!("Failed to sync block store {} on drop: {}", self.file.name(), e);
            }
        }
    }
}
