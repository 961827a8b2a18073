//! # FileDB
//!
//! An embeddable, persistent key-to-payload store built from **chained
//! fixed-size blocks**. Each payload lives in a chain of checksummed blocks
//! inside a data file; a second file of the same format maps keys to those
//! chains.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use filedb::{FileDb, FileDbConfig};
//!
//! let db = FileDb::open("/tmp/my_db", "queue", FileDbConfig::default()).unwrap();
//!
//! // Write
//! db.insert("hello", b"world", 1).unwrap();
//! db.append("hello", b"!").unwrap();
//!
//! // Read
//! assert_eq!(db.get("hello").unwrap(), Some(b"world!".to_vec()));
//!
//! // Delete
//! db.delete("hello").unwrap();
//! assert_eq!(db.get("hello").unwrap(), None);
//!
//! db.close().unwrap();
//! ```
//!
//! ## Layers
//!
//! - [`block_store`]: fixed-size block I/O over a file.
//! - [`allocator`]: free/occupied tracking of block indices.
//! - [`data_file`]: variable-length records as block chains, with a
//!   checksum-verifying recovery scan on open.
//! - [`store`]: keys over an index file and a data file, reconciled on open.
//! - [`object`]: pluggable object codecs for typed payloads.
//!
//! ## Features
//!
//! - **CRC32 integrity:** every block header, and optionally every block
//!   payload, is checksummed.
//! - **Self-healing open:** corrupt blocks, broken chains, orphaned keys
//!   and unreferenced payloads are repaired and logged.
//! - **Partial I/O:** append, patch and truncate payloads without
//!   rewriting them.

pub mod allocator;
pub mod block_store;
pub mod data_file;
pub mod encoding;
pub mod object;
pub mod store;

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::SystemTime;

use thiserror::Error;
use tracing::{error, info};

use data_file::DataFileConfig;
use encoding::EncodingError;
use object::ObjectCodec;
use store::{KeyedRecordStore, StoreConfig, StoreError};

pub use store::{GetAllOrder, ReconcileReport, StoreStats};

/// A single key-payload pair returned by [`FileDb::get_all`].
pub type KeyPayload = (String, Vec<u8>);

// ------------------------------------------------------------------------------------------------
// Configuration
// ------------------------------------------------------------------------------------------------

/// Configuration for a [`FileDb`] instance.
///
/// All fields have sensible defaults via [`FileDbConfig::default()`].
/// The configuration is validated when passed to [`FileDb::open`].
/// Allocation units and the checksum flag only apply to newly created
/// files; existing files keep the geometry stored in their headers.
///
/// # Example
///
/// ```rust
/// use filedb::FileDbConfig;
///
/// let config = FileDbConfig {
///     data_allocation_unit_size: 1024,
///     ..FileDbConfig::default()
/// };
/// ```
#[derive(Debug, Clone)]
pub struct FileDbConfig {
    /// Payload bytes per block of the index file.
    ///
    /// Default: 64. Must be in `1..=16 MiB`.
    pub index_allocation_unit_size: u32,

    /// Payload bytes per block of the data file.
    ///
    /// Default: 256. Must be in `1..=16 MiB`.
    pub data_allocation_unit_size: u32,

    /// Initial (and minimum) block count of the index file.
    ///
    /// Default: 64.
    pub initial_index_capacity: u32,

    /// Initial (and minimum) block count of the data file.
    ///
    /// Default: 64.
    pub initial_data_capacity: u32,

    /// Store a CRC32 footer over every block payload.
    ///
    /// Default: true.
    pub use_data_checksums: bool,

    /// Open both files without ever writing to them.
    ///
    /// Default: false.
    pub read_only: bool,
}

impl Default for FileDbConfig {
    fn default() -> Self {
        Self {
            index_allocation_unit_size: 64,
            data_allocation_unit_size: 256,
            initial_index_capacity: 64,
            initial_data_capacity: 64,
            use_data_checksums: true,
            read_only: false,
        }
    }
}

impl FileDbConfig {
    /// Validates all configuration parameters.
    ///
    /// Each file's settings are checked by [`DataFileConfig::validate`].
    fn validate(&self) -> Result<(), FileDbError> {
        let store = self.to_store_config();
        for (file, config) in [("index", &store.index), ("data", &store.data)] {
            config
                .validate()
                .map_err(|e| FileDbError::InvalidConfig(format!("{file} file: {e}")))?;
        }
        Ok(())
    }

    /// Converts to the configuration of the two underlying files.
    fn to_store_config(&self) -> StoreConfig {
        StoreConfig {
            index: DataFileConfig {
                allocation_unit_size: self.index_allocation_unit_size,
                initial_capacity: self.initial_index_capacity,
                use_data_checksums: self.use_data_checksums,
                read_only: self.read_only,
            },
            data: DataFileConfig {
                allocation_unit_size: self.data_allocation_unit_size,
                initial_capacity: self.initial_data_capacity,
                use_data_checksums: self.use_data_checksums,
                read_only: self.read_only,
            },
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors returned by [`FileDb`] operations.
#[derive(Debug, Error)]
pub enum FileDbError {
    /// The database has been closed.
    #[error("database is closed")]
    Closed,

    /// Invalid configuration parameter.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Invalid database name or other caller mistake.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A required key does not exist.
    #[error("key not found: {0}")]
    KeyNotFound(String),

    /// Object (de)serialization failed.
    #[error("object codec error: {0}")]
    Codec(#[from] EncodingError),

    /// Filesystem error outside the store files.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A store-internal error occurred.
    #[error("{0}")]
    Store(#[from] StoreError),
}

// ------------------------------------------------------------------------------------------------
// Database handle
// ------------------------------------------------------------------------------------------------

/// The main database handle.
///
/// Owns `<name>.index` and `<name>.data` inside one directory.
///
/// # Thread safety
///
/// `FileDb` is `Send + Sync`; every call runs under the store's single
/// mutex, so it can be shared across threads via `Arc<FileDb>`.
///
/// # Shutdown
///
/// Call [`FileDb::close`] for a graceful shutdown. If the handle is dropped
/// without calling `close`, the destructor closes the files and logs any
/// error.
pub struct FileDb {
    store: KeyedRecordStore,
    closed: AtomicBool,
}

impl std::fmt::Debug for FileDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileDb")
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl FileDb {
    /// Opens (or creates) the database `name` inside directory `dir`.
    ///
    /// In read/write mode the directory is created when missing. Existing
    /// files are recovered and reconciled before this returns; see
    /// [`FileDb::recovery_report`].
    ///
    /// # Errors
    ///
    /// Returns [`FileDbError::InvalidConfig`] if any configuration parameter
    /// is out of range, and [`FileDbError::InvalidArgument`] if `name` is
    /// empty or contains a path separator.
    pub fn open(
        dir: impl AsRef<Path>,
        name: &str,
        config: FileDbConfig,
    ) -> Result<Self, FileDbError> {
        config.validate()?;
        if name.is_empty() || name.contains(['/', '\\']) {
            return Err(FileDbError::InvalidArgument(format!(
                "invalid database name {name:?}"
            )));
        }

        let dir = dir.as_ref();
        if !config.read_only {
            std::fs::create_dir_all(dir)?;
        }
        let index_path = dir.join(format!("{name}.index"));
        let data_path = dir.join(format!("{name}.data"));
        let store = KeyedRecordStore::open(&index_path, &data_path, config.to_store_config())?;

        info!(dir = %dir.display(), name, read_only = config.read_only, "database opened");
        Ok(Self {
            store,
            closed: AtomicBool::new(false),
        })
    }

    /// Closes both files.
    ///
    /// Subsequent operations on this handle return [`FileDbError::Closed`].
    /// Calling `close` more than once is harmless.
    pub fn close(&self) -> Result<(), FileDbError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.store.close()?;
        info!("database closed");
        Ok(())
    }

    /// The underlying keyed store.
    pub fn store(&self) -> &KeyedRecordStore {
        &self.store
    }

    // --------------------------------------------------------------------------------------------
    // Write operations
    // --------------------------------------------------------------------------------------------

    /// Stores `data` under `key`, replacing any existing payload and timestamp.
    pub fn insert(&self, key: &str, data: &[u8], timestamp: i64) -> Result<(), FileDbError> {
        self.check_open()?;
        Ok(self.store.insert(key, data, timestamp)?)
    }

    /// Stores `len` zero bytes under `key`.
    pub fn insert_blank(&self, key: &str, len: u32, timestamp: i64) -> Result<(), FileDbError> {
        self.check_open()?;
        Ok(self.store.insert_blank(key, len, timestamp)?)
    }

    /// Replaces the payload of `key` (inserting it when absent) and sets its
    /// timestamp to now.
    pub fn update(&self, key: &str, data: &[u8]) -> Result<(), FileDbError> {
        self.check_open()?;
        Ok(self.store.update(key, data)?)
    }

    /// Overwrites payload bytes of `key` at `offset`. Returns `false` when
    /// the key does not exist.
    ///
    /// # Errors
    ///
    /// The patched range must lie within the current payload.
    pub fn update_partial(&self, key: &str, data: &[u8], offset: u32) -> Result<bool, FileDbError> {
        self.check_open()?;
        Ok(self.store.update_partial(key, data, offset)?)
    }

    /// Appends to the payload of `key`, inserting it when absent.
    pub fn append(&self, key: &str, data: &[u8]) -> Result<(), FileDbError> {
        self.check_open()?;
        Ok(self.store.append(key, data)?)
    }

    /// Appends `len` zero bytes to the payload of `key`, inserting it when absent.
    pub fn append_blank(&self, key: &str, len: u32) -> Result<(), FileDbError> {
        self.check_open()?;
        Ok(self.store.append_blank(key, len)?)
    }

    /// Drops the last `remove` payload bytes of `key`. Returns `false` when
    /// the key does not exist.
    pub fn delete_partial_tail(&self, key: &str, remove: u32) -> Result<bool, FileDbError> {
        self.check_open()?;
        Ok(self.store.delete_partial_tail(key, remove)?)
    }

    /// Deletes `key` and its payload. Returns `false` when the key does not exist.
    pub fn delete(&self, key: &str) -> Result<bool, FileDbError> {
        self.check_open()?;
        Ok(self.store.delete(key)?)
    }

    /// Sets the timestamp of `key`. Returns `false` when the key does not exist.
    pub fn touch_timestamp(&self, key: &str, timestamp: i64) -> Result<bool, FileDbError> {
        self.check_open()?;
        Ok(self.store.touch_timestamp(key, timestamp)?)
    }

    /// Deletes every key and shrinks both files to their initial capacity.
    pub fn clear_all(&self) -> Result<(), FileDbError> {
        self.check_open()?;
        Ok(self.store.clear_all()?)
    }

    // --------------------------------------------------------------------------------------------
    // Read operations
    // --------------------------------------------------------------------------------------------

    /// Retrieves the payload of `key`.
    ///
    /// Returns `Ok(None)` if the key does not exist.
    pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>, FileDbError> {
        self.check_open()?;
        Ok(self.store.get(key)?)
    }

    /// Retrieves `len` payload bytes of `key` starting at `offset`.
    pub fn get_partial(
        &self,
        key: &str,
        offset: u32,
        len: u32,
    ) -> Result<Option<Vec<u8>>, FileDbError> {
        self.check_open()?;
        Ok(self.store.get_partial(key, offset, len)?)
    }

    /// Retrieves the payloads of `keys`, position by position.
    pub fn get_multiple<K: AsRef<str>>(
        &self,
        keys: &[K],
    ) -> Result<Vec<Option<Vec<u8>>>, FileDbError> {
        self.check_open()?;
        Ok(self.store.get_multiple(keys)?)
    }

    /// Every key with its payload, in the requested order.
    pub fn get_all(&self, order: GetAllOrder) -> Result<Vec<KeyPayload>, FileDbError> {
        self.check_open()?;
        Ok(self.store.get_all(order)?)
    }

    /// `true` when `key` exists.
    pub fn contains_key(&self, key: &str) -> Result<bool, FileDbError> {
        self.check_open()?;
        Ok(self.store.contains_key(key)?)
    }

    /// Timestamp of `key`.
    pub fn timestamp(&self, key: &str) -> Result<Option<i64>, FileDbError> {
        self.check_open()?;
        Ok(self.store.timestamp(key)?)
    }

    /// Payload size of `key` in bytes.
    pub fn item_size(&self, key: &str) -> Result<Option<u32>, FileDbError> {
        self.check_open()?;
        Ok(self.store.item_size(key)?)
    }

    /// All keys, ascending.
    pub fn keys(&self) -> Result<Vec<String>, FileDbError> {
        self.check_open()?;
        Ok(self.store.keys()?)
    }

    /// Number of keys.
    pub fn len(&self) -> Result<usize, FileDbError> {
        self.check_open()?;
        Ok(self.store.len()?)
    }

    /// `true` when there are no keys.
    pub fn is_empty(&self) -> Result<bool, FileDbError> {
        self.check_open()?;
        Ok(self.store.is_empty()?)
    }

    /// Key count and per-file block counters.
    pub fn stats(&self) -> Result<StoreStats, FileDbError> {
        self.check_open()?;
        Ok(self.store.stats()?)
    }

    /// What reconciliation repaired when the database was opened.
    pub fn recovery_report(&self) -> Result<ReconcileReport, FileDbError> {
        self.check_open()?;
        Ok(self.store.recovery_report()?)
    }

    // --------------------------------------------------------------------------------------------
    // Object payloads
    // --------------------------------------------------------------------------------------------

    /// Serializes `value` with `codec` and stores it under `key`.
    pub fn insert_item<T, C: ObjectCodec<T>>(
        &self,
        codec: &mut C,
        key: &str,
        value: &T,
        timestamp: i64,
    ) -> Result<(), FileDbError> {
        self.check_open()?;
        let result = codec.serialize(value);
        codec.reset();
        Ok(self.store.insert(key, &result?, timestamp)?)
    }

    /// Serializes `value` with `codec` and appends it to the payload of
    /// `key`, building a multi-object payload.
    pub fn append_item<T, C: ObjectCodec<T>>(
        &self,
        codec: &mut C,
        key: &str,
        value: &T,
    ) -> Result<(), FileDbError> {
        self.check_open()?;
        let result = codec.serialize(value);
        codec.reset();
        Ok(self.store.append(key, &result?)?)
    }

    /// Deserializes the payload of `key` as a single object.
    pub fn get_item_as_object<T, C: ObjectCodec<T>>(
        &self,
        codec: &mut C,
        key: &str,
    ) -> Result<Option<T>, FileDbError> {
        self.check_open()?;
        let Some(bytes) = self.store.get(key)? else {
            return Ok(None);
        };
        let result = codec.deserialize(&bytes);
        codec.reset();
        Ok(Some(result?.0))
    }

    /// Like [`FileDb::get_item_as_object`], but a missing key is an error.
    pub fn get_item_as_object_required<T, C: ObjectCodec<T>>(
        &self,
        codec: &mut C,
        key: &str,
    ) -> Result<T, FileDbError> {
        self.get_item_as_object(codec, key)?
            .ok_or_else(|| FileDbError::KeyNotFound(key.to_string()))
    }

    /// Deserializes every object of a multi-object payload.
    ///
    /// With `lenient`, a corrupt trailing object is dropped instead of
    /// failing the whole read.
    pub fn get_item_as_objects<T, C: ObjectCodec<T>>(
        &self,
        codec: &mut C,
        key: &str,
        lenient: bool,
    ) -> Result<Option<Vec<T>>, FileDbError> {
        self.check_open()?;
        let Some(bytes) = self.store.get(key)? else {
            return Ok(None);
        };
        let result = object::decode_objects(codec, &bytes, lenient);
        codec.reset();
        Ok(Some(result?))
    }

    // --------------------------------------------------------------------------------------------
    // Medium
    // --------------------------------------------------------------------------------------------

    /// Forces buffered writes of both files to disk.
    pub fn flush(&self) -> Result<(), FileDbError> {
        self.check_open()?;
        Ok(self.store.flush()?)
    }

    /// Latest modification time of either file.
    pub fn last_modified(&self) -> Result<SystemTime, FileDbError> {
        self.check_open()?;
        Ok(self.store.last_modified()?)
    }

    /// Time of the latest write issued through this handle.
    pub fn last_write(&self) -> Result<SystemTime, FileDbError> {
        self.check_open()?;
        Ok(self.store.last_write()?)
    }

    /// `true` when either file changed on disk after this handle's last write.
    pub fn is_modified_externally(&self) -> Result<bool, FileDbError> {
        self.check_open()?;
        Ok(self.store.is_modified_externally()?)
    }

    // --------------------------------------------------------------------------------------------
    // Internal helpers
    // --------------------------------------------------------------------------------------------

    fn check_open(&self) -> Result<(), FileDbError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(FileDbError::Closed);
        }
        Ok(())
    }
}

impl Drop for FileDb {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::Acquire) {
            if let Err(e) = self.store.close() {
                error!("Failed to close database on drop: {e}");
            }
        }
    }
}
