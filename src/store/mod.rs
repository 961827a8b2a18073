//! # Keyed Record Store
//!
//! Maps string keys to variable-length payloads using two
//! [`ChainedDataFile`]s:
//!
//! ```text
//! KeyedRecordStore
//!   ├── index file   one LocationRecord per key  (key, data location, timestamp)
//!   ├── data file    one payload record per key
//!   └── keys         BTreeMap<key, LocationRecord>   (rebuilt at open)
//! ```
//!
//! The in-memory map is the only lookup structure while the store is open;
//! the index file exists so the map can be rebuilt on the next open.
//!
//! ## Write ordering
//!
//! A new key writes its payload before its index record; a delete removes
//! the index record before the payload. Replacing the payload of an existing
//! key keeps its start block, and the data file keeps that chain valid
//! across an interrupted write. An interrupted call therefore leaves at most
//! an unreferenced payload behind, which reconciliation deletes.
//!
//! ## Reconciliation
//!
//! On open, every index record is decoded and checked against the data
//! file (see `reconcile.rs`). Orphaned keys, duplicate keys and unreferenced
//! payloads are logged and, in read/write mode, deleted.
//!
//! ## Concurrency
//!
//! All state lives behind one `Mutex`; every public method holds it for its
//! whole duration. The store is `Send + Sync` and can be shared via `Arc`.
//!
//! ## Closing
//!
//! [`KeyedRecordStore::close`] releases both files. Every later call fails
//! with [`StoreError::Closed`].

pub mod location;
mod reconcile;

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::{
    collections::BTreeMap,
    path::Path,
    sync::{Mutex, MutexGuard},
    time::{SystemTime, UNIX_EPOCH},
};

use thiserror::Error;
use tracing::{info, trace};

use crate::data_file::{ChainedDataFile, DataFileConfig, DataFileError, DataFileStats};
use crate::encoding::{self, EncodingError};
pub use location::LocationRecord;
pub use reconcile::ReconcileReport;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by [`KeyedRecordStore`] operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store has been closed.
    #[error("Store is closed")]
    Closed,

    /// Error from the index or data file.
    #[error("Data file error: {0}")]
    DataFile(#[from] DataFileError),

    /// Location record could not be encoded.
    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// Internal invariant violation (poisoned lock, unexpected state, etc.).
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Configuration
// ------------------------------------------------------------------------------------------------

/// Configuration of the two files behind a [`KeyedRecordStore`].
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Index file settings. Location records are small, so a small
    /// allocation unit keeps most of them in one block.
    pub index: DataFileConfig,

    /// Payload file settings.
    pub data: DataFileConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            index: DataFileConfig {
                allocation_unit_size: 64,
                ..DataFileConfig::default()
            },
            data: DataFileConfig::default(),
        }
    }
}

/// Order of the pairs returned by [`KeyedRecordStore::get_all`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GetAllOrder {
    /// Ascending key order.
    #[default]
    Key,
    /// Ascending timestamp, ties broken by key.
    Timestamp,
}

/// Snapshot returned by [`KeyedRecordStore::stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreStats {
    /// Number of keys.
    pub keys: usize,
    /// Index file counters.
    pub index: DataFileStats,
    /// Data file counters.
    pub data: DataFileStats,
}

/// Milliseconds since the Unix epoch, used when a call supplies no timestamp.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

/// `len` zero bytes, once a payload of `current + len` bytes is known to fit.
fn blank_payload(current: u32, len: u32) -> Result<Vec<u8>, StoreError> {
    if u64::from(current) + u64::from(len) > i32::MAX as u64 {
        return Err(DataFileError::InvalidArgument(format!(
            "payload of {current} + {len} bytes exceeds i32::MAX"
        ))
        .into());
    }
    Ok(vec![0u8; len as usize])
}

// ------------------------------------------------------------------------------------------------
// Store state
// ------------------------------------------------------------------------------------------------

/// Everything guarded by the store mutex.
struct StoreInner {
    index: ChainedDataFile,
    data: ChainedDataFile,
    keys: BTreeMap<String, LocationRecord>,
    report: ReconcileReport,
    read_only: bool,
}

impl StoreInner {
    fn check_writable(&self) -> Result<(), StoreError> {
        if self.read_only {
            return Err(DataFileError::ReadOnly.into());
        }
        Ok(())
    }

    /// Rewrites the index record of `record` in place.
    fn write_location(&mut self, record: &LocationRecord) -> Result<(), StoreError> {
        let bytes = encoding::encode_to_vec(record)?;
        self.index.update(record.index_location, &bytes)?;
        Ok(())
    }

    /// Adds a key that does not exist yet: payload first, then index record.
    fn insert_new(&mut self, key: &str, data: &[u8], timestamp: i64) -> Result<(), StoreError> {
        let mut record = LocationRecord::new(key, 0, timestamp);
        // The key must encode before either file is touched.
        encoding::encode_to_vec(&record)?;
        record.data_location = self.data.insert(data)?;
        let bytes = encoding::encode_to_vec(&record)?;
        record.index_location = self.index.insert(&bytes)?;
        trace!(key, index = record.index_location, data = record.data_location, "Inserted key");
        self.keys.insert(key.to_owned(), record);
        Ok(())
    }

    fn insert(&mut self, key: &str, data: &[u8], timestamp: i64) -> Result<(), StoreError> {
        self.check_writable()?;
        match self.keys.get(key).cloned() {
            Some(mut record) => {
                self.data.update(record.data_location, data)?;
                record.timestamp = timestamp;
                self.write_location(&record)?;
                self.keys.insert(key.to_owned(), record);
                Ok(())
            }
            None => self.insert_new(key, data, timestamp),
        }
    }

    fn append(&mut self, key: &str, data: &[u8]) -> Result<(), StoreError> {
        self.check_writable()?;
        match self.keys.get(key) {
            Some(record) => {
                let location = record.data_location;
                self.data.append(location, data)?;
                Ok(())
            }
            None => self.insert_new(key, data, now_millis()),
        }
    }

    fn delete(&mut self, key: &str) -> Result<bool, StoreError> {
        self.check_writable()?;
        let Some(record) = self.keys.get(key).cloned() else {
            return Ok(false);
        };
        self.index.delete(record.index_location)?;
        self.keys.remove(key);
        self.data.delete(record.data_location)?;
        trace!(key, "Deleted key");
        Ok(true)
    }

    fn get(&mut self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        match self.keys.get(key) {
            Some(record) => {
                let location = record.data_location;
                Ok(Some(self.data.read(location)?))
            }
            None => Ok(None),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// KeyedRecordStore
// ------------------------------------------------------------------------------------------------

/// Key-indexed payload store over an index file and a data file.
pub struct KeyedRecordStore {
    inner: Mutex<Option<StoreInner>>,
}

impl std::fmt::Debug for KeyedRecordStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let keys = self
            .inner
            .lock()
            .ok()
            .and_then(|guard| guard.as_ref().map(|inner| inner.keys.len()));
        f.debug_struct("KeyedRecordStore")
            .field("keys", &keys)
            .finish_non_exhaustive()
    }
}

impl KeyedRecordStore {
    /// Opens (or creates) the index and data files and reconciles them.
    ///
    /// Both files are opened read-only when either config asks for it.
    pub fn open(
        index_path: impl AsRef<Path>,
        data_path: impl AsRef<Path>,
        config: StoreConfig,
    ) -> Result<Self, StoreError> {
        let read_only = config.index.read_only || config.data.read_only;
        let index_config = DataFileConfig {
            read_only,
            ..config.index
        };
        let data_config = DataFileConfig {
            read_only,
            ..config.data
        };

        let index = ChainedDataFile::open(index_path.as_ref(), index_config)?;
        let data = ChainedDataFile::open(data_path.as_ref(), data_config)?;

        let mut inner = StoreInner {
            index,
            data,
            keys: BTreeMap::new(),
            report: ReconcileReport::default(),
            read_only,
        };
        inner.report = inner.reconcile()?;

        info!(
            index = %index_path.as_ref().display(),
            data = %data_path.as_ref().display(),
            keys = inner.keys.len(),
            read_only,
            "Opened keyed record store"
        );
        Ok(Self {
            inner: Mutex::new(Some(inner)),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Option<StoreInner>>, StoreError> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Internal("Mutex poisoned".into()))
    }

    /// Runs `f` on the open store state under the mutex.
    fn with_inner<T>(
        &self,
        f: impl FnOnce(&mut StoreInner) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut guard = self.lock()?;
        let inner = guard.as_mut().ok_or(StoreError::Closed)?;
        f(inner)
    }

    // --------------------------------------------------------------------------------------------
    // Write operations
    // --------------------------------------------------------------------------------------------

    /// Stores `data` under `key` with `timestamp`, replacing any existing payload.
    pub fn insert(&self, key: &str, data: &[u8], timestamp: i64) -> Result<(), StoreError> {
        self.with_inner(|inner| inner.insert(key, data, timestamp))
    }

    /// Stores `len` zero bytes under `key` with `timestamp`.
    pub fn insert_blank(&self, key: &str, len: u32, timestamp: i64) -> Result<(), StoreError> {
        let blank = blank_payload(0, len)?;
        self.insert(key, &blank, timestamp)
    }

    /// Replaces the payload of `key`, or inserts it when absent.
    ///
    /// The timestamp is set to the current time either way.
    pub fn update(&self, key: &str, data: &[u8]) -> Result<(), StoreError> {
        self.with_inner(|inner| inner.insert(key, data, now_millis()))
    }

    /// Overwrites part of the payload of `key` at `offset`.
    ///
    /// Returns `false` when the key does not exist.
    pub fn update_partial(&self, key: &str, data: &[u8], offset: u32) -> Result<bool, StoreError> {
        self.with_inner(|inner| {
            inner.check_writable()?;
            let Some(record) = inner.keys.get(key) else {
                return Ok(false);
            };
            let location = record.data_location;
            inner.data.update_partial(location, offset, data)?;
            Ok(true)
        })
    }

    /// Appends `data` to the payload of `key`, inserting the key when absent.
    pub fn append(&self, key: &str, data: &[u8]) -> Result<(), StoreError> {
        self.with_inner(|inner| inner.append(key, data))
    }

    /// Appends `len` zero bytes to the payload of `key`, inserting when absent.
    pub fn append_blank(&self, key: &str, len: u32) -> Result<(), StoreError> {
        self.with_inner(|inner| {
            let current = match inner.keys.get(key) {
                Some(record) => inner.data.item_size(record.data_location).unwrap_or(0),
                None => 0,
            };
            let blank = blank_payload(current, len)?;
            inner.append(key, &blank)
        })
    }

    /// Removes the last `remove` bytes of the payload of `key`.
    ///
    /// Returns `false` when the key does not exist.
    pub fn delete_partial_tail(&self, key: &str, remove: u32) -> Result<bool, StoreError> {
        self.with_inner(|inner| {
            inner.check_writable()?;
            let Some(record) = inner.keys.get(key) else {
                return Ok(false);
            };
            let location = record.data_location;
            inner.data.delete_partial_tail(location, remove)?;
            Ok(true)
        })
    }

    /// Deletes `key`, its index record and its payload.
    ///
    /// Returns `false` when the key does not exist.
    pub fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.with_inner(|inner| inner.delete(key))
    }

    /// Sets the timestamp of `key` without touching its payload.
    ///
    /// Returns `false` when the key does not exist.
    pub fn touch_timestamp(&self, key: &str, timestamp: i64) -> Result<bool, StoreError> {
        self.with_inner(|inner| {
            inner.check_writable()?;
            let Some(mut record) = inner.keys.get(key).cloned() else {
                return Ok(false);
            };
            record.timestamp = timestamp;
            inner.write_location(&record)?;
            inner.keys.insert(key.to_owned(), record);
            Ok(true)
        })
    }

    /// Deletes every key and reformats both files.
    pub fn clear_all(&self) -> Result<(), StoreError> {
        self.with_inner(|inner| {
            inner.check_writable()?;
            inner.keys.clear();
            inner.index.clear_all()?;
            inner.data.clear_all()?;
            info!("Cleared keyed record store");
            Ok(())
        })
    }

    // --------------------------------------------------------------------------------------------
    // Read operations
    // --------------------------------------------------------------------------------------------

    /// Payload of `key`, or `None` when absent.
    pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.with_inner(|inner| inner.get(key))
    }

    /// `len` payload bytes of `key` from `offset`, or `None` when absent.
    pub fn get_partial(
        &self,
        key: &str,
        offset: u32,
        len: u32,
    ) -> Result<Option<Vec<u8>>, StoreError> {
        self.with_inner(|inner| {
            let Some(record) = inner.keys.get(key) else {
                return Ok(None);
            };
            let location = record.data_location;
            Ok(Some(inner.data.read_partial(location, offset, len)?))
        })
    }

    /// Payloads of `keys`, position by position.
    pub fn get_multiple<K: AsRef<str>>(
        &self,
        keys: &[K],
    ) -> Result<Vec<Option<Vec<u8>>>, StoreError> {
        self.with_inner(|inner| keys.iter().map(|k| inner.get(k.as_ref())).collect())
    }

    /// Every key with its payload.
    pub fn get_all(&self, order: GetAllOrder) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        self.with_inner(|inner| {
            let mut records: Vec<LocationRecord> = inner.keys.values().cloned().collect();
            if order == GetAllOrder::Timestamp {
                records.sort_by_key(|r| r.timestamp);
            }
            let mut out = Vec::with_capacity(records.len());
            for record in records {
                let data = inner.data.read(record.data_location)?;
                out.push((record.key, data));
            }
            Ok(out)
        })
    }

    /// `true` when `key` exists.
    pub fn contains_key(&self, key: &str) -> Result<bool, StoreError> {
        self.with_inner(|inner| Ok(inner.keys.contains_key(key)))
    }

    /// Timestamp of `key`, or `None` when absent.
    pub fn timestamp(&self, key: &str) -> Result<Option<i64>, StoreError> {
        self.with_inner(|inner| Ok(inner.keys.get(key).map(|r| r.timestamp)))
    }

    /// Payload size of `key`, or `None` when absent.
    pub fn item_size(&self, key: &str) -> Result<Option<u32>, StoreError> {
        self.with_inner(|inner| {
            Ok(inner
                .keys
                .get(key)
                .and_then(|r| inner.data.item_size(r.data_location)))
        })
    }

    /// Location record of `key`, or `None` when absent.
    pub fn location(&self, key: &str) -> Result<Option<LocationRecord>, StoreError> {
        self.with_inner(|inner| Ok(inner.keys.get(key).cloned()))
    }

    /// All keys, ascending.
    pub fn keys(&self) -> Result<Vec<String>, StoreError> {
        self.with_inner(|inner| Ok(inner.keys.keys().cloned().collect()))
    }

    /// Number of keys.
    pub fn len(&self) -> Result<usize, StoreError> {
        self.with_inner(|inner| Ok(inner.keys.len()))
    }

    /// `true` when the store holds no keys.
    pub fn is_empty(&self) -> Result<bool, StoreError> {
        self.with_inner(|inner| Ok(inner.keys.is_empty()))
    }

    /// Key count and per-file counters.
    pub fn stats(&self) -> Result<StoreStats, StoreError> {
        self.with_inner(|inner| {
            Ok(StoreStats {
                keys: inner.keys.len(),
                index: inner.index.stats(),
                data: inner.data.stats(),
            })
        })
    }

    /// What reconciliation repaired when the store was opened.
    pub fn recovery_report(&self) -> Result<ReconcileReport, StoreError> {
        self.with_inner(|inner| Ok(inner.report.clone()))
    }

    // --------------------------------------------------------------------------------------------
    // Medium
    // --------------------------------------------------------------------------------------------

    /// Forces buffered writes of both files to the storage medium.
    pub fn flush(&self) -> Result<(), StoreError> {
        self.with_inner(|inner| {
            inner.index.flush()?;
            inner.data.flush()?;
            Ok(())
        })
    }

    /// Latest modification time of either file.
    pub fn last_modified(&self) -> Result<SystemTime, StoreError> {
        self.with_inner(|inner| {
            Ok(inner
                .index
                .last_modified()?
                .max(inner.data.last_modified()?))
        })
    }

    /// Time of the latest write issued through this store.
    pub fn last_write(&self) -> Result<SystemTime, StoreError> {
        self.with_inner(|inner| Ok(inner.index.last_write().max(inner.data.last_write())))
    }

    /// `true` when either file was changed by someone else after our last write.
    pub fn is_modified_externally(&self) -> Result<bool, StoreError> {
        self.with_inner(|inner| {
            Ok(inner.index.is_modified_externally()? || inner.data.is_modified_externally()?)
        })
    }

    /// Closes both files. Later calls fail with [`StoreError::Closed`];
    /// closing twice is harmless.
    pub fn close(&self) -> Result<(), StoreError> {
        let Some(inner) = self.lock()?.take() else {
            return Ok(());
        };
        let index_result = inner.index.close();
        inner.data.close()?;
        index_result?;
        info!("Closed keyed record store");
        Ok(())
    }
}
