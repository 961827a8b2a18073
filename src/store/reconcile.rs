//! Open-time reconciliation of the index file against the data file.
//!
//! 1. Every index record is decoded; undecodable records are dropped.
//! 2. A record whose data location is not a live start block in the data
//!    file is an orphaned key and is dropped.
//! 3. When two records carry the same key, the newer timestamp wins (the
//!    earlier index record wins a tie); the loser is dropped.
//! 4. A record whose data location is already held by a different key is
//!    dropped; the earlier claim keeps the payload.
//! 5. Data file records referenced by no surviving key are unreferenced.
//!
//! Dropped index records and unreferenced payloads are deleted in
//! read/write mode. Nothing here is an error for the caller; every anomaly
//! is logged and counted in the [`ReconcileReport`].

use std::collections::{BTreeMap, HashMap, HashSet};

use tracing::{info, warn};

use super::{LocationRecord, StoreError, StoreInner};

/// What reconciliation found (and, in read/write mode, repaired).
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Index start blocks whose record could not be decoded.
    pub unreadable_index_records: Vec<u32>,

    /// Keys dropped because their payload was missing.
    pub orphaned_keys: Vec<String>,

    /// Keys found in more than one index record.
    pub duplicate_keys: Vec<String>,

    /// Keys dropped because another key already referenced their payload.
    pub shared_payload_keys: Vec<String>,

    /// Data file start blocks no key referenced.
    pub unreferenced_payloads: Vec<u32>,
}

impl ReconcileReport {
    /// `true` when both files agreed.
    pub fn is_clean(&self) -> bool {
        self.unreadable_index_records.is_empty()
            && self.orphaned_keys.is_empty()
            && self.duplicate_keys.is_empty()
            && self.shared_payload_keys.is_empty()
            && self.unreferenced_payloads.is_empty()
    }
}

impl StoreInner {
    /// Rebuilds the key map from the index file and cleans up both files.
    pub(super) fn reconcile(&mut self) -> Result<ReconcileReport, StoreError> {
        let mut report = ReconcileReport::default();
        let mut keys: BTreeMap<String, LocationRecord> = BTreeMap::new();
        let mut dead_index: Vec<u32> = Vec::new();
        let mut claims: HashMap<u32, String> = HashMap::new();

        for start in self.index.start_blocks() {
            let bytes = self.index.read(start)?;
            let record = match LocationRecord::decode_at(start, &bytes) {
                Ok(record) => record,
                Err(e) => {
                    warn!(index_block = start, "Unreadable index record: {e}");
                    report.unreadable_index_records.push(start);
                    dead_index.push(start);
                    continue;
                }
            };

            if !self.data.contains(record.data_location) {
                warn!(
                    key = %record.key,
                    data_block = record.data_location,
                    "Orphaned key: payload missing"
                );
                dead_index.push(start);
                report.orphaned_keys.push(record.key);
                continue;
            }

            if let Some(owner) = claims.get(&record.data_location) {
                if *owner != record.key {
                    warn!(
                        key = %record.key,
                        owner = %owner,
                        data_block = record.data_location,
                        "Payload already referenced by another key"
                    );
                    dead_index.push(start);
                    report.shared_payload_keys.push(record.key);
                    continue;
                }
            }

            match keys.get(&record.key) {
                Some(existing) => {
                    let (winner, loser) = if record.timestamp > existing.timestamp {
                        (record, existing.clone())
                    } else {
                        (existing.clone(), record)
                    };
                    warn!(
                        key = %winner.key,
                        kept = winner.index_location,
                        dropped = loser.index_location,
                        "Duplicate key"
                    );
                    dead_index.push(loser.index_location);
                    if claims.get(&loser.data_location) == Some(&loser.key) {
                        claims.remove(&loser.data_location);
                    }
                    claims.insert(winner.data_location, winner.key.clone());
                    report.duplicate_keys.push(loser.key);
                    keys.insert(winner.key.clone(), winner);
                }
                None => {
                    claims.insert(record.data_location, record.key.clone());
                    keys.insert(record.key.clone(), record);
                }
            }
        }

        let referenced: HashSet<u32> = keys.values().map(|r| r.data_location).collect();
        report.unreferenced_payloads = self
            .data
            .start_blocks()
            .into_iter()
            .filter(|start| !referenced.contains(start))
            .collect();
        for &start in &report.unreferenced_payloads {
            warn!(data_block = start, "Unreferenced payload");
        }

        if !self.read_only {
            for &start in &dead_index {
                self.index.delete(start)?;
            }
            for &start in &report.unreferenced_payloads {
                self.data.delete(start)?;
            }
        }
        self.keys = keys;

        if !report.is_clean() {
            info!(
                unreadable = report.unreadable_index_records.len(),
                orphaned_keys = report.orphaned_keys.len(),
                duplicates = report.duplicate_keys.len(),
                shared_payloads = report.shared_payload_keys.len(),
                unreferenced = report.unreferenced_payloads.len(),
                repaired = !self.read_only,
                "Reconciled index and data files"
            );
        }
        Ok(report)
    }
}
