//! Startup consistency scan.
//!
//! Runs once per open of an existing file:
//!
//! 1. Read every block in bounded batches, decoding and checksum-verifying
//!    its header (and data footer, when enabled). Corrupt blocks are copied
//!    to a side file `<name>.invalid<hex millis>` and treated as free.
//! 2. Walk the chain of every start block in index order. A chain is valid
//!    when every link lands on an occupied non-start block not claimed by an
//!    earlier chain, the walk terminates without revisiting a block, and
//!    `size <= chain_length * allocation_unit`.
//! 3. Occupied blocks reached by no valid chain are unreferenced.
//!
//! In read/write mode, corrupt blocks, blocks of invalid chains and
//! unreferenced blocks are reset to free on disk, and the file is grown to
//! its initial capacity when smaller. In read-only mode nothing is written
//! and every block that looked occupied stays out of the free pool.

use std::{
    collections::{BTreeSet, HashMap, HashSet},
    fs::{File, OpenOptions},
    io::Write,
    path::PathBuf,
    time::{SystemTime, UNIX_EPOCH},
};

use tracing::{error, info, warn};

use super::format::{self, BlockHeader, FileHeader};
use super::{Chain, ChainedDataFile, DataFileError};
use crate::allocator::FreeListAllocator;
use crate::block_store::BlockStore;
use crate::encoding::{self, Decode};

/// Upper bound on bytes read per scan batch.
const RECOVERY_BATCH_BYTES: usize = 10 * 1024 * 1024;

/// What the recovery scan found and repaired.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Blocks examined.
    pub blocks_scanned: u32,

    /// Blocks whose header or data checksum failed.
    pub corrupt_blocks: Vec<u32>,

    /// Start blocks whose chain was rejected.
    pub invalid_chains: Vec<u32>,

    /// Occupied non-start blocks no valid chain reaches.
    pub unreferenced_blocks: Vec<u32>,

    /// Side file holding raw copies of the corrupt blocks, if one was written.
    pub invalid_blocks_path: Option<PathBuf>,
}

impl RecoveryReport {
    /// `true` when the scan found nothing to repair.
    pub fn is_clean(&self) -> bool {
        self.corrupt_blocks.is_empty()
            && self.invalid_chains.is_empty()
            && self.unreferenced_blocks.is_empty()
    }
}

/// Decoded header fields kept for the chain walk.
#[derive(Debug, Clone, Copy)]
struct ScannedBlock {
    is_start: bool,
    size: u32,
    next: Option<u32>,
}

// ------------------------------------------------------------------------------------------------
// Invalid block side file
// ------------------------------------------------------------------------------------------------

/// Lazily created copy target for corrupt blocks.
///
/// Failures are logged and never abort recovery.
struct InvalidBlocksFile {
    path: PathBuf,
    header: Option<Vec<u8>>,
    file: Option<File>,
    failed: bool,
}

impl InvalidBlocksFile {
    fn new(name: &str, geometry: &FileHeader) -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        Self {
            path: PathBuf::from(format!("{name}.invalid{millis:x}")),
            header: encoding::encode_to_vec(geometry).ok(),
            file: None,
            failed: false,
        }
    }

    fn record(&mut self, raw: &[u8]) {
        if self.failed {
            return;
        }
        if let Err(e) = self.try_record(raw) {
            error!(path = %self.path.display(), "Failed to save invalid block: {e}");
            self.failed = true;
        }
    }

    fn try_record(&mut self, raw: &[u8]) -> std::io::Result<()> {
        if self.file.is_none() {
            let mut file = OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&self.path)?;
            if let Some(header) = &self.header {
                file.write_all(header)?;
            }
            self.file = Some(file);
        }
        if let Some(file) = self.file.as_mut() {
            file.write_all(raw)?;
        }
        Ok(())
    }

    fn finish(self) -> Option<PathBuf> {
        let file = self.file?;
        if let Err(e) = file.sync_all() {
            error!(path = %self.path.display(), "Failed to sync invalid block file: {e}");
        }
        Some(self.path)
    }
}

// ------------------------------------------------------------------------------------------------
// Scan
// ------------------------------------------------------------------------------------------------

impl<S: BlockStore> ChainedDataFile<S> {
    /// Rebuilds the chain index and allocator from the medium.
    pub(super) fn recover(&mut self) -> Result<RecoveryReport, DataFileError> {
        let capacity = self.store.block_capacity();
        let block_size = self.store.block_size();
        let batch = u32::try_from((RECOVERY_BATCH_BYTES / block_size).max(1)).unwrap_or(u32::MAX);

        let mut report = RecoveryReport {
            blocks_scanned: capacity,
            ..RecoveryReport::default()
        };
        let mut occupied: HashMap<u32, ScannedBlock> = HashMap::new();
        let mut starts: Vec<u32> = Vec::new();
        let mut quarantine = InvalidBlocksFile::new(self.store.name(), &self.geometry);

        let mut first = 0u32;
        while first < capacity {
            let end = first.saturating_add(batch).min(capacity);
            let indices: Vec<u32> = (first..end).collect();
            let raw = self.store.read_blocks(&indices)?;

            for (&index, block) in indices.iter().zip(raw.chunks_exact(block_size)) {
                match self.decode_scanned(block) {
                    Ok(None) => {}
                    Ok(Some(scanned)) => {
                        if scanned.is_start {
                            starts.push(index);
                        }
                        occupied.insert(index, scanned);
                    }
                    Err(e) => {
                        warn!(file = self.store.name(), block = index, "Corrupt block: {e}");
                        report.corrupt_blocks.push(index);
                        quarantine.record(block);
                    }
                }
            }
            first = end;
        }
        report.invalid_blocks_path = quarantine.finish();

        let unit = u64::from(self.geometry.allocation_unit);
        let mut claimed: HashSet<u32> = HashSet::new();
        self.chains.clear();
        for &start in &starts {
            let size = occupied.get(&start).map_or(0, |b| b.size);
            match Self::walk_chain(start, &occupied, &claimed, capacity) {
                Some(blocks) if u64::from(size) <= blocks.len() as u64 * unit => {
                    claimed.extend(blocks.iter().copied());
                    self.chains.insert(start, Chain { blocks, size });
                }
                _ => {
                    warn!(file = self.store.name(), start, size, "Invalid chain");
                    report.invalid_chains.push(start);
                }
            }
        }

        let invalid_starts: HashSet<u32> = report.invalid_chains.iter().copied().collect();
        report.unreferenced_blocks = occupied
            .keys()
            .copied()
            .filter(|b| !claimed.contains(b) && !invalid_starts.contains(b))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        if self.read_only {
            let in_use: Vec<u32> = occupied.keys().copied().collect();
            self.allocator = FreeListAllocator::new(capacity, &in_use)?;
        } else {
            let free = BlockHeader::FREE.to_bytes()?;
            let resets: BTreeSet<u32> = report
                .corrupt_blocks
                .iter()
                .chain(&report.invalid_chains)
                .chain(&report.unreferenced_blocks)
                .copied()
                .collect();
            for &block in &resets {
                self.store.write_partial_block(block, 0, &free)?;
            }
            let live: Vec<u32> = claimed.into_iter().collect();
            self.allocator = FreeListAllocator::new(capacity, &live)?;
            if capacity < self.initial_capacity {
                self.resize(self.initial_capacity)?;
            }
        }

        if report.is_clean() {
            info!(
                file = self.store.name(),
                blocks = capacity,
                records = self.chains.len(),
                "Recovery scan clean"
            );
        } else {
            warn!(
                file = self.store.name(),
                blocks = capacity,
                records = self.chains.len(),
                corrupt = report.corrupt_blocks.len(),
                invalid_chains = report.invalid_chains.len(),
                unreferenced = report.unreferenced_blocks.len(),
                repaired = !self.read_only,
                "Recovery scan found damage"
            );
        }
        Ok(report)
    }

    /// `Ok(None)` for a free block, `Err` for a checksum or format failure.
    fn decode_scanned(&self, block: &[u8]) -> Result<Option<ScannedBlock>, DataFileError> {
        let (header, _) = BlockHeader::decode_from(block)?;
        if !header.occupied {
            return Ok(None);
        }
        format::verify_block_data(block, &self.geometry)?;
        Ok(Some(ScannedBlock {
            is_start: header.is_start,
            size: header.data_length.unwrap_or(0),
            next: header.next_block,
        }))
    }

    /// Follows the links from `start`; `None` when the chain is broken.
    fn walk_chain(
        start: u32,
        occupied: &HashMap<u32, ScannedBlock>,
        claimed: &HashSet<u32>,
        capacity: u32,
    ) -> Option<Vec<u32>> {
        let mut blocks = vec![start];
        let mut visited = HashSet::from([start]);
        let mut next = occupied.get(&start)?.next;

        while let Some(index) = next {
            if blocks.len() as u64 > u64::from(capacity) {
                return None;
            }
            let block = occupied.get(&index)?;
            if block.is_start || claimed.contains(&index) || !visited.insert(index) {
                return None;
            }
            blocks.push(index);
            next = block.next;
        }
        Some(blocks)
    }
}
