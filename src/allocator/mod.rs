//! Free-block allocation over block indices.
//!
//! A [`BlockAllocator`] only tracks which indices in `0..number_of_blocks`
//! are occupied. It never touches the medium; the data file is responsible
//! for growing the block store before asking for more blocks than are free.
//!
//! [`FreeListAllocator`] hands out the lowest free indices first, so blocks
//! released by a delete are the first ones reused and live data stays packed
//! towards the start of the file (which keeps opportunistic shrinking
//! effective).


use std::collections::BTreeSet;

use thiserror::Error;
use tracing::warn;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by allocator operations.
#[derive(Debug, Error)]
pub enum AllocatorError {
    /// An occupied index lies outside the requested size.
    #[error("block {index} is occupied and cannot be dropped (requested size {size})")]
    ShrinkBelowOccupied {
        /// Highest occupied index that would be dropped.
        index: u32,
        /// Requested new size.
        size: u32,
    },

    /// An index passed at construction is outside the initial capacity.
    #[error("occupied block {index} is outside capacity {capacity}")]
    OccupiedOutOfRange {
        /// Offending index.
        index: u32,
        /// Capacity the allocator was built with.
        capacity: u32,
    },
}

// ------------------------------------------------------------------------------------------------
// Traits
// ------------------------------------------------------------------------------------------------

/// Tracks free and occupied block indices.
pub trait BlockAllocator: Send {
    /// Marks up to `count` free indices as occupied and returns them.
    ///
    /// Returns fewer than `count` indices only when the allocator is
    /// exhausted; callers treat that as an internal consistency failure.
    fn allocate_blocks(&mut self, count: usize) -> Vec<u32>;

    /// Returns `blocks` to the free pool.
    fn deallocate_blocks(&mut self, blocks: &[u32]);

    /// Marks every index free.
    fn deallocate_all_blocks(&mut self);

    /// Total number of indices tracked.
    fn number_of_blocks(&self) -> u32;

    /// Grows or shrinks the tracked range. Shrinking must not drop occupied indices.
    fn set_size(&mut self, size: u32) -> Result<(), AllocatorError>;

    /// Number of occupied indices.
    fn number_of_allocated_blocks(&self) -> u32;

    /// Smallest size that keeps every occupied index (highest occupied + 1).
    fn space_in_use(&self) -> u32;
}

// ------------------------------------------------------------------------------------------------
// FreeListAllocator
// ------------------------------------------------------------------------------------------------

/// Lowest-index-first allocator backed by an occupancy map and an ordered free set.
#[derive(Debug, Clone)]
pub struct FreeListAllocator {
    /// `occupied[i]` is true when block `i` is in use.
    occupied: Vec<bool>,

    /// Free indices, ascending.
    free: BTreeSet<u32>,

    /// Count of `true` entries in `occupied`.
    allocated: u32,
}

impl FreeListAllocator {
    /// Builds an allocator of `capacity` blocks with `occupied` already in use.
    ///
    /// Duplicate entries in `occupied` are tolerated.
    pub fn new(capacity: u32, occupied: &[u32]) -> Result<Self, AllocatorError> {
        let mut map = vec![false; capacity as usize];
        for &index in occupied {
            if index >= capacity {
                return Err(AllocatorError::OccupiedOutOfRange { index, capacity });
            }
            map[index as usize] = true;
        }

        let free = (0..capacity).filter(|&i| !map[i as usize]).collect::<BTreeSet<_>>();
        let allocated = capacity - free.len() as u32;

        Ok(Self {
            occupied: map,
            free,
            allocated,
        })
    }

    /// `true` when block `index` is currently allocated.
    pub fn is_allocated(&self, index: u32) -> bool {
        self.occupied.get(index as usize).copied().unwrap_or(false)
    }

    /// Number of free indices.
    pub fn free_blocks(&self) -> u32 {
        self.free.len() as u32
    }
}

impl BlockAllocator for FreeListAllocator {
    fn allocate_blocks(&mut self, count: usize) -> Vec<u32> {
        let mut blocks = Vec::with_capacity(count);
        while blocks.len() < count {
            let Some(index) = self.free.pop_first() else {
                break;
            };
            self.occupied[index as usize] = true;
            self.allocated += 1;
            blocks.push(index);
        }
        blocks
    }

    fn deallocate_blocks(&mut self, blocks: &[u32]) {
        for &index in blocks {
            match self.occupied.get_mut(index as usize) {
                Some(slot) if *slot => {
                    *slot = false;
                    self.free.insert(index);
                    self.allocated -= 1;
                }
                _ => warn!(block = index, "deallocating a block that is not allocated"),
            }
        }
    }

    fn deallocate_all_blocks(&mut self) {
        self.occupied.iter_mut().for_each(|slot| *slot = false);
        self.free = (0..self.occupied.len() as u32).collect();
        self.allocated = 0;
    }

    fn number_of_blocks(&self) -> u32 {
        self.occupied.len() as u32
    }

    fn set_size(&mut self, size: u32) -> Result<(), AllocatorError> {
        let current = self.number_of_blocks();
        if size < current {
            if let Some(index) = (size..current).rev().find(|&i| self.occupied[i as usize]) {
                return Err(AllocatorError::ShrinkBelowOccupied { index, size });
            }
            self.occupied.truncate(size as usize);
            self.free.retain(|&i| i < size);
        } else {
            self.occupied.resize(size as usize, false);
            self.free.extend(current..size);
        }
        Ok(())
    }

    fn number_of_allocated_blocks(&self) -> u32 {
        self.allocated
    }

    fn space_in_use(&self) -> u32 {
        self.occupied
            .iter()
            .rposition(|&used| used)
            .map_or(0, |i| i as u32 + 1)
    }
}
