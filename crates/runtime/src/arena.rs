//! Varlist arena
//!
//! Action calls need a varlist of exactly `params + 1` cells, and most of
//! them never escape the call. Their backing buffers are kept here after
//! the frame is dropped, bucketed by parameter count, and handed to the
//! next call of the same arity instead of going back to the allocator.
//!
//! A varlist that was managed while its frame ran (a FRAME! value or a
//! bound word escaped) keeps its stub alive for the GC; only the buffer is
//! taken back, and the stub is left inaccessible. That counts as a steal.

use cellvm_core::Cell;
use cellvm_core::heap::reserve_or_crash;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArenaStats {
    /// Fresh buffers allocated.
    pub allocated: u64,
    /// Buffers handed out again.
    pub reused: u64,
    /// Buffers taken back from varlists that had been managed.
    pub stolen: u64,
    /// Buffers dropped because their bucket was full.
    pub discarded: u64,
}

#[derive(Debug)]
pub struct VarlistArena {
    buckets: HashMap<usize, Vec<Vec<Cell>>>,
    per_bucket: usize,
    stats: ArenaStats,
}

impl VarlistArena {
    pub fn new(per_bucket: usize) -> Self {
        VarlistArena {
            buckets: HashMap::new(),
            per_bucket,
            stats: ArenaStats::default(),
        }
    }

    /// An empty buffer with room for `params` variables, the archetype
    /// and a terminator slot.
    pub fn take(&mut self, params: usize) -> Vec<Cell> {
        match self.buckets.get_mut(&params).and_then(Vec::pop) {
            Some(buffer) => {
                self.stats.reused += 1;
                buffer
            }
            None => {
                self.stats.allocated += 1;
                reserve_or_crash(params + 2)
            }
        }
    }

    /// Return a buffer after its frame is dropped.
    pub fn give(&mut self, params: usize, mut buffer: Vec<Cell>, stolen: bool) {
        if stolen {
            self.stats.stolen += 1;
        }
        buffer.clear();
        let bucket = self.buckets.entry(params).or_default();
        if bucket.len() < self.per_bucket {
            bucket.push(buffer);
        } else {
            self.stats.discarded += 1;
        }
    }

    pub fn stats(&self) -> ArenaStats {
        self.stats
    }

    /// Buffers currently cached for `params`.
    pub fn cached(&self, params: usize) -> usize {
        self.buckets.get(&params).map_or(0, Vec::len)
    }
}
