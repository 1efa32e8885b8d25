//! Cross-thread heap statistics registry
//!
//! Each interpreter heap lives on one thread, but the SIGQUIT diagnostics
//! dump runs on its own signal thread. Heaps publish their numbers into a
//! global registry where every thread owns one slot.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │              HeapStatsRegistry (global)                 │
//! ├─────────────────────────────────────────────────────────┤
//! │  ┌──────────────────┐  ┌──────────────────┐             │
//! │  │ Slot 0 (Thread A)│  │ Slot 1 (Thread B)│  ...        │
//! │  │ thread_id        │  │ thread_id        │             │
//! │  │ heap_bytes       │  │ heap_bytes       │             │
//! │  │ live_series      │  │ live_series      │             │
//! │  │ collections      │  │ collections      │             │
//! │  └──────────────────┘  └──────────────────┘             │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! # Performance
//!
//! - **Registration**: one CAS per thread, when its first heap is created
//! - **Updates**: relaxed atomic stores from the owning thread only
//! - **Reads**: only while dumping diagnostics

use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};

/// Maximum number of interpreter threads tracked.
const MAX_THREADS: usize = 64;

#[derive(Debug)]
pub struct HeapSlot {
    /// Thread ID (0 = slot is free)
    pub thread_id: AtomicU64,
    pub heap_bytes: AtomicU64,
    /// High-water mark of `heap_bytes`
    pub peak_heap_bytes: AtomicU64,
    pub live_series: AtomicU64,
    pub collections: AtomicU64,
}

impl HeapSlot {
    const fn new() -> Self {
        Self {
            thread_id: AtomicU64::new(0),
            heap_bytes: AtomicU64::new(0),
            peak_heap_bytes: AtomicU64::new(0),
            live_series: AtomicU64::new(0),
            collections: AtomicU64::new(0),
        }
    }
}

pub struct HeapStatsRegistry {
    slots: Box<[HeapSlot]>,
    /// Threads that found the registry full
    pub overflow_count: AtomicU64,
}

impl HeapStatsRegistry {
    fn new(capacity: usize) -> Self {
        let slots: Vec<HeapSlot> = (0..capacity).map(|_| HeapSlot::new()).collect();
        Self {
            slots: slots.into_boxed_slice(),
            overflow_count: AtomicU64::new(0),
        }
    }

    /// Claim a slot for the current thread; None if the registry is full.
    pub fn register(&self) -> Option<usize> {
        let thread_id = current_thread_id();
        for (idx, slot) in self.slots.iter().enumerate() {
            if slot
                .thread_id
                .compare_exchange(0, thread_id, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return Some(idx);
            }
        }
        self.overflow_count.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Caller must be the thread that registered `slot_idx`.
    #[inline]
    pub fn update_heap(&self, slot_idx: usize, heap_bytes: usize, live_series: usize) {
        if let Some(slot) = self.slots.get(slot_idx) {
            let bytes = heap_bytes as u64;
            slot.heap_bytes.store(bytes, Ordering::Relaxed);
            slot.live_series.store(live_series as u64, Ordering::Relaxed);
            slot.peak_heap_bytes.fetch_max(bytes, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn record_collection(&self, slot_idx: usize) {
        if let Some(slot) = self.slots.get(slot_idx) {
            slot.collections.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn aggregate_stats(&self) -> AggregateHeapStats {
        let mut stats = AggregateHeapStats {
            overflow_count: self.overflow_count.load(Ordering::Relaxed),
            ..AggregateHeapStats::default()
        };
        for slot in self.slots.iter() {
            if slot.thread_id.load(Ordering::Acquire) > 0 {
                stats.active_threads += 1;
                stats.total_heap_bytes += slot.heap_bytes.load(Ordering::Relaxed);
                stats.total_peak_heap_bytes += slot.peak_heap_bytes.load(Ordering::Relaxed);
                stats.total_live_series += slot.live_series.load(Ordering::Relaxed);
                stats.total_collections += slot.collections.load(Ordering::Relaxed);
            }
        }
        stats
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AggregateHeapStats {
    pub active_threads: usize,
    pub total_heap_bytes: u64,
    pub total_peak_heap_bytes: u64,
    pub total_live_series: u64,
    pub total_collections: u64,
    pub overflow_count: u64,
}

/// Starts at 1 because 0 marks an empty slot.
static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THIS_THREAD_ID: u64 = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);
}

fn current_thread_id() -> u64 {
    THIS_THREAD_ID.with(|&id| id)
}

static HEAP_REGISTRY: OnceLock<HeapStatsRegistry> = OnceLock::new();

pub fn heap_registry() -> &'static HeapStatsRegistry {
    HEAP_REGISTRY.get_or_init(|| HeapStatsRegistry::new(MAX_THREADS))
}

thread_local! {
    static SLOT_INDEX: std::cell::Cell<Option<usize>> = const { std::cell::Cell::new(None) };
}

/// Get or register the current thread's slot index.
pub fn get_or_register_slot() -> Option<usize> {
    SLOT_INDEX.with(|cell| {
        if let Some(idx) = cell.get() {
            Some(idx)
        } else {
            let idx = heap_registry().register();
            cell.set(idx);
            idx
        }
    })
}

#[inline]
pub fn update_heap_stats(heap_bytes: usize, live_series: usize) {
    if let Some(idx) = SLOT_INDEX.with(|cell| cell.get()) {
        heap_registry().update_heap(idx, heap_bytes, live_series);
    }
}

#[inline]
pub fn record_collection() {
    if let Some(idx) = SLOT_INDEX.with(|cell| cell.get()) {
        heap_registry().record_collection(idx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_basic() {
        let registry = HeapStatsRegistry::new(4);
        let idx = registry.register().unwrap();
        registry.update_heap(idx, 1024, 3);
        registry.record_collection(idx);

        let stats = registry.aggregate_stats();
        assert_eq!(stats.active_threads, 1);
        assert_eq!(stats.total_heap_bytes, 1024);
        assert_eq!(stats.total_live_series, 3);
        assert_eq!(stats.total_collections, 1);
    }

    #[test]
    fn test_peak_is_high_water_mark() {
        let registry = HeapStatsRegistry::new(1);
        let idx = registry.register().unwrap();
        registry.update_heap(idx, 4096, 1);
        registry.update_heap(idx, 128, 1);
        let stats = registry.aggregate_stats();
        assert_eq!(stats.total_heap_bytes, 128);
        assert_eq!(stats.total_peak_heap_bytes, 4096);
    }

    #[test]
    fn test_registry_overflow() {
        let registry = HeapStatsRegistry::new(1);
        assert!(registry.register().is_some());
        assert!(registry.register().is_none());
        assert_eq!(registry.overflow_count.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_thread_local_slot_is_cached() {
        let slot1 = get_or_register_slot();
        let slot2 = get_or_register_slot();
        assert_eq!(slot1, slot2);
    }

    #[test]
    fn test_concurrent_registration() {
        use std::thread;

        let handles: Vec<_> = (0..4)
            .map(|i| {
                thread::spawn(move || {
                    let slot = get_or_register_slot();
                    if slot.is_some() {
                        update_heap_stats(1000 * (i + 1), i);
                    }
                    slot.is_some()
                })
            })
            .collect();

        let mut registered_count = 0;
        for h in handles {
            if h.join().unwrap() {
                registered_count += 1;
            }
        }

        let stats = heap_registry().aggregate_stats();
        assert!(stats.active_threads >= registered_count);
    }
}
