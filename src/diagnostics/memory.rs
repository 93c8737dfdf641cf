//! Allocation counting and instrumentation
//!
//! This module provides the counting allocator behind the `refs` and
//! `blocks` metrics. It wraps the system allocator and keeps process-global
//! counters of allocator traffic, so a hunt can observe how many allocations
//! a test retains from one repetition to the next, and how much heap they
//! pin down measured in [`BLOCK_SIZE`] blocks.
//!
//! # Installing
//!
//! ```rust,ignore
//! #[global_allocator]
//! static ALLOC: leakhunt_core::CountingAllocator = leakhunt_core::CountingAllocator;
//! ```
//!
//! Counters are global, not per-thread: allocations from any thread are
//! counted. Leak hunting runs repetitions on a single thread for this reason.

use std::alloc::{GlobalAlloc, Layout, System};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use tracing::info;

/// Granule the `blocks` metric counts in; every allocation occupies at least one
pub const BLOCK_SIZE: usize = 16;

static ALLOC_CALLS: AtomicU64 = AtomicU64::new(0);
static DEALLOC_CALLS: AtomicU64 = AtomicU64::new(0);
static REALLOC_CALLS: AtomicU64 = AtomicU64::new(0);
static BYTES_ALLOCATED: AtomicU64 = AtomicU64::new(0);
static BYTES_DEALLOCATED: AtomicU64 = AtomicU64::new(0);
static PEAK_LIVE: AtomicU64 = AtomicU64::new(0);
static LIVE_BLOCKS: AtomicI64 = AtomicI64::new(0);

/// System allocator wrapper that counts every allocator call.
///
/// Must not allocate itself; all bookkeeping is plain atomics.
pub struct CountingAllocator;

unsafe impl GlobalAlloc for CountingAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let ptr = unsafe { System.alloc(layout) };
        if !ptr.is_null() {
            record_alloc(layout.size());
        }
        ptr
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let ptr = unsafe { System.alloc_zeroed(layout) };
        if !ptr.is_null() {
            record_alloc(layout.size());
        }
        ptr
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        unsafe { System.dealloc(ptr, layout) };
        DEALLOC_CALLS.fetch_add(1, Ordering::Relaxed);
        BYTES_DEALLOCATED.fetch_add(layout.size() as u64, Ordering::Relaxed);
        LIVE_BLOCKS.fetch_sub(blocks_for(layout.size()), Ordering::Relaxed);
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let new_ptr = unsafe { System.realloc(ptr, layout, new_size) };
        if !new_ptr.is_null() {
            // Same allocation, new size: only bytes and blocks move.
            REALLOC_CALLS.fetch_add(1, Ordering::Relaxed);
            if new_size >= layout.size() {
                BYTES_ALLOCATED.fetch_add((new_size - layout.size()) as u64, Ordering::Relaxed);
            } else {
                BYTES_DEALLOCATED.fetch_add((layout.size() - new_size) as u64, Ordering::Relaxed);
            }
            LIVE_BLOCKS.fetch_add(
                blocks_for(new_size) - blocks_for(layout.size()),
                Ordering::Relaxed,
            );
        }
        new_ptr
    }
}

#[inline]
fn record_alloc(size: usize) {
    let calls = ALLOC_CALLS.fetch_add(1, Ordering::Relaxed) + 1;
    BYTES_ALLOCATED.fetch_add(size as u64, Ordering::Relaxed);
    LIVE_BLOCKS.fetch_add(blocks_for(size), Ordering::Relaxed);
    let live = calls.saturating_sub(DEALLOC_CALLS.load(Ordering::Relaxed));
    PEAK_LIVE.fetch_max(live, Ordering::Relaxed);
}

/// Blocks occupied by one allocation of `size` bytes
#[inline]
pub fn blocks_for(size: usize) -> i64 {
    size.div_ceil(BLOCK_SIZE).max(1) as i64
}

/// Detect whether [`CountingAllocator`] is the process's global allocator.
///
/// Performs one probe allocation and checks that the counters moved.
pub fn is_installed() -> bool {
    let before = ALLOC_CALLS.load(Ordering::SeqCst);
    let probe = std::hint::black_box(Box::new(0u64));
    let after = ALLOC_CALLS.load(Ordering::SeqCst);
    drop(probe);
    after > before
}

/// Read-only handle over the global allocation counters
#[derive(Debug, Clone, Copy, Default)]
pub struct AllocationTracker;

impl AllocationTracker {
    pub fn new() -> Self {
        Self
    }

    /// Allocations currently alive (allocations minus deallocations)
    pub fn live_allocations(&self) -> i64 {
        let allocs = ALLOC_CALLS.load(Ordering::SeqCst);
        let deallocs = DEALLOC_CALLS.load(Ordering::SeqCst);
        allocs as i64 - deallocs as i64
    }

    /// [`BLOCK_SIZE`] blocks held by live allocations
    pub fn live_blocks(&self) -> i64 {
        LIVE_BLOCKS.load(Ordering::SeqCst)
    }

    /// Get current statistics snapshot
    pub fn snapshot(&self) -> AllocationSnapshot {
        AllocationSnapshot {
            alloc_calls: ALLOC_CALLS.load(Ordering::SeqCst),
            dealloc_calls: DEALLOC_CALLS.load(Ordering::SeqCst),
            realloc_calls: REALLOC_CALLS.load(Ordering::SeqCst),
            bytes_allocated: BYTES_ALLOCATED.load(Ordering::SeqCst),
            bytes_deallocated: BYTES_DEALLOCATED.load(Ordering::SeqCst),
            peak_live: PEAK_LIVE.load(Ordering::SeqCst),
            live_blocks: LIVE_BLOCKS.load(Ordering::SeqCst),
        }
    }

    /// Log current allocation statistics
    pub fn log_statistics(&self) {
        let snapshot = self.snapshot();
        info!(
            live_allocations = snapshot.live_allocations(),
            live_blocks = snapshot.live_blocks,
            live_kb = snapshot.live_bytes() / 1024,
            peak_allocations = snapshot.peak_live,
            reallocs = snapshot.realloc_calls,
            "Allocation statistics"
        );
    }
}

/// Allocation statistics snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocationSnapshot {
    pub alloc_calls: u64,
    pub dealloc_calls: u64,
    pub realloc_calls: u64,
    pub bytes_allocated: u64,
    pub bytes_deallocated: u64,
    pub peak_live: u64,
    pub live_blocks: i64,
}

impl AllocationSnapshot {
    pub fn live_allocations(&self) -> i64 {
        self.alloc_calls as i64 - self.dealloc_calls as i64
    }

    pub fn live_bytes(&self) -> u64 {
        self.bytes_allocated.saturating_sub(self.bytes_deallocated)
    }

    /// Net change in live allocations since `earlier`
    pub fn allocations_since(&self, earlier: &AllocationSnapshot) -> i64 {
        self.live_allocations() - earlier.live_allocations()
    }

    /// Net change in live blocks since `earlier`
    pub fn blocks_since(&self, earlier: &AllocationSnapshot) -> i64 {
        self.live_blocks - earlier.live_blocks
    }

    /// Convert to human-readable format
    pub fn to_human_readable(&self) -> String {
        format!(
            "Allocations:\n\
             - Live allocations: {}\n\
             - Live blocks: {}\n\
             - Live: {:.2} KB\n\
             - Peak allocations: {}\n\
             - Calls: {} alloc / {} dealloc / {} realloc",
            self.live_allocations(),
            self.live_blocks,
            self.live_bytes() as f64 / 1024.0,
            self.peak_live,
            self.alloc_calls,
            self.dealloc_calls,
            self.realloc_calls,
        )
    }
}

/// Get the global allocation tracker
pub fn global_allocation_tracker() -> AllocationTracker {
    AllocationTracker
}
