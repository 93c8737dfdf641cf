//! Diagnostic and introspection utilities
//!
//! This module provides the host capability leak hunting depends on:
//! - Counting global allocator
//! - Allocation statistics snapshots and logging

pub mod memory;

pub use memory::{
    global_allocation_tracker, is_installed, AllocationSnapshot, AllocationTracker,
    CountingAllocator,
};
