//! Bare-metal heap.
//!
//! `alloc` collections inside the microkernel (pool tag tables, the VMExit
//! log storage) draw from a `linked_list_allocator` heap seeded out of the
//! page pool during global init. Host builds use the platform allocator and
//! never compile this module.

use linked_list_allocator::LockedHeap;

#[global_allocator]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

/// Number of page-pool frames donated to the heap at global init.
pub const HEAP_PAGES: usize = 256;

/// Seed the heap with a contiguous virtual region.
///
/// # Safety
///
/// `base..base + bytes` must be mapped read-write and unused by anything
/// else for the lifetime of the system.
pub unsafe fn init(base: u64, bytes: usize) {
    ALLOCATOR.lock().init(base as *mut u8, bytes);
}
