//! Microvisor physical-memory management.
//!
//! Three pieces in dependency order:
//!
//! - [`page_pool`]: the 4 KiB frame allocator every other subsystem draws
//!   from. Tag-based ownership: every live frame records who holds it, and
//!   giving a frame back under the wrong tag is an invariant violation, not
//!   a recoverable error.
//! - [`huge_pool`]: physically contiguous multi-frame runs for control
//!   structures the hardware insists on seeing contiguously.
//! - [`root_page_table`]: the four-level mapper installed while the
//!   microkernel executes. Each leaf carries an auto-release tag naming the
//!   pool (and sub-pool tag) that owns its backing frame, which is what
//!   makes tearing down an address space equivalent to replaying its
//!   allocations in reverse.
//!
//! Pools are explicit values with `initialize`/`release`; nothing in this
//! crate hides behind an ambient global. The `mk` crate owns the singleton
//! instances and their locks.

#![no_std]

extern crate alloc;

pub mod huge_pool;
pub mod page_pool;
pub mod root_page_table;

#[cfg(target_os = "none")]
pub mod heap;

pub use huge_pool::HugePool;
pub use page_pool::PagePool;
pub use root_page_table::{MapError, MapFlags, RootPageTable};

use core::fmt;

/// Who holds a frame. Recorded at allocate, demanded back at deallocate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PoolTag {
    /// A page-table node of some RPT.
    PageTable,
    /// An extension stack page.
    ExtStack,
    /// An extension TLS page.
    ExtTls,
    /// An extension ELF segment page.
    ExtElf,
    /// An extension heap page.
    ExtHeap,
    /// A page handed to an extension via `bf_mem_op_alloc_page`.
    AllocPage,
}

/// Pool failures. `OutOfMemory` is the only recoverable one; the rest are
/// invariant violations that callers escalate to fast-fail.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PoolError {
    Uninitialized,
    AlreadyInitialized,
    OutOfMemory,
    /// Deallocation named a different tag than allocation recorded.
    TagMismatch,
    /// The frame is already free.
    DoubleFree,
    /// The address is not inside the pool span.
    OutOfRange,
    /// The address is not frame-aligned.
    Unaligned,
    /// Huge-pool deallocation did not name the start of a run.
    NotRunStart,
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A frame handed out by a pool: where the microkernel sees it and where
/// the hardware sees it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageRef {
    pub virt: u64,
    pub phys: u64,
}

/// The auto-release tag carried by every mapped leaf.
///
/// Stored in the architecturally-available PTE bits 9–11, so teardown can
/// recover ownership from the page tables alone.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(u64)]
pub enum AutoRelease {
    /// The mapping does not own its frame (direct maps, loader memory).
    #[default]
    None = 0,
    /// Owned by the page pool under [`PoolTag::AllocPage`].
    AllocPage = 1,
    /// Owned by the huge pool.
    AllocHuge = 2,
    /// Owned by the page pool under [`PoolTag::ExtHeap`].
    AllocHeap = 3,
    /// Owned by the page pool under [`PoolTag::ExtStack`].
    Stack = 4,
    /// Owned by the page pool under [`PoolTag::ExtTls`].
    Tls = 5,
    /// Owned by the page pool under [`PoolTag::ExtElf`].
    Elf = 6,
}

impl AutoRelease {
    /// Decode from the 3-bit field value.
    pub const fn from_bits(bits: u64) -> AutoRelease {
        match bits {
            1 => AutoRelease::AllocPage,
            2 => AutoRelease::AllocHuge,
            3 => AutoRelease::AllocHeap,
            4 => AutoRelease::Stack,
            5 => AutoRelease::Tls,
            6 => AutoRelease::Elf,
            _ => AutoRelease::None,
        }
    }

    /// The 3-bit field value.
    pub const fn bits(self) -> u64 {
        self as u64
    }

    /// The page-pool tag this auto-release tag releases under, if the page
    /// pool is the owner.
    pub const fn pool_tag(self) -> Option<PoolTag> {
        match self {
            AutoRelease::AllocPage => Some(PoolTag::AllocPage),
            AutoRelease::AllocHeap => Some(PoolTag::ExtHeap),
            AutoRelease::Stack => Some(PoolTag::ExtStack),
            AutoRelease::Tls => Some(PoolTag::ExtTls),
            AutoRelease::Elf => Some(PoolTag::ExtElf),
            AutoRelease::None | AutoRelease::AllocHuge => None,
        }
    }
}
