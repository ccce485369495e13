//! Control-mailbox request codes and memory descriptors.
//!
//! The loader sequences the microkernel through a small fixed request set.
//! Codes are stable ABI. The microkernel answers unknown codes with success
//! so older microkernels keep working under newer loaders.

/// Request: set the total number of leaf (4 KiB) frames the loader will
/// donate to the page pool. REG0 carries the count.
pub const SET_MEM_LEAFS: u64 = 0x1000;

/// Request: set the total number of page-table node frames reserved for the
/// microkernel's own mappings. REG0 carries the count.
pub const SET_MEM_NODES: u64 = 0x1001;

/// Request: add a memory descriptor describing one loader-donated region.
pub const ADD_MD: u64 = 0x1002;

/// Request: run global (once-per-boot) initialization.
pub const GLOBAL_INIT: u64 = 0x1003;

/// Request: start the VMM on one PP (demote that PP's running OS).
pub const VMM_INIT: u64 = 0x1004;

/// Request: stop the VMM on one PP (reverse demote).
pub const VMM_FINI: u64 = 0x1005;

/// Request: copy out the debug ring contents.
pub const GET_DRR: u64 = 0x1006;

/// What a loader-donated region is for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MdKind {
    /// Read-execute image pages.
    CodeRx,
    /// Read-write data pages.
    DataRw,
}

/// One loader-donated memory region.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryDescriptor {
    pub phys: u64,
    pub virt: u64,
    pub bytes: u64,
    pub kind: MdKind,
}
