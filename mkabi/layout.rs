//! Compile-time limits and the fixed virtual-memory layout.
//!
//! The microkernel owns the canonical-high half of the address space; every
//! extension mapping lands in the canonical-low half. By contract the two
//! halves never share a top-level page-table entry, which is what lets an
//! extension RPT alias the whole microkernel half with shallow pml4 copies.

/// Size of one page frame.
pub const PAGE_SIZE: usize = 4096;

/// Shift for one page frame.
pub const PAGE_SHIFT: usize = 12;

// ============================================================================
// Pool limits
// ============================================================================

/// Maximum number of physical processors.
pub const MAX_PPS: usize = 64;

/// Maximum number of VMs. Id 0 is the root VM and is reserved.
pub const MAX_VMS: usize = 16;

/// Maximum number of VPs.
pub const MAX_VPS: usize = 64;

/// Maximum number of VPSs.
pub const MAX_VPSS: usize = 64;

/// Maximum number of loadable extensions.
pub const MAX_EXTS: usize = 4;

/// The root VM's id.
pub const ROOT_VMID: u16 = 0;

// ============================================================================
// Microkernel half (canonical high, supervisor)
// ============================================================================

/// Direct map of the page/huge pools as seen by the microkernel.
/// `virt = phys + MK_DIRECT_MAP_ADDR` inside the pool spans.
pub const MK_DIRECT_MAP_ADDR: u64 = 0xFFFF_8000_0000_0000;

/// Per-PP microkernel stack region (guard-gapped).
pub const MK_STACK_ADDR: u64 = 0xFFFF_A000_0000_0000;

/// Size of one microkernel stack.
pub const MK_STACK_SIZE: usize = 4 * PAGE_SIZE;

// ============================================================================
// Extension half (canonical low, user)
// ============================================================================

/// Base of an extension's PT_LOAD segments.
pub const EXT_ELF_ADDR: u64 = 0x0000_0002_8000_0000;

/// Base of the per-PP extension stacks. Each PP's stack is
/// [`EXT_STACK_SIZE`] bytes followed by one unmapped guard page.
pub const EXT_STACK_ADDR: u64 = 0x0000_0003_0000_0000;

/// Size of one extension stack.
pub const EXT_STACK_SIZE: usize = 8 * PAGE_SIZE;

/// Base of the per-PP extension TLS blocks. One leading guard page per PP,
/// then one 4 KiB TLS page; the thread pointer lands at the page boundary.
pub const EXT_TLS_ADDR: u64 = 0x0000_0003_4000_0000;

/// Size of one extension TLS block.
pub const EXT_TLS_SIZE: usize = PAGE_SIZE;

/// Base of the extension heap (bump-allocated).
pub const EXT_HEAP_ADDR: u64 = 0x0000_0003_8000_0000;

/// Ceiling of the extension heap.
pub const EXT_HEAP_MAX: u64 = 0x0000_0003_C000_0000;

/// Extension-visible direct map of pages handed out by
/// `bf_mem_op_alloc_page` / `bf_mem_op_alloc_huge`:
/// `virt = phys + EXT_DIRECT_MAP_ADDR`.
pub const EXT_DIRECT_MAP_ADDR: u64 = 0x0000_0004_0000_0000;

/// One past the last extension-half address the microkernel will map.
pub const EXT_SPACE_MAX: u64 = 0x0000_0008_0000_0000;

/// True if `addr` is 4 KiB aligned.
#[inline]
pub const fn is_page_aligned(addr: u64) -> bool {
    addr & (PAGE_SIZE as u64 - 1) == 0
}

/// Round `addr` up to the next page boundary.
#[inline]
pub const fn page_align_up(addr: u64) -> u64 {
    (addr + (PAGE_SIZE as u64 - 1)) & !(PAGE_SIZE as u64 - 1)
}

/// True if `addr` is canonical (bits 63:47 all equal).
#[inline]
pub const fn is_canonical(addr: u64) -> bool {
    let top = addr >> 47;
    top == 0 || top == 0x1FFFF
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment_helpers() {
        assert!(is_page_aligned(0));
        assert!(is_page_aligned(0x1000));
        assert!(!is_page_aligned(0x1001));
        assert_eq!(page_align_up(0x1001), 0x2000);
        assert_eq!(page_align_up(0x1000), 0x1000);
    }

    #[test]
    fn canonical_split() {
        assert!(is_canonical(0));
        assert!(is_canonical(0x0000_7FFF_FFFF_FFFF));
        assert!(!is_canonical(0x0000_8000_0000_0000));
        assert!(is_canonical(0xFFFF_8000_0000_0000));
        assert!(is_canonical(MK_DIRECT_MAP_ADDR));
        assert!(is_canonical(EXT_DIRECT_MAP_ADDR));
    }

    #[test]
    fn halves_do_not_share_a_pml4_slot() {
        // A pml4 slot covers 512 GiB. The extension half must stay strictly
        // below the sign-extension hole and the microkernel half above it.
        assert!(EXT_SPACE_MAX <= 0x0000_8000_0000_0000);
        assert!(MK_DIRECT_MAP_ADDR >= 0xFFFF_8000_0000_0000);
    }
}
