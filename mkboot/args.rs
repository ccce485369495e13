//! The per-PP argument block.
//!
//! The loader builds one [`MkArgs`] per physical processor. The BSP's block
//! carries the authoritative `online_pps`; AP blocks copy it. The pool spans
//! must already be mapped at the microkernel direct-map offset before the
//! first `VMM_INIT`.

use crate::state::StateSave;
use mkabi::layout::MAX_EXTS;

/// A `(addr, size)` span of loader-provided bytes (ELF images and the like).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Span {
    pub addr: u64,
    pub size: u64,
}

impl Span {
    pub const fn empty() -> Self {
        Span { addr: 0, size: 0 }
    }

    pub const fn is_empty(&self) -> bool {
        self.size == 0
    }
}

/// A physical pool span: where the microkernel sees it (`virt`), where the
/// hardware sees it (`phys`), and its length in bytes.
///
/// Inside the span, `virt - phys` is constant; the pools rely on that for
/// O(1) address translation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolSpan {
    pub virt: u64,
    pub phys: u64,
    pub size: u64,
}

impl PoolSpan {
    /// Number of whole 4 KiB frames in the span.
    #[inline]
    pub const fn pages(&self) -> usize {
        (self.size as usize) / mkabi::layout::PAGE_SIZE
    }
}

/// The per-PP argument block the loader passes to `VMM_INIT`.
pub struct MkArgs<'a> {
    /// This PP's id.
    pub ppid: u16,
    /// Total PPs being brought up (BSP-authoritative).
    pub online_pps: u16,
    /// Captured state the microkernel itself runs with on this PP.
    pub mk_state: &'a StateSave,
    /// Captured state of the OS being demoted on this PP.
    pub root_vp_state: &'a StateSave,
    /// The microkernel's own ELF image (kept for symbolization/debugging).
    pub mk_elf_file: Span,
    /// Extension ELF images, dense from slot 0.
    pub ext_elf_files: [Option<&'a [u8]>; MAX_EXTS],
    /// Physical address of the loader-built RPT whose kernel half the
    /// microkernel aliases during init.
    pub rpt_phys: u64,
    /// The loader RPT's top-level entries, raw, for the alias import.
    pub loader_pml4: Option<&'a [u64; 512]>,
    /// The page pool span.
    pub page_pool: PoolSpan,
    /// The huge pool span.
    pub huge_pool: PoolSpan,
}

impl<'a> MkArgs<'a> {
    /// Number of extension images present.
    pub fn ext_count(&self) -> usize {
        self.ext_elf_files.iter().filter(|e| e.is_some()).count()
    }
}
