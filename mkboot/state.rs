//! The captured register state of a processor.
//!
//! One `StateSave` block is filled in by the loader for each PP before
//! `VMM_INIT`: one snapshot of the state the microkernel itself should run
//! with (`mk_state`) and one snapshot of the OS being demoted
//! (`root_vp_state`). The demote path mirrors `root_vp_state` into VPS 0 via
//! `init_as_root`; the reverse demote (`promote`) writes a VPS back into a
//! `StateSave` so the loader can resume the OS natively.
//!
//! The layout is `#[repr(C)]` because the bare-metal entry and exit
//! trampolines address fields by offset.

/// A segment register snapshot: selector, hidden base/limit, access rights.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct SegmentState {
    pub selector: u16,
    pub attrib: u16,
    pub limit: u32,
    pub base: u64,
}

/// A descriptor-table register snapshot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct TableState {
    pub limit: u16,
    pub base: u64,
}

/// The captured register file of one processor.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct StateSave {
    // General purpose.
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rbp: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,

    pub rip: u64,
    pub rsp: u64,
    pub rflags: u64,

    // Descriptor tables.
    pub gdtr: TableState,
    pub idtr: TableState,

    // Segments.
    pub es: SegmentState,
    pub cs: SegmentState,
    pub ss: SegmentState,
    pub ds: SegmentState,
    pub fs: SegmentState,
    pub gs: SegmentState,
    pub ldtr: SegmentState,
    pub tr: SegmentState,

    // Control registers.
    pub cr0: u64,
    pub cr2: u64,
    pub cr3: u64,
    pub cr4: u64,
    pub dr7: u64,

    // MSRs the demote/promote path must carry.
    pub efer: u64,
    pub star: u64,
    pub lstar: u64,
    pub cstar: u64,
    pub fmask: u64,
    pub fs_base: u64,
    pub gs_base: u64,
    pub kernel_gs_base: u64,
    pub sysenter_cs: u64,
    pub sysenter_esp: u64,
    pub sysenter_eip: u64,
    pub pat: u64,
    pub debugctl: u64,
}

impl StateSave {
    /// An all-zero state block.
    pub const fn zeroed() -> Self {
        // Safety note: every field is a plain integer; all-zero is valid.
        unsafe { core::mem::zeroed() }
    }
}

// The loader hands these over in single 4 KiB pages.
const _: () = assert!(core::mem::size_of::<StateSave>() <= mkabi::layout::PAGE_SIZE);
