//! Model-specific register access.

/// IA32_EFER.
pub const IA32_EFER: u32 = 0xC000_0080;
/// IA32_STAR.
pub const IA32_STAR: u32 = 0xC000_0081;
/// IA32_LSTAR.
pub const IA32_LSTAR: u32 = 0xC000_0082;
/// IA32_FMASK.
pub const IA32_FMASK: u32 = 0xC000_0084;
/// IA32_FS_BASE.
pub const IA32_FS_BASE: u32 = 0xC000_0100;
/// IA32_GS_BASE.
pub const IA32_GS_BASE: u32 = 0xC000_0101;
/// IA32_KERNEL_GS_BASE.
pub const IA32_KERNEL_GS_BASE: u32 = 0xC000_0102;
/// IA32_PAT.
pub const IA32_PAT: u32 = 0x277;
/// IA32_VMX_BASIC, the first VMX capability MSR; presence gates HVE support.
pub const IA32_VMX_BASIC: u32 = 0x480;
/// IA32_FEATURE_CONTROL, the lock/enable bits for VMX.
pub const IA32_FEATURE_CONTROL: u32 = 0x3A;

/// Read an MSR.
pub fn rdmsr(msr: u32) -> u64 {
    #[cfg(target_os = "none")]
    unsafe {
        x86_64::registers::model_specific::Msr::new(msr).read()
    }
    #[cfg(not(target_os = "none"))]
    {
        crate::soft::state()
            .lock()
            .msrs
            .get(&msr)
            .copied()
            .unwrap_or(0)
    }
}

/// Write an MSR.
///
/// # Safety
///
/// Writing a live MSR changes processor behavior out from under every
/// consumer of it; the caller owns the consequences.
pub unsafe fn wrmsr(msr: u32, val: u64) {
    #[cfg(target_os = "none")]
    {
        x86_64::registers::model_specific::Msr::new(msr).write(val);
    }
    #[cfg(not(target_os = "none"))]
    {
        crate::soft::state().lock().msrs.insert(msr, val);
    }
}
