//! Hardware-virtualization control-structure operations.
//!
//! The microkernel's VPS layer owns a software mirror of every guest field;
//! this module is the narrow surface through which the mirror is pushed to
//! and pulled from the hardware structure: `clear`, `load`, field access on
//! the loaded structure, and the entry instruction itself.
//!
//! Field encodings here are the `mkabi::Reg` encodings; the bare-metal
//! backend translates them to the architectural VMCS encodings internally.

/// Errors from the control-structure surface.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HveError {
    /// The processor does not support (or the firmware disabled)
    /// hardware virtualization.
    NotSupported,
    /// A field or entry operation was attempted with no structure loaded.
    NothingLoaded,
    /// The structure address was rejected by the hardware.
    BadStructure,
    /// The field encoding names no architectural field.
    InvalidField,
    /// VM entry failed; carries the architectural instruction-error code.
    EntryFailed(u64),
}

/// What the hardware reported at a VM exit.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ExitInfo {
    pub reason: u64,
    pub qualification: u64,
    pub interruption_info: u64,
    pub instruction_length: u64,
}

/// Basic exit-reason values shared with extensions.
pub mod exit_reason {
    pub const EXCEPTION_OR_NMI: u64 = 0;
    pub const EXTERNAL_INTERRUPT: u64 = 1;
    pub const TRIPLE_FAULT: u64 = 2;
    pub const CPUID: u64 = 10;
    pub const HLT: u64 = 12;
    pub const VMCALL: u64 = 18;
    pub const CR_ACCESS: u64 = 28;
    pub const IO_INSTRUCTION: u64 = 30;
    pub const RDMSR: u64 = 31;
    pub const WRMSR: u64 = 32;
    pub const EPT_VIOLATION: u64 = 48;
}

/// Verify this processor can enter hardware-virtualization root mode.
pub fn check_support() -> Result<(), HveError> {
    #[cfg(target_os = "none")]
    {
        crate::hw::check_support()
    }
    #[cfg(not(target_os = "none"))]
    {
        if crate::soft::state().lock().hve_disabled {
            Err(HveError::NotSupported)
        } else {
            Ok(())
        }
    }
}

/// Flush and deactivate the control structure at `phys`. After a clear the
/// structure may be loaded on any PP.
///
/// # Safety
///
/// `phys` must point at a control-structure page owned by a VPS.
pub unsafe fn clear(phys: u64) -> Result<(), HveError> {
    #[cfg(target_os = "none")]
    {
        crate::hw::clear(phys)
    }
    #[cfg(not(target_os = "none"))]
    {
        crate::soft::clear(phys)
    }
}

/// Make the control structure at `phys` the current one on this PP.
///
/// # Safety
///
/// `phys` must point at a cleared-or-previously-loaded-here structure;
/// loading a structure that is live on another PP is architecturally
/// undefined.
pub unsafe fn load(phys: u64) -> Result<(), HveError> {
    #[cfg(target_os = "none")]
    {
        crate::hw::load(phys)
    }
    #[cfg(not(target_os = "none"))]
    {
        crate::soft::load(phys)
    }
}

/// The physical address of the currently loaded structure, if any.
pub fn loaded() -> Option<u64> {
    #[cfg(target_os = "none")]
    {
        crate::hw::loaded()
    }
    #[cfg(not(target_os = "none"))]
    {
        crate::soft::state().lock().loaded
    }
}

/// Write a field of the loaded structure.
///
/// # Safety
///
/// The caller must own the loaded structure.
pub unsafe fn write_field(enc: u16, val: u64) -> Result<(), HveError> {
    #[cfg(target_os = "none")]
    {
        crate::hw::write_field(enc, val)
    }
    #[cfg(not(target_os = "none"))]
    {
        crate::soft::write_field(enc, val)
    }
}

/// Read a field of the loaded structure.
///
/// # Safety
///
/// The caller must own the loaded structure.
pub unsafe fn read_field(enc: u16) -> Result<u64, HveError> {
    #[cfg(target_os = "none")]
    {
        crate::hw::read_field(enc)
    }
    #[cfg(not(target_os = "none"))]
    {
        crate::soft::read_field(enc)
    }
}

/// Enter the guest through the loaded structure. `launched` selects resume
/// over launch. `gprs` (rax..r15 in encoding order) is swapped in on entry
/// and captured back at the exit.
///
/// On hardware this returns only when the guest exits.
///
/// # Safety
///
/// The loaded structure must hold a complete, consistent guest state.
pub unsafe fn vm_entry(launched: bool, gprs: &mut [u64; 16]) -> Result<ExitInfo, HveError> {
    #[cfg(target_os = "none")]
    {
        crate::hw::vm_entry(launched, gprs)
    }
    #[cfg(not(target_os = "none"))]
    {
        crate::soft::vm_entry(launched, gprs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_access_requires_a_loaded_structure() {
        let _guard = crate::soft::test_guard();
        crate::soft::reset();
        let rip = mkabi::Reg::Rip.encoding();
        assert_eq!(
            unsafe { write_field(rip, 1) },
            Err(HveError::NothingLoaded)
        );
        unsafe { clear(0x7000).unwrap() };
        unsafe { load(0x7000).unwrap() };
        unsafe { write_field(rip, 0xABCD).unwrap() };
        assert_eq!(unsafe { read_field(rip).unwrap() }, 0xABCD);
    }

    #[test]
    fn entry_synthesizes_scripted_exits() {
        let _guard = crate::soft::test_guard();
        crate::soft::reset();
        unsafe { clear(0x8000).unwrap() };
        unsafe { load(0x8000).unwrap() };
        crate::soft::push_exit(ExitInfo {
            reason: exit_reason::VMCALL,
            instruction_length: 3,
            ..ExitInfo::default()
        });
        let mut gprs = [0u64; 16];
        let exit = unsafe { vm_entry(false, &mut gprs).unwrap() };
        assert_eq!(exit.reason, exit_reason::VMCALL);
        // With the queue drained, entries report the quiet default.
        let exit = unsafe { vm_entry(true, &mut gprs).unwrap() };
        assert_eq!(exit.reason, exit_reason::HLT);
    }
}
