//! Bare-metal backend: real VMX instructions.
//!
//! Compiled only for `target_os = "none"`. Field access translates the
//! stable `mkabi::Reg` encodings to the architectural VMCS encodings; the
//! entry path parks the host RSP/RIP in the current structure and swaps the
//! full GPR file around VMLAUNCH/VMRESUME.

use crate::hve::{ExitInfo, HveError};
use core::arch::{asm, global_asm};
use mkabi::Reg;

// VMCS encodings for the exit-information fields the loop reads back.
const VMCS_EXIT_REASON: u64 = 0x4402;
const VMCS_EXIT_QUALIFICATION: u64 = 0x6400;
const VMCS_EXIT_INTERRUPTION_INFO: u64 = 0x4404;
const VMCS_EXIT_INSTRUCTION_LENGTH: u64 = 0x440C;
const VMCS_HOST_RSP: u64 = 0x6C14;
const VMCS_HOST_RIP: u64 = 0x6C16;
const VMCS_INSTRUCTION_ERROR: u64 = 0x4400;

pub fn check_support() -> Result<(), HveError> {
    // CPUID.1:ECX.VMX[bit 5]
    let ecx = unsafe { core::arch::x86_64::__cpuid(1).ecx };
    if ecx & (1 << 5) == 0 {
        return Err(HveError::NotSupported);
    }
    // IA32_FEATURE_CONTROL must be locked with VMX-outside-SMX enabled.
    let fc = crate::msr::rdmsr(crate::msr::IA32_FEATURE_CONTROL);
    if fc & 0b101 != 0b101 {
        return Err(HveError::NotSupported);
    }
    Ok(())
}

pub unsafe fn clear(phys: u64) -> Result<(), HveError> {
    let failed: u8;
    asm!(
        "vmclear [{addr}]",
        "setna {failed}",
        addr = in(reg) &phys,
        failed = out(reg_byte) failed,
    );
    if failed != 0 {
        return Err(HveError::BadStructure);
    }
    Ok(())
}

pub unsafe fn load(phys: u64) -> Result<(), HveError> {
    let failed: u8;
    asm!(
        "vmptrld [{addr}]",
        "setna {failed}",
        addr = in(reg) &phys,
        failed = out(reg_byte) failed,
    );
    if failed != 0 {
        return Err(HveError::BadStructure);
    }
    Ok(())
}

pub fn loaded() -> Option<u64> {
    let mut phys: u64 = 0;
    unsafe {
        asm!("vmptrst [{addr}]", addr = in(reg) &mut phys);
    }
    if phys == u64::MAX || phys == 0 {
        None
    } else {
        Some(phys)
    }
}

fn vmwrite(enc: u64, val: u64) -> Result<(), HveError> {
    let failed: u8;
    unsafe {
        asm!(
            "vmwrite {enc}, {val}",
            "setna {failed}",
            enc = in(reg) enc,
            val = in(reg) val,
            failed = out(reg_byte) failed,
        );
    }
    if failed != 0 {
        return Err(HveError::NothingLoaded);
    }
    Ok(())
}

fn vmread(enc: u64) -> Result<u64, HveError> {
    let val: u64;
    let failed: u8;
    unsafe {
        asm!(
            "vmread {val}, {enc}",
            "setna {failed}",
            enc = in(reg) enc,
            val = out(reg) val,
            failed = out(reg_byte) failed,
        );
    }
    if failed != 0 {
        return Err(HveError::NothingLoaded);
    }
    Ok(val)
}

/// Translate a stable ABI encoding to the architectural VMCS encoding.
fn vmcs_encoding(enc: u16) -> Result<u64, HveError> {
    let reg = Reg::from_encoding(enc).ok_or(HveError::InvalidField)?;
    Ok(match reg {
        Reg::Rip => 0x681E,
        Reg::Rsp => 0x681C,
        Reg::Rflags => 0x6820,
        Reg::Cr0 => 0x6800,
        Reg::Cr3 => 0x6802,
        Reg::Cr4 => 0x6804,
        Reg::EsSelector => 0x0800,
        Reg::CsSelector => 0x0802,
        Reg::SsSelector => 0x0804,
        Reg::DsSelector => 0x0806,
        Reg::FsSelector => 0x0808,
        Reg::GsSelector => 0x080A,
        Reg::LdtrSelector => 0x080C,
        Reg::TrSelector => 0x080E,
        Reg::EsBase => 0x6806,
        Reg::CsBase => 0x6808,
        Reg::SsBase => 0x680A,
        Reg::DsBase => 0x680C,
        Reg::FsBase => 0x680E,
        Reg::GsBase => 0x6810,
        Reg::LdtrBase => 0x6812,
        Reg::TrBase => 0x6814,
        Reg::EsLimit => 0x4800,
        Reg::CsLimit => 0x4802,
        Reg::SsLimit => 0x4804,
        Reg::DsLimit => 0x4806,
        Reg::FsLimit => 0x4808,
        Reg::GsLimit => 0x480A,
        Reg::LdtrLimit => 0x480C,
        Reg::TrLimit => 0x480E,
        Reg::EsAttrib => 0x4814,
        Reg::CsAttrib => 0x4816,
        Reg::SsAttrib => 0x4818,
        Reg::DsAttrib => 0x481A,
        Reg::FsAttrib => 0x481C,
        Reg::GsAttrib => 0x481E,
        Reg::LdtrAttrib => 0x4820,
        Reg::TrAttrib => 0x4822,
        Reg::GdtrBase => 0x6816,
        Reg::GdtrLimit => 0x4810,
        Reg::IdtrBase => 0x6818,
        Reg::IdtrLimit => 0x4812,
        Reg::Efer => 0x2806,
        Reg::Pat => 0x2804,
        Reg::Debugctl => 0x2802,
        Reg::SysenterCs => 0x482A,
        Reg::SysenterEsp => 0x6824,
        Reg::SysenterEip => 0x6826,
        Reg::Dr7 => 0x681A,
        Reg::ExitReason => VMCS_EXIT_REASON,
        Reg::ExitQualification => VMCS_EXIT_QUALIFICATION,
        Reg::ExitInterruptionInfo => VMCS_EXIT_INTERRUPTION_INFO,
        Reg::ExitInstructionLength => VMCS_EXIT_INSTRUCTION_LENGTH,
        // GPRs, CR2, and the swapped MSRs have no VMCS slot; they travel in
        // the entry frame and the MSR areas instead.
        _ => return Err(HveError::InvalidField),
    })
}

pub unsafe fn write_field(enc: u16, val: u64) -> Result<(), HveError> {
    vmwrite(vmcs_encoding(enc)?, val)
}

pub unsafe fn read_field(enc: u16) -> Result<u64, HveError> {
    vmread(vmcs_encoding(enc)?)
}

global_asm!(
    // fn __vm_entry(gprs: *mut u64 (rdi), launched: u64 (rsi)) -> u64
    //
    // Saves the host callee-saves, parks RSP in HOST_RSP, swaps in the
    // guest GPR file, and issues VMLAUNCH or VMRESUME. The exit trampoline
    // lands at __vm_exit (installed as HOST_RIP by vm_entry below), captures
    // the guest GPRs back into the same frame, and returns 0. A failed
    // entry falls through and returns 1.
    ".global __vm_entry",
    "__vm_entry:",
    "push rbp",
    "push rbx",
    "push r12",
    "push r13",
    "push r14",
    "push r15",
    "push rdi",
    "mov rax, 0x6C14", // HOST_RSP
    "vmwrite rax, rsp",
    // Latch the launched flag into ZF before the guest file lands in the
    // registers; plain moves preserve flags.
    "test rsi, rsi",
    "mov rax, [rdi + 0x78]",
    "mov cr2, rax",
    "mov rax, [rdi + 0x00]",
    "mov rbx, [rdi + 0x08]",
    "mov rcx, [rdi + 0x10]",
    "mov rdx, [rdi + 0x18]",
    "mov rbp, [rdi + 0x20]",
    "mov rsi, [rdi + 0x28]",
    "mov r8,  [rdi + 0x38]",
    "mov r9,  [rdi + 0x40]",
    "mov r10, [rdi + 0x48]",
    "mov r11, [rdi + 0x50]",
    "mov r12, [rdi + 0x58]",
    "mov r13, [rdi + 0x60]",
    "mov r14, [rdi + 0x68]",
    "mov r15, [rdi + 0x70]",
    "mov rdi, [rdi + 0x30]",
    "jne 2f",
    "vmlaunch",
    "jmp 3f",
    "2:",
    "vmresume",
    "3:",
    // Entry failed: restore and report.
    "pop rdi",
    "pop r15",
    "pop r14",
    "pop r13",
    "pop r12",
    "pop rbx",
    "pop rbp",
    "mov rax, 1",
    "ret",
    ".global __vm_exit",
    "__vm_exit:",
    // Guest RDI is live; spill it, recover the frame pointer.
    "push rdi",
    "mov rdi, [rsp + 8]",
    "mov [rdi + 0x00], rax",
    "mov [rdi + 0x08], rbx",
    "mov [rdi + 0x10], rcx",
    "mov [rdi + 0x18], rdx",
    "mov [rdi + 0x20], rbp",
    "mov [rdi + 0x28], rsi",
    "mov [rdi + 0x38], r8",
    "mov [rdi + 0x40], r9",
    "mov [rdi + 0x48], r10",
    "mov [rdi + 0x50], r11",
    "mov [rdi + 0x58], r12",
    "mov [rdi + 0x60], r13",
    "mov [rdi + 0x68], r14",
    "mov [rdi + 0x70], r15",
    "mov rax, cr2",
    "mov [rdi + 0x78], rax",
    "pop rax", // guest rdi
    "mov [rdi + 0x30], rax",
    "add rsp, 8", // drop the spilled frame pointer
    "pop r15",
    "pop r14",
    "pop r13",
    "pop r12",
    "pop rbx",
    "pop rbp",
    "xor eax, eax",
    "ret",
);

extern "C" {
    fn __vm_entry(gprs: *mut u64, launched: u64) -> u64;
    fn __vm_exit();
}

pub unsafe fn vm_entry(launched: bool, gprs: &mut [u64; 16]) -> Result<ExitInfo, HveError> {
    vmwrite(VMCS_HOST_RIP, __vm_exit as usize as u64)?;

    // Frame layout: rax..r15 in encoding order (15 registers), slot 15 is
    // guest CR2. Offsets match the __vm_entry/__vm_exit assembly.
    let failed = __vm_entry(gprs.as_mut_ptr(), launched as u64);

    if failed != 0 {
        let err = vmread(VMCS_INSTRUCTION_ERROR).unwrap_or(0);
        return Err(HveError::EntryFailed(err));
    }

    Ok(ExitInfo {
        reason: vmread(VMCS_EXIT_REASON)?,
        qualification: vmread(VMCS_EXIT_QUALIFICATION)?,
        interruption_info: vmread(VMCS_EXIT_INTERRUPTION_INFO)?,
        instruction_length: vmread(VMCS_EXIT_INSTRUCTION_LENGTH)?,
    })
}
