//! Bare-metal entry glue.
//!
//! Three pieces of assembly the Rust side cannot express: the image entry
//! point the loader jumps to, the syscall entry stub that spills the
//! extension's registers into the TLS block (reached through the per-PP
//! thread register), and the exception stubs feeding `dispatch_esr`.
//!
//! The TLS field offsets below are tied to the `#[repr(C)]` layout of
//! `tls::Tls`; the assertions keep the two in lockstep.

use crate::tls::Tls;
use core::arch::global_asm;
use core::mem::offset_of;

// Offsets the stubs below hard-code.
const TLS_EXT_SYSCALL: usize = offset_of!(Tls, ext_syscall);
const TLS_EXT_REG0: usize = offset_of!(Tls, ext_reg0);
const TLS_RET_STATUS: usize = offset_of!(Tls, syscall_ret_status);

const _: () = assert!(TLS_EXT_SYSCALL + 8 == TLS_EXT_REG0);
const _: () = assert!(TLS_EXT_REG0 + 6 * 8 == TLS_RET_STATUS);

global_asm!(
    // The loader jumps here with the per-PP args block in RDI and a fresh
    // microkernel stack already installed.
    ".global _start",
    "_start:",
    "and rsp, ~0xF",
    "call {mk_entry}",
    "hlt",
    mk_entry = sym mk_entry,
);

global_asm!(
    // SYSCALL entry: RAX opcode, RDI..R9 = REG0..REG5, RCX return RIP,
    // R11 return RFLAGS. GS base points at this PP's TLS block.
    ".global mk_syscall_entry",
    "mk_syscall_entry:",
    "swapgs",
    "mov gs:[{sys}], rax",
    "mov gs:[{r0}], rdi",
    "mov gs:[{r0} + 0x08], rsi",
    "mov gs:[{r0} + 0x10], rdx",
    "mov gs:[{r0} + 0x18], r10",
    "mov gs:[{r0} + 0x20], r8",
    "mov gs:[{r0} + 0x28], r9",
    "push rcx",
    "push r11",
    "call {dispatch}",
    "pop r11",
    "pop rcx",
    "mov rax, gs:[{ret}]",
    "mov rdi, gs:[{r0}]",
    "mov rsi, gs:[{r0} + 0x08]",
    "swapgs",
    "sysretq",
    sys = const TLS_EXT_SYSCALL,
    r0 = const TLS_EXT_REG0,
    ret = const TLS_RET_STATUS,
    dispatch = sym syscall_entry_rust,
);

/// Rust landing for the syscall stub: resolve this PP's TLS from the
/// thread register and dispatch against the global resources.
extern "C" fn syscall_entry_rust() {
    let tls = unsafe { &mut *(intrinsics::regs::tp() as *mut Tls) };
    let res = crate::global::resources();
    crate::syscall::dispatch(tls, &res);
}

/// Rust landing for `_start`.
extern "C" fn mk_entry(args: *const mkboot::MkArgs) -> ! {
    let res = crate::global::resources();
    let args = unsafe { &*args };
    let status = crate::global::CTL.handle_request(&res, crate::ctl::CtlRequest::VmmInit(args));
    if status != crate::ctl::CTL_SUCCESS {
        diag::mklog_always!("pp {:#06x}: vmm init failed", args.ppid);
    }
    intrinsics::regs::halt();
}
