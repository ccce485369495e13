//! The microkernel image.
//!
//! On `target_os = "none"` this binary is the thing the loader maps and
//! jumps into; the real entry point is the `_start` stub in the library's
//! entry glue, so `main` never runs there. On a host this binary exists
//! only to tell a confused operator what they are holding.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(target_os = "none")]
extern crate mk;

#[cfg(target_os = "none")]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    diag::mklog_always!("microkernel panic: {}", info);
    intrinsics::regs::halt();
}

#[cfg(not(target_os = "none"))]
fn main() {
    eprintln!("microvisor: this image must be loaded by the loader driver; it does not run as a host process");
    std::process::exit(1);
}
