//! Microvisor diagnostics.
//!
//! Three pieces, all append-only and loss-tolerant:
//!
//! | Piece | What it holds | Who reads it |
//! |-------|---------------|--------------|
//! | [`debug_ring`] | formatted log bytes | the host, via `GET_DRR` |
//! | [`log`] macros | level-gated producers for the ring | — |
//! | [`vmexit_log`] | per-PP ring of VMExit records | `bf_debug_op_dump_vmexit_log` |
//!
//! The debug ring is the only channel the microkernel ever blocks nothing
//! on: wrap-around silently discards the oldest bytes, because losing a log
//! line is always preferable to stalling a PP in VMX root mode.
//!
//! # Log levels
//!
//! The [`mklog!`] filter is runtime and starts fully open; the loader can
//! quiet it through the debug syscalls. The hot-path cost of a suppressed
//! message is one relaxed atomic load and an integer compare.

#![no_std]

extern crate alloc;

pub mod debug_ring;
pub mod log;
pub mod vmexit_log;

#[cfg(target_os = "none")]
mod serial;

pub use log::Level;
pub use vmexit_log::{VmExitRecord, VMEXIT_LOG_SIZE};
