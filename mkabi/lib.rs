//! Microvisor syscall ABI.
//!
//! Everything an extension (or the loader) must agree on with the
//! microkernel lives in this crate: object identifiers, the packed thread
//! tag, syscall opcodes and status codes, architectural register encodings,
//! and the fixed virtual-memory layout. The crate is pure `core` so both
//! the microkernel and extension SDKs can depend on it without dragging in
//! any subsystem.
//!
//! # Layout of a syscall
//!
//! ```text
//! RAX on entry:  [63:48 signature][47:32 rsvd][31:16 category][15:0 index]
//! RDI..R9:       REG0..REG5 (REG0 is the handle for most categories)
//! RAX on return: SysStatus
//! ```

#![no_std]

pub mod ids;
pub mod layout;
pub mod reg;
pub mod status;
pub mod syscall;

pub use ids::{Id, ThreadTag};
pub use reg::Reg;
pub use status::SysStatus;
