//! The loader ↔ microkernel contract.
//!
//! The loader (an OS kernel module or UEFI application, external to this
//! workspace) allocates the physical pools, builds the ELF images, captures
//! the running OS's register state, and then drives the microkernel through
//! the control mailbox: global init once, then one `VMM_INIT` per physical
//! processor to demote that PP's running OS into the root VM.
//!
//! This crate defines the data the loader hands over ([`MkArgs`],
//! [`StateSave`], [`Span`], [`PoolSpan`], [`MemoryDescriptor`]) and the
//! mailbox request codes ([`req`]). It deliberately contains no behavior.

#![no_std]

pub mod args;
pub mod req;
pub mod state;

pub use args::{MkArgs, PoolSpan, Span};
pub use req::{MdKind, MemoryDescriptor};
pub use state::StateSave;
