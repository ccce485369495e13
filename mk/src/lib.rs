//! The Microvisor microkernel core.
//!
//! Everything above the memory layer lives here: the per-PP TLS blocks,
//! the VM / VP / VPS object pools with their zombification protocol, the
//! extension pool (ELF loading, dedicated RPTs, callback dispatch), the
//! syscall surface, the per-PP VMExit loop, the fast-fail landing sites,
//! and the control mailbox the loader drives.
//!
//! # Resource wiring
//!
//! Pools are explicit values with `initialize`/`release`; the [`Resources`]
//! bundle threads shared references to all of them through every path, so
//! the same code runs against the global singletons on hardware and against
//! local instances under test. Object pools carry their own internal lock;
//! the memory pools and the system RPT are locked at the bundle level. No
//! path holds two pool locks at once except in the order [`lock_order`]
//! documents.

#![no_std]

extern crate alloc;

pub mod ctl;
pub mod esr;
pub mod ext;
pub mod ext_pool;
pub mod fast_fail;
pub mod global;
pub mod lock_order;
pub mod mk_main;
pub mod syscall;
pub mod tls;
pub mod vm;
pub mod vmexit_loop;
pub mod vp;
pub mod vps;

#[cfg(target_os = "none")]
mod entry;

use mm::{HugePool, PagePool, RootPageTable};
use spin::Mutex;

/// Lifecycle state shared by VM, VP, and VPS objects.
///
/// `Zombie` is terminal: an object whose destruction failed partway keeps
/// its resources, answers every mutating operation with failure, and is
/// skipped by allocation forever after. The one exception is
/// `set_inactive`, which still works so cleanup can drain.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ObjState {
    #[default]
    Deallocated,
    Allocated,
    Zombie,
}

/// Failures from the VM / VP / VPS pools.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObjError {
    /// The id names no slot.
    InvalidId,
    /// Every slot is allocated or zombied.
    PoolFull,
    /// The operation needs an allocated object.
    NotAllocated,
    /// The object is a zombie.
    Zombie,
    /// The object is active (or loaded) somewhere.
    Active,
    /// The object is not active where the caller claims.
    NotActive,
    /// Another object of the same kind is already active on this PP.
    PpBusy,
    /// The root VM is exempt from this operation.
    RootForbidden,
    /// The object is bound to a different PP than the caller's.
    WrongPp,
    /// The control structure was last loaded on another PP and has not
    /// been cleared there.
    NeedsClear,
    /// The underlying pool failed.
    Pool(mm::PoolError),
    /// The control-structure surface failed.
    Hve(intrinsics::HveError),
}

impl From<mm::PoolError> for ObjError {
    fn from(e: mm::PoolError) -> Self {
        ObjError::Pool(e)
    }
}

impl From<intrinsics::HveError> for ObjError {
    fn from(e: intrinsics::HveError) -> Self {
        ObjError::Hve(e)
    }
}

/// Shared references to every pool the microkernel owns.
///
/// `Copy` on purpose: handlers pass it down by value, and nothing in the
/// bundle is stateful beyond the references themselves.
#[derive(Clone, Copy)]
pub struct Resources<'a> {
    pub page_pool: &'a Mutex<PagePool>,
    pub huge_pool: &'a Mutex<HugePool>,
    pub system_rpt: &'a Mutex<RootPageTable>,
    pub vm_pool: &'a vm::VmPool,
    pub vp_pool: &'a vp::VpPool,
    pub vps_pool: &'a vps::VpsPool,
    pub ext_pool: &'a ext_pool::ExtPool,
    pub tls_pool: &'a tls::TlsPool,
}

/// Top-level microkernel failures. Every variant is terminal for the
/// operation that produced it; recoverable conditions travel as syscall
/// statuses instead.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MkError {
    /// This processor cannot enter (or was denied) HVE root mode.
    HveUnsupported,
    /// The PP was not in the state the request requires.
    BadPpState,
    /// A pool operation failed during init or teardown.
    Pool(mm::PoolError),
    /// An RPT operation failed during init or teardown.
    Map(mm::MapError),
    /// Extension loading or dispatch failed.
    Ext(ext::ExtError),
    /// A control-structure operation failed.
    Hve(intrinsics::HveError),
    /// The bootstrap callback never issued `bf_vps_op_run`.
    NoRunRequested,
    /// No extension registered a VMExit handler.
    NoVmExitHandler,
    /// No extension registered a fast-fail handler.
    NoFailHandler,
    /// A VMExit was delivered and the handler neither ran a VPS nor
    /// requested promotion.
    UnhandledVmExit,
}

impl From<mm::PoolError> for MkError {
    fn from(e: mm::PoolError) -> Self {
        MkError::Pool(e)
    }
}

impl From<mm::MapError> for MkError {
    fn from(e: mm::MapError) -> Self {
        MkError::Map(e)
    }
}

impl From<ext::ExtError> for MkError {
    fn from(e: ext::ExtError) -> Self {
        MkError::Ext(e)
    }
}

impl From<intrinsics::HveError> for MkError {
    fn from(e: intrinsics::HveError) -> Self {
        MkError::Hve(e)
    }
}
