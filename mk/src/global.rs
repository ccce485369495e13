//! The global resource singletons.
//!
//! Each pool is a named module-level value with an explicit
//! `initialize`/`release` lifecycle driven by `mk_main` and `ctl`; no
//! lazily-materialized state hides in here. The [`resources`] bundle is
//! how the bare-metal entry paths hand the singletons to code that is
//! otherwise written against caller-provided pools (and is therefore
//! equally usable against local instances under test).

use crate::ctl::Ctl;
use crate::ext_pool::ExtPool;
use crate::tls::TlsPool;
use crate::vm::VmPool;
use crate::vp::VpPool;
use crate::vps::VpsPool;
use crate::Resources;
use lazy_static::lazy_static;
use mm::{HugePool, PagePool, RootPageTable};
use spin::Mutex;

lazy_static! {
    pub static ref PAGE_POOL: Mutex<PagePool> = Mutex::new(PagePool::new());
    pub static ref HUGE_POOL: Mutex<HugePool> = Mutex::new(HugePool::new());
    pub static ref SYSTEM_RPT: Mutex<RootPageTable> = Mutex::new(RootPageTable::new());
}

pub static VM_POOL: VmPool = VmPool::new();
pub static VP_POOL: VpPool = VpPool::new();
pub static VPS_POOL: VpsPool = VpsPool::new();
pub static EXT_POOL: ExtPool = ExtPool::new();
pub static TLS_POOL: TlsPool = TlsPool::new();

/// The system mailbox endpoint.
pub static CTL: Ctl = Ctl::new();

/// The global singletons as a resource bundle.
pub fn resources() -> Resources<'static> {
    Resources {
        page_pool: &*PAGE_POOL,
        huge_pool: &*HUGE_POOL,
        system_rpt: &*SYSTEM_RPT,
        vm_pool: &VM_POOL,
        vp_pool: &VP_POOL,
        vps_pool: &VPS_POOL,
        ext_pool: &EXT_POOL,
        tls_pool: &TLS_POOL,
    }
}
