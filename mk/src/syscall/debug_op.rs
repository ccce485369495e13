//! `bf_debug_op_*`: diagnostics.
//!
//! Debug ops are deliberately not handle-gated so an extension can still
//! shout while it is too broken to open a handle. Everything lands in the
//! debug ring.

use crate::tls::Tls;
use crate::Resources;
use mkabi::syscall::debug_op;
use mkabi::{Id, SysStatus};

pub fn dispatch(tls: &mut Tls, res: &Resources, index: u16) -> SysStatus {
    match index {
        debug_op::OUT => {
            diag::mklog_always!("{:#018x} {:#018x}", tls.ext_reg0, tls.ext_reg1);
            SysStatus::SUCCESS
        }
        debug_op::WRITE_C => {
            let c = (tls.ext_reg0 & 0xFF) as u8;
            if c.is_ascii() {
                diag::debug_ring::write(&[c]);
            }
            SysStatus::SUCCESS
        }
        debug_op::WRITE_STR => write_str(tls, res),
        debug_op::DUMP_VM => {
            res.vm_pool.dump(Id::new(tls.ext_reg1 as u16));
            SysStatus::SUCCESS
        }
        debug_op::DUMP_VP => {
            res.vp_pool.dump(Id::new(tls.ext_reg1 as u16));
            SysStatus::SUCCESS
        }
        debug_op::DUMP_VPS => {
            res.vps_pool.dump(Id::new(tls.ext_reg1 as u16));
            SysStatus::SUCCESS
        }
        debug_op::DUMP_VMEXIT_LOG => {
            diag::vmexit_log::dump(tls.ext_reg1 as usize);
            SysStatus::SUCCESS
        }
        debug_op::DUMP_EXT => {
            res.ext_pool.dump();
            SysStatus::SUCCESS
        }
        debug_op::DUMP_PAGE_POOL => {
            res.page_pool.lock().dump();
            SysStatus::SUCCESS
        }
        debug_op::DUMP_HUGE_POOL => {
            res.huge_pool.lock().dump();
            SysStatus::SUCCESS
        }
        _ => SysStatus::FAILURE_UNSUPPORTED,
    }
}

/// Print a NUL-terminated string from the caller's address space. The
/// string must sit inside one page; anything unmappable is dropped.
fn write_str(tls: &mut Tls, res: &Resources) -> SysStatus {
    let ext_virt = tls.ext_reg0;
    let resolved = res
        .ext_pool
        .with_ext(tls.ext, |e| e.virt_to_phys(res, ext_virt));
    let phys = match resolved {
        Ok(Ok(phys)) => phys,
        _ => return SysStatus::INVALID_PARAMS0,
    };
    let pool = res.page_pool.lock();
    let Ok(mk_virt) = pool.phys_to_virt(phys) else {
        return SysStatus::INVALID_PARAMS0;
    };
    // Stay inside the resolved page.
    let room = 4096 - (mk_virt as usize & 0xFFF);
    let bytes = unsafe { core::slice::from_raw_parts(mk_virt as *const u8, room) };
    let len = bytes.iter().position(|&b| b == 0).unwrap_or(room);
    diag::debug_ring::write(&bytes[..len]);
    SysStatus::SUCCESS
}
