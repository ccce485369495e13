//! `bf_callback_op_*`: callback registration.
//!
//! Extensions register up to three entry points during `_start`:
//! bootstrap (per-PP setup), vmexit (the steady-state handler), and fail
//! (last-chance cleanup on the fast-fail path). `wait` parks the
//! extension's start thread; from then on the extension only runs when the
//! microkernel calls it.

use crate::syscall::check_handle;
use crate::tls::Tls;
use crate::Resources;
use mkabi::syscall::callback_op;
use mkabi::SysStatus;

pub fn dispatch(tls: &mut Tls, res: &Resources, index: u16) -> SysStatus {
    if let Err(status) = check_handle(tls, res) {
        return status;
    }
    match index {
        callback_op::WAIT => {
            // Nothing to do beyond acknowledging: dispatch returns to the
            // trampoline, which parks the start context.
            SysStatus::SUCCESS
        }
        callback_op::REGISTER_BOOTSTRAP => register(tls, res, Which::Bootstrap),
        callback_op::REGISTER_VMEXIT => register(tls, res, Which::VmExit),
        callback_op::REGISTER_FAIL => register(tls, res, Which::Fail),
        _ => SysStatus::FAILURE_UNSUPPORTED,
    }
}

enum Which {
    Bootstrap,
    VmExit,
    Fail,
}

fn register(tls: &mut Tls, res: &Resources, which: Which) -> SysStatus {
    let ip = tls.ext_reg1;
    if ip == 0 {
        return SysStatus::INVALID_PARAMS1;
    }
    let ext = tls.ext;
    let result = match which {
        Which::Bootstrap => res.ext_pool.register_bootstrap(ext, ip),
        Which::VmExit => {
            let r = res.ext_pool.register_vmexit(ext, ip);
            if r.is_ok() {
                tls.ext_vmexit = ext;
            }
            r
        }
        Which::Fail => {
            let r = res.ext_pool.register_fail(ext, ip);
            if r.is_ok() {
                tls.ext_fail = ext;
            }
            r
        }
    };
    match result {
        Ok(()) => SysStatus::SUCCESS,
        Err(_) => SysStatus::FAILURE_UNKNOWN,
    }
}
