//! `bf_handle_op_*`: the handle grant protocol.
//!
//! An extension's first syscall is `open_handle`; everything else it does
//! is gated on presenting the granted value back in REG0.

use crate::syscall::check_handle;
use crate::tls::Tls;
use crate::Resources;
use mkabi::syscall::handle_op;
use mkabi::SysStatus;

pub fn dispatch(tls: &mut Tls, res: &Resources, index: u16) -> SysStatus {
    match index {
        handle_op::OPEN_HANDLE => open_handle(tls, res),
        handle_op::CLOSE_HANDLE => close_handle(tls, res),
        _ => SysStatus::FAILURE_UNSUPPORTED,
    }
}

fn open_handle(tls: &mut Tls, res: &Resources) -> SysStatus {
    match res.ext_pool.with_ext(tls.ext, |e| e.open_handle()) {
        Ok(Ok(handle)) => {
            tls.ext_reg0 = handle;
            SysStatus::SUCCESS
        }
        Ok(Err(_)) => SysStatus::FAILURE_UNKNOWN,
        Err(_) => SysStatus::FAILURE_UNKNOWN,
    }
}

fn close_handle(tls: &mut Tls, res: &Resources) -> SysStatus {
    if let Err(status) = check_handle(tls, res) {
        return status;
    }
    match res.ext_pool.with_ext(tls.ext, |e| e.close_handle()) {
        Ok(()) => SysStatus::SUCCESS,
        Err(_) => SysStatus::FAILURE_UNKNOWN,
    }
}

#[cfg(test)]
mod tests {
    use crate::syscall::testutil::*;
    use mkabi::syscall::{category, handle_op, opcode};
    use mkabi::SysStatus;

    #[test]
    fn open_then_close() {
        let f = fixture();
        let res = f.resources();
        let mut tls = f.ext_tls(0);

        let st = invoke(&mut tls, &res, opcode(category::HANDLE, handle_op::OPEN_HANDLE));
        assert_eq!(st, SysStatus::SUCCESS);
        let handle = tls.ext_reg0;
        assert_eq!(handle, 1);

        // Reopening without closing is refused.
        let st = invoke(&mut tls, &res, opcode(category::HANDLE, handle_op::OPEN_HANDLE));
        assert_eq!(st, SysStatus::FAILURE_UNKNOWN);

        let st = invoke_regs(
            &mut tls,
            &res,
            opcode(category::HANDLE, handle_op::CLOSE_HANDLE),
            [handle, 0, 0, 0, 0, 0],
        );
        assert_eq!(st, SysStatus::SUCCESS);
    }

    #[test]
    fn close_with_a_bad_handle_is_rejected() {
        let f = fixture();
        let res = f.resources();
        let mut tls = f.ext_tls(0);
        open_handle(&mut tls, &res);
        let st = invoke_regs(
            &mut tls,
            &res,
            opcode(category::HANDLE, handle_op::CLOSE_HANDLE),
            [0xBAD, 0, 0, 0, 0, 0],
        );
        assert_eq!(st, SysStatus::FAILURE_INVALID_HANDLE);
    }
}
