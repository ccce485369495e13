//! `bf_vps_op_*`: the virtual-processor-state surface.
//!
//! `run` is the one operation that does not complete inside the syscall:
//! it validates the (vm, vp, vps) triple, moves the active markers, and
//! queues the entry for the VMExit loop, which performs it once the
//! extension callback returns. `promote` similarly queues the reverse
//! demote.

use crate::syscall::{check_handle, check_vmexit_registered, obj_status};
use crate::tls::Tls;
use crate::{ObjError, Resources};
use mkabi::layout::MAX_PPS;
use mkabi::reg::Width;
use mkabi::syscall::vps_op;
use mkabi::{Id, Reg, SysStatus};

pub fn dispatch(tls: &mut Tls, res: &Resources, index: u16) -> SysStatus {
    if let Err(status) = check_handle(tls, res) {
        return status;
    }
    if let Err(status) = check_vmexit_registered(tls, res) {
        return status;
    }
    match index {
        vps_op::CREATE_VPS => create_vps(tls, res),
        vps_op::DESTROY_VPS => destroy_vps(tls, res),
        vps_op::INIT_AS_ROOT => init_as_root(tls, res),
        vps_op::READ8 => read_sized(tls, res, Width::W16, 0xFF),
        vps_op::READ16 => read_sized(tls, res, Width::W16, u16::MAX as u64),
        vps_op::READ32 => read_sized(tls, res, Width::W32, u32::MAX as u64),
        vps_op::READ64 => read_sized(tls, res, Width::W64, u64::MAX),
        vps_op::WRITE8 => write_sized(tls, res, Width::W16, 0xFF),
        vps_op::WRITE16 => write_sized(tls, res, Width::W16, u16::MAX as u64),
        vps_op::WRITE32 => write_sized(tls, res, Width::W32, u32::MAX as u64),
        vps_op::WRITE64 => write_sized(tls, res, Width::W64, u64::MAX),
        vps_op::READ_REG => read_reg(tls, res),
        vps_op::WRITE_REG => write_reg(tls, res),
        vps_op::RUN => run(tls, res),
        vps_op::RUN_CURRENT => run_current(tls),
        vps_op::ADVANCE_IP => advance_ip(tls, res),
        vps_op::ADVANCE_IP_AND_RUN_CURRENT => {
            let status = advance_ip(tls, res);
            if !status.is_success() {
                return status;
            }
            run_current(tls)
        }
        vps_op::PROMOTE => promote(tls, res),
        vps_op::CLEAR_VPS => clear_vps(tls, res),
        _ => SysStatus::FAILURE_UNSUPPORTED,
    }
}

fn vpsid_arg(tls: &Tls) -> Result<Id, SysStatus> {
    if tls.ext_reg1 > u16::MAX as u64 {
        return Err(SysStatus::INVALID_PARAMS1);
    }
    Ok(Id::new(tls.ext_reg1 as u16))
}

fn create_vps(tls: &mut Tls, res: &Resources) -> SysStatus {
    let vpid = Id::new(tls.ext_reg1 as u16);
    let ppid = Id::new(tls.ext_reg2 as u16);
    if tls.ext_reg1 > u16::MAX as u64 || !res.vp_pool.is_allocated(vpid) {
        return SysStatus::INVALID_PARAMS1;
    }
    if ppid.as_usize() >= MAX_PPS {
        return SysStatus::INVALID_PARAMS2;
    }
    match res.vps_pool.allocate(res.huge_pool, vpid, ppid) {
        Ok(vpsid) => {
            tls.ext_reg0 = (tls.ext_reg0 & 0xFFFF_FFFF_FFFF_0000) | vpsid.get() as u64;
            SysStatus::SUCCESS
        }
        Err(e) => obj_status(e),
    }
}

fn destroy_vps(tls: &mut Tls, res: &Resources) -> SysStatus {
    let vpsid = match vpsid_arg(tls) {
        Ok(id) => id,
        Err(s) => return s,
    };
    // Destroying the state under a running (or merely loaded) guest is a
    // protocol violation, not a cleanup path.
    if tls.active_vpsid == vpsid
        || res.tls_pool.vps_active_on(vpsid).is_some()
        || res.tls_pool.vps_loaded_on(vpsid).is_some()
    {
        return SysStatus::FAILURE_UNKNOWN;
    }
    match res.vps_pool.deallocate(res.huge_pool, res.tls_pool, vpsid) {
        Ok(()) => SysStatus::SUCCESS,
        Err(e) => obj_status(e),
    }
}

fn init_as_root(tls: &mut Tls, res: &Resources) -> SysStatus {
    let vpsid = match vpsid_arg(tls) {
        Ok(id) => id,
        Err(s) => return s,
    };
    let state = tls.root_vp_state;
    match res.vps_pool.init_as_root(tls, vpsid, &state) {
        Ok(()) => SysStatus::SUCCESS,
        Err(e) => obj_status(e),
    }
}

fn read_sized(tls: &mut Tls, res: &Resources, width: Width, mask: u64) -> SysStatus {
    let vpsid = match vpsid_arg(tls) {
        Ok(id) => id,
        Err(s) => return s,
    };
    let enc = tls.ext_reg2 as u16;
    match res.vps_pool.read_sized(vpsid, enc, width) {
        Ok(val) => {
            tls.ext_reg0 = val & mask;
            SysStatus::SUCCESS
        }
        Err(ObjError::InvalidId) => SysStatus::INVALID_PARAMS2,
        Err(e) => obj_status(e),
    }
}

fn write_sized(tls: &mut Tls, res: &Resources, width: Width, mask: u64) -> SysStatus {
    let vpsid = match vpsid_arg(tls) {
        Ok(id) => id,
        Err(s) => return s,
    };
    let enc = tls.ext_reg2 as u16;
    let val = tls.ext_reg3 & mask;
    match res.vps_pool.write_sized(tls, vpsid, enc, width, val) {
        Ok(()) => SysStatus::SUCCESS,
        Err(ObjError::InvalidId) => SysStatus::INVALID_PARAMS2,
        Err(e) => obj_status(e),
    }
}

fn read_reg(tls: &mut Tls, res: &Resources) -> SysStatus {
    let vpsid = match vpsid_arg(tls) {
        Ok(id) => id,
        Err(s) => return s,
    };
    let Some(reg) = Reg::from_encoding(tls.ext_reg2 as u16) else {
        return SysStatus::INVALID_PARAMS2;
    };
    match res.vps_pool.read_reg(vpsid, reg) {
        Ok(val) => {
            tls.ext_reg0 = val;
            SysStatus::SUCCESS
        }
        Err(e) => obj_status(e),
    }
}

fn write_reg(tls: &mut Tls, res: &Resources) -> SysStatus {
    let vpsid = match vpsid_arg(tls) {
        Ok(id) => id,
        Err(s) => return s,
    };
    let Some(reg) = Reg::from_encoding(tls.ext_reg2 as u16) else {
        return SysStatus::INVALID_PARAMS2;
    };
    let val = tls.ext_reg3;
    match res.vps_pool.write_reg(tls, vpsid, reg, val) {
        Ok(()) => SysStatus::SUCCESS,
        Err(e) => obj_status(e),
    }
}

/// `bf_vps_op_run(vmid, vpid, vpsid)`: validate the triple, move the
/// active markers, queue the entry.
fn run(tls: &mut Tls, res: &Resources) -> SysStatus {
    let vmid = Id::new(tls.ext_reg1 as u16);
    let vpid = Id::new(tls.ext_reg2 as u16);
    let vpsid = Id::new(tls.ext_reg3 as u16);

    if !res.vm_pool.is_allocated(vmid) {
        return SysStatus::INVALID_PARAMS1;
    }
    if !res.vp_pool.is_allocated(vpid) {
        return SysStatus::INVALID_PARAMS2;
    }
    if !res.vps_pool.is_allocated(vpsid) {
        return SysStatus::INVALID_PARAMS3;
    }
    // The triple must be a chain: vps -> vp -> vm, all homed on this PP.
    if res.vps_pool.assigned_vp(vpsid) != Ok(vpid) {
        return SysStatus::INVALID_PARAMS3;
    }
    if res.vp_pool.assigned_vm(vpid) != Ok(vmid) {
        return SysStatus::INVALID_PARAMS2;
    }
    let pp = tls.ppid();
    if res.vp_pool.assigned_pp(vpid) != Ok(pp) || res.vps_pool.assigned_pp(vpsid) != Ok(pp) {
        return SysStatus::INVALID_PARAMS2;
    }

    // Swap the active triple if it changes.
    if tls.active_vpsid != vpsid {
        if tls.active_vpsid.is_valid() {
            let old = tls.active_vpsid;
            if res.vps_pool.set_inactive(tls, old).is_err() {
                return SysStatus::FAILURE_UNKNOWN;
            }
        }
        if let Err(e) = res.vps_pool.set_active(tls, vpsid) {
            return obj_status(e);
        }
    }
    if tls.active_vpid != vpid {
        if tls.active_vpid.is_valid() {
            let old = tls.active_vpid;
            if res.vp_pool.set_inactive(tls, old).is_err() {
                return SysStatus::FAILURE_UNKNOWN;
            }
        }
        if let Err(e) = res.vp_pool.set_active(tls, vpid) {
            return obj_status(e);
        }
    }
    if tls.active_vmid != vmid {
        if tls.active_vmid.is_valid() {
            let old = tls.active_vmid;
            if res.vm_pool.set_inactive(tls, old).is_err() {
                return SysStatus::FAILURE_UNKNOWN;
            }
        }
        if let Err(e) = res.vm_pool.set_active(tls, vmid) {
            return obj_status(e);
        }
    }

    tls.request_run(vpsid);
    SysStatus::SUCCESS
}

fn run_current(tls: &mut Tls) -> SysStatus {
    if tls.active_vpsid.is_invalid() {
        return SysStatus::FAILURE_UNKNOWN;
    }
    let vpsid = tls.active_vpsid;
    tls.request_run(vpsid);
    SysStatus::SUCCESS
}

fn advance_ip(tls: &mut Tls, res: &Resources) -> SysStatus {
    let vpsid = match vpsid_arg(tls) {
        Ok(id) => id,
        Err(s) => return s,
    };
    match res.vps_pool.advance_ip(tls, vpsid) {
        Ok(()) => SysStatus::SUCCESS,
        Err(e) => obj_status(e),
    }
}

fn promote(tls: &mut Tls, res: &Resources) -> SysStatus {
    let vpsid = match vpsid_arg(tls) {
        Ok(id) => id,
        Err(s) => return s,
    };
    match res.vps_pool.vps_to_state(vpsid) {
        Ok(state) => {
            tls.root_vp_state = state;
            tls.request_promote();
            SysStatus::SUCCESS
        }
        Err(e) => obj_status(e),
    }
}

fn clear_vps(tls: &mut Tls, res: &Resources) -> SysStatus {
    let vpsid = match vpsid_arg(tls) {
        Ok(id) => id,
        Err(s) => return s,
    };
    match res.vps_pool.clear(tls, vpsid) {
        Ok(()) => SysStatus::SUCCESS,
        Err(e) => obj_status(e),
    }
}

#[cfg(test)]
mod tests {
    use crate::syscall::testutil::*;
    use mkabi::syscall::{category, opcode, vps_op};
    use mkabi::{Id, Reg, SysStatus};

    struct Ready {
        tls: crate::tls::Tls,
        handle: u64,
        vpid: Id,
        vpsid: Id,
    }

    fn ready(f: &Fixture) -> Ready {
        let res = f.resources();
        let mut tls = f.ext_tls(0);
        let handle = open_handle(&mut tls, &res);
        register_vmexit(&mut tls, &res, handle);
        let vpid = res.vp_pool.allocate(Id::new(0), Id::new(0)).unwrap();
        let st = invoke_regs(
            &mut tls,
            &res,
            opcode(category::VPS, vps_op::CREATE_VPS),
            [handle, vpid.get() as u64, 0, 0, 0, 0],
        );
        assert!(st.is_success());
        let vpsid = Id::new((tls.ext_reg0 & 0xFFFF) as u16);
        Ready {
            tls,
            handle,
            vpid,
            vpsid,
        }
    }

    #[test]
    fn create_against_a_missing_vp_is_invalid() {
        let f = fixture();
        let res = f.resources();
        let mut tls = f.ext_tls(0);
        let handle = open_handle(&mut tls, &res);
        register_vmexit(&mut tls, &res, handle);
        let st = invoke_regs(
            &mut tls,
            &res,
            opcode(category::VPS, vps_op::CREATE_VPS),
            [handle, 7, 0, 0, 0, 0],
        );
        assert_eq!(st, SysStatus::INVALID_PARAMS1);
    }

    #[test]
    fn field_io_round_trips_through_the_abi() {
        let _guard = intrinsics::soft::test_guard();
        intrinsics::soft::reset();
        let f = fixture();
        let res = f.resources();
        let mut r = ready(&f);

        let st = invoke_regs(
            &mut r.tls,
            &res,
            opcode(category::VPS, vps_op::WRITE_REG),
            [
                r.handle,
                r.vpsid.get() as u64,
                Reg::Rip.encoding() as u64,
                0xFEED_F00D,
                0,
                0,
            ],
        );
        assert!(st.is_success());
        let st = invoke_regs(
            &mut r.tls,
            &res,
            opcode(category::VPS, vps_op::READ_REG),
            [r.handle, r.vpsid.get() as u64, Reg::Rip.encoding() as u64, 0, 0, 0],
        );
        assert!(st.is_success());
        assert_eq!(r.tls.ext_reg0, 0xFEED_F00D);

        // Sized access with a mismatched width is an argument error.
        let st = invoke_regs(
            &mut r.tls,
            &res,
            opcode(category::VPS, vps_op::WRITE16),
            [r.handle, r.vpsid.get() as u64, Reg::Rip.encoding() as u64, 1, 0, 0],
        );
        assert_eq!(st, SysStatus::INVALID_PARAMS2);
    }

    #[test]
    fn run_validates_the_triple_and_queues_the_entry() {
        let _guard = intrinsics::soft::test_guard();
        intrinsics::soft::reset();
        let f = fixture();
        let res = f.resources();
        let mut r = ready(&f);

        // Wrong vp for the vps.
        let st = invoke_regs(
            &mut r.tls,
            &res,
            opcode(category::VPS, vps_op::RUN),
            [r.handle, 0, 0x3333, r.vpsid.get() as u64, 0, 0],
        );
        assert!(!st.is_success());

        let st = invoke_regs(
            &mut r.tls,
            &res,
            opcode(category::VPS, vps_op::RUN),
            [
                r.handle,
                0,
                r.vpid.get() as u64,
                r.vpsid.get() as u64,
                0,
                0,
            ],
        );
        assert!(st.is_success());
        assert_eq!(r.tls.active_vmid.get(), 0);
        assert_eq!(r.tls.active_vpid, r.vpid);
        assert_eq!(r.tls.active_vpsid, r.vpsid);
        assert_eq!(r.tls.take_run_request(), Some(r.vpsid));
    }

    #[test]
    fn destroy_refuses_the_active_vps() {
        let _guard = intrinsics::soft::test_guard();
        intrinsics::soft::reset();
        let f = fixture();
        let res = f.resources();
        let mut r = ready(&f);
        invoke_regs(
            &mut r.tls,
            &res,
            opcode(category::VPS, vps_op::RUN),
            [
                r.handle,
                0,
                r.vpid.get() as u64,
                r.vpsid.get() as u64,
                0,
                0,
            ],
        );
        let st = invoke_regs(
            &mut r.tls,
            &res,
            opcode(category::VPS, vps_op::DESTROY_VPS),
            [r.handle, r.vpsid.get() as u64, 0, 0, 0, 0],
        );
        assert_eq!(st, SysStatus::FAILURE_UNKNOWN);
    }

    #[test]
    fn promote_writes_the_state_back_and_requests_exit() {
        let _guard = intrinsics::soft::test_guard();
        intrinsics::soft::reset();
        let f = fixture();
        let res = f.resources();
        let mut r = ready(&f);

        invoke_regs(
            &mut r.tls,
            &res,
            opcode(category::VPS, vps_op::WRITE_REG),
            [
                r.handle,
                r.vpsid.get() as u64,
                Reg::Rip.encoding() as u64,
                0xAAAA_0000,
                0,
                0,
            ],
        );
        let st = invoke_regs(
            &mut r.tls,
            &res,
            opcode(category::VPS, vps_op::PROMOTE),
            [r.handle, r.vpsid.get() as u64, 0, 0, 0, 0],
        );
        assert!(st.is_success());
        assert_eq!(r.tls.root_vp_state.rip, 0xAAAA_0000);
        assert!(r.tls.take_promote_request());
    }
}
