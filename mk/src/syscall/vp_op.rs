//! `bf_vp_op_*`: VP lifecycle and migration.

use crate::syscall::{check_handle, check_vmexit_registered, obj_status};
use crate::tls::Tls;
use crate::{ObjState, Resources};
use mkabi::layout::MAX_PPS;
use mkabi::syscall::vp_op;
use mkabi::{Id, SysStatus};

pub fn dispatch(tls: &mut Tls, res: &Resources, index: u16) -> SysStatus {
    if let Err(status) = check_handle(tls, res) {
        return status;
    }
    if let Err(status) = check_vmexit_registered(tls, res) {
        return status;
    }
    match index {
        vp_op::CREATE_VP => create_vp(tls, res),
        vp_op::DESTROY_VP => destroy_vp(tls, res),
        vp_op::MIGRATE => migrate(tls, res),
        _ => SysStatus::FAILURE_UNSUPPORTED,
    }
}

fn create_vp(tls: &mut Tls, res: &Resources) -> SysStatus {
    let vmid = Id::new(tls.ext_reg1 as u16);
    let ppid = Id::new(tls.ext_reg2 as u16);
    if tls.ext_reg1 > u16::MAX as u64 || !res.vm_pool.is_allocated(vmid) {
        return SysStatus::INVALID_PARAMS1;
    }
    if ppid.as_usize() >= MAX_PPS {
        return SysStatus::INVALID_PARAMS2;
    }
    match res.vp_pool.allocate(vmid, ppid) {
        Ok(vpid) => {
            tls.ext_reg0 = (tls.ext_reg0 & 0xFFFF_FFFF_FFFF_0000) | vpid.get() as u64;
            SysStatus::SUCCESS
        }
        Err(e) => obj_status(e),
    }
}

fn destroy_vp(tls: &mut Tls, res: &Resources) -> SysStatus {
    let vpid = Id::new(tls.ext_reg1 as u16);
    if tls.ext_reg1 > u16::MAX as u64 {
        return SysStatus::INVALID_PARAMS1;
    }
    match res.vp_pool.state(vpid) {
        Ok(ObjState::Allocated) => {}
        Ok(_) => return SysStatus::FAILURE_UNKNOWN,
        Err(e) => return obj_status(e),
    }
    if matches!(res.vp_pool.is_active(vpid), Ok(Some(_)))
        || res.tls_pool.vp_active_on(vpid).is_some()
    {
        return SysStatus::FAILURE_UNKNOWN;
    }
    // A VP that still owns VPSs dies the zombie way.
    if res.vps_pool.first_assigned_to_vp(vpid).is_some() {
        let _ = res.vp_pool.zombify(vpid);
        return SysStatus::FAILURE_UNKNOWN;
    }
    match res.vp_pool.deallocate(vpid) {
        Ok(()) => SysStatus::SUCCESS,
        Err(e) => obj_status(e),
    }
}

fn migrate(tls: &mut Tls, res: &Resources) -> SysStatus {
    let vpid = Id::new(tls.ext_reg1 as u16);
    let ppid = Id::new(tls.ext_reg2 as u16);
    if tls.ext_reg1 > u16::MAX as u64 {
        return SysStatus::INVALID_PARAMS1;
    }
    if ppid.as_usize() >= MAX_PPS {
        return SysStatus::INVALID_PARAMS2;
    }
    if res.tls_pool.vp_active_on(vpid).is_some() {
        return SysStatus::FAILURE_UNKNOWN;
    }
    match res.vp_pool.migrate(vpid, ppid) {
        Ok(()) => SysStatus::SUCCESS,
        Err(e) => obj_status(e),
    }
}

#[cfg(test)]
mod tests {
    use crate::syscall::testutil::*;
    use mkabi::syscall::{category, opcode, vp_op};
    use mkabi::{Id, SysStatus};

    fn ready(f: &crate::syscall::testutil::Fixture) -> (crate::tls::Tls, u64) {
        let res = f.resources();
        let mut tls = f.ext_tls(0);
        let handle = open_handle(&mut tls, &res);
        register_vmexit(&mut tls, &res, handle);
        (tls, handle)
    }

    #[test]
    fn create_binds_to_vm_and_pp() {
        let f = fixture();
        let res = f.resources();
        let (mut tls, handle) = ready(&f);
        let st = invoke_regs(
            &mut tls,
            &res,
            opcode(category::VP, vp_op::CREATE_VP),
            [handle, 0, 2, 0, 0, 0],
        );
        assert!(st.is_success());
        let vpid = Id::new((tls.ext_reg0 & 0xFFFF) as u16);
        assert_eq!(res.vp_pool.assigned_vm(vpid).unwrap().get(), 0);
        assert_eq!(res.vp_pool.assigned_pp(vpid).unwrap().get(), 2);
    }

    #[test]
    fn create_against_a_missing_vm_is_invalid() {
        let f = fixture();
        let res = f.resources();
        let (mut tls, handle) = ready(&f);
        let st = invoke_regs(
            &mut tls,
            &res,
            opcode(category::VP, vp_op::CREATE_VP),
            [handle, 9, 0, 0, 0, 0],
        );
        assert_eq!(st, SysStatus::INVALID_PARAMS1);
    }

    #[test]
    fn migrate_moves_only_inactive_vps() {
        let f = fixture();
        let res = f.resources();
        let (mut tls, handle) = ready(&f);
        invoke_regs(
            &mut tls,
            &res,
            opcode(category::VP, vp_op::CREATE_VP),
            [handle, 0, 0, 0, 0, 0],
        );
        let vpid = Id::new((tls.ext_reg0 & 0xFFFF) as u16);

        // Activate on PP 0, then try to migrate to PP 1.
        res.vp_pool.set_active(&mut tls, vpid).unwrap();
        let st = invoke_regs(
            &mut tls,
            &res,
            opcode(category::VP, vp_op::MIGRATE),
            [handle, vpid.get() as u64, 1, 0, 0, 0],
        );
        assert_eq!(st, SysStatus::FAILURE_UNKNOWN);
        assert_eq!(res.vp_pool.assigned_pp(vpid).unwrap().get(), 0);

        res.vp_pool.set_inactive(&mut tls, vpid).unwrap();
        let st = invoke_regs(
            &mut tls,
            &res,
            opcode(category::VP, vp_op::MIGRATE),
            [handle, vpid.get() as u64, 1, 0, 0, 0],
        );
        assert!(st.is_success());
        assert_eq!(res.vp_pool.assigned_pp(vpid).unwrap().get(), 1);
    }

    #[test]
    fn destroy_with_assigned_vps_zombifies() {
        let f = fixture();
        let res = f.resources();
        let (mut tls, handle) = ready(&f);
        invoke_regs(
            &mut tls,
            &res,
            opcode(category::VP, vp_op::CREATE_VP),
            [handle, 0, 0, 0, 0, 0],
        );
        let vpid = Id::new((tls.ext_reg0 & 0xFFFF) as u16);
        res.vps_pool
            .allocate(res.huge_pool, vpid, Id::new(0))
            .unwrap();

        let st = invoke_regs(
            &mut tls,
            &res,
            opcode(category::VP, vp_op::DESTROY_VP),
            [handle, vpid.get() as u64, 0, 0, 0, 0],
        );
        assert_eq!(st, SysStatus::FAILURE_UNKNOWN);
        assert_eq!(
            res.vp_pool.state(vpid).unwrap(),
            crate::ObjState::Zombie
        );
    }
}
