//! `bf_vm_op_*`: VM lifecycle.
//!
//! Destruction is where the zombification contract lives: a VM that still
//! has VPs, or whose destruction the extension pool refuses to
//! acknowledge, becomes a zombie: it keeps its slot, fails every further
//! operation, and is never handed out again. Destruction does not retry.

use crate::syscall::{check_handle, check_vmexit_registered, obj_status};
use crate::tls::Tls;
use crate::{ObjState, Resources};
use mkabi::layout::ROOT_VMID;
use mkabi::syscall::vm_op;
use mkabi::{Id, SysStatus};

pub fn dispatch(tls: &mut Tls, res: &Resources, index: u16) -> SysStatus {
    if let Err(status) = check_handle(tls, res) {
        return status;
    }
    if let Err(status) = check_vmexit_registered(tls, res) {
        return status;
    }
    match index {
        vm_op::CREATE_VM => create_vm(tls, res),
        vm_op::DESTROY_VM => destroy_vm(tls, res),
        _ => SysStatus::FAILURE_UNSUPPORTED,
    }
}

fn create_vm(tls: &mut Tls, res: &Resources) -> SysStatus {
    let vmid = match res.vm_pool.allocate() {
        Ok(id) => id,
        Err(e) => return obj_status(e),
    };
    if res.ext_pool.signal_vm_created(vmid).is_err() {
        // Roll the allocation back; if even that fails the slot is dead.
        if res.vm_pool.deallocate(vmid).is_err() {
            let _ = res.vm_pool.zombify(vmid);
        }
        return SysStatus::FAILURE_UNKNOWN;
    }
    tls.ext_reg0 = (tls.ext_reg0 & 0xFFFF_FFFF_FFFF_0000) | vmid.get() as u64;
    SysStatus::SUCCESS
}

fn destroy_vm(tls: &mut Tls, res: &Resources) -> SysStatus {
    let vmid = Id::new(tls.ext_reg1 as u16);
    if tls.ext_reg1 > u16::MAX as u64 || vmid.get() == ROOT_VMID {
        return SysStatus::INVALID_PARAMS1;
    }
    match res.vm_pool.state(vmid) {
        Ok(ObjState::Allocated) => {}
        Ok(_) => return SysStatus::FAILURE_UNKNOWN,
        Err(e) => return obj_status(e),
    }
    if matches!(res.vm_pool.is_active(vmid), Ok(Some(_)))
        || res.tls_pool.vm_active_on(vmid).is_some()
    {
        return SysStatus::FAILURE_UNKNOWN;
    }
    // A VM with processors cannot die cleanly; it becomes a zombie and the
    // extension learns through the failure status.
    if res.vp_pool.first_assigned_to_vm(vmid).is_some() {
        let _ = res.vm_pool.zombify(vmid);
        return SysStatus::FAILURE_UNKNOWN;
    }
    if res.ext_pool.signal_vm_destroyed(vmid).is_err() {
        let _ = res.vm_pool.zombify(vmid);
        return SysStatus::FAILURE_UNKNOWN;
    }
    match res.vm_pool.deallocate(vmid) {
        Ok(()) => SysStatus::SUCCESS,
        Err(e) => obj_status(e),
    }
}

#[cfg(test)]
mod tests {
    use crate::syscall::testutil::*;
    use crate::ObjState;
    use mkabi::syscall::{category, opcode, vm_op};
    use mkabi::{Id, SysStatus};

    fn ready(f: &crate::syscall::testutil::Fixture) -> (crate::tls::Tls, u64) {
        let res = f.resources();
        let mut tls = f.ext_tls(0);
        let handle = open_handle(&mut tls, &res);
        register_vmexit(&mut tls, &res, handle);
        (tls, handle)
    }

    #[test]
    fn vm_ops_require_vmexit_registration() {
        let f = fixture();
        let res = f.resources();
        let mut tls = f.ext_tls(0);
        let handle = open_handle(&mut tls, &res);
        let st = invoke_regs(
            &mut tls,
            &res,
            opcode(category::VM, vm_op::CREATE_VM),
            [handle, 0, 0, 0, 0, 0],
        );
        assert_eq!(st, SysStatus::PERM_EXT);
    }

    #[test]
    fn create_returns_a_fresh_id() {
        let f = fixture();
        let res = f.resources();
        let (mut tls, handle) = ready(&f);
        let st = invoke_regs(
            &mut tls,
            &res,
            opcode(category::VM, vm_op::CREATE_VM),
            [handle, 0, 0, 0, 0, 0],
        );
        assert!(st.is_success());
        // Root VM holds id 0, so the first created VM is 1.
        assert_eq!(tls.ext_reg0 & 0xFFFF, 1);
    }

    #[test]
    fn destroying_the_root_vm_is_invalid_params() {
        let f = fixture();
        let res = f.resources();
        let (mut tls, handle) = ready(&f);
        let st = invoke_regs(
            &mut tls,
            &res,
            opcode(category::VM, vm_op::DESTROY_VM),
            [handle, 0, 0, 0, 0, 0],
        );
        assert_eq!(st, SysStatus::INVALID_PARAMS1);
        assert_eq!(f.vm_pool.state(Id::new(0)).unwrap(), ObjState::Allocated);
    }

    #[test]
    fn double_destroy_fails_and_leaves_deallocated() {
        let f = fixture();
        let res = f.resources();
        let (mut tls, handle) = ready(&f);
        let create = opcode(category::VM, vm_op::CREATE_VM);
        let destroy = opcode(category::VM, vm_op::DESTROY_VM);

        invoke_regs(&mut tls, &res, create, [handle, 0, 0, 0, 0, 0]);
        let vmid = tls.ext_reg0 & 0xFFFF;

        let st = invoke_regs(&mut tls, &res, destroy, [handle, vmid, 0, 0, 0, 0]);
        assert!(st.is_success());
        assert_eq!(
            f.vm_pool.state(Id::new(vmid as u16)).unwrap(),
            ObjState::Deallocated
        );

        let st = invoke_regs(&mut tls, &res, destroy, [handle, vmid, 0, 0, 0, 0]);
        assert_eq!(st, SysStatus::FAILURE_UNKNOWN);
        assert_eq!(
            f.vm_pool.state(Id::new(vmid as u16)).unwrap(),
            ObjState::Deallocated
        );
    }

    #[test]
    fn destroying_a_vm_with_processors_zombifies_it() {
        let f = fixture();
        let res = f.resources();
        let (mut tls, handle) = ready(&f);
        invoke_regs(
            &mut tls,
            &res,
            opcode(category::VM, vm_op::CREATE_VM),
            [handle, 0, 0, 0, 0, 0],
        );
        let vmid = Id::new((tls.ext_reg0 & 0xFFFF) as u16);
        res.vp_pool.allocate(vmid, Id::new(0)).unwrap();

        let st = invoke_regs(
            &mut tls,
            &res,
            opcode(category::VM, vm_op::DESTROY_VM),
            [handle, vmid.get() as u64, 0, 0, 0, 0],
        );
        assert_eq!(st, SysStatus::FAILURE_UNKNOWN);
        assert_eq!(f.vm_pool.state(vmid).unwrap(), ObjState::Zombie);

        // And the zombie slot is skipped by the next allocation.
        let st = invoke_regs(
            &mut tls,
            &res,
            opcode(category::VM, vm_op::CREATE_VM),
            [handle, 0, 0, 0, 0, 0],
        );
        assert!(st.is_success());
        assert_ne!(tls.ext_reg0 & 0xFFFF, vmid.get() as u64);
    }
}
