//! The VM pool.
//!
//! A VM is the top-level container: an id, a lifecycle state, and a per-PP
//! active bitmap. VM 0 is the root VM (the demoted host OS) and is
//! allocated during global init, can never be deallocated, and can never be
//! zombified.
//!
//! Invariants enforced here:
//! - at most one VM is active on any PP at a time;
//! - zombie is terminal (every mutating operation except `set_inactive`
//!   fails);
//! - allocation skips zombie slots rather than reusing them.

use crate::tls::Tls;
use crate::{ObjError, ObjState};
use mkabi::layout::{MAX_PPS, MAX_VMS, ROOT_VMID};
use mkabi::Id;
use spin::Mutex;

#[derive(Clone, Copy)]
struct Vm {
    state: ObjState,
    active: [bool; MAX_PPS],
}

impl Vm {
    const fn new() -> Self {
        Vm {
            state: ObjState::Deallocated,
            active: [false; MAX_PPS],
        }
    }

    fn first_active_pp(&self) -> Option<Id> {
        self.active
            .iter()
            .position(|&a| a)
            .map(|pp| Id::new(pp as u16))
    }
}

/// The pool. One coarse lock; every operation is short.
pub struct VmPool {
    slots: Mutex<[Vm; MAX_VMS]>,
}

impl VmPool {
    pub const fn new() -> Self {
        VmPool {
            slots: Mutex::new([Vm::new(); MAX_VMS]),
        }
    }

    /// Reset every slot to deallocated.
    pub fn initialize(&self) {
        *self.slots.lock() = [Vm::new(); MAX_VMS];
    }

    /// Drop all state at teardown.
    pub fn release(&self) {
        self.initialize();
    }

    /// Claim the first deallocated slot.
    pub fn allocate(&self) -> Result<Id, ObjError> {
        let mut slots = self.slots.lock();
        for (i, vm) in slots.iter_mut().enumerate() {
            if vm.state == ObjState::Deallocated {
                vm.state = ObjState::Allocated;
                vm.active = [false; MAX_PPS];
                return Ok(Id::new(i as u16));
            }
        }
        Err(ObjError::PoolFull)
    }

    /// Return a VM to the pool. The root VM is exempt; an active or zombie
    /// VM cannot be deallocated. Dependency checks (assigned VPs) and
    /// zombification on downstream failure live in the syscall layer.
    pub fn deallocate(&self, id: Id) -> Result<(), ObjError> {
        if id.get() == ROOT_VMID {
            return Err(ObjError::RootForbidden);
        }
        let mut slots = self.slots.lock();
        let vm = slot_mut(&mut slots, id)?;
        match vm.state {
            ObjState::Zombie => return Err(ObjError::Zombie),
            ObjState::Deallocated => return Err(ObjError::NotAllocated),
            ObjState::Allocated => {}
        }
        if vm.first_active_pp().is_some() {
            return Err(ObjError::Active);
        }
        vm.state = ObjState::Deallocated;
        Ok(())
    }

    /// Mark a VM as a zombie. Terminal; the root VM is exempt.
    pub fn zombify(&self, id: Id) -> Result<(), ObjError> {
        if id.get() == ROOT_VMID {
            return Err(ObjError::RootForbidden);
        }
        let mut slots = self.slots.lock();
        slot_mut(&mut slots, id)?.state = ObjState::Zombie;
        Ok(())
    }

    /// The lifecycle state of `id`.
    pub fn state(&self, id: Id) -> Result<ObjState, ObjError> {
        let slots = self.slots.lock();
        Ok(slot(&slots, id)?.state)
    }

    /// True if `id` names an allocated VM.
    pub fn is_allocated(&self, id: Id) -> bool {
        matches!(self.state(id), Ok(ObjState::Allocated))
    }

    /// Make `id` the active VM on the caller's PP.
    pub fn set_active(&self, tls: &mut Tls, id: Id) -> Result<(), ObjError> {
        let pp = tls.ppid().as_usize();
        let mut slots = self.slots.lock();
        // One VM per PP; a second activation is a protocol violation.
        if slots.iter().any(|vm| vm.active[pp]) {
            return Err(ObjError::PpBusy);
        }
        let vm = slot_mut(&mut slots, id)?;
        match vm.state {
            ObjState::Allocated => {}
            ObjState::Zombie => return Err(ObjError::Zombie),
            ObjState::Deallocated => return Err(ObjError::NotAllocated),
        }
        vm.active[pp] = true;
        tls.active_vmid = id;
        tls.thread_id.set_vmid(id);
        Ok(())
    }

    /// Clear `id`'s active bit on the caller's PP. Permitted on zombies so
    /// cleanup can drain.
    pub fn set_inactive(&self, tls: &mut Tls, id: Id) -> Result<(), ObjError> {
        let pp = tls.ppid().as_usize();
        let mut slots = self.slots.lock();
        let vm = slot_mut(&mut slots, id)?;
        if !vm.active[pp] {
            return Err(ObjError::NotActive);
        }
        vm.active[pp] = false;
        if tls.active_vmid == id {
            tls.active_vmid = Id::INVALID;
            tls.thread_id.set_vmid(Id::INVALID);
        }
        Ok(())
    }

    /// The first PP on which `id` is active, if any.
    pub fn is_active(&self, id: Id) -> Result<Option<Id>, ObjError> {
        let slots = self.slots.lock();
        Ok(slot(&slots, id)?.first_active_pp())
    }

    /// True if `id` is active on `pp`.
    pub fn is_active_on(&self, id: Id, pp: Id) -> Result<bool, ObjError> {
        let slots = self.slots.lock();
        let vm = slot(&slots, id)?;
        Ok(pp.as_usize() < MAX_PPS && vm.active[pp.as_usize()])
    }

    /// True if `id` is active on the caller's PP.
    pub fn is_active_on_current_pp(&self, tls: &Tls, id: Id) -> Result<bool, ObjError> {
        self.is_active_on(id, tls.ppid())
    }

    /// Render one VM into the debug ring.
    pub fn dump(&self, id: Id) {
        let slots = self.slots.lock();
        match slot(&slots, id) {
            Ok(vm) => diag::mklog_always!(
                "vm [{:#06x}]: {:?}, active on {:?}",
                id,
                vm.state,
                vm.first_active_pp()
            ),
            Err(_) => diag::mklog_always!("vm [{:#06x}]: no such slot", id),
        }
    }
}

impl Default for VmPool {
    fn default() -> Self {
        VmPool::new()
    }
}

fn slot<'a>(slots: &'a [Vm; MAX_VMS], id: Id) -> Result<&'a Vm, ObjError> {
    slots.get(id.as_usize()).ok_or(ObjError::InvalidId)
}

fn slot_mut<'a>(slots: &'a mut [Vm; MAX_VMS], id: Id) -> Result<&'a mut Vm, ObjError> {
    slots.get_mut(id.as_usize()).ok_or(ObjError::InvalidId)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tls(pp: u16) -> Tls {
        Tls::new(pp)
    }

    #[test]
    fn allocation_is_dense_from_zero() {
        let pool = VmPool::new();
        pool.initialize();
        assert_eq!(pool.allocate().unwrap().get(), 0);
        assert_eq!(pool.allocate().unwrap().get(), 1);
        assert_eq!(pool.allocate().unwrap().get(), 2);
    }

    #[test]
    fn deallocate_then_allocate_reuses_the_slot() {
        let pool = VmPool::new();
        pool.initialize();
        let _root = pool.allocate().unwrap();
        let a = pool.allocate().unwrap();
        pool.deallocate(a).unwrap();
        assert_eq!(pool.allocate().unwrap(), a);
    }

    #[test]
    fn allocate_all_free_all_restarts_at_the_bottom() {
        let pool = VmPool::new();
        pool.initialize();
        let root = pool.allocate().unwrap();
        let mut ids = alloc::vec::Vec::new();
        while let Ok(id) = pool.allocate() {
            ids.push(id);
        }
        for id in ids {
            pool.deallocate(id).unwrap();
        }
        // Root still holds slot 0, so slot 1 is the first free one.
        assert_eq!(root.get(), 0);
        assert_eq!(pool.allocate().unwrap().get(), 1);
    }

    #[test]
    fn root_vm_is_exempt_from_destruction() {
        let pool = VmPool::new();
        pool.initialize();
        let root = pool.allocate().unwrap();
        assert_eq!(pool.deallocate(root), Err(ObjError::RootForbidden));
        assert_eq!(pool.zombify(root), Err(ObjError::RootForbidden));
        assert_eq!(pool.state(root).unwrap(), ObjState::Allocated);
    }

    #[test]
    fn double_deallocate_fails_without_corruption() {
        let pool = VmPool::new();
        pool.initialize();
        let _root = pool.allocate().unwrap();
        let a = pool.allocate().unwrap();
        pool.deallocate(a).unwrap();
        assert_eq!(pool.deallocate(a), Err(ObjError::NotAllocated));
        assert_eq!(pool.state(a).unwrap(), ObjState::Deallocated);
    }

    #[test]
    fn allocation_skips_zombies() {
        let pool = VmPool::new();
        pool.initialize();
        let _root = pool.allocate().unwrap();
        let a = pool.allocate().unwrap();
        pool.zombify(a).unwrap();
        let b = pool.allocate().unwrap();
        assert_ne!(a, b);
        assert_eq!(pool.state(a).unwrap(), ObjState::Zombie);
    }

    #[test]
    fn zombie_refuses_everything_but_set_inactive() {
        let pool = VmPool::new();
        pool.initialize();
        let _root = pool.allocate().unwrap();
        let a = pool.allocate().unwrap();
        let mut t = tls(0);
        pool.set_active(&mut t, a).unwrap();
        pool.zombify(a).unwrap();

        assert_eq!(pool.deallocate(a), Err(ObjError::Zombie));
        let mut t1 = tls(1);
        assert_eq!(pool.set_active(&mut t1, a), Err(ObjError::Zombie));
        // Draining the stale active bit still works.
        pool.set_inactive(&mut t, a).unwrap();
        assert_eq!(pool.is_active(a).unwrap(), None);
        assert_eq!(pool.state(a).unwrap(), ObjState::Zombie);
    }

    #[test]
    fn one_vm_active_per_pp() {
        let pool = VmPool::new();
        pool.initialize();
        let a = pool.allocate().unwrap();
        let b = pool.allocate().unwrap();
        let mut t = tls(2);
        pool.set_active(&mut t, a).unwrap();
        assert_eq!(pool.set_active(&mut t, b), Err(ObjError::PpBusy));
        assert!(pool.is_active_on(a, Id::new(2)).unwrap());
        assert_eq!(t.active_vmid, a);

        // The same VM may be active on a different PP.
        let mut t2 = tls(3);
        pool.set_active(&mut t2, a).unwrap();
        assert_eq!(pool.is_active(a).unwrap(), Some(Id::new(2)));
    }

    #[test]
    fn active_vm_cannot_be_deallocated() {
        let pool = VmPool::new();
        pool.initialize();
        let _root = pool.allocate().unwrap();
        let a = pool.allocate().unwrap();
        let mut t = tls(0);
        pool.set_active(&mut t, a).unwrap();
        assert_eq!(pool.deallocate(a), Err(ObjError::Active));
        pool.set_inactive(&mut t, a).unwrap();
        pool.deallocate(a).unwrap();
    }
}
