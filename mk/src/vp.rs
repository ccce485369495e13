//! The VP pool.
//!
//! A VP binds a VPS family to one VM and one PP. The shape mirrors the VM
//! pool, with the same lifecycle states and per-PP activity tracking and
//! zombification protocol, plus the two bindings and `migrate`, which
//! re-homes a VP to another PP and is only legal while the VP is inactive.

use crate::tls::Tls;
use crate::{ObjError, ObjState};
use mkabi::layout::{MAX_PPS, MAX_VPS};
use mkabi::Id;
use spin::Mutex;

#[derive(Clone, Copy)]
struct Vp {
    state: ObjState,
    assigned_vm: Id,
    assigned_pp: Id,
    active: [bool; MAX_PPS],
}

impl Vp {
    const fn new() -> Self {
        Vp {
            state: ObjState::Deallocated,
            assigned_vm: Id::INVALID,
            assigned_pp: Id::INVALID,
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

/// The pool.
pub struct VpPool {
    slots: Mutex<[Vp; MAX_VPS]>,
}

impl VpPool {
    pub const fn new() -> Self {
        VpPool {
            slots: Mutex::new([Vp::new(); MAX_VPS]),
        }
    }

    pub fn initialize(&self) {
        *self.slots.lock() = [Vp::new(); MAX_VPS];
    }

    pub fn release(&self) {
        self.initialize();
    }

    /// Claim the first deallocated slot and bind it to `vm` on `pp`.
    pub fn allocate(&self, vm: Id, pp: Id) -> Result<Id, ObjError> {
        if vm.is_invalid() || pp.as_usize() >= MAX_PPS {
            return Err(ObjError::InvalidId);
        }
        let mut slots = self.slots.lock();
        for (i, vp) in slots.iter_mut().enumerate() {
            if vp.state == ObjState::Deallocated {
                vp.state = ObjState::Allocated;
                vp.assigned_vm = vm;
                vp.assigned_pp = pp;
                vp.active = [false; MAX_PPS];
                return Ok(Id::new(i as u16));
            }
        }
        Err(ObjError::PoolFull)
    }

    /// Return a VP to the pool. Must not be active anywhere; dependency
    /// checks (assigned VPSs) live in the syscall layer.
    pub fn deallocate(&self, id: Id) -> Result<(), ObjError> {
        let mut slots = self.slots.lock();
        let vp = slot_mut(&mut slots, id)?;
        match vp.state {
            ObjState::Zombie => return Err(ObjError::Zombie),
            ObjState::Deallocated => return Err(ObjError::NotAllocated),
            ObjState::Allocated => {}
        }
        if vp.first_active_pp().is_some() {
            return Err(ObjError::Active);
        }
        *vp = Vp::new();
        Ok(())
    }

    /// Mark a VP as a zombie. Terminal; bindings are kept for diagnosis.
    pub fn zombify(&self, id: Id) -> Result<(), ObjError> {
        let mut slots = self.slots.lock();
        slot_mut(&mut slots, id)?.state = ObjState::Zombie;
        Ok(())
    }

    pub fn state(&self, id: Id) -> Result<ObjState, ObjError> {
        let slots = self.slots.lock();
        Ok(slot(&slots, id)?.state)
    }

    pub fn is_allocated(&self, id: Id) -> bool {
        matches!(self.state(id), Ok(ObjState::Allocated))
    }

    /// The VM this VP is bound to.
    pub fn assigned_vm(&self, id: Id) -> Result<Id, ObjError> {
        let slots = self.slots.lock();
        Ok(slot(&slots, id)?.assigned_vm)
    }

    /// The PP this VP is bound to.
    pub fn assigned_pp(&self, id: Id) -> Result<Id, ObjError> {
        let slots = self.slots.lock();
        Ok(slot(&slots, id)?.assigned_pp)
    }

    /// The first VP bound to `vm`, if any. Used by VM destruction to
    /// refuse tearing down a VM that still has processors.
    pub fn first_assigned_to_vm(&self, vm: Id) -> Option<Id> {
        let slots = self.slots.lock();
        slots
            .iter()
            .position(|vp| vp.state != ObjState::Deallocated && vp.assigned_vm == vm)
            .map(|i| Id::new(i as u16))
    }

    /// Re-bind `id` to `new_pp`. Only legal while inactive everywhere.
    pub fn migrate(&self, id: Id, new_pp: Id) -> Result<(), ObjError> {
        if new_pp.as_usize() >= MAX_PPS {
            return Err(ObjError::InvalidId);
        }
        let mut slots = self.slots.lock();
        let vp = slot_mut(&mut slots, id)?;
        match vp.state {
            ObjState::Zombie => return Err(ObjError::Zombie),
            ObjState::Deallocated => return Err(ObjError::NotAllocated),
            ObjState::Allocated => {}
        }
        if vp.first_active_pp().is_some() {
            return Err(ObjError::Active);
        }
        vp.assigned_pp = new_pp;
        Ok(())
    }

    /// Make `id` the active VP on the caller's PP. The VP must be bound to
    /// that PP.
    pub fn set_active(&self, tls: &mut Tls, id: Id) -> Result<(), ObjError> {
        let pp = tls.ppid().as_usize();
        let mut slots = self.slots.lock();
        if slots.iter().any(|vp| vp.active[pp]) {
            return Err(ObjError::PpBusy);
        }
        let vp = slot_mut(&mut slots, id)?;
        match vp.state {
            ObjState::Allocated => {}
            ObjState::Zombie => return Err(ObjError::Zombie),
            ObjState::Deallocated => return Err(ObjError::NotAllocated),
        }
        if vp.assigned_pp.as_usize() != pp {
            return Err(ObjError::WrongPp);
        }
        vp.active[pp] = true;
        tls.active_vpid = id;
        tls.thread_id.set_vpid(id);
        Ok(())
    }

    /// Clear the active bit on the caller's PP. Permitted on zombies.
    pub fn set_inactive(&self, tls: &mut Tls, id: Id) -> Result<(), ObjError> {
        let pp = tls.ppid().as_usize();
        let mut slots = self.slots.lock();
        let vp = slot_mut(&mut slots, id)?;
        if !vp.active[pp] {
            return Err(ObjError::NotActive);
        }
        vp.active[pp] = false;
        if tls.active_vpid == id {
            tls.active_vpid = Id::INVALID;
            tls.thread_id.set_vpid(Id::INVALID);
        }
        Ok(())
    }

    /// The first PP on which `id` is active, if any.
    pub fn is_active(&self, id: Id) -> Result<Option<Id>, ObjError> {
        let slots = self.slots.lock();
        Ok(slot(&slots, id)?.first_active_pp())
    }

    /// Render one VP into the debug ring.
    pub fn dump(&self, id: Id) {
        let slots = self.slots.lock();
        match slot(&slots, id) {
            Ok(vp) => diag::mklog_always!(
                "vp [{:#06x}]: {:?}, vm={:#06x} pp={:#06x}, active on {:?}",
                id,
                vp.state,
                vp.assigned_vm,
                vp.assigned_pp,
                vp.first_active_pp()
            ),
            Err(_) => diag::mklog_always!("vp [{:#06x}]: no such slot", id),
        }
    }
}

impl Default for VpPool {
    fn default() -> Self {
        VpPool::new()
    }
}

fn slot<'a>(slots: &'a [Vp; MAX_VPS], id: Id) -> Result<&'a Vp, ObjError> {
    slots.get(id.as_usize()).ok_or(ObjError::InvalidId)
}

fn slot_mut<'a>(slots: &'a mut [Vp; MAX_VPS], id: Id) -> Result<&'a mut Vp, ObjError> {
    slots.get_mut(id.as_usize()).ok_or(ObjError::InvalidId)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_binds_vm_and_pp() {
        let pool = VpPool::new();
        pool.initialize();
        let id = pool.allocate(Id::new(0), Id::new(2)).unwrap();
        assert_eq!(pool.assigned_vm(id).unwrap().get(), 0);
        assert_eq!(pool.assigned_pp(id).unwrap().get(), 2);
    }

    #[test]
    fn migrate_moves_an_inactive_vp() {
        let pool = VpPool::new();
        pool.initialize();
        let id = pool.allocate(Id::new(0), Id::new(0)).unwrap();
        pool.migrate(id, Id::new(1)).unwrap();
        assert_eq!(pool.assigned_pp(id).unwrap().get(), 1);
    }

    #[test]
    fn migrate_is_forbidden_while_active() {
        let pool = VpPool::new();
        pool.initialize();
        let id = pool.allocate(Id::new(0), Id::new(0)).unwrap();
        let mut tls = Tls::new(0);
        pool.set_active(&mut tls, id).unwrap();
        assert_eq!(pool.migrate(id, Id::new(1)), Err(ObjError::Active));
        // The binding did not move.
        assert_eq!(pool.assigned_pp(id).unwrap().get(), 0);
    }

    #[test]
    fn activation_requires_the_bound_pp() {
        let pool = VpPool::new();
        pool.initialize();
        let id = pool.allocate(Id::new(0), Id::new(3)).unwrap();
        let mut wrong = Tls::new(1);
        assert_eq!(pool.set_active(&mut wrong, id), Err(ObjError::WrongPp));
        let mut right = Tls::new(3);
        pool.set_active(&mut right, id).unwrap();
        assert_eq!(right.active_vpid, id);
    }

    #[test]
    fn vm_lookup_finds_assigned_vps() {
        let pool = VpPool::new();
        pool.initialize();
        let a = pool.allocate(Id::new(1), Id::new(0)).unwrap();
        let _b = pool.allocate(Id::new(2), Id::new(0)).unwrap();
        assert_eq!(pool.first_assigned_to_vm(Id::new(1)), Some(a));
        assert_eq!(pool.first_assigned_to_vm(Id::new(5)), None);
        // Zombies still count as references to their VM.
        pool.zombify(a).unwrap();
        assert_eq!(pool.first_assigned_to_vm(Id::new(1)), Some(a));
    }

    #[test]
    fn zombie_protocol() {
        let pool = VpPool::new();
        pool.initialize();
        let id = pool.allocate(Id::new(0), Id::new(0)).unwrap();
        let mut tls = Tls::new(0);
        pool.set_active(&mut tls, id).unwrap();
        pool.zombify(id).unwrap();
        assert_eq!(pool.deallocate(id), Err(ObjError::Zombie));
        assert_eq!(pool.migrate(id, Id::new(1)), Err(ObjError::Zombie));
        pool.set_inactive(&mut tls, id).unwrap();
        assert_eq!(pool.state(id).unwrap(), ObjState::Zombie);
    }
}
