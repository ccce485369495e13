//! The VPS pool.
//!
//! A VPS owns the architectural per-vCPU control structure: one physically
//! contiguous 4 KiB page from the huge pool that the hardware sees, plus a
//! software mirror of every field keyed by the stable `mkabi::Reg`
//! encodings. Field reads and writes always hit the mirror; `load` pushes
//! the mirror into the hardware structure, and every exit pulls the guest
//! state back.
//!
//! The loaded/launched protocol follows the hardware's rules exactly:
//!
//! - one VPS is the current structure per PP (`Tls::loaded_vpsid`);
//! - a structure last loaded on PP *a* must be cleared there before it can
//!   be loaded on PP *b*; skipping the clear is architecturally undefined,
//!   so it is refused here;
//! - the first successful entry launches, every later one resumes, and
//!   `clear` resets the distinction.

use crate::tls::{Tls, TlsPool};
use crate::{ObjError, ObjState};
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use diag::vmexit_log;
use intrinsics::hve;
use intrinsics::ExitInfo;
use mkabi::layout::{MAX_PPS, MAX_VPSS};
use mkabi::reg::Width;
use mkabi::{Id, Reg};
use mkboot::StateSave;
use mm::HugePool;
use spin::Mutex;

/// One virtual-processor state.
struct Vps {
    state: ObjState,
    assigned_vp: Id,
    assigned_pp: Id,
    active: [bool; MAX_PPS],
    /// The PP whose hardware currently holds this structure's state;
    /// INVALID after a clear.
    loaded_on: Id,
    launched: bool,
    /// The control-structure page (huge pool, one chunk).
    ctl_virt: u64,
    ctl_phys: u64,
    /// The software mirror, keyed by `Reg` encoding.
    fields: BTreeMap<u16, u64>,
}

impl Vps {
    fn new() -> Self {
        Vps {
            state: ObjState::Deallocated,
            assigned_vp: Id::INVALID,
            assigned_pp: Id::INVALID,
            active: [false; MAX_PPS],
            loaded_on: Id::INVALID,
            launched: false,
            ctl_virt: 0,
            ctl_phys: 0,
            fields: BTreeMap::new(),
        }
    }

    fn first_active_pp(&self) -> Option<Id> {
        self.active
            .iter()
            .position(|&a| a)
            .map(|pp| Id::new(pp as u16))
    }

    fn field(&self, reg: Reg) -> u64 {
        self.fields.get(&reg.encoding()).copied().unwrap_or(0)
    }

    fn set_field(&mut self, reg: Reg, val: u64) {
        self.fields.insert(reg.encoding(), val);
    }

    /// rax..r15 in encoding order; slot 15 carries CR2.
    fn gprs(&self) -> [u64; 16] {
        let mut out = [0u64; 16];
        for (i, reg) in GPR_ORDER.iter().enumerate() {
            out[i] = self.field(*reg);
        }
        out[15] = self.field(Reg::Cr2);
        out
    }

    fn set_gprs(&mut self, gprs: &[u64; 16]) {
        for (i, reg) in GPR_ORDER.iter().enumerate() {
            self.set_field(*reg, gprs[i]);
        }
        self.set_field(Reg::Cr2, gprs[15]);
    }
}

const GPR_ORDER: [Reg; 15] = [
    Reg::Rax,
    Reg::Rbx,
    Reg::Rcx,
    Reg::Rdx,
    Reg::Rbp,
    Reg::Rsi,
    Reg::Rdi,
    Reg::R8,
    Reg::R9,
    Reg::R10,
    Reg::R11,
    Reg::R12,
    Reg::R13,
    Reg::R14,
    Reg::R15,
];

/// True if the field is writable in the hardware structure. GPRs and CR2
/// travel in the entry frame, the swapped MSRs through the MSR areas, and
/// the exit-information fields are hardware-written and read-only.
fn hw_backed(reg: Reg) -> bool {
    !matches!(
        reg,
        Reg::Rax
            | Reg::Rbx
            | Reg::Rcx
            | Reg::Rdx
            | Reg::Rbp
            | Reg::Rsi
            | Reg::Rdi
            | Reg::R8
            | Reg::R9
            | Reg::R10
            | Reg::R11
            | Reg::R12
            | Reg::R13
            | Reg::R14
            | Reg::R15
            | Reg::Cr2
            | Reg::Star
            | Reg::Lstar
            | Reg::Cstar
            | Reg::Fmask
            | Reg::KernelGsBase
            | Reg::ExitReason
            | Reg::ExitQualification
            | Reg::ExitInterruptionInfo
            | Reg::ExitInstructionLength
            | Reg::ExitInstructionInfo
    )
}

/// The pool.
pub struct VpsPool {
    slots: Mutex<Vec<Vps>>,
}

impl VpsPool {
    pub const fn new() -> Self {
        VpsPool {
            slots: Mutex::new(Vec::new()),
        }
    }

    pub fn initialize(&self) {
        let mut slots = self.slots.lock();
        slots.clear();
        slots.resize_with(MAX_VPSS, Vps::new);
    }

    pub fn release(&self) {
        self.slots.lock().clear();
    }

    /// Final teardown: reclaim every control page, zombies included (the
    /// hardware is out of root mode by now), and empty the pool.
    pub fn release_all(&self, huge: &Mutex<HugePool>) -> Result<(), ObjError> {
        let mut slots = self.slots.lock();
        for vps in slots.iter_mut() {
            if vps.state != ObjState::Deallocated && vps.ctl_virt != 0 {
                huge.lock().deallocate(vps.ctl_virt)?;
            }
        }
        slots.clear();
        Ok(())
    }

    /// Claim the first deallocated slot, bind it to `vp` on `pp`, and give
    /// it a control-structure page.
    pub fn allocate(&self, huge: &Mutex<HugePool>, vp: Id, pp: Id) -> Result<Id, ObjError> {
        if vp.is_invalid() || pp.as_usize() >= MAX_PPS {
            return Err(ObjError::InvalidId);
        }
        let mut slots = self.slots.lock();
        let idx = slots
            .iter()
            .position(|v| v.state == ObjState::Deallocated)
            .ok_or(ObjError::PoolFull)?;

        let page = huge.lock().allocate(1)?;
        let vps = &mut slots[idx];
        *vps = Vps::new();
        vps.state = ObjState::Allocated;
        vps.assigned_vp = vp;
        vps.assigned_pp = pp;
        vps.ctl_virt = page.virt;
        vps.ctl_phys = page.phys;
        Ok(Id::new(idx as u16))
    }

    /// Return a VPS to the pool. Refused while active, loaded anywhere, or
    /// zombie.
    pub fn deallocate(
        &self,
        huge: &Mutex<HugePool>,
        tls_pool: &TlsPool,
        id: Id,
    ) -> Result<(), ObjError> {
        let mut slots = self.slots.lock();
        let vps = slot_mut(&mut slots, id)?;
        match vps.state {
            ObjState::Zombie => return Err(ObjError::Zombie),
            ObjState::Deallocated => return Err(ObjError::NotAllocated),
            ObjState::Allocated => {}
        }
        if vps.first_active_pp().is_some() || tls_pool.vps_loaded_on(id).is_some() {
            return Err(ObjError::Active);
        }
        huge.lock().deallocate(vps.ctl_virt)?;
        *vps = Vps::new();
        Ok(())
    }

    /// Mark a VPS as a zombie. The control page is deliberately kept: a
    /// structure the hardware may still reference must never return to the
    /// pool.
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

    pub fn assigned_vp(&self, id: Id) -> Result<Id, ObjError> {
        let slots = self.slots.lock();
        Ok(slot(&slots, id)?.assigned_vp)
    }

    pub fn assigned_pp(&self, id: Id) -> Result<Id, ObjError> {
        let slots = self.slots.lock();
        Ok(slot(&slots, id)?.assigned_pp)
    }

    /// The first VPS bound to `vp`, if any.
    pub fn first_assigned_to_vp(&self, vp: Id) -> Option<Id> {
        let slots = self.slots.lock();
        slots
            .iter()
            .position(|v| v.state != ObjState::Deallocated && v.assigned_vp == vp)
            .map(|i| Id::new(i as u16))
    }

    /// Mirror the captured OS state into the VPS. This is what turns VPS 0
    /// into the demoted host.
    pub fn init_as_root(&self, tls: &Tls, id: Id, state: &StateSave) -> Result<(), ObjError> {
        let mut slots = self.slots.lock();
        let vps = slot_mut(&mut slots, id)?;
        if vps.state != ObjState::Allocated {
            return Err(state_err(vps.state));
        }
        if vps.assigned_pp != tls.ppid() {
            return Err(ObjError::WrongPp);
        }
        state_save_to_fields(state, vps);
        Ok(())
    }

    /// Write the VPS back into a `StateSave` (the reverse demote).
    pub fn vps_to_state(&self, id: Id) -> Result<StateSave, ObjError> {
        let slots = self.slots.lock();
        let vps = slot(&slots, id)?;
        if vps.state != ObjState::Allocated {
            return Err(state_err(vps.state));
        }
        Ok(fields_to_state_save(vps))
    }

    /// Read an architectural field from the mirror.
    pub fn read_reg(&self, id: Id, reg: Reg) -> Result<u64, ObjError> {
        let slots = self.slots.lock();
        let vps = slot(&slots, id)?;
        if vps.state != ObjState::Allocated {
            return Err(state_err(vps.state));
        }
        Ok(vps.field(reg))
    }

    /// Write an architectural field to the mirror (and through to the
    /// hardware structure while this VPS is the loaded one).
    pub fn write_reg(&self, tls: &Tls, id: Id, reg: Reg, val: u64) -> Result<(), ObjError> {
        let mut slots = self.slots.lock();
        let vps = slot_mut(&mut slots, id)?;
        if vps.state != ObjState::Allocated {
            return Err(state_err(vps.state));
        }
        vps.set_field(reg, val);
        if tls.loaded_vpsid == id && hw_backed(reg) {
            // Safety: this VPS is the loaded structure on this PP.
            unsafe { hve::write_field(reg.encoding(), val) }?;
        }
        Ok(())
    }

    /// Sized read by raw encoding; the width must match the field class.
    pub fn read_sized(&self, id: Id, enc: u16, width: Width) -> Result<u64, ObjError> {
        let reg = Reg::from_encoding(enc).ok_or(ObjError::InvalidId)?;
        if !width_compatible(reg.width(), width) {
            return Err(ObjError::InvalidId);
        }
        let val = self.read_reg(id, reg)?;
        Ok(match width {
            Width::W16 => val & 0xFFFF,
            Width::W32 => val & 0xFFFF_FFFF,
            Width::W64 => val,
        })
    }

    /// Sized write by raw encoding; the width must match the field class.
    pub fn write_sized(
        &self,
        tls: &Tls,
        id: Id,
        enc: u16,
        width: Width,
        val: u64,
    ) -> Result<(), ObjError> {
        let reg = Reg::from_encoding(enc).ok_or(ObjError::InvalidId)?;
        if !width_compatible(reg.width(), width) {
            return Err(ObjError::InvalidId);
        }
        let val = match width {
            Width::W16 => val & 0xFFFF,
            Width::W32 => val & 0xFFFF_FFFF,
            Width::W64 => val,
        };
        self.write_reg(tls, id, reg, val)
    }

    /// Make `id` the loaded structure on the caller's PP.
    pub fn load(&self, tls: &mut Tls, id: Id) -> Result<(), ObjError> {
        let mut slots = self.slots.lock();
        let vps = slot_mut(&mut slots, id)?;
        if vps.state != ObjState::Allocated {
            return Err(state_err(vps.state));
        }
        if vps.assigned_pp != tls.ppid() {
            return Err(ObjError::WrongPp);
        }
        // Cross-PP reuse without an intervening clear is undefined by the
        // hardware; treat it as fatal rather than hoping.
        if vps.loaded_on.is_valid() && vps.loaded_on != tls.ppid() {
            return Err(ObjError::NeedsClear);
        }
        // Safety: the structure page is owned by this VPS and contiguous.
        unsafe {
            hve::load(vps.ctl_phys)?;
        }
        for (&enc, &val) in vps.fields.iter() {
            if let Some(reg) = Reg::from_encoding(enc) {
                if hw_backed(reg) {
                    // Safety: just loaded above.
                    unsafe { hve::write_field(enc, val) }?;
                }
            }
        }
        vps.loaded_on = tls.ppid();
        tls.loaded_vpsid = id;
        Ok(())
    }

    /// Flush the structure out of the hardware, resetting the launch
    /// state. Required before the VPS may be loaded on another PP.
    pub fn clear(&self, tls: &mut Tls, id: Id) -> Result<(), ObjError> {
        let mut slots = self.slots.lock();
        let vps = slot_mut(&mut slots, id)?;
        if vps.state != ObjState::Allocated {
            return Err(state_err(vps.state));
        }
        if vps.loaded_on.is_valid() && vps.loaded_on != tls.ppid() {
            // A structure's state lives on the PP that loaded it; the
            // clear must run there.
            return Err(ObjError::WrongPp);
        }
        // Safety: the structure page is owned by this VPS.
        unsafe { hve::clear(vps.ctl_phys) }?;
        vps.loaded_on = Id::INVALID;
        vps.launched = false;
        if tls.loaded_vpsid == id {
            tls.loaded_vpsid = Id::INVALID;
        }
        Ok(())
    }

    /// Enter the guest: launch on the first entry, resume afterwards.
    /// Returns at the next VMExit, with the exit logged and the guest
    /// state pulled back into the mirror.
    pub fn run(&self, tls: &mut Tls, id: Id) -> Result<ExitInfo, ObjError> {
        // Phase 1, under the pool lock: validate and stage.
        let (launched, mut gprs) = {
            let mut slots = self.slots.lock();
            let vps = slot_mut(&mut slots, id)?;
            if vps.state != ObjState::Allocated {
                return Err(state_err(vps.state));
            }
            if vps.assigned_pp != tls.ppid() {
                return Err(ObjError::WrongPp);
            }
            (vps.launched, vps.gprs())
        };

        if tls.loaded_vpsid != id {
            self.load(tls, id)?;
        }

        // Phase 2, no lock held: the guest runs until it exits. NMIs must
        // not be serviced inside the entry window; the ESR parks them as
        // pending and the loop delivers them at the next boundary.
        tls.nmi_lock = 1;
        let entry_result = unsafe { hve::vm_entry(launched, &mut gprs) };
        tls.nmi_lock = 0;
        let exit = entry_result?;

        // Phase 3, under the lock again: pull the guest back.
        let record = {
            let mut slots = self.slots.lock();
            let vps = slot_mut(&mut slots, id)?;
            vps.launched = true;
            vps.set_gprs(&gprs);
            for reg in [Reg::Rip, Reg::Rsp, Reg::Rflags] {
                // Safety: still the loaded structure on this PP.
                if let Ok(val) = unsafe { hve::read_field(reg.encoding()) } {
                    vps.set_field(reg, val);
                }
            }
            vps.set_field(Reg::ExitReason, exit.reason);
            vps.set_field(Reg::ExitQualification, exit.qualification);
            vps.set_field(Reg::ExitInterruptionInfo, exit.interruption_info);
            vps.set_field(Reg::ExitInstructionLength, exit.instruction_length);

            vmexit_log::VmExitRecord {
                tag: 0,
                vmid: tls.active_vmid.get(),
                vpid: tls.active_vpid.get(),
                vpsid: id.get(),
                exit_reason: exit.reason,
                rip: vps.field(Reg::Rip),
                exit_info: [
                    exit.qualification,
                    exit.interruption_info,
                    exit.instruction_length,
                ],
                gprs,
            }
        };
        tls.first_launch_succeeded = 1;
        vmexit_log::push(tls.ppid().as_usize(), tls.thread_id, record);
        Ok(exit)
    }

    /// Step the guest past the instruction that exited.
    pub fn advance_ip(&self, tls: &Tls, id: Id) -> Result<(), ObjError> {
        let (rip, len) = {
            let slots = self.slots.lock();
            let vps = slot(&slots, id)?;
            if vps.state != ObjState::Allocated {
                return Err(state_err(vps.state));
            }
            (vps.field(Reg::Rip), vps.field(Reg::ExitInstructionLength))
        };
        self.write_reg(tls, id, Reg::Rip, rip.wrapping_add(len))
    }

    /// Make `id` the active VPS on the caller's PP.
    pub fn set_active(&self, tls: &mut Tls, id: Id) -> Result<(), ObjError> {
        let pp = tls.ppid().as_usize();
        let mut slots = self.slots.lock();
        if slots.iter().any(|v| v.active[pp]) {
            return Err(ObjError::PpBusy);
        }
        let vps = slot_mut(&mut slots, id)?;
        match vps.state {
            ObjState::Allocated => {}
            ObjState::Zombie => return Err(ObjError::Zombie),
            ObjState::Deallocated => return Err(ObjError::NotAllocated),
        }
        if vps.assigned_pp.as_usize() != pp {
            return Err(ObjError::WrongPp);
        }
        vps.active[pp] = true;
        tls.active_vpsid = id;
        Ok(())
    }

    /// Clear the active bit on the caller's PP. Permitted on zombies.
    pub fn set_inactive(&self, tls: &mut Tls, id: Id) -> Result<(), ObjError> {
        let pp = tls.ppid().as_usize();
        let mut slots = self.slots.lock();
        let vps = slot_mut(&mut slots, id)?;
        if !vps.active[pp] {
            return Err(ObjError::NotActive);
        }
        vps.active[pp] = false;
        if tls.active_vpsid == id {
            tls.active_vpsid = Id::INVALID;
        }
        Ok(())
    }

    /// The first PP on which `id` is active, if any.
    pub fn is_active(&self, id: Id) -> Result<Option<Id>, ObjError> {
        let slots = self.slots.lock();
        Ok(slot(&slots, id)?.first_active_pp())
    }

    /// Render one VPS into the debug ring.
    pub fn dump(&self, id: Id) {
        let slots = self.slots.lock();
        match slot(&slots, id) {
            Ok(vps) => {
                diag::mklog_always!(
                    "vps [{:#06x}]: {:?}, vp={:#06x} pp={:#06x} loaded_on={:?} launched={}",
                    id,
                    vps.state,
                    vps.assigned_vp,
                    vps.assigned_pp,
                    vps.loaded_on,
                    vps.launched
                );
                diag::mklog_always!(
                    "  rip={:#018x} rsp={:#018x} rflags={:#010x}",
                    vps.field(Reg::Rip),
                    vps.field(Reg::Rsp),
                    vps.field(Reg::Rflags)
                );
            }
            Err(_) => diag::mklog_always!("vps [{:#06x}]: no such slot", id),
        }
    }
}

impl Default for VpsPool {
    fn default() -> Self {
        VpsPool::new()
    }
}

fn slot<'a>(slots: &'a [Vps], id: Id) -> Result<&'a Vps, ObjError> {
    slots.get(id.as_usize()).ok_or(ObjError::InvalidId)
}

fn slot_mut<'a>(slots: &'a mut [Vps], id: Id) -> Result<&'a mut Vps, ObjError> {
    slots.get_mut(id.as_usize()).ok_or(ObjError::InvalidId)
}

fn state_err(state: ObjState) -> ObjError {
    match state {
        ObjState::Zombie => ObjError::Zombie,
        _ => ObjError::NotAllocated,
    }
}

fn width_compatible(natural: Width, requested: Width) -> bool {
    matches!(
        (natural, requested),
        (Width::W16, Width::W16)
            | (Width::W32, Width::W32)
            | (Width::W64, Width::W64)
            // Narrow fields may be read/written through wider accessors.
            | (Width::W16, Width::W32)
            | (Width::W16, Width::W64)
            | (Width::W32, Width::W64)
    )
}

fn state_save_to_fields(state: &StateSave, vps: &mut Vps) {
    vps.set_field(Reg::Rax, state.rax);
    vps.set_field(Reg::Rbx, state.rbx);
    vps.set_field(Reg::Rcx, state.rcx);
    vps.set_field(Reg::Rdx, state.rdx);
    vps.set_field(Reg::Rbp, state.rbp);
    vps.set_field(Reg::Rsi, state.rsi);
    vps.set_field(Reg::Rdi, state.rdi);
    vps.set_field(Reg::R8, state.r8);
    vps.set_field(Reg::R9, state.r9);
    vps.set_field(Reg::R10, state.r10);
    vps.set_field(Reg::R11, state.r11);
    vps.set_field(Reg::R12, state.r12);
    vps.set_field(Reg::R13, state.r13);
    vps.set_field(Reg::R14, state.r14);
    vps.set_field(Reg::R15, state.r15);
    vps.set_field(Reg::Rip, state.rip);
    vps.set_field(Reg::Rsp, state.rsp);
    vps.set_field(Reg::Rflags, state.rflags);
    vps.set_field(Reg::GdtrBase, state.gdtr.base);
    vps.set_field(Reg::GdtrLimit, state.gdtr.limit as u64);
    vps.set_field(Reg::IdtrBase, state.idtr.base);
    vps.set_field(Reg::IdtrLimit, state.idtr.limit as u64);
    for (seg, sel, base, limit, attrib) in [
        (&state.es, Reg::EsSelector, Reg::EsBase, Reg::EsLimit, Reg::EsAttrib),
        (&state.cs, Reg::CsSelector, Reg::CsBase, Reg::CsLimit, Reg::CsAttrib),
        (&state.ss, Reg::SsSelector, Reg::SsBase, Reg::SsLimit, Reg::SsAttrib),
        (&state.ds, Reg::DsSelector, Reg::DsBase, Reg::DsLimit, Reg::DsAttrib),
        (&state.fs, Reg::FsSelector, Reg::FsBase, Reg::FsLimit, Reg::FsAttrib),
        (&state.gs, Reg::GsSelector, Reg::GsBase, Reg::GsLimit, Reg::GsAttrib),
        (
            &state.ldtr,
            Reg::LdtrSelector,
            Reg::LdtrBase,
            Reg::LdtrLimit,
            Reg::LdtrAttrib,
        ),
        (&state.tr, Reg::TrSelector, Reg::TrBase, Reg::TrLimit, Reg::TrAttrib),
    ] {
        vps.set_field(sel, seg.selector as u64);
        vps.set_field(base, seg.base);
        vps.set_field(limit, seg.limit as u64);
        vps.set_field(attrib, seg.attrib as u64);
    }
    vps.set_field(Reg::Cr0, state.cr0);
    vps.set_field(Reg::Cr2, state.cr2);
    vps.set_field(Reg::Cr3, state.cr3);
    vps.set_field(Reg::Cr4, state.cr4);
    vps.set_field(Reg::Dr7, state.dr7);
    vps.set_field(Reg::Efer, state.efer);
    vps.set_field(Reg::Star, state.star);
    vps.set_field(Reg::Lstar, state.lstar);
    vps.set_field(Reg::Cstar, state.cstar);
    vps.set_field(Reg::Fmask, state.fmask);
    vps.set_field(Reg::KernelGsBase, state.kernel_gs_base);
    vps.set_field(Reg::SysenterCs, state.sysenter_cs);
    vps.set_field(Reg::SysenterEsp, state.sysenter_esp);
    vps.set_field(Reg::SysenterEip, state.sysenter_eip);
    vps.set_field(Reg::Pat, state.pat);
    vps.set_field(Reg::Debugctl, state.debugctl);
    // The hidden fs/gs bases override the segment-table view.
    vps.set_field(Reg::FsBase, state.fs_base);
    vps.set_field(Reg::GsBase, state.gs_base);
}

fn fields_to_state_save(vps: &Vps) -> StateSave {
    let mut s = StateSave::zeroed();
    s.rax = vps.field(Reg::Rax);
    s.rbx = vps.field(Reg::Rbx);
    s.rcx = vps.field(Reg::Rcx);
    s.rdx = vps.field(Reg::Rdx);
    s.rbp = vps.field(Reg::Rbp);
    s.rsi = vps.field(Reg::Rsi);
    s.rdi = vps.field(Reg::Rdi);
    s.r8 = vps.field(Reg::R8);
    s.r9 = vps.field(Reg::R9);
    s.r10 = vps.field(Reg::R10);
    s.r11 = vps.field(Reg::R11);
    s.r12 = vps.field(Reg::R12);
    s.r13 = vps.field(Reg::R13);
    s.r14 = vps.field(Reg::R14);
    s.r15 = vps.field(Reg::R15);
    s.rip = vps.field(Reg::Rip);
    s.rsp = vps.field(Reg::Rsp);
    s.rflags = vps.field(Reg::Rflags);
    s.gdtr.base = vps.field(Reg::GdtrBase);
    s.gdtr.limit = vps.field(Reg::GdtrLimit) as u16;
    s.idtr.base = vps.field(Reg::IdtrBase);
    s.idtr.limit = vps.field(Reg::IdtrLimit) as u16;
    for (seg, sel, base, limit, attrib) in [
        (&mut s.es, Reg::EsSelector, Reg::EsBase, Reg::EsLimit, Reg::EsAttrib),
        (&mut s.cs, Reg::CsSelector, Reg::CsBase, Reg::CsLimit, Reg::CsAttrib),
        (&mut s.ss, Reg::SsSelector, Reg::SsBase, Reg::SsLimit, Reg::SsAttrib),
        (&mut s.ds, Reg::DsSelector, Reg::DsBase, Reg::DsLimit, Reg::DsAttrib),
        (&mut s.fs, Reg::FsSelector, Reg::FsBase, Reg::FsLimit, Reg::FsAttrib),
        (&mut s.gs, Reg::GsSelector, Reg::GsBase, Reg::GsLimit, Reg::GsAttrib),
        (
            &mut s.ldtr,
            Reg::LdtrSelector,
            Reg::LdtrBase,
            Reg::LdtrLimit,
            Reg::LdtrAttrib,
        ),
        (&mut s.tr, Reg::TrSelector, Reg::TrBase, Reg::TrLimit, Reg::TrAttrib),
    ] {
        seg.selector = vps.field(sel) as u16;
        seg.base = vps.field(base);
        seg.limit = vps.field(limit) as u32;
        seg.attrib = vps.field(attrib) as u16;
    }
    s.cr0 = vps.field(Reg::Cr0);
    s.cr2 = vps.field(Reg::Cr2);
    s.cr3 = vps.field(Reg::Cr3);
    s.cr4 = vps.field(Reg::Cr4);
    s.dr7 = vps.field(Reg::Dr7);
    s.efer = vps.field(Reg::Efer);
    s.star = vps.field(Reg::Star);
    s.lstar = vps.field(Reg::Lstar);
    s.cstar = vps.field(Reg::Cstar);
    s.fmask = vps.field(Reg::Fmask);
    s.fs_base = vps.field(Reg::FsBase);
    s.gs_base = vps.field(Reg::GsBase);
    s.kernel_gs_base = vps.field(Reg::KernelGsBase);
    s.sysenter_cs = vps.field(Reg::SysenterCs);
    s.sysenter_esp = vps.field(Reg::SysenterEsp);
    s.sysenter_eip = vps.field(Reg::SysenterEip);
    s.pat = vps.field(Reg::Pat);
    s.debugctl = vps.field(Reg::Debugctl);
    s
}

#[cfg(test)]
mod tests {
    use super::*;
    use mkboot::PoolSpan;

    struct Fixture {
        huge: Mutex<HugePool>,
        _backing: alloc::boxed::Box<[u8]>,
    }

    fn fixture(chunks: usize) -> Fixture {
        let bytes = (chunks + 1) * 4096;
        let backing = alloc::vec![0u8; bytes].into_boxed_slice();
        let raw = backing.as_ptr() as u64;
        let virt = (raw + 4095) & !4095;
        let mut pool = HugePool::new();
        pool.initialize(PoolSpan {
            virt,
            phys: 0xC000_0000,
            size: (chunks * 4096) as u64,
        })
        .unwrap();
        Fixture {
            huge: Mutex::new(pool),
            _backing: backing,
        }
    }

    fn sample_state() -> StateSave {
        let mut s = StateSave::zeroed();
        s.rip = 0xFFFF_8000_1234_5678;
        s.rsp = 0xFFFF_8000_0BAD_F000;
        s.rflags = 0x202;
        s.cr3 = 0x1000;
        s.cs.selector = 0x08;
        s.cs.attrib = 0xA09B;
        s.efer = 0xD01;
        s.rax = 0x11;
        s.r15 = 0xFF;
        s
    }

    #[test]
    fn allocate_takes_a_contiguous_control_page() {
        let f = fixture(4);
        let pool = VpsPool::new();
        pool.initialize();
        let id = pool.allocate(&f.huge, Id::new(0), Id::new(0)).unwrap();
        assert_eq!(f.huge.lock().allocated(), 1);
        assert_eq!(pool.assigned_vp(id).unwrap().get(), 0);
    }

    #[test]
    fn init_as_root_round_trips_through_promote() {
        let _guard = intrinsics::soft::test_guard();
        intrinsics::soft::reset();
        let f = fixture(4);
        let pool = VpsPool::new();
        pool.initialize();
        let tls = Tls::new(0);
        let id = pool.allocate(&f.huge, Id::new(0), Id::new(0)).unwrap();
        let state = sample_state();
        pool.init_as_root(&tls, id, &state).unwrap();
        assert_eq!(pool.read_reg(id, Reg::Rip).unwrap(), state.rip);
        assert_eq!(pool.read_reg(id, Reg::Efer).unwrap(), state.efer);
        let back = pool.vps_to_state(id).unwrap();
        assert_eq!(back, state);
    }

    #[test]
    fn sized_access_checks_widths() {
        let f = fixture(4);
        let pool = VpsPool::new();
        pool.initialize();
        let tls = Tls::new(0);
        let id = pool.allocate(&f.huge, Id::new(0), Id::new(0)).unwrap();
        let sel = Reg::CsSelector.encoding();
        pool.write_sized(&tls, id, sel, Width::W16, 0x1BEEF).unwrap();
        // Truncated to the field width.
        assert_eq!(pool.read_sized(id, sel, Width::W16).unwrap(), 0xBEEF);
        // A 64-bit field cannot be written through a 16-bit accessor.
        assert_eq!(
            pool.write_sized(&tls, id, Reg::Rip.encoding(), Width::W16, 1),
            Err(ObjError::InvalidId)
        );
    }

    #[test]
    fn run_launches_once_then_resumes() {
        let _guard = intrinsics::soft::test_guard();
        intrinsics::soft::reset();
        let f = fixture(4);
        let pool = VpsPool::new();
        pool.initialize();
        let mut tls = Tls::new(0);
        let id = pool.allocate(&f.huge, Id::new(0), Id::new(0)).unwrap();
        pool.init_as_root(&tls, id, &sample_state()).unwrap();

        pool.run(&mut tls, id).unwrap();
        pool.run(&mut tls, id).unwrap();
        let entries = intrinsics::soft::entries();
        assert_eq!(entries.len(), 2);
        assert!(!entries[0].launched, "first entry must launch");
        assert!(entries[1].launched, "second entry must resume");
        assert_eq!(tls.loaded_vpsid, id);
        assert_eq!(tls.first_launch_succeeded, 1);
    }

    #[test]
    fn cross_pp_load_requires_a_clear() {
        let _guard = intrinsics::soft::test_guard();
        intrinsics::soft::reset();
        let f = fixture(4);
        let pool = VpsPool::new();
        pool.initialize();
        let mut tls0 = Tls::new(0);
        let id = pool.allocate(&f.huge, Id::new(0), Id::new(0)).unwrap();
        pool.load(&mut tls0, id).unwrap();

        // Migrate the VPS to PP 1 (the VP layer would do this) and try to
        // load it there without clearing on PP 0.
        {
            let mut slots = pool.slots.lock();
            slots[id.as_usize()].assigned_pp = Id::new(1);
        }
        let mut tls1 = Tls::new(1);
        assert_eq!(pool.load(&mut tls1, id), Err(ObjError::NeedsClear));

        // The clear must run on the owning PP.
        assert_eq!(pool.clear(&mut tls1, id), Err(ObjError::WrongPp));
        pool.clear(&mut tls0, id).unwrap();
        pool.load(&mut tls1, id).unwrap();
        assert_eq!(tls1.loaded_vpsid, id);
    }

    #[test]
    fn clear_resets_the_launch_state() {
        let _guard = intrinsics::soft::test_guard();
        intrinsics::soft::reset();
        let f = fixture(4);
        let pool = VpsPool::new();
        pool.initialize();
        let mut tls = Tls::new(0);
        let id = pool.allocate(&f.huge, Id::new(0), Id::new(0)).unwrap();
        pool.init_as_root(&tls, id, &sample_state()).unwrap();
        pool.run(&mut tls, id).unwrap();
        pool.clear(&mut tls, id).unwrap();
        assert!(tls.loaded_vpsid.is_invalid());
        pool.run(&mut tls, id).unwrap();
        let entries = intrinsics::soft::entries();
        assert!(!entries.last().unwrap().launched, "entry after clear must launch");
    }

    #[test]
    fn advance_ip_steps_past_the_exited_instruction() {
        let _guard = intrinsics::soft::test_guard();
        intrinsics::soft::reset();
        let f = fixture(4);
        let pool = VpsPool::new();
        pool.initialize();
        let mut tls = Tls::new(0);
        let id = pool.allocate(&f.huge, Id::new(0), Id::new(0)).unwrap();
        let mut state = sample_state();
        state.rip = 0x4000;
        pool.init_as_root(&tls, id, &state).unwrap();
        intrinsics::soft::push_exit(ExitInfo {
            reason: intrinsics::hve::exit_reason::VMCALL,
            instruction_length: 3,
            ..ExitInfo::default()
        });
        pool.run(&mut tls, id).unwrap();
        pool.advance_ip(&tls, id).unwrap();
        assert_eq!(pool.read_reg(id, Reg::Rip).unwrap(), 0x4003);
    }

    #[test]
    fn run_logs_the_exit_with_the_guest_rip() {
        let _guard = intrinsics::soft::test_guard();
        intrinsics::soft::reset();
        let f = fixture(4);
        let pool = VpsPool::new();
        pool.initialize();
        // Use a high PP so module tests elsewhere cannot collide.
        let mut tls = Tls::new(61);
        let id = pool.allocate(&f.huge, Id::new(0), Id::new(61)).unwrap();
        let state = sample_state();
        pool.init_as_root(&tls, id, &state).unwrap();
        let before = diag::vmexit_log::total(61);
        pool.run(&mut tls, id).unwrap();
        assert_eq!(diag::vmexit_log::total(61), before + 1);
        let snap = diag::vmexit_log::snapshot(61);
        let rec = snap.last().unwrap();
        assert_eq!(rec.rip, state.rip);
        assert_eq!(rec.vpsid, id.get());
    }

    #[test]
    fn deallocate_refuses_loaded_and_zombie() {
        let _guard = intrinsics::soft::test_guard();
        intrinsics::soft::reset();
        let f = fixture(4);
        let pool = VpsPool::new();
        pool.initialize();
        let tls_pool = TlsPool::new();
        let id = pool.allocate(&f.huge, Id::new(0), Id::new(60)).unwrap();
        tls_pool.with(60, |tls| pool.load(tls, id).unwrap()).unwrap();
        assert_eq!(
            pool.deallocate(&f.huge, &tls_pool, id),
            Err(ObjError::Active)
        );
        tls_pool.with(60, |tls| pool.clear(tls, id).unwrap()).unwrap();
        pool.zombify(id).unwrap();
        assert_eq!(
            pool.deallocate(&f.huge, &tls_pool, id),
            Err(ObjError::Zombie)
        );
        // The zombie kept its control page.
        assert_eq!(f.huge.lock().allocated(), 1);
    }
}
