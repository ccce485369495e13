//! The per-PP TLS block and its pool.
//!
//! One [`Tls`] block per physical processor, 4 KiB-aligned and -bounded so
//! allocating, mapping, and zeroing one is trivial. On bare metal the
//! block's address also sits in the per-PP thread register, which is how
//! the syscall and exception entry stubs reach per-PP state with no other
//! context; the field groups below are offset-addressed by that assembly,
//! hence `#[repr(C)]`.
//!
//! Every mutating microkernel path receives `&mut Tls` for its own PP.
//! Cross-PP queries (is this VPS loaded *anywhere*?) go through the
//! [`TlsPool`], which reads other slots racily; acceptable because those
//! queries gate operations that are themselves serialized by the object
//! pools.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::cell::UnsafeCell;
use mkabi::layout::MAX_PPS;
use mkabi::{Id, SysStatus, ThreadTag};
use mkboot::StateSave;
use spin::Once;

/// Exception-service-routine snapshot area.
#[derive(Clone, Copy, Debug, Default)]
#[repr(C)]
pub struct EsrState {
    pub gprs: [u64; 16],
    pub rip: u64,
    pub rsp: u64,
    pub vector: u64,
    pub error_code: u64,
    pub cr0: u64,
    pub cr2: u64,
    pub cr3: u64,
    pub cr4: u64,
    pub cs: u64,
    pub ss: u64,
    pub rflags: u64,
}

/// The fast-fail landing sites. Each site records, at entry, where this PP
/// should resume if the work it dispatched cannot continue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u64)]
pub enum FailSite {
    MkMain = 0,
    CallExt = 1,
    DispatchSyscall = 2,
    VmExitLoop = 3,
}

/// The per-PP TLS block.
#[repr(C, align(4096))]
pub struct Tls {
    // ------------------------------------------------------------------
    // Microkernel callee-saves (filled by the call-ext trampoline).
    // ------------------------------------------------------------------
    pub mk_rbx: u64,
    pub mk_rbp: u64,
    pub mk_r12: u64,
    pub mk_r13: u64,
    pub mk_r14: u64,
    pub mk_r15: u64,

    // ------------------------------------------------------------------
    // Extension registers (filled by the syscall entry stub).
    // ------------------------------------------------------------------
    pub ext_syscall: u64,
    pub ext_reg0: u64,
    pub ext_reg1: u64,
    pub ext_reg2: u64,
    pub ext_reg3: u64,
    pub ext_reg4: u64,
    pub ext_reg5: u64,

    /// Status of the last syscall, mirrored to RAX on return.
    pub syscall_ret_status: u64,

    // ------------------------------------------------------------------
    // ESR snapshot (filled by the exception entry stubs).
    // ------------------------------------------------------------------
    pub esr: EsrState,

    // ------------------------------------------------------------------
    // Fast-fail information.
    // ------------------------------------------------------------------
    pub current_fast_fail_ip: u64,
    pub current_fast_fail_sp: u64,
    pub mk_main_fast_fail_ip: u64,
    pub mk_main_fast_fail_sp: u64,
    pub call_ext_fast_fail_ip: u64,
    pub call_ext_fast_fail_sp: u64,
    pub dispatch_syscall_fast_fail_ip: u64,
    pub dispatch_syscall_fast_fail_sp: u64,
    pub vmexit_loop_fast_fail_ip: u64,
    pub vmexit_loop_fast_fail_sp: u64,
    /// Which site `current_fast_fail_*` names right now.
    current_site: FailSite,

    // ------------------------------------------------------------------
    // Context.
    // ------------------------------------------------------------------
    /// Packed (ext | vm | vp | pp).
    pub thread_id: ThreadTag,
    /// The extension currently executing on this PP.
    pub ext: Id,
    /// The extension registered for VMExits.
    pub ext_vmexit: Id,
    /// The extension registered for fast-fail events.
    pub ext_fail: Id,
    pub active_vmid: Id,
    pub active_vpid: Id,
    pub active_vpsid: Id,
    /// The VPS whose control structure is loaded on this PP.
    pub loaded_vpsid: Id,

    /// Stack pointer handed to extension callbacks on this PP.
    pub sp: u64,
    /// Thread pointer handed to extension callbacks on this PP.
    pub tp: u64,

    /// Return address for planned risky operations; the ESR consults this
    /// before treating a fault as fatal.
    pub unsafe_rip: u64,

    /// Non-zero while NMIs must be deferred.
    pub nmi_lock: u64,
    /// An NMI arrived while the lock was held.
    pub nmi_pending: u64,

    /// Set once the first VMLAUNCH on this PP succeeds.
    pub first_launch_succeeded: u64,

    // ------------------------------------------------------------------
    // Captured state (cloned from the loader args at demote).
    // ------------------------------------------------------------------
    pub mk_state: StateSave,
    pub root_vp_state: StateSave,

    // ------------------------------------------------------------------
    // Loop plumbing (not read by assembly).
    // ------------------------------------------------------------------
    run_request: Id,
    promote_request: bool,
}

const _: () = assert!(core::mem::size_of::<Tls>() <= 4096);

impl Tls {
    /// A fresh block for `ppid`.
    pub fn new(ppid: u16) -> Self {
        let mut tag = ThreadTag::INVALID;
        tag.set_ppid(Id::new(ppid));
        Tls {
            mk_rbx: 0,
            mk_rbp: 0,
            mk_r12: 0,
            mk_r13: 0,
            mk_r14: 0,
            mk_r15: 0,
            ext_syscall: 0,
            ext_reg0: 0,
            ext_reg1: 0,
            ext_reg2: 0,
            ext_reg3: 0,
            ext_reg4: 0,
            ext_reg5: 0,
            syscall_ret_status: SysStatus::SUCCESS.get(),
            esr: EsrState::default(),
            current_fast_fail_ip: 0,
            current_fast_fail_sp: 0,
            mk_main_fast_fail_ip: 0,
            mk_main_fast_fail_sp: 0,
            call_ext_fast_fail_ip: 0,
            call_ext_fast_fail_sp: 0,
            dispatch_syscall_fast_fail_ip: 0,
            dispatch_syscall_fast_fail_sp: 0,
            vmexit_loop_fast_fail_ip: 0,
            vmexit_loop_fast_fail_sp: 0,
            current_site: FailSite::MkMain,
            thread_id: tag,
            ext: Id::INVALID,
            ext_vmexit: Id::INVALID,
            ext_fail: Id::INVALID,
            active_vmid: Id::INVALID,
            active_vpid: Id::INVALID,
            active_vpsid: Id::INVALID,
            loaded_vpsid: Id::INVALID,
            sp: 0,
            tp: 0,
            unsafe_rip: 0,
            nmi_lock: 0,
            nmi_pending: 0,
            first_launch_succeeded: 0,
            mk_state: StateSave::zeroed(),
            root_vp_state: StateSave::zeroed(),
            run_request: Id::INVALID,
            promote_request: false,
        }
    }

    /// This block's PP id.
    #[inline]
    pub fn ppid(&self) -> Id {
        self.thread_id.ppid()
    }

    /// Record which fast-fail site is current.
    pub fn set_fail_site(&mut self, site: FailSite) -> FailSite {
        let previous = self.current_site;
        self.current_site = site;
        let (ip, sp) = match site {
            FailSite::MkMain => (self.mk_main_fast_fail_ip, self.mk_main_fast_fail_sp),
            FailSite::CallExt => (self.call_ext_fast_fail_ip, self.call_ext_fast_fail_sp),
            FailSite::DispatchSyscall => (
                self.dispatch_syscall_fast_fail_ip,
                self.dispatch_syscall_fast_fail_sp,
            ),
            FailSite::VmExitLoop => (self.vmexit_loop_fast_fail_ip, self.vmexit_loop_fast_fail_sp),
        };
        self.current_fast_fail_ip = ip;
        self.current_fast_fail_sp = sp;
        previous
    }

    /// The current fast-fail site.
    #[inline]
    pub fn fail_site(&self) -> FailSite {
        self.current_site
    }

    /// Queue a VPS for entry; the VMExit loop performs it.
    #[inline]
    pub fn request_run(&mut self, vpsid: Id) {
        self.run_request = vpsid;
    }

    /// Take the queued entry request, if any.
    #[inline]
    pub fn take_run_request(&mut self) -> Option<Id> {
        if self.run_request.is_invalid() {
            None
        } else {
            let id = self.run_request;
            self.run_request = Id::INVALID;
            Some(id)
        }
    }

    /// Ask the VMExit loop to hand this PP back to the demoted OS.
    #[inline]
    pub fn request_promote(&mut self) {
        self.promote_request = true;
    }

    /// Take the promote request, if any.
    #[inline]
    pub fn take_promote_request(&mut self) -> bool {
        core::mem::replace(&mut self.promote_request, false)
    }

    /// Record the active (vm, vp, vps) triple and mirror it into the tag.
    pub fn set_active_triple(&mut self, vmid: Id, vpid: Id, vpsid: Id) {
        self.active_vmid = vmid;
        self.active_vpid = vpid;
        self.active_vpsid = vpsid;
        self.thread_id.set_vmid(vmid);
        self.thread_id.set_vpid(vpid);
    }
}

// ============================================================================
// TLS pool
// ============================================================================

struct Slots(UnsafeCell<Box<[Tls]>>);

// Safety: each PP mutates only its own slot (handed out by `with`); foreign
// slots are only read, by debug-grade queries that tolerate tearing.
unsafe impl Sync for Slots {}

/// All TLS blocks, indexed by PP id.
pub struct TlsPool {
    slots: Once<Slots>,
}

impl TlsPool {
    pub const fn new() -> Self {
        TlsPool { slots: Once::new() }
    }

    fn slots(&self) -> &Slots {
        self.slots.call_once(|| {
            let mut v = Vec::with_capacity(MAX_PPS);
            for pp in 0..MAX_PPS {
                v.push(Tls::new(pp as u16));
            }
            Slots(UnsafeCell::new(v.into_boxed_slice()))
        })
    }

    /// Run `f` with mutable access to `pp`'s block.
    ///
    /// Must only be called from (or on behalf of) `pp` itself; the loader
    /// serializes per-PP starts, and each PP thereafter touches only its
    /// own slot.
    pub fn with<R>(&self, pp: usize, f: impl FnOnce(&mut Tls) -> R) -> Option<R> {
        if pp >= MAX_PPS {
            return None;
        }
        // Safety: see Slots.
        let slot = unsafe { &mut (*self.slots().0.get())[pp] };
        Some(f(slot))
    }

    /// The PP on which `vpsid` is currently loaded, if any.
    pub fn vps_loaded_on(&self, vpsid: Id) -> Option<Id> {
        self.scan(|tls| tls.loaded_vpsid == vpsid)
    }

    /// The PP on which `vpsid` is the active VPS, if any.
    pub fn vps_active_on(&self, vpsid: Id) -> Option<Id> {
        self.scan(|tls| tls.active_vpsid == vpsid)
    }

    /// The PP on which `vpid` is the active VP, if any.
    pub fn vp_active_on(&self, vpid: Id) -> Option<Id> {
        self.scan(|tls| tls.active_vpid == vpid)
    }

    /// The PP on which `vmid` is the active VM, if any.
    pub fn vm_active_on(&self, vmid: Id) -> Option<Id> {
        self.scan(|tls| tls.active_vmid == vmid)
    }

    fn scan(&self, pred: impl Fn(&Tls) -> bool) -> Option<Id> {
        for pp in 0..MAX_PPS {
            // Safety: read-only peek; tearing tolerated (see Slots).
            let slot = unsafe { &(*self.slots().0.get())[pp] };
            if pred(slot) {
                return Some(Id::new(pp as u16));
            }
        }
        None
    }
}

impl Default for TlsPool {
    fn default() -> Self {
        TlsPool::new()
    }
}
