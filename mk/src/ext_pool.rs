//! The extension pool: loading, callback registration, and dispatch.
//!
//! Callback dispatch is the delicate part. Each call into an extension
//! saves the microkernel callee-saves in TLS, switches to the extension's
//! RPT, runs the callback on the extension's per-PP stack, and restores on
//! the way out; a failure inside the extension lands on the `call_ext`
//! fast-fail site rather than unwinding microkernel frames it could
//! corrupt.
//!
//! The pool's lock is *never* held while extension code runs: the
//! dispatch path copies what it needs out of the slot, drops the lock,
//! and only then transitions. Extension callbacks issue syscalls, and
//! syscalls take pool locks.
//!
//! On non-bare-metal builds the transition invokes a registered host
//! function instead of user code, which is how the whole
//! bootstrap→run→vmexit cycle executes under `cargo test`.

use crate::ext::{Ext, ExtError};
use crate::tls::{FailSite, Tls};
use crate::Resources;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU16, Ordering};
use mkabi::layout::MAX_EXTS;
use mkabi::Id;
use spin::Mutex;

/// Which callback a dispatch targets.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Callback {
    Start,
    Bootstrap,
    VmExit,
    Fail,
}

/// The pool.
pub struct ExtPool {
    slots: Mutex<Vec<Ext>>,
    /// Global registrations: which extension owns each event. `u16::MAX`
    /// means unregistered; `mk_main` copies these into each PP's TLS.
    registered_vmexit: AtomicU16,
    registered_fail: AtomicU16,
}

impl ExtPool {
    pub const fn new() -> Self {
        ExtPool {
            slots: Mutex::new(Vec::new()),
            registered_vmexit: AtomicU16::new(u16::MAX),
            registered_fail: AtomicU16::new(u16::MAX),
        }
    }

    /// Load every provided image.
    pub fn initialize(
        &self,
        res: &Resources,
        images: &[Option<&[u8]>; MAX_EXTS],
        online_pps: usize,
    ) -> Result<(), ExtError> {
        let mut slots = self.slots.lock();
        slots.clear();
        for i in 0..MAX_EXTS {
            slots.push(Ext::new(Id::new(i as u16)));
        }
        for (i, image) in images.iter().enumerate() {
            if let Some(image) = image {
                slots[i].load(res, image, online_pps)?;
            }
        }
        Ok(())
    }

    /// Tear every extension down and forget registrations.
    pub fn release(&self, res: &Resources) -> Result<(), ExtError> {
        let mut slots = self.slots.lock();
        for ext in slots.iter_mut() {
            ext.release(res)?;
        }
        slots.clear();
        self.registered_vmexit.store(u16::MAX, Ordering::Release);
        self.registered_fail.store(u16::MAX, Ordering::Release);
        Ok(())
    }

    /// Number of loaded extensions.
    pub fn loaded(&self) -> usize {
        self.slots.lock().iter().filter(|e| e.is_loaded()).count()
    }

    /// The extension registered for VMExits, if any.
    pub fn vmexit_ext(&self) -> Id {
        Id::new(self.registered_vmexit.load(Ordering::Acquire))
    }

    /// The extension registered for fast-fail events, if any.
    pub fn fail_ext(&self) -> Id {
        Id::new(self.registered_fail.load(Ordering::Acquire))
    }

    /// Run `f` against one slot under the pool lock.
    pub fn with_ext<R>(
        &self,
        id: Id,
        f: impl FnOnce(&mut Ext) -> R,
    ) -> Result<R, ExtError> {
        let mut slots = self.slots.lock();
        let ext = slots
            .get_mut(id.as_usize())
            .filter(|e| e.is_loaded())
            .ok_or(ExtError::NoSuchExt)?;
        Ok(f(ext))
    }

    // ------------------------------------------------------------------
    // Callback registration (driven by bf_callback_op syscalls)
    // ------------------------------------------------------------------

    pub fn register_bootstrap(&self, ext: Id, ip: u64) -> Result<(), ExtError> {
        self.with_ext(ext, |e| e.bootstrap_ip = ip)
    }

    pub fn register_vmexit(&self, ext: Id, ip: u64) -> Result<(), ExtError> {
        self.with_ext(ext, |e| e.vmexit_ip = ip)?;
        self.registered_vmexit.store(ext.get(), Ordering::Release);
        Ok(())
    }

    pub fn register_fail(&self, ext: Id, ip: u64) -> Result<(), ExtError> {
        self.with_ext(ext, |e| e.fail_ip = ip)?;
        self.registered_fail.store(ext.get(), Ordering::Release);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Lifecycle notifications
    // ------------------------------------------------------------------

    pub fn signal_vm_created(&self, vmid: Id) -> Result<(), ExtError> {
        let mut slots = self.slots.lock();
        for ext in slots.iter_mut().filter(|e| e.is_loaded()) {
            ext.signal_vm_created(vmid)?;
        }
        Ok(())
    }

    pub fn signal_vm_destroyed(&self, vmid: Id) -> Result<(), ExtError> {
        let mut slots = self.slots.lock();
        for ext in slots.iter_mut().filter(|e| e.is_loaded()) {
            ext.signal_vm_destroyed(vmid)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    /// Run every loaded extension's `_start`.
    pub fn start(&self, tls: &mut Tls, res: &Resources) -> Result<(), ExtError> {
        for id in self.loaded_ids() {
            let entry = self.with_ext(id, |e| e.entry_ip)?;
            self.call(tls, res, id, Callback::Start, entry, 0, 0)?;
            self.with_ext(id, |e| e.started = true)?;
        }
        Ok(())
    }

    /// Run every loaded extension's bootstrap callback on this PP.
    pub fn bootstrap(&self, tls: &mut Tls, res: &Resources) -> Result<(), ExtError> {
        let pp = tls.ppid().get() as u64;
        for id in self.loaded_ids() {
            let ip = self.with_ext(id, |e| e.bootstrap_ip)?;
            self.call(tls, res, id, Callback::Bootstrap, ip, pp, 0)?;
        }
        Ok(())
    }

    /// Deliver a VMExit to the registered extension.
    pub fn vmexit(
        &self,
        tls: &mut Tls,
        res: &Resources,
        vpsid: Id,
        reason: u64,
    ) -> Result<(), ExtError> {
        let id = tls.ext_vmexit;
        let ip = self.with_ext(id, |e| e.vmexit_ip)?;
        self.call(tls, res, id, Callback::VmExit, ip, vpsid.get() as u64, reason)
    }

    /// Deliver a fast-fail event to the registered extension.
    pub fn fail(&self, tls: &mut Tls, res: &Resources, status: u64) -> Result<(), ExtError> {
        let id = tls.ext_fail;
        let ip = self.with_ext(id, |e| e.fail_ip)?;
        self.call(tls, res, id, Callback::Fail, ip, status, 0)
    }

    /// Render every loaded extension into the debug ring.
    pub fn dump(&self) {
        let slots = self.slots.lock();
        for ext in slots.iter().filter(|e| e.is_loaded()) {
            ext.dump();
        }
    }

    fn loaded_ids(&self) -> Vec<Id> {
        self.slots
            .lock()
            .iter()
            .filter(|e| e.is_loaded())
            .map(|e| e.id())
            .collect()
    }

    /// The transition itself. The pool lock is not held here.
    fn call(
        &self,
        tls: &mut Tls,
        res: &Resources,
        id: Id,
        which: Callback,
        ip: u64,
        arg0: u64,
        arg1: u64,
    ) -> Result<(), ExtError> {
        let (rpt_phys, sp, tp) = self.with_ext(id, |e| {
            let pp = tls.ppid().as_usize();
            (e.rpt_phys(), e.stack_top(pp), e.tls_top(pp))
        })?;

        let prev_ext = tls.ext;
        let prev_site = tls.set_fail_site(FailSite::CallExt);
        tls.ext = id;
        tls.thread_id.set_extid(id);
        tls.sp = sp;
        tls.tp = tp;

        // The extension RPT aliases the whole microkernel half, so this
        // switch never pulls the stack out from under us.
        unsafe { intrinsics::regs::set_root(rpt_phys) };
        intrinsics::regs::set_tp(tp);

        let result = self.invoke(tls, res, id, which, ip, arg0, arg1);

        {
            let system = res.system_rpt.lock();
            if system.is_initialized() {
                let _ = system.activate();
            }
        }
        tls.ext = prev_ext;
        tls.thread_id.set_extid(prev_ext);
        tls.set_fail_site(prev_site);

        result
    }

    #[cfg(target_os = "none")]
    fn invoke(
        &self,
        _tls: &mut Tls,
        _res: &Resources,
        _id: Id,
        _which: Callback,
        ip: u64,
        arg0: u64,
        arg1: u64,
    ) -> Result<(), ExtError> {
        if ip == 0 {
            return Ok(());
        }
        // Safety: ip points into the extension image mapped by its RPT;
        // the callback conforms to the two-argument callback ABI.
        let entry: extern "C" fn(u64, u64) -> u64 = unsafe { core::mem::transmute(ip) };
        match entry(arg0, arg1) {
            0 => Ok(()),
            _ => Err(ExtError::CallbackFailed),
        }
    }

    #[cfg(not(target_os = "none"))]
    fn invoke(
        &self,
        tls: &mut Tls,
        res: &Resources,
        id: Id,
        which: Callback,
        _ip: u64,
        arg0: u64,
        arg1: u64,
    ) -> Result<(), ExtError> {
        host::invoke(tls, res, id, which, arg0, arg1)
    }
}

impl Default for ExtPool {
    fn default() -> Self {
        ExtPool::new()
    }
}

/// Host-build callback registry: tests install Rust functions in place of
/// extension code.
#[cfg(not(target_os = "none"))]
pub mod host {
    use super::{Callback, ExtError, Resources, Tls};
    use mkabi::layout::MAX_EXTS;
    use mkabi::Id;
    use spin::Mutex;

    /// A host stand-in for one extension callback. Receives the caller's
    /// TLS and the resource bundle so it can issue syscalls the way real
    /// extension code would.
    pub type HostFn = fn(&mut Tls, &Resources, u64, u64) -> Result<(), ()>;

    #[derive(Clone, Copy, Default)]
    pub struct Hooks {
        pub start: Option<HostFn>,
        pub bootstrap: Option<HostFn>,
        pub vmexit: Option<HostFn>,
        pub fail: Option<HostFn>,
    }

    static HOOKS: Mutex<[Hooks; MAX_EXTS]> = Mutex::new(
        [Hooks {
            start: None,
            bootstrap: None,
            vmexit: None,
            fail: None,
        }; MAX_EXTS],
    );

    /// Install the host callbacks for extension `id`.
    pub fn set_hooks(id: usize, hooks: Hooks) {
        HOOKS.lock()[id] = hooks;
    }

    /// Remove all host callbacks (test isolation).
    pub fn clear_hooks() {
        *HOOKS.lock() = [Hooks::default(); MAX_EXTS];
    }

    pub(super) fn invoke(
        tls: &mut Tls,
        res: &Resources,
        id: Id,
        which: Callback,
        arg0: u64,
        arg1: u64,
    ) -> Result<(), ExtError> {
        let hook = {
            let hooks = HOOKS.lock();
            let slot = hooks.get(id.as_usize()).copied().unwrap_or_default();
            match which {
                Callback::Start => slot.start,
                Callback::Bootstrap => slot.bootstrap,
                Callback::VmExit => slot.vmexit,
                Callback::Fail => slot.fail,
            }
        };
        match hook {
            None => Ok(()),
            Some(f) => f(tls, res, arg0, arg1).map_err(|_| ExtError::CallbackFailed),
        }
    }
}
