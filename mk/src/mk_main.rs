//! The microkernel's per-PP entry logic.
//!
//! `process` is what a PP does between the loader's `VMM_INIT` and the
//! VMExit loop. Global resources come up exactly once, in leaves-first
//! order; every later PP re-activates the already-built system RPT and
//! goes straight to its own bootstrap. The sequence deliberately matches
//! teardown in reverse (see `ctl`).

use crate::tls::{FailSite, Tls};
use crate::vmexit_loop::{self, LoopExit};
use crate::{MkError, Resources};
use core::sync::atomic::{AtomicBool, Ordering};
use mkabi::Id;
use mkboot::MkArgs;

pub struct MkMain {
    initialized: AtomicBool,
}

impl MkMain {
    pub const fn new() -> Self {
        MkMain {
            initialized: AtomicBool::new(false),
        }
    }

    /// True once global init has run.
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Reset the once-flag at full teardown.
    pub(crate) fn reset(&self) {
        self.initialized.store(false, Ordering::Release);
    }

    /// Bring this PP up and enter the VMExit loop.
    pub fn process(
        &self,
        args: &MkArgs,
        tls: &mut Tls,
        res: &Resources,
    ) -> Result<LoopExit, MkError> {
        let prev_site = tls.set_fail_site(FailSite::MkMain);
        let result = self.process_inner(args, tls, res);
        tls.set_fail_site(prev_site);
        result
    }

    fn process_inner(
        &self,
        args: &MkArgs,
        tls: &mut Tls,
        res: &Resources,
    ) -> Result<LoopExit, MkError> {
        if !self.initialized.swap(true, Ordering::AcqRel) {
            global_init(args, tls, res)?;
        } else {
            res.system_rpt.lock().activate()?;
        }

        // Registrations made during `_start` on the BSP become visible to
        // this PP here.
        tls.ext_vmexit = res.ext_pool.vmexit_ext();
        tls.ext_fail = res.ext_pool.fail_ext();

        res.ext_pool.bootstrap(tls, res)?;

        // The bootstrap callback must have created the root VP and VPS and
        // issued bf_vps_op_run; anything less cannot enter a guest.
        if tls.active_vmid.is_invalid()
            || tls.active_vpid.is_invalid()
            || tls.active_vpsid.is_invalid()
        {
            diag::mklog!(
                Error,
                "pp {:#06x}: bf_vps_op_run was never executed by an extension",
                tls.ppid()
            );
            return Err(MkError::NoRunRequested);
        }
        if tls.ext_vmexit.is_invalid() {
            diag::mklog!(Error, "a vmexit handler has not been registered");
            return Err(MkError::NoVmExitHandler);
        }
        if tls.ext_fail.is_invalid() {
            diag::mklog!(Error, "a fast fail handler has not been registered");
            return Err(MkError::NoFailHandler);
        }

        vmexit_loop::run(tls, res)
    }
}

impl Default for MkMain {
    fn default() -> Self {
        MkMain::new()
    }
}

/// Once-per-boot resource bring-up, leaves first.
fn global_init(args: &MkArgs, tls: &mut Tls, res: &Resources) -> Result<(), MkError> {
    diag::mklog_always!("microvisor {}", env!("CARGO_PKG_VERSION"));
    diag::mklog_always!(
        "pp {:#06x} of {}: global init",
        args.ppid,
        args.online_pps
    );

    res.page_pool.lock().initialize(args.page_pool)?;
    res.huge_pool.lock().initialize(args.huge_pool)?;

    {
        let mut pool = res.page_pool.lock();
        let mut rpt = res.system_rpt.lock();
        rpt.initialize(&mut pool)?;
        if let Some(pml4) = args.loader_pml4 {
            rpt.add_tables_raw(&pool, pml4)?;
        }
        rpt.activate()?;
    }

    // The bare-metal heap draws one contiguous run out of the huge pool;
    // host builds use the platform allocator.
    #[cfg(target_os = "none")]
    {
        let run = res.huge_pool.lock().allocate(mm::heap::HEAP_PAGES)?;
        unsafe {
            mm::heap::init(run.virt, mm::heap::HEAP_PAGES * mkabi::layout::PAGE_SIZE);
        }
    }

    res.vps_pool.initialize();
    res.vp_pool.initialize();
    res.vm_pool.initialize();

    // The root VM exists before any extension runs.
    let root = res.vm_pool.allocate().map_err(|_| MkError::BadPpState)?;
    debug_assert_eq!(root, Id::new(mkabi::layout::ROOT_VMID));

    res.ext_pool
        .initialize(res, &args.ext_elf_files, args.online_pps as usize)?;
    res.ext_pool.signal_vm_created(root)?;
    res.ext_pool.start(tls, res)?;

    diag::mklog_always!("global init complete: {} extension(s)", res.ext_pool.loaded());
    Ok(())
}
