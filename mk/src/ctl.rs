//! The control mailbox.
//!
//! The loader drives the microkernel through a small request set: donate
//! memory, run global init, start the VMM on each PP (demote), stop it
//! (reverse demote), and read the debug ring. Unknown request codes
//! return success so an old microkernel keeps working under a newer
//! loader.
//!
//! The demote sequence per PP:
//!
//! 1. the PP must be `Stopped`;
//! 2. the processor must support HVE root mode;
//! 3. the captured OS state is cloned into this PP's TLS;
//! 4. `mk_main::process` brings resources up (first PP only), runs the
//!    extension bootstrap (which creates the root VP and VPS,
//!    `init_as_root`s the captured state, and issues the first run), and
//!    enters the VMExit loop;
//! 5. on hardware, control only comes back here when an extension
//!    promotes the root VPS; the unwinding then releases everything in
//!    reverse allocation order once the last PP stops.

use crate::mk_main::MkMain;
use crate::tls::Tls;
use crate::vmexit_loop::LoopExit;
use crate::{MkError, Resources};
use mkabi::layout::MAX_PPS;
use mkboot::req;
use mkboot::{MemoryDescriptor, MkArgs};
use spin::Mutex;

/// Per-PP execution state as the mailbox sees it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PpState {
    /// Not running the VMM.
    Stopped,
    /// Between `VMM_INIT` and promotion.
    Running,
    /// The VMM failed on this PP; only teardown remains.
    Halted,
}

/// A decoded mailbox request.
pub enum CtlRequest<'a> {
    SetMemLeafs(u64),
    SetMemNodes(u64),
    AddMd(MemoryDescriptor),
    GlobalInit,
    VmmInit(&'a MkArgs<'a>),
    VmmFini(u16),
    GetDrr(&'a mut [u8]),
    /// Forward-compat: unknown codes are acknowledged, not rejected.
    Unknown(u64),
}

/// Mailbox status: 0 success, negative failure. `GET_DRR` returns the
/// byte count instead.
pub const CTL_SUCCESS: i64 = 0;
pub const CTL_FAILURE: i64 = -1;

struct CtlState {
    mem_leafs: u64,
    mem_nodes: u64,
    md_count: usize,
    global_ready: bool,
    pp_state: [PpState; MAX_PPS],
}

/// The mailbox endpoint. One per system.
pub struct Ctl {
    mk_main: MkMain,
    state: Mutex<CtlState>,
}

impl Ctl {
    pub const fn new() -> Self {
        Ctl {
            mk_main: MkMain::new(),
            state: Mutex::new(CtlState {
                mem_leafs: 0,
                mem_nodes: 0,
                md_count: 0,
                global_ready: false,
                pp_state: [PpState::Stopped; MAX_PPS],
            }),
        }
    }

    /// The mailbox state of one PP.
    pub fn pp_state(&self, pp: usize) -> Option<PpState> {
        self.state.lock().pp_state.get(pp).copied()
    }

    /// Handle one request from the loader.
    pub fn handle_request(&self, res: &Resources, request: CtlRequest) -> i64 {
        match request {
            CtlRequest::SetMemLeafs(n) => {
                self.state.lock().mem_leafs = n;
                CTL_SUCCESS
            }
            CtlRequest::SetMemNodes(n) => {
                self.state.lock().mem_nodes = n;
                CTL_SUCCESS
            }
            CtlRequest::AddMd(md) => {
                if md.bytes == 0 || md.phys % 4096 != 0 || md.virt % 4096 != 0 {
                    return CTL_FAILURE;
                }
                self.state.lock().md_count += 1;
                CTL_SUCCESS
            }
            CtlRequest::GlobalInit => {
                self.state.lock().global_ready = true;
                CTL_SUCCESS
            }
            CtlRequest::VmmInit(args) => self.vmm_init(res, args),
            CtlRequest::VmmFini(pp) => self.vmm_fini(res, pp),
            CtlRequest::GetDrr(buf) => {
                let (copied, lost) = diag::debug_ring::drain(buf);
                if lost != 0 {
                    diag::mklog!(Warn, "debug ring: {} bytes lost before read", lost);
                }
                copied as i64
            }
            CtlRequest::Unknown(code) => {
                diag::mklog!(Debug, "ctl: unknown request {:#x} acknowledged", code);
                CTL_SUCCESS
            }
        }
    }

    /// Decode a raw `(code, arg)` pair the way the loader IOCTL path
    /// delivers them.
    pub fn decode(code: u64, arg: u64) -> CtlRequest<'static> {
        match code {
            req::SET_MEM_LEAFS => CtlRequest::SetMemLeafs(arg),
            req::SET_MEM_NODES => CtlRequest::SetMemNodes(arg),
            req::GLOBAL_INIT => CtlRequest::GlobalInit,
            req::VMM_FINI => CtlRequest::VmmFini(arg as u16),
            // ADD_MD / VMM_INIT / GET_DRR carry typed payloads and arrive
            // through the typed constructors instead.
            other => CtlRequest::Unknown(other),
        }
    }

    fn vmm_init(&self, res: &Resources, args: &MkArgs) -> i64 {
        let pp = args.ppid as usize;
        if pp >= MAX_PPS {
            return CTL_FAILURE;
        }
        {
            let mut state = self.state.lock();
            if !state.global_ready {
                diag::mklog!(Error, "vmm_init before global_init");
                return CTL_FAILURE;
            }
            if state.pp_state[pp] != PpState::Stopped {
                diag::mklog!(Error, "vmm_init: pp {:#06x} is not stopped", pp);
                return CTL_FAILURE;
            }
            state.pp_state[pp] = PpState::Running;
        }

        if intrinsics::hve::check_support().is_err() {
            diag::mklog!(Error, "vmm_init: pp {:#06x} lacks HVE support", pp);
            self.state.lock().pp_state[pp] = PpState::Stopped;
            return CTL_FAILURE;
        }

        let outcome: Option<Result<LoopExit, MkError>> = res.tls_pool.with(pp, |tls| {
            *tls = Tls::new(args.ppid);
            tls.mk_state = *args.mk_state;
            tls.root_vp_state = *args.root_vp_state;
            // The TLS block must be reachable from entry stubs with no
            // other context.
            intrinsics::regs::set_tp(tls as *mut Tls as u64);
            self.mk_main.process(args, tls, res)
        });

        match outcome {
            Some(Ok(LoopExit::Promoted)) => {
                // The demoted OS owns the PP again.
                self.state.lock().pp_state[pp] = PpState::Stopped;
                CTL_SUCCESS
            }
            Some(Err(e)) => {
                diag::mklog!(Error, "vmm_init: pp {:#06x} failed: {:?}", pp, e);
                self.state.lock().pp_state[pp] = PpState::Halted;
                CTL_FAILURE
            }
            None => CTL_FAILURE,
        }
    }

    fn vmm_fini(&self, res: &Resources, pp: u16) -> i64 {
        let pp = pp as usize;
        if pp >= MAX_PPS {
            return CTL_FAILURE;
        }
        {
            let mut state = self.state.lock();
            match state.pp_state[pp] {
                // The loop is on-CPU; it can only be left from inside.
                PpState::Running => return CTL_FAILURE,
                PpState::Stopped | PpState::Halted => state.pp_state[pp] = PpState::Stopped,
            }
            if !state
                .pp_state
                .iter()
                .all(|&s| s == PpState::Stopped)
            {
                return CTL_SUCCESS;
            }
        }
        // Last PP down: unwind everything in reverse allocation order.
        if self.mk_main.is_initialized() {
            if self.teardown(res).is_err() {
                return CTL_FAILURE;
            }
            self.mk_main.reset();
        }
        CTL_SUCCESS
    }

    /// Release global resources in reverse of `mk_main::global_init`.
    fn teardown(&self, res: &Resources) -> Result<(), MkError> {
        res.ext_pool.release(res)?;
        res.vps_pool.release_all(res.huge_pool)?;
        res.vp_pool.release();
        res.vm_pool.release();
        {
            let mut pool = res.page_pool.lock();
            let mut huge = res.huge_pool.lock();
            res.system_rpt.lock().release(&mut pool, &mut huge)?;
        }
        res.huge_pool.lock().release()?;
        res.page_pool.lock().release()?;
        diag::mklog_always!("teardown complete");
        Ok(())
    }
}

impl Default for Ctl {
    fn default() -> Self {
        Ctl::new()
    }
}

impl From<crate::ObjError> for MkError {
    fn from(e: crate::ObjError) -> Self {
        match e {
            crate::ObjError::Pool(p) => MkError::Pool(p),
            crate::ObjError::Hve(h) => MkError::Hve(h),
            _ => MkError::BadPpState,
        }
    }
}
