//! The per-PP VMExit loop.
//!
//! After bootstrap, a PP lives here forever: enter the queued VPS, take
//! the exit, log it, hand it to the registered extension, and expect the
//! extension to conclude with `bf_vps_op_run*` (queuing the next entry) or
//! `bf_vps_op_promote` (handing the PP back to the demoted OS). A handler
//! that does neither has dropped the guest on the floor, which is the
//! "unhandled vm exit" condition, fatal for this PP.
//!
//! NMIs that arrived under the lock are delivered at the top of the loop
//! as a synthetic exception exit, before any further guest entry.

use crate::fast_fail::{self, FailReason};
use crate::tls::Tls;
use crate::tls::FailSite;
use crate::{MkError, Resources};
use intrinsics::hve::exit_reason;
use intrinsics::ExitInfo;

/// Why the loop returned (bare metal: only ever `Promoted`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoopExit {
    /// The extension promoted the root VPS; the demoted OS resumes.
    Promoted,
}

/// Run the loop until promotion or a fatal condition.
pub fn run(tls: &mut Tls, res: &Resources) -> Result<LoopExit, MkError> {
    let prev_site = tls.set_fail_site(FailSite::VmExitLoop);
    let result = run_inner(tls, res);
    tls.set_fail_site(prev_site);
    result
}

fn run_inner(tls: &mut Tls, res: &Resources) -> Result<LoopExit, MkError> {
    loop {
        let Some(vpsid) = tls.take_run_request() else {
            fast_fail::fail(tls, res, FailReason::UnhandledVmExit);
            diag::mklog!(Error, "unhandled vm exit on pp {:#06x}", tls.ppid());
            return Err(MkError::UnhandledVmExit);
        };

        // A pending NMI outranks the guest: deliver it to the extension as
        // an exception exit and re-queue the entry it displaced.
        let exit = if tls.nmi_pending != 0 {
            tls.nmi_pending = 0;
            tls.request_run(vpsid);
            ExitInfo {
                reason: exit_reason::EXCEPTION_OR_NMI,
                qualification: 0,
                // vector 2, NMI type, valid.
                interruption_info: 2 | (2 << 8) | (1 << 31),
                instruction_length: 0,
            }
        } else {
            match res.vps_pool.run(tls, vpsid) {
                Ok(exit) => exit,
                Err(crate::ObjError::Hve(intrinsics::HveError::EntryFailed(err))) => {
                    res.vps_pool.dump(vpsid);
                    fast_fail::fail(tls, res, FailReason::EntryFailed(err));
                    return Err(MkError::Hve(intrinsics::HveError::EntryFailed(err)));
                }
                Err(e) => {
                    fast_fail::fail(tls, res, FailReason::InvariantViolation);
                    return Err(match e {
                        crate::ObjError::Pool(p) => MkError::Pool(p),
                        _ => MkError::UnhandledVmExit,
                    });
                }
            }
        };

        if res.ext_pool.vmexit(tls, res, vpsid, exit.reason).is_err() {
            fast_fail::fail(tls, res, FailReason::ExtensionFault);
            return Err(MkError::Ext(crate::ext::ExtError::CallbackFailed));
        }

        if tls.take_promote_request() {
            diag::mklog!(
                Info,
                "pp {:#06x}: promote requested, leaving the loop",
                tls.ppid()
            );
            return Ok(LoopExit::Promoted);
        }
        // No promote: the handler must have queued the next entry, which
        // the top of the loop checks.
    }
}
