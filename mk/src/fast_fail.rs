//! The fast-fail path.
//!
//! Some conditions leave a PP with no safe way to continue the work in
//! flight: a tag mismatch in a pool, a VMLAUNCH the hardware rejects, an
//! exception inside an extension with no handler. Unwinding ordinary
//! frames could leak half-mutated microkernel state into a guest, so each
//! critical site records a landing pad in TLS instead, and `fail` delivers
//! control there with a non-zero status: a longjmp in spirit, scoped to
//! exactly four sites.
//!
//! Before landing, the extension registered for fail events gets one call
//! to clean up. A failure inside *that* halts the PP; there is no second
//! safety net.

use crate::tls::{FailSite, Tls};
use crate::Resources;

/// Why a PP fast-failed. Carried to the extension's fail callback as a
/// status word.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailReason {
    /// A VMExit was delivered and nothing ran or promoted afterwards.
    UnhandledVmExit,
    /// The hardware rejected a VM entry; carries the instruction error.
    EntryFailed(u64),
    /// An exception reached the ESR with no recovery route.
    Exception(u64),
    /// A pool reported a tag mismatch or double free.
    InvariantViolation,
    /// The extension callback itself reported failure.
    ExtensionFault,
}

impl FailReason {
    /// The status word handed to the fail callback.
    pub fn status(self) -> u64 {
        match self {
            FailReason::UnhandledVmExit => 0x1,
            FailReason::EntryFailed(err) => 0x2 | (err << 8),
            FailReason::Exception(vector) => 0x3 | (vector << 8),
            FailReason::InvariantViolation => 0x4,
            FailReason::ExtensionFault => 0x5,
        }
    }
}

/// Trip the fast-fail path on this PP. Returns the site whose landing pad
/// the trampoline must resume at; on bare metal the caller then jumps, on
/// host builds the call stack simply unwinds with an error.
pub fn fail(tls: &mut Tls, res: &Resources, reason: FailReason) -> FailSite {
    let site = tls.fail_site();
    diag::mklog!(
        Error,
        "fast fail on pp {:#06x}: {:?} at {:?}",
        tls.ppid(),
        reason,
        site
    );

    if tls.ext_fail.is_valid() {
        // Best effort only. A fail handler that fails gets no retry.
        if res.ext_pool.fail(tls, res, reason.status()).is_err() {
            diag::mklog!(Error, "fail handler itself failed; halting pp");
            #[cfg(target_os = "none")]
            intrinsics::regs::halt();
        }
    }
    site
}

/// Jump to the current landing pad. Bare metal only; the host model
/// propagates errors by return value instead.
///
/// # Safety
///
/// The TLS landing pad must have been armed by the site being resumed.
#[cfg(target_os = "none")]
pub unsafe fn resume_at_pad(tls: &Tls) -> ! {
    core::arch::asm!(
        "mov rsp, {sp}",
        "mov rax, 1",
        "jmp {ip}",
        sp = in(reg) tls.current_fast_fail_sp,
        ip = in(reg) tls.current_fast_fail_ip,
        options(noreturn),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::syscall::testutil::fixture;
    use crate::tls::FailSite;

    #[test]
    fn fail_reports_the_armed_site() {
        let f = fixture();
        let res = f.resources();
        let mut tls = f.ext_tls(0);
        tls.set_fail_site(FailSite::VmExitLoop);
        let site = fail(&mut tls, &res, FailReason::UnhandledVmExit);
        assert_eq!(site, FailSite::VmExitLoop);
    }

    #[test]
    fn reasons_encode_distinct_statuses() {
        assert_ne!(
            FailReason::UnhandledVmExit.status(),
            FailReason::InvariantViolation.status()
        );
        assert_eq!(FailReason::EntryFailed(7).status() >> 8, 7);
        assert_eq!(FailReason::Exception(14).status() >> 8, 14);
    }
}
