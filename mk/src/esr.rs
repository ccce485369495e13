//! Exception-service-routine dispatch.
//!
//! The bare-metal IDT stubs snapshot the faulting context into the TLS ESR
//! area and call [`dispatch_esr`]. Policy is small and strict:
//!
//! - NMIs are never handled inline. They set the pending flag and are
//!   delivered through the VMExit loop at the next entry boundary; the
//!   `nmi_lock` exists because a handful of instruction windows (the entry
//!   trampoline itself) cannot tolerate even that bookkeeping.
//! - A fault at the address armed in `unsafe_rip` was planned: control
//!   resumes there and the slot disarms.
//! - Everything else is fatal for this PP and routes to fast-fail. A
//!   microkernel that page-faults has no less-drastic recovery that does
//!   not risk leaking state into a guest.

use crate::fast_fail::{self, FailReason};
use crate::tls::Tls;
use crate::Resources;

pub const VECTOR_NMI: u64 = 2;
pub const VECTOR_GP: u64 = 13;
pub const VECTOR_PAGE_FAULT: u64 = 14;

/// What the entry stub should do after dispatch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EsrDisposition {
    /// Return from the exception; the snapshot's `rip` is the resume
    /// point (possibly redirected by `unsafe_rip`).
    Resume,
    /// Jump to the fast-fail landing pad.
    FastFail,
}

/// Handle one exception on this PP.
pub fn dispatch_esr(
    tls: &mut Tls,
    res: &Resources,
    vector: u64,
    error_code: u64,
) -> EsrDisposition {
    tls.esr.vector = vector;
    tls.esr.error_code = error_code;

    match vector {
        VECTOR_NMI => {
            tls.nmi_pending = 1;
            EsrDisposition::Resume
        }
        _ => {
            if tls.unsafe_rip != 0 {
                // The fault was planned; resume at the recovery address.
                tls.esr.rip = tls.unsafe_rip;
                tls.unsafe_rip = 0;
                return EsrDisposition::Resume;
            }
            diag::mklog!(
                Error,
                "esr: vector {} error {:#x} rip {:#018x} cr2 {:#018x}",
                vector,
                error_code,
                tls.esr.rip,
                tls.esr.cr2
            );
            fast_fail::fail(tls, res, FailReason::Exception(vector));
            EsrDisposition::FastFail
        }
    }
}
