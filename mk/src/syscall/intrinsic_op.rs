//! `bf_intrinsic_op_*`: guarded architectural primitives.
//!
//! MSR access is allowlisted. Extensions steer guests through VPS fields;
//! the raw MSR surface exists for the handful of registers the hardware
//! shares between host and guest context, and nothing else.

use crate::syscall::check_handle;
use crate::tls::Tls;
use crate::Resources;
use intrinsics::msr;
use mkabi::syscall::intrinsic_op;
use mkabi::SysStatus;

/// MSRs extensions may read.
const READ_ALLOWED: &[u32] = &[
    msr::IA32_EFER,
    msr::IA32_STAR,
    msr::IA32_LSTAR,
    msr::IA32_FMASK,
    msr::IA32_FS_BASE,
    msr::IA32_GS_BASE,
    msr::IA32_KERNEL_GS_BASE,
    msr::IA32_PAT,
    msr::IA32_VMX_BASIC,
    msr::IA32_FEATURE_CONTROL,
];

/// MSRs extensions may write.
const WRITE_ALLOWED: &[u32] = &[
    msr::IA32_PAT,
    msr::IA32_FS_BASE,
    msr::IA32_GS_BASE,
    msr::IA32_KERNEL_GS_BASE,
];

pub fn dispatch(tls: &mut Tls, res: &Resources, index: u16) -> SysStatus {
    if let Err(status) = check_handle(tls, res) {
        return status;
    }
    match index {
        intrinsic_op::RDMSR => rdmsr(tls),
        intrinsic_op::WRMSR => wrmsr(tls),
        intrinsic_op::FLUSH_TLB => {
            intrinsics::regs::flush_tlb_all();
            SysStatus::SUCCESS
        }
        _ => SysStatus::FAILURE_UNSUPPORTED,
    }
}

fn rdmsr(tls: &mut Tls) -> SysStatus {
    let target = tls.ext_reg1 as u32;
    if !READ_ALLOWED.contains(&target) {
        return SysStatus::PERM_DENIED;
    }
    tls.ext_reg0 = msr::rdmsr(target);
    SysStatus::SUCCESS
}

fn wrmsr(tls: &mut Tls) -> SysStatus {
    let target = tls.ext_reg1 as u32;
    if !WRITE_ALLOWED.contains(&target) {
        return SysStatus::PERM_DENIED;
    }
    // Safety: the allowlist limits this to context-swap registers.
    unsafe { msr::wrmsr(target, tls.ext_reg2) };
    SysStatus::SUCCESS
}
