//! Control-register, TLB, and thread-pointer primitives.

/// The current hardware translation root (CR3, page-aligned bits).
pub fn current_root() -> u64 {
    #[cfg(target_os = "none")]
    {
        use x86_64::registers::control::Cr3;
        let (frame, _) = Cr3::read();
        frame.start_address().as_u64()
    }
    #[cfg(not(target_os = "none"))]
    {
        crate::soft::state().lock().root
    }
}

/// Install a new translation root. The address must be 4 KiB aligned and
/// point at a valid top-level table.
///
/// # Safety
///
/// Switching the root invalidates every virtual address not mapped in the
/// new tree, including the caller's own stack and code if the new tree does
/// not cover them.
pub unsafe fn set_root(phys: u64) {
    #[cfg(target_os = "none")]
    {
        use x86_64::registers::control::{Cr3, Cr3Flags};
        use x86_64::structures::paging::PhysFrame;
        use x86_64::PhysAddr;
        Cr3::write(
            PhysFrame::containing_address(PhysAddr::new(phys)),
            Cr3Flags::empty(),
        );
    }
    #[cfg(not(target_os = "none"))]
    {
        crate::soft::state().lock().root = phys;
    }
}

/// Invalidate the TLB entry covering `virt`.
pub fn invlpg(virt: u64) {
    #[cfg(target_os = "none")]
    {
        use x86_64::instructions::tlb;
        use x86_64::VirtAddr;
        tlb::flush(VirtAddr::new(virt));
    }
    #[cfg(not(target_os = "none"))]
    {
        crate::soft::state().lock().tlb_flushes += 1;
        let _ = virt;
    }
}

/// Invalidate the whole TLB (CR3 rewrite).
pub fn flush_tlb_all() {
    #[cfg(target_os = "none")]
    {
        use x86_64::instructions::tlb;
        tlb::flush_all();
    }
    #[cfg(not(target_os = "none"))]
    {
        crate::soft::state().lock().tlb_flushes += 1;
    }
}

/// Point the per-PP thread register at a TLS block so entry code can reach
/// it without any other context.
pub fn set_tp(addr: u64) {
    #[cfg(target_os = "none")]
    // Safety: repointing GS base is exactly this function's contract.
    unsafe {
        crate::msr::wrmsr(crate::msr::IA32_GS_BASE, addr);
    }
    #[cfg(not(target_os = "none"))]
    {
        crate::soft::state().lock().tp = addr;
    }
}

/// The current per-PP thread register value.
pub fn tp() -> u64 {
    #[cfg(target_os = "none")]
    {
        crate::msr::rdmsr(crate::msr::IA32_GS_BASE)
    }
    #[cfg(not(target_os = "none"))]
    {
        crate::soft::state().lock().tp
    }
}

/// Halt this PP. On hardware this never returns.
pub fn halt() -> ! {
    #[cfg(target_os = "none")]
    loop {
        x86_64::instructions::hlt();
    }
    #[cfg(not(target_os = "none"))]
    panic!("pp halted");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_round_trips_through_the_soft_model() {
        unsafe { set_root(0x1234_5000) };
        assert_eq!(current_root(), 0x1234_5000);
    }

    #[test]
    fn tp_round_trips() {
        set_tp(0xFFFF_9000_0000_0000);
        assert_eq!(tp(), 0xFFFF_9000_0000_0000);
    }
}
