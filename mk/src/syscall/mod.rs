//! Syscall dispatch.
//!
//! Every syscall arrives with the opcode in `tls.ext_syscall` and its
//! arguments in `tls.ext_reg0..5` (the entry stub fills these from the
//! architectural registers). Dispatch validates the opcode signature,
//! routes by category, and writes the resulting status both to the TLS
//! return slot and back to the caller.
//!
//! The permission ladder, in order:
//!
//! 1. opcode signature (anything else is `FAILURE_UNSUPPORTED`);
//! 2. handle validation against the caller's granted handle (all
//!    categories except `handle_op_open_handle` and the debug ops);
//! 3. category-specific checks. VM/VP/VPS mutation additionally requires
//!    the caller to have registered a VMExit handler, because an extension
//!    that cannot observe exits has no business steering guests.

pub mod callback_op;
pub mod debug_op;
pub mod handle_op;
pub mod intrinsic_op;
pub mod mem_op;
pub mod vm_op;
pub mod vp_op;
pub mod vps_op;

use crate::tls::{FailSite, Tls};
use crate::{ObjError, Resources};
use mkabi::syscall::{category, category_of, index_of, sig_valid};
use mkabi::SysStatus;

/// Dispatch the syscall staged in `tls`.
pub fn dispatch(tls: &mut Tls, res: &Resources) -> SysStatus {
    let prev_site = tls.set_fail_site(FailSite::DispatchSyscall);
    let status = route(tls, res);
    tls.syscall_ret_status = status.get();
    tls.set_fail_site(prev_site);
    if !status.is_success() {
        diag::mklog!(
            Warn,
            "syscall {:#018x} -> {:?} (ext {:#06x})",
            tls.ext_syscall,
            status,
            tls.ext
        );
    }
    status
}

/// Stage a syscall and dispatch it. This is the path host extension
/// callbacks (and tests) use in place of the hardware `syscall` entry.
pub fn invoke(tls: &mut Tls, res: &Resources, opcode: u64, regs: [u64; 6]) -> SysStatus {
    tls.ext_syscall = opcode;
    tls.ext_reg0 = regs[0];
    tls.ext_reg1 = regs[1];
    tls.ext_reg2 = regs[2];
    tls.ext_reg3 = regs[3];
    tls.ext_reg4 = regs[4];
    tls.ext_reg5 = regs[5];
    dispatch(tls, res)
}

fn route(tls: &mut Tls, res: &Resources) -> SysStatus {
    let op = tls.ext_syscall;
    if !sig_valid(op) {
        return SysStatus::FAILURE_UNSUPPORTED;
    }
    let index = index_of(op);
    match category_of(op) {
        category::HANDLE => handle_op::dispatch(tls, res, index),
        category::DEBUG => debug_op::dispatch(tls, res, index),
        category::MEM => mem_op::dispatch(tls, res, index),
        category::VM => vm_op::dispatch(tls, res, index),
        category::VP => vp_op::dispatch(tls, res, index),
        category::VPS => vps_op::dispatch(tls, res, index),
        category::INTRINSIC => intrinsic_op::dispatch(tls, res, index),
        category::CALLBACK => callback_op::dispatch(tls, res, index),
        _ => SysStatus::FAILURE_UNSUPPORTED,
    }
}

/// Validate the caller's handle (REG0).
fn check_handle(tls: &Tls, res: &Resources) -> Result<(), SysStatus> {
    let valid = res
        .ext_pool
        .with_ext(tls.ext, |e| e.is_handle_valid(tls.ext_reg0))
        .unwrap_or(false);
    if valid {
        Ok(())
    } else {
        Err(SysStatus::FAILURE_INVALID_HANDLE)
    }
}

/// Validate that the caller may steer guests (VM/VP/VPS categories).
fn check_vmexit_registered(tls: &Tls, res: &Resources) -> Result<(), SysStatus> {
    let registered = res
        .ext_pool
        .with_ext(tls.ext, |e| e.vmexit_ip != 0)
        .unwrap_or(false);
    if registered {
        Ok(())
    } else {
        Err(SysStatus::PERM_EXT)
    }
}

/// Map an object-pool failure onto the status a caller sees.
fn obj_status(e: ObjError) -> SysStatus {
    match e {
        ObjError::InvalidId => SysStatus::INVALID_PARAMS1,
        ObjError::PoolFull => SysStatus::FAILURE_OUT_OF_MEMORY,
        ObjError::Pool(mm::PoolError::OutOfMemory) => SysStatus::FAILURE_OUT_OF_MEMORY,
        _ => SysStatus::FAILURE_UNKNOWN,
    }
}

/// Shared fixture for the per-category syscall tests: every pool backed by
/// heap memory, one extension loaded from a synthesized minimal ELF.
#[cfg(test)]
pub(crate) mod testutil {
    use crate::ext_pool::ExtPool;
    use crate::tls::{Tls, TlsPool};
    use crate::vm::VmPool;
    use crate::vp::VpPool;
    use crate::vps::VpsPool;
    use crate::Resources;
    use alloc::boxed::Box;
    use alloc::vec;
    use alloc::vec::Vec;
    use mkabi::layout::{EXT_ELF_ADDR, MAX_EXTS};
    use mkabi::syscall::{callback_op, category, handle_op, opcode};
    use mkabi::{Id, SysStatus};
    use mkboot::PoolSpan;
    use mm::{HugePool, PagePool, RootPageTable};
    use spin::Mutex;

    fn put16(buf: &mut [u8], at: usize, v: u16) {
        buf[at..at + 2].copy_from_slice(&v.to_le_bytes());
    }
    fn put32(buf: &mut [u8], at: usize, v: u32) {
        buf[at..at + 4].copy_from_slice(&v.to_le_bytes());
    }
    fn put64(buf: &mut [u8], at: usize, v: u64) {
        buf[at..at + 8].copy_from_slice(&v.to_le_bytes());
    }

    /// A minimal ET_EXEC image: one R+X PT_LOAD at `EXT_ELF_ADDR`.
    pub fn tiny_elf() -> Vec<u8> {
        let mut f = vec![0u8; 0x200];
        f[0..4].copy_from_slice(&[0x7F, b'E', b'L', b'F']);
        f[4] = 2; // ELFCLASS64
        f[5] = 1; // little endian
        f[6] = 1; // EV_CURRENT
        put16(&mut f, 0x10, 2); // ET_EXEC
        put16(&mut f, 0x12, 0x3E); // EM_X86_64
        put32(&mut f, 0x14, 1);
        put64(&mut f, 0x18, EXT_ELF_ADDR); // entry
        put64(&mut f, 0x20, 0x40); // phoff
        put16(&mut f, 0x34, 64); // ehsize
        put16(&mut f, 0x36, 56); // phentsize
        put16(&mut f, 0x38, 1); // phnum
        let ph = 0x40;
        put32(&mut f, ph, 1); // PT_LOAD
        put32(&mut f, ph + 4, 0x5); // R + X
        put64(&mut f, ph + 8, 0); // offset
        put64(&mut f, ph + 16, EXT_ELF_ADDR); // vaddr
        put64(&mut f, ph + 24, EXT_ELF_ADDR); // paddr
        put64(&mut f, ph + 32, 0x200); // filesz
        put64(&mut f, ph + 40, 0x1000); // memsz
        put64(&mut f, ph + 48, 0x1000); // align
        f
    }

    pub struct Fixture {
        _page_backing: Box<[u8]>,
        _huge_backing: Box<[u8]>,
        pub page_pool: Mutex<PagePool>,
        pub huge_pool: Mutex<HugePool>,
        pub system_rpt: Mutex<RootPageTable>,
        pub vm_pool: VmPool,
        pub vp_pool: VpPool,
        pub vps_pool: VpsPool,
        pub ext_pool: ExtPool,
        pub tls_pool: TlsPool,
    }

    impl Fixture {
        pub fn resources(&self) -> Resources<'_> {
            Resources {
                page_pool: &self.page_pool,
                huge_pool: &self.huge_pool,
                system_rpt: &self.system_rpt,
                vm_pool: &self.vm_pool,
                vp_pool: &self.vp_pool,
                vps_pool: &self.vps_pool,
                ext_pool: &self.ext_pool,
                tls_pool: &self.tls_pool,
            }
        }

        /// A TLS for `pp` with extension 0 current.
        pub fn ext_tls(&self, pp: u16) -> Tls {
            let mut tls = Tls::new(pp);
            tls.ext = Id::new(0);
            tls.thread_id.set_extid(Id::new(0));
            tls
        }
    }

    fn aligned_backing(pages: usize) -> (Box<[u8]>, u64) {
        let backing = vec![0u8; (pages + 1) * 4096].into_boxed_slice();
        let virt = (backing.as_ptr() as u64 + 4095) & !4095;
        (backing, virt)
    }

    /// Build every pool, load one extension, allocate the root VM.
    pub fn fixture() -> Fixture {
        let (page_backing, page_virt) = aligned_backing(512);
        let (huge_backing, huge_virt) = aligned_backing(32);

        let mut page_pool = PagePool::new();
        page_pool
            .initialize(PoolSpan {
                virt: page_virt,
                phys: 0x1000_0000,
                size: 512 * 4096,
            })
            .unwrap();
        let mut huge_pool = HugePool::new();
        huge_pool
            .initialize(PoolSpan {
                virt: huge_virt,
                phys: 0x2000_0000,
                size: 32 * 4096,
            })
            .unwrap();
        let mut system_rpt = RootPageTable::new();
        system_rpt.initialize(&mut page_pool).unwrap();

        let f = Fixture {
            _page_backing: page_backing,
            _huge_backing: huge_backing,
            page_pool: Mutex::new(page_pool),
            huge_pool: Mutex::new(huge_pool),
            system_rpt: Mutex::new(system_rpt),
            vm_pool: VmPool::new(),
            vp_pool: VpPool::new(),
            vps_pool: VpsPool::new(),
            ext_pool: ExtPool::new(),
            tls_pool: TlsPool::new(),
        };
        f.vm_pool.initialize();
        f.vp_pool.initialize();
        f.vps_pool.initialize();

        let elf = tiny_elf();
        let mut images: [Option<&[u8]>; MAX_EXTS] = [None; MAX_EXTS];
        images[0] = Some(&elf);
        f.ext_pool.initialize(&f.resources(), &images, 3).unwrap();

        // Root VM.
        assert_eq!(f.vm_pool.allocate().unwrap().get(), 0);
        f.ext_pool.signal_vm_created(Id::new(0)).unwrap();
        f
    }

    /// Dispatch with no arguments.
    pub fn invoke(tls: &mut Tls, res: &Resources, op: u64) -> SysStatus {
        crate::syscall::invoke(tls, res, op, [0; 6])
    }

    /// Dispatch with explicit REG0..REG5.
    pub fn invoke_regs(tls: &mut Tls, res: &Resources, op: u64, regs: [u64; 6]) -> SysStatus {
        crate::syscall::invoke(tls, res, op, regs)
    }

    /// Open extension 0's handle and return it.
    pub fn open_handle(tls: &mut Tls, res: &Resources) -> u64 {
        let st = invoke(tls, res, opcode(category::HANDLE, handle_op::OPEN_HANDLE));
        assert!(st.is_success());
        tls.ext_reg0
    }

    /// Register a VMExit handler so the VM/VP/VPS categories open up.
    pub fn register_vmexit(tls: &mut Tls, res: &Resources, handle: u64) {
        let st = invoke_regs(
            tls,
            res,
            opcode(category::CALLBACK, callback_op::REGISTER_VMEXIT),
            [handle, 0x1000, 0, 0, 0, 0],
        );
        assert!(st.is_success());
    }
}
