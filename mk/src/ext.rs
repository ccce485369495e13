//! One loaded extension.
//!
//! An extension is ring-0 policy code the microkernel keeps at arm's
//! length: it gets its own RPT (the microkernel half aliased in so syscalls
//! can execute without a root switch), its own per-PP stacks and TLS
//! blocks, a bump heap, and a direct map of the pages it allocates. All of
//! it is torn down by the RPT's auto-release walk; the extension never
//! owns a frame its page tables don't describe.
//!
//! ELF handling accepts static executables and static-PIE images
//! (`ET_EXEC` / `ET_DYN`), validates the header the hard way, refuses
//! writable-executable segments and executable stacks, and applies
//! `R_X86_64_RELATIVE` relocations only.

use crate::Resources;
use mkabi::layout::{
    page_align_up, EXT_DIRECT_MAP_ADDR, EXT_ELF_ADDR, EXT_HEAP_ADDR, EXT_HEAP_MAX,
    EXT_SPACE_MAX, EXT_STACK_ADDR, EXT_STACK_SIZE, EXT_TLS_ADDR, MAX_VMS, PAGE_SIZE,
};
use mkabi::Id;
use mm::{AutoRelease, MapError, MapFlags, PoolError, PoolTag, RootPageTable};
use xmas_elf::header::{Class, Data, Machine, Type as ElfType};
use xmas_elf::program::Type as PhType;
use xmas_elf::sections::SectionData;
use xmas_elf::ElfFile;

/// Extension failures.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExtError {
    /// The image is not an ELF we accept.
    InvalidMagic,
    UnsupportedClass,
    NotLittleEndian,
    UnsupportedMachine,
    UnsupportedType,
    /// A PT_LOAD segment is both writable and executable.
    WritableExecutableSegment,
    /// PT_GNU_STACK demands an executable stack.
    ExecutableStack,
    /// A segment lands outside the extension's address budget.
    SegmentOutOfRange,
    /// Segment file data runs past the image.
    OutOfBounds,
    /// A relocation we do not support.
    UnsupportedRelocation,
    /// The id names no loaded extension.
    NoSuchExt,
    /// `open_handle` on an extension that already holds one.
    HandleAlreadyOpen,
    /// The heap budget is exhausted.
    HeapExhausted,
    /// `signal_vm_destroyed` for a VM never signaled created.
    NotSignaled,
    /// The callback reported failure.
    CallbackFailed,
    /// The underlying pool failed.
    Pool(PoolError),
    /// The extension RPT failed.
    Map(MapError),
}

impl From<PoolError> for ExtError {
    fn from(e: PoolError) -> Self {
        ExtError::Pool(e)
    }
}

impl From<MapError> for ExtError {
    fn from(e: MapError) -> Self {
        ExtError::Map(e)
    }
}

/// A page handed to the extension: its view and the physical address.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExtPage {
    pub virt: u64,
    pub phys: u64,
}

/// One extension slot.
pub struct Ext {
    id: Id,
    loaded: bool,
    /// The dedicated RPT (microkernel half aliased in).
    rpt: RootPageTable,
    /// ELF entry point, post-relocation.
    pub entry_ip: u64,
    /// Registered callback entry points; 0 = unset.
    pub bootstrap_ip: u64,
    pub vmexit_ip: u64,
    pub fail_ip: u64,
    /// The granted handle; 0 = closed.
    handle: u64,
    /// Next heap offset past `EXT_HEAP_ADDR`.
    heap_cursor: u64,
    /// Which VMs this extension has been told about.
    vms_signaled: [bool; MAX_VMS],
    /// The extension's `_start` has run to its wait point.
    pub started: bool,
}

impl Ext {
    pub(crate) fn new(id: Id) -> Self {
        Ext {
            id,
            loaded: false,
            rpt: RootPageTable::new(),
            entry_ip: 0,
            bootstrap_ip: 0,
            vmexit_ip: 0,
            fail_ip: 0,
            handle: 0,
            heap_cursor: 0,
            vms_signaled: [false; MAX_VMS],
            started: false,
        }
    }

    #[inline]
    pub fn id(&self) -> Id {
        self.id
    }

    #[inline]
    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    /// Physical root of the extension RPT, for the call trampoline.
    #[inline]
    pub fn rpt_phys(&self) -> u64 {
        self.rpt.phys()
    }

    /// Validate, map, and relocate `image`; build stacks and TLS for
    /// `online_pps` processors.
    pub(crate) fn load(
        &mut self,
        res: &Resources,
        image: &[u8],
        online_pps: usize,
    ) -> Result<(), ExtError> {
        let elf = ElfFile::new(image).map_err(|_| ExtError::InvalidMagic)?;
        validate_header(&elf)?;
        let base = match elf.header.pt2.type_().as_type() {
            ElfType::SharedObject => EXT_ELF_ADDR,
            _ => 0,
        };

        {
            let mut pool = res.page_pool.lock();
            self.rpt.initialize(&mut pool)?;
            let system = res.system_rpt.lock();
            self.rpt.add_tables(&pool, &system)?;
        }

        self.map_segments(res, &elf, base)?;
        if base != 0 {
            self.relocate(res, &elf, base)?;
        }
        self.entry_ip = base + elf.header.pt2.entry_point();

        self.build_stacks(res, online_pps)?;
        self.build_tls_blocks(res, online_pps)?;

        self.loaded = true;
        diag::mklog!(
            Info,
            "ext [{:#06x}]: loaded, entry {:#x}, {} pps",
            self.id,
            self.entry_ip,
            online_pps
        );
        Ok(())
    }

    fn map_segments(
        &mut self,
        res: &Resources,
        elf: &ElfFile,
        base: u64,
    ) -> Result<(), ExtError> {
        const PT_GNU_STACK: u32 = 0x6474_E551;
        for ph in elf.program_iter() {
            match ph.get_type() {
                Ok(PhType::OsSpecific(kind)) if kind == PT_GNU_STACK => {
                    if ph.flags().is_execute() {
                        return Err(ExtError::ExecutableStack);
                    }
                    continue;
                }
                Ok(PhType::Load) => {}
                _ => continue,
            }

            let memsz = ph.mem_size() as usize;
            let filesz = ph.file_size() as usize;
            if memsz == 0 {
                continue;
            }
            // In a well-formed ELF the bytes past filesz are BSS.
            if filesz > memsz {
                return Err(ExtError::OutOfBounds);
            }
            if ph.flags().is_write() && ph.flags().is_execute() {
                return Err(ExtError::WritableExecutableSegment);
            }

            let vaddr = base + ph.virtual_addr();
            let end = vaddr.checked_add(memsz as u64).ok_or(ExtError::SegmentOutOfRange)?;
            if vaddr < EXT_ELF_ADDR || end > EXT_STACK_ADDR {
                return Err(ExtError::SegmentOutOfRange);
            }
            let offset = ph.offset() as usize;
            if offset.saturating_add(filesz) > elf.input.len() {
                return Err(ExtError::OutOfBounds);
            }

            let page_base = vaddr & !(PAGE_SIZE as u64 - 1);
            let page_offset = (vaddr - page_base) as usize;
            let page_count = (page_offset + memsz + PAGE_SIZE - 1) / PAGE_SIZE;

            let mut pool = res.page_pool.lock();
            let file_end = vaddr + filesz as u64;
            for i in 0..page_count {
                let page_va = page_base + (i * PAGE_SIZE) as u64;
                let page = if ph.flags().is_execute() {
                    self.rpt
                        .allocate_page_rx(&mut pool, page_va, AutoRelease::Elf)?
                } else {
                    self.rpt
                        .allocate_page_rw(&mut pool, page_va, AutoRelease::Elf)?
                };
                // Frames arrive zeroed, so BSS needs no extra pass. Copy
                // this page's overlap with the file data through the pool
                // view (the mapped view may be read-only).
                let copy_start = core::cmp::max(page_va, vaddr);
                let copy_end = core::cmp::min(page_va + PAGE_SIZE as u64, file_end);
                if copy_start < copy_end {
                    let len = (copy_end - copy_start) as usize;
                    let src = offset + (copy_start - vaddr) as usize;
                    let dst_off = (copy_start - page_va) as usize;
                    unsafe {
                        core::ptr::copy_nonoverlapping(
                            elf.input.as_ptr().add(src),
                            (page.virt as *mut u8).add(dst_off),
                            len,
                        );
                    }
                }
            }
        }
        Ok(())
    }

    /// Apply `R_X86_64_RELATIVE` relocations for static-PIE images.
    fn relocate(&mut self, res: &Resources, elf: &ElfFile, base: u64) -> Result<(), ExtError> {
        const R_X86_64_RELATIVE: u32 = 8;
        for section in elf.section_iter() {
            if let Ok(SectionData::Rela64(entries)) = section.get_data(elf) {
                for rela in entries {
                    if rela.get_type() != R_X86_64_RELATIVE {
                        return Err(ExtError::UnsupportedRelocation);
                    }
                    let target = base + rela.get_offset();
                    let value = base.wrapping_add(rela.get_addend());
                    self.write_u64(res, target, value)?;
                }
            }
        }
        Ok(())
    }

    /// Write a word into the extension's address space through the pool
    /// view of the backing frame.
    fn write_u64(&self, res: &Resources, ext_virt: u64, value: u64) -> Result<(), ExtError> {
        let pool = res.page_pool.lock();
        let phys = self.rpt.virt_to_phys(&pool, ext_virt)?;
        let mk_virt = pool.phys_to_virt(phys)?;
        unsafe { core::ptr::write_unaligned(mk_virt as *mut u64, value) };
        Ok(())
    }

    /// Per-PP stacks, one guard page between neighbors.
    fn build_stacks(&mut self, res: &Resources, online_pps: usize) -> Result<(), ExtError> {
        let mut pool = res.page_pool.lock();
        let stride = (EXT_STACK_SIZE + PAGE_SIZE) as u64;
        for pp in 0..online_pps {
            let stack_base = EXT_STACK_ADDR + pp as u64 * stride;
            for i in 0..EXT_STACK_SIZE / PAGE_SIZE {
                self.rpt.allocate_page_rw(
                    &mut pool,
                    stack_base + (i * PAGE_SIZE) as u64,
                    AutoRelease::Stack,
                )?;
            }
        }
        Ok(())
    }

    /// Per-PP TLS blocks, one leading guard page each.
    fn build_tls_blocks(&mut self, res: &Resources, online_pps: usize) -> Result<(), ExtError> {
        let mut pool = res.page_pool.lock();
        let stride = 2 * PAGE_SIZE as u64;
        for pp in 0..online_pps {
            let tls_page = EXT_TLS_ADDR + pp as u64 * stride + PAGE_SIZE as u64;
            self.rpt
                .allocate_page_rw(&mut pool, tls_page, AutoRelease::Tls)?;
        }
        Ok(())
    }

    /// The stack pointer callbacks on `pp` start from.
    pub fn stack_top(&self, pp: usize) -> u64 {
        let stride = (EXT_STACK_SIZE + PAGE_SIZE) as u64;
        EXT_STACK_ADDR + pp as u64 * stride + EXT_STACK_SIZE as u64
    }

    /// The thread pointer callbacks on `pp` see.
    pub fn tls_top(&self, pp: usize) -> u64 {
        EXT_TLS_ADDR + pp as u64 * (2 * PAGE_SIZE as u64) + 2 * PAGE_SIZE as u64
    }

    // ------------------------------------------------------------------
    // Handle protocol
    // ------------------------------------------------------------------

    /// Grant the extension its handle. One handle per extension; reopening
    /// without closing is refused.
    pub fn open_handle(&mut self) -> Result<u64, ExtError> {
        if self.handle != 0 {
            return Err(ExtError::HandleAlreadyOpen);
        }
        // id + 1 so a zeroed register never validates.
        self.handle = self.id.get() as u64 + 1;
        Ok(self.handle)
    }

    pub fn close_handle(&mut self) {
        self.handle = 0;
    }

    pub fn is_handle_valid(&self, handle: u64) -> bool {
        self.handle != 0 && handle == self.handle
    }

    // ------------------------------------------------------------------
    // Memory surface
    // ------------------------------------------------------------------

    /// `bf_mem_op_alloc_page`: one page, direct-mapped into the
    /// extension's view.
    pub fn alloc_page(&mut self, res: &Resources) -> Result<ExtPage, ExtError> {
        let mut pool = res.page_pool.lock();
        let page = pool.allocate(PoolTag::AllocPage)?;
        let ext_virt = EXT_DIRECT_MAP_ADDR + page.phys;
        if let Err(e) = self.rpt.map_page(
            &mut pool,
            ext_virt,
            page.phys,
            MapFlags::RW | MapFlags::USER,
            AutoRelease::AllocPage,
        ) {
            let _ = pool.deallocate(page.virt, PoolTag::AllocPage);
            return Err(e.into());
        }
        Ok(ExtPage {
            virt: ext_virt,
            phys: page.phys,
        })
    }

    /// `bf_mem_op_free_page`: give a direct-mapped page back early.
    pub fn free_page(&mut self, res: &Resources, ext_virt: u64) -> Result<(), ExtError> {
        let mut pool = res.page_pool.lock();
        let (phys, tag) = self.rpt.unmap_page(&pool, ext_virt)?;
        if tag != AutoRelease::AllocPage {
            // The extension handed us an address it does not own that way.
            return Err(ExtError::Pool(PoolError::TagMismatch));
        }
        let mk_virt = pool.phys_to_virt(phys)?;
        pool.deallocate(mk_virt, PoolTag::AllocPage)?;
        Ok(())
    }

    /// `bf_mem_op_alloc_huge`: physically contiguous pages, direct-mapped.
    pub fn alloc_huge(&mut self, res: &Resources, pages: usize) -> Result<ExtPage, ExtError> {
        let run = res.huge_pool.lock().allocate(pages)?;
        let ext_virt = EXT_DIRECT_MAP_ADDR + run.phys;
        let mut pool = res.page_pool.lock();
        if let Err(e) = self.rpt.map_range(
            &mut pool,
            ext_virt,
            run.phys,
            pages,
            MapFlags::RW | MapFlags::USER,
            AutoRelease::AllocHuge,
        ) {
            drop(pool);
            let _ = res.huge_pool.lock().deallocate(run.virt);
            return Err(e.into());
        }
        Ok(ExtPage {
            virt: ext_virt,
            phys: run.phys,
        })
    }

    /// `bf_mem_op_free_huge`: return a whole run.
    pub fn free_huge(&mut self, res: &Resources, ext_virt: u64) -> Result<(), ExtError> {
        let phys = ext_virt.wrapping_sub(EXT_DIRECT_MAP_ADDR);
        let (run_virt, pages) = {
            let huge = res.huge_pool.lock();
            let run_virt = huge.phys_to_virt(phys)?;
            (run_virt, huge.run_pages(run_virt)?)
        };
        {
            let pool = res.page_pool.lock();
            for i in 0..pages {
                let (_, tag) = self
                    .rpt
                    .unmap_page(&pool, ext_virt + (i * PAGE_SIZE) as u64)?;
                if tag != AutoRelease::AllocHuge {
                    return Err(ExtError::Pool(PoolError::TagMismatch));
                }
            }
        }
        res.huge_pool.lock().deallocate(run_virt)?;
        Ok(())
    }

    /// `bf_mem_op_alloc_heap`: grow the bump heap, returning the previous
    /// break.
    pub fn alloc_heap(&mut self, res: &Resources, size: u64) -> Result<u64, ExtError> {
        if size == 0 {
            return Err(ExtError::HeapExhausted);
        }
        let bytes = page_align_up(size);
        let prev = EXT_HEAP_ADDR + self.heap_cursor;
        if prev + bytes > EXT_HEAP_MAX {
            return Err(ExtError::HeapExhausted);
        }
        let mut pool = res.page_pool.lock();
        let pages = (bytes / PAGE_SIZE as u64) as usize;
        for i in 0..pages {
            self.rpt.allocate_page_rw(
                &mut pool,
                prev + (i * PAGE_SIZE) as u64,
                AutoRelease::AllocHeap,
            )?;
        }
        self.heap_cursor += bytes;
        Ok(prev)
    }

    /// Demand-map one page of the extension direct map (no ownership).
    pub fn map_page_direct(&mut self, res: &Resources, ext_virt: u64) -> Result<(), ExtError> {
        if !(EXT_DIRECT_MAP_ADDR..EXT_SPACE_MAX).contains(&ext_virt) {
            return Err(ExtError::SegmentOutOfRange);
        }
        let phys = (ext_virt - EXT_DIRECT_MAP_ADDR) & !(PAGE_SIZE as u64 - 1);
        let mut pool = res.page_pool.lock();
        self.rpt.map_page(
            &mut pool,
            ext_virt & !(PAGE_SIZE as u64 - 1),
            phys,
            MapFlags::RW | MapFlags::USER,
            AutoRelease::None,
        )?;
        Ok(())
    }

    /// Resolve an extension virtual address.
    pub fn virt_to_phys(&self, res: &Resources, ext_virt: u64) -> Result<u64, ExtError> {
        let pool = res.page_pool.lock();
        Ok(self.rpt.virt_to_phys(&pool, ext_virt)?)
    }

    // ------------------------------------------------------------------
    // Lifecycle notifications
    // ------------------------------------------------------------------

    pub fn signal_vm_created(&mut self, vmid: Id) -> Result<(), ExtError> {
        let idx = vmid.as_usize();
        if idx >= MAX_VMS {
            return Err(ExtError::NoSuchExt);
        }
        self.vms_signaled[idx] = true;
        Ok(())
    }

    pub fn signal_vm_destroyed(&mut self, vmid: Id) -> Result<(), ExtError> {
        let idx = vmid.as_usize();
        if idx >= MAX_VMS || !self.vms_signaled[idx] {
            return Err(ExtError::NotSignaled);
        }
        self.vms_signaled[idx] = false;
        Ok(())
    }

    /// Tear down the extension's RPT, returning every owned frame.
    pub fn release(&mut self, res: &Resources) -> Result<(), ExtError> {
        if self.loaded {
            let mut pool = res.page_pool.lock();
            let mut huge = res.huge_pool.lock();
            self.rpt.release(&mut pool, &mut huge)?;
        }
        *self = Ext::new(self.id);
        Ok(())
    }

    /// Render this extension into the debug ring.
    pub fn dump(&self) {
        diag::mklog_always!(
            "ext [{:#06x}]: loaded={} entry={:#x} handle={} heap={:#x}",
            self.id,
            self.loaded,
            self.entry_ip,
            self.handle,
            EXT_HEAP_ADDR + self.heap_cursor
        );
        diag::mklog_always!(
            "  callbacks: bootstrap={:#x} vmexit={:#x} fail={:#x}",
            self.bootstrap_ip,
            self.vmexit_ip,
            self.fail_ip
        );
    }
}

fn validate_header(elf: &ElfFile) -> Result<(), ExtError> {
    let hdr = &elf.header;
    if hdr.pt1.magic != [0x7F, b'E', b'L', b'F'] {
        return Err(ExtError::InvalidMagic);
    }
    match hdr.pt1.class() {
        Class::SixtyFour => {}
        _ => return Err(ExtError::UnsupportedClass),
    }
    match hdr.pt1.data() {
        Data::LittleEndian => {}
        _ => return Err(ExtError::NotLittleEndian),
    }
    if hdr.pt2.machine().as_machine() != Machine::X86_64 {
        return Err(ExtError::UnsupportedMachine);
    }
    match hdr.pt2.type_().as_type() {
        ElfType::Executable | ElfType::SharedObject => Ok(()),
        _ => Err(ExtError::UnsupportedType),
    }
}
