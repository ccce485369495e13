//! The root page table (RPT).
//!
//! A four-level (PML4 → PDPT → PD → PT) manager for 4 KiB leaves. Table
//! nodes come from the page pool under [`PoolTag::PageTable`] and are
//! reached through the pool's constant-offset translation, so the manager
//! works identically on hardware and under host tests.
//!
//! Two properties carry the whole teardown story:
//!
//! - every leaf stores an [`AutoRelease`] tag in PTE bits 9–11 naming the
//!   pool (and sub-pool tag) that owns its backing frame, and
//! - pml4 entries imported from another RPT are marked *alias* (bit 9 at
//!   the top level) and are never walked.
//!
//! [`RootPageTable::release`] therefore needs no external bookkeeping: it
//! walks its own subtrees, returns every tagged leaf to the right pool
//! under the right tag, then frees the table nodes themselves.
//!
//! Mapping enforces the address-space contract up front: the kernel half
//! (canonical high) is supervisor-only, the extension half (canonical low)
//! is user-only, the two never share a pml4 entry, and a writable leaf is
//! never executable.

use crate::{AutoRelease, HugePool, PagePool, PageRef, PoolError, PoolTag};
use bitflags::bitflags;
use mkabi::layout::{is_canonical, is_page_aligned};
use x86_64::structures::paging::page_table::PageTableEntry;
use x86_64::structures::paging::{PageTable, PageTableFlags};
use x86_64::{PhysAddr, VirtAddr};

bitflags! {
    /// Requested permissions for a mapping.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct MapFlags: u64 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
        const USER = 1 << 3;
    }
}

impl MapFlags {
    /// Read-write data.
    pub const RW: MapFlags = MapFlags::READ.union(MapFlags::WRITE);
    /// Read-execute code.
    pub const RX: MapFlags = MapFlags::READ.union(MapFlags::EXECUTE);
}

/// RPT operation failures.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MapError {
    Uninitialized,
    AlreadyInitialized,
    /// Mapping the zero page is never valid.
    NullVirt,
    Unaligned,
    NonCanonical,
    AlreadyMapped,
    NotMapped,
    /// The request asked for a writable and executable leaf.
    WritableExecutable,
    /// The request's user/supervisor intent disagrees with the pml4 entry
    /// that already covers the address.
    UserSupervisorClash,
    /// The operation would modify or walk an alias entry, or alias over an
    /// owned entry.
    AliasConflict,
    /// The auto-release tag does not name a page-pool owner.
    InvalidTag,
    /// The underlying pool failed.
    Pool(PoolError),
}

impl From<PoolError> for MapError {
    fn from(e: PoolError) -> Self {
        MapError::Pool(e)
    }
}

/// Alias marker on pml4 entries.
const ALIAS: PageTableFlags = PageTableFlags::BIT_9;

/// Mask of the auto-release field within leaf flags.
const AUTO_RELEASE_SHIFT: u64 = 9;
const AUTO_RELEASE_MASK: u64 = 0b111 << AUTO_RELEASE_SHIFT;

/// The root page table.
pub struct RootPageTable {
    pml4_phys: u64,
    pml4_virt: u64,
}

impl RootPageTable {
    /// An uninitialized RPT.
    pub const fn new() -> Self {
        RootPageTable {
            pml4_phys: 0,
            pml4_virt: 0,
        }
    }

    #[inline]
    pub fn is_initialized(&self) -> bool {
        self.pml4_phys != 0
    }

    /// Physical address of the top-level table.
    #[inline]
    pub fn phys(&self) -> u64 {
        self.pml4_phys
    }

    /// Allocate the top-level table.
    pub fn initialize(&mut self, pool: &mut PagePool) -> Result<(), MapError> {
        if self.is_initialized() {
            return Err(MapError::AlreadyInitialized);
        }
        let node = pool.allocate(PoolTag::PageTable)?;
        self.pml4_phys = node.phys;
        self.pml4_virt = node.virt;
        Ok(())
    }

    /// Install this RPT as the hardware translation root.
    pub fn activate(&self) -> Result<(), MapError> {
        if !self.is_initialized() {
            return Err(MapError::Uninitialized);
        }
        // The kernel half of this RPT covers the executing microkernel by
        // construction (system tables are aliased in before activation).
        unsafe { intrinsics::regs::set_root(self.pml4_phys) };
        Ok(())
    }

    /// True if the hardware root currently points at this RPT.
    pub fn is_active(&self) -> bool {
        self.is_initialized() && intrinsics::regs::current_root() == self.pml4_phys
    }

    /// Import every present top-level entry of `other` as an alias.
    ///
    /// Alias entries read through `other`'s tables without owning them:
    /// they are skipped by [`release`](Self::release). Importing over an
    /// owned (non-alias) entry is a contract violation.
    pub fn add_tables(&mut self, pool: &PagePool, other: &RootPageTable) -> Result<(), MapError> {
        if !self.is_initialized() || !other.is_initialized() {
            return Err(MapError::Uninitialized);
        }
        let src = table_at(pool, other.pml4_phys)?;
        let dst = table_at(pool, self.pml4_phys)?;
        for i in 0..512 {
            let se = &src[i];
            if se.is_unused() {
                continue;
            }
            let de = &mut dst[i];
            if !de.is_unused() && !de.flags().contains(ALIAS) {
                return Err(MapError::AliasConflict);
            }
            de.set_addr(se.addr(), se.flags() | ALIAS);
        }
        Ok(())
    }

    /// Import loader-provided top-level entries (raw form) as aliases.
    pub fn add_tables_raw(
        &mut self,
        pool: &PagePool,
        entries: &[u64; 512],
    ) -> Result<(), MapError> {
        if !self.is_initialized() {
            return Err(MapError::Uninitialized);
        }
        let dst = table_at(pool, self.pml4_phys)?;
        for (i, &raw) in entries.iter().enumerate() {
            if raw & 1 == 0 {
                continue;
            }
            let de = &mut dst[i];
            if !de.is_unused() && !de.flags().contains(ALIAS) {
                return Err(MapError::AliasConflict);
            }
            let addr = PhysAddr::new(raw & 0x000F_FFFF_FFFF_F000);
            let flags = PageTableFlags::from_bits_truncate(raw) | ALIAS;
            de.set_addr(addr, flags);
        }
        Ok(())
    }

    /// Insert a 4 KiB mapping.
    pub fn map_page(
        &mut self,
        pool: &mut PagePool,
        virt: u64,
        phys: u64,
        flags: MapFlags,
        tag: AutoRelease,
    ) -> Result<(), MapError> {
        if !self.is_initialized() {
            return Err(MapError::Uninitialized);
        }
        if virt == 0 {
            return Err(MapError::NullVirt);
        }
        if !is_page_aligned(virt) || !is_page_aligned(phys) {
            return Err(MapError::Unaligned);
        }
        if !is_canonical(virt) {
            return Err(MapError::NonCanonical);
        }
        if flags.contains(MapFlags::WRITE) && flags.contains(MapFlags::EXECUTE) {
            return Err(MapError::WritableExecutable);
        }

        let user = flags.contains(MapFlags::USER);
        let addr = VirtAddr::new(virt);

        let pml4 = table_at(pool, self.pml4_phys)?;
        let p4e = &mut pml4[usize::from(addr.p4_index())];
        if p4e.is_unused() {
            let node = pool.allocate(PoolTag::PageTable)?;
            p4e.set_addr(PhysAddr::new(node.phys), node_flags(user));
        } else {
            if p4e.flags().contains(ALIAS) {
                return Err(MapError::AliasConflict);
            }
            if p4e.flags().contains(PageTableFlags::USER_ACCESSIBLE) != user {
                return Err(MapError::UserSupervisorClash);
            }
        }

        let pdpt = table_at(pool, p4e.addr().as_u64())?;
        let p3e = &mut pdpt[usize::from(addr.p3_index())];
        if p3e.is_unused() {
            let node = pool.allocate(PoolTag::PageTable)?;
            p3e.set_addr(PhysAddr::new(node.phys), node_flags(user));
        }

        let pd = table_at(pool, p3e.addr().as_u64())?;
        let p2e = &mut pd[usize::from(addr.p2_index())];
        if p2e.is_unused() {
            let node = pool.allocate(PoolTag::PageTable)?;
            p2e.set_addr(PhysAddr::new(node.phys), node_flags(user));
        }

        let pt = table_at(pool, p2e.addr().as_u64())?;
        let p1e = &mut pt[usize::from(addr.p1_index())];
        if !p1e.is_unused() {
            return Err(MapError::AlreadyMapped);
        }
        p1e.set_addr(PhysAddr::new(phys), leaf_flags(flags, tag));
        Ok(())
    }

    /// Map a run of pages, rolling the whole call back on failure.
    pub fn map_range(
        &mut self,
        pool: &mut PagePool,
        virt: u64,
        phys: u64,
        pages: usize,
        flags: MapFlags,
        tag: AutoRelease,
    ) -> Result<(), MapError> {
        for i in 0..pages {
            let offset = (i as u64) << 12;
            if let Err(e) = self.map_page(pool, virt + offset, phys + offset, flags, tag) {
                for j in (0..i).rev() {
                    let _ = self.unmap_leaf(pool, virt + ((j as u64) << 12));
                }
                return Err(e);
            }
        }
        Ok(())
    }

    /// Allocate a frame from the page pool under `tag`'s pool tag and map
    /// it read-write. The user/supervisor bit follows the address half.
    pub fn allocate_page_rw(
        &mut self,
        pool: &mut PagePool,
        virt: u64,
        tag: AutoRelease,
    ) -> Result<PageRef, MapError> {
        self.allocate_page(pool, virt, MapFlags::RW, tag)
    }

    /// As [`allocate_page_rw`](Self::allocate_page_rw) but read-execute.
    pub fn allocate_page_rx(
        &mut self,
        pool: &mut PagePool,
        virt: u64,
        tag: AutoRelease,
    ) -> Result<PageRef, MapError> {
        self.allocate_page(pool, virt, MapFlags::RX, tag)
    }

    fn allocate_page(
        &mut self,
        pool: &mut PagePool,
        virt: u64,
        flags: MapFlags,
        tag: AutoRelease,
    ) -> Result<PageRef, MapError> {
        let pool_tag = tag.pool_tag().ok_or(MapError::InvalidTag)?;
        let mut flags = flags;
        if virt < 0x0000_8000_0000_0000 {
            flags |= MapFlags::USER;
        }
        let page = pool.allocate(pool_tag)?;
        if let Err(e) = self.map_page(pool, virt, page.phys, flags, tag) {
            // The frame never became reachable; hand it straight back.
            let _ = pool.deallocate(page.virt, pool_tag);
            return Err(e);
        }
        Ok(page)
    }

    /// Software walk: the physical address `virt` maps to.
    pub fn virt_to_phys(&self, pool: &PagePool, virt: u64) -> Result<u64, MapError> {
        self.translate_with_flags(pool, virt).map(|(phys, _)| phys)
    }

    /// Software walk returning the leaf's physical address and flags.
    pub fn translate_with_flags(
        &self,
        pool: &PagePool,
        virt: u64,
    ) -> Result<(u64, PageTableFlags), MapError> {
        if !self.is_initialized() {
            return Err(MapError::Uninitialized);
        }
        if !is_canonical(virt) {
            return Err(MapError::NonCanonical);
        }
        let addr = VirtAddr::new(virt);
        let pml4 = table_at(pool, self.pml4_phys)?;
        // Reads may walk through alias entries; only release skips them.
        let p4e = &pml4[usize::from(addr.p4_index())];
        if p4e.is_unused() {
            return Err(MapError::NotMapped);
        }
        let pdpt = table_at(pool, p4e.addr().as_u64())?;
        let p3e = &pdpt[usize::from(addr.p3_index())];
        if p3e.is_unused() {
            return Err(MapError::NotMapped);
        }
        let pd = table_at(pool, p3e.addr().as_u64())?;
        let p2e = &pd[usize::from(addr.p2_index())];
        if p2e.is_unused() {
            return Err(MapError::NotMapped);
        }
        let pt = table_at(pool, p2e.addr().as_u64())?;
        let p1e = &pt[usize::from(addr.p1_index())];
        if p1e.is_unused() {
            return Err(MapError::NotMapped);
        }
        Ok((
            p1e.addr().as_u64() + (virt & 0xFFF),
            p1e.flags(),
        ))
    }

    /// The auto-release tag stored on the leaf covering `virt`.
    pub fn auto_release_of(&self, pool: &PagePool, virt: u64) -> Result<AutoRelease, MapError> {
        let (_, flags) = self.translate_with_flags(pool, virt)?;
        Ok(AutoRelease::from_bits(
            (flags.bits() & AUTO_RELEASE_MASK) >> AUTO_RELEASE_SHIFT,
        ))
    }

    /// Tear the RPT down: return every tagged leaf to its owning pool,
    /// then free the table nodes. Alias entries are dropped unwalked.
    pub fn release(
        &mut self,
        pool: &mut PagePool,
        huge: &mut HugePool,
    ) -> Result<(), MapError> {
        if !self.is_initialized() {
            return Ok(());
        }
        let pml4 = table_at(pool, self.pml4_phys)?;
        for i in 0..512 {
            let e = &mut pml4[i];
            if e.is_unused() || e.flags().contains(ALIAS) {
                continue;
            }
            let pdpt_phys = e.addr().as_u64();
            release_pdpt(pool, huge, pdpt_phys)?;
            let node_virt = pool.phys_to_virt(pdpt_phys)?;
            pool.deallocate(node_virt, PoolTag::PageTable)?;
            e.set_unused();
        }
        pool.deallocate(self.pml4_virt, PoolTag::PageTable)?;
        self.pml4_phys = 0;
        self.pml4_virt = 0;
        Ok(())
    }

    /// Render the present top-level entries into the debug ring.
    pub fn dump(&self, pool: &PagePool) {
        if !self.is_initialized() {
            diag::mklog_always!("rpt: uninitialized");
            return;
        }
        diag::mklog_always!("rpt [{:#x}]:", self.pml4_phys);
        if let Ok(pml4) = table_at(pool, self.pml4_phys) {
            for i in 0..512 {
                let e = &pml4[i];
                if e.is_unused() {
                    continue;
                }
                diag::mklog_always!(
                    "  pml4[{:03}] -> {:#014x} {}{}",
                    i,
                    e.addr().as_u64(),
                    if e.flags().contains(PageTableFlags::USER_ACCESSIBLE) {
                        "user"
                    } else {
                        "supervisor"
                    },
                    if e.flags().contains(ALIAS) { " alias" } else { "" },
                );
            }
        }
    }

    /// Remove one leaf, returning the physical address and auto-release
    /// tag it carried. The caller owns returning the frame to its pool;
    /// this is how `bf_mem_op_free_page`/`free_huge` give memory back
    /// before teardown.
    pub fn unmap_page(
        &mut self,
        pool: &PagePool,
        virt: u64,
    ) -> Result<(u64, AutoRelease), MapError> {
        let (phys, flags) = self.translate_with_flags(pool, virt)?;
        let tag = AutoRelease::from_bits((flags.bits() & AUTO_RELEASE_MASK) >> AUTO_RELEASE_SHIFT);
        self.unmap_leaf(pool, virt)?;
        Ok((phys & !0xFFF, tag))
    }

    /// Remove one leaf without releasing its frame (range-map rollback).
    fn unmap_leaf(&mut self, pool: &PagePool, virt: u64) -> Result<(), MapError> {
        let addr = VirtAddr::new(virt);
        let pml4 = table_at(pool, self.pml4_phys)?;
        let p4e = &pml4[usize::from(addr.p4_index())];
        if p4e.is_unused() || p4e.flags().contains(ALIAS) {
            return Err(MapError::NotMapped);
        }
        let pdpt = table_at(pool, p4e.addr().as_u64())?;
        let p3e = &pdpt[usize::from(addr.p3_index())];
        if p3e.is_unused() {
            return Err(MapError::NotMapped);
        }
        let pd = table_at(pool, p3e.addr().as_u64())?;
        let p2e = &pd[usize::from(addr.p2_index())];
        if p2e.is_unused() {
            return Err(MapError::NotMapped);
        }
        let pt = table_at(pool, p2e.addr().as_u64())?;
        let p1e = &mut pt[usize::from(addr.p1_index())];
        if p1e.is_unused() {
            return Err(MapError::NotMapped);
        }
        p1e.set_unused();
        intrinsics::regs::invlpg(virt);
        Ok(())
    }
}

impl Default for RootPageTable {
    fn default() -> Self {
        RootPageTable::new()
    }
}

/// Flags for intermediate table entries.
fn node_flags(user: bool) -> PageTableFlags {
    let mut f = PageTableFlags::PRESENT | PageTableFlags::WRITABLE;
    if user {
        f |= PageTableFlags::USER_ACCESSIBLE;
    }
    f
}

/// Flags for a leaf entry, auto-release tag included.
fn leaf_flags(flags: MapFlags, tag: AutoRelease) -> PageTableFlags {
    let mut f = PageTableFlags::PRESENT;
    if flags.contains(MapFlags::WRITE) {
        f |= PageTableFlags::WRITABLE;
    }
    if flags.contains(MapFlags::USER) {
        f |= PageTableFlags::USER_ACCESSIBLE;
    }
    if !flags.contains(MapFlags::EXECUTE) {
        f |= PageTableFlags::NO_EXECUTE;
    }
    f | PageTableFlags::from_bits_truncate(tag.bits() << AUTO_RELEASE_SHIFT)
}

/// The table node at `phys`, reached through the pool direct map.
fn table_at(pool: &PagePool, phys: u64) -> Result<&'static mut PageTable, MapError> {
    let virt = pool.phys_to_virt(phys)?;
    // Safety: table nodes are pool frames allocated by this manager (or
    // the peer RPT being aliased); the pool keeps them alive until release.
    Ok(unsafe { &mut *(virt as *mut PageTable) })
}

fn release_pdpt(
    pool: &mut PagePool,
    huge: &mut HugePool,
    pdpt_phys: u64,
) -> Result<(), MapError> {
    let pdpt = table_at(pool, pdpt_phys)?;
    for i in 0..512 {
        let e = &mut pdpt[i];
        if e.is_unused() {
            continue;
        }
        let pd_phys = e.addr().as_u64();
        release_pd(pool, huge, pd_phys)?;
        let node_virt = pool.phys_to_virt(pd_phys)?;
        pool.deallocate(node_virt, PoolTag::PageTable)?;
        e.set_unused();
    }
    Ok(())
}

fn release_pd(pool: &mut PagePool, huge: &mut HugePool, pd_phys: u64) -> Result<(), MapError> {
    let pd = table_at(pool, pd_phys)?;
    for i in 0..512 {
        let e = &mut pd[i];
        if e.is_unused() {
            continue;
        }
        let pt_phys = e.addr().as_u64();
        release_pt(pool, huge, pt_phys)?;
        let node_virt = pool.phys_to_virt(pt_phys)?;
        pool.deallocate(node_virt, PoolTag::PageTable)?;
        e.set_unused();
    }
    Ok(())
}

fn release_pt(pool: &mut PagePool, huge: &mut HugePool, pt_phys: u64) -> Result<(), MapError> {
    let pt = table_at(pool, pt_phys)?;
    for i in 0..512 {
        let e: &mut PageTableEntry = &mut pt[i];
        if e.is_unused() {
            continue;
        }
        let tag = AutoRelease::from_bits((e.flags().bits() & AUTO_RELEASE_MASK) >> AUTO_RELEASE_SHIFT);
        let phys = e.addr().as_u64();
        match tag {
            AutoRelease::None => {}
            AutoRelease::AllocHuge => huge.free_chunk(phys)?,
            AutoRelease::AllocPage => {
                let virt = pool.phys_to_virt(phys)?;
                pool.deallocate(virt, PoolTag::AllocPage)?;
            }
            AutoRelease::AllocHeap => {
                let virt = pool.phys_to_virt(phys)?;
                pool.deallocate(virt, PoolTag::ExtHeap)?;
            }
            AutoRelease::Stack => {
                let virt = pool.phys_to_virt(phys)?;
                pool.deallocate(virt, PoolTag::ExtStack)?;
            }
            AutoRelease::Tls => {
                let virt = pool.phys_to_virt(phys)?;
                pool.deallocate(virt, PoolTag::ExtTls)?;
            }
            AutoRelease::Elf => {
                let virt = pool.phys_to_virt(phys)?;
                pool.deallocate(virt, PoolTag::ExtElf)?;
            }
        }
        e.set_unused();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::huge_pool::testutil as huge_testutil;
    use crate::page_pool::testutil;

    const KVIRT: u64 = 0xFFFF_9000_0000_0000;
    const UVIRT: u64 = 0x0000_0000_4000_0000;

    fn rpt_with_pool(pages: usize) -> (RootPageTable, testutil::TestPool) {
        let mut t = testutil::pool(pages);
        let mut rpt = RootPageTable::new();
        rpt.initialize(&mut t.pool).unwrap();
        (rpt, t)
    }

    #[test]
    fn map_then_release_restores_the_pool() {
        let (mut rpt, mut t) = rpt_with_pool(32);
        let mut ht = huge_testutil::pool(4);
        let baseline = t.pool.remaining();

        rpt.allocate_page_rw(&mut t.pool, KVIRT, AutoRelease::Stack)
            .unwrap();
        rpt.allocate_page_rw(&mut t.pool, KVIRT + 0x1000, AutoRelease::Stack)
            .unwrap();
        assert!(t.pool.remaining() < baseline);

        rpt.release(&mut t.pool, &mut ht.pool).unwrap();
        // Everything came back, stack frames and table nodes alike.
        assert_eq!(t.pool.allocated(), 0);
        assert_eq!(ht.pool.allocated(), 0);
    }

    #[test]
    fn writable_executable_is_rejected_without_side_effects() {
        let (mut rpt, mut t) = rpt_with_pool(16);
        let before = t.pool.remaining();
        assert_eq!(
            rpt.map_page(
                &mut t.pool,
                UVIRT,
                0x2000,
                MapFlags::WRITE | MapFlags::EXECUTE,
                AutoRelease::None,
            ),
            Err(MapError::WritableExecutable)
        );
        assert_eq!(t.pool.remaining(), before);
        assert_eq!(
            rpt.translate_with_flags(&t.pool, UVIRT),
            Err(MapError::NotMapped)
        );
    }

    #[test]
    fn null_and_unaligned_and_noncanonical_are_rejected() {
        let (mut rpt, mut t) = rpt_with_pool(16);
        assert_eq!(
            rpt.map_page(&mut t.pool, 0, 0x1000, MapFlags::RW, AutoRelease::None),
            Err(MapError::NullVirt)
        );
        assert_eq!(
            rpt.map_page(&mut t.pool, 0x1001, 0x1000, MapFlags::RW, AutoRelease::None),
            Err(MapError::Unaligned)
        );
        assert_eq!(
            rpt.map_page(&mut t.pool, 0x1000, 0x1010, MapFlags::RW, AutoRelease::None),
            Err(MapError::Unaligned)
        );
        assert_eq!(
            rpt.map_page(
                &mut t.pool,
                0x0000_9000_0000_0000,
                0x1000,
                MapFlags::RW,
                AutoRelease::None,
            ),
            Err(MapError::NonCanonical)
        );
    }

    #[test]
    fn double_map_is_rejected() {
        let (mut rpt, mut t) = rpt_with_pool(16);
        rpt.map_page(&mut t.pool, UVIRT, 0x2000, MapFlags::RW | MapFlags::USER, AutoRelease::None)
            .unwrap();
        assert_eq!(
            rpt.map_page(
                &mut t.pool,
                UVIRT,
                0x3000,
                MapFlags::RW | MapFlags::USER,
                AutoRelease::None
            ),
            Err(MapError::AlreadyMapped)
        );
    }

    #[test]
    fn user_supervisor_clash_on_a_shared_pml4_slot() {
        let (mut rpt, mut t) = rpt_with_pool(16);
        rpt.map_page(&mut t.pool, UVIRT, 0x2000, MapFlags::RW | MapFlags::USER, AutoRelease::None)
            .unwrap();
        // Same pml4 slot, supervisor intent: contract violation.
        assert_eq!(
            rpt.map_page(
                &mut t.pool,
                UVIRT + 0x10_0000,
                0x3000,
                MapFlags::RW,
                AutoRelease::None
            ),
            Err(MapError::UserSupervisorClash)
        );
    }

    #[test]
    fn writable_leaves_are_not_executable() {
        let (mut rpt, mut t) = rpt_with_pool(16);
        rpt.map_page(&mut t.pool, KVIRT, 0x2000, MapFlags::RW, AutoRelease::None)
            .unwrap();
        let (_, flags) = rpt.translate_with_flags(&t.pool, KVIRT).unwrap();
        assert!(flags.contains(PageTableFlags::WRITABLE));
        assert!(flags.contains(PageTableFlags::NO_EXECUTE));

        rpt.map_page(&mut t.pool, KVIRT + 0x1000, 0x3000, MapFlags::RX, AutoRelease::None)
            .unwrap();
        let (_, flags) = rpt.translate_with_flags(&t.pool, KVIRT + 0x1000).unwrap();
        assert!(!flags.contains(PageTableFlags::WRITABLE));
        assert!(!flags.contains(PageTableFlags::NO_EXECUTE));
    }

    #[test]
    fn auto_release_tags_survive_the_walk() {
        let (mut rpt, mut t) = rpt_with_pool(16);
        let page = rpt
            .allocate_page_rw(&mut t.pool, KVIRT, AutoRelease::Tls)
            .unwrap();
        assert_eq!(
            rpt.auto_release_of(&t.pool, KVIRT).unwrap(),
            AutoRelease::Tls
        );
        // The leaf's tag and the pool's ownership record agree.
        assert_eq!(t.pool.tag_of(page.virt).unwrap(), Some(PoolTag::ExtTls));
        rpt.map_page(&mut t.pool, KVIRT + 0x1000, 0x5000, MapFlags::RW, AutoRelease::None)
            .unwrap();
        assert_eq!(
            rpt.auto_release_of(&t.pool, KVIRT + 0x1000).unwrap(),
            AutoRelease::None
        );
    }

    #[test]
    fn release_returns_each_frame_under_its_own_tag() {
        let (mut rpt, mut t) = rpt_with_pool(32);
        let mut ht = huge_testutil::pool(8);

        rpt.allocate_page_rw(&mut t.pool, KVIRT, AutoRelease::Stack).unwrap();
        rpt.allocate_page_rw(&mut t.pool, KVIRT + 0x1000, AutoRelease::Tls).unwrap();
        rpt.allocate_page_rx(&mut t.pool, UVIRT, AutoRelease::Elf).unwrap();

        let run = ht.pool.allocate(2).unwrap();
        rpt.map_range(
            &mut t.pool,
            KVIRT + 0x2000,
            run.phys,
            2,
            MapFlags::RW,
            AutoRelease::AllocHuge,
        )
        .unwrap();

        rpt.release(&mut t.pool, &mut ht.pool).unwrap();
        assert_eq!(t.pool.allocated(), 0);
        assert_eq!(ht.pool.allocated(), 0);
        assert!(!rpt.is_initialized());
    }

    #[test]
    fn aliases_are_imported_shallow_and_never_walked() {
        let mut t = testutil::pool(48);
        let mut ht = huge_testutil::pool(4);

        let mut system = RootPageTable::new();
        system.initialize(&mut t.pool).unwrap();
        system
            .allocate_page_rw(&mut t.pool, KVIRT, AutoRelease::Stack)
            .unwrap();
        let system_frames = t.pool.allocated();

        let mut ext_rpt = RootPageTable::new();
        ext_rpt.initialize(&mut t.pool).unwrap();
        ext_rpt.add_tables(&t.pool, &system).unwrap();

        // The alias reads through to the system mapping.
        let (phys_via_alias, _) = ext_rpt.translate_with_flags(&t.pool, KVIRT).unwrap();
        let (phys_direct, _) = system.translate_with_flags(&t.pool, KVIRT).unwrap();
        assert_eq!(phys_via_alias, phys_direct);

        // Releasing the aliasing RPT must free only its own pml4 node.
        ext_rpt.release(&mut t.pool, &mut ht.pool).unwrap();
        assert_eq!(t.pool.allocated(), system_frames);

        // The system RPT is untouched and still resolves.
        assert!(system.translate_with_flags(&t.pool, KVIRT).is_ok());
        system.release(&mut t.pool, &mut ht.pool).unwrap();
        assert_eq!(t.pool.allocated(), 0);
    }

    #[test]
    fn aliasing_over_an_owned_entry_is_rejected() {
        let mut t = testutil::pool(48);
        let mut a = RootPageTable::new();
        a.initialize(&mut t.pool).unwrap();
        a.allocate_page_rw(&mut t.pool, KVIRT, AutoRelease::Stack).unwrap();
        let mut b = RootPageTable::new();
        b.initialize(&mut t.pool).unwrap();
        b.allocate_page_rw(&mut t.pool, KVIRT + 0x1000, AutoRelease::Stack)
            .unwrap();
        assert_eq!(b.add_tables(&t.pool, &a), Err(MapError::AliasConflict));
    }

    #[test]
    fn mapping_through_an_alias_slot_is_rejected() {
        let mut t = testutil::pool(48);
        let mut system = RootPageTable::new();
        system.initialize(&mut t.pool).unwrap();
        system
            .allocate_page_rw(&mut t.pool, KVIRT, AutoRelease::Stack)
            .unwrap();

        let mut ext_rpt = RootPageTable::new();
        ext_rpt.initialize(&mut t.pool).unwrap();
        ext_rpt.add_tables(&t.pool, &system).unwrap();
        assert_eq!(
            ext_rpt.map_page(
                &mut t.pool,
                KVIRT + 0x1000,
                0x6000,
                MapFlags::RW,
                AutoRelease::None
            ),
            Err(MapError::AliasConflict)
        );
    }

    #[test]
    fn range_map_rolls_back_on_failure() {
        let (mut rpt, mut t) = rpt_with_pool(16);
        // Pre-map a hole in the middle of the target range.
        rpt.map_page(&mut t.pool, KVIRT + 0x2000, 0x9000, MapFlags::RW, AutoRelease::None)
            .unwrap();
        assert_eq!(
            rpt.map_range(&mut t.pool, KVIRT, 0x10000, 4, MapFlags::RW, AutoRelease::None),
            Err(MapError::AlreadyMapped)
        );
        // The pages before the hole were unmapped again.
        assert_eq!(
            rpt.translate_with_flags(&t.pool, KVIRT),
            Err(MapError::NotMapped)
        );
        assert_eq!(
            rpt.translate_with_flags(&t.pool, KVIRT + 0x1000),
            Err(MapError::NotMapped)
        );
        // The pre-existing mapping survived.
        assert!(rpt.translate_with_flags(&t.pool, KVIRT + 0x2000).is_ok());
    }

    #[test]
    fn activate_requires_initialization() {
        let rpt = RootPageTable::new();
        assert_eq!(rpt.activate(), Err(MapError::Uninitialized));

        let (rpt, _t) = rpt_with_pool(8);
        rpt.activate().unwrap();
        assert!(rpt.is_active());
    }
}
