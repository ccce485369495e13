//! Physically contiguous multi-frame allocation.
//!
//! Hardware control structures and DMA-visible buffers must be contiguous
//! in physical memory, which the page pool cannot promise. The huge pool
//! manages one loader-donated contiguous region as an array of 4 KiB
//! chunks with a [`BitVec`] occupancy map: allocation is a first-fit scan
//! for a free run, so every allocation is describable by `(base_phys,
//! size)` and the region can never fragment into untrackable shapes.
//!
//! Runs are released two ways: whole-run (`deallocate`, used by the
//! syscall surface) and chunk-at-a-time (`free_chunk`, used by the RPT
//! auto-release walk, which visits one leaf per chunk).

use crate::{PageRef, PoolError};
use alloc::vec;
use alloc::vec::Vec;
use bit_vec::BitVec;
use mkabi::layout::{PAGE_SHIFT, PAGE_SIZE};
use mkboot::PoolSpan;

/// The huge pool.
pub struct HugePool {
    virt_base: u64,
    phys_base: u64,
    chunks: usize,
    /// Occupancy per chunk.
    used: BitVec,
    /// Run length recorded at the first chunk of each live run; 0 elsewhere.
    run_len: Vec<u32>,
    free_chunks: usize,
}

impl HugePool {
    /// An uninitialized pool.
    pub fn new() -> Self {
        HugePool {
            virt_base: 0,
            phys_base: 0,
            chunks: 0,
            used: BitVec::new(),
            run_len: Vec::new(),
            free_chunks: 0,
        }
    }

    /// Adopt the loader span. `(base, size)` are immutable afterwards.
    pub fn initialize(&mut self, span: PoolSpan) -> Result<(), PoolError> {
        if self.chunks != 0 {
            return Err(PoolError::AlreadyInitialized);
        }
        if span.virt % PAGE_SIZE as u64 != 0 || span.phys % PAGE_SIZE as u64 != 0 {
            return Err(PoolError::Unaligned);
        }
        let chunks = span.pages();
        if chunks == 0 {
            return Err(PoolError::OutOfRange);
        }
        self.virt_base = span.virt;
        self.phys_base = span.phys;
        self.chunks = chunks;
        self.used = BitVec::from_elem(chunks, false);
        self.run_len = vec![0; chunks];
        self.free_chunks = chunks;
        Ok(())
    }

    /// Drop the span. All chunks must already be free.
    pub fn release(&mut self) -> Result<(), PoolError> {
        if self.allocated() != 0 {
            return Err(PoolError::TagMismatch);
        }
        *self = HugePool::new();
        Ok(())
    }

    #[inline]
    pub fn is_initialized(&self) -> bool {
        self.chunks != 0
    }

    /// Total chunks in the region.
    #[inline]
    pub fn size(&self) -> usize {
        self.chunks
    }

    /// Chunks currently free.
    #[inline]
    pub fn remaining(&self) -> usize {
        self.free_chunks
    }

    /// Chunks currently held.
    #[inline]
    pub fn allocated(&self) -> usize {
        self.chunks - self.free_chunks
    }

    /// Take `pages` physically contiguous zeroed chunks.
    pub fn allocate(&mut self, pages: usize) -> Result<PageRef, PoolError> {
        if !self.is_initialized() {
            return Err(PoolError::Uninitialized);
        }
        if pages == 0 || pages > self.chunks {
            return Err(PoolError::OutOfMemory);
        }

        // First fit.
        let mut start = 0;
        while start + pages <= self.chunks {
            match (start..start + pages).find(|&i| self.used[i]) {
                Some(occupied) => start = occupied + 1,
                None => {
                    for i in start..start + pages {
                        self.used.set(i, true);
                    }
                    self.run_len[start] = pages as u32;
                    self.free_chunks -= pages;

                    let virt = self.virt_base + ((start as u64) << PAGE_SHIFT);
                    unsafe {
                        core::ptr::write_bytes(virt as *mut u8, 0, pages * PAGE_SIZE);
                    }
                    return Ok(PageRef {
                        virt,
                        phys: self.phys_base + ((start as u64) << PAGE_SHIFT),
                    });
                }
            }
        }
        Err(PoolError::OutOfMemory)
    }

    /// Release the whole run starting at `virt`.
    pub fn deallocate(&mut self, virt: u64) -> Result<(), PoolError> {
        let start = self.index_of_virt(virt)?;
        let len = self.run_len[start] as usize;
        if len == 0 {
            return if self.used[start] {
                Err(PoolError::NotRunStart)
            } else {
                Err(PoolError::DoubleFree)
            };
        }
        for i in start..start + len {
            self.used.set(i, false);
        }
        self.run_len[start] = 0;
        self.free_chunks += len;
        Ok(())
    }

    /// Release a single chunk by physical address. Used by the RPT
    /// auto-release walk, which frees a run one mapped leaf at a time.
    pub fn free_chunk(&mut self, phys: u64) -> Result<(), PoolError> {
        let idx = self.index_of_phys(phys)?;
        if !self.used[idx] {
            return Err(PoolError::DoubleFree);
        }
        self.used.set(idx, false);
        self.run_len[idx] = 0;
        self.free_chunks += 1;
        Ok(())
    }

    /// Length in pages of the run starting at `virt`, if one does.
    pub fn run_pages(&self, virt: u64) -> Result<usize, PoolError> {
        let start = self.index_of_virt(virt)?;
        match self.run_len[start] {
            0 => Err(PoolError::NotRunStart),
            n => Ok(n as usize),
        }
    }

    /// Translate a pool physical address to its microkernel virtual address.
    pub fn phys_to_virt(&self, phys: u64) -> Result<u64, PoolError> {
        let idx = self.index_of_phys(phys)?;
        let offset = phys & (PAGE_SIZE as u64 - 1);
        Ok(self.virt_base + ((idx as u64) << PAGE_SHIFT) + offset)
    }

    /// Translate a pool virtual address to its physical address.
    pub fn virt_to_phys(&self, virt: u64) -> Result<u64, PoolError> {
        let idx = self.index_of_virt(virt)?;
        Ok(self.phys_base + ((idx as u64) << PAGE_SHIFT))
    }

    /// True if `phys` lies inside the pool region.
    pub fn owns_phys(&self, phys: u64) -> bool {
        self.is_initialized()
            && phys >= self.phys_base
            && phys < self.phys_base + ((self.chunks as u64) << PAGE_SHIFT)
    }

    /// Render pool statistics into the debug ring.
    pub fn dump(&self) {
        diag::mklog_always!(
            "huge pool: {} chunks, {} allocated, {} free (base {:#x})",
            self.chunks,
            self.allocated(),
            self.remaining(),
            self.phys_base
        );
    }

    fn index_of_virt(&self, virt: u64) -> Result<usize, PoolError> {
        if !self.is_initialized() {
            return Err(PoolError::Uninitialized);
        }
        if virt % PAGE_SIZE as u64 != 0 {
            return Err(PoolError::Unaligned);
        }
        let end = self.virt_base + ((self.chunks as u64) << PAGE_SHIFT);
        if virt < self.virt_base || virt >= end {
            return Err(PoolError::OutOfRange);
        }
        Ok(((virt - self.virt_base) >> PAGE_SHIFT) as usize)
    }

    fn index_of_phys(&self, phys: u64) -> Result<usize, PoolError> {
        if !self.is_initialized() {
            return Err(PoolError::Uninitialized);
        }
        if !self.owns_phys(phys) {
            return Err(PoolError::OutOfRange);
        }
        Ok(((phys - self.phys_base) >> PAGE_SHIFT) as usize)
    }
}

impl Default for HugePool {
    fn default() -> Self {
        HugePool::new()
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runs_are_contiguous_and_restore_on_free() {
        let mut t = testutil::pool(16);
        let run = t.pool.allocate(4).unwrap();
        assert_eq!(t.pool.allocated(), 4);
        assert_eq!(t.pool.run_pages(run.virt).unwrap(), 4);
        // Physical contiguity is the whole point.
        assert_eq!(t.pool.virt_to_phys(run.virt + 0x3000).unwrap(), run.phys + 0x3000);
        t.pool.deallocate(run.virt).unwrap();
        assert_eq!(t.pool.allocated(), 0);
    }

    #[test]
    fn first_fit_reuses_the_gap() {
        let mut t = testutil::pool(8);
        let a = t.pool.allocate(2).unwrap();
        let b = t.pool.allocate(2).unwrap();
        let _c = t.pool.allocate(2).unwrap();
        t.pool.deallocate(a.virt).unwrap();
        // A two-chunk request lands back in the first gap.
        let d = t.pool.allocate(2).unwrap();
        assert_eq!(d.phys, a.phys);
        // A three-chunk request cannot use the two-chunk gap.
        t.pool.deallocate(b.virt).unwrap();
        let e = t.pool.allocate(3).unwrap();
        assert!(e.phys > d.phys);
    }

    #[test]
    fn freeing_mid_run_is_rejected() {
        let mut t = testutil::pool(8);
        let run = t.pool.allocate(3).unwrap();
        assert_eq!(
            t.pool.deallocate(run.virt + PAGE_SIZE as u64),
            Err(PoolError::NotRunStart)
        );
        t.pool.deallocate(run.virt).unwrap();
        assert_eq!(t.pool.deallocate(run.virt), Err(PoolError::DoubleFree));
    }

    #[test]
    fn chunkwise_release_drains_a_run() {
        let mut t = testutil::pool(8);
        let run = t.pool.allocate(3).unwrap();
        for i in 0..3 {
            t.pool.free_chunk(run.phys + (i << PAGE_SHIFT)).unwrap();
        }
        assert_eq!(t.pool.allocated(), 0);
        assert_eq!(
            t.pool.free_chunk(run.phys),
            Err(PoolError::DoubleFree)
        );
    }

    #[test]
    fn exhaustion_is_clean() {
        let mut t = testutil::pool(4);
        assert!(t.pool.allocate(5).is_err());
        let _a = t.pool.allocate(4).unwrap();
        assert_eq!(t.pool.allocate(1), Err(PoolError::OutOfMemory));
    }
}
