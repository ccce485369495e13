//! Per-PP VMExit log.
//!
//! Each PP owns a fixed ring of [`VmExitRecord`]s. Only the owning PP ever
//! writes its ring (single producer, no lock on the write path); dumps from
//! other PPs are debug-only racy reads, which is acceptable for a
//! diagnostic surface.
//!
//! Storage is heap-allocated on first touch rather than held in a static:
//! `MAX_PPS` rings of [`VMEXIT_LOG_SIZE`] records would otherwise sit in
//! `.bss` for machines that never dump a single exit.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::cell::UnsafeCell;
use mkabi::layout::MAX_PPS;
use mkabi::ThreadTag;
use spin::Once;

/// Records kept per PP.
pub const VMEXIT_LOG_SIZE: usize = 32;

/// One logged VMExit.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VmExitRecord {
    /// The thread tag at the time of the exit.
    pub tag: u64,
    pub vmid: u16,
    pub vpid: u16,
    pub vpsid: u16,
    pub exit_reason: u64,
    pub rip: u64,
    /// Qualification, interruption info, instruction length.
    pub exit_info: [u64; 3],
    /// rax..r15 in encoding order.
    pub gprs: [u64; 16],
}

impl VmExitRecord {
    pub const fn zeroed() -> Self {
        VmExitRecord {
            tag: 0,
            vmid: 0,
            vpid: 0,
            vpsid: 0,
            exit_reason: 0,
            rip: 0,
            exit_info: [0; 3],
            gprs: [0; 16],
        }
    }
}

struct PpLog {
    records: [VmExitRecord; VMEXIT_LOG_SIZE],
    /// Next slot to write; wraps.
    next: usize,
    /// Total records ever written.
    total: u64,
}

impl PpLog {
    fn new() -> Self {
        PpLog {
            records: [VmExitRecord::zeroed(); VMEXIT_LOG_SIZE],
            next: 0,
            total: 0,
        }
    }

    fn push(&mut self, rec: VmExitRecord) {
        self.records[self.next] = rec;
        self.next = (self.next + 1) % VMEXIT_LOG_SIZE;
        self.total += 1;
    }

    fn snapshot(&self) -> Vec<VmExitRecord> {
        let count = core::cmp::min(self.total, VMEXIT_LOG_SIZE as u64) as usize;
        let start = if self.total <= VMEXIT_LOG_SIZE as u64 {
            0
        } else {
            self.next
        };
        (0..count)
            .map(|i| self.records[(start + i) % VMEXIT_LOG_SIZE])
            .collect()
    }
}

struct Logs(UnsafeCell<Box<[PpLog]>>);

// Safety: each PP writes only its own slot; cross-slot reads are debug-only
// and tolerate tearing.
unsafe impl Sync for Logs {}

static LOGS: Once<Logs> = Once::new();

fn logs() -> &'static Logs {
    LOGS.call_once(|| {
        let mut v = Vec::with_capacity(MAX_PPS);
        v.resize_with(MAX_PPS, PpLog::new);
        Logs(UnsafeCell::new(v.into_boxed_slice()))
    })
}

/// Append a record to `pp`'s ring. Must only be called from `pp` itself.
pub fn push(pp: usize, tag: ThreadTag, rec: VmExitRecord) {
    if pp >= MAX_PPS {
        return;
    }
    let mut rec = rec;
    rec.tag = tag.packed();
    // Safety: single producer per slot (this PP).
    unsafe { (&mut (*logs().0.get())[pp]).push(rec) }
}

/// Chronological copy of `pp`'s ring, oldest first.
pub fn snapshot(pp: usize) -> Vec<VmExitRecord> {
    if pp >= MAX_PPS {
        return Vec::new();
    }
    // Safety: read-only; tearing tolerated on this debug surface.
    unsafe { (&(*logs().0.get())[pp]).snapshot() }
}

/// Total exits ever logged on `pp`.
pub fn total(pp: usize) -> u64 {
    if pp >= MAX_PPS {
        return 0;
    }
    unsafe { (&(*logs().0.get())[pp]).total }
}

/// Render `pp`'s ring into the debug ring for `bf_debug_op_dump_vmexit_log`.
pub fn dump(pp: usize) {
    let records = snapshot(pp);
    crate::mklog_always!("vmexit log [pp {:#06x}]: {} records", pp, records.len());
    for (i, r) in records.iter().enumerate() {
        crate::mklog_always!(
            "  [{:02}] vm={:#06x} vp={:#06x} vps={:#06x} reason={:#x} rip={:#018x} qual={:#x}",
            i,
            r.vmid,
            r.vpid,
            r.vpsid,
            r.exit_reason,
            r.rip,
            r.exit_info[0],
        );
    }
}
