//! The shared debug ring.
//!
//! A fixed-size byte ring with 64-bit monotonic read/write cursors. The
//! microkernel writes; the host reads via the `GET_DRR` mailbox request.
//! Cursors never wrap in value (position is `cursor % SIZE`), so the
//! reader can detect how many bytes were lost while it was away.

use spin::Mutex;

/// Capacity of the ring in bytes.
pub const DEBUG_RING_SIZE: usize = 32 * 1024;

/// The ring itself. One per system, shared by every PP.
pub struct DebugRing {
    buf: [u8; DEBUG_RING_SIZE],
    /// Total bytes ever written.
    wcur: u64,
    /// Total bytes ever consumed by the host.
    rcur: u64,
}

impl DebugRing {
    pub const fn new() -> Self {
        DebugRing {
            buf: [0; DEBUG_RING_SIZE],
            wcur: 0,
            rcur: 0,
        }
    }

    /// Append bytes, silently overwriting the oldest on wrap.
    pub fn write(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.buf[(self.wcur % DEBUG_RING_SIZE as u64) as usize] = b;
            self.wcur += 1;
        }
    }

    /// Total bytes ever written.
    #[inline]
    pub fn write_cursor(&self) -> u64 {
        self.wcur
    }

    /// Bytes currently available to the reader.
    pub fn available(&self) -> usize {
        let backlog = self.wcur - self.rcur;
        core::cmp::min(backlog, DEBUG_RING_SIZE as u64) as usize
    }

    /// Copy unread bytes into `out`, oldest first, advancing the read
    /// cursor. Returns `(copied, lost)` where `lost` is how many bytes were
    /// overwritten before the reader arrived.
    pub fn drain(&mut self, out: &mut [u8]) -> (usize, u64) {
        let mut lost = 0;
        if self.wcur - self.rcur > DEBUG_RING_SIZE as u64 {
            let new_rcur = self.wcur - DEBUG_RING_SIZE as u64;
            lost = new_rcur - self.rcur;
            self.rcur = new_rcur;
        }

        let mut copied = 0;
        while self.rcur < self.wcur && copied < out.len() {
            out[copied] = self.buf[(self.rcur % DEBUG_RING_SIZE as u64) as usize];
            self.rcur += 1;
            copied += 1;
        }
        (copied, lost)
    }
}

/// The system-wide ring instance.
static DEBUG_RING: Mutex<DebugRing> = Mutex::new(DebugRing::new());

/// Append bytes to the system ring.
pub fn write(bytes: &[u8]) {
    DEBUG_RING.lock().write(bytes);
}

/// Drain the system ring into `out`; see [`DebugRing::drain`].
pub fn drain(out: &mut [u8]) -> (usize, u64) {
    DEBUG_RING.lock().drain(out)
}

/// Bytes currently unread in the system ring.
pub fn available() -> usize {
    DEBUG_RING.lock().available()
}
