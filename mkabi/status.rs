//! Syscall status codes.
//!
//! Statuses are 64-bit values returned in RAX and mirrored into the TLS
//! return slot. The value is structured so a failed status can never be
//! mistaken for data:
//!
//! ```text
//! [63:48] 0xDEAD   signature (zero only for SUCCESS)
//! [47:16] flags    which argument / resource was at fault
//! [15:0]  kind     1 = failure, 2 = permission, 3 = invalid params
//! ```

use core::fmt;

/// A syscall status word.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct SysStatus(u64);

impl SysStatus {
    /// The operation completed.
    pub const SUCCESS: SysStatus = SysStatus(0);

    // ---- kind 1: failures -------------------------------------------------

    /// The operation failed for an unenumerated reason.
    pub const FAILURE_UNKNOWN: SysStatus = SysStatus(0xDEAD_0000_0001_0001);
    /// The opcode names an operation this build does not implement.
    pub const FAILURE_UNSUPPORTED: SysStatus = SysStatus(0xDEAD_0000_0002_0001);
    /// REG0 did not carry the caller's open handle.
    pub const FAILURE_INVALID_HANDLE: SysStatus = SysStatus(0xDEAD_0000_0004_0001);
    /// A pool had no free slot or frame left.
    pub const FAILURE_OUT_OF_MEMORY: SysStatus = SysStatus(0xDEAD_0000_0008_0001);

    // ---- kind 2: permission -----------------------------------------------

    /// The calling extension is not allowed to perform this operation.
    pub const PERM_DENIED: SysStatus = SysStatus(0xDEAD_0000_0001_0002);
    /// The operation requires a registration (e.g. a VMExit handler) the
    /// calling extension has not made.
    pub const PERM_EXT: SysStatus = SysStatus(0xDEAD_0000_0002_0002);

    // ---- kind 3: invalid parameters ---------------------------------------

    /// REG0 is invalid.
    pub const INVALID_PARAMS0: SysStatus = SysStatus(0xDEAD_0000_0001_0003);
    /// REG1 is invalid.
    pub const INVALID_PARAMS1: SysStatus = SysStatus(0xDEAD_0000_0002_0003);
    /// REG2 is invalid.
    pub const INVALID_PARAMS2: SysStatus = SysStatus(0xDEAD_0000_0004_0003);
    /// REG3 is invalid.
    pub const INVALID_PARAMS3: SysStatus = SysStatus(0xDEAD_0000_0008_0003);
    /// REG4 is invalid.
    pub const INVALID_PARAMS4: SysStatus = SysStatus(0xDEAD_0000_0010_0003);
    /// REG5 is invalid.
    pub const INVALID_PARAMS5: SysStatus = SysStatus(0xDEAD_0000_0020_0003);

    /// The raw status word.
    #[inline]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// True if this is [`SysStatus::SUCCESS`].
    #[inline]
    pub const fn is_success(self) -> bool {
        self.0 == 0
    }

    /// Rebuild from a raw status word.
    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        SysStatus(raw)
    }
}

impl fmt::Debug for SysStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match *self {
            SysStatus::SUCCESS => "SUCCESS",
            SysStatus::FAILURE_UNKNOWN => "FAILURE_UNKNOWN",
            SysStatus::FAILURE_UNSUPPORTED => "FAILURE_UNSUPPORTED",
            SysStatus::FAILURE_INVALID_HANDLE => "FAILURE_INVALID_HANDLE",
            SysStatus::FAILURE_OUT_OF_MEMORY => "FAILURE_OUT_OF_MEMORY",
            SysStatus::PERM_DENIED => "PERM_DENIED",
            SysStatus::PERM_EXT => "PERM_EXT",
            SysStatus::INVALID_PARAMS0 => "INVALID_PARAMS0",
            SysStatus::INVALID_PARAMS1 => "INVALID_PARAMS1",
            SysStatus::INVALID_PARAMS2 => "INVALID_PARAMS2",
            SysStatus::INVALID_PARAMS3 => "INVALID_PARAMS3",
            SysStatus::INVALID_PARAMS4 => "INVALID_PARAMS4",
            SysStatus::INVALID_PARAMS5 => "INVALID_PARAMS5",
            _ => return write!(f, "SysStatus({:#018x})", self.0),
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_is_zero() {
        assert!(SysStatus::SUCCESS.is_success());
        assert_eq!(SysStatus::SUCCESS.get(), 0);
        assert!(!SysStatus::FAILURE_UNKNOWN.is_success());
    }

    #[test]
    fn failures_carry_the_signature() {
        for s in [
            SysStatus::FAILURE_UNKNOWN,
            SysStatus::FAILURE_UNSUPPORTED,
            SysStatus::FAILURE_INVALID_HANDLE,
            SysStatus::FAILURE_OUT_OF_MEMORY,
            SysStatus::PERM_DENIED,
            SysStatus::PERM_EXT,
            SysStatus::INVALID_PARAMS1,
        ] {
            assert_eq!(s.get() >> 48, 0xDEAD);
        }
    }
}
