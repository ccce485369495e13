//! Architectural register and field encodings for VPS field I/O.
//!
//! `bf_vps_op_read_reg`/`write_reg` name fields with [`Reg`]; the sized
//! `read8/16/32/64` operations use the raw encoding value. Encodings are
//! stable ABI: renumbering any variant is a breaking change.

/// Access width of a field.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Width {
    W16,
    W32,
    W64,
}

macro_rules! registers {
    ($($(#[$meta:meta])* $name:ident = $enc:literal, $width:ident;)*) => {
        /// An architectural field of a virtual-processor state.
        #[derive(Clone, Copy, Debug, PartialEq, Eq)]
        #[repr(u16)]
        pub enum Reg {
            $($(#[$meta])* $name = $enc,)*
        }

        impl Reg {
            /// Decode a raw field encoding.
            pub const fn from_encoding(enc: u16) -> Option<Reg> {
                match enc {
                    $($enc => Some(Reg::$name),)*
                    _ => None,
                }
            }

            /// The raw field encoding.
            #[inline]
            pub const fn encoding(self) -> u16 {
                self as u16
            }

            /// The natural access width of this field.
            pub const fn width(self) -> Width {
                match self {
                    $(Reg::$name => Width::$width,)*
                }
            }
        }
    };
}

registers! {
    // General purpose.
    Rax = 0x000, W64;
    Rbx = 0x001, W64;
    Rcx = 0x002, W64;
    Rdx = 0x003, W64;
    Rbp = 0x004, W64;
    Rsi = 0x005, W64;
    Rdi = 0x006, W64;
    R8 = 0x007, W64;
    R9 = 0x008, W64;
    R10 = 0x009, W64;
    R11 = 0x00A, W64;
    R12 = 0x00B, W64;
    R13 = 0x00C, W64;
    R14 = 0x00D, W64;
    R15 = 0x00E, W64;
    Rip = 0x00F, W64;
    Rsp = 0x010, W64;
    Rflags = 0x011, W64;

    // Descriptor tables.
    GdtrBase = 0x020, W64;
    GdtrLimit = 0x021, W16;
    IdtrBase = 0x022, W64;
    IdtrLimit = 0x023, W16;

    // Segments: selector / base / limit / attributes per register.
    EsSelector = 0x030, W16;
    EsBase = 0x031, W64;
    EsLimit = 0x032, W32;
    EsAttrib = 0x033, W32;
    CsSelector = 0x034, W16;
    CsBase = 0x035, W64;
    CsLimit = 0x036, W32;
    CsAttrib = 0x037, W32;
    SsSelector = 0x038, W16;
    SsBase = 0x039, W64;
    SsLimit = 0x03A, W32;
    SsAttrib = 0x03B, W32;
    DsSelector = 0x03C, W16;
    DsBase = 0x03D, W64;
    DsLimit = 0x03E, W32;
    DsAttrib = 0x03F, W32;
    FsSelector = 0x040, W16;
    FsBase = 0x041, W64;
    FsLimit = 0x042, W32;
    FsAttrib = 0x043, W32;
    GsSelector = 0x044, W16;
    GsBase = 0x045, W64;
    GsLimit = 0x046, W32;
    GsAttrib = 0x047, W32;
    LdtrSelector = 0x048, W16;
    LdtrBase = 0x049, W64;
    LdtrLimit = 0x04A, W32;
    LdtrAttrib = 0x04B, W32;
    TrSelector = 0x04C, W16;
    TrBase = 0x04D, W64;
    TrLimit = 0x04E, W32;
    TrAttrib = 0x04F, W32;

    // Control registers.
    Cr0 = 0x060, W64;
    Cr2 = 0x061, W64;
    Cr3 = 0x062, W64;
    Cr4 = 0x063, W64;
    Dr7 = 0x064, W64;

    // Mirrored MSRs.
    Efer = 0x070, W64;
    Star = 0x071, W64;
    Lstar = 0x072, W64;
    Cstar = 0x073, W64;
    Fmask = 0x074, W64;
    KernelGsBase = 0x075, W64;
    SysenterCs = 0x076, W64;
    SysenterEsp = 0x077, W64;
    SysenterEip = 0x078, W64;
    Pat = 0x079, W64;
    Debugctl = 0x07A, W64;

    // Exit information (read-only from extensions).
    ExitReason = 0x090, W64;
    ExitQualification = 0x091, W64;
    ExitInterruptionInfo = 0x092, W64;
    ExitInstructionLength = 0x093, W64;
    ExitInstructionInfo = 0x094, W64;
}
