use bitflags::bitflags;

bitflags! {
    /// Guest EFLAGS register.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Eflags: u32 {
        const CF = 1 << 0;
        const FIXED1 = 1 << 1;
        const PF = 1 << 2;
        const AF = 1 << 4;
        const ZF = 1 << 6;
        const SF = 1 << 7;
        const TF = 1 << 8;
        const IF = 1 << 9;
        const DF = 1 << 10;
        const OF = 1 << 11;
        const IOPL = 3 << 12;
        const NT = 1 << 14;
        const RF = 1 << 16;
        const VM = 1 << 17;

        /// Status flags written by arithmetic instructions.
        const ARITH = Self::CF.bits()
            | Self::PF.bits()
            | Self::AF.bits()
            | Self::ZF.bits()
            | Self::SF.bits()
            | Self::OF.bits();
    }
}

impl Eflags {
    /// SF | ZF | PF.
    pub const SZP: u32 = Self::SF.bits() | Self::ZF.bits() | Self::PF.bits();

    /// Flags defined after AND/OR/XOR/TEST (AF is left untouched).
    pub const LOGIC_DEFINED: u32 = Self::ARITH.bits() & !Self::AF.bits();

    /// Flags defined after INC/DEC (CF is preserved).
    pub const INCDEC_DEFINED: u32 = Self::ARITH.bits() & !Self::CF.bits();

    /// Bits POPF/IRET may change in real mode and at CPL 0.
    pub const WRITABLE: u32 = Self::ARITH.bits()
        | Self::TF.bits()
        | Self::IF.bits()
        | Self::DF.bits()
        | Self::IOPL.bits()
        | Self::NT.bits();

    /// Value of EFLAGS after reset.
    pub const RESET: u32 = Self::FIXED1.bits();

    /// Current I/O privilege level.
    #[inline]
    pub const fn iopl(bits: u32) -> u8 {
        ((bits >> 12) & 3) as u8
    }
}

/// Even parity of the low byte, as reported by PF.
#[inline]
pub const fn parity(val: u32) -> bool {
    (val as u8).count_ones() % 2 == 0
}
