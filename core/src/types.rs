use crate::flags::Eflags;

/// Operand width of a guest operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Width {
    B8 = 0,
    B16 = 1,
    B32 = 2,
}

impl Width {
    /// Full-size width selected by the operand-size attribute.
    #[inline]
    pub const fn full(op32: bool) -> Self {
        if op32 {
            Width::B32
        } else {
            Width::B16
        }
    }

    pub const fn bits(self) -> u32 {
        match self {
            Width::B8 => 8,
            Width::B16 => 16,
            Width::B32 => 32,
        }
    }

    pub const fn bytes(self) -> u32 {
        self.bits() / 8
    }

    pub const fn mask(self) -> u32 {
        match self {
            Width::B8 => 0xFF,
            Width::B16 => 0xFFFF,
            Width::B32 => 0xFFFF_FFFF,
        }
    }

    pub const fn sign_bit(self) -> u32 {
        1 << (self.bits() - 1)
    }

    /// Sign-extend the low `bits()` of `val` to 32 bits.
    #[inline]
    pub const fn sign_extend(self, val: u32) -> u32 {
        match self {
            Width::B8 => val as u8 as i8 as i32 as u32,
            Width::B16 => val as u16 as i16 as i32 as u32,
            Width::B32 => val,
        }
    }
}

/// Two-operand ALU operations in x86 encoding order
/// (the `/r` field of 0x80/0x81/0x83).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum AluOp {
    Add = 0,
    Or = 1,
    Adc = 2,
    Sbb = 3,
    And = 4,
    Sub = 5,
    Xor = 6,
    Cmp = 7,
}

impl AluOp {
    pub const fn from_index(idx: u8) -> Self {
        match idx & 7 {
            0 => AluOp::Add,
            1 => AluOp::Or,
            2 => AluOp::Adc,
            3 => AluOp::Sbb,
            4 => AluOp::And,
            5 => AluOp::Sub,
            6 => AluOp::Xor,
            _ => AluOp::Cmp,
        }
    }

    /// Whether the result is written back to the destination.
    pub const fn writes_result(self) -> bool {
        !matches!(self, AluOp::Cmp)
    }

    /// Whether the operation consumes the incoming carry flag.
    pub const fn uses_carry(self) -> bool {
        matches!(self, AluOp::Adc | AluOp::Sbb)
    }

    /// EFLAGS bits whose value is architecturally defined after
    /// this operation. AF is undefined for the logic group.
    pub const fn defined_flags(self) -> u32 {
        match self {
            AluOp::Or | AluOp::And | AluOp::Xor => Eflags::LOGIC_DEFINED,
            _ => Eflags::ARITH.bits(),
        }
    }
}

/// Shift/rotate operations in x86 encoding order (the `/r` field
/// of group 2). `/6` is an alias of SHL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ShiftOp {
    Rol = 0,
    Ror = 1,
    Rcl = 2,
    Rcr = 3,
    Shl = 4,
    Shr = 5,
    Sar = 7,
}

impl ShiftOp {
    pub const fn from_index(idx: u8) -> Self {
        match idx & 7 {
            0 => ShiftOp::Rol,
            1 => ShiftOp::Ror,
            2 => ShiftOp::Rcl,
            3 => ShiftOp::Rcr,
            4 | 6 => ShiftOp::Shl,
            5 => ShiftOp::Shr,
            _ => ShiftOp::Sar,
        }
    }

    pub const fn is_rotate(self) -> bool {
        matches!(self, ShiftOp::Rol | ShiftOp::Ror | ShiftOp::Rcl | ShiftOp::Rcr)
    }

    /// EFLAGS bits defined after shifting a `width` operand by the
    /// already-masked, non-zero `count`.
    ///
    /// OF is only defined for single-bit shifts, AF never, and CF of
    /// SHL/SHR only while the count stays below the operand width.
    pub const fn defined_flags(self, width: Width, count: u32) -> u32 {
        let of = if count == 1 { Eflags::OF.bits() } else { 0 };
        match self {
            ShiftOp::Rol | ShiftOp::Ror | ShiftOp::Rcl | ShiftOp::Rcr => Eflags::CF.bits() | of,
            ShiftOp::Shl | ShiftOp::Shr => {
                let cf = if count < width.bits() { Eflags::CF.bits() } else { 0 };
                Eflags::SZP | cf | of
            }
            ShiftOp::Sar => Eflags::SZP | Eflags::CF.bits() | of,
        }
    }
}

/// x86 condition codes (low nibble of Jcc/SETcc).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Cond {
    O = 0x0,
    No = 0x1,
    B = 0x2,
    Ae = 0x3,
    E = 0x4,
    Ne = 0x5,
    Be = 0x6,
    A = 0x7,
    S = 0x8,
    Ns = 0x9,
    P = 0xA,
    Np = 0xB,
    L = 0xC,
    Ge = 0xD,
    Le = 0xE,
    G = 0xF,
}

impl Cond {
    pub const fn from_index(idx: u8) -> Self {
        match idx & 0xF {
            0x0 => Cond::O,
            0x1 => Cond::No,
            0x2 => Cond::B,
            0x3 => Cond::Ae,
            0x4 => Cond::E,
            0x5 => Cond::Ne,
            0x6 => Cond::Be,
            0x7 => Cond::A,
            0x8 => Cond::S,
            0x9 => Cond::Ns,
            0xA => Cond::P,
            0xB => Cond::Np,
            0xC => Cond::L,
            0xD => Cond::Ge,
            0xE => Cond::Le,
            _ => Cond::G,
        }
    }

    /// Evaluate the condition against a guest EFLAGS value.
    pub fn eval(self, eflags: u32) -> bool {
        let f = Eflags::from_bits_retain(eflags);
        let cf = f.contains(Eflags::CF);
        let zf = f.contains(Eflags::ZF);
        let sf = f.contains(Eflags::SF);
        let of = f.contains(Eflags::OF);
        let pf = f.contains(Eflags::PF);
        let base = match (self as u8) >> 1 {
            0 => of,
            1 => cf,
            2 => zf,
            3 => cf || zf,
            4 => sf,
            5 => pf,
            6 => sf != of,
            _ => zf || (sf != of),
        };
        if (self as u8) & 1 != 0 {
            !base
        } else {
            base
        }
    }
}
