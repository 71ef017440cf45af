//! Integer ALU with x86 flag semantics.
//!
//! Every operation returns its result together with the flag bits
//! it produced and the mask of flags it architecturally defines.
//! Callers merge only the defined bits, so flags the hardware
//! leaves undefined keep their previous value.

use dynx86_core::flags::parity;
use dynx86_core::{AluOp, Eflags, ShiftOp, Width};

/// Flag bits produced by an operation and the bits to merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlagsOut {
    pub value: u32,
    pub mask: u32,
}

impl FlagsOut {
    pub const NONE: FlagsOut = FlagsOut { value: 0, mask: 0 };

    #[inline]
    pub fn new(value: u32, mask: u32) -> Self {
        Self { value, mask }
    }

    /// Restrict the merge to `mask`.
    #[inline]
    pub fn only(self, mask: u32) -> Self {
        Self {
            value: self.value,
            mask: self.mask & mask,
        }
    }
}

#[inline]
fn bit(cond: bool, flag: Eflags) -> u32 {
    if cond {
        flag.bits()
    } else {
        0
    }
}

/// SF, ZF and PF of a `width` result.
#[inline]
pub fn szp(width: Width, res: u32) -> u32 {
    let res = res & width.mask();
    bit(res & width.sign_bit() != 0, Eflags::SF)
        | bit(res == 0, Eflags::ZF)
        | bit(parity(res), Eflags::PF)
}

pub fn add(width: Width, a: u32, b: u32, carry: bool) -> (u32, u32) {
    let m = width.mask();
    let (a, b) = (a & m, b & m);
    let wide = a as u64 + b as u64 + carry as u64;
    let r = wide as u32 & m;
    let flags = szp(width, r)
        | bit(wide > m as u64, Eflags::CF)
        | bit((a ^ b ^ r) & 0x10 != 0, Eflags::AF)
        | bit((a ^ r) & (b ^ r) & width.sign_bit() != 0, Eflags::OF);
    (r, flags)
}

pub fn sub(width: Width, a: u32, b: u32, borrow: bool) -> (u32, u32) {
    let m = width.mask();
    let (a, b) = (a & m, b & m);
    let r = a.wrapping_sub(b).wrapping_sub(borrow as u32) & m;
    let flags = szp(width, r)
        | bit((a as u64) < b as u64 + borrow as u64, Eflags::CF)
        | bit((a ^ b ^ r) & 0x10 != 0, Eflags::AF)
        | bit((a ^ b) & (a ^ r) & width.sign_bit() != 0, Eflags::OF);
    (r, flags)
}

/// Two-operand ALU group. For CMP the returned result is the
/// difference, which the caller discards.
pub fn alu(op: AluOp, width: Width, a: u32, b: u32, cf: bool) -> (u32, FlagsOut) {
    let m = width.mask();
    let (r, flags) = match op {
        AluOp::Add => add(width, a, b, false),
        AluOp::Adc => add(width, a, b, cf),
        AluOp::Sub | AluOp::Cmp => sub(width, a, b, false),
        AluOp::Sbb => sub(width, a, b, cf),
        AluOp::And => logic(width, a & b & m),
        AluOp::Or => logic(width, (a | b) & m),
        AluOp::Xor => logic(width, (a ^ b) & m),
    };
    (r, FlagsOut::new(flags, op.defined_flags()))
}

/// Result of a logic operation: CF = OF = 0.
#[inline]
pub fn logic(width: Width, r: u32) -> (u32, u32) {
    (r, szp(width, r))
}

/// Flags of TEST.
pub fn test(width: Width, a: u32, b: u32) -> FlagsOut {
    FlagsOut::new(szp(width, a & b), Eflags::LOGIC_DEFINED)
}

pub fn inc(width: Width, a: u32) -> (u32, FlagsOut) {
    let (r, f) = add(width, a, 1, false);
    (r, FlagsOut::new(f, Eflags::INCDEC_DEFINED))
}

pub fn dec(width: Width, a: u32) -> (u32, FlagsOut) {
    let (r, f) = sub(width, a, 1, false);
    (r, FlagsOut::new(f, Eflags::INCDEC_DEFINED))
}

pub fn neg(width: Width, a: u32) -> (u32, FlagsOut) {
    let (r, f) = sub(width, 0, a, false);
    (r, FlagsOut::new(f, Eflags::ARITH.bits()))
}

/// Shift or rotate `a` by `count`, which the caller has already
/// masked to five bits. Returns `None` for a zero count, which
/// leaves both the operand and the flags untouched.
pub fn shift(op: ShiftOp, width: Width, a: u32, count: u32, cf: bool) -> Option<(u32, FlagsOut)> {
    if count == 0 {
        return None;
    }
    let bits = width.bits();
    let m = width.mask();
    let sign = width.sign_bit();
    let a = a & m;
    let msb = |v: u32| v & sign != 0;

    let (r, carry, of) = match op {
        ShiftOp::Shl => {
            let r = ((a as u64) << count) as u32 & m;
            let carry = count <= bits && (a >> (bits - count)) & 1 != 0;
            (r, carry, msb(r) != carry)
        }
        ShiftOp::Shr => {
            let r = a >> count;
            let carry = (a >> (count - 1)) & 1 != 0;
            (r, carry, msb(a))
        }
        ShiftOp::Sar => {
            let sa = width.sign_extend(a) as i32;
            let r = (sa >> count.min(31)) as u32 & m;
            let carry = (sa >> (count - 1).min(31)) & 1 != 0;
            (r, carry, false)
        }
        ShiftOp::Rol => {
            let c = count % bits;
            let r = if c == 0 {
                a
            } else {
                ((a << c) | (a >> (bits - c))) & m
            };
            let carry = r & 1 != 0;
            (r, carry, msb(r) != carry)
        }
        ShiftOp::Ror => {
            let c = count % bits;
            let r = if c == 0 {
                a
            } else {
                ((a >> c) | (a << (bits - c))) & m
            };
            let carry = msb(r);
            (r, carry, msb(r) != (r & (sign >> 1) != 0))
        }
        ShiftOp::Rcl => {
            let span = bits + 1;
            let c = count % span;
            let v = ((cf as u64) << bits) | a as u64;
            let rot = if c == 0 {
                v
            } else {
                ((v << c) | (v >> (span - c))) & ((1u64 << span) - 1)
            };
            let r = rot as u32 & m;
            let carry = (rot >> bits) & 1 != 0;
            (r, carry, msb(r) != carry)
        }
        ShiftOp::Rcr => {
            let span = bits + 1;
            let c = count % span;
            let v = ((cf as u64) << bits) | a as u64;
            let rot = if c == 0 {
                v
            } else {
                ((v >> c) | (v << (span - c))) & ((1u64 << span) - 1)
            };
            let r = rot as u32 & m;
            let carry = (rot >> bits) & 1 != 0;
            (r, carry, msb(a) != cf)
        }
    };

    let mut value = bit(carry, Eflags::CF) | bit(of, Eflags::OF);
    if !op.is_rotate() {
        value |= szp(width, r);
    }
    Some((r, FlagsOut::new(value, op.defined_flags(width, count))))
}

/// SHLD/SHRD: shift `dst` by `count` (masked to five bits), filling
/// from `src`. 16-bit counts above 16 shift through the 32-bit
/// concatenation of `dst:src`.
pub fn double_shift(left: bool, width: Width, dst: u32, src: u32, count: u32) -> Option<(u32, FlagsOut)> {
    if count == 0 {
        return None;
    }
    let bits = width.bits();
    let m = width.mask();
    let (dst, src) = (dst & m, src & m);
    let (r, carry) = if width == Width::B32 {
        if left {
            let wide = ((dst as u64) << 32) | src as u64;
            ((wide << count >> 32) as u32, (dst >> (32 - count)) & 1 != 0)
        } else {
            let wide = ((src as u64) << 32) | dst as u64;
            ((wide >> count) as u32, (dst >> (count - 1)) & 1 != 0)
        }
    } else {
        // dst:src:dst as a 48-bit pattern covers counts up to 31.
        let pattern = ((dst as u128) << 32) | ((src as u128) << 16) | dst as u128;
        if left {
            let shifted = pattern << count;
            ((shifted >> 32) as u32 & m, (pattern >> (48 - count)) & 1 != 0)
        } else {
            ((pattern >> count) as u32 & m, (pattern >> (count - 1)) & 1 != 0)
        }
    };
    let sign = width.sign_bit();
    let of = (r ^ dst) & sign != 0;
    let mut mask = Eflags::SZP | Eflags::CF.bits();
    if count == 1 {
        mask |= Eflags::OF.bits();
    }
    if count > bits {
        mask = Eflags::SZP;
    }
    let value = szp(width, r) | bit(carry, Eflags::CF) | bit(of, Eflags::OF);
    Some((r, FlagsOut::new(value, mask)))
}

/// CF/OF after a multiply: set when the high half is significant.
pub fn mul_flags(overflow: bool) -> FlagsOut {
    FlagsOut::new(
        bit(overflow, Eflags::CF) | bit(overflow, Eflags::OF),
        Eflags::CF.bits() | Eflags::OF.bits(),
    )
}
