//! x87 escape (D8-DF) classification.
//!
//! Every valid escape form is described by its effect on the
//! register stack, so the translator can adjust TOP and the tag
//! word inline around a helper call and the interpreter can apply
//! the same steps in the same order.

/// Memory access performed by an escape form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FpuMemAccess {
    Read,
    Write,
}

/// Stack effect of one escape instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FpuShape {
    /// TOP is decremented and the new ST(0) tagged valid before the operation.
    pub push: bool,
    /// Number of pops after the operation.
    pub pops: u8,
    pub memory: Option<FpuMemAccess>,
}

const fn plain() -> Option<FpuShape> {
    Some(FpuShape {
        push: false,
        pops: 0,
        memory: None,
    })
}

const fn pushes() -> Option<FpuShape> {
    Some(FpuShape {
        push: true,
        pops: 0,
        memory: None,
    })
}

const fn popping(pops: u8) -> Option<FpuShape> {
    Some(FpuShape {
        push: false,
        pops,
        memory: None,
    })
}

const fn mem(access: FpuMemAccess, push: bool, pops: u8) -> Option<FpuShape> {
    Some(FpuShape {
        push,
        pops,
        memory: Some(access),
    })
}

/// Classify escape opcode `esc` (0xD8..=0xDF) with ModR/M byte
/// `modrm`. Returns `None` for undefined forms.
pub fn shape(esc: u8, modrm: u8) -> Option<FpuShape> {
    use FpuMemAccess::{Read, Write};

    let reg = (modrm >> 3) & 7;
    let rm = modrm & 7;
    if modrm < 0xC0 {
        return match (esc, reg) {
            (0xD8 | 0xDA | 0xDC | 0xDE, 3) => mem(Read, false, 1),
            (0xD8 | 0xDA | 0xDC | 0xDE, _) => mem(Read, false, 0),
            (0xD9, 0) => mem(Read, true, 0),
            (0xD9, 2) => mem(Write, false, 0),
            (0xD9, 3) => mem(Write, false, 1),
            (0xD9, 4 | 5) => mem(Read, false, 0),
            (0xD9, 6 | 7) => mem(Write, false, 0),
            (0xDB, 0 | 5) => mem(Read, true, 0),
            (0xDB, 2) => mem(Write, false, 0),
            (0xDB, 3 | 7) => mem(Write, false, 1),
            (0xDD, 0) => mem(Read, true, 0),
            (0xDD, 2) => mem(Write, false, 0),
            (0xDD, 3) => mem(Write, false, 1),
            (0xDD, 4) => mem(Read, false, 0),
            (0xDD, 6 | 7) => mem(Write, false, 0),
            (0xDF, 0 | 4 | 5) => mem(Read, true, 0),
            (0xDF, 2) => mem(Write, false, 0),
            (0xDF, 3 | 6 | 7) => mem(Write, false, 1),
            _ => None,
        };
    }

    match esc {
        0xD8 | 0xDC if reg == 3 => popping(1),
        0xD8 | 0xDC => plain(),
        0xD9 => match (reg, rm) {
            (0, _) => pushes(),
            (1, _) => plain(),
            (2, 0) => plain(),
            (3, _) => popping(1),
            (4, 0 | 1 | 4 | 5) => plain(),
            (5, 0..=6) => pushes(),
            // FYL2X, FPATAN, FYL2XP1
            (6, 1 | 3) | (7, 1) => popping(1),
            // FPTAN, FXTRACT, FSINCOS
            (6, 2 | 4) | (7, 3) => pushes(),
            (6 | 7, _) => plain(),
            _ => None,
        },
        0xDA if modrm == 0xE9 => popping(2),
        0xDB if (0xE0..=0xE4).contains(&modrm) => plain(),
        0xDD => match reg {
            0 | 1 | 2 | 4 => plain(),
            3 | 5 => popping(1),
            _ => None,
        },
        0xDE => match reg {
            2 => None,
            3 if rm == 1 => popping(2),
            3 => None,
            _ => popping(1),
        },
        0xDF if modrm == 0xE0 => plain(),
        0xDF if reg == 0 => popping(1),
        _ => None,
    }
}

/// Arithmetic operation codes used by the register-form helpers,
/// in D8 `/r` order.
pub const FADD: u8 = 0;
pub const FMUL: u8 = 1;
pub const FCOM: u8 = 2;
pub const FCOMP: u8 = 3;
pub const FSUB: u8 = 4;
pub const FSUBR: u8 = 5;
pub const FDIV: u8 = 6;
pub const FDIVR: u8 = 7;

/// For the register forms of D8, DC and DE: the arithmetic
/// operation and whether ST(i) (rather than ST(0)) is the
/// destination. The operation is expressed as `dst = dst op src`.
pub fn arith_form(esc: u8, modrm: u8) -> Option<(u8, bool)> {
    if modrm < 0xC0 {
        return None;
    }
    let reg = (modrm >> 3) & 7;
    let rm = modrm & 7;
    match esc {
        0xD8 => Some((reg, false)),
        0xDC => Some(reversed_form(reg)),
        0xDE => match reg {
            2 => None,
            3 if rm == 1 => Some((FCOMP, false)),
            3 => None,
            _ => Some(reversed_form(reg)),
        },
        _ => None,
    }
}

/// DC/DE encode SUB/SUBR and DIV/DIVR swapped relative to D8
/// when ST(i) is the destination.
fn reversed_form(reg: u8) -> (u8, bool) {
    match reg {
        FCOM | FCOMP => (reg, false),
        FSUB => (FSUBR, true),
        FSUBR => (FSUB, true),
        FDIV => (FDIVR, true),
        FDIVR => (FDIV, true),
        _ => (reg, true),
    }
}
