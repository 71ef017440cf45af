//! Opcode tables.

use crate::{fpu, ModRm, OpFamily};

/// Immediate operand encodings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Imm {
    None,
    /// imm8, zero-extended.
    Ib,
    /// imm8, sign-extended.
    Ibs,
    Iw,
    /// imm16 or imm32 by operand size.
    Iz,
    /// rel8.
    Jb,
    /// rel16 or rel32 by operand size.
    Jz,
    /// ENTER: imm16 frame size, imm8 nesting level.
    IwIb,
    /// Far pointer: offset then selector.
    Ap,
    /// Memory offset sized by address size (MOV moffs).
    Ob,
    /// F6/F7: an immediate only for the TEST forms.
    Group3,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Entry {
    pub family: OpFamily,
    pub modrm: bool,
    pub imm: Imm,
}

const fn e(family: OpFamily, modrm: bool, imm: Imm) -> Option<Entry> {
    Some(Entry { family, modrm, imm })
}

pub(crate) fn one_byte(op: u8) -> Option<Entry> {
    use Imm::*;
    use OpFamily::*;
    match op {
        // ALU group: Eb,Gb / Ev,Gv / Gb,Eb / Gv,Ev / AL,Ib / eAX,Iz
        0x00..=0x3F if op & 7 < 4 => e(Alu, true, None),
        0x00..=0x3F if op & 7 == 4 => e(Alu, false, Ib),
        0x00..=0x3F if op & 7 == 5 => e(Alu, false, Iz),
        0x06 | 0x0E | 0x16 | 0x1E => e(Push, false, None),
        0x07 | 0x17 | 0x1F => e(MovSeg, false, None),
        0x27 | 0x2F | 0x37 | 0x3F => e(Bcd, false, None),
        0x40..=0x4F => e(IncDec, false, None),
        0x50..=0x57 => e(Push, false, None),
        0x58..=0x5F => e(Pop, false, None),
        0x60 | 0x61 => e(Stack, false, None),
        0x62 => e(Interrupt, true, None),
        0x68 => e(Push, false, Iz),
        0x69 => e(Misc, true, Iz),
        0x6A => e(Push, false, Ibs),
        0x6B => e(Misc, true, Ibs),
        0x6C..=0x6F => e(String, false, None),
        0x70..=0x7F => e(Jcc, false, Jb),
        0x80 | 0x82 => e(Alu, true, Ib),
        0x81 => e(Alu, true, Iz),
        0x83 => e(Alu, true, Ibs),
        0x84 | 0x85 => e(Alu, true, None),
        0x86 | 0x87 => e(Xchg, true, None),
        0x88..=0x8B => e(Mov, true, None),
        0x8C | 0x8E => e(MovSeg, true, None),
        0x8D => e(Lea, true, None),
        0x8F => e(Pop, true, None),
        0x90 | 0x9B => e(Nop, false, None),
        0x91..=0x97 => e(Xchg, false, None),
        0x98 | 0x99 => e(Convert, false, None),
        0x9A => e(FarControl, false, Ap),
        0x9C | 0x9D => e(Stack, false, None),
        0x9E | 0x9F => e(FlagOp, false, None),
        0xA0..=0xA3 => e(Mov, false, Ob),
        0xA4..=0xA7 | 0xAA..=0xAF => e(String, false, None),
        0xA8 => e(Alu, false, Ib),
        0xA9 => e(Alu, false, Iz),
        0xB0..=0xB7 => e(Mov, false, Ib),
        0xB8..=0xBF => e(Mov, false, Iz),
        0xC0 | 0xC1 => e(Shift, true, Ib),
        0xC2 => e(RetNear, false, Iw),
        0xC3 => e(RetNear, false, None),
        0xC4 | 0xC5 => e(MovSeg, true, None),
        0xC6 => e(Mov, true, Ib),
        0xC7 => e(Mov, true, Iz),
        0xC8 => e(Stack, false, IwIb),
        0xC9 => e(Stack, false, None),
        0xCA => e(FarControl, false, Iw),
        0xCB => e(FarControl, false, None),
        0xCC | 0xCE | 0xCF => e(Interrupt, false, None),
        0xCD => e(Interrupt, false, Ib),
        0xD0..=0xD3 => e(Shift, true, None),
        0xD4 | 0xD5 => e(Bcd, false, Ib),
        0xD6 | 0xD7 => e(Misc, false, None),
        0xD8..=0xDF => e(Fpu, true, None),
        0xE0..=0xE3 => e(Loop, false, Jb),
        0xE4..=0xE7 => e(Io, false, Ib),
        0xE8 => e(CallNear, false, Jz),
        0xE9 => e(JmpNear, false, Jz),
        0xEA => e(FarControl, false, Ap),
        0xEB => e(JmpNear, false, Jb),
        0xEC..=0xEF => e(Io, false, None),
        0xF4 => e(System, false, None),
        0xF5 | 0xF8..=0xFD => e(FlagOp, false, None),
        0xF6 | 0xF7 => e(Unary, true, Group3),
        0xFE => e(IncDec, true, None),
        0xFF => e(Group5, true, None),
        _ => Option::None,
    }
}

pub(crate) fn two_byte(op: u8) -> Option<Entry> {
    use Imm::*;
    use OpFamily::*;
    match op {
        0x01 | 0x20 | 0x22 => e(System, true, None),
        0x06 => e(System, false, None),
        0x80..=0x8F => e(Jcc, false, Jz),
        0x90..=0x9F => e(SetCc, true, None),
        0xA0 | 0xA8 => e(Push, false, None),
        0xA1 | 0xA9 => e(MovSeg, false, None),
        0xA3 | 0xAB | 0xB3 | 0xBB | 0xBC | 0xBD => e(Bit, true, None),
        0xBA => e(Bit, true, Ib),
        0xA4 | 0xAC => e(Shift, true, Ib),
        0xA5 | 0xAD => e(Shift, true, None),
        0xAF => e(Misc, true, None),
        0xB2 | 0xB4 | 0xB5 => e(MovSeg, true, None),
        0xB6 | 0xB7 | 0xBE | 0xBF => e(MovExt, true, None),
        0xC8..=0xCF => e(Misc, false, None),
        _ => Option::None,
    }
}

/// Reject encodings whose ModR/M form is undefined.
pub(crate) fn form_valid(opcode: u16, modrm: Option<ModRm>) -> bool {
    let Some(m) = modrm else {
        return true;
    };
    let mem_only = !m.is_reg();
    match opcode {
        // LEA, BOUND, LES/LDS, LSS/LFS/LGS need a memory operand.
        0x62 | 0x8D | 0xC4 | 0xC5 | 0x1B2 | 0x1B4 | 0x1B5 => mem_only,
        0x8C => m.reg < 6,
        // MOV CS, r/m is undefined.
        0x8E => m.reg < 6 && m.reg != 1,
        0x8F | 0xC6 | 0xC7 => m.reg == 0,
        0xFE => m.reg < 2,
        0xFF => match m.reg {
            3 | 5 => mem_only,
            7 => false,
            _ => true,
        },
        0x101 => match m.reg {
            0..=3 => mem_only,
            4 | 6 => true,
            _ => false,
        },
        0x120 | 0x122 => matches!(m.reg, 0 | 2 | 3),
        0x1BA => m.reg >= 4,
        0xD8..=0xDF => fpu::shape(opcode as u8, m.byte()).is_some(),
        _ => true,
    }
}

/// Instructions that fault with #GP(0) outside ring 0.
pub(crate) fn is_privileged(opcode: u16, modrm: Option<ModRm>) -> bool {
    match opcode {
        0xF4 | 0x106 | 0x120 | 0x122 => true,
        0x101 => matches!(modrm.map(|m| m.reg), Some(2 | 3 | 6)),
        _ => false,
    }
}
