//! x86 instruction decoder (8086 through 386 integer subset plus x87).
//!
//! Decoding is pure: instruction bytes are fetched through
//! `GuestMemory::peek_u8` and no guest state is touched. The
//! result classifies every instruction into an `OpFamily`, which
//! the block translator uses to index its handler registry.

pub mod fpu;
mod table;

use bitflags::bitflags;
use dynx86_core::{CpuMode, Exception, GuestMemory, SegReg, Width};
use thiserror::Error;

use table::{Entry, Imm};

/// Architectural maximum instruction length.
pub const MAX_INSN_LEN: u32 = 15;

bitflags! {
    /// Instruction prefixes seen before the opcode.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Prefixes: u8 {
        const LOCK = 1 << 0;
        /// F3: REP / REPE.
        const REP = 1 << 1;
        /// F2: REPNE.
        const REPNE = 1 << 2;
        /// 66: operand-size override.
        const OPSIZE = 1 << 3;
        /// 67: address-size override.
        const ADDRSIZE = 1 << 4;
    }
}

/// Opcode family, used as the index into the translator's
/// handler registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpFamily {
    Alu,
    IncDec,
    Push,
    Pop,
    Mov,
    MovSeg,
    Lea,
    Xchg,
    Jcc,
    JmpNear,
    CallNear,
    RetNear,
    FarControl,
    Loop,
    FlagOp,
    Convert,
    SetCc,
    Shift,
    Unary,
    Group5,
    MovExt,
    Bit,
    String,
    Fpu,
    System,
    Io,
    Bcd,
    Interrupt,
    Nop,
    Stack,
    Misc,
}

impl OpFamily {
    pub const COUNT: usize = OpFamily::Misc as usize + 1;
}

/// Decoded ModR/M byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModRm {
    pub md: u8,
    pub reg: u8,
    pub rm: u8,
}

impl ModRm {
    #[inline]
    pub fn is_reg(&self) -> bool {
        self.md == 3
    }

    /// Re-encode as the raw byte.
    #[inline]
    pub fn byte(&self) -> u8 {
        (self.md << 6) | (self.reg << 3) | self.rm
    }
}

/// A memory operand: `segment:[base + index << scale + disp]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemOperand {
    pub base: Option<u8>,
    pub index: Option<u8>,
    pub scale: u8,
    pub disp: u32,
    /// Effective segment (override or default).
    pub segment: SegReg,
}

/// One decoded guest instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedInsn {
    /// Opcode byte; two-byte opcodes carry 0x100 | second byte.
    pub opcode: u16,
    pub family: OpFamily,
    pub prefixes: Prefixes,
    /// Explicit segment override prefix.
    pub segment: Option<SegReg>,
    /// 32-bit operand size.
    pub op32: bool,
    /// 32-bit address size.
    pub addr32: bool,
    pub modrm: Option<ModRm>,
    pub mem: Option<MemOperand>,
    /// First immediate (sign-extended where the encoding says so)
    /// or the branch displacement.
    pub imm: u32,
    /// Second immediate: ENTER level, far pointer selector.
    pub imm2: u32,
    /// Total length in bytes.
    pub len: u8,
}

impl DecodedInsn {
    #[inline]
    pub fn is_two_byte(&self) -> bool {
        self.opcode & 0x100 != 0
    }

    /// Low opcode byte.
    #[inline]
    pub fn op_byte(&self) -> u8 {
        self.opcode as u8
    }

    /// Operand width selected by the operand-size attribute.
    #[inline]
    pub fn full_width(&self) -> Width {
        Width::full(self.op32)
    }

    /// Byte width when opcode bit 0 is clear, full width otherwise.
    #[inline]
    pub fn width_by_bit0(&self) -> Width {
        if self.opcode & 1 == 0 {
            Width::B8
        } else {
            self.full_width()
        }
    }

    /// ModR/M reg field (0 when absent).
    #[inline]
    pub fn reg_field(&self) -> u8 {
        self.modrm.map_or(0, |m| m.reg)
    }

    /// ModR/M r/m register, if the operand is a register.
    #[inline]
    pub fn rm_reg(&self) -> Option<u8> {
        match self.modrm {
            Some(m) if m.is_reg() => Some(m.rm),
            _ => None,
        }
    }

    /// Segment for implicit memory operands.
    #[inline]
    pub fn segment_or(&self, default: SegReg) -> SegReg {
        self.segment.unwrap_or(default)
    }

    #[inline]
    pub fn rep(&self) -> bool {
        self.prefixes.intersects(Prefixes::REP | Prefixes::REPNE)
    }
}

/// Reasons an instruction cannot be decoded. Each maps to the
/// guest fault the CPU raises for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("illegal opcode {opcode:#05x}")]
    Illegal { opcode: u16 },
    #[error("instruction longer than {MAX_INSN_LEN} bytes")]
    TooLong,
    #[error("privileged opcode {opcode:#05x} at cpl {cpl}")]
    Privileged { opcode: u16, cpl: u8 },
}

impl DecodeError {
    /// The exception the guest observes.
    pub fn exception(self) -> Exception {
        match self {
            DecodeError::Illegal { .. } => Exception::InvalidOpcode,
            DecodeError::TooLong | DecodeError::Privileged { .. } => {
                Exception::GeneralProtection(0)
            }
        }
    }
}

/// Linear address of byte `pos` of an instruction at `cs_base:eip`.
#[inline]
pub fn fetch_addr(cs_base: u32, eip: u32, pos: u32, code32: bool) -> u32 {
    let off = if code32 {
        eip.wrapping_add(pos)
    } else {
        eip.wrapping_add(pos) & 0xFFFF
    };
    cs_base.wrapping_add(off)
}

struct Fetcher<'a, M: ?Sized> {
    mem: &'a M,
    cs_base: u32,
    eip: u32,
    pos: u32,
    code32: bool,
}

impl<M: GuestMemory + ?Sized> Fetcher<'_, M> {
    fn u8(&mut self) -> Result<u8, DecodeError> {
        if self.pos >= MAX_INSN_LEN {
            return Err(DecodeError::TooLong);
        }
        let b = self
            .mem
            .peek_u8(fetch_addr(self.cs_base, self.eip, self.pos, self.code32));
        self.pos += 1;
        Ok(b)
    }

    fn u16(&mut self) -> Result<u16, DecodeError> {
        let lo = self.u8()? as u16;
        let hi = self.u8()? as u16;
        Ok(lo | hi << 8)
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        let lo = self.u16()? as u32;
        let hi = self.u16()? as u32;
        Ok(lo | hi << 16)
    }

    /// 16- or 32-bit immediate.
    fn iz(&mut self, wide: bool) -> Result<u32, DecodeError> {
        if wide {
            self.u32()
        } else {
            Ok(self.u16()? as u32)
        }
    }
}

/// Decode the instruction at `cs_base:eip` under `mode`.
pub fn decode<M: GuestMemory + ?Sized>(
    mem: &M,
    cs_base: u32,
    eip: u32,
    mode: CpuMode,
) -> Result<DecodedInsn, DecodeError> {
    let mut f = Fetcher {
        mem,
        cs_base,
        eip,
        pos: 0,
        code32: mode.code32,
    };

    // -- Prefixes --------------------------------------------
    let mut prefixes = Prefixes::empty();
    let mut segment = None;
    let first = loop {
        let b = f.u8()?;
        match b {
            0x26 => segment = Some(SegReg::Es),
            0x2E => segment = Some(SegReg::Cs),
            0x36 => segment = Some(SegReg::Ss),
            0x3E => segment = Some(SegReg::Ds),
            0x64 => segment = Some(SegReg::Fs),
            0x65 => segment = Some(SegReg::Gs),
            0x66 => prefixes |= Prefixes::OPSIZE,
            0x67 => prefixes |= Prefixes::ADDRSIZE,
            0xF0 => prefixes |= Prefixes::LOCK,
            0xF2 => {
                prefixes.remove(Prefixes::REP);
                prefixes |= Prefixes::REPNE;
            }
            0xF3 => {
                prefixes.remove(Prefixes::REPNE);
                prefixes |= Prefixes::REP;
            }
            _ => break b,
        }
    };
    let op32 = mode.code32 ^ prefixes.contains(Prefixes::OPSIZE);
    let addr32 = mode.code32 ^ prefixes.contains(Prefixes::ADDRSIZE);

    // -- Opcode ----------------------------------------------
    let (opcode, entry) = if first == 0x0F {
        let b = f.u8()?;
        (0x100 | b as u16, table::two_byte(b))
    } else {
        (first as u16, table::one_byte(first))
    };
    let illegal = DecodeError::Illegal { opcode };
    let Entry { family, modrm: has_modrm, imm } = entry.ok_or(illegal)?;

    // -- ModR/M ----------------------------------------------
    let mut modrm = None;
    let mut mem_op = None;
    if has_modrm {
        let b = f.u8()?;
        let m = ModRm {
            md: b >> 6,
            reg: (b >> 3) & 7,
            rm: b & 7,
        };
        // Control-register moves always address a register.
        let forced_reg = matches!(opcode, 0x120 | 0x122);
        if !m.is_reg() && !forced_reg {
            mem_op = Some(decode_mem(&mut f, m, addr32, segment)?);
        }
        modrm = Some(m);
    }
    if !table::form_valid(opcode, modrm) {
        return Err(illegal);
    }

    // -- Immediates ------------------------------------------
    let mut imm_val = 0;
    let mut imm2 = 0;
    let imm = match imm {
        Imm::Group3 if modrm.map_or(0, |m| m.reg) < 2 => {
            if opcode == 0xF6 {
                Imm::Ib
            } else {
                Imm::Iz
            }
        }
        other => other,
    };
    match imm {
        Imm::None | Imm::Group3 => {}
        Imm::Ib => imm_val = f.u8()? as u32,
        Imm::Ibs | Imm::Jb => imm_val = f.u8()? as i8 as i32 as u32,
        Imm::Iw => imm_val = f.u16()? as u32,
        Imm::Iz => imm_val = f.iz(op32)?,
        Imm::Jz => {
            imm_val = if op32 {
                f.u32()?
            } else {
                f.u16()? as i16 as i32 as u32
            }
        }
        Imm::IwIb => {
            imm_val = f.u16()? as u32;
            imm2 = f.u8()? as u32;
        }
        Imm::Ap => {
            imm_val = f.iz(op32)?;
            imm2 = f.u16()? as u32;
        }
        Imm::Ob => {
            let disp = f.iz(addr32)?;
            mem_op = Some(MemOperand {
                base: None,
                index: None,
                scale: 0,
                disp,
                segment: segment.unwrap_or(SegReg::Ds),
            });
        }
    }

    // -- Privilege -------------------------------------------
    let cpl = mode.cpl;
    if cpl > 0 && table::is_privileged(opcode, modrm) {
        return Err(DecodeError::Privileged { opcode, cpl });
    }

    Ok(DecodedInsn {
        opcode,
        family,
        prefixes,
        segment,
        op32,
        addr32,
        modrm,
        mem: mem_op,
        imm: imm_val,
        imm2,
        len: f.pos as u8,
    })
}

/// Decode the addressing part of a memory ModR/M form.
fn decode_mem<M: GuestMemory + ?Sized>(
    f: &mut Fetcher<'_, M>,
    m: ModRm,
    addr32: bool,
    seg_override: Option<SegReg>,
) -> Result<MemOperand, DecodeError> {
    use dynx86_core::cpu::{EBP, EBX, EDI, ESI, ESP};

    let (base, index, scale, disp) = if !addr32 {
        let (base, index) = match m.rm {
            0 => (Some(EBX), Some(ESI)),
            1 => (Some(EBX), Some(EDI)),
            2 => (Some(EBP), Some(ESI)),
            3 => (Some(EBP), Some(EDI)),
            4 => (Some(ESI), None),
            5 => (Some(EDI), None),
            6 if m.md == 0 => (None, None),
            6 => (Some(EBP), None),
            _ => (Some(EBX), None),
        };
        let disp = match m.md {
            0 if m.rm == 6 => f.u16()? as u32,
            1 => f.u8()? as i8 as i16 as u16 as u32,
            2 => f.u16()? as u32,
            _ => 0,
        };
        (base, index, 0, disp)
    } else {
        let (base, index, scale) = if m.rm == 4 {
            let sib = f.u8()?;
            let scale = sib >> 6;
            let idx = (sib >> 3) & 7;
            let b = sib & 7;
            let index = if idx == 4 { None } else { Some(idx as usize) };
            let base = if b == 5 && m.md == 0 {
                None
            } else {
                Some(b as usize)
            };
            (base, index, scale)
        } else if m.rm == 5 && m.md == 0 {
            (None, None, 0)
        } else {
            (Some(m.rm as usize), None, 0)
        };
        let disp = match m.md {
            0 if base.is_none() => f.u32()?,
            1 => f.u8()? as i8 as i32 as u32,
            2 => f.u32()?,
            _ => 0,
        };
        (base, index, scale, disp)
    };

    let stack_based = matches!(base, Some(EBP) | Some(ESP));
    let default_seg = if stack_based { SegReg::Ss } else { SegReg::Ds };
    Ok(MemOperand {
        base: base.map(|r| r as u8),
        index: index.map(|r| r as u8),
        scale,
        disp,
        segment: seg_override.unwrap_or(default_seg),
    })
}

/// Address of the instruction following one of `len` bytes at `eip`.
#[inline]
pub fn next_eip(eip: u32, len: u8, code32: bool) -> u32 {
    dynx86_core::cpu::ip_add(eip, len as u32, code32)
}
