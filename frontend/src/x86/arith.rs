//! Integer ALU forms, moves and flag operations translated inline.
//!
//! Guest flags are produced by the host executing the same
//! operation at the same width; only the architecturally defined
//! bits are merged back.

use dynx86_backend::{HostEmitter, UnaryOp};
use dynx86_core::cpu::{EAX, EDX, EFLAGS_OFFSET};
use dynx86_core::{AluOp, Cond, Eflags, GuestMemory, ShiftOp, Width};

use super::{callout, Operand, TranslatorCtx};
use crate::TranslateError;

type Res = Result<(), TranslateError>;

/// `dst = dst op src` with flags, writing back unless the op is CMP.
fn alu_rr<E: HostEmitter, M: GuestMemory + ?Sized>(
    ctx: &mut TranslatorCtx<'_, E, M>,
    op: AluOp,
    w: Width,
    dst: Operand,
    src: Operand,
) -> Res {
    let a = ctx.load(dst, w)?;
    let b = ctx.load(src, w)?;
    ctx.e.alu(op, w, a, b, op.defined_flags());
    ctx.e.release(b);
    if op.writes_result() {
        ctx.store(dst, w, a);
    }
    ctx.e.release(a);
    Ok(())
}

fn alu_ri<E: HostEmitter, M: GuestMemory + ?Sized>(
    ctx: &mut TranslatorCtx<'_, E, M>,
    op: AluOp,
    w: Width,
    dst: Operand,
    imm: u32,
) -> Res {
    let a = ctx.load(dst, w)?;
    ctx.e.alu_imm(op, w, a, imm & w.mask(), op.defined_flags());
    if op.writes_result() {
        ctx.store(dst, w, a);
    }
    ctx.e.release(a);
    Ok(())
}

fn test_ri<E: HostEmitter, M: GuestMemory + ?Sized>(
    ctx: &mut TranslatorCtx<'_, E, M>,
    w: Width,
    dst: Operand,
    imm: u32,
) -> Res {
    let a = ctx.load(dst, w)?;
    let b = ctx.imm_reg(imm & w.mask())?;
    ctx.e.test(w, a, b, Eflags::LOGIC_DEFINED);
    ctx.e.release(b);
    ctx.e.release(a);
    Ok(())
}

pub(crate) fn alu<E: HostEmitter, M: GuestMemory + ?Sized>(ctx: &mut TranslatorCtx<'_, E, M>) -> Res {
    let insn = ctx.insn;
    let op_byte = insn.op_byte();
    match op_byte {
        0x00..=0x3F => {
            let op = AluOp::from_index(op_byte >> 3);
            let w = insn.width_by_bit0();
            match op_byte & 7 {
                4 | 5 => alu_ri(ctx, op, w, Operand::Reg(EAX), insn.imm),
                form => {
                    let rm = ctx.rm()?;
                    let reg = ctx.reg_operand();
                    let (dst, src) = if form & 2 == 0 { (rm, reg) } else { (reg, rm) };
                    alu_rr(ctx, op, w, dst, src)?;
                    ctx.release_operand(rm);
                    Ok(())
                }
            }
        }
        0x80..=0x83 => {
            let op = AluOp::from_index(insn.reg_field());
            let w = insn.width_by_bit0();
            let rm = ctx.rm()?;
            alu_ri(ctx, op, w, rm, insn.imm)?;
            ctx.release_operand(rm);
            Ok(())
        }
        0x84 | 0x85 => {
            let w = insn.width_by_bit0();
            let rm = ctx.rm()?;
            let a = ctx.load(rm, w)?;
            let b = ctx.load_reg(w, insn.reg_field() as usize)?;
            ctx.e.test(w, a, b, Eflags::LOGIC_DEFINED);
            ctx.e.release(b);
            ctx.e.release(a);
            ctx.release_operand(rm);
            Ok(())
        }
        // A8/A9: TEST AL/eAX, imm
        _ => test_ri(ctx, insn.width_by_bit0(), Operand::Reg(EAX), insn.imm),
    }
}

pub(crate) fn inc_dec<E: HostEmitter, M: GuestMemory + ?Sized>(ctx: &mut TranslatorCtx<'_, E, M>) -> Res {
    let insn = ctx.insn;
    let (op, w, dst) = match insn.opcode {
        0x40..=0x4F => {
            let op = if insn.op_byte() < 0x48 { UnaryOp::Inc } else { UnaryOp::Dec };
            (op, insn.full_width(), Operand::Reg((insn.op_byte() & 7) as usize))
        }
        _ if insn.reg_field() > 1 => return callout::interpret(ctx),
        _ => {
            let op = if insn.reg_field() == 0 { UnaryOp::Inc } else { UnaryOp::Dec };
            (op, insn.width_by_bit0(), ctx.rm()?)
        }
    };
    let v = ctx.load(dst, w)?;
    ctx.e.unary(op, w, v, Eflags::INCDEC_DEFINED);
    ctx.store(dst, w, v);
    ctx.e.release(v);
    ctx.release_operand(dst);
    Ok(())
}

/// F6/F7: TEST, NOT and NEG inline; multiply and divide through
/// the interpreter.
pub(crate) fn unary<E: HostEmitter, M: GuestMemory + ?Sized>(ctx: &mut TranslatorCtx<'_, E, M>) -> Res {
    let insn = ctx.insn;
    let w = insn.width_by_bit0();
    let (op, flags) = match insn.reg_field() {
        0 | 1 => {
            let rm = ctx.rm()?;
            test_ri(ctx, w, rm, insn.imm)?;
            ctx.release_operand(rm);
            return Ok(());
        }
        2 => (UnaryOp::Not, 0),
        3 => (UnaryOp::Neg, Eflags::ARITH.bits()),
        _ => return callout::interpret(ctx),
    };
    let rm = ctx.rm()?;
    let v = ctx.load(rm, w)?;
    ctx.e.unary(op, w, v, flags);
    ctx.store(rm, w, v);
    ctx.e.release(v);
    ctx.release_operand(rm);
    Ok(())
}

pub(crate) fn mov<E: HostEmitter, M: GuestMemory + ?Sized>(ctx: &mut TranslatorCtx<'_, E, M>) -> Res {
    let insn = ctx.insn;
    match insn.opcode {
        0x88..=0x8B | 0xA0..=0xA3 => {
            let w = insn.width_by_bit0();
            let moffs = insn.opcode >= 0xA0;
            let rm = ctx.rm()?;
            let reg = if moffs { Operand::Reg(EAX) } else { ctx.reg_operand() };
            // 88/89 and A2/A3 store into the r/m side.
            let to_rm = (insn.opcode & 2 == 0) != moffs;
            let (dst, src) = if to_rm { (rm, reg) } else { (reg, rm) };
            let v = ctx.load(src, w)?;
            ctx.store(dst, w, v);
            ctx.e.release(v);
            ctx.release_operand(rm);
        }
        0xB0..=0xB7 => ctx.store_imm(Operand::Reg((insn.op_byte() & 7) as usize), Width::B8, insn.imm)?,
        0xB8..=0xBF => {
            let w = insn.full_width();
            ctx.store_imm(Operand::Reg((insn.op_byte() & 7) as usize), w, insn.imm & w.mask())?;
        }
        _ => {
            // C6/C7
            let w = insn.width_by_bit0();
            let dst = ctx.rm()?;
            ctx.store_imm(dst, w, insn.imm & w.mask())?;
            ctx.release_operand(dst);
        }
    }
    Ok(())
}

pub(crate) fn lea<E: HostEmitter, M: GuestMemory + ?Sized>(ctx: &mut TranslatorCtx<'_, E, M>) -> Res {
    let off = ctx.ea_offset()?;
    let w = ctx.insn.full_width();
    ctx.store_reg(w, ctx.insn.reg_field() as usize, off);
    ctx.e.release(off);
    Ok(())
}

pub(crate) fn xchg<E: HostEmitter, M: GuestMemory + ?Sized>(ctx: &mut TranslatorCtx<'_, E, M>) -> Res {
    let insn = ctx.insn;
    let (w, x, y) = if matches!(insn.opcode, 0x86 | 0x87) {
        (insn.width_by_bit0(), ctx.rm()?, ctx.reg_operand())
    } else {
        let r = (insn.op_byte() & 7) as usize;
        (insn.full_width(), Operand::Reg(EAX), Operand::Reg(r))
    };
    let a = ctx.load(x, w)?;
    let b = ctx.load(y, w)?;
    ctx.store(x, w, b);
    ctx.store(y, w, a);
    ctx.e.release(b);
    ctx.e.release(a);
    ctx.release_operand(x);
    Ok(())
}

/// MOVZX / MOVSX.
pub(crate) fn mov_ext<E: HostEmitter, M: GuestMemory + ?Sized>(ctx: &mut TranslatorCtx<'_, E, M>) -> Res {
    let insn = ctx.insn;
    let from = if insn.op_byte() & 1 == 0 { Width::B8 } else { Width::B16 };
    let signed = insn.op_byte() >= 0xBE;
    let src = ctx.rm()?;
    let v = ctx.load(src, from)?;
    ctx.release_operand(src);
    ctx.e.extend(v, v, from, signed);
    ctx.store_reg(insn.full_width(), insn.reg_field() as usize, v);
    ctx.e.release(v);
    Ok(())
}

/// CBW/CWDE and CWD/CDQ.
pub(crate) fn convert<E: HostEmitter, M: GuestMemory + ?Sized>(ctx: &mut TranslatorCtx<'_, E, M>) -> Res {
    let w = ctx.insn.full_width();
    if ctx.insn.opcode == 0x98 {
        let half = if w == Width::B32 { Width::B16 } else { Width::B8 };
        let v = ctx.load_reg(half, EAX)?;
        ctx.e.extend(v, v, half, true);
        ctx.store_reg(w, EAX, v);
        ctx.e.release(v);
    } else {
        let v = ctx.load_reg(w, EAX)?;
        ctx.e.extend(v, v, w, true);
        ctx.e.shift_imm(ShiftOp::Sar, Width::B32, v, 31, 0);
        ctx.store_reg(w, EDX, v);
        ctx.e.release(v);
    }
    Ok(())
}

/// Clear, set or complement bits of the guest EFLAGS slot.
fn edit_flags<E: HostEmitter, M: GuestMemory + ?Sized>(
    ctx: &mut TranslatorCtx<'_, E, M>,
    op: AluOp,
    bits: u32,
) -> Res {
    let f = ctx.claim()?;
    ctx.e.load_slot(f, Width::B32, EFLAGS_OFFSET);
    ctx.e.alu_imm(op, Width::B32, f, bits, 0);
    ctx.e.store_slot(f, Width::B32, EFLAGS_OFFSET);
    ctx.e.release(f);
    Ok(())
}

/// CMC/CLC/STC/CLD/STD and LAHF/SAHF. CLI/STI depend on IOPL and
/// change interrupt delivery, so they go through the interpreter.
pub(crate) fn flag_op<E: HostEmitter, M: GuestMemory + ?Sized>(ctx: &mut TranslatorCtx<'_, E, M>) -> Res {
    const AH: usize = 4;
    let cf = Eflags::CF.bits();
    let df = Eflags::DF.bits();
    match ctx.insn.opcode {
        0xF5 => edit_flags(ctx, AluOp::Xor, cf),
        0xF8 => edit_flags(ctx, AluOp::And, !cf),
        0xF9 => edit_flags(ctx, AluOp::Or, cf),
        0xFC => edit_flags(ctx, AluOp::And, !df),
        0xFD => edit_flags(ctx, AluOp::Or, df),
        0x9E => {
            let mask = Eflags::SZP | Eflags::AF.bits() | cf;
            let ah = ctx.load_reg(Width::B8, AH)?;
            ctx.e.alu_imm(AluOp::And, Width::B32, ah, mask, 0);
            let f = ctx.claim()?;
            ctx.e.load_slot(f, Width::B32, EFLAGS_OFFSET);
            ctx.e.alu_imm(AluOp::And, Width::B32, f, !mask, 0);
            ctx.e.alu(AluOp::Or, Width::B32, f, ah, 0);
            ctx.e.store_slot(f, Width::B32, EFLAGS_OFFSET);
            ctx.e.release(f);
            ctx.e.release(ah);
            Ok(())
        }
        0x9F => {
            let f = ctx.claim()?;
            ctx.e.load_slot(f, Width::B32, EFLAGS_OFFSET);
            ctx.e.alu_imm(AluOp::And, Width::B32, f, 0xD5, 0);
            ctx.e.alu_imm(AluOp::Or, Width::B32, f, Eflags::FIXED1.bits(), 0);
            ctx.store_reg(Width::B8, AH, f);
            ctx.e.release(f);
            Ok(())
        }
        _ => callout::interpret(ctx),
    }
}

pub(crate) fn set_cc<E: HostEmitter, M: GuestMemory + ?Sized>(ctx: &mut TranslatorCtx<'_, E, M>) -> Res {
    let cond = Cond::from_index(ctx.insn.op_byte());
    let dst = ctx.rm()?;
    let v = ctx.claim()?;
    ctx.e.set_cond(cond, v);
    ctx.store(dst, Width::B8, v);
    ctx.e.release(v);
    ctx.release_operand(dst);
    Ok(())
}

/// Shifts and rotates by an immediate count. Counts from CL and the
/// double shifts go through the interpreter.
pub(crate) fn shift<E: HostEmitter, M: GuestMemory + ?Sized>(ctx: &mut TranslatorCtx<'_, E, M>) -> Res {
    let insn = ctx.insn;
    let count = match insn.opcode {
        0xC0 | 0xC1 => insn.imm,
        0xD0 | 0xD1 => 1,
        _ => return callout::interpret(ctx),
    } & 0x1F;
    if count == 0 {
        return Ok(());
    }
    let w = insn.width_by_bit0();
    let op = ShiftOp::from_index(insn.reg_field());
    let dst = ctx.rm()?;
    let v = ctx.load(dst, w)?;
    ctx.e.shift_imm(op, w, v, count as u8, op.defined_flags(w, count));
    ctx.store(dst, w, v);
    ctx.e.release(v);
    ctx.release_operand(dst);
    Ok(())
}

pub(crate) fn nop<E: HostEmitter, M: GuestMemory + ?Sized>(_ctx: &mut TranslatorCtx<'_, E, M>) -> Res {
    Ok(())
}
