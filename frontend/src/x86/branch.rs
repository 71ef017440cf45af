//! Near control transfers. Each of them ends the block.

use dynx86_backend::HostEmitter;
use dynx86_core::cpu::{reg_offset, ECX, EIP_OFFSET};
use dynx86_core::{AluOp, Cond, ExitKind, GuestMemory, Width};

use super::{arith, callout, TranslatorCtx};
use crate::{JumpType, TranslateError};

type Res = Result<(), TranslateError>;

/// Two-way exit: fall through to the next instruction, or branch to
/// the relative target once `taken` is reached.
fn two_way<E: HostEmitter, M: GuestMemory + ?Sized>(
    ctx: &mut TranslatorCtx<'_, E, M>,
    taken: dynx86_backend::Label,
) -> Res {
    let (next, target) = (ctx.next, ctx.rel_target());
    ctx.goto(next)?;
    ctx.e.bind(taken);
    ctx.goto(target)?;
    ctx.base.is_jmp = JumpType::NoReturn;
    Ok(())
}

pub(crate) fn jcc<E: HostEmitter, M: GuestMemory + ?Sized>(ctx: &mut TranslatorCtx<'_, E, M>) -> Res {
    let cond = Cond::from_index(ctx.insn.op_byte());
    let taken = ctx.e.new_label();
    ctx.e.jump_if(cond, taken);
    two_way(ctx, taken)
}

pub(crate) fn jmp_near<E: HostEmitter, M: GuestMemory + ?Sized>(ctx: &mut TranslatorCtx<'_, E, M>) -> Res {
    let target = ctx.rel_target();
    ctx.goto(target)?;
    ctx.base.is_jmp = JumpType::NoReturn;
    Ok(())
}

pub(crate) fn call_near<E: HostEmitter, M: GuestMemory + ?Sized>(ctx: &mut TranslatorCtx<'_, E, M>) -> Res {
    let w = ctx.insn.full_width();
    let ret = ctx.imm_reg(ctx.next)?;
    ctx.push_value(w, ret)?;
    ctx.e.release(ret);
    let target = ctx.rel_target();
    ctx.goto(target)?;
    ctx.base.is_jmp = JumpType::NoReturn;
    Ok(())
}

pub(crate) fn ret_near<E: HostEmitter, M: GuestMemory + ?Sized>(ctx: &mut TranslatorCtx<'_, E, M>) -> Res {
    let w = ctx.insn.full_width();
    let target = ctx.pop_value(w)?;
    if ctx.insn.opcode == 0xC2 {
        ctx.release_stack(ctx.insn.imm)?;
    }
    ctx.e.store_slot(target, Width::B32, EIP_OFFSET);
    ctx.e.release(target);
    ctx.e.exit(ExitKind::Normal);
    ctx.base.is_jmp = JumpType::NoReturn;
    Ok(())
}

/// LOOPNE, LOOPE, LOOP and JCXZ. The counter is CX or ECX by
/// address size.
pub(crate) fn loop_op<E: HostEmitter, M: GuestMemory + ?Sized>(ctx: &mut TranslatorCtx<'_, E, M>) -> Res {
    let cw = Width::full(ctx.insn.addr32);
    let opcode = ctx.insn.opcode;
    let taken = ctx.e.new_label();
    let count = ctx.claim()?;
    ctx.e.load_slot(count, cw, reg_offset(ECX));
    if opcode == 0xE3 {
        ctx.e.jump_if_zero(count, cw, taken);
    } else {
        ctx.e.alu_imm(AluOp::Sub, cw, count, 1, 0);
        ctx.e.store_slot(count, cw, reg_offset(ECX));
        match opcode {
            0xE2 => ctx.e.jump_if_nonzero(count, cw, taken),
            _ => {
                let not_taken = ctx.e.new_label();
                ctx.e.jump_if_zero(count, cw, not_taken);
                let cond = if opcode == 0xE1 { Cond::E } else { Cond::Ne };
                ctx.e.jump_if(cond, taken);
                ctx.e.bind(not_taken);
            }
        }
    }
    ctx.e.release(count);
    two_way(ctx, taken)
}

/// FF group: INC, DEC, indirect CALL/JMP, PUSH. The far forms go
/// to the interpreter.
pub(crate) fn group5<E: HostEmitter, M: GuestMemory + ?Sized>(ctx: &mut TranslatorCtx<'_, E, M>) -> Res {
    let w = ctx.insn.full_width();
    match ctx.insn.reg_field() {
        0 | 1 => arith::inc_dec(ctx),
        r @ (2 | 4) => {
            let src = ctx.rm()?;
            let target = ctx.load(src, w)?;
            ctx.release_operand(src);
            if r == 2 {
                let ret = ctx.imm_reg(ctx.next)?;
                ctx.push_value(w, ret)?;
                ctx.e.release(ret);
            }
            ctx.e.store_slot(target, Width::B32, EIP_OFFSET);
            ctx.e.release(target);
            ctx.e.exit(ExitKind::Normal);
            ctx.base.is_jmp = JumpType::NoReturn;
            Ok(())
        }
        6 => {
            let src = ctx.rm()?;
            let val = ctx.load(src, w)?;
            ctx.release_operand(src);
            ctx.push_value(w, val)?;
            ctx.e.release(val);
            Ok(())
        }
        _ => callout::transfer(ctx),
    }
}
