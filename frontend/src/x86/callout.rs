//! Call-outs to the interpreter's single-instruction entry.
//!
//! The helper executes the instruction at EIP and returns non-zero
//! when the block may not continue in line: control went somewhere
//! other than the next instruction, the CPU mode or IF changed, TF
//! got set, the CPU halted or faulted, or a write hit translated
//! code.

use dynx86_backend::{HelperArg, HostEmitter};
use dynx86_core::{ExitKind, GuestMemory, Width};
use tracing::trace;

use super::TranslatorCtx;
use crate::{JumpType, TranslateError};

fn emit_call<E: HostEmitter, M: GuestMemory + ?Sized>(
    ctx: &mut TranslatorCtx<'_, E, M>,
    ret: Option<dynx86_backend::ScratchReg>,
) {
    trace!(
        eip = format_args!("{:#x}", ctx.eip),
        opcode = format_args!("{:#x}", ctx.insn.opcode),
        "call-out"
    );
    ctx.sync_eip();
    let helper = ctx.helpers.interpret;
    let len = ctx.insn.len as u32;
    ctx.e
        .call_helper(helper, HelperArg::Imm(len), HelperArg::Imm(0), ret);
}

/// Interpret the instruction and continue in line unless the
/// helper reports a redirect.
pub(crate) fn interpret<E: HostEmitter, M: GuestMemory + ?Sized>(
    ctx: &mut TranslatorCtx<'_, E, M>,
) -> Result<(), TranslateError> {
    let redirect = ctx.claim()?;
    emit_call(ctx, Some(redirect));
    let cont = ctx.e.new_label();
    ctx.e.jump_if_zero(redirect, Width::B32, cont);
    ctx.e.release(redirect);
    ctx.e.exit(ExitKind::Callout);
    ctx.e.bind(cont);
    ctx.assume_eip(ctx.next);
    Ok(())
}

/// Interpret a far transfer or interrupt instruction and end the
/// block; EIP is wherever the interpreter left it.
pub(crate) fn transfer<E: HostEmitter, M: GuestMemory + ?Sized>(
    ctx: &mut TranslatorCtx<'_, E, M>,
) -> Result<(), TranslateError> {
    emit_call(ctx, None);
    ctx.e.exit(ExitKind::Callout);
    ctx.base.is_jmp = JumpType::NoReturn;
    Ok(())
}

/// HLT ends the block; other system instructions interpret in line.
pub(crate) fn system<E: HostEmitter, M: GuestMemory + ?Sized>(
    ctx: &mut TranslatorCtx<'_, E, M>,
) -> Result<(), TranslateError> {
    if ctx.insn.opcode == 0xF4 {
        transfer(ctx)
    } else {
        interpret(ctx)
    }
}
