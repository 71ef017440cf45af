//! x87 escapes (D8-DF).
//!
//! The stack effect of every form comes from its shape: a push
//! decrements TOP and tags the new ST(0) valid before the helper
//! runs, pops tag ST(0) empty and increment TOP afterwards. Both
//! adjustments are emitted inline; the arithmetic itself happens
//! in a helper.

use dynx86_backend::{HelperArg, HostEmitter, ScratchReg};
use dynx86_core::cpu::{FPU_TAGS_OFFSET, FPU_TOP_OFFSET};
use dynx86_core::fpu::{TAG_EMPTY, TAG_VALID};
use dynx86_core::{AluOp, GuestMemory, Width};
use dynx86_decode::fpu::{arith_form, shape, FpuMemAccess};
use dynx86_interp::fpu::pack_escape;

use super::{callout, TranslatorCtx};
use crate::TranslateError;

impl<E: HostEmitter, M: GuestMemory + ?Sized> TranslatorCtx<'_, E, M> {
    fn load_top(&mut self) -> Result<ScratchReg, TranslateError> {
        let top = self.claim()?;
        self.e.load_slot(top, Width::B32, FPU_TOP_OFFSET);
        Ok(top)
    }

    /// Physical slot of ST(i).
    fn st_slot(&mut self, i: u8) -> Result<ScratchReg, TranslateError> {
        let slot = self.load_top()?;
        if i != 0 {
            self.e.alu_imm(AluOp::Add, Width::B32, slot, i as u32, 0);
            self.e.alu_imm(AluOp::And, Width::B32, slot, 7, 0);
        }
        Ok(slot)
    }

    fn fpu_push(&mut self) -> Result<(), TranslateError> {
        let top = self.load_top()?;
        self.e.alu_imm(AluOp::Sub, Width::B32, top, 1, 0);
        self.e.alu_imm(AluOp::And, Width::B32, top, 7, 0);
        self.e.store_slot(top, Width::B32, FPU_TOP_OFFSET);
        self.e.store_indexed_imm(FPU_TAGS_OFFSET, top, TAG_VALID);
        self.e.release(top);
        Ok(())
    }

    fn fpu_pop(&mut self) -> Result<(), TranslateError> {
        let top = self.load_top()?;
        self.e.store_indexed_imm(FPU_TAGS_OFFSET, top, TAG_EMPTY);
        self.e.alu_imm(AluOp::Add, Width::B32, top, 1, 0);
        self.e.alu_imm(AluOp::And, Width::B32, top, 7, 0);
        self.e.store_slot(top, Width::B32, FPU_TOP_OFFSET);
        self.e.release(top);
        Ok(())
    }
}

pub(crate) fn escape<E: HostEmitter, M: GuestMemory + ?Sized>(
    ctx: &mut TranslatorCtx<'_, E, M>,
) -> Result<(), TranslateError> {
    let esc = ctx.insn.op_byte();
    let modrm = ctx.insn.modrm.map_or(0, |m| m.byte());
    let Some(form) = shape(esc, modrm) else {
        return callout::interpret(ctx);
    };
    let packed = pack_escape(esc, modrm, ctx.insn.op32);
    let fpu_escape = ctx.helpers.fpu_escape;

    let addr = match ctx.insn.mem {
        Some(_) => Some(ctx.ea()?),
        None => None,
    };
    if form.push {
        ctx.fpu_push()?;
    }

    match addr {
        Some(addr) => {
            ctx.e
                .call_helper(fpu_escape, HelperArg::Imm(packed), HelperArg::Reg(addr), None);
            ctx.e.release(addr);
            if form.memory == Some(FpuMemAccess::Write) {
                ctx.wrote_memory = true;
            }
        }
        None => {
            let sti = ctx.st_slot(modrm & 7)?;
            match arith_form(esc, modrm) {
                Some((op, sti_dst)) => {
                    let st0 = ctx.st_slot(0)?;
                    let (dst, src) = if sti_dst { (sti, st0) } else { (st0, sti) };
                    let helper = ctx.helpers.fpu_arith[op as usize & 7];
                    ctx.e
                        .call_helper(helper, HelperArg::Reg(dst), HelperArg::Reg(src), None);
                    ctx.e.release(st0);
                }
                None => {
                    ctx.e
                        .call_helper(fpu_escape, HelperArg::Imm(packed), HelperArg::Reg(sti), None);
                }
            }
            ctx.e.release(sti);
        }
    }

    for _ in 0..form.pops {
        ctx.fpu_pop()?;
    }
    Ok(())
}
