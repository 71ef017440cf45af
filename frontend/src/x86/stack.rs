//! PUSH and POP.

use dynx86_backend::{HostEmitter, ScratchReg};
use dynx86_core::cpu::{reg_offset, ESP};
use dynx86_core::{AluOp, GuestMemory, SegReg, Width};

use super::{callout, TranslatorCtx};
use crate::TranslateError;

impl<E: HostEmitter, M: GuestMemory + ?Sized> TranslatorCtx<'_, E, M> {
    /// SS-relative linear address of the stack offset in `sp`.
    fn stack_addr(&mut self, sp: ScratchReg) -> Result<ScratchReg, TranslateError> {
        let addr = self.claim()?;
        self.e.mov(addr, sp);
        self.add_seg_base(addr, SegReg::Ss)?;
        Ok(addr)
    }

    pub(crate) fn push_value(&mut self, width: Width, val: ScratchReg) -> Result<(), TranslateError> {
        let sw = self.stack_width();
        let sp = self.claim()?;
        self.e.load_slot(sp, sw, reg_offset(ESP));
        self.e.alu_imm(AluOp::Sub, sw, sp, width.bytes(), 0);
        let addr = self.stack_addr(sp)?;
        self.write_mem(addr, width, val);
        self.e.release(addr);
        self.e.store_slot(sp, sw, reg_offset(ESP));
        self.e.release(sp);
        Ok(())
    }

    pub(crate) fn pop_value(&mut self, width: Width) -> Result<ScratchReg, TranslateError> {
        let sw = self.stack_width();
        let sp = self.claim()?;
        self.e.load_slot(sp, sw, reg_offset(ESP));
        let addr = self.stack_addr(sp)?;
        let val = self.read_mem(addr, width)?;
        self.e.release(addr);
        self.e.alu_imm(AluOp::Add, sw, sp, width.bytes(), 0);
        self.e.store_slot(sp, sw, reg_offset(ESP));
        self.e.release(sp);
        Ok(val)
    }

    /// Drop `bytes` from the top of the stack.
    pub(crate) fn release_stack(&mut self, bytes: u32) -> Result<(), TranslateError> {
        let sw = self.stack_width();
        let sp = self.claim()?;
        self.e.load_slot(sp, sw, reg_offset(ESP));
        self.e.alu_imm(AluOp::Add, sw, sp, bytes, 0);
        self.e.store_slot(sp, sw, reg_offset(ESP));
        self.e.release(sp);
        Ok(())
    }
}

pub(crate) fn push<E: HostEmitter, M: GuestMemory + ?Sized>(
    ctx: &mut TranslatorCtx<'_, E, M>,
) -> Result<(), TranslateError> {
    let insn = ctx.insn;
    let w = insn.full_width();
    let val = match insn.opcode {
        // PUSH SP stores the value before the decrement.
        0x50..=0x57 => ctx.load_reg(w, (insn.op_byte() & 7) as usize)?,
        0x68 | 0x6A => ctx.imm_reg(insn.imm & w.mask())?,
        _ => return callout::interpret(ctx),
    };
    ctx.push_value(w, val)?;
    ctx.e.release(val);
    Ok(())
}

pub(crate) fn pop<E: HostEmitter, M: GuestMemory + ?Sized>(
    ctx: &mut TranslatorCtx<'_, E, M>,
) -> Result<(), TranslateError> {
    let insn = ctx.insn;
    let r = (insn.op_byte() & 7) as usize;
    // POP SP and POP r/m interact with the stack pointer update.
    if !matches!(insn.opcode, 0x58..=0x5F) || r == ESP {
        return callout::interpret(ctx);
    }
    let w = insn.full_width();
    let val = ctx.pop_value(w)?;
    ctx.store_reg(w, r, val);
    ctx.e.release(val);
    Ok(())
}
