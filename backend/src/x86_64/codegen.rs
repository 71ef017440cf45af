use dynx86_core::block::MAX_LINKS;
use dynx86_core::cpu::{CYCLES_OFFSET, EFLAGS_OFFSET};
use dynx86_core::{AluOp, Cond, Eflags, ExitKind, ShiftOp, Width};

use crate::code_buffer::CodeBuffer;
use crate::label::{Label, Labels};
use crate::scratch::{ScratchReg, ScratchRegs};
use crate::x86_64::emitter::*;
use crate::x86_64::regs::{
    Reg, CALLEE_SAVED, CALL_ARG_REGS, ENV_REG, SCRATCH_REGS, STACK_ADDEND, TMP_REG,
};
use crate::{
    CompiledCode, EmitError, HelperArg, HostEmitter, LinkSite, Trampoline, UnaryOp,
};

/// Guest flags loaded into host EFLAGS to evaluate a condition.
const COND_FLAGS: u32 = Eflags::ARITH.bits();

/// x86-64 block emitter.
///
/// Guest flags are produced by running the same operation on the
/// host and copying the requested host EFLAGS bits back into the
/// guest slot; conditions reload guest flags with `popfq` and use
/// the matching host Jcc/SETcc.
pub struct X86_64Emitter {
    buf: CodeBuffer,
    regs: ScratchRegs,
    labels: Labels,
    epilogue_relocs: Vec<usize>,
    exit_sites: Vec<usize>,
    link_sites: [Option<LinkSite>; MAX_LINKS],
    /// Stub label for the cycle-exhausted exit and the imm32 of the
    /// entry `sub` that charges the block's instruction count.
    cycles: Option<(Label, usize)>,
}

impl X86_64Emitter {
    pub fn new() -> Self {
        Self {
            buf: CodeBuffer::new(),
            regs: ScratchRegs::new(SCRATCH_REGS.len() as u8),
            labels: Labels::new(),
            epilogue_relocs: Vec::new(),
            exit_sites: Vec::new(),
            link_sites: [None; MAX_LINKS],
            cycles: None,
        }
    }

    /// Bytes emitted so far for the current block.
    pub fn code(&self) -> &[u8] {
        self.buf.as_slice()
    }

    #[inline]
    fn host(reg: ScratchReg) -> Reg {
        SCRATCH_REGS[reg.index()]
    }

    /// Copy the host status flags selected by `mask` into guest EFLAGS.
    fn merge_flags(&mut self, mask: u32) {
        if mask == 0 {
            return;
        }
        let buf = &mut self.buf;
        emit_pushf(buf);
        emit_pop(buf, TMP_REG);
        emit_arith_ri(buf, AluOp::And, Width::B32, TMP_REG, mask);
        emit_arith_mi(buf, AluOp::And, Width::B32, ENV_REG, EFLAGS_OFFSET as i32, !mask);
        emit_arith_mr(buf, AluOp::Or, Width::B32, ENV_REG, EFLAGS_OFFSET as i32, TMP_REG);
    }

    /// Host CF = guest CF.
    fn load_carry(&mut self) {
        emit_bt_mi(&mut self.buf, ENV_REG, EFLAGS_OFFSET as i32, 0);
    }

    /// Host status flags = guest status flags.
    fn load_guest_flags(&mut self) {
        let buf = &mut self.buf;
        emit_load(buf, Width::B32, TMP_REG, ENV_REG, EFLAGS_OFFSET as i32);
        emit_arith_ri(buf, AluOp::And, Width::B32, TMP_REG, COND_FLAGS);
        emit_push(buf, TMP_REG);
        emit_popf(buf);
    }

    fn branch(&mut self, cond: Cond, label: Label) {
        let field = emit_jcc_rel32(&mut self.buf, cond);
        self.labels.add_use(&mut self.buf, label, field);
    }

    /// `mov eax, value; jmp epilogue`, both fixed up at commit.
    fn emit_exit_value(&mut self, value: u32) {
        let imm = emit_mov_ri_patchable(&mut self.buf, TMP_REG, value);
        self.exit_sites.push(imm);
        let rel = emit_jmp_rel32(&mut self.buf);
        self.epilogue_relocs.push(rel);
    }
}

impl Default for X86_64Emitter {
    fn default() -> Self {
        Self::new()
    }
}

impl HostEmitter for X86_64Emitter {
    fn emit_trampoline(&mut self) -> Trampoline {
        let mut buf = CodeBuffer::new();
        let entry = buf.offset();

        for &reg in CALLEE_SAVED {
            emit_push(&mut buf, reg);
        }
        // mov rbp, rdi (first argument = env)
        emit_mov_rr(&mut buf, true, ENV_REG, CALL_ARG_REGS[0]);
        if STACK_ADDEND > 0 {
            emit_arith_ri64(&mut buf, AluOp::Sub, Reg::Rsp, STACK_ADDEND as i32);
        }
        // jmp *rsi (second argument = block host code)
        emit_jmp_reg(&mut buf, CALL_ARG_REGS[1]);

        // Block return path: eax already holds the exit value.
        let epilogue = buf.offset();
        if STACK_ADDEND > 0 {
            emit_arith_ri64(&mut buf, AluOp::Add, Reg::Rsp, STACK_ADDEND as i32);
        }
        for &reg in CALLEE_SAVED.iter().rev() {
            emit_pop(&mut buf, reg);
        }
        emit_ret(&mut buf);

        Trampoline {
            code: buf.take(),
            entry,
            epilogue,
        }
    }

    fn begin_block(&mut self) {
        self.buf.clear();
        self.regs.reset();
        self.labels.clear();
        self.epilogue_relocs.clear();
        self.exit_sites.clear();
        self.link_sites = [None; MAX_LINKS];
        self.cycles = None;
    }

    fn offset(&self) -> usize {
        self.buf.offset()
    }

    fn claim(&mut self) -> Result<ScratchReg, EmitError> {
        self.regs.claim()
    }

    fn release(&mut self, reg: ScratchReg) {
        self.regs.release(reg);
    }

    fn free_regs(&self) -> usize {
        self.regs.available()
    }

    fn new_label(&mut self) -> Label {
        self.labels.create()
    }

    fn bind(&mut self, label: Label) {
        let offset = self.buf.offset();
        self.labels.bind(&mut self.buf, label, offset);
    }

    fn check_cycles(&mut self) {
        let stub = self.labels.create();
        emit_arith_mi(&mut self.buf, AluOp::Cmp, Width::B32, ENV_REG, CYCLES_OFFSET as i32, 0);
        self.branch(Cond::Le, stub);
        let site = emit_arith_mi32_patchable(&mut self.buf, AluOp::Sub, ENV_REG, CYCLES_OFFSET as i32);
        self.cycles = Some((stub, site));
    }

    // -- Moves --

    fn mov_imm(&mut self, dst: ScratchReg, val: u32) {
        emit_mov_ri(&mut self.buf, false, Self::host(dst), val as u64);
    }

    fn mov(&mut self, dst: ScratchReg, src: ScratchReg) {
        if dst != src {
            emit_mov_rr(&mut self.buf, false, Self::host(dst), Self::host(src));
        }
    }

    fn load_slot(&mut self, dst: ScratchReg, width: Width, offset: usize) {
        emit_load(&mut self.buf, width, Self::host(dst), ENV_REG, offset as i32);
    }

    fn store_slot(&mut self, src: ScratchReg, width: Width, offset: usize) {
        emit_store(&mut self.buf, width, Self::host(src), ENV_REG, offset as i32);
    }

    fn store_slot_imm(&mut self, width: Width, offset: usize, val: u32) {
        emit_store_imm(&mut self.buf, width, ENV_REG, offset as i32, val);
    }

    fn slot_add_imm(&mut self, width: Width, offset: usize, val: u32) {
        emit_arith_mi(&mut self.buf, AluOp::Add, width, ENV_REG, offset as i32, val);
    }

    fn store_indexed_imm(&mut self, base_offset: usize, index: ScratchReg, val: u32) {
        emit_store_imm_sib(
            &mut self.buf,
            ENV_REG,
            Self::host(index),
            2,
            base_offset as i32,
            val,
        );
    }

    // -- Arithmetic --

    fn alu(&mut self, op: AluOp, width: Width, dst: ScratchReg, src: ScratchReg, flags: u32) {
        if op.uses_carry() {
            self.load_carry();
        }
        emit_arith_rr(&mut self.buf, op, width, Self::host(dst), Self::host(src));
        self.merge_flags(flags);
    }

    fn alu_imm(&mut self, op: AluOp, width: Width, dst: ScratchReg, imm: u32, flags: u32) {
        if op.uses_carry() {
            self.load_carry();
        }
        emit_arith_ri(&mut self.buf, op, width, Self::host(dst), imm);
        self.merge_flags(flags);
    }

    fn test(&mut self, width: Width, a: ScratchReg, b: ScratchReg, flags: u32) {
        emit_test_rr(&mut self.buf, width, Self::host(a), Self::host(b));
        self.merge_flags(flags);
    }

    fn unary(&mut self, op: UnaryOp, width: Width, reg: ScratchReg, flags: u32) {
        emit_unary(&mut self.buf, op, width, Self::host(reg));
        self.merge_flags(flags);
    }

    fn shift_imm(&mut self, op: ShiftOp, width: Width, reg: ScratchReg, count: u8, flags: u32) {
        if matches!(op, ShiftOp::Rcl | ShiftOp::Rcr) {
            self.load_carry();
        }
        emit_shift_ri(&mut self.buf, op, width, Self::host(reg), count);
        self.merge_flags(flags);
    }

    fn extend(&mut self, dst: ScratchReg, src: ScratchReg, from: Width, signed: bool) {
        let opc = match (from, signed) {
            (Width::B8, false) => OPC_MOVZBL,
            (Width::B8, true) => OPC_MOVSBL,
            (Width::B16, false) => OPC_MOVZWL,
            (Width::B16, true) => OPC_MOVSWL,
            (Width::B32, _) => return self.mov(dst, src),
        };
        emit_movx(&mut self.buf, opc, Self::host(dst), Self::host(src));
    }

    // -- Guest conditions --

    fn set_cond(&mut self, cond: Cond, dst: ScratchReg) {
        self.load_guest_flags();
        emit_setcc(&mut self.buf, cond, TMP_REG);
        emit_movx(&mut self.buf, OPC_MOVZBL, Self::host(dst), TMP_REG);
    }

    fn jump_if(&mut self, cond: Cond, label: Label) {
        self.load_guest_flags();
        self.branch(cond, label);
    }

    fn jump(&mut self, label: Label) {
        let field = emit_jmp_rel32(&mut self.buf);
        self.labels.add_use(&mut self.buf, label, field);
    }

    fn jump_if_zero(&mut self, reg: ScratchReg, width: Width, label: Label) {
        let r = Self::host(reg);
        emit_test_rr(&mut self.buf, width, r, r);
        self.branch(Cond::E, label);
    }

    fn jump_if_nonzero(&mut self, reg: ScratchReg, width: Width, label: Label) {
        let r = Self::host(reg);
        emit_test_rr(&mut self.buf, width, r, r);
        self.branch(Cond::Ne, label);
    }

    fn jump_if_slot_zero(&mut self, offset: usize, label: Label) {
        emit_arith_mi(&mut self.buf, AluOp::Cmp, Width::B32, ENV_REG, offset as i32, 0);
        self.branch(Cond::E, label);
    }

    // -- Calls and exits --

    fn call_helper(&mut self, addr: usize, a: HelperArg, b: HelperArg, ret: Option<ScratchReg>) {
        for (arg, target) in [(a, CALL_ARG_REGS[1]), (b, CALL_ARG_REGS[2])] {
            match arg {
                HelperArg::Reg(r) => emit_mov_rr(&mut self.buf, false, target, Self::host(r)),
                HelperArg::Imm(v) => emit_mov_ri(&mut self.buf, false, target, v as u64),
            }
        }
        emit_mov_rr(&mut self.buf, true, CALL_ARG_REGS[0], ENV_REG);
        emit_mov_ri(&mut self.buf, true, TMP_REG, addr as u64);
        emit_call_reg(&mut self.buf, TMP_REG);
        if let Some(r) = ret {
            emit_mov_rr(&mut self.buf, false, Self::host(r), TMP_REG);
        }
    }

    fn exit(&mut self, kind: ExitKind) {
        self.emit_exit_value(kind as u32);
    }

    fn exit_link(&mut self, slot: usize) -> Result<(), EmitError> {
        if slot >= MAX_LINKS || self.link_sites[slot].is_some() {
            return Err(EmitError::TooManyLinks);
        }
        // Keep the rel32 field 4-byte aligned so patching it is a
        // single aligned store.
        let target_align = (self.buf.offset() + 1 + 3) & !3;
        let nop_count = target_align - (self.buf.offset() + 1);
        emit_nops(&mut self.buf, nop_count);

        let jmp_offset = self.buf.offset();
        self.buf.emit_u8(OPC_JMP_long as u8);
        self.buf.emit_u32(0);
        let reset_offset = self.buf.offset();
        self.link_sites[slot] = Some(LinkSite {
            jmp_offset,
            reset_offset,
        });
        self.exit(ExitKind::link(slot));
        Ok(())
    }

    fn finish(&mut self, insn_count: u32) -> Result<CompiledCode, EmitError> {
        if let Some((stub, site)) = self.cycles.take() {
            self.bind(stub);
            self.exit(ExitKind::Cycles);
            self.buf.patch_u32(site, insn_count);
        }
        self.labels.check_resolved()?;
        Ok(CompiledCode {
            bytes: self.buf.take(),
            epilogue_relocs: std::mem::take(&mut self.epilogue_relocs),
            exit_sites: std::mem::take(&mut self.exit_sites),
            link_sites: std::mem::replace(&mut self.link_sites, [None; MAX_LINKS]),
            insn_count,
        })
    }
}
