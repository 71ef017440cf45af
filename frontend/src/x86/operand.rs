//! Operand access: effective addresses, register-file slots and
//! guest memory through the read/write helpers.

use dynx86_backend::{HelperArg, HostEmitter, ScratchReg};
use dynx86_core::cpu::{reg_offset, reg_slot, seg_base_offset};
use dynx86_core::{AluOp, GuestMemory, SegReg, ShiftOp, Width};

use super::TranslatorCtx;
use crate::TranslateError;

/// A resolved instruction operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Operand {
    /// Guest register by encoding number.
    Reg(usize),
    /// Guest memory at the linear address held in the register.
    Mem(ScratchReg),
}

impl<E: HostEmitter, M: GuestMemory + ?Sized> TranslatorCtx<'_, E, M> {
    pub(crate) fn claim(&mut self) -> Result<ScratchReg, TranslateError> {
        Ok(self.e.claim()?)
    }

    pub(crate) fn imm_reg(&mut self, val: u32) -> Result<ScratchReg, TranslateError> {
        let r = self.claim()?;
        self.e.mov_imm(r, val);
        Ok(r)
    }

    // -- Effective address -------------------------------------

    /// Offset part of the memory operand, wrapped to the address size.
    pub(crate) fn ea_offset(&mut self) -> Result<ScratchReg, TranslateError> {
        let dst = self.claim()?;
        let Some(m) = self.insn.mem else {
            self.e.mov_imm(dst, 0);
            return Ok(dst);
        };
        match m.base {
            Some(b) => {
                self.e.load_slot(dst, Width::B32, reg_offset(b as usize));
                if m.disp != 0 {
                    self.e.alu_imm(AluOp::Add, Width::B32, dst, m.disp, 0);
                }
            }
            None => self.e.mov_imm(dst, m.disp),
        }
        if let Some(i) = m.index {
            let t = self.claim()?;
            self.e.load_slot(t, Width::B32, reg_offset(i as usize));
            if m.scale != 0 {
                self.e.shift_imm(ShiftOp::Shl, Width::B32, t, m.scale, 0);
            }
            self.e.alu(AluOp::Add, Width::B32, dst, t, 0);
            self.e.release(t);
        }
        if !self.insn.addr32 {
            self.e.extend(dst, dst, Width::B16, false);
        }
        Ok(dst)
    }

    /// Add the cached base of `seg` to `reg`.
    pub(crate) fn add_seg_base(&mut self, reg: ScratchReg, seg: SegReg) -> Result<(), TranslateError> {
        let t = self.claim()?;
        self.e.load_slot(t, Width::B32, seg_base_offset(seg));
        self.e.alu(AluOp::Add, Width::B32, reg, t, 0);
        self.e.release(t);
        Ok(())
    }

    /// Linear address of the memory operand.
    pub(crate) fn ea(&mut self) -> Result<ScratchReg, TranslateError> {
        let addr = self.ea_offset()?;
        let seg = self.insn.mem.map_or(SegReg::Ds, |m| m.segment);
        self.add_seg_base(addr, seg)?;
        Ok(addr)
    }

    // -- Operands ----------------------------------------------

    /// The r/m operand (or the moffs operand of A0-A3).
    pub(crate) fn rm(&mut self) -> Result<Operand, TranslateError> {
        match self.insn.rm_reg() {
            Some(r) => Ok(Operand::Reg(r as usize)),
            None => Ok(Operand::Mem(self.ea()?)),
        }
    }

    /// The ModR/M reg-field register.
    pub(crate) fn reg_operand(&self) -> Operand {
        Operand::Reg(self.insn.reg_field() as usize)
    }

    pub(crate) fn load(&mut self, op: Operand, width: Width) -> Result<ScratchReg, TranslateError> {
        match op {
            Operand::Reg(r) => self.load_reg(width, r),
            Operand::Mem(addr) => self.read_mem(addr, width),
        }
    }

    pub(crate) fn store(&mut self, op: Operand, width: Width, val: ScratchReg) {
        match op {
            Operand::Reg(r) => self.store_reg(width, r, val),
            Operand::Mem(addr) => self.write_mem(addr, width, val),
        }
    }

    /// Store an immediate without going through a scratch register
    /// when the destination is a register.
    pub(crate) fn store_imm(&mut self, op: Operand, width: Width, val: u32) -> Result<(), TranslateError> {
        match op {
            Operand::Reg(r) => self.e.store_slot_imm(width, reg_slot(width, r), val),
            Operand::Mem(addr) => {
                let v = self.imm_reg(val)?;
                self.write_mem(addr, width, v);
                self.e.release(v);
            }
        }
        Ok(())
    }

    pub(crate) fn release_operand(&mut self, op: Operand) {
        if let Operand::Mem(addr) = op {
            self.e.release(addr);
        }
    }

    // -- Register file -----------------------------------------

    pub(crate) fn load_reg(&mut self, width: Width, r: usize) -> Result<ScratchReg, TranslateError> {
        let dst = self.claim()?;
        self.e.load_slot(dst, width, reg_slot(width, r));
        Ok(dst)
    }

    pub(crate) fn store_reg(&mut self, width: Width, r: usize, val: ScratchReg) {
        self.e.store_slot(val, width, reg_slot(width, r));
    }

    // -- Guest memory ------------------------------------------

    pub(crate) fn read_mem(&mut self, addr: ScratchReg, width: Width) -> Result<ScratchReg, TranslateError> {
        let dst = self.claim()?;
        let helper = self.helpers.read(width);
        self.e
            .call_helper(helper, HelperArg::Reg(addr), HelperArg::Imm(0), Some(dst));
        Ok(dst)
    }

    /// Write guest memory. The exit-request check follows once the
    /// whole instruction has been emitted.
    pub(crate) fn write_mem(&mut self, addr: ScratchReg, width: Width, val: ScratchReg) {
        let helper = self.helpers.write(width);
        self.e
            .call_helper(helper, HelperArg::Reg(addr), HelperArg::Reg(val), None);
        self.wrote_memory = true;
    }
}
