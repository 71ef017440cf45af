//! Per-instruction execution context and operand access.

use dynx86_core::{CpuState, Eflags, Exception, GuestMemory, SegReg, Width};
use dynx86_decode::DecodedInsn;

use crate::alu::FlagsOut;

/// Outcome of executing one instruction body: guest faults are
/// values, delivered by the caller.
pub type Fault<T = ()> = Result<T, Exception>;

/// State shared by the handlers while one instruction executes.
pub(crate) struct Exec<'a, M: GuestMemory + ?Sized> {
    pub cpu: &'a mut CpuState,
    pub mem: &'a mut M,
    pub insn: DecodedInsn,
    /// EIP of the following instruction.
    pub next: u32,
    /// Set when the instruction itself delivered an interrupt.
    pub delivered: bool,
}

impl<M: GuestMemory + ?Sized> Exec<'_, M> {
    // -- Memory operand ----------------------------------------

    /// Offset part of the memory operand, wrapped to the address size.
    pub fn ea_offset(&self) -> u32 {
        let Some(m) = self.insn.mem else {
            return 0;
        };
        let mut off = m.disp;
        if let Some(b) = m.base {
            off = off.wrapping_add(self.cpu.regs[b as usize]);
        }
        if let Some(i) = m.index {
            off = off.wrapping_add(self.cpu.regs[i as usize] << m.scale);
        }
        if !self.insn.addr32 {
            off &= 0xFFFF;
        }
        off
    }

    /// Segment of the memory operand.
    pub fn ea_segment(&self) -> SegReg {
        self.insn.mem.map_or(SegReg::Ds, |m| m.segment)
    }

    /// Linear address of the memory operand.
    pub fn ea(&self) -> u32 {
        self.cpu
            .seg_base(self.ea_segment())
            .wrapping_add(self.ea_offset())
    }

    /// Linear address `disp` bytes past the memory operand.
    pub fn ea_plus(&self, disp: u32) -> u32 {
        let mut off = self.ea_offset().wrapping_add(disp);
        if !self.insn.addr32 {
            off &= 0xFFFF;
        }
        self.cpu.seg_base(self.ea_segment()).wrapping_add(off)
    }

    pub fn read_rm(&mut self, width: Width) -> u32 {
        match self.insn.rm_reg() {
            Some(r) => self.cpu.reg(width, r as usize),
            None => {
                let addr = self.ea();
                self.mem.read(addr, width)
            }
        }
    }

    pub fn write_rm(&mut self, width: Width, val: u32) {
        match self.insn.rm_reg() {
            Some(r) => self.cpu.set_reg(width, r as usize, val),
            None => {
                let addr = self.ea();
                self.mem.write(addr, width, val);
            }
        }
    }

    // -- Register operand --------------------------------------

    /// The ModR/M reg-field register.
    pub fn reg(&self, width: Width) -> u32 {
        self.cpu.reg(width, self.insn.reg_field() as usize)
    }

    pub fn set_reg(&mut self, width: Width, val: u32) {
        self.cpu.set_reg(width, self.insn.reg_field() as usize, val);
    }

    // -- Flags -------------------------------------------------

    #[inline]
    pub fn apply(&mut self, f: FlagsOut) {
        self.cpu.merge_flags(f.value, f.mask);
    }

    #[inline]
    pub fn cf(&self) -> bool {
        self.cpu.flag(Eflags::CF)
    }

    // -- Control -----------------------------------------------

    /// Set EIP to `target`, truncated to the operand size.
    pub fn jump_near(&mut self, target: u32) {
        self.cpu.eip = if self.insn.op32 {
            target
        } else {
            target & 0xFFFF
        };
    }

    /// Relative branch from the next instruction.
    pub fn jump_rel(&mut self, disp: u32) {
        self.jump_near(self.next.wrapping_add(disp));
    }

    // -- Stack -------------------------------------------------

    pub fn push(&mut self, width: Width, val: u32) {
        push(self.cpu, self.mem, width, val);
    }

    pub fn pop(&mut self, width: Width) -> u32 {
        pop(self.cpu, self.mem, width)
    }

    /// Linear address of a string-source or moffs operand in `seg`.
    pub fn linear(&self, seg: SegReg, off: u32) -> u32 {
        self.cpu.seg_base(seg).wrapping_add(off)
    }
}

/// Wrap a stack offset to the current stack size.
#[inline]
pub fn stack_wrap(cpu: &CpuState, sp: u32) -> u32 {
    if cpu.stack32() {
        sp
    } else {
        sp & 0xFFFF
    }
}

pub fn push<M: GuestMemory + ?Sized>(cpu: &mut CpuState, mem: &mut M, width: Width, val: u32) {
    let sp = stack_wrap(cpu, cpu.sp().wrapping_sub(width.bytes()));
    let addr = cpu.seg_base(SegReg::Ss).wrapping_add(sp);
    mem.write(addr, width, val);
    cpu.set_sp(sp);
}

pub fn pop<M: GuestMemory + ?Sized>(cpu: &mut CpuState, mem: &mut M, width: Width) -> u32 {
    let val = peek_stack(cpu, mem, width, 0);
    let sp = stack_wrap(cpu, cpu.sp().wrapping_add(width.bytes()));
    cpu.set_sp(sp);
    val
}

/// Read the stack `skip` bytes above the top without popping.
pub fn peek_stack<M: GuestMemory + ?Sized>(
    cpu: &CpuState,
    mem: &mut M,
    width: Width,
    skip: u32,
) -> u32 {
    let sp = stack_wrap(cpu, cpu.sp().wrapping_add(skip));
    mem.read(cpu.seg_base(SegReg::Ss).wrapping_add(sp), width)
}

/// Drop `bytes` from the stack.
pub fn release_stack(cpu: &mut CpuState, bytes: u32) {
    let sp = stack_wrap(cpu, cpu.sp().wrapping_add(bytes));
    cpu.set_sp(sp);
}
