//! Reference interpreter for the guest x86.
//!
//! Executes one decoded instruction at a time directly against
//! `CpuState` and a `GuestMemory`. The dynamic core falls back to
//! it for instructions it does not translate, for single-stepping
//! and for pages that are modified too often to be worth
//! translating; the differential tests use it as the oracle.

mod alu;
mod control;
mod ctx;
pub mod fpu;
mod integer;
mod string;
pub mod system;

use dynx86_core::{CpuState, Eflags, Exception, GuestMemory, SegReg};
use dynx86_decode::{decode, next_eip, OpFamily};
use tracing::trace;

pub use ctx::Fault;
pub use system::{deliver_exception, interrupt, Descriptor, Shutdown};

use crate::ctx::Exec;

/// Result of executing a single instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// The instruction completed.
    Normal,
    /// The CPU is halted, waiting for an interrupt.
    Halted,
    /// A guest exception was raised and delivered.
    Exception(Exception),
    /// Exception delivery failed with a double fault.
    Shutdown,
}

/// Execute one instruction at CS:EIP.
///
/// Faults restore EIP to the faulting instruction before the
/// exception is delivered. With TF set on entry, a debug trap
/// follows the instruction.
pub fn step<M: GuestMemory + ?Sized>(cpu: &mut CpuState, mem: &mut M) -> StepOutcome {
    if cpu.halted {
        return StepOutcome::Halted;
    }
    cpu.irq_shadow = false;
    let single_step = cpu.flag(Eflags::TF);
    let mode = cpu.mode();
    let start = cpu.eip;

    let insn = match decode(&*mem, cpu.seg_base(SegReg::Cs), start, mode) {
        Ok(insn) => insn,
        Err(e) => {
            trace!(eip = start, error = %e, "decode fault");
            return raise(cpu, mem, e.exception());
        }
    };
    let next = next_eip(start, insn.len, mode.code32);
    cpu.eip = next;

    let mut x = Exec {
        cpu: &mut *cpu,
        mem: &mut *mem,
        insn,
        next,
        delivered: false,
    };
    let result = execute(&mut x);
    let delivered = x.delivered;

    if let Err(exc) = result {
        if !exc.is_trap() {
            cpu.eip = start;
        }
        return raise(cpu, mem, exc);
    }
    if cpu.halted {
        return StepOutcome::Halted;
    }
    if single_step && !delivered {
        return raise(cpu, mem, Exception::Debug);
    }
    StepOutcome::Normal
}

fn raise<M: GuestMemory + ?Sized>(cpu: &mut CpuState, mem: &mut M, exc: Exception) -> StepOutcome {
    match deliver_exception(cpu, mem, exc) {
        Ok(()) => StepOutcome::Exception(exc),
        Err(Shutdown) => StepOutcome::Shutdown,
    }
}

fn execute<M: GuestMemory + ?Sized>(x: &mut Exec<'_, M>) -> Fault {
    use OpFamily::*;
    match x.insn.family {
        Alu => integer::alu_op(x),
        IncDec => integer::inc_dec(x),
        Push => integer::push(x),
        Pop => integer::pop(x),
        Mov => integer::mov(x),
        MovSeg => system::mov_seg(x),
        Lea => integer::lea(x),
        Xchg => integer::xchg(x),
        Jcc => control::jcc(x),
        JmpNear => control::jmp_near(x),
        CallNear => control::call_near(x),
        RetNear => control::ret_near(x),
        FarControl => control::far_control(x),
        Loop => control::loop_op(x),
        FlagOp => integer::flag_op(x),
        Convert => integer::convert(x),
        SetCc => integer::set_cc(x),
        Shift => integer::shift(x),
        Unary => integer::unary(x),
        Group5 => control::group5(x),
        MovExt => integer::mov_ext(x),
        Bit => integer::bit(x),
        String => string::string_op(x),
        Fpu => fpu::escape(x),
        System => system::system_insn(x),
        Io => system::io(x),
        Bcd => integer::bcd(x),
        Interrupt => system::interrupt_insn(x),
        Nop => Ok(()),
        Stack => integer::stack(x),
        Misc => integer::misc(x),
    }
}

/// Accept an external interrupt at an instruction boundary.
///
/// `pending` holds a vector raised through the embedding API; it is
/// taken before the memory system's controller is polled. Nothing
/// is accepted while IF is clear or an interrupt shadow is active.
/// Returns `Shutdown` if delivery itself failed.
pub fn service_interrupts<M: GuestMemory + ?Sized>(
    cpu: &mut CpuState,
    mem: &mut M,
    pending: &mut Option<u8>,
) -> StepOutcome {
    if !cpu.flag(Eflags::IF) || cpu.irq_shadow {
        return StepOutcome::Normal;
    }
    let Some(vector) = pending.take().or_else(|| mem.poll_interrupt()) else {
        return StepOutcome::Normal;
    };
    match interrupt(cpu, mem, vector, None, false) {
        Ok(()) => StepOutcome::Normal,
        Err(exc) => raise(cpu, mem, exc),
    }
}

/// Why [`Interpreter::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunExit {
    CyclesExhausted,
    Halted,
    Shutdown,
}

/// A CPU driven purely by the interpreter.
pub struct Interpreter<M> {
    pub cpu: CpuState,
    pub mem: M,
    pending_irq: Option<u8>,
}

impl<M: GuestMemory> Interpreter<M> {
    pub fn new(mem: M) -> Self {
        Self::with_state(CpuState::new(), mem)
    }

    pub fn with_state(cpu: CpuState, mem: M) -> Self {
        Self {
            cpu,
            mem,
            pending_irq: None,
        }
    }

    pub fn step(&mut self) -> StepOutcome {
        step(&mut self.cpu, &mut self.mem)
    }

    /// Latch an external interrupt, delivered once IF allows.
    pub fn raise_interrupt(&mut self, vector: u8) {
        self.pending_irq = Some(vector);
    }

    /// Run for up to `cycles` instructions, one cycle each.
    pub fn run(&mut self, cycles: u32) -> RunExit {
        self.cpu.cycles = cycles.min(i32::MAX as u32) as i32;
        loop {
            if service_interrupts(&mut self.cpu, &mut self.mem, &mut self.pending_irq)
                == StepOutcome::Shutdown
            {
                return RunExit::Shutdown;
            }
            if self.cpu.halted {
                return RunExit::Halted;
            }
            if self.cpu.cycles <= 0 {
                return RunExit::CyclesExhausted;
            }
            self.cpu.cycles -= 1;
            match self.step() {
                StepOutcome::Normal | StepOutcome::Exception(_) => {}
                StepOutcome::Halted => return RunExit::Halted,
                StepOutcome::Shutdown => return RunExit::Shutdown,
            }
        }
    }
}
