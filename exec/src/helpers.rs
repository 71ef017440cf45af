//! Native helpers called from translated code.
//!
//! Every helper has the C signature `fn(env, u32, u32) -> u32`.
//! `env` is the environment pointer the trampoline was entered
//! with: a `DynCore<M>`, whose first field is the guest `CpuState`.

use dynx86_core::cpu::ip_add;
use dynx86_core::{CpuState, Eflags, GuestMemory, SegReg, Width};
use dynx86_decode::fpu::{FADD, FCOM, FCOMP, FDIV, FDIVR, FMUL, FSUB, FSUBR};
use dynx86_frontend::HelperTable;
use dynx86_interp::fpu::{execute_escape, fpu_arith_rr, unpack_escape};
use dynx86_interp::{step, StepOutcome};
use tracing::trace;

use crate::dispatch::DynCore;
use crate::tracker::TrackedMemory;

/// Recover the core from the environment pointer.
///
/// # Safety
/// `env` must be the pointer the dispatcher entered the running
/// block with, and no other reference to the core may be live.
#[inline]
unsafe fn core<'a, M>(env: *mut CpuState) -> &'a mut DynCore<M> {
    &mut *(env as *mut DynCore<M>)
}

extern "C" fn read_u8<M: GuestMemory>(env: *mut CpuState, addr: u32, _: u32) -> u32 {
    // SAFETY: called from translated code with its env pointer.
    let core = unsafe { core::<M>(env) };
    core.mem.read_u8(addr) as u32
}

extern "C" fn read_u16<M: GuestMemory>(env: *mut CpuState, addr: u32, _: u32) -> u32 {
    // SAFETY: called from translated code with its env pointer.
    let core = unsafe { core::<M>(env) };
    core.mem.read_u16(addr) as u32
}

extern "C" fn read_u32<M: GuestMemory>(env: *mut CpuState, addr: u32, _: u32) -> u32 {
    // SAFETY: called from translated code with its env pointer.
    let core = unsafe { core::<M>(env) };
    core.mem.read_u32(addr)
}

fn write<M: GuestMemory>(env: *mut CpuState, addr: u32, width: Width, val: u32) -> u32 {
    // SAFETY: called from translated code with its env pointer.
    let core = unsafe { core::<M>(env) };
    let mut mem = TrackedMemory::new(&mut core.mem, &mut core.cache);
    mem.write(addr, width, val);
    if mem.hit() {
        core.cpu.exit_request = 1;
    }
    0
}

extern "C" fn write_u8<M: GuestMemory>(env: *mut CpuState, addr: u32, val: u32) -> u32 {
    write::<M>(env, addr, Width::B8, val)
}

extern "C" fn write_u16<M: GuestMemory>(env: *mut CpuState, addr: u32, val: u32) -> u32 {
    write::<M>(env, addr, Width::B16, val)
}

extern "C" fn write_u32<M: GuestMemory>(env: *mut CpuState, addr: u32, val: u32) -> u32 {
    write::<M>(env, addr, Width::B32, val)
}

/// Interpret the `len`-byte instruction at EIP.
///
/// Returns non-zero when the block must not continue with the next
/// instruction in line.
extern "C" fn interpret<M: GuestMemory>(env: *mut CpuState, len: u32, _: u32) -> u32 {
    // SAFETY: called from translated code with its env pointer.
    let core = unsafe { core::<M>(env) };
    core.stats.callouts += 1;

    let cpu = &mut core.cpu;
    let cs_base = cpu.seg_base(SegReg::Cs);
    let mode = cpu.mode().key();
    let irq_enabled = cpu.flag(Eflags::IF);
    let expected = ip_add(cpu.eip, len, cpu.code32());

    let mut mem = TrackedMemory::new(&mut core.mem, &mut core.cache);
    let outcome = step(cpu, &mut mem);
    if mem.hit() {
        cpu.exit_request = 1;
    }

    match outcome {
        StepOutcome::Normal => {}
        StepOutcome::Halted => return 1,
        StepOutcome::Exception(exc) => {
            trace!(?exc, eip = format_args!("{:#x}", cpu.eip), "exception in call-out");
            core.stats.exceptions += 1;
            return 1;
        }
        StepOutcome::Shutdown => {
            core.shutdown = true;
            return 1;
        }
    }

    let redirect = cpu.eip != expected
        || cpu.seg_base(SegReg::Cs) != cs_base
        || cpu.mode().key() != mode
        || cpu.flag(Eflags::IF) != irq_enabled
        || cpu.flag(Eflags::TF)
        || cpu.irq_shadow
        || cpu.exit_request != 0;
    redirect as u32
}

/// Execute an x87 escape on `operand` (linear address or ST slot).
/// Stack adjustments were already made in line.
extern "C" fn fpu_escape<M: GuestMemory>(env: *mut CpuState, packed: u32, operand: u32) -> u32 {
    // SAFETY: called from translated code with its env pointer.
    let core = unsafe { core::<M>(env) };
    let (esc, modrm, op32) = unpack_escape(packed);
    let mut mem = TrackedMemory::new(&mut core.mem, &mut core.cache);
    execute_escape(&mut core.cpu, &mut mem, esc, modrm, op32, operand);
    if mem.hit() {
        core.cpu.exit_request = 1;
    }
    0
}

/// Helper addresses for a core over memory type `M`.
pub fn helper_table<M: GuestMemory>() -> HelperTable {
    HelperTable {
        read: [
            read_u8::<M> as usize,
            read_u16::<M> as usize,
            read_u32::<M> as usize,
        ],
        write: [
            write_u8::<M> as usize,
            write_u16::<M> as usize,
            write_u32::<M> as usize,
        ],
        interpret: interpret::<M> as usize,
        fpu_escape: fpu_escape::<M> as usize,
        // Indexed by the D8 `/r` operation.
        fpu_arith: [
            fpu_arith_rr::<FADD> as usize,
            fpu_arith_rr::<FMUL> as usize,
            fpu_arith_rr::<FCOM> as usize,
            fpu_arith_rr::<FCOMP> as usize,
            fpu_arith_rr::<FSUB> as usize,
            fpu_arith_rr::<FSUBR> as usize,
            fpu_arith_rr::<FDIV> as usize,
            fpu_arith_rr::<FDIVR> as usize,
        ],
    }
}
