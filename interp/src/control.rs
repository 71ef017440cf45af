//! Near and far control transfers.

use dynx86_core::cpu::ECX;
use dynx86_core::{Cond, Eflags, GuestMemory, Width};

use crate::ctx::{release_stack, Exec, Fault};
use crate::{integer, system};

pub(crate) fn jcc<M: GuestMemory + ?Sized>(x: &mut Exec<'_, M>) -> Fault {
    if Cond::from_index(x.insn.op_byte()).eval(x.cpu.eflags) {
        x.jump_rel(x.insn.imm);
    }
    Ok(())
}

pub(crate) fn jmp_near<M: GuestMemory + ?Sized>(x: &mut Exec<'_, M>) -> Fault {
    x.jump_rel(x.insn.imm);
    Ok(())
}

pub(crate) fn call_near<M: GuestMemory + ?Sized>(x: &mut Exec<'_, M>) -> Fault {
    let w = x.insn.full_width();
    x.push(w, x.next);
    x.jump_rel(x.insn.imm);
    Ok(())
}

pub(crate) fn ret_near<M: GuestMemory + ?Sized>(x: &mut Exec<'_, M>) -> Fault {
    let w = x.insn.full_width();
    let target = x.pop(w);
    if x.insn.opcode == 0xC2 {
        release_stack(x.cpu, x.insn.imm);
    }
    x.jump_near(target);
    Ok(())
}

/// LOOPNE, LOOPE, LOOP, JCXZ. The counter is CX or ECX by address size.
pub(crate) fn loop_op<M: GuestMemory + ?Sized>(x: &mut Exec<'_, M>) -> Fault {
    let cw = Width::full(x.insn.addr32);
    let count = x.cpu.reg(cw, ECX);
    let taken = if x.insn.opcode == 0xE3 {
        count == 0
    } else {
        let count = count.wrapping_sub(1) & cw.mask();
        x.cpu.set_reg(cw, ECX, count);
        let zf = x.cpu.flag(Eflags::ZF);
        count != 0
            && match x.insn.opcode {
                0xE0 => !zf,
                0xE1 => zf,
                _ => true,
            }
    };
    if taken {
        x.jump_rel(x.insn.imm);
    }
    Ok(())
}

/// CALL ptr16:x, JMP ptr16:x, RETF.
pub(crate) fn far_control<M: GuestMemory + ?Sized>(x: &mut Exec<'_, M>) -> Fault {
    let insn = x.insn;
    match insn.opcode {
        0x9A => system::far_call(x, insn.imm2 as u16, insn.imm),
        0xEA => system::far_jump(x, insn.imm2 as u16, insn.imm),
        0xCA => system::far_return(x, insn.imm & 0xFFFF),
        _ => system::far_return(x, 0),
    }
}

/// FF group: INC, DEC, indirect CALL/JMP near and far, PUSH.
pub(crate) fn group5<M: GuestMemory + ?Sized>(x: &mut Exec<'_, M>) -> Fault {
    let w = x.insn.full_width();
    match x.insn.reg_field() {
        0 | 1 => integer::inc_dec(x),
        2 => {
            let target = x.read_rm(w);
            x.push(w, x.next);
            x.jump_near(target);
            Ok(())
        }
        3 | 5 => {
            let (lo, hi) = (x.ea(), x.ea_plus(w.bytes()));
            let off = x.mem.read(lo, w);
            let sel = x.mem.read_u16(hi);
            if x.insn.reg_field() == 3 {
                system::far_call(x, sel, off)
            } else {
                system::far_jump(x, sel, off)
            }
        }
        4 => {
            let target = x.read_rm(w);
            x.jump_near(target);
            Ok(())
        }
        _ => {
            let v = x.read_rm(w);
            x.push(w, v);
            Ok(())
        }
    }
}
