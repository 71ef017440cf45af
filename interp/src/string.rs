//! String instructions with their REP forms.
//!
//! A repeated instruction runs to completion in a single step.

use dynx86_core::cpu::{EAX, ECX, EDI, EDX, ESI};
use dynx86_core::{Eflags, GuestMemory, SegReg, Width};
use dynx86_decode::Prefixes;

use crate::ctx::{Exec, Fault};
use crate::integer::compare;
use crate::system::check_iopl;

#[derive(Clone, Copy, PartialEq, Eq)]
enum StrOp {
    Ins,
    Outs,
    Movs,
    Cmps,
    Stos,
    Lods,
    Scas,
}

pub(crate) fn string_op<M: GuestMemory + ?Sized>(x: &mut Exec<'_, M>) -> Fault {
    let insn = x.insn;
    let op = match insn.op_byte() {
        0x6C | 0x6D => StrOp::Ins,
        0x6E | 0x6F => StrOp::Outs,
        0xA4 | 0xA5 => StrOp::Movs,
        0xA6 | 0xA7 => StrOp::Cmps,
        0xAA | 0xAB => StrOp::Stos,
        0xAC | 0xAD => StrOp::Lods,
        _ => StrOp::Scas,
    };
    if matches!(op, StrOp::Ins | StrOp::Outs) {
        check_iopl(x.cpu)?;
    }
    let w = insn.width_by_bit0();
    let aw = Width::full(insn.addr32);
    let step = if x.cpu.flag(Eflags::DF) {
        w.bytes().wrapping_neg()
    } else {
        w.bytes()
    };
    let src_seg = insn.segment_or(SegReg::Ds);
    let rep = insn.rep();
    let compares = matches!(op, StrOp::Cmps | StrOp::Scas);

    loop {
        if rep && x.cpu.reg(aw, ECX) == 0 {
            break;
        }
        let si = x.cpu.reg(aw, ESI);
        let di = x.cpu.reg(aw, EDI);
        let src = x.linear(src_seg, si);
        let dst = x.linear(SegReg::Es, di);
        let port = x.cpu.reg16(EDX);

        match op {
            StrOp::Ins => {
                let v = x.mem.io_read(port, w);
                x.mem.write(dst, w, v);
            }
            StrOp::Outs => {
                let v = x.mem.read(src, w);
                x.mem.io_write(port, w, v);
            }
            StrOp::Movs => {
                let v = x.mem.read(src, w);
                x.mem.write(dst, w, v);
            }
            StrOp::Cmps => {
                let a = x.mem.read(src, w);
                let b = x.mem.read(dst, w);
                x.apply(compare(w, a, b));
            }
            StrOp::Stos => {
                let v = x.cpu.reg(w, EAX);
                x.mem.write(dst, w, v);
            }
            StrOp::Lods => {
                let v = x.mem.read(src, w);
                x.cpu.set_reg(w, EAX, v);
            }
            StrOp::Scas => {
                let a = x.cpu.reg(w, EAX);
                let b = x.mem.read(dst, w);
                x.apply(compare(w, a, b));
            }
        }

        if matches!(op, StrOp::Outs | StrOp::Movs | StrOp::Cmps | StrOp::Lods) {
            x.cpu.set_reg(aw, ESI, si.wrapping_add(step));
        }
        if !matches!(op, StrOp::Outs | StrOp::Lods) {
            x.cpu.set_reg(aw, EDI, di.wrapping_add(step));
        }

        if !rep {
            break;
        }
        let count = x.cpu.reg(aw, ECX).wrapping_sub(1);
        x.cpu.set_reg(aw, ECX, count);
        if compares {
            let zf = x.cpu.flag(Eflags::ZF);
            let repe = insn.prefixes.contains(Prefixes::REP);
            if (repe && !zf) || (!repe && zf) {
                break;
            }
        }
    }
    Ok(())
}
