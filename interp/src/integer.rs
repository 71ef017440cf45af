//! Integer, data-movement and stack instructions.

use dynx86_core::cpu::{EAX, EBP, EBX, ECX, EDX, ESP};
use dynx86_core::{AluOp, Cond, Eflags, Exception, GuestMemory, SegReg, ShiftOp, Width};

use crate::alu::{self, FlagsOut};
use crate::ctx::{stack_wrap, Exec, Fault};
use crate::system;

pub(crate) fn alu_op<M: GuestMemory + ?Sized>(x: &mut Exec<'_, M>) -> Fault {
    let insn = x.insn;
    let cf = x.cf();
    match insn.opcode {
        0x84 | 0x85 => {
            let w = insn.width_by_bit0();
            let (a, b) = (x.read_rm(w), x.reg(w));
            x.apply(alu::test(w, a, b));
        }
        0xA8 | 0xA9 => {
            let w = insn.width_by_bit0();
            let a = x.cpu.reg(w, EAX);
            x.apply(alu::test(w, a, insn.imm));
        }
        0x80..=0x83 => {
            let w = if matches!(insn.opcode, 0x80 | 0x82) {
                Width::B8
            } else {
                insn.full_width()
            };
            let op = AluOp::from_index(insn.reg_field());
            let a = x.read_rm(w);
            let (r, f) = alu::alu(op, w, a, insn.imm, cf);
            if op.writes_result() {
                x.write_rm(w, r);
            }
            x.apply(f);
        }
        _ => {
            let op = AluOp::from_index(insn.op_byte() >> 3);
            let w = insn.width_by_bit0();
            match insn.op_byte() & 7 {
                0 | 1 => {
                    let (a, b) = (x.read_rm(w), x.reg(w));
                    let (r, f) = alu::alu(op, w, a, b, cf);
                    if op.writes_result() {
                        x.write_rm(w, r);
                    }
                    x.apply(f);
                }
                2 | 3 => {
                    let (a, b) = (x.reg(w), x.read_rm(w));
                    let (r, f) = alu::alu(op, w, a, b, cf);
                    if op.writes_result() {
                        x.set_reg(w, r);
                    }
                    x.apply(f);
                }
                _ => {
                    let a = x.cpu.reg(w, EAX);
                    let (r, f) = alu::alu(op, w, a, insn.imm, cf);
                    if op.writes_result() {
                        x.cpu.set_reg(w, EAX, r);
                    }
                    x.apply(f);
                }
            }
        }
    }
    Ok(())
}

pub(crate) fn inc_dec<M: GuestMemory + ?Sized>(x: &mut Exec<'_, M>) -> Fault {
    let insn = x.insn;
    match insn.opcode {
        0x40..=0x4F => {
            let w = insn.full_width();
            let r = (insn.op_byte() & 7) as usize;
            let a = x.cpu.reg(w, r);
            let (res, f) = if insn.op_byte() < 0x48 {
                alu::inc(w, a)
            } else {
                alu::dec(w, a)
            };
            x.cpu.set_reg(w, r, res);
            x.apply(f);
        }
        _ => {
            // FE /0, /1 and FF /0, /1
            let w = insn.width_by_bit0();
            let a = x.read_rm(w);
            let (res, f) = if insn.reg_field() == 0 {
                alu::inc(w, a)
            } else {
                alu::dec(w, a)
            };
            x.write_rm(w, res);
            x.apply(f);
        }
    }
    Ok(())
}

pub(crate) fn push<M: GuestMemory + ?Sized>(x: &mut Exec<'_, M>) -> Fault {
    let insn = x.insn;
    let w = insn.full_width();
    let val = match insn.opcode {
        0x06 | 0x0E | 0x16 | 0x1E => x.cpu.selectors[(insn.op_byte() >> 3) as usize] as u32,
        0x1A0 => x.cpu.selector(SegReg::Fs) as u32,
        0x1A8 => x.cpu.selector(SegReg::Gs) as u32,
        // PUSH SP stores the value before the decrement.
        0x50..=0x57 => x.cpu.reg(w, (insn.op_byte() & 7) as usize),
        _ => insn.imm,
    };
    x.push(w, val);
    Ok(())
}

pub(crate) fn pop<M: GuestMemory + ?Sized>(x: &mut Exec<'_, M>) -> Fault {
    let insn = x.insn;
    let w = insn.full_width();
    let val = x.pop(w);
    match insn.opcode {
        0x58..=0x5F => x.cpu.set_reg(w, (insn.op_byte() & 7) as usize, val),
        // 8F: the address is computed with the incremented stack pointer.
        _ => x.write_rm(w, val),
    }
    Ok(())
}

pub(crate) fn mov<M: GuestMemory + ?Sized>(x: &mut Exec<'_, M>) -> Fault {
    let insn = x.insn;
    match insn.opcode {
        0x88..=0x8B => {
            let w = insn.width_by_bit0();
            if insn.opcode & 2 == 0 {
                let v = x.reg(w);
                x.write_rm(w, v);
            } else {
                let v = x.read_rm(w);
                x.set_reg(w, v);
            }
        }
        0xA0..=0xA3 => {
            let w = insn.width_by_bit0();
            let addr = x.ea();
            if insn.opcode & 2 == 0 {
                let v = x.mem.read(addr, w);
                x.cpu.set_reg(w, EAX, v);
            } else {
                let v = x.cpu.reg(w, EAX);
                x.mem.write(addr, w, v);
            }
        }
        0xB0..=0xB7 => x.cpu.set_reg(Width::B8, (insn.op_byte() & 7) as usize, insn.imm),
        0xB8..=0xBF => {
            let w = insn.full_width();
            x.cpu.set_reg(w, (insn.op_byte() & 7) as usize, insn.imm);
        }
        _ => {
            // C6/C7
            let w = insn.width_by_bit0();
            x.write_rm(w, insn.imm);
        }
    }
    Ok(())
}

pub(crate) fn lea<M: GuestMemory + ?Sized>(x: &mut Exec<'_, M>) -> Fault {
    let off = x.ea_offset();
    let w = x.insn.full_width();
    x.set_reg(w, off);
    Ok(())
}

pub(crate) fn xchg<M: GuestMemory + ?Sized>(x: &mut Exec<'_, M>) -> Fault {
    let insn = x.insn;
    if matches!(insn.opcode, 0x86 | 0x87) {
        let w = insn.width_by_bit0();
        let (a, b) = (x.read_rm(w), x.reg(w));
        x.write_rm(w, b);
        x.set_reg(w, a);
    } else {
        let w = insn.full_width();
        let r = (insn.op_byte() & 7) as usize;
        let (a, b) = (x.cpu.reg(w, EAX), x.cpu.reg(w, r));
        x.cpu.set_reg(w, EAX, b);
        x.cpu.set_reg(w, r, a);
    }
    Ok(())
}

pub(crate) fn flag_op<M: GuestMemory + ?Sized>(x: &mut Exec<'_, M>) -> Fault {
    let cpu = &mut *x.cpu;
    match x.insn.opcode {
        0x9E => {
            let ah = cpu.reg8(4) as u32;
            let mask = Eflags::SZP | Eflags::AF.bits() | Eflags::CF.bits();
            cpu.merge_flags(ah, mask);
        }
        0x9F => {
            let image = (cpu.eflags & 0xD5) | Eflags::FIXED1.bits();
            cpu.set_reg8(4, image as u8);
        }
        0xF5 => cpu.eflags ^= Eflags::CF.bits(),
        0xF8 => cpu.set_flag(Eflags::CF, false),
        0xF9 => cpu.set_flag(Eflags::CF, true),
        0xFA => {
            system::check_iopl(cpu)?;
            cpu.set_flag(Eflags::IF, false);
        }
        0xFB => {
            system::check_iopl(cpu)?;
            if !cpu.flag(Eflags::IF) {
                cpu.irq_shadow = true;
            }
            cpu.set_flag(Eflags::IF, true);
        }
        0xFC => cpu.set_flag(Eflags::DF, false),
        _ => cpu.set_flag(Eflags::DF, true),
    }
    Ok(())
}

pub(crate) fn convert<M: GuestMemory + ?Sized>(x: &mut Exec<'_, M>) -> Fault {
    let op32 = x.insn.op32;
    let cpu = &mut *x.cpu;
    match (x.insn.opcode, op32) {
        (0x98, false) => {
            let v = Width::B8.sign_extend(cpu.reg8(0) as u32);
            cpu.set_reg16(EAX, v as u16);
        }
        (0x98, true) => cpu.regs[EAX] = Width::B16.sign_extend(cpu.regs[EAX]),
        (_, false) => {
            let hi = if cpu.reg16(EAX) & 0x8000 != 0 { 0xFFFF } else { 0 };
            cpu.set_reg16(EDX, hi);
        }
        (_, true) => cpu.regs[EDX] = ((cpu.regs[EAX] as i32) >> 31) as u32,
    }
    Ok(())
}

pub(crate) fn set_cc<M: GuestMemory + ?Sized>(x: &mut Exec<'_, M>) -> Fault {
    let cond = Cond::from_index(x.insn.op_byte());
    let v = cond.eval(x.cpu.eflags) as u32;
    x.write_rm(Width::B8, v);
    Ok(())
}

pub(crate) fn shift<M: GuestMemory + ?Sized>(x: &mut Exec<'_, M>) -> Fault {
    let insn = x.insn;
    if insn.is_two_byte() {
        // SHLD / SHRD
        let w = insn.full_width();
        let count = if insn.op_byte() & 1 == 0 {
            insn.imm
        } else {
            x.cpu.reg8(ECX) as u32
        } & 0x1F;
        let left = insn.op_byte() < 0xA8;
        let (dst, src) = (x.read_rm(w), x.reg(w));
        if let Some((r, f)) = alu::double_shift(left, w, dst, src, count) {
            x.write_rm(w, r);
            x.apply(f);
        }
        return Ok(());
    }
    let w = insn.width_by_bit0();
    let count = match insn.opcode {
        0xC0 | 0xC1 => insn.imm,
        0xD0 | 0xD1 => 1,
        _ => x.cpu.reg8(ECX) as u32,
    } & 0x1F;
    let op = ShiftOp::from_index(insn.reg_field());
    let a = x.read_rm(w);
    if let Some((r, f)) = alu::shift(op, w, a, count, x.cf()) {
        x.write_rm(w, r);
        x.apply(f);
    }
    Ok(())
}

/// F6/F7: TEST, NOT, NEG, MUL, IMUL, DIV, IDIV.
pub(crate) fn unary<M: GuestMemory + ?Sized>(x: &mut Exec<'_, M>) -> Fault {
    let insn = x.insn;
    let w = insn.width_by_bit0();
    let a = x.read_rm(w);
    match insn.reg_field() {
        0 | 1 => x.apply(alu::test(w, a, insn.imm)),
        2 => x.write_rm(w, !a),
        3 => {
            let (r, f) = alu::neg(w, a);
            x.write_rm(w, r);
            x.apply(f);
        }
        4 => mul(x, w, a, false),
        5 => mul(x, w, a, true),
        6 => div(x, w, a, false)?,
        _ => div(x, w, a, true)?,
    }
    Ok(())
}

/// Accumulator multiply into AX, DX:AX or EDX:EAX.
fn mul<M: GuestMemory + ?Sized>(x: &mut Exec<'_, M>, w: Width, src: u32, signed: bool) {
    let cpu = &mut *x.cpu;
    let acc = cpu.reg(w, EAX);
    let (lo, hi, overflow) = if signed {
        let p = w.sign_extend(acc) as i32 as i64 * w.sign_extend(src) as i32 as i64;
        let lo = p as u32 & w.mask();
        let fits = p == w.sign_extend(lo) as i32 as i64;
        (lo, (p >> w.bits()) as u32 & w.mask(), !fits)
    } else {
        let p = acc as u64 * src as u64;
        let hi = (p >> w.bits()) as u32 & w.mask();
        (p as u32 & w.mask(), hi, hi != 0)
    };
    match w {
        Width::B8 => cpu.set_reg16(EAX, (hi << 8 | lo) as u16),
        _ => {
            cpu.set_reg(w, EAX, lo);
            cpu.set_reg(w, EDX, hi);
        }
    }
    let f = alu::mul_flags(overflow);
    cpu.merge_flags(f.value, f.mask);
}

/// Accumulator divide. Flags are left unchanged.
fn div<M: GuestMemory + ?Sized>(x: &mut Exec<'_, M>, w: Width, divisor: u32, signed: bool) -> Fault {
    let cpu = &mut *x.cpu;
    if divisor == 0 {
        return Err(Exception::DivideError);
    }
    let dividend: u64 = match w {
        Width::B8 => cpu.reg16(EAX) as u64,
        Width::B16 => (cpu.reg16(EDX) as u64) << 16 | cpu.reg16(EAX) as u64,
        Width::B32 => (cpu.regs[EDX] as u64) << 32 | cpu.regs[EAX] as u64,
    };
    let (q, r) = if signed {
        let bits = w.bits() * 2;
        let n = ((dividend << (64 - bits)) as i64) >> (64 - bits);
        let d = w.sign_extend(divisor) as i32 as i64;
        let (q, r) = (n.wrapping_div(d), n.wrapping_rem(d));
        let max = (w.sign_bit() - 1) as i64;
        if q > max || q < -max - 1 {
            return Err(Exception::DivideError);
        }
        (q as u32 & w.mask(), r as u32 & w.mask())
    } else {
        let q = dividend / divisor as u64;
        if q > w.mask() as u64 {
            return Err(Exception::DivideError);
        }
        (q as u32, (dividend % divisor as u64) as u32)
    };
    match w {
        Width::B8 => cpu.set_reg16(EAX, (r << 8 | q) as u16),
        _ => {
            cpu.set_reg(w, EAX, q);
            cpu.set_reg(w, EDX, r);
        }
    }
    Ok(())
}

pub(crate) fn mov_ext<M: GuestMemory + ?Sized>(x: &mut Exec<'_, M>) -> Fault {
    let insn = x.insn;
    let from = if insn.op_byte() & 1 == 0 {
        Width::B8
    } else {
        Width::B16
    };
    let v = x.read_rm(from);
    let v = if insn.op_byte() >= 0xBE {
        from.sign_extend(v)
    } else {
        v
    };
    x.set_reg(insn.full_width(), v);
    Ok(())
}

/// BT/BTS/BTR/BTC, BSF/BSR.
pub(crate) fn bit<M: GuestMemory + ?Sized>(x: &mut Exec<'_, M>) -> Fault {
    let insn = x.insn;
    let w = insn.full_width();
    let bits = w.bits();

    if matches!(insn.op_byte(), 0xBC | 0xBD) {
        let src = x.read_rm(w);
        if src == 0 {
            x.cpu.set_flag(Eflags::ZF, true);
        } else {
            let idx = if insn.op_byte() == 0xBC {
                src.trailing_zeros()
            } else {
                31 - src.leading_zeros()
            };
            x.set_reg(w, idx);
            x.cpu.set_flag(Eflags::ZF, false);
        }
        return Ok(());
    }

    // /4../7 of 0FBA, or the register-offset forms.
    let (op, offset, reg_offset) = if insn.op_byte() == 0xBA {
        (insn.reg_field() & 3, insn.imm, false)
    } else {
        ((insn.op_byte() >> 3) & 3, x.reg(w), true)
    };

    let bit = offset & (bits - 1);
    let addr = if insn.rm_reg().is_some() {
        None
    } else if reg_offset {
        // The signed offset selects a word/dword relative to the operand.
        let signed = w.sign_extend(offset) as i32;
        let disp = (signed >> bits.trailing_zeros()) * w.bytes() as i32;
        Some(x.ea_plus(disp as u32))
    } else {
        Some(x.ea())
    };
    let val = match addr {
        Some(a) => x.mem.read(a, w),
        None => x.read_rm(w),
    };
    let carry = (val >> bit) & 1 != 0;
    let new = match op {
        0 => None,
        1 => Some(val | 1 << bit),
        2 => Some(val & !(1 << bit)),
        _ => Some(val ^ 1 << bit),
    };
    if let Some(new) = new {
        match addr {
            Some(a) => x.mem.write(a, w, new),
            None => x.write_rm(w, new),
        }
    }
    x.cpu.set_flag(Eflags::CF, carry);
    Ok(())
}

/// DAA, DAS, AAA, AAS, AAM, AAD.
pub(crate) fn bcd<M: GuestMemory + ?Sized>(x: &mut Exec<'_, M>) -> Fault {
    let cpu = &mut *x.cpu;
    let al = cpu.reg8(0);
    let af = cpu.flag(Eflags::AF);
    let cf = cpu.flag(Eflags::CF);
    let af_cf = Eflags::AF.bits() | Eflags::CF.bits();
    let flag = |on: bool, f: Eflags| if on { f.bits() } else { 0 };

    match x.insn.op_byte() {
        0x27 | 0x2F => {
            let sub = x.insn.op_byte() == 0x2F;
            let mut r = al;
            let new_af = (al & 0xF) > 9 || af;
            if new_af {
                r = if sub { r.wrapping_sub(6) } else { r.wrapping_add(6) };
            }
            // The high-digit adjust alone decides CF.
            let new_cf = al > 0x99 || cf;
            if new_cf {
                r = if sub {
                    r.wrapping_sub(0x60)
                } else {
                    r.wrapping_add(0x60)
                };
            }
            cpu.set_reg8(0, r);
            let value = alu::szp(Width::B8, r as u32)
                | flag(new_af, Eflags::AF)
                | flag(new_cf, Eflags::CF);
            cpu.merge_flags(value, Eflags::SZP | af_cf);
        }
        0x37 | 0x3F => {
            let adjust = (al & 0xF) > 9 || af;
            if adjust {
                let ax = cpu.reg16(EAX);
                let ax = if x.insn.op_byte() == 0x37 {
                    ax.wrapping_add(0x106)
                } else {
                    ax.wrapping_sub(6).wrapping_sub(0x100)
                };
                cpu.set_reg16(EAX, ax);
            }
            let al = cpu.reg8(0) & 0xF;
            cpu.set_reg8(0, al);
            let value = flag(adjust, Eflags::AF) | flag(adjust, Eflags::CF);
            cpu.merge_flags(value, af_cf);
        }
        0xD4 => {
            let base = x.insn.imm as u8;
            if base == 0 {
                return Err(Exception::DivideError);
            }
            cpu.set_reg8(4, al / base);
            cpu.set_reg8(0, al % base);
            let value = alu::szp(Width::B8, (al % base) as u32);
            cpu.merge_flags(value, Eflags::SZP);
        }
        _ => {
            let base = x.insn.imm as u8;
            let r = al.wrapping_add(cpu.reg8(4).wrapping_mul(base));
            cpu.set_reg16(EAX, r as u16);
            cpu.merge_flags(alu::szp(Width::B8, r as u32), Eflags::SZP);
        }
    }
    Ok(())
}

/// PUSHA, POPA, PUSHF, POPF, ENTER, LEAVE.
pub(crate) fn stack<M: GuestMemory + ?Sized>(x: &mut Exec<'_, M>) -> Fault {
    let insn = x.insn;
    let w = insn.full_width();
    match insn.opcode {
        0x60 => {
            let sp = x.cpu.reg(w, ESP);
            for r in 0..8 {
                let v = if r == ESP { sp } else { x.cpu.reg(w, r) };
                x.push(w, v);
            }
        }
        0x61 => {
            for r in (0..8).rev() {
                let v = x.pop(w);
                if r != ESP {
                    x.cpu.set_reg(w, r, v);
                }
            }
        }
        0x9C => {
            // VM and RF never appear in the pushed image.
            let image = x.cpu.eflags & !(Eflags::VM.bits() | Eflags::RF.bits());
            x.push(w, image);
        }
        0x9D => {
            let v = crate::ctx::peek_stack(x.cpu, x.mem, w, 0);
            crate::ctx::release_stack(x.cpu, w.bytes());
            system::write_flags(x.cpu, v, insn.op32);
        }
        0xC8 => enter(x, w),
        _ => {
            // LEAVE
            let bp = stack_wrap(x.cpu, x.cpu.regs[EBP]);
            x.cpu.set_sp(bp);
            let v = x.pop(w);
            x.cpu.set_reg(w, EBP, v);
        }
    }
    Ok(())
}

fn enter<M: GuestMemory + ?Sized>(x: &mut Exec<'_, M>, w: Width) {
    let size = x.insn.imm & 0xFFFF;
    let level = x.insn.imm2 & 0x1F;
    let bp = x.cpu.reg(w, EBP);
    x.push(w, bp);
    let frame = x.cpu.sp();
    if level > 0 {
        let mut ebp = x.cpu.regs[EBP];
        for _ in 1..level {
            ebp = stack_wrap(x.cpu, ebp.wrapping_sub(w.bytes()));
            let addr = x.cpu.seg_base(SegReg::Ss).wrapping_add(ebp);
            let v = x.mem.read(addr, w);
            x.push(w, v);
        }
        x.push(w, frame);
    }
    x.cpu.set_reg(w, EBP, frame);
    let sp = stack_wrap(x.cpu, x.cpu.sp().wrapping_sub(size));
    x.cpu.set_sp(sp);
}

/// IMUL with immediate or two operands, SALC, XLAT, BSWAP.
pub(crate) fn misc<M: GuestMemory + ?Sized>(x: &mut Exec<'_, M>) -> Fault {
    let insn = x.insn;
    match insn.opcode {
        0x69 | 0x6B | 0x1AF => {
            let w = insn.full_width();
            let a = x.read_rm(w);
            let b = if insn.opcode == 0x1AF { x.reg(w) } else { insn.imm };
            let p = w.sign_extend(a) as i32 as i64 * w.sign_extend(b) as i32 as i64;
            let r = p as u32 & w.mask();
            x.set_reg(w, r);
            let overflow = p != w.sign_extend(r) as i32 as i64;
            x.apply(alu::mul_flags(overflow));
        }
        0xD6 => {
            let v = if x.cf() { 0xFF } else { 0 };
            x.cpu.set_reg8(0, v);
        }
        0xD7 => {
            let mut off = x.cpu.regs[EBX].wrapping_add(x.cpu.reg8(0) as u32);
            if !insn.addr32 {
                off &= 0xFFFF;
            }
            let addr = x.linear(insn.segment_or(SegReg::Ds), off);
            let v = x.mem.read_u8(addr);
            x.cpu.set_reg8(0, v);
        }
        _ => {
            let r = (insn.op_byte() & 7) as usize;
            if insn.op32 {
                x.cpu.regs[r] = x.cpu.regs[r].swap_bytes();
            } else {
                x.cpu.set_reg16(r, 0);
            }
        }
    }
    Ok(())
}

/// Flags produced by a string compare step.
pub(crate) fn compare(w: Width, a: u32, b: u32) -> FlagsOut {
    let (_, f) = alu::sub(w, a, b, false);
    FlagsOut::new(f, Eflags::ARITH.bits())
}
