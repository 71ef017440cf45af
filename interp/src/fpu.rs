//! x87 escape execution on the `f64` register model.
//!
//! Stack pushes and pops described by `dynx86_decode::fpu::shape`
//! are applied by the caller around [`execute_escape`], so the
//! interpreter and translated code share one body per form.

use dynx86_core::cpu::EAX;
use dynx86_core::fpu::{FPU_TEMP, SW_C0, SW_C1, SW_C2, SW_C3, TAG_EMPTY, TAG_VALID};
use dynx86_core::{CpuState, Exception, FpuState, GuestMemory};
use dynx86_decode::fpu::{arith_form, shape, FADD, FCOM, FCOMP, FDIV, FDIVR, FMUL, FSUB, FSUBR};

use crate::ctx::{Exec, Fault};

/// Interpreter entry for D8-DF.
pub(crate) fn escape<M: GuestMemory + ?Sized>(x: &mut Exec<'_, M>) -> Fault {
    let esc = x.insn.op_byte();
    let modrm = x.insn.modrm.map_or(0, |m| m.byte());
    let form = shape(esc, modrm).ok_or(Exception::InvalidOpcode)?;
    if form.push {
        x.cpu.fpu.prep_push();
    }
    let operand = if x.insn.mem.is_some() {
        x.ea()
    } else {
        x.cpu.fpu.st((modrm & 7) as u32) as u32
    };
    execute_escape(x.cpu, x.mem, esc, modrm, x.insn.op32, operand);
    for _ in 0..form.pops {
        x.cpu.fpu.pop();
    }
    Ok(())
}

/// Pack an escape form into one helper argument.
#[inline]
pub const fn pack_escape(esc: u8, modrm: u8, op32: bool) -> u32 {
    (esc & 7) as u32 | (modrm as u32) << 3 | (op32 as u32) << 11
}

/// Inverse of [`pack_escape`]: (escape opcode, ModR/M, op32).
#[inline]
pub const fn unpack_escape(packed: u32) -> (u8, u8, bool) {
    (0xD8 | (packed & 7) as u8, (packed >> 3) as u8, packed & (1 << 11) != 0)
}

/// Execute the body of one escape instruction. `operand` is the
/// linear address for memory forms, or the physical slot of ST(i)
/// (taken after any push) for register forms.
pub fn execute_escape<M: GuestMemory + ?Sized>(
    cpu: &mut CpuState,
    mem: &mut M,
    esc: u8,
    modrm: u8,
    op32: bool,
    operand: u32,
) {
    if modrm < 0xC0 {
        memory_form(cpu, mem, esc, (modrm >> 3) & 7, op32, operand);
    } else {
        register_form(cpu, esc, modrm, (operand & 7) as usize);
    }
}

/// `dst = dst op src` on physical slots, or a compare for FCOM/FCOMP.
pub fn arith(fpu: &mut FpuState, op: u8, dst: usize, src: usize) {
    let (a, b) = (fpu.regs[dst], fpu.regs[src]);
    let r = match op {
        FADD => a + b,
        FMUL => a * b,
        FCOM | FCOMP => {
            compare(fpu, a, b);
            return;
        }
        FSUB => a - b,
        FSUBR => b - a,
        FDIV => a / b,
        FDIVR => b / a,
        _ => return,
    };
    fpu.regs[dst] = r;
}

/// Register-register arithmetic called from translated code with
/// physical slot indices. `OP` is one of the D8 `/r` operations.
pub extern "C" fn fpu_arith_rr<const OP: u8>(env: *mut CpuState, dst: u32, src: u32) -> u32 {
    // SAFETY: translated code passes its environment pointer, whose
    // pointee starts with the guest CpuState and is exclusively ours
    // for the duration of the call.
    let cpu = unsafe { &mut *env };
    arith(&mut cpu.fpu, OP, (dst & 7) as usize, (src & 7) as usize);
    0
}

fn compare(fpu: &mut FpuState, a: f64, b: f64) {
    let cc = if a.is_nan() || b.is_nan() {
        SW_C3 | SW_C2 | SW_C0
    } else if a < b {
        SW_C0
    } else if a == b {
        SW_C3
    } else {
        0
    };
    fpu.set_cc(cc);
}

fn read_u64<M: GuestMemory + ?Sized>(mem: &mut M, addr: u32) -> u64 {
    mem.read_u32(addr) as u64 | (mem.read_u32(addr.wrapping_add(4)) as u64) << 32
}

fn write_u64<M: GuestMemory + ?Sized>(mem: &mut M, addr: u32, v: u64) {
    mem.write_u32(addr, v as u32);
    mem.write_u32(addr.wrapping_add(4), (v >> 32) as u32);
}

fn read_bytes<M: GuestMemory + ?Sized, const N: usize>(mem: &mut M, addr: u32) -> [u8; N] {
    let mut out = [0u8; N];
    for (i, b) in out.iter_mut().enumerate() {
        *b = mem.read_u8(addr.wrapping_add(i as u32));
    }
    out
}

fn write_bytes<M: GuestMemory + ?Sized>(mem: &mut M, addr: u32, bytes: &[u8]) {
    for (i, &b) in bytes.iter().enumerate() {
        mem.write_u8(addr.wrapping_add(i as u32), b);
    }
}

/// Round to an integer under the control word's rounding mode.
fn round(fpu: &FpuState, v: f64) -> f64 {
    match fpu.rounding() {
        0 => v.round_ties_even(),
        1 => v.floor(),
        2 => v.ceil(),
        _ => v.trunc(),
    }
}

/// Rounded integer, or the integer indefinite (`min`) when out of range.
fn to_int(fpu: &FpuState, v: f64, min: i64, max: i64) -> i64 {
    let r = round(fpu, v);
    if r.is_nan() || r < min as f64 || r > max as f64 {
        min
    } else {
        r as i64
    }
}

fn memory_form<M: GuestMemory + ?Sized>(
    cpu: &mut CpuState,
    mem: &mut M,
    esc: u8,
    reg: u8,
    op32: bool,
    addr: u32,
) {
    let top = cpu.fpu.st(0);
    match (esc, reg) {
        (0xD8 | 0xDA | 0xDC | 0xDE, op) => {
            let v = match esc {
                0xD8 => f32::from_bits(mem.read_u32(addr)) as f64,
                0xDA => mem.read_u32(addr) as i32 as f64,
                0xDC => f64::from_bits(read_u64(mem, addr)),
                _ => mem.read_u16(addr) as i16 as f64,
            };
            cpu.fpu.regs[FPU_TEMP] = v;
            arith(&mut cpu.fpu, op, top, FPU_TEMP);
        }
        (0xD9, 0) => cpu.fpu.regs[top] = f32::from_bits(mem.read_u32(addr)) as f64,
        (0xD9, 2 | 3) => mem.write_u32(addr, (cpu.fpu.regs[top] as f32).to_bits()),
        (0xD9, 4) => load_env(&mut cpu.fpu, mem, addr, op32),
        (0xD9, 5) => cpu.fpu.cw = mem.read_u16(addr),
        (0xD9, 6) => store_env(&cpu.fpu, mem, addr, op32),
        (0xD9, 7) => mem.write_u16(addr, cpu.fpu.cw),
        (0xDB, 0) => cpu.fpu.regs[top] = mem.read_u32(addr) as i32 as f64,
        (0xDB, 2 | 3) => {
            let v = to_int(&cpu.fpu, cpu.fpu.regs[top], i32::MIN as i64, i32::MAX as i64);
            mem.write_u32(addr, v as u32);
        }
        (0xDB, 5) => cpu.fpu.regs[top] = f80_to_f64(read_bytes(mem, addr)),
        (0xDB, 7) => write_bytes(mem, addr, &f64_to_f80(cpu.fpu.regs[top])),
        (0xDD, 0) => cpu.fpu.regs[top] = f64::from_bits(read_u64(mem, addr)),
        (0xDD, 2 | 3) => write_u64(mem, addr, cpu.fpu.regs[top].to_bits()),
        (0xDD, 4) => {
            load_env(&mut cpu.fpu, mem, addr, op32);
            let base = addr.wrapping_add(env_size(op32));
            for i in 0..8 {
                let slot = cpu.fpu.st(i);
                cpu.fpu.regs[slot] = f80_to_f64(read_bytes(mem, base.wrapping_add(i * 10)));
            }
        }
        (0xDD, 6) => {
            store_env(&cpu.fpu, mem, addr, op32);
            let base = addr.wrapping_add(env_size(op32));
            for i in 0..8 {
                let v = cpu.fpu.regs[cpu.fpu.st(i)];
                write_bytes(mem, base.wrapping_add(i * 10), &f64_to_f80(v));
            }
            cpu.fpu.init();
        }
        (0xDD, 7) => mem.write_u16(addr, cpu.fpu.status_word()),
        (0xDF, 0) => cpu.fpu.regs[top] = mem.read_u16(addr) as i16 as f64,
        (0xDF, 2 | 3) => {
            let v = to_int(&cpu.fpu, cpu.fpu.regs[top], i16::MIN as i64, i16::MAX as i64);
            mem.write_u16(addr, v as u16);
        }
        (0xDF, 4) => cpu.fpu.regs[top] = bcd_to_f64(read_bytes(mem, addr)),
        (0xDF, 5) => cpu.fpu.regs[top] = read_u64(mem, addr) as i64 as f64,
        (0xDF, 6) => {
            let v = round(&cpu.fpu, cpu.fpu.regs[top]);
            write_bytes(mem, addr, &f64_to_bcd(v));
        }
        (0xDF, 7) => {
            let v = to_int(&cpu.fpu, cpu.fpu.regs[top], i64::MIN, i64::MAX);
            write_u64(mem, addr, v as u64);
        }
        _ => {}
    }
}

/// Bytes of an FSTENV image.
const fn env_size(op32: bool) -> u32 {
    if op32 {
        28
    } else {
        14
    }
}

/// The instruction and operand pointers are not tracked and store as zero.
fn store_env<M: GuestMemory + ?Sized>(fpu: &FpuState, mem: &mut M, addr: u32, op32: bool) {
    let stride = env_size(op32) / 7;
    let words = [fpu.cw, fpu.status_word(), fpu.tag_word()];
    for i in 0..7u32 {
        let v = words.get(i as usize).copied().unwrap_or(0) as u32;
        let at = addr.wrapping_add(i * stride);
        if op32 {
            mem.write_u32(at, v);
        } else {
            mem.write_u16(at, v as u16);
        }
    }
}

fn load_env<M: GuestMemory + ?Sized>(fpu: &mut FpuState, mem: &mut M, addr: u32, op32: bool) {
    let stride = env_size(op32) / 7;
    fpu.cw = mem.read_u16(addr);
    fpu.set_status_word(mem.read_u16(addr.wrapping_add(stride)));
    fpu.set_tag_word(mem.read_u16(addr.wrapping_add(2 * stride)));
    // Only valid/empty are tracked.
    for tag in fpu.tags.iter_mut() {
        if *tag != TAG_EMPTY {
            *tag = TAG_VALID;
        }
    }
}

const CONSTANTS: [f64; 7] = [
    1.0,
    std::f64::consts::LOG2_10,
    std::f64::consts::LOG2_E,
    std::f64::consts::PI,
    std::f64::consts::LOG10_2,
    std::f64::consts::LN_2,
    0.0,
];

/// Operands at or beyond 2^63 are out of range for FSIN/FCOS/FPTAN.
const TRIG_LIMIT: f64 = 9.223_372_036_854_775_808e18;

fn register_form(cpu: &mut CpuState, esc: u8, modrm: u8, i: usize) {
    let fpu = &mut cpu.fpu;
    let top = fpu.st(0);
    if let Some((op, sti_dst)) = arith_form(esc, modrm) {
        let (d, s) = if sti_dst { (i, top) } else { (top, i) };
        arith(fpu, op, d, s);
        return;
    }
    let reg = (modrm >> 3) & 7;
    let rm = modrm & 7;
    let st1 = fpu.st(1);
    match (esc, reg, rm) {
        (0xD9, 0, _) => fpu.regs[top] = fpu.regs[(i + 1) & 7],
        (0xD9, 1, _) | (0xDD, 1, _) => {
            fpu.regs.swap(top, i);
            fpu.tags.swap(top, i);
        }
        (0xD9, 3, _) | (0xDD, 2 | 3, _) => {
            fpu.regs[i] = fpu.regs[top];
            fpu.tags[i] = TAG_VALID;
        }
        (0xD9, 4, 0) => fpu.regs[top] = -fpu.regs[top],
        (0xD9, 4, 1) => fpu.regs[top] = fpu.regs[top].abs(),
        (0xD9, 4, 4) => {
            let v = fpu.regs[top];
            compare(fpu, v, 0.0);
        }
        (0xD9, 4, 5) => examine(fpu),
        (0xD9, 5, k) => {
            if let Some(&c) = CONSTANTS.get(k as usize) {
                fpu.regs[top] = c;
            }
        }
        (0xD9, 6, 0) => fpu.regs[top] = fpu.regs[top].exp2() - 1.0,
        (0xD9, 6, 1) => fpu.regs[st1] *= fpu.regs[top].log2(),
        (0xD9, 6, 2) => {
            // After the push the operand sits in ST(1).
            let v = fpu.regs[st1];
            if v.abs() >= TRIG_LIMIT {
                fpu.set_cc(SW_C2);
            } else {
                fpu.regs[st1] = v.tan();
                fpu.set_cc(0);
            }
            fpu.regs[top] = 1.0;
        }
        (0xD9, 6, 3) => fpu.regs[st1] = fpu.regs[st1].atan2(fpu.regs[top]),
        (0xD9, 6, 4) => {
            let v = fpu.regs[st1];
            let (sig, exp) = extract(v);
            fpu.regs[st1] = exp;
            fpu.regs[top] = sig;
        }
        (0xD9, 6, 5) => partial_remainder(fpu, true),
        (0xD9, 6, 6) => fpu.top = fpu.top.wrapping_sub(1) & 7,
        (0xD9, 6, 7) => fpu.top = (fpu.top + 1) & 7,
        (0xD9, 7, 0) => partial_remainder(fpu, false),
        (0xD9, 7, 1) => fpu.regs[st1] *= (fpu.regs[top] + 1.0).log2(),
        (0xD9, 7, 2) => fpu.regs[top] = fpu.regs[top].sqrt(),
        (0xD9, 7, 3) => {
            let v = fpu.regs[st1];
            if v.abs() >= TRIG_LIMIT {
                fpu.set_cc(SW_C2);
            } else {
                let (s, c) = v.sin_cos();
                fpu.regs[st1] = s;
                fpu.regs[top] = c;
                fpu.set_cc(0);
            }
        }
        (0xD9, 7, 4) => fpu.regs[top] = round(fpu, fpu.regs[top]),
        (0xD9, 7, 5) => {
            let n = fpu.regs[st1].trunc().clamp(-65536.0, 65536.0) as i32;
            fpu.regs[top] = ldexp(fpu.regs[top], n);
        }
        (0xD9, 7, 6 | 7) => {
            let v = fpu.regs[top];
            if v.abs() >= TRIG_LIMIT {
                fpu.set_cc(SW_C2);
            } else {
                fpu.regs[top] = if rm == 6 { v.sin() } else { v.cos() };
                fpu.set_cc(0);
            }
        }
        (0xDA, _, _) => {
            // FUCOMPP
            let (a, b) = (fpu.regs[top], fpu.regs[st1]);
            compare(fpu, a, b);
        }
        (0xDB, 4, 2) => fpu.sw &= 0x7F00,
        (0xDB, 4, 3) => fpu.init(),
        (0xDD, 0, _) | (0xDF, 0, _) => fpu.tags[i] = TAG_EMPTY,
        (0xDD, 4 | 5, _) => {
            let (a, b) = (fpu.regs[top], fpu.regs[i]);
            compare(fpu, a, b);
        }
        (0xDF, 4, 0) => {
            let sw = fpu.status_word();
            cpu.set_reg16(EAX, sw);
        }
        _ => {}
    }
}

/// FXAM: classify ST(0) into C3/C2/C0 with the sign in C1.
fn examine(fpu: &mut FpuState) {
    let v = fpu.st0();
    let sign = if v.is_sign_negative() { SW_C1 } else { 0 };
    let class = if fpu.tags[fpu.st(0)] == TAG_EMPTY {
        SW_C3 | SW_C0
    } else if v.is_nan() {
        SW_C0
    } else if v.is_infinite() {
        SW_C2 | SW_C0
    } else if v == 0.0 {
        SW_C3
    } else if v.is_subnormal() {
        SW_C3 | SW_C2
    } else {
        SW_C2
    };
    fpu.set_cc(class | sign);
}

/// FPREM (truncating) or FPREM1 (round to nearest). The low three
/// quotient bits land in C0, C3 and C1.
fn partial_remainder(fpu: &mut FpuState, nearest: bool) {
    let top = fpu.st(0);
    let (x, y) = (fpu.regs[top], fpu.regs[fpu.st(1)]);
    let q = if nearest {
        (x / y).round_ties_even()
    } else {
        (x / y).trunc()
    };
    fpu.regs[top] = q.mul_add(-y, x);
    let q = if q.is_finite() { q.abs() as u64 } else { 0 };
    let bit = |n: u32, flag: u16| if (q >> n) & 1 != 0 { flag } else { 0 };
    fpu.set_cc(bit(2, SW_C0) | bit(1, SW_C3) | bit(0, SW_C1));
}

/// Significand in [1, 2) and unbiased exponent of `v`.
fn extract(v: f64) -> (f64, f64) {
    if v == 0.0 {
        return (v, f64::NEG_INFINITY);
    }
    if !v.is_finite() {
        return (v, f64::INFINITY);
    }
    let (v, bias) = if v.is_subnormal() {
        (v * 2f64.powi(64), 64)
    } else {
        (v, 0)
    };
    let bits = v.to_bits();
    let exp = ((bits >> 52) & 0x7FF) as i32 - 1023 - bias;
    let sig = f64::from_bits((bits & !(0x7FF << 52)) | (1023 << 52));
    (sig, exp as f64)
}

/// `x * 2^n` without intermediate overflow of the scale factor.
fn ldexp(mut x: f64, mut n: i32) -> f64 {
    while n > 1000 {
        x *= 2f64.powi(1000);
        n -= 1000;
    }
    while n < -1000 {
        x *= 2f64.powi(-1000);
        n += 1000;
    }
    x * 2f64.powi(n)
}

/// Widen to the 80-bit extended format.
pub fn f64_to_f80(v: f64) -> [u8; 10] {
    let bits = v.to_bits();
    let sign = ((bits >> 63) as u16) << 15;
    let exp = ((bits >> 52) & 0x7FF) as u16;
    let frac = bits & ((1 << 52) - 1);
    let (e, m) = match exp {
        0 if frac == 0 => (0, 0),
        0 => {
            let shift = frac.leading_zeros() - 11;
            (15361 - shift as u16, frac << (shift + 11))
        }
        0x7FF => (0x7FFF, 1 << 63 | frac << 11),
        _ => (exp + 15360, 1 << 63 | frac << 11),
    };
    let mut out = [0u8; 10];
    out[..8].copy_from_slice(&m.to_le_bytes());
    out[8..].copy_from_slice(&(sign | e).to_le_bytes());
    out
}

/// Narrow an 80-bit extended value, rounding to nearest.
pub fn f80_to_f64(b: [u8; 10]) -> f64 {
    let mut lo = [0u8; 8];
    lo.copy_from_slice(&b[..8]);
    let m = u64::from_le_bytes(lo);
    let se = u16::from_le_bytes([b[8], b[9]]);
    let neg = se & 0x8000 != 0;
    let e = (se & 0x7FFF) as i32;
    let mag = if e == 0x7FFF {
        if m << 1 == 0 {
            f64::INFINITY
        } else {
            f64::NAN
        }
    } else {
        ldexp(m as f64, e - 16383 - 63)
    };
    if neg {
        -mag
    } else {
        mag
    }
}

fn bcd_to_f64(b: [u8; 10]) -> f64 {
    let mut v: i64 = 0;
    for &byte in b[..9].iter().rev() {
        v = v * 100 + ((byte >> 4) as i64 * 10) + (byte & 0xF) as i64;
    }
    if b[9] & 0x80 != 0 {
        -(v as f64)
    } else {
        v as f64
    }
}

/// Packed BCD of an already-rounded value; the BCD indefinite when
/// it needs more than 18 digits.
fn f64_to_bcd(v: f64) -> [u8; 10] {
    let mut out = [0u8; 10];
    if v.is_nan() || v.abs() >= 1e18 {
        out[7] = 0xC0;
        out[8] = 0xFF;
        out[9] = 0xFF;
        return out;
    }
    let mut n = v.abs() as u64;
    for byte in out[..9].iter_mut() {
        let lo = (n % 10) as u8;
        n /= 10;
        let hi = (n % 10) as u8;
        n /= 10;
        *byte = hi << 4 | lo;
    }
    if v.is_sign_negative() {
        out[9] = 0x80;
    }
    out
}
