//! x86-64 instruction encoders.
//!
//! Guest and host share the x86 encoding of ALU sub-opcodes, shift
//! sub-opcodes and condition codes, so `AluOp`, `ShiftOp` and
//! `Cond` from the guest model are used directly as encoding fields.

#![allow(non_upper_case_globals)]

use dynx86_core::{AluOp, Cond, ShiftOp, Width};

use crate::code_buffer::CodeBuffer;
use crate::x86_64::regs::Reg;
use crate::UnaryOp;

// -- Prefix flags --

pub const P_EXT: u32 = 0x100; // 0x0F prefix
pub const P_DATA16: u32 = 0x400; // 0x66 prefix
pub const P_REXW: u32 = 0x1000; // REX.W = 1
pub const P_REXB_R: u32 = 0x2000; // REG field as byte register
pub const P_REXB_RM: u32 = 0x4000; // R/M field as byte register

// -- Opcode constants (OPC_*) --

// Arithmetic
pub const OPC_ARITH_EbIb: u32 = 0x80;
pub const OPC_ARITH_EvIz: u32 = 0x81;
pub const OPC_ARITH_EvIb: u32 = 0x83;
pub const OPC_ARITH_GvEv: u32 = 0x03;
pub const OPC_ARITH_EvGv: u32 = 0x01;

// Shift
pub const OPC_SHIFT_1: u32 = 0xD1;
pub const OPC_SHIFT_Ib: u32 = 0xC1;

// Data movement
pub const OPC_MOVL_EvGv: u32 = 0x89;
pub const OPC_MOVL_GvEv: u32 = 0x8B;
pub const OPC_MOVL_EvIz: u32 = 0xC7;
pub const OPC_MOVL_Iv: u32 = 0xB8;

// Extensions
pub const OPC_MOVZBL: u32 = 0xB6 | P_EXT | P_REXB_RM;
pub const OPC_MOVZWL: u32 = 0xB7 | P_EXT;
pub const OPC_MOVSBL: u32 = 0xBE | P_EXT | P_REXB_RM;
pub const OPC_MOVSWL: u32 = 0xBF | P_EXT;

// Branch
pub const OPC_JCC_long: u32 = 0x80 | P_EXT;
pub const OPC_JMP_long: u32 = 0xE9;

// Compare / conditional
pub const OPC_SETCC: u32 = 0x90 | P_EXT | P_REXB_RM;
pub const OPC_TESTL: u32 = 0x85;

// Group opcodes
pub const OPC_GRP3_Ev: u32 = 0xF7;
pub const OPC_GRP5: u32 = 0xFF;
pub const OPC_GRPBT: u32 = 0xBA | P_EXT;

// Misc
pub const OPC_PUSH_r32: u32 = 0x50;
pub const OPC_POP_r32: u32 = 0x58;
pub const OPC_PUSHF: u32 = 0x9C;
pub const OPC_POPF: u32 = 0x9D;
pub const OPC_RET: u32 = 0xC3;

/// Group 3 extension codes (used in /r field of 0xF7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Ext3Op {
    Not = 2,
    Neg = 3,
}

/// Group 5 extension codes (used in /r field of 0xFF).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Ext5Op {
    IncEv = 0,
    DecEv = 1,
    CallN = 2,
    JmpN = 4,
}

/// Bit-test group extension codes (used in /r field of 0xBA).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum GrpBtOp {
    Bt = 4,
}

// -- Core encoding functions --

/// Helper: return P_REXW if `rexw` is true.
#[inline]
fn rexw_flag(rexw: bool) -> u32 {
    if rexw {
        P_REXW
    } else {
        0
    }
}

/// Select the byte, word or dword form of a full-size opcode.
///
/// Byte forms clear opcode bit 0 and address byte registers;
/// word forms carry the operand-size prefix.
#[inline]
pub fn sized(opc: u32, width: Width) -> u32 {
    match width {
        Width::B8 => (opc & !1) | P_REXB_R | P_REXB_RM,
        Width::B16 => opc | P_DATA16,
        Width::B32 => opc,
    }
}

/// Emit opcode with REX prefix. `r` is the reg field, `rm` is the r/m field.
/// Both are raw register numbers (0-15). Pass 0 for unused fields.
pub fn emit_opc(buf: &mut CodeBuffer, opc: u32, r: u8, rm: u8) {
    emit_opc_3(buf, opc, r, rm, 0);
}

/// Emit opcode with REX prefix, 3-register variant (r, rm, index).
fn emit_opc_3(buf: &mut CodeBuffer, opc: u32, r: u8, rm: u8, index: u8) {
    let mut rex: u8 = 0;
    if opc & P_REXW != 0 {
        rex |= 0x08;
    }
    if r >= 8 {
        rex |= 0x04;
    }
    if index >= 8 {
        rex |= 0x02; // REX.X
    }
    if rm >= 8 {
        rex |= 0x01;
    }
    // SPL/BPL/SIL/DIL are only reachable with a REX prefix present.
    let byte_r = opc & P_REXB_R != 0 && (4..8).contains(&r);
    let byte_rm = opc & P_REXB_RM != 0 && (4..8).contains(&rm);

    if opc & P_DATA16 != 0 {
        buf.emit_u8(0x66);
    }
    if rex != 0 || byte_r || byte_rm {
        buf.emit_u8(0x40 | rex);
    }
    if opc & P_EXT != 0 {
        buf.emit_u8(0x0F);
    }
    buf.emit_u8(opc as u8);
}

/// Emit opcode + ModR/M for register-register operation.
pub fn emit_modrm(buf: &mut CodeBuffer, opc: u32, r: Reg, rm: Reg) {
    emit_opc(buf, opc, r as u8, rm as u8);
    buf.emit_u8(0xC0 | (r.low3() << 3) | rm.low3());
}

/// Emit opcode + ModR/M with /r extension (for group opcodes).
pub fn emit_modrm_ext(buf: &mut CodeBuffer, opc: u32, ext: u8, rm: Reg) {
    emit_opc(buf, opc, ext, rm as u8);
    buf.emit_u8(0xC0 | (ext << 3) | rm.low3());
}

/// ModR/M (+SIB) and displacement for `[base + offset]` with the
/// raw 3-bit reg field `r3`. RBP/R13 need an explicit disp8,
/// RSP/R12 need a SIB byte.
fn emit_mem_operand(buf: &mut CodeBuffer, r3: u8, base: Reg, offset: i32) {
    let b3 = base.low3();
    let (md, disp) = if offset == 0 && b3 != 5 {
        (0x00, None)
    } else if (-128..=127).contains(&offset) {
        (0x40, Some(false))
    } else {
        (0x80, Some(true))
    };
    if b3 == 4 {
        buf.emit_u8(md | (r3 << 3) | 0x04);
        buf.emit_u8(0x24);
    } else {
        buf.emit_u8(md | (r3 << 3) | b3);
    }
    match disp {
        Some(false) => buf.emit_u8(offset as u8),
        Some(true) => buf.emit_u32(offset as u32),
        None => {}
    }
}

/// Emit opcode + ModR/M + displacement for memory [base + offset].
pub fn emit_modrm_offset(buf: &mut CodeBuffer, opc: u32, r: Reg, base: Reg, offset: i32) {
    // rm names the base register here, never a byte register.
    emit_opc(buf, opc & !P_REXB_RM, r as u8, base as u8);
    emit_mem_operand(buf, r.low3(), base, offset);
}

/// Emit opcode + ModR/M with /r extension for memory [base + offset].
pub fn emit_modrm_ext_offset(buf: &mut CodeBuffer, opc: u32, ext: u8, base: Reg, offset: i32) {
    // Neither field names a byte register.
    emit_opc(buf, opc & !(P_REXB_R | P_REXB_RM), ext, base as u8);
    emit_mem_operand(buf, ext, base, offset);
}

/// Emit opcode + ModR/M + SIB for memory [base + index*scale + offset].
pub fn emit_modrm_sib(
    buf: &mut CodeBuffer,
    opc: u32,
    r: u8,
    base: Reg,
    index: Reg,
    shift: u8,
    offset: i32,
) {
    emit_opc_3(buf, opc, r, base as u8, index as u8);

    let r3 = r & 7;
    let b3 = base.low3();
    let x3 = index.low3();
    let sib = (shift << 6) | (x3 << 3) | b3;

    if offset == 0 && b3 != 5 {
        buf.emit_u8((r3 << 3) | 0x04);
        buf.emit_u8(sib);
    } else if (-128..=127).contains(&offset) {
        buf.emit_u8(0x44 | (r3 << 3));
        buf.emit_u8(sib);
        buf.emit_u8(offset as u8);
    } else {
        buf.emit_u8(0x84 | (r3 << 3));
        buf.emit_u8(sib);
        buf.emit_u32(offset as u32);
    }
}

/// Emit an immediate of the operand width.
fn emit_imm(buf: &mut CodeBuffer, width: Width, imm: u32) {
    match width {
        Width::B8 => buf.emit_u8(imm as u8),
        Width::B16 => buf.emit_u16(imm as u16),
        Width::B32 => buf.emit_u32(imm),
    }
}

/// Whether `imm` at `width` can use the sign-extended imm8 form.
#[inline]
fn fits_imm8(width: Width, imm: u32) -> bool {
    (-128..=127).contains(&(width.sign_extend(imm) as i32))
}

// -- Arithmetic instructions --

/// Emit arithmetic reg, reg (ADD/SUB/AND/OR/XOR/CMP/ADC/SBB).
pub fn emit_arith_rr(buf: &mut CodeBuffer, op: AluOp, width: Width, dst: Reg, src: Reg) {
    let opc = sized(OPC_ARITH_GvEv + ((op as u32) << 3), width);
    emit_modrm(buf, opc, dst, src);
}

/// Emit arithmetic reg, imm (auto-selects imm8 vs full immediate).
pub fn emit_arith_ri(buf: &mut CodeBuffer, op: AluOp, width: Width, dst: Reg, imm: u32) {
    if width == Width::B8 {
        emit_modrm_ext(buf, OPC_ARITH_EbIb | P_REXB_RM, op as u8, dst);
        buf.emit_u8(imm as u8);
    } else if fits_imm8(width, imm) {
        emit_modrm_ext(buf, sized(OPC_ARITH_EvIb, width), op as u8, dst);
        buf.emit_u8(imm as u8);
    } else {
        emit_modrm_ext(buf, sized(OPC_ARITH_EvIz, width), op as u8, dst);
        emit_imm(buf, width, imm);
    }
}

/// Emit 64-bit arithmetic reg, imm32 (stack frame adjustment).
pub fn emit_arith_ri64(buf: &mut CodeBuffer, op: AluOp, dst: Reg, imm: i32) {
    if (-128..=127).contains(&imm) {
        emit_modrm_ext(buf, OPC_ARITH_EvIb | P_REXW, op as u8, dst);
        buf.emit_u8(imm as u8);
    } else {
        emit_modrm_ext(buf, OPC_ARITH_EvIz | P_REXW, op as u8, dst);
        buf.emit_u32(imm as u32);
    }
}

/// Emit arithmetic [base+offset], imm.
pub fn emit_arith_mi(buf: &mut CodeBuffer, op: AluOp, width: Width, base: Reg, offset: i32, imm: u32) {
    if width == Width::B8 {
        emit_modrm_ext_offset(buf, OPC_ARITH_EbIb, op as u8, base, offset);
        buf.emit_u8(imm as u8);
    } else if fits_imm8(width, imm) {
        emit_modrm_ext_offset(buf, sized(OPC_ARITH_EvIb, width), op as u8, base, offset);
        buf.emit_u8(imm as u8);
    } else {
        emit_modrm_ext_offset(buf, sized(OPC_ARITH_EvIz, width), op as u8, base, offset);
        emit_imm(buf, width, imm);
    }
}

/// Emit `op dword [base+offset], imm32` with a full-size immediate,
/// returning the offset of the immediate for later patching.
pub fn emit_arith_mi32_patchable(buf: &mut CodeBuffer, op: AluOp, base: Reg, offset: i32) -> usize {
    emit_modrm_ext_offset(buf, OPC_ARITH_EvIz, op as u8, base, offset);
    let field = buf.offset();
    buf.emit_u32(0);
    field
}

/// Emit arithmetic [base+offset], reg (store-op).
pub fn emit_arith_mr(buf: &mut CodeBuffer, op: AluOp, width: Width, base: Reg, offset: i32, src: Reg) {
    let opc = sized(OPC_ARITH_EvGv + ((op as u32) << 3), width);
    emit_modrm_offset(buf, opc, src, base, offset);
}

/// Emit TEST reg, reg.
pub fn emit_test_rr(buf: &mut CodeBuffer, width: Width, r1: Reg, r2: Reg) {
    emit_modrm(buf, sized(OPC_TESTL, width), r1, r2);
}

/// Emit NOT/NEG/INC/DEC reg.
pub fn emit_unary(buf: &mut CodeBuffer, op: UnaryOp, width: Width, reg: Reg) {
    let (opc, ext) = match op {
        UnaryOp::Not => (OPC_GRP3_Ev, Ext3Op::Not as u8),
        UnaryOp::Neg => (OPC_GRP3_Ev, Ext3Op::Neg as u8),
        UnaryOp::Inc => (OPC_GRP5, Ext5Op::IncEv as u8),
        UnaryOp::Dec => (OPC_GRP5, Ext5Op::DecEv as u8),
    };
    emit_modrm_ext(buf, sized(opc, width) & !P_REXB_R, ext, reg);
}

// -- Shift instructions --

/// Emit shift reg, imm8.
pub fn emit_shift_ri(buf: &mut CodeBuffer, op: ShiftOp, width: Width, dst: Reg, imm: u8) {
    if imm == 1 {
        emit_modrm_ext(buf, sized(OPC_SHIFT_1, width) & !P_REXB_R, op as u8, dst);
    } else {
        emit_modrm_ext(buf, sized(OPC_SHIFT_Ib, width) & !P_REXB_R, op as u8, dst);
        buf.emit_u8(imm);
    }
}

// -- Data movement --

/// Emit MOV reg, reg (32-bit or 64-bit).
pub fn emit_mov_rr(buf: &mut CodeBuffer, rexw: bool, dst: Reg, src: Reg) {
    emit_modrm(buf, OPC_MOVL_EvGv | rexw_flag(rexw), src, dst);
}

/// Emit MOV reg, imm (32-bit or 64-bit). Never touches host flags.
pub fn emit_mov_ri(buf: &mut CodeBuffer, rexw: bool, reg: Reg, val: u64) {
    if !rexw || val <= u32::MAX as u64 {
        emit_opc(buf, OPC_MOVL_Iv + (reg.low3() as u32), 0, reg as u8);
        buf.emit_u32(val as u32);
    } else {
        emit_opc(
            buf,
            (OPC_MOVL_Iv + (reg.low3() as u32)) | P_REXW,
            0,
            reg as u8,
        );
        buf.emit_u64(val);
    }
}

/// Emit MOV r32, imm32, returning the offset of the immediate.
pub fn emit_mov_ri_patchable(buf: &mut CodeBuffer, reg: Reg, val: u32) -> usize {
    emit_opc(buf, OPC_MOVL_Iv + (reg.low3() as u32), 0, reg as u8);
    let field = buf.offset();
    buf.emit_u32(val);
    field
}

/// Emit zero- or sign-extension: MOVZBL/MOVZWL/MOVSBL/MOVSWL.
pub fn emit_movx(buf: &mut CodeBuffer, opc: u32, dst: Reg, src: Reg) {
    emit_modrm(buf, opc, dst, src);
}

// -- Memory operations --

/// Emit a zero-extending load of `width` from [base+offset].
pub fn emit_load(buf: &mut CodeBuffer, width: Width, dst: Reg, base: Reg, offset: i32) {
    let opc = match width {
        Width::B8 => OPC_MOVZBL,
        Width::B16 => OPC_MOVZWL,
        Width::B32 => OPC_MOVL_GvEv,
    };
    emit_modrm_offset(buf, opc, dst, base, offset);
}

/// Emit MOV [base+offset], reg at `width`.
pub fn emit_store(buf: &mut CodeBuffer, width: Width, src: Reg, base: Reg, offset: i32) {
    emit_modrm_offset(buf, sized(OPC_MOVL_EvGv, width), src, base, offset);
}

/// Emit MOV [base+offset], imm at `width`.
pub fn emit_store_imm(buf: &mut CodeBuffer, width: Width, base: Reg, offset: i32, imm: u32) {
    emit_modrm_ext_offset(buf, sized(OPC_MOVL_EvIz, width), 0, base, offset);
    emit_imm(buf, width, imm);
}

/// Emit MOV dword [base+index*scale+offset], imm32 (indexed store).
pub fn emit_store_imm_sib(
    buf: &mut CodeBuffer,
    base: Reg,
    index: Reg,
    shift: u8,
    offset: i32,
    imm: u32,
) {
    emit_modrm_sib(buf, OPC_MOVL_EvIz, 0, base, index, shift, offset);
    buf.emit_u32(imm);
}

/// Emit BT dword [base+offset], imm8.
pub fn emit_bt_mi(buf: &mut CodeBuffer, base: Reg, offset: i32, bit: u8) {
    emit_modrm_ext_offset(buf, OPC_GRPBT, GrpBtOp::Bt as u8, base, offset);
    buf.emit_u8(bit);
}

// -- Branches and comparisons --

/// Emit Jcc rel32 with a zero displacement, returning the offset of
/// the displacement field.
pub fn emit_jcc_rel32(buf: &mut CodeBuffer, cond: Cond) -> usize {
    emit_opc(buf, OPC_JCC_long + (cond as u32), 0, 0);
    let field = buf.offset();
    buf.emit_u32(0);
    field
}

/// Emit JMP rel32 with a zero displacement, returning the offset of
/// the displacement field.
pub fn emit_jmp_rel32(buf: &mut CodeBuffer) -> usize {
    buf.emit_u8(OPC_JMP_long as u8);
    let field = buf.offset();
    buf.emit_u32(0);
    field
}

/// Emit indirect JMP through register.
pub fn emit_jmp_reg(buf: &mut CodeBuffer, reg: Reg) {
    emit_modrm_ext(buf, OPC_GRP5, Ext5Op::JmpN as u8, reg);
}

/// Emit indirect CALL through register.
pub fn emit_call_reg(buf: &mut CodeBuffer, reg: Reg) {
    emit_modrm_ext(buf, OPC_GRP5, Ext5Op::CallN as u8, reg);
}

/// Emit SETcc dst (set byte on condition).
pub fn emit_setcc(buf: &mut CodeBuffer, cond: Cond, dst: Reg) {
    emit_modrm_ext(buf, OPC_SETCC + (cond as u32), 0, dst);
}

// -- Miscellaneous --

/// Emit PUSH reg.
pub fn emit_push(buf: &mut CodeBuffer, reg: Reg) {
    emit_opc(buf, OPC_PUSH_r32 + (reg.low3() as u32), 0, reg as u8);
}

/// Emit POP reg.
pub fn emit_pop(buf: &mut CodeBuffer, reg: Reg) {
    emit_opc(buf, OPC_POP_r32 + (reg.low3() as u32), 0, reg as u8);
}

/// Emit PUSHFQ.
pub fn emit_pushf(buf: &mut CodeBuffer) {
    buf.emit_u8(OPC_PUSHF as u8);
}

/// Emit POPFQ.
pub fn emit_popf(buf: &mut CodeBuffer) {
    buf.emit_u8(OPC_POPF as u8);
}

/// Emit RET.
pub fn emit_ret(buf: &mut CodeBuffer) {
    buf.emit_u8(OPC_RET as u8);
}

/// Emit `n` bytes of NOP padding using recommended multi-byte NOPs.
pub fn emit_nops(buf: &mut CodeBuffer, mut n: usize) {
    const NOPS: [&[u8]; 8] = [
        &[0x90],
        &[0x66, 0x90],
        &[0x0F, 0x1F, 0x00],
        &[0x0F, 0x1F, 0x40, 0x00],
        &[0x0F, 0x1F, 0x44, 0x00, 0x00],
        &[0x66, 0x0F, 0x1F, 0x44, 0x00, 0x00],
        &[0x0F, 0x1F, 0x80, 0x00, 0x00, 0x00, 0x00],
        &[0x0F, 0x1F, 0x84, 0x00, 0x00, 0x00, 0x00, 0x00],
    ];
    while n > 0 {
        let chunk = n.min(NOPS.len());
        buf.emit_bytes(NOPS[chunk - 1]);
        n -= chunk;
    }
}
