//! Host code generation for translated guest blocks.
//!
//! The block translator drives a [`HostEmitter`] through a typed
//! API (register-file slot moves, ALU ops with guest flag merging,
//! helper calls, labels and block exits). One emitter is compiled
//! in per host architecture and exported as `NativeEmitter`.
//!
//! Blocks are assembled into a private [`CodeBuffer`] and finished
//! into a relocatable [`CompiledCode`] image. The code cache copies
//! that image into an [`ExecArena`] and applies the recorded
//! relocations.

pub mod arena;
pub mod code_buffer;
pub mod label;
pub mod scratch;
#[cfg(target_arch = "x86_64")]
pub mod x86_64;

use dynx86_core::block::MAX_LINKS;
use dynx86_core::{AluOp, Cond, ExitKind, ShiftOp, Width};
use thiserror::Error;

pub use arena::{ArenaError, ExecArena, Protection, WriteGuard};
pub use code_buffer::CodeBuffer;
pub use label::Label;
pub use scratch::{ScratchReg, ScratchRegs};
#[cfg(target_arch = "x86_64")]
pub use x86_64::X86_64Emitter;

/// The emitter for the host this crate was built for.
#[cfg(target_arch = "x86_64")]
pub type NativeEmitter = X86_64Emitter;

/// Translation-time resource failures. These abort the block being
/// built and are never visible to the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EmitError {
    #[error("out of scratch host registers")]
    OutOfRegisters,
    #[error("block needs more than {MAX_LINKS} patchable exits")]
    TooManyLinks,
    #[error("label {0} referenced but never bound")]
    UnboundLabel(u32),
}

/// An argument passed to a native helper.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HelperArg {
    Reg(ScratchReg),
    Imm(u32),
}

/// Single-operand ALU operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
    Inc,
    Dec,
}

/// Shared entry/exit code, placed once at the start of the arena.
///
/// The entry is called as
/// `extern "C" fn(env: *mut u8, code: *const u8) -> u32`: it saves
/// the callee-saved host registers, installs `env` as the
/// environment pointer and jumps to `code`. Blocks leave through
/// `epilogue` with the exit value in the return register.
#[derive(Debug, Clone)]
pub struct Trampoline {
    pub code: Vec<u8>,
    pub entry: usize,
    pub epilogue: usize,
}

/// A patchable direct jump used to chain one block into another.
///
/// `jmp_offset` is the start of a 5-byte `jmp rel32` whose
/// displacement field is 4-byte aligned; `reset_offset` is the
/// instruction following it, which is the unlinked target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkSite {
    pub jmp_offset: usize,
    pub reset_offset: usize,
}

/// A finished block image, relocatable to any arena offset.
#[derive(Debug, Clone)]
pub struct CompiledCode {
    pub bytes: Vec<u8>,
    /// Offsets of rel32 fields that must point at the shared epilogue.
    pub epilogue_relocs: Vec<usize>,
    /// Offsets of imm32 exit values; the block id is OR-ed in
    /// (shifted by `EXIT_KIND_BITS`) when the block is committed.
    pub exit_sites: Vec<usize>,
    pub link_sites: [Option<LinkSite>; MAX_LINKS],
    pub insn_count: u32,
}

/// Host code emitter interface.
///
/// Guest register-file slots are addressed by byte offset from the
/// environment pointer, which points at the guest `CpuState`. Values
/// held in scratch registers are 32 bits wide; operations at 8 or
/// 16 bits only touch the low part of their destination.
///
/// Every operation taking a `flags` mask merges exactly those bits
/// of the host EFLAGS result into the guest EFLAGS slot. A zero mask
/// leaves guest EFLAGS untouched.
pub trait HostEmitter {
    /// Emit the shared prologue/epilogue into a fresh buffer.
    fn emit_trampoline(&mut self) -> Trampoline;

    /// Reset per-block state before translating a new block.
    fn begin_block(&mut self);

    /// Current size of the block being emitted.
    fn offset(&self) -> usize;

    // -- Scratch registers --

    fn claim(&mut self) -> Result<ScratchReg, EmitError>;
    fn release(&mut self, reg: ScratchReg);
    fn free_regs(&self) -> usize;

    // -- Labels --

    fn new_label(&mut self) -> Label;
    fn bind(&mut self, label: Label);

    /// Block entry: exit with `ExitKind::Cycles` when the cycle
    /// budget is exhausted, otherwise charge the block's instruction
    /// count (filled in by `finish`).
    fn check_cycles(&mut self);

    // -- Moves --

    fn mov_imm(&mut self, dst: ScratchReg, val: u32);
    fn mov(&mut self, dst: ScratchReg, src: ScratchReg);
    /// Load a slot, zero-extended to 32 bits.
    fn load_slot(&mut self, dst: ScratchReg, width: Width, offset: usize);
    fn store_slot(&mut self, src: ScratchReg, width: Width, offset: usize);
    fn store_slot_imm(&mut self, width: Width, offset: usize, val: u32);
    /// Add an immediate to a slot without touching guest flags.
    fn slot_add_imm(&mut self, width: Width, offset: usize, val: u32);
    /// `u32` store to `base_offset + index * 4`.
    fn store_indexed_imm(&mut self, base_offset: usize, index: ScratchReg, val: u32);

    // -- Arithmetic --

    /// `dst = dst op src`. ADC/SBB consume the guest carry flag.
    fn alu(&mut self, op: AluOp, width: Width, dst: ScratchReg, src: ScratchReg, flags: u32);
    fn alu_imm(&mut self, op: AluOp, width: Width, dst: ScratchReg, imm: u32, flags: u32);
    /// Flags of `a & b`, no result.
    fn test(&mut self, width: Width, a: ScratchReg, b: ScratchReg, flags: u32);
    fn unary(&mut self, op: UnaryOp, width: Width, reg: ScratchReg, flags: u32);
    /// Shift or rotate by an immediate count. RCL/RCR consume the
    /// guest carry flag.
    fn shift_imm(&mut self, op: ShiftOp, width: Width, reg: ScratchReg, count: u8, flags: u32);
    /// Zero- or sign-extend the low `from` bits of `src` into `dst`.
    fn extend(&mut self, dst: ScratchReg, src: ScratchReg, from: Width, signed: bool);

    // -- Guest conditions --

    /// `dst = cond(guest EFLAGS) ? 1 : 0`.
    fn set_cond(&mut self, cond: Cond, dst: ScratchReg);
    fn jump_if(&mut self, cond: Cond, label: Label);
    fn jump(&mut self, label: Label);
    fn jump_if_zero(&mut self, reg: ScratchReg, width: Width, label: Label);
    fn jump_if_nonzero(&mut self, reg: ScratchReg, width: Width, label: Label);
    /// Branch when the `u32` slot at `offset` is zero.
    fn jump_if_slot_zero(&mut self, offset: usize, label: Label);

    // -- Calls and exits --

    /// Call `extern "C" fn(env, a, b) -> u32` at absolute address `addr`.
    /// Scratch registers survive the call.
    fn call_helper(&mut self, addr: usize, a: HelperArg, b: HelperArg, ret: Option<ScratchReg>);
    /// Return to the dispatcher.
    fn exit(&mut self, kind: ExitKind);
    /// Patchable direct jump (initially falling through), followed by
    /// a return with `ExitKind::link(slot)`.
    fn exit_link(&mut self, slot: usize) -> Result<(), EmitError>;

    /// Resolve labels and return the block image.
    fn finish(&mut self, insn_count: u32) -> Result<CompiledCode, EmitError>;
}

/// Displacement of a `jmp rel32` at `jmp_offset` that reaches `target`.
#[inline]
pub fn jump_disp(jmp_offset: usize, target: usize) -> u32 {
    (target as i64 - (jmp_offset as i64 + 5)) as i32 as u32
}
