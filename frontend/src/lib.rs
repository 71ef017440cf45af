//! Block translator: guest x86 instruction streams to host code.
//!
//! Provides the generic translation framework (`TranslatorOps` and
//! `translator_loop`) plus the x86 guest translator, which drives a
//! backend `HostEmitter` one decoded instruction at a time.

pub mod x86;

use dynx86_backend::{CompiledCode, EmitError};
use dynx86_core::{CpuMode, Width};
use dynx86_decode::DecodeError;
use thiserror::Error;

pub use x86::{translate_block, X86Translator};

// ---------------------------------------------------------------
// Generic translation framework
// ---------------------------------------------------------------

/// Block termination reason set by `translate_insn`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JumpType {
    /// Continue with the next sequential instruction.
    Next,
    /// Reached the instruction or host byte limit.
    TooMany,
    /// The next instruction starts on another guest page.
    PageEnd,
    /// The instruction left the block itself; no fall-through.
    NoReturn,
}

/// Context shared by every guest translator.
#[derive(Debug, Clone)]
pub struct BlockContext {
    /// EIP of the first instruction in this block.
    pub eip_first: u32,
    /// EIP of the next instruction to decode.
    pub eip_next: u32,
    /// How the current instruction terminates.
    pub is_jmp: JumpType,
    /// Guest instructions translated so far.
    pub num_insns: u32,
    pub max_insns: u32,
}

/// Per-architecture translation operations.
pub trait TranslatorOps {
    type Context;

    /// Called once before the first instruction.
    fn tb_start(ctx: &mut Self::Context) -> Result<(), TranslateError>;

    /// Decode and translate one instruction.
    ///
    /// Must advance `base().eip_next` and set `base().is_jmp` when
    /// the instruction ends the block.
    fn translate_insn(ctx: &mut Self::Context) -> Result<(), TranslateError>;

    /// Emit the block's fall-through exit, if it has one.
    fn tb_stop(ctx: &mut Self::Context) -> Result<(), TranslateError>;

    fn base(ctx: &Self::Context) -> &BlockContext;

    fn base_mut(ctx: &mut Self::Context) -> &mut BlockContext;
}

/// Drive the decode/translate cycle until an instruction ends the
/// block or the instruction limit is hit.
pub fn translator_loop<T: TranslatorOps>(ctx: &mut T::Context) -> Result<(), TranslateError> {
    T::tb_start(ctx)?;

    loop {
        T::translate_insn(ctx)?;

        let base = T::base(ctx);
        if base.is_jmp != JumpType::Next {
            break;
        }
        if base.num_insns >= base.max_insns {
            T::base_mut(ctx).is_jmp = JumpType::TooMany;
            break;
        }
    }

    T::tb_stop(ctx)
}

// ---------------------------------------------------------------
// Translator inputs and outputs
// ---------------------------------------------------------------

/// Why a block could not be translated. The dispatcher answers
/// every variant by interpreting one instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TranslateError {
    #[error("decode failed: {0}")]
    Decode(#[from] DecodeError),
    #[error("emit failed: {0}")]
    Emit(#[from] EmitError),
    #[error("instruction at {eip:#06x} wraps the 64 KiB code segment")]
    SegmentWrap { eip: u32 },
}

/// Per-block size limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockLimits {
    pub max_insns: u32,
    /// Translation stops once the host code reaches this size.
    pub max_bytes: usize,
}

impl Default for BlockLimits {
    fn default() -> Self {
        Self {
            max_insns: 32,
            max_bytes: 12 * 1024,
        }
    }
}

/// Absolute host addresses of the native helpers that translated
/// code calls. Every helper has the signature
/// `extern "C" fn(env, u32, u32) -> u32`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HelperTable {
    /// Guest memory reads `(addr, _) -> value`, by operand width.
    pub read: [usize; 3],
    /// Guest memory writes `(addr, value)`, by operand width.
    pub write: [usize; 3],
    /// Interpret the instruction at EIP: `(len, _) -> redirect`.
    pub interpret: usize,
    /// Execute an x87 escape: `(packed form, operand)`.
    pub fpu_escape: usize,
    /// Register-register x87 arithmetic `(dst slot, src slot)`,
    /// by D8 `/r` operation.
    pub fpu_arith: [usize; 8],
}

impl HelperTable {
    #[inline]
    pub fn read(&self, width: Width) -> usize {
        self.read[width_index(width)]
    }

    #[inline]
    pub fn write(&self, width: Width) -> usize {
        self.write[width_index(width)]
    }
}

#[inline]
const fn width_index(width: Width) -> usize {
    match width {
        Width::B8 => 0,
        Width::B16 => 1,
        Width::B32 => 2,
    }
}

/// Where and how a block is translated.
#[derive(Debug, Clone, Copy)]
pub struct BlockSource {
    pub cs_base: u32,
    pub eip: u32,
    pub mode: CpuMode,
}

impl BlockSource {
    #[inline]
    pub fn linear(&self) -> u32 {
        self.cs_base.wrapping_add(self.eip)
    }
}

/// A translated block, ready to be committed to the code cache.
#[derive(Debug, Clone)]
pub struct TranslatedBlock {
    /// Linear address of the first instruction.
    pub start: u32,
    /// Linear address one past the last instruction byte.
    pub end: u32,
    pub cs_base: u32,
    pub mode: CpuMode,
    /// Guest pages the instruction bytes were read from.
    pub pages: Vec<u32>,
    pub insn_count: u32,
    pub code: CompiledCode,
}
