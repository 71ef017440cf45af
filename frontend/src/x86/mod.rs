//! x86 guest translator.
//!
//! Instructions are translated one at a time with no guest state
//! cached in host registers across instruction boundaries, so a
//! call-out may change any part of `CpuState` between two
//! instructions. EIP is the exception: the translator knows its
//! value at every point of a block and only stores it when a
//! helper or an exit needs it.

mod arith;
mod branch;
mod callout;
mod fpu;
mod operand;
mod stack;

use std::marker::PhantomData;

use dynx86_backend::HostEmitter;
use dynx86_core::block::MAX_LINKS;
use dynx86_core::cpu::{EIP_OFFSET, EXIT_REQUEST_OFFSET};
use dynx86_core::memory::page_of;
use dynx86_core::{ExitKind, GuestMemory, Width};
use dynx86_decode::{decode, next_eip, DecodedInsn, OpFamily};
use tracing::trace;

use crate::{
    BlockContext, BlockLimits, BlockSource, HelperTable, JumpType, TranslateError,
    TranslatedBlock, TranslatorOps,
};

pub(crate) use operand::Operand;

type Handler<E, M> = fn(&mut TranslatorCtx<'_, E, M>) -> Result<(), TranslateError>;

/// Handler registry indexed by `OpFamily`. Families without an
/// inline translation go to the interpreter call-out.
fn registry<E: HostEmitter, M: GuestMemory + ?Sized>() -> [Handler<E, M>; OpFamily::COUNT] {
    let mut table: [Handler<E, M>; OpFamily::COUNT] = [callout::interpret; OpFamily::COUNT];
    table[OpFamily::Alu as usize] = arith::alu;
    table[OpFamily::IncDec as usize] = arith::inc_dec;
    table[OpFamily::Unary as usize] = arith::unary;
    table[OpFamily::Mov as usize] = arith::mov;
    table[OpFamily::Lea as usize] = arith::lea;
    table[OpFamily::Xchg as usize] = arith::xchg;
    table[OpFamily::MovExt as usize] = arith::mov_ext;
    table[OpFamily::Convert as usize] = arith::convert;
    table[OpFamily::FlagOp as usize] = arith::flag_op;
    table[OpFamily::SetCc as usize] = arith::set_cc;
    table[OpFamily::Shift as usize] = arith::shift;
    table[OpFamily::Nop as usize] = arith::nop;
    table[OpFamily::Push as usize] = stack::push;
    table[OpFamily::Pop as usize] = stack::pop;
    table[OpFamily::Jcc as usize] = branch::jcc;
    table[OpFamily::JmpNear as usize] = branch::jmp_near;
    table[OpFamily::CallNear as usize] = branch::call_near;
    table[OpFamily::RetNear as usize] = branch::ret_near;
    table[OpFamily::Loop as usize] = branch::loop_op;
    table[OpFamily::Group5 as usize] = branch::group5;
    table[OpFamily::Fpu as usize] = fpu::escape;
    table[OpFamily::FarControl as usize] = callout::transfer;
    table[OpFamily::Interrupt as usize] = callout::transfer;
    table[OpFamily::System as usize] = callout::system;
    table
}

/// Translation state for one x86 block.
pub struct TranslatorCtx<'a, E, M: ?Sized> {
    pub base: BlockContext,
    pub(crate) e: &'a mut E,
    mem: &'a M,
    pub(crate) helpers: &'a HelperTable,
    pub(crate) source: BlockSource,
    limits: BlockLimits,
    handlers: [Handler<E, M>; OpFamily::COUNT],
    /// Instruction being translated.
    pub(crate) insn: DecodedInsn,
    /// EIP of `insn` and of the instruction after it.
    pub(crate) eip: u32,
    pub(crate) next: u32,
    /// Value held by the guest EIP slot at the current emit point.
    eip_slot: u32,
    next_link: usize,
    /// Set when `insn` wrote guest memory.
    pub(crate) wrote_memory: bool,
    pages: Vec<u32>,
    end: u32,
}

impl<'a, E: HostEmitter, M: GuestMemory + ?Sized> TranslatorCtx<'a, E, M> {
    pub fn new(
        e: &'a mut E,
        mem: &'a M,
        source: BlockSource,
        helpers: &'a HelperTable,
        limits: BlockLimits,
    ) -> Self {
        Self {
            base: BlockContext {
                eip_first: source.eip,
                eip_next: source.eip,
                is_jmp: JumpType::Next,
                num_insns: 0,
                max_insns: limits.max_insns.max(1),
            },
            e,
            mem,
            helpers,
            source,
            limits,
            handlers: registry(),
            insn: placeholder_insn(),
            eip: source.eip,
            next: source.eip,
            eip_slot: source.eip,
            next_link: 0,
            wrote_memory: false,
            pages: Vec::with_capacity(2),
            end: source.linear(),
        }
    }

    #[inline]
    pub(crate) fn code32(&self) -> bool {
        self.source.mode.code32
    }

    /// Operand size of the stack pointer.
    #[inline]
    pub(crate) fn stack_width(&self) -> Width {
        Width::full(self.source.mode.stack32)
    }

    #[inline]
    fn linear(&self, eip: u32) -> u32 {
        self.source.cs_base.wrapping_add(eip)
    }

    // -- EIP -------------------------------------------------

    /// Store EIP for an exit path without changing what the
    /// straight-line code assumes the slot holds.
    pub(crate) fn store_eip(&mut self, eip: u32) {
        self.e.store_slot_imm(Width::B32, EIP_OFFSET, eip);
    }

    /// Bring the EIP slot up to the current instruction.
    pub(crate) fn sync_eip(&mut self) {
        if self.eip_slot != self.eip {
            self.store_eip(self.eip);
            self.eip_slot = self.eip;
        }
    }

    /// Record that generated code has left EIP at `eip`.
    pub(crate) fn assume_eip(&mut self, eip: u32) {
        self.eip_slot = eip;
    }

    // -- Exits -----------------------------------------------

    /// Leave through the next patchable exit, or a plain exit once
    /// the block has used all of them.
    pub(crate) fn link_exit(&mut self) -> Result<(), TranslateError> {
        if self.next_link < MAX_LINKS {
            self.e.exit_link(self.next_link)?;
            self.next_link += 1;
        } else {
            self.e.exit(ExitKind::Normal);
        }
        Ok(())
    }

    /// Direct transfer to `eip`, chainable to the block there.
    pub(crate) fn goto(&mut self, eip: u32) -> Result<(), TranslateError> {
        self.store_eip(eip);
        self.link_exit()
    }

    /// Return to the dispatcher early when a guest write hit
    /// translated code. EIP is left at the next instruction.
    fn check_exit_request(&mut self) {
        let cont = self.e.new_label();
        self.e.jump_if_slot_zero(EXIT_REQUEST_OFFSET, cont);
        self.store_eip(self.next);
        self.e.exit(ExitKind::Smc);
        self.e.bind(cont);
    }

    /// Relative branch target of `insn`.
    pub(crate) fn rel_target(&self) -> u32 {
        let target = self.next.wrapping_add(self.insn.imm);
        if self.insn.op32 {
            target
        } else {
            target & 0xFFFF
        }
    }

    fn note_pages(&mut self, start: u32, len: u32) {
        let first = page_of(start);
        let last = page_of(start.wrapping_add(len - 1));
        for page in [first, last] {
            if !self.pages.contains(&page) {
                self.pages.push(page);
            }
        }
    }

    /// Decode failures after the first instruction end the block in
    /// front of the offending instruction instead of failing it.
    fn stop_or_fail(&mut self, err: TranslateError) -> Result<(), TranslateError> {
        if self.base.num_insns == 0 {
            return Err(err);
        }
        self.base.is_jmp = JumpType::TooMany;
        Ok(())
    }
}

/// The x86 implementation of [`TranslatorOps`].
pub struct X86Translator<'a, E, M: ?Sized>(PhantomData<(&'a mut E, &'a M)>);

impl<'a, E: HostEmitter, M: GuestMemory + ?Sized> TranslatorOps for X86Translator<'a, E, M> {
    type Context = TranslatorCtx<'a, E, M>;

    fn tb_start(ctx: &mut Self::Context) -> Result<(), TranslateError> {
        ctx.e.begin_block();
        ctx.e.check_cycles();
        Ok(())
    }

    fn translate_insn(ctx: &mut Self::Context) -> Result<(), TranslateError> {
        let eip = ctx.base.eip_next;
        let mode = ctx.source.mode;
        let insn = match decode(ctx.mem, ctx.source.cs_base, eip, mode) {
            Ok(insn) => insn,
            Err(err) => return ctx.stop_or_fail(err.into()),
        };
        if !mode.code32 && eip as u64 + insn.len as u64 > 0x1_0000 {
            return ctx.stop_or_fail(TranslateError::SegmentWrap { eip });
        }

        ctx.base.num_insns += 1;
        ctx.insn = insn;
        ctx.eip = eip;
        ctx.next = next_eip(eip, insn.len, mode.code32);
        ctx.wrote_memory = false;
        let start = ctx.linear(eip);
        ctx.note_pages(start, insn.len as u32);
        ctx.end = start.wrapping_add(insn.len as u32);

        let handler = ctx.handlers[insn.family as usize];
        handler(ctx)?;
        ctx.base.eip_next = ctx.next;

        if ctx.base.is_jmp != JumpType::Next {
            return Ok(());
        }
        if ctx.wrote_memory {
            ctx.check_exit_request();
        }
        if ctx.e.offset() >= ctx.limits.max_bytes {
            ctx.base.is_jmp = JumpType::TooMany;
        } else if page_of(ctx.linear(ctx.next)) != page_of(ctx.linear(ctx.base.eip_first)) {
            ctx.base.is_jmp = JumpType::PageEnd;
        }
        Ok(())
    }

    fn tb_stop(ctx: &mut Self::Context) -> Result<(), TranslateError> {
        match ctx.base.is_jmp {
            JumpType::NoReturn => Ok(()),
            JumpType::Next | JumpType::TooMany | JumpType::PageEnd => {
                let eip = ctx.base.eip_next;
                ctx.goto(eip)
            }
        }
    }

    fn base(ctx: &Self::Context) -> &BlockContext {
        &ctx.base
    }

    fn base_mut(ctx: &mut Self::Context) -> &mut BlockContext {
        &mut ctx.base
    }
}

/// Translate the block starting at `source` into host code.
pub fn translate_block<E: HostEmitter, M: GuestMemory + ?Sized>(
    emitter: &mut E,
    mem: &M,
    source: BlockSource,
    helpers: &HelperTable,
    limits: BlockLimits,
) -> Result<TranslatedBlock, TranslateError> {
    let mut ctx = TranslatorCtx::new(emitter, mem, source, helpers, limits);
    crate::translator_loop::<X86Translator<'_, E, M>>(&mut ctx)?;

    let insn_count = ctx.base.num_insns;
    let code = ctx.e.finish(insn_count)?;
    trace!(
        start = format_args!("{:#x}", source.linear()),
        insns = insn_count,
        bytes = code.bytes.len(),
        end = ?ctx.base.is_jmp,
        "translated block"
    );
    Ok(TranslatedBlock {
        start: source.linear(),
        end: ctx.end,
        cs_base: source.cs_base,
        mode: source.mode,
        pages: ctx.pages,
        insn_count,
        code,
    })
}

fn placeholder_insn() -> DecodedInsn {
    DecodedInsn {
        opcode: 0x90,
        family: OpFamily::Nop,
        prefixes: dynx86_decode::Prefixes::empty(),
        segment: None,
        op32: false,
        addr32: false,
        modrm: None,
        mem: None,
        imm: 0,
        imm2: 0,
        len: 1,
    }
}
