//! The dispatch loop: find or translate the block at CS:EIP, run
//! it, act on its exit, repeat.

use std::ptr;

use dynx86_backend::{ArenaError, NativeEmitter};
use dynx86_core::block::{decode_exit, BlockId, ExitKind};
use dynx86_core::memory::page_of;
use dynx86_core::{CpuState, Eflags, GuestMemory, SegReg};
use dynx86_frontend::{translate_block, BlockSource, HelperTable};
use dynx86_interp::{service_interrupts, step, RunExit, StepOutcome};
use tracing::{error, trace, warn};

use crate::cache::{CacheStats, CodeCache};
use crate::config::DynrecConfig;
use crate::error::DynrecError;
use crate::helpers::helper_table;
use crate::tracker::TrackedMemory;

/// Where the dispatcher is in its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DispatchState {
    /// Looking up the block for the current CS:EIP.
    #[default]
    Seeking,
    Translating,
    Executing,
    /// The last instruction raised a guest exception, now being
    /// handled by its vector.
    Faulted,
}

/// Counters since the core was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub blocks_executed: u64,
    pub translations: u64,
    /// Translations that failed and fell back to the interpreter.
    pub fallbacks: u64,
    /// Instructions run by the interpreter outside any block.
    pub interpreted: u64,
    /// Interpreter call-outs made by translated code.
    pub callouts: u64,
    pub exceptions: u64,
}

/// The dynamic recompiling CPU core.
///
/// The layout starts with the guest `CpuState`: a pointer to the
/// core is the environment pointer of translated code, which
/// addresses guest registers at fixed offsets from it.
#[repr(C)]
pub struct DynCore<M> {
    pub cpu: CpuState,
    pub(crate) mem: M,
    pub(crate) cache: CodeCache,
    pub(crate) stats: DispatchStats,
    pub(crate) shutdown: bool,
    emitter: NativeEmitter,
    helpers: HelperTable,
    config: DynrecConfig,
    state: DispatchState,
    pending_irq: Option<u8>,
    /// Mode the cached blocks were translated for.
    mode_key: u32,
    degraded: bool,
}

/// A direct exit waiting to be chained to the next block.
#[derive(Debug, Clone, Copy)]
struct PendingLink {
    src: BlockId,
    slot: usize,
    /// Linear address the exit left EIP at. Only a block starting
    /// there may be chained to it.
    target: u32,
    /// Cache resets seen when the exit was taken. Block ids are
    /// reused after a reset.
    resets: u64,
}

impl<M: GuestMemory> DynCore<M> {
    pub fn new(cpu: CpuState, mem: M, config: DynrecConfig) -> Result<Self, DynrecError> {
        let mut emitter = NativeEmitter::new();
        let cache = CodeCache::new(&config, &mut emitter)?;
        Ok(Self::with_cache(cpu, mem, cache, emitter, config))
    }

    pub(crate) fn with_cache(
        cpu: CpuState,
        mem: M,
        cache: CodeCache,
        emitter: NativeEmitter,
        config: DynrecConfig,
    ) -> Self {
        let mode_key = cpu.mode().key();
        Self {
            cpu,
            mem,
            cache,
            stats: DispatchStats::default(),
            shutdown: false,
            emitter,
            helpers: helper_table::<M>(),
            config,
            state: DispatchState::Seeking,
            pending_irq: None,
            mode_key,
            degraded: false,
        }
    }

    // -- Accessors -------------------------------------------

    pub fn mem(&self) -> &M {
        &self.mem
    }

    /// Guest memory for an external client. Writes through it are
    /// checked against translated code like guest writes.
    pub fn mem_mut(&mut self) -> TrackedMemory<'_, M> {
        TrackedMemory::new(&mut self.mem, &mut self.cache)
    }

    pub fn cache(&self) -> &CodeCache {
        &self.cache
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn stats(&self) -> DispatchStats {
        self.stats
    }

    pub fn state(&self) -> DispatchState {
        self.state
    }

    pub fn config(&self) -> &DynrecConfig {
        &self.config
    }

    /// Whether the core has permanently fallen back to interpreting.
    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    /// Latch an external interrupt, delivered at the next block
    /// boundary with IF set.
    pub fn raise_interrupt(&mut self, vector: u8) {
        self.pending_irq = Some(vector);
    }

    /// Drop every translation.
    pub fn flush(&mut self) {
        self.cache.reset("flush");
    }

    /// Drop the translations derived from guest page `page`. Call
    /// when the page's mapping changes. Returns how many blocks were
    /// destroyed.
    pub fn on_mapping_change(&mut self, page: u32) -> usize {
        self.cache.invalidate_page(page)
    }

    // -- Dispatch loop ---------------------------------------

    /// Run for up to `cycles` guest instructions.
    pub fn run(&mut self, cycles: u32) -> RunExit {
        self.cpu.cycles = cycles.min(i32::MAX as u32) as i32;
        let mut chain: Option<PendingLink> = None;
        loop {
            if self.shutdown {
                return RunExit::Shutdown;
            }
            let ip = self.cpu.linear_ip();
            let mut mem = TrackedMemory::new(&mut self.mem, &mut self.cache);
            if service_interrupts(&mut self.cpu, &mut mem, &mut self.pending_irq) == StepOutcome::Shutdown {
                self.shutdown = true;
                return RunExit::Shutdown;
            }
            if self.cpu.linear_ip() != ip {
                // An interrupt was delivered.
                chain = None;
            }
            if self.cpu.halted {
                return RunExit::Halted;
            }
            if self.cpu.cycles <= 0 {
                return RunExit::CyclesExhausted;
            }

            if self.must_interpret() {
                chain = None;
                self.interpret_one();
                continue;
            }
            self.check_mode();

            let id = match self.find_block() {
                Ok(id) => id,
                Err(err) => {
                    chain = None;
                    self.translation_failed(err);
                    continue;
                }
            };
            if let Some(link) = chain.take() {
                self.chain(link, id);
            }

            self.state = DispatchState::Executing;
            let exceptions = self.stats.exceptions;
            let core = ptr::addr_of_mut!(*self);
            // SAFETY: `id` was just returned by the cache, and `self`
            // is not touched until the block returns.
            let Some(raw) = (unsafe { Self::execute(core, id) }) else {
                continue;
            };
            self.cpu.exit_request = 0;
            self.stats.blocks_executed += 1;
            self.state = DispatchState::Seeking;
            if self.cache.is_failed() {
                self.degrade(&"code cache write failed while a block ran");
                continue;
            }

            let (last, kind) = decode_exit(raw);
            chain = match kind.link_slot() {
                Some(slot) if self.config.link_blocks => Some(PendingLink {
                    src: last,
                    slot,
                    target: self.cpu.linear_ip(),
                    resets: self.cache.stats().resets,
                }),
                _ => None,
            };
            if kind == ExitKind::Callout && self.stats.exceptions != exceptions {
                self.state = DispatchState::Faulted;
            }
        }
    }

    /// Instructions the translator must not see: single-stepping,
    /// the instruction after STI or MOV SS, and hot pages.
    fn must_interpret(&self) -> bool {
        self.degraded
            || self.cpu.flag(Eflags::TF)
            || self.cpu.irq_shadow
            || self.cache.is_hot(page_of(self.cpu.linear_ip()))
    }

    fn interpret_one(&mut self) {
        self.cpu.cycles -= 1;
        self.stats.interpreted += 1;
        let mut mem = TrackedMemory::new(&mut self.mem, &mut self.cache);
        match step(&mut self.cpu, &mut mem) {
            StepOutcome::Normal | StepOutcome::Halted => self.state = DispatchState::Seeking,
            StepOutcome::Exception(exc) => {
                trace!(?exc, "exception while interpreting");
                self.stats.exceptions += 1;
                self.state = DispatchState::Faulted;
            }
            StepOutcome::Shutdown => self.shutdown = true,
        }
    }

    /// Blocks are only valid for the mode they were translated in.
    fn check_mode(&mut self) {
        let key = self.cpu.mode().key();
        if key != self.mode_key {
            self.cache.reset("mode change");
            self.mode_key = key;
        }
    }

    fn find_block(&mut self) -> Result<BlockId, DynrecError> {
        self.state = DispatchState::Seeking;
        if self.cache.is_failed() {
            return Err(ArenaError::Poisoned.into());
        }
        let cs_base = self.cpu.seg_base(SegReg::Cs);
        let linear = self.cpu.linear_ip();
        if let Some(id) = self.cache.lookup(linear) {
            if self.cache.block(id).is_some_and(|b| b.cs_base == cs_base) {
                return Ok(id);
            }
            self.cache.invalidate_block(id);
        }

        self.state = DispatchState::Translating;
        let source = BlockSource {
            cs_base,
            eip: self.cpu.eip,
            mode: self.cpu.mode(),
        };
        let block = translate_block(
            &mut self.emitter,
            &self.mem,
            source,
            &self.helpers,
            self.config.limits(),
        )?;
        self.stats.translations += 1;
        self.cache.commit(block)
    }

    fn translation_failed(&mut self, err: DynrecError) {
        if matches!(err, DynrecError::Arena(_)) || self.cache.is_failed() {
            self.degrade(&err);
        } else {
            warn!(
                eip = format_args!("{:#x}", self.cpu.eip),
                %err,
                "translation failed, interpreting"
            );
            self.stats.fallbacks += 1;
        }
        self.interpret_one();
    }

    fn chain(&mut self, link: PendingLink, dst: BlockId) {
        if link.resets != self.cache.stats().resets
            || !self.cache.block(dst).is_some_and(|b| b.start == link.target)
        {
            return;
        }
        if let Err(err) = self.cache.link(link.src, link.slot, dst) {
            self.degrade(&err);
        }
    }

    fn degrade(&mut self, err: &dyn std::fmt::Display) {
        if !self.degraded {
            error!(%err, "dynamic core disabled, continuing with the interpreter");
            self.degraded = true;
        }
    }

    /// Enter the block through the trampoline and return its exit
    /// value.
    ///
    /// The helpers reach the core through the environment pointer,
    /// so no reference to it may be live while the block runs.
    ///
    /// # Safety
    /// `core` must point to a live core. The block's host code must
    /// have been produced for this core's helper table and committed
    /// to its cache.
    unsafe fn execute(core: *mut Self, id: BlockId) -> Option<u32> {
        let (entry, code) = {
            let cache = &(*core).cache;
            (cache.entry_ptr(), cache.code_ptr(id)?)
        };
        // Trampoline signature:
        //   fn(env: *mut u8, code: *const u8) -> u32
        let entry: unsafe extern "C" fn(*mut u8, *const u8) -> u32 = std::mem::transmute(entry);
        Some(entry(core as *mut u8, code))
    }
}
