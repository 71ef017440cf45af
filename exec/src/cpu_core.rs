//! Core selection: the dynamic core where the host supports it,
//! the interpreter everywhere else.

use dynx86_core::{CpuState, GuestMemory};
use dynx86_interp::{Interpreter, RunExit};
use tracing::error;

use crate::config::{ConfigError, DynrecConfig};
use crate::tracker::TrackedMemory;

#[cfg(target_arch = "x86_64")]
use crate::dispatch::DynCore;

pub enum CpuCore<M> {
    #[cfg(target_arch = "x86_64")]
    Dynamic(Box<DynCore<M>>),
    Interpreted(Interpreter<M>),
}

impl<M: GuestMemory> CpuCore<M> {
    /// Build the dynamic core, or the interpreter when executable
    /// memory cannot be had.
    pub fn new(cpu: CpuState, mem: M, config: DynrecConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        #[cfg(target_arch = "x86_64")]
        {
            use crate::cache::CodeCache;
            use dynx86_backend::NativeEmitter;

            let mut emitter = NativeEmitter::new();
            match CodeCache::new(&config, &mut emitter) {
                Ok(cache) => {
                    let core = DynCore::with_cache(cpu, mem, cache, emitter, config);
                    return Ok(CpuCore::Dynamic(Box::new(core)));
                }
                Err(err) => error!(%err, "no executable memory, using the interpreter"),
            }
        }
        #[cfg(not(target_arch = "x86_64"))]
        error!("no code emitter for this host, using the interpreter");
        Ok(CpuCore::Interpreted(Interpreter::with_state(cpu, mem)))
    }

    pub fn interpreted(cpu: CpuState, mem: M) -> Self {
        CpuCore::Interpreted(Interpreter::with_state(cpu, mem))
    }

    pub fn is_dynamic(&self) -> bool {
        !matches!(self, CpuCore::Interpreted(_))
    }

    pub fn run(&mut self, cycles: u32) -> RunExit {
        match self {
            #[cfg(target_arch = "x86_64")]
            CpuCore::Dynamic(core) => core.run(cycles),
            CpuCore::Interpreted(it) => it.run(cycles),
        }
    }

    pub fn raise_interrupt(&mut self, vector: u8) {
        match self {
            #[cfg(target_arch = "x86_64")]
            CpuCore::Dynamic(core) => core.raise_interrupt(vector),
            CpuCore::Interpreted(it) => it.raise_interrupt(vector),
        }
    }

    pub fn cpu(&self) -> &CpuState {
        match self {
            #[cfg(target_arch = "x86_64")]
            CpuCore::Dynamic(core) => &core.cpu,
            CpuCore::Interpreted(it) => &it.cpu,
        }
    }

    pub fn cpu_mut(&mut self) -> &mut CpuState {
        match self {
            #[cfg(target_arch = "x86_64")]
            CpuCore::Dynamic(core) => &mut core.cpu,
            CpuCore::Interpreted(it) => &mut it.cpu,
        }
    }

    pub fn mem(&self) -> &M {
        match self {
            #[cfg(target_arch = "x86_64")]
            CpuCore::Dynamic(core) => core.mem(),
            CpuCore::Interpreted(it) => &it.mem,
        }
    }

    /// Guest memory for an external client. On the dynamic core
    /// writes through it invalidate the translations they hit.
    pub fn mem_mut(&mut self) -> TrackedMemory<'_, M> {
        match self {
            #[cfg(target_arch = "x86_64")]
            CpuCore::Dynamic(core) => core.mem_mut(),
            CpuCore::Interpreted(it) => TrackedMemory::untracked(&mut it.mem),
        }
    }

    /// Notify the core that the mapping of guest page `page`
    /// changed. Returns how many translated blocks were dropped.
    pub fn on_mapping_change(&mut self, page: u32) -> usize {
        match self {
            #[cfg(target_arch = "x86_64")]
            CpuCore::Dynamic(core) => core.on_mapping_change(page),
            CpuCore::Interpreted(_) => {
                let _ = page;
                0
            }
        }
    }

    /// Whether a dynamic core has fallen back to interpreting.
    pub fn is_degraded(&self) -> bool {
        match self {
            #[cfg(target_arch = "x86_64")]
            CpuCore::Dynamic(core) => core.is_degraded(),
            CpuCore::Interpreted(_) => false,
        }
    }
}
