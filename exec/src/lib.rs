//! Execution engine of the dynamic core: code cache, write
//! tracking, native helpers and the dispatch loop.
//!
//! Blocks are looked up by the linear address of CS:EIP, translated
//! on a miss, and run through a trampoline that enters host code
//! with a pointer to the core. Blocks return an exit value naming
//! the exiting block and the reason; direct branch exits are
//! patched to chain straight into their successor.

pub mod cache;
pub mod config;
pub mod cpu_core;
pub mod error;
pub mod tracker;

#[cfg(target_arch = "x86_64")]
pub mod dispatch;
#[cfg(target_arch = "x86_64")]
mod helpers;

pub use cache::{CacheStats, CachedBlock, CodeCache};
pub use config::{ConfigError, DynrecConfig};
pub use cpu_core::CpuCore;
#[cfg(target_arch = "x86_64")]
pub use dispatch::{DispatchState, DispatchStats, DynCore};
pub use dynx86_interp::RunExit;
pub use error::DynrecError;
pub use tracker::{HotPages, PageTracker, TrackedMemory};
