//! Guest machine model shared by every stage of the recompiler.
//!
//! Holds the architectural register file (`CpuState`), EFLAGS,
//! the x87 register stack, the guest memory/IO interface and the
//! exception vocabulary used by the decoder, the interpreter and
//! the dynamic core alike.

pub mod block;
pub mod cpu;
pub mod exception;
pub mod flags;
pub mod fpu;
pub mod memory;
pub mod types;

pub use block::{BlockId, ExitKind};
pub use cpu::{CpuMode, CpuState, SegReg};
pub use exception::Exception;
pub use flags::Eflags;
pub use fpu::FpuState;
pub use memory::{FlatMemory, GuestMemory, PAGE_SHIFT, PAGE_SIZE};
pub use types::{AluOp, Cond, ShiftOp, Width};
