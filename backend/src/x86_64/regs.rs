/// x86-64 general-purpose register indices.
///
/// Encoding matches the x86-64 ModR/M and REX register numbering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Reg {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

impl Reg {
    /// Low 3 bits of the register encoding (for ModR/M).
    #[inline]
    pub const fn low3(self) -> u8 {
        (self as u8) & 0x7
    }

    /// Whether this register requires a REX prefix (R8-R15).
    #[inline]
    pub const fn needs_rex(self) -> bool {
        (self as u8) >= 8
    }
}

/// RBP holds the environment pointer (the guest `CpuState`) for
/// the whole lifetime of generated code.
pub const ENV_REG: Reg = Reg::Rbp;

/// Emitter-internal temporary; never handed out as a scratch
/// register and clobbered by flag merges and helper calls.
pub const TMP_REG: Reg = Reg::Rax;

/// Callee-saved registers that the prologue must save/restore
/// (System V ABI).
pub const CALLEE_SAVED: &[Reg] = &[Reg::Rbp, Reg::Rbx, Reg::R12, Reg::R13, Reg::R14, Reg::R15];

/// Function argument registers (System V AMD64 ABI).
pub const CALL_ARG_REGS: &[Reg] = &[Reg::Rdi, Reg::Rsi, Reg::Rdx, Reg::Rcx, Reg::R8, Reg::R9];

/// Scratch pool handed to the translator. All callee-saved, so
/// values survive helper calls without spilling.
pub const SCRATCH_REGS: [Reg; 5] = [Reg::Rbx, Reg::R12, Reg::R13, Reg::R14, Reg::R15];

pub const STACK_ALIGN: usize = 16;

/// Total push size: return address (implicit) + callee-saved pushes.
pub const PUSH_SIZE: usize = (1 + CALLEE_SAVED.len()) * 8;

/// Total frame size (16-byte aligned).
pub const FRAME_SIZE: usize = (PUSH_SIZE + STACK_ALIGN - 1) & !(STACK_ALIGN - 1);

/// Stack adjustment after pushes, keeping RSP 16-byte aligned at
/// helper call sites.
pub const STACK_ADDEND: usize = FRAME_SIZE - PUSH_SIZE;
