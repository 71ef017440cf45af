//! Guest x86 CPU architectural state.

use core::mem::offset_of;

use crate::flags::Eflags;
use crate::fpu::FpuState;
use crate::types::Width;

/// General-purpose register indices (ModR/M numbering).
pub const EAX: usize = 0;
pub const ECX: usize = 1;
pub const EDX: usize = 2;
pub const EBX: usize = 3;
pub const ESP: usize = 4;
pub const EBP: usize = 5;
pub const ESI: usize = 6;
pub const EDI: usize = 7;

/// Segment registers in x86 encoding order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SegReg {
    Es = 0,
    Cs = 1,
    Ss = 2,
    Ds = 3,
    Fs = 4,
    Gs = 5,
}

impl SegReg {
    pub const ALL: [SegReg; 6] = [
        SegReg::Es,
        SegReg::Cs,
        SegReg::Ss,
        SegReg::Ds,
        SegReg::Fs,
        SegReg::Gs,
    ];

    pub const fn from_index(idx: u8) -> Option<Self> {
        match idx {
            0 => Some(SegReg::Es),
            1 => Some(SegReg::Cs),
            2 => Some(SegReg::Ss),
            3 => Some(SegReg::Ds),
            4 => Some(SegReg::Fs),
            5 => Some(SegReg::Gs),
            _ => None,
        }
    }
}

/// A GDTR/IDTR image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(C)]
pub struct TableReg {
    pub base: u32,
    pub limit: u32,
}

/// The slice of CPU state that decides how code is decoded and
/// translated. A change of any field invalidates translations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CpuMode {
    pub code32: bool,
    pub stack32: bool,
    pub protected: bool,
    pub v86: bool,
    pub cpl: u8,
}

impl CpuMode {
    /// Real-address mode with 16-bit code and stack.
    pub const REAL: CpuMode = CpuMode {
        code32: false,
        stack32: false,
        protected: false,
        v86: false,
        cpl: 0,
    };

    /// Packed form used to detect mode switches cheaply.
    pub const fn key(self) -> u32 {
        (self.code32 as u32)
            | (self.stack32 as u32) << 1
            | (self.protected as u32) << 2
            | (self.v86 as u32) << 3
            | (self.cpl as u32) << 4
    }
}

/// Guest CPU architectural state.
///
/// Layout is `#[repr(C)]` so that generated host code can address
/// fields at fixed offsets from the environment pointer.
#[derive(Debug, Clone)]
#[repr(C)]
pub struct CpuState {
    /// EAX, ECX, EDX, EBX, ESP, EBP, ESI, EDI.
    pub regs: [u32; 8],
    pub eip: u32,
    pub eflags: u32,
    /// Segment selectors, indexed by `SegReg`.
    pub selectors: [u16; 6],
    /// Cached segment base addresses.
    pub seg_base: [u32; 6],
    /// Cached segment limits (informational, never enforced).
    pub seg_limit: [u32; 6],
    /// Cached D/B bits: 1 = 32-bit segment.
    pub seg_big: [u8; 6],
    pub cr0: u32,
    pub cr2: u32,
    pub cr3: u32,
    pub gdtr: TableReg,
    pub idtr: TableReg,
    pub fpu: FpuState,
    /// Remaining cycle budget; blocks return once it drops to zero.
    pub cycles: i32,
    /// Set non-zero to make running host code return at the next
    /// instruction boundary.
    pub exit_request: u32,
    /// Set by HLT until an interrupt arrives.
    pub halted: bool,
    /// Interrupts are held off for one instruction after STI/MOV SS.
    pub irq_shadow: bool,
}

// Field offsets (bytes) from the start of `CpuState`, used by the
// code emitter to address guest registers relative to the env pointer.

pub const REGS_OFFSET: usize = offset_of!(CpuState, regs);
pub const EIP_OFFSET: usize = offset_of!(CpuState, eip);
pub const EFLAGS_OFFSET: usize = offset_of!(CpuState, eflags);
pub const SEG_BASE_OFFSET: usize = offset_of!(CpuState, seg_base);
pub const CYCLES_OFFSET: usize = offset_of!(CpuState, cycles);
pub const EXIT_REQUEST_OFFSET: usize = offset_of!(CpuState, exit_request);
pub const FPU_TOP_OFFSET: usize = offset_of!(CpuState, fpu) + offset_of!(FpuState, top);
pub const FPU_TAGS_OFFSET: usize = offset_of!(CpuState, fpu) + offset_of!(FpuState, tags);

/// Byte offset of the 32-bit register `r`.
pub const fn reg_offset(r: usize) -> usize {
    REGS_OFFSET + r * 4
}

/// Byte offset of the 8-bit register `r` (AL, CL, DL, BL, AH, CH, DH, BH).
///
/// The high-byte registers live one byte into their 32-bit slot
/// on a little-endian host.
pub const fn reg8_offset(r: usize) -> usize {
    if r < 4 {
        reg_offset(r)
    } else {
        reg_offset(r - 4) + 1
    }
}

/// Byte offset of register `r` accessed with `width`.
pub const fn reg_slot(width: Width, r: usize) -> usize {
    match width {
        Width::B8 => reg8_offset(r),
        _ => reg_offset(r),
    }
}

/// Byte offset of the cached base of segment `seg`.
pub const fn seg_base_offset(seg: SegReg) -> usize {
    SEG_BASE_OFFSET + seg as usize * 4
}

/// Add `delta` to an instruction pointer using 16- or 32-bit
/// arithmetic. The 16-bit form wraps within the low word.
#[inline]
pub const fn ip_add(ip: u32, delta: u32, wide: bool) -> u32 {
    if wide {
        ip.wrapping_add(delta)
    } else {
        ip.wrapping_add(delta) & 0xFFFF
    }
}

impl CpuState {
    /// A CPU in its power-on state, about to fetch from F000:FFF0.
    pub fn new() -> Self {
        let mut cpu = Self {
            regs: [0; 8],
            eip: 0xFFF0,
            eflags: Eflags::RESET,
            selectors: [0; 6],
            seg_base: [0; 6],
            seg_limit: [0xFFFF; 6],
            seg_big: [0; 6],
            cr0: 0,
            cr2: 0,
            cr3: 0,
            gdtr: TableReg::default(),
            idtr: TableReg { base: 0, limit: 0x3FF },
            fpu: FpuState::new(),
            cycles: 0,
            exit_request: 0,
            halted: false,
            irq_shadow: false,
        };
        cpu.load_seg_real(SegReg::Cs, 0xF000);
        cpu
    }

    // -- Register access ---------------------------------------

    #[inline]
    pub fn reg8(&self, r: usize) -> u8 {
        if r < 4 {
            self.regs[r] as u8
        } else {
            (self.regs[r - 4] >> 8) as u8
        }
    }

    #[inline]
    pub fn set_reg8(&mut self, r: usize, val: u8) {
        if r < 4 {
            self.regs[r] = (self.regs[r] & !0xFF) | val as u32;
        } else {
            let slot = &mut self.regs[r - 4];
            *slot = (*slot & !0xFF00) | (val as u32) << 8;
        }
    }

    #[inline]
    pub fn reg16(&self, r: usize) -> u16 {
        self.regs[r] as u16
    }

    #[inline]
    pub fn set_reg16(&mut self, r: usize, val: u16) {
        self.regs[r] = (self.regs[r] & 0xFFFF_0000) | val as u32;
    }

    /// Read register `r` at `width`, zero-extended.
    #[inline]
    pub fn reg(&self, width: Width, r: usize) -> u32 {
        match width {
            Width::B8 => self.reg8(r) as u32,
            Width::B16 => self.reg16(r) as u32,
            Width::B32 => self.regs[r],
        }
    }

    /// Write the low `width` bits of `val` into register `r`.
    #[inline]
    pub fn set_reg(&mut self, width: Width, r: usize, val: u32) {
        match width {
            Width::B8 => self.set_reg8(r, val as u8),
            Width::B16 => self.set_reg16(r, val as u16),
            Width::B32 => self.regs[r] = val,
        }
    }

    // -- Flags -------------------------------------------------

    #[inline]
    pub fn flags(&self) -> Eflags {
        Eflags::from_bits_retain(self.eflags)
    }

    #[inline]
    pub fn flag(&self, f: Eflags) -> bool {
        self.eflags & f.bits() != 0
    }

    #[inline]
    pub fn set_flag(&mut self, f: Eflags, on: bool) {
        if on {
            self.eflags |= f.bits();
        } else {
            self.eflags &= !f.bits();
        }
    }

    /// Replace the bits in `mask` with those of `val`.
    #[inline]
    pub fn merge_flags(&mut self, val: u32, mask: u32) {
        self.eflags = (self.eflags & !mask) | (val & mask);
    }

    // -- Segments ----------------------------------------------

    #[inline]
    pub fn seg_base(&self, seg: SegReg) -> u32 {
        self.seg_base[seg as usize]
    }

    #[inline]
    pub fn selector(&self, seg: SegReg) -> u16 {
        self.selectors[seg as usize]
    }

    /// Load a segment register with real-mode semantics. Only the
    /// selector and base change; the cached limit and size survive.
    pub fn load_seg_real(&mut self, seg: SegReg, sel: u16) {
        let i = seg as usize;
        self.selectors[i] = sel;
        self.seg_base[i] = (sel as u32) << 4;
    }

    // -- Mode --------------------------------------------------

    #[inline]
    pub fn is_protected(&self) -> bool {
        self.cr0 & 1 != 0
    }

    #[inline]
    pub fn is_v86(&self) -> bool {
        self.is_protected() && self.flag(Eflags::VM)
    }

    /// 32-bit default operand and address size for code.
    #[inline]
    pub fn code32(&self) -> bool {
        self.is_protected() && !self.is_v86() && self.seg_big[SegReg::Cs as usize] != 0
    }

    /// 32-bit stack pointer.
    #[inline]
    pub fn stack32(&self) -> bool {
        self.is_protected() && !self.is_v86() && self.seg_big[SegReg::Ss as usize] != 0
    }

    /// Current privilege level.
    #[inline]
    pub fn cpl(&self) -> u8 {
        if !self.is_protected() {
            0
        } else if self.is_v86() {
            3
        } else {
            (self.selectors[SegReg::Cs as usize] & 3) as u8
        }
    }

    pub fn mode(&self) -> CpuMode {
        CpuMode {
            code32: self.code32(),
            stack32: self.stack32(),
            protected: self.is_protected(),
            v86: self.is_v86(),
            cpl: self.cpl(),
        }
    }

    /// Linear address of the next instruction.
    #[inline]
    pub fn linear_ip(&self) -> u32 {
        self.seg_base(SegReg::Cs).wrapping_add(self.eip)
    }

    /// Advance EIP by `delta` bytes with code-size wrapping.
    #[inline]
    pub fn advance_ip(&mut self, delta: u32) {
        self.eip = ip_add(self.eip, delta, self.code32());
    }

    /// Stack pointer masked to the current stack size.
    #[inline]
    pub fn sp(&self) -> u32 {
        if self.stack32() {
            self.regs[ESP]
        } else {
            self.regs[ESP] & 0xFFFF
        }
    }

    /// Store a new stack pointer, preserving the high word of ESP
    /// for 16-bit stacks.
    #[inline]
    pub fn set_sp(&mut self, sp: u32) {
        if self.stack32() {
            self.regs[ESP] = sp;
        } else {
            self.set_reg16(ESP, sp as u16);
        }
    }
}

impl Default for CpuState {
    fn default() -> Self {
        Self::new()
    }
}
