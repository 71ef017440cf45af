//! x87 register stack model.
//!
//! Values are held as `f64`. The eight stack slots are addressed
//! physically; `top` selects which physical slot is ST(0). A ninth
//! slot is scratch space for memory operands.

/// Physical index of the scratch slot used for memory operands.
pub const FPU_TEMP: usize = 8;

/// Tag values (x87 encoding).
pub const TAG_VALID: u32 = 0;
pub const TAG_ZERO: u32 = 1;
pub const TAG_SPECIAL: u32 = 2;
pub const TAG_EMPTY: u32 = 3;

/// Status word condition bits.
pub const SW_C0: u16 = 1 << 8;
pub const SW_C1: u16 = 1 << 9;
pub const SW_C2: u16 = 1 << 10;
pub const SW_C3: u16 = 1 << 14;
pub const SW_TOP_MASK: u16 = 7 << 11;

/// Control word after FINIT.
pub const CW_DEFAULT: u16 = 0x037F;

#[derive(Debug, Clone, PartialEq)]
#[repr(C)]
pub struct FpuState {
    pub regs: [f64; 9],
    /// Physical slot of ST(0).
    pub top: u32,
    pub tags: [u32; 8],
    pub cw: u16,
    /// Status word without the TOP field (kept in `top`).
    pub sw: u16,
}

impl FpuState {
    pub fn new() -> Self {
        Self {
            regs: [0.0; 9],
            top: 0,
            tags: [TAG_EMPTY; 8],
            cw: CW_DEFAULT,
            sw: 0,
        }
    }

    /// FNINIT.
    pub fn init(&mut self) {
        self.top = 0;
        self.tags = [TAG_EMPTY; 8];
        self.cw = CW_DEFAULT;
        self.sw = 0;
    }

    /// Physical slot of ST(i).
    #[inline]
    pub fn st(&self, i: u32) -> usize {
        ((self.top + i) & 7) as usize
    }

    #[inline]
    pub fn st0(&self) -> f64 {
        self.regs[self.st(0)]
    }

    /// Make room for a push: decrement TOP and mark the new slot valid.
    #[inline]
    pub fn prep_push(&mut self) {
        self.top = (self.top.wrapping_sub(1)) & 7;
        self.tags[self.top as usize] = TAG_VALID;
    }

    /// Pop ST(0): mark it empty and increment TOP.
    #[inline]
    pub fn pop(&mut self) {
        self.tags[self.top as usize] = TAG_EMPTY;
        self.top = (self.top + 1) & 7;
    }

    /// Full status word including TOP.
    pub fn status_word(&self) -> u16 {
        (self.sw & !SW_TOP_MASK) | ((self.top as u16 & 7) << 11)
    }

    pub fn set_status_word(&mut self, sw: u16) {
        self.top = ((sw >> 11) & 7) as u32;
        self.sw = sw & !SW_TOP_MASK;
    }

    /// Tag word, two bits per physical register.
    pub fn tag_word(&self) -> u16 {
        self.tags
            .iter()
            .enumerate()
            .fold(0u16, |acc, (i, &t)| acc | ((t as u16 & 3) << (2 * i)))
    }

    pub fn set_tag_word(&mut self, tw: u16) {
        for (i, tag) in self.tags.iter_mut().enumerate() {
            *tag = ((tw >> (2 * i)) & 3) as u32;
        }
    }

    /// Set C3/C2/C1/C0 to the given bits, clearing the others.
    #[inline]
    pub fn set_cc(&mut self, bits: u16) {
        self.sw = (self.sw & !(SW_C0 | SW_C1 | SW_C2 | SW_C3)) | bits;
    }

    /// Rounding control field of the control word.
    #[inline]
    pub fn rounding(&self) -> u16 {
        (self.cw >> 10) & 3
    }
}

impl Default for FpuState {
    fn default() -> Self {
        Self::new()
    }
}
