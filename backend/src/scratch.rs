use crate::EmitError;

/// A claimed scratch host register, identified by its index in the
/// backend's scratch pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScratchReg(pub(crate) u8);

impl ScratchReg {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Bounded pool of scratch registers.
#[derive(Debug, Clone)]
pub struct ScratchRegs {
    /// Bit `i` set = register `i` is free.
    free: u32,
    count: u8,
}

impl ScratchRegs {
    pub fn new(count: u8) -> Self {
        assert!(count <= 32);
        let free = if count == 32 {
            u32::MAX
        } else {
            (1u32 << count) - 1
        };
        Self { free, count }
    }

    pub fn claim(&mut self) -> Result<ScratchReg, EmitError> {
        if self.free == 0 {
            return Err(EmitError::OutOfRegisters);
        }
        let idx = self.free.trailing_zeros();
        self.free &= !(1 << idx);
        Ok(ScratchReg(idx as u8))
    }

    pub fn release(&mut self, reg: ScratchReg) {
        debug_assert!(reg.0 < self.count);
        debug_assert!(self.free & (1 << reg.0) == 0, "double release of {reg:?}");
        self.free |= 1 << reg.0;
    }

    /// Return every register to the pool.
    pub fn reset(&mut self) {
        *self = Self::new(self.count);
    }

    pub fn available(&self) -> usize {
        self.free.count_ones() as usize
    }

    pub fn capacity(&self) -> usize {
        self.count as usize
    }
}
