/// Staging buffer for the host code of one block.
///
/// Code is assembled here, relocation-free except for the sites
/// recorded by the emitter, and then copied into the executable
/// arena by the code cache.
#[derive(Debug, Default, Clone)]
pub struct CodeBuffer {
    bytes: Vec<u8>,
}

impl CodeBuffer {
    pub fn new() -> Self {
        Self {
            bytes: Vec::with_capacity(1024),
        }
    }

    /// Current write offset.
    #[inline]
    pub fn offset(&self) -> usize {
        self.bytes.len()
    }

    /// Drop all emitted bytes.
    #[inline]
    pub fn clear(&mut self) {
        self.bytes.clear();
    }

    // -- Emit methods --

    #[inline]
    pub fn emit_u8(&mut self, val: u8) {
        self.bytes.push(val);
    }

    #[inline]
    pub fn emit_u16(&mut self, val: u16) {
        self.bytes.extend_from_slice(&val.to_le_bytes());
    }

    #[inline]
    pub fn emit_u32(&mut self, val: u32) {
        self.bytes.extend_from_slice(&val.to_le_bytes());
    }

    #[inline]
    pub fn emit_u64(&mut self, val: u64) {
        self.bytes.extend_from_slice(&val.to_le_bytes());
    }

    #[inline]
    pub fn emit_bytes(&mut self, data: &[u8]) {
        self.bytes.extend_from_slice(data);
    }

    /// Patch a u8 at the given offset.
    #[inline]
    pub fn patch_u8(&mut self, offset: usize, val: u8) {
        self.bytes[offset] = val;
    }

    /// Patch a u32 at the given offset (for back-patching jumps).
    #[inline]
    pub fn patch_u32(&mut self, offset: usize, val: u32) {
        self.bytes[offset..offset + 4].copy_from_slice(&val.to_le_bytes());
    }

    /// Read a u32 at the given offset.
    #[inline]
    pub fn read_u32(&self, offset: usize) -> u32 {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&self.bytes[offset..offset + 4]);
        u32::from_le_bytes(raw)
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    /// Take the assembled bytes, leaving the buffer empty.
    pub fn take(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.bytes)
    }
}
