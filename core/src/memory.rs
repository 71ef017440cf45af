//! Guest memory and port I/O interface.

use std::collections::{HashMap, VecDeque};

use crate::types::Width;

/// Guest page size used for code tracking.
pub const PAGE_SHIFT: u32 = 12;
pub const PAGE_SIZE: u32 = 1 << PAGE_SHIFT;

/// Guest page number of a linear address.
#[inline]
pub const fn page_of(addr: u32) -> u32 {
    addr >> PAGE_SHIFT
}

/// Value seen on reads from unmapped addresses and ports.
pub const OPEN_BUS: u8 = 0xFF;

/// Linear guest memory plus port I/O, as seen by the CPU.
///
/// Reads take `&mut self` because device registers may have read
/// side effects. `peek_u8` must be free of side effects: the
/// decoder uses it to fetch instruction bytes.
pub trait GuestMemory {
    /// Side-effect-free byte read for instruction fetch.
    fn peek_u8(&self, addr: u32) -> u8;

    fn read_u8(&mut self, addr: u32) -> u8;

    fn write_u8(&mut self, addr: u32, val: u8);

    fn read_u16(&mut self, addr: u32) -> u16 {
        let lo = self.read_u8(addr) as u16;
        let hi = self.read_u8(addr.wrapping_add(1)) as u16;
        lo | hi << 8
    }

    fn read_u32(&mut self, addr: u32) -> u32 {
        let lo = self.read_u16(addr) as u32;
        let hi = self.read_u16(addr.wrapping_add(2)) as u32;
        lo | hi << 16
    }

    fn write_u16(&mut self, addr: u32, val: u16) {
        self.write_u8(addr, val as u8);
        self.write_u8(addr.wrapping_add(1), (val >> 8) as u8);
    }

    fn write_u32(&mut self, addr: u32, val: u32) {
        self.write_u16(addr, val as u16);
        self.write_u16(addr.wrapping_add(2), (val >> 16) as u16);
    }

    /// Read `width` from an I/O port. Unclaimed ports float high.
    fn io_read(&mut self, _port: u16, width: Width) -> u32 {
        0xFFFF_FFFF & width.mask()
    }

    fn io_write(&mut self, _port: u16, _width: Width, _val: u32) {}

    /// Acknowledge and return a pending external interrupt vector.
    /// Only called while the guest has interrupts enabled.
    fn poll_interrupt(&mut self) -> Option<u8> {
        None
    }

    /// Read at `width`, zero-extended.
    fn read(&mut self, addr: u32, width: Width) -> u32 {
        match width {
            Width::B8 => self.read_u8(addr) as u32,
            Width::B16 => self.read_u16(addr) as u32,
            Width::B32 => self.read_u32(addr),
        }
    }

    /// Write the low `width` bits of `val`.
    fn write(&mut self, addr: u32, width: Width, val: u32) {
        match width {
            Width::B8 => self.write_u8(addr, val as u8),
            Width::B16 => self.write_u16(addr, val as u16),
            Width::B32 => self.write_u32(addr, val),
        }
    }
}

impl<M: GuestMemory + ?Sized> GuestMemory for &mut M {
    fn peek_u8(&self, addr: u32) -> u8 {
        (**self).peek_u8(addr)
    }

    fn read_u8(&mut self, addr: u32) -> u8 {
        (**self).read_u8(addr)
    }

    fn write_u8(&mut self, addr: u32, val: u8) {
        (**self).write_u8(addr, val)
    }

    fn read_u16(&mut self, addr: u32) -> u16 {
        (**self).read_u16(addr)
    }

    fn read_u32(&mut self, addr: u32) -> u32 {
        (**self).read_u32(addr)
    }

    fn write_u16(&mut self, addr: u32, val: u16) {
        (**self).write_u16(addr, val)
    }

    fn write_u32(&mut self, addr: u32, val: u32) {
        (**self).write_u32(addr, val)
    }

    fn io_read(&mut self, port: u16, width: Width) -> u32 {
        (**self).io_read(port, width)
    }

    fn io_write(&mut self, port: u16, width: Width, val: u32) {
        (**self).io_write(port, width, val)
    }

    fn poll_interrupt(&mut self) -> Option<u8> {
        (**self).poll_interrupt()
    }
}

/// RAM-backed guest memory starting at linear address 0.
///
/// Accesses beyond the end of RAM read as open bus and ignore
/// writes. Ports latch the last value written to them, and
/// interrupts can be queued for the CPU to pick up.
#[derive(Debug, Clone)]
pub struct FlatMemory {
    ram: Vec<u8>,
    ports: HashMap<u16, u32>,
    irqs: VecDeque<u8>,
}

impl FlatMemory {
    pub fn new(size: usize) -> Self {
        Self {
            ram: vec![0; size],
            ports: HashMap::new(),
            irqs: VecDeque::new(),
        }
    }

    /// Copy `bytes` into RAM at `addr`, clipping at the end of RAM.
    pub fn load(&mut self, addr: u32, bytes: &[u8]) {
        let start = (addr as usize).min(self.ram.len());
        let end = (start + bytes.len()).min(self.ram.len());
        self.ram[start..end].copy_from_slice(&bytes[..end - start]);
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.ram
    }

    pub fn len(&self) -> usize {
        self.ram.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ram.is_empty()
    }

    /// Queue an external interrupt vector.
    pub fn raise_irq(&mut self, vector: u8) {
        self.irqs.push_back(vector);
    }

    /// Last value written to `port`, if any.
    pub fn port(&self, port: u16) -> Option<u32> {
        self.ports.get(&port).copied()
    }
}

impl GuestMemory for FlatMemory {
    #[inline]
    fn peek_u8(&self, addr: u32) -> u8 {
        self.ram.get(addr as usize).copied().unwrap_or(OPEN_BUS)
    }

    #[inline]
    fn read_u8(&mut self, addr: u32) -> u8 {
        self.peek_u8(addr)
    }

    #[inline]
    fn write_u8(&mut self, addr: u32, val: u8) {
        if let Some(b) = self.ram.get_mut(addr as usize) {
            *b = val;
        }
    }

    fn io_read(&mut self, port: u16, width: Width) -> u32 {
        self.ports.get(&port).copied().unwrap_or(0xFFFF_FFFF) & width.mask()
    }

    fn io_write(&mut self, port: u16, width: Width, val: u32) {
        self.ports.insert(port, val & width.mask());
    }

    fn poll_interrupt(&mut self) -> Option<u8> {
        self.irqs.pop_front()
    }
}
