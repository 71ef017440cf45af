//! Guest write tracking for translated code.
//!
//! Every guest page that holds the bytes of a live block has its
//! bit set in a [`PageTracker`]. Writes check that bit before they
//! reach memory; the common case of a write to a page without code
//! costs one bit test.

use std::collections::HashMap;

use dynx86_core::memory::page_of;
use dynx86_core::{GuestMemory, Width, PAGE_SHIFT};

use crate::cache::CodeCache;

/// Number of guest pages in the 32-bit linear address space.
pub const PAGE_COUNT: usize = 1 << (32 - PAGE_SHIFT);

/// One bit per guest page.
pub struct PageTracker {
    bits: Box<[u64]>,
}

impl PageTracker {
    pub fn new() -> Self {
        Self {
            bits: vec![0u64; PAGE_COUNT / 64].into_boxed_slice(),
        }
    }

    #[inline]
    pub fn is_set(&self, page: u32) -> bool {
        let page = page as usize;
        self.bits[page >> 6] & (1 << (page & 63)) != 0
    }

    #[inline]
    pub fn set(&mut self, page: u32) {
        let page = page as usize;
        self.bits[page >> 6] |= 1 << (page & 63);
    }

    #[inline]
    pub fn clear(&mut self, page: u32) {
        let page = page as usize;
        self.bits[page >> 6] &= !(1 << (page & 63));
    }

    pub fn clear_all(&mut self) {
        self.bits.fill(0);
    }

    /// Whether any page touched by `len` bytes at `addr` is set.
    #[inline]
    pub fn any_in(&self, addr: u32, len: u32) -> bool {
        let (first, last) = page_span(addr, len);
        self.is_set(first) || self.is_set(last)
    }
}

impl Default for PageTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// First and last page of a short access. Accesses never span more
/// than two pages.
#[inline]
pub fn page_span(addr: u32, len: u32) -> (u32, u32) {
    (page_of(addr), page_of(addr.wrapping_add(len.max(1) - 1)))
}

/// Per-page invalidation counts. A page invalidated more than
/// `threshold` times is hot and left to the interpreter until the
/// counts are cleared by a cache reset.
pub struct HotPages {
    counts: HashMap<u32, u32>,
    hot: PageTracker,
    threshold: u32,
}

impl HotPages {
    pub fn new(threshold: u32) -> Self {
        Self {
            counts: HashMap::new(),
            hot: PageTracker::new(),
            threshold,
        }
    }

    /// Count one invalidation of `page`. Returns true when this made
    /// the page hot.
    pub fn note(&mut self, page: u32) -> bool {
        let count = self.counts.entry(page).or_insert(0);
        *count += 1;
        if *count > self.threshold && !self.hot.is_set(page) {
            self.hot.set(page);
            return true;
        }
        false
    }

    #[inline]
    pub fn is_hot(&self, page: u32) -> bool {
        self.hot.is_set(page)
    }

    pub fn clear(&mut self) {
        self.counts.clear();
        self.hot.clear_all();
    }
}

/// A memory client whose writes are checked against the code cache.
///
/// Wraps the guest memory for the interpreter, the native helpers
/// and external clients. A write that hits translated code first
/// invalidates the blocks it overlaps, then reaches memory.
/// Without a cache (an interpreting core) writes pass straight
/// through.
pub struct TrackedMemory<'a, M: ?Sized> {
    mem: &'a mut M,
    cache: Option<&'a mut CodeCache>,
    hit: bool,
}

impl<'a, M: GuestMemory + ?Sized> TrackedMemory<'a, M> {
    pub fn new(mem: &'a mut M, cache: &'a mut CodeCache) -> Self {
        Self {
            mem,
            cache: Some(cache),
            hit: false,
        }
    }

    pub fn untracked(mem: &'a mut M) -> Self {
        Self {
            mem,
            cache: None,
            hit: false,
        }
    }

    /// Whether any write so far invalidated translated code.
    #[inline]
    pub fn hit(&self) -> bool {
        self.hit
    }

    #[inline]
    pub fn on_guest_write(&mut self, addr: u32, len: u32) {
        if let Some(cache) = self.cache.as_deref_mut() {
            if cache.on_guest_write(addr, len) {
                self.hit = true;
            }
        }
    }
}

impl<M: GuestMemory + ?Sized> GuestMemory for TrackedMemory<'_, M> {
    #[inline]
    fn peek_u8(&self, addr: u32) -> u8 {
        self.mem.peek_u8(addr)
    }

    #[inline]
    fn read_u8(&mut self, addr: u32) -> u8 {
        self.mem.read_u8(addr)
    }

    fn read_u16(&mut self, addr: u32) -> u16 {
        self.mem.read_u16(addr)
    }

    fn read_u32(&mut self, addr: u32) -> u32 {
        self.mem.read_u32(addr)
    }

    #[inline]
    fn write_u8(&mut self, addr: u32, val: u8) {
        self.on_guest_write(addr, 1);
        self.mem.write_u8(addr, val);
    }

    fn write_u16(&mut self, addr: u32, val: u16) {
        self.on_guest_write(addr, 2);
        self.mem.write_u16(addr, val);
    }

    fn write_u32(&mut self, addr: u32, val: u32) {
        self.on_guest_write(addr, 4);
        self.mem.write_u32(addr, val);
    }

    fn io_read(&mut self, port: u16, width: Width) -> u32 {
        self.mem.io_read(port, width)
    }

    fn io_write(&mut self, port: u16, width: Width, val: u32) {
        self.mem.io_write(port, width, val)
    }

    fn poll_interrupt(&mut self) -> Option<u8> {
        self.mem.poll_interrupt()
    }
}
