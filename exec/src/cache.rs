//! Code cache: translated blocks in an executable arena.
//!
//! Blocks are bump-allocated after the shared trampoline and are
//! never freed individually. Invalidation only drops a block from
//! the indices and unlinks jumps into it, so the host code of a
//! block that is still running stays intact; the arena is rewound
//! by [`CodeCache::reset`] alone, which the dispatcher only calls
//! between blocks.

use std::collections::HashMap;

use dynx86_backend::{jump_disp, ArenaError, ExecArena, HostEmitter, LinkSite};
use dynx86_core::block::{BlockId, EXIT_KIND_BITS, MAX_BLOCK_ID, MAX_LINKS};
use dynx86_core::CpuMode;
use dynx86_frontend::TranslatedBlock;
use tracing::{debug, trace, warn};

use crate::config::DynrecConfig;
use crate::error::DynrecError;
use crate::tracker::{page_span, HotPages, PageTracker};

/// Metadata of a committed block.
#[derive(Debug, Clone)]
pub struct CachedBlock {
    /// Linear address range `[start, end)` of the guest bytes.
    pub start: u32,
    pub end: u32,
    pub cs_base: u32,
    pub mode: CpuMode,
    pub pages: Vec<u32>,
    pub insn_count: u32,
    /// Arena offset and length of the host code.
    pub offset: usize,
    pub len: usize,
    link_sites: [Option<LinkSite>; MAX_LINKS],
    /// Target of each patched exit.
    links_out: [Option<BlockId>; MAX_LINKS],
    /// Exits of other blocks patched to jump here.
    links_in: Vec<(BlockId, usize)>,
}

impl CachedBlock {
    /// Whether the guest bytes of the block overlap `[addr, addr + len)`.
    fn overlaps(&self, addr: u32, len: u32) -> bool {
        let start = self.start as u64;
        let end = start + self.end.wrapping_sub(self.start) as u64;
        let (a, b) = (addr as u64, addr as u64 + len as u64);
        a < end && start < b
    }

    pub fn linked_to(&self, slot: usize) -> Option<BlockId> {
        self.links_out.get(slot).copied().flatten()
    }
}

/// Counters since the cache was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Live blocks.
    pub blocks: usize,
    /// Arena bytes in use, trampoline included.
    pub bytes_used: usize,
    pub capacity: usize,
    pub commits: u64,
    pub resets: u64,
    pub invalidated: u64,
    pub links: u64,
}

pub struct CodeCache {
    arena: ExecArena,
    entry: usize,
    epilogue: usize,
    /// First byte available to blocks.
    code_start: usize,
    capacity: usize,
    top: usize,
    align: usize,
    blocks: Vec<Option<CachedBlock>>,
    by_start: HashMap<u32, BlockId>,
    by_page: HashMap<u32, Vec<BlockId>>,
    code_pages: PageTracker,
    hot: HotPages,
    stats: CacheStats,
    /// Set once an arena write failed; the arena's protection state
    /// is unknown afterwards.
    failed: bool,
}

impl CodeCache {
    /// Map the arena and install the trampoline at its start.
    pub fn new<E: HostEmitter>(config: &DynrecConfig, emitter: &mut E) -> Result<Self, DynrecError> {
        config.validate()?;
        let mut arena = ExecArena::new(config.cache_size, config.protection)?;
        let trampoline = emitter.emit_trampoline();
        arena.write(0, &trampoline.code)?;

        let align = config.block_align;
        let code_start = align_up(trampoline.code.len(), align);
        let capacity = config.cache_size.min(arena.size());
        debug!(
            capacity,
            protection = ?config.protection,
            "code cache created"
        );
        Ok(Self {
            arena,
            entry: trampoline.entry,
            epilogue: trampoline.epilogue,
            code_start,
            capacity,
            top: code_start,
            align,
            blocks: Vec::new(),
            by_start: HashMap::new(),
            by_page: HashMap::new(),
            code_pages: PageTracker::new(),
            hot: HotPages::new(config.smc_threshold),
            stats: CacheStats {
                capacity,
                ..Default::default()
            },
            failed: false,
        })
    }

    // -- Queries ---------------------------------------------

    /// Block starting exactly at linear address `start`.
    #[inline]
    pub fn lookup(&self, start: u32) -> Option<BlockId> {
        self.by_start.get(&start).copied()
    }

    #[inline]
    pub fn block(&self, id: BlockId) -> Option<&CachedBlock> {
        self.blocks.get(id.index()).and_then(|b| b.as_ref())
    }

    pub fn block_count(&self) -> usize {
        self.by_start.len()
    }

    /// Blocks depending on `page`.
    pub fn blocks_on_page(&self, page: u32) -> &[BlockId] {
        self.by_page.get(&page).map_or(&[], |v| v.as_slice())
    }

    #[inline]
    pub fn is_code_page(&self, page: u32) -> bool {
        self.code_pages.is_set(page)
    }

    /// Whether `page` is modified too often to be translated.
    #[inline]
    pub fn is_hot(&self, page: u32) -> bool {
        self.hot.is_hot(page)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes a block committed now could use without a reset.
    pub fn free(&self) -> usize {
        self.capacity.saturating_sub(align_up(self.top, self.align))
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            blocks: self.block_count(),
            bytes_used: self.top,
            ..self.stats
        }
    }

    /// Whether an arena write failed. Nothing may run from the
    /// cache afterwards.
    #[inline]
    pub fn is_failed(&self) -> bool {
        self.failed || self.arena.is_poisoned()
    }

    #[cfg(test)]
    pub(crate) fn fail_for_test(&mut self) {
        self.failed = true;
    }

    /// Trampoline entry:
    /// `extern "C" fn(env: *mut u8, code: *const u8) -> u32`.
    pub fn entry_ptr(&self) -> *const u8 {
        self.arena.ptr_at(self.entry)
    }

    /// Host code of a live block.
    pub fn code_ptr(&self, id: BlockId) -> Option<*const u8> {
        self.block(id).map(|b| self.arena.ptr_at(b.offset))
    }

    // -- Allocation ------------------------------------------

    /// Copy a translated block into the arena and index it.
    ///
    /// When the block does not fit behind the current top, the cache
    /// is reset first and the block is placed in the empty arena.
    pub fn commit(&mut self, block: TranslatedBlock) -> Result<BlockId, DynrecError> {
        if self.is_failed() {
            return Err(ArenaError::Poisoned.into());
        }
        let len = block.code.bytes.len();
        if self.code_start + len > self.capacity {
            return Err(DynrecError::BlockTooLarge {
                len,
                capacity: self.capacity - self.code_start,
            });
        }
        let mut offset = align_up(self.top, self.align);
        if offset + len > self.capacity || self.blocks.len() as u32 > MAX_BLOCK_ID {
            self.reset("cache full");
            offset = self.code_start;
        }
        let id = BlockId(self.blocks.len() as u32);

        let code = block.code;
        let mut bytes = code.bytes;
        for &site in &code.exit_sites {
            let kind = read_u32(&bytes, site);
            write_u32(&mut bytes, site, kind | id.0 << EXIT_KIND_BITS);
        }
        for &rel in &code.epilogue_relocs {
            write_u32(&mut bytes, rel, jump_disp(offset + rel - 1, self.epilogue));
        }
        if let Err(err) = self.arena.write(offset, &bytes) {
            self.failed = true;
            return Err(err.into());
        }
        self.top = offset + len;

        // A block left behind under another CS base.
        if let Some(stale) = self.lookup(block.start) {
            self.invalidate_block(stale);
        }
        self.by_start.insert(block.start, id);
        for &page in &block.pages {
            self.by_page.entry(page).or_default().push(id);
            self.code_pages.set(page);
        }
        trace!(
            id = id.0,
            start = format_args!("{:#x}", block.start),
            offset,
            len,
            "block committed"
        );
        self.blocks.push(Some(CachedBlock {
            start: block.start,
            end: block.end,
            cs_base: block.cs_base,
            mode: block.mode,
            pages: block.pages,
            insn_count: block.insn_count,
            offset,
            len,
            link_sites: code.link_sites,
            links_out: [None; MAX_LINKS],
            links_in: Vec::new(),
        }));
        self.stats.commits += 1;
        Ok(id)
    }

    /// Destroy every block and rewind the arena.
    pub fn reset(&mut self, reason: &str) {
        debug!(reason, blocks = self.block_count(), bytes = self.top, "code cache reset");
        self.blocks.clear();
        self.by_start.clear();
        self.by_page.clear();
        self.code_pages.clear_all();
        self.hot.clear();
        self.top = self.code_start;
        self.stats.resets += 1;
    }

    // -- Invalidation ----------------------------------------

    /// Destroy one block and unlink every jump into it. Returns
    /// false if the block was already gone.
    pub fn invalidate_block(&mut self, id: BlockId) -> bool {
        let Some(block) = self.blocks.get_mut(id.index()).and_then(Option::take) else {
            return false;
        };
        if self.by_start.get(&block.start) == Some(&id) {
            self.by_start.remove(&block.start);
        }
        for &page in &block.pages {
            if let Some(ids) = self.by_page.get_mut(&page) {
                ids.retain(|&b| b != id);
                if ids.is_empty() {
                    self.by_page.remove(&page);
                    self.code_pages.clear(page);
                }
            }
        }
        for &(src, slot) in &block.links_in {
            self.unlink(src, slot);
        }
        for (slot, dst) in block.links_out.iter().enumerate() {
            if let Some(dst) = dst.and_then(|d| self.blocks.get_mut(d.index())?.as_mut()) {
                dst.links_in.retain(|&l| l != (id, slot));
            }
        }
        self.stats.invalidated += 1;
        true
    }

    /// Destroy every block derived from `page`. Returns how many
    /// blocks were destroyed.
    pub fn invalidate_page(&mut self, page: u32) -> usize {
        let ids = self.by_page.get(&page).cloned().unwrap_or_default();
        let count = ids.into_iter().filter(|&id| self.invalidate_block(id)).count();
        if count > 0 {
            debug!(page = format_args!("{:#x}", page), count, "page invalidated");
        }
        count
    }

    /// Check a guest write of `len` bytes at `addr` against the
    /// code pages, destroying the blocks it overlaps. Returns true
    /// if any block was destroyed.
    pub fn on_guest_write(&mut self, addr: u32, len: u32) -> bool {
        let (first, last) = page_span(addr, len);
        if !self.code_pages.is_set(first) && !self.code_pages.is_set(last) {
            return false;
        }
        let mut hit = false;
        for page in std::iter::once(first).chain((last != first).then_some(last)) {
            let ids: Vec<BlockId> = self
                .blocks_on_page(page)
                .iter()
                .copied()
                .filter(|&id| self.block(id).is_some_and(|b| b.overlaps(addr, len)))
                .collect();
            if ids.is_empty() {
                continue;
            }
            for id in ids {
                self.invalidate_block(id);
            }
            hit = true;
            debug!(
                page = format_args!("{:#x}", page),
                addr = format_args!("{:#x}", addr),
                "guest write hit translated code"
            );
            if self.hot.note(page) {
                warn!(page = format_args!("{:#x}", page), "page modified too often, interpreting");
            }
        }
        hit
    }

    // -- Linking ---------------------------------------------

    /// Patch exit `slot` of `src` to jump straight into `dst`.
    ///
    /// Returns false when the pair cannot be chained: either block
    /// is gone, the exit is not patchable, or the blocks were
    /// translated under different CS bases.
    pub fn link(&mut self, src: BlockId, slot: usize, dst: BlockId) -> Result<bool, ArenaError> {
        let (Some(s), Some(d)) = (self.block(src), self.block(dst)) else {
            return Ok(false);
        };
        let Some(site) = s.link_sites.get(slot).copied().flatten() else {
            return Ok(false);
        };
        let prev = s.links_out[slot];
        if s.cs_base != d.cs_base || prev == Some(dst) {
            return Ok(false);
        }
        let (src_off, dst_off) = (s.offset, d.offset);
        if let Some(old) = prev {
            if let Some(o) = self.blocks.get_mut(old.index()).and_then(Option::as_mut) {
                o.links_in.retain(|&l| l != (src, slot));
            }
        }

        let jmp = src_off + site.jmp_offset;
        if let Err(err) = self.arena.patch_u32(jmp + 1, jump_disp(jmp, dst_off)) {
            self.failed = true;
            return Err(err);
        }
        if let Some(s) = self.blocks[src.index()].as_mut() {
            s.links_out[slot] = Some(dst);
        }
        if let Some(d) = self.blocks[dst.index()].as_mut() {
            d.links_in.push((src, slot));
        }
        self.stats.links += 1;
        debug!(src = src.0, slot, dst = dst.0, "blocks linked");
        Ok(true)
    }

    /// Point exit `slot` of `src` back at its dispatcher return.
    fn unlink(&mut self, src: BlockId, slot: usize) {
        let Some(s) = self.blocks.get_mut(src.index()).and_then(Option::as_mut) else {
            return;
        };
        let Some(site) = s.link_sites[slot] else {
            return;
        };
        s.links_out[slot] = None;
        let jmp = s.offset + site.jmp_offset;
        let reset = s.offset + site.reset_offset;
        if self.arena.patch_u32(jmp + 1, jump_disp(jmp, reset)).is_err() {
            self.failed = true;
        }
    }
}

#[inline]
fn align_up(offset: usize, align: usize) -> usize {
    (offset + align - 1) & !(align - 1)
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&bytes[at..at + 4]);
    u32::from_le_bytes(b)
}

fn write_u32(bytes: &mut [u8], at: usize, val: u32) {
    bytes[at..at + 4].copy_from_slice(&val.to_le_bytes());
}
