use std::io;
use std::ptr;

use thiserror::Error;

/// How the arena's pages are protected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Protection {
    /// Pages are either writable or executable, never both. Every
    /// write goes through a `WriteGuard`.
    #[default]
    WriteXorExecute,
    /// Pages are mapped read/write/execute once; guards are no-ops.
    ReadWriteExecute,
}

#[derive(Debug, Error)]
pub enum ArenaError {
    #[error("failed to map {size} bytes of executable memory")]
    Map {
        size: usize,
        #[source]
        source: io::Error,
    },
    #[error("failed to change protection of {len} bytes at offset {offset:#x}")]
    Protect {
        offset: usize,
        len: usize,
        #[source]
        source: io::Error,
    },
    #[error("range {offset:#x}+{len:#x} is outside the {size:#x}-byte arena")]
    OutOfBounds { offset: usize, len: usize, size: usize },
    #[error("arena protection is in an unknown state after an earlier failure")]
    Poisoned,
}

/// Executable memory backed by an anonymous mapping.
///
/// Under `WriteXorExecute` the whole mapping is read/execute at
/// rest; `unlock` flips just the pages covering a range to
/// read/write for the lifetime of the returned guard.
pub struct ExecArena {
    ptr: *mut u8,
    size: usize,
    page_size: usize,
    protection: Protection,
    poisoned: bool,
}

// SAFETY: ExecArena owns its mapping exclusively.
unsafe impl Send for ExecArena {}

impl ExecArena {
    /// Map a new arena of `size` bytes (rounded up to page size).
    pub fn new(size: usize, protection: Protection) -> Result<Self, ArenaError> {
        let page_size = page_size();
        let size = (size.max(1) + page_size - 1) & !(page_size - 1);
        let prot = match protection {
            Protection::WriteXorExecute => libc::PROT_READ | libc::PROT_EXEC,
            Protection::ReadWriteExecute => libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
        };

        // SAFETY: anonymous private mapping with no file backing.
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                prot,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(ArenaError::Map {
                size,
                source: io::Error::last_os_error(),
            });
        }

        Ok(Self {
            ptr: ptr as *mut u8,
            size,
            page_size,
            protection,
            poisoned: false,
        })
    }

    /// Total capacity in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn protection(&self) -> Protection {
        self.protection
    }

    #[inline]
    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Raw pointer to the start of the arena.
    #[inline]
    pub fn base_ptr(&self) -> *const u8 {
        self.ptr as *const u8
    }

    /// Pointer at a given offset.
    #[inline]
    pub fn ptr_at(&self, offset: usize) -> *const u8 {
        assert!(offset <= self.size);
        // SAFETY: offset is within the mapping.
        unsafe { self.ptr.add(offset) as *const u8 }
    }

    /// Read a u32 at the given offset.
    pub fn read_u32(&self, offset: usize) -> u32 {
        assert!(offset + 4 <= self.size);
        // SAFETY: in bounds; the mapping is always readable.
        unsafe { (self.ptr.add(offset) as *const u32).read_unaligned() }
    }

    pub fn as_slice(&self, offset: usize, len: usize) -> &[u8] {
        assert!(offset + len <= self.size);
        // SAFETY: in bounds; the mapping is always readable.
        unsafe { std::slice::from_raw_parts(self.ptr.add(offset), len) }
    }

    /// Make the pages covering `offset..offset + len` writable.
    pub fn unlock(&mut self, offset: usize, len: usize) -> Result<WriteGuard<'_>, ArenaError> {
        if self.poisoned {
            return Err(ArenaError::Poisoned);
        }
        if offset.checked_add(len).map_or(true, |end| end > self.size) {
            return Err(ArenaError::OutOfBounds {
                offset,
                len,
                size: self.size,
            });
        }
        let page_start = offset & !(self.page_size - 1);
        let page_end = (offset + len + self.page_size - 1) & !(self.page_size - 1);
        let mut guard = WriteGuard {
            arena: self,
            offset,
            len,
            page_start,
            page_len: page_end - page_start,
            locked: true,
        };
        if guard.arena.protection == Protection::WriteXorExecute {
            guard.set_prot(libc::PROT_READ | libc::PROT_WRITE)?;
        }
        guard.locked = false;
        Ok(guard)
    }

    /// Copy `data` to `offset` under a scoped write guard.
    pub fn write(&mut self, offset: usize, data: &[u8]) -> Result<(), ArenaError> {
        let mut guard = self.unlock(offset, data.len())?;
        guard.write(offset, data);
        guard.close()
    }

    /// Overwrite a u32 at `offset` under a scoped write guard.
    pub fn patch_u32(&mut self, offset: usize, val: u32) -> Result<(), ArenaError> {
        self.write(offset, &val.to_le_bytes())
    }
}

impl Drop for ExecArena {
    fn drop(&mut self) {
        if !self.ptr.is_null() {
            // SAFETY: ptr/size come from the successful mmap in `new`.
            unsafe {
                libc::munmap(self.ptr as *mut libc::c_void, self.size);
            }
        }
    }
}

/// Write access to a range of the arena. Execute permission is
/// restored when the guard is closed or dropped.
pub struct WriteGuard<'a> {
    arena: &'a mut ExecArena,
    offset: usize,
    len: usize,
    page_start: usize,
    page_len: usize,
    locked: bool,
}

impl WriteGuard<'_> {
    /// Copy `data` to `offset`, which must lie inside the unlocked range.
    pub fn write(&mut self, offset: usize, data: &[u8]) {
        assert!(offset >= self.offset && offset + data.len() <= self.offset + self.len);
        // SAFETY: bounds checked above; the pages are writable.
        unsafe {
            ptr::copy_nonoverlapping(data.as_ptr(), self.arena.ptr.add(offset), data.len());
        }
    }

    /// Restore execute permission, reporting failure.
    pub fn close(mut self) -> Result<(), ArenaError> {
        self.relock()
    }

    fn relock(&mut self) -> Result<(), ArenaError> {
        if self.locked {
            return Ok(());
        }
        self.locked = true;
        flush_icache(self.arena.ptr_at(self.offset), self.len);
        if self.arena.protection == Protection::WriteXorExecute {
            self.set_prot(libc::PROT_READ | libc::PROT_EXEC)?;
        }
        Ok(())
    }

    fn set_prot(&mut self, prot: libc::c_int) -> Result<(), ArenaError> {
        // SAFETY: the range is page aligned and inside the mapping.
        let ret = unsafe {
            libc::mprotect(
                self.arena.ptr.add(self.page_start) as *mut libc::c_void,
                self.page_len,
                prot,
            )
        };
        if ret != 0 {
            self.arena.poisoned = true;
            return Err(ArenaError::Protect {
                offset: self.page_start,
                len: self.page_len,
                source: io::Error::last_os_error(),
            });
        }
        Ok(())
    }
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.relock() {
            tracing::error!(%err, "failed to restore execute permission");
        }
    }
}

/// Make freshly written code visible to instruction fetch.
///
/// x86 hosts snoop stores into the instruction stream, so there is
/// nothing to do beyond the serializing effect of `mprotect`.
#[inline]
fn flush_icache(_ptr: *const u8, _len: usize) {}

fn page_size() -> usize {
    // SAFETY: sysconf is always safe to call.
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}
