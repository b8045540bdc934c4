//! Reservation of the managed virtual range.
//!
//! The whole object heap is reserved up front as one `PROT_NONE` mapping so
//! that the pool index of an address is fixed for the lifetime of the
//! runtime. Nothing is readable or writable until the heap commits pages
//! into the range.

use std::ptr::null_mut;

pub struct Mmap {
    start: *mut u8,
    size: usize,
}

impl Mmap {
    /// Reserve `size` bytes of address space without backing them.
    pub fn reserve(size: usize) -> Option<Self> {
        unsafe {
            let map = libc::mmap(
                null_mut(),
                size as _,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANON | libc::MAP_NORESERVE,
                -1,
                0,
            );
            if map == libc::MAP_FAILED {
                return None;
            }
            Some(Self {
                start: map as *mut u8,
                size,
            })
        }
    }

    pub fn start(&self) -> *mut u8 {
        self.start
    }

    pub fn end(&self) -> *mut u8 {
        (self.start as usize + self.size) as *mut u8
    }

    pub const fn size(&self) -> usize {
        self.size
    }

    /// Return the first address in the reservation aligned to `alignment`.
    pub fn aligned(&self, alignment: usize) -> *mut u8 {
        let offset = alignment - (self.start as usize) % alignment;
        (self.start as usize + offset) as *mut u8
    }

    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.start as usize && addr < self.end() as usize
    }

    /// Make `[addr, addr + len)` readable and writable. The range must lie
    /// inside the reservation and be page aligned.
    pub fn commit(&self, addr: *mut u8, len: usize) -> bool {
        debug_assert!(self.contains(addr as usize));
        unsafe { libc::mprotect(addr as *mut _, len as _, libc::PROT_READ | libc::PROT_WRITE) == 0 }
    }

    /// Give the pages back to the kernel and seal the range again.
    pub fn decommit(&self, addr: *mut u8, len: usize) {
        unsafe {
            libc::madvise(addr as *mut _, len as _, libc::MADV_DONTNEED);
            libc::mprotect(addr as *mut _, len as _, libc::PROT_NONE);
        }
    }
}

impl Drop for Mmap {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.start as *mut _, self.size as _);
        }
    }
}

// The reservation is plain address space; the heap serialises all access to
// the committed parts of it.
unsafe impl Send for Mmap {}
unsafe impl Sync for Mmap {}
