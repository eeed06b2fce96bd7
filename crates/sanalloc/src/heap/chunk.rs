//! Chunk layout: the in-band header that fronts every allocation, the state
//! machine it carries, and the intrusive FIFO list chunks travel through.
//!
//! A chunk's footprint is its size class's backing size. The header and the
//! compressed allocation stack live in the left redzone; once freed, the
//! compressed free stack overwrites the first redzone-width bytes of the
//! user body.

use crate::config;
use crate::heap::size_class;
use crate::report;
use core::mem::size_of;

// State magics are arbitrary nonzero 16-bit values so that randomly
// written memory is unlikely to look like a valid header.
pub const CHUNK_AVAILABLE: u16 = 0x2a5c;
pub const CHUNK_ALLOCATED: u16 = 0x8e41;
pub const CHUNK_QUARANTINED: u16 = 0x51f3;
/// Pseudo state: this address is not a chunk header, `next` points at the
/// real chunk. Installed at `user_ptr - redzone` for over-aligned requests.
pub const CHUNK_MEMALIGN: u16 = 0xc7d9;

#[repr(C)]
pub struct Chunk {
    pub state: u16,
    pub size_class: u8,
    _pad: u8,
    /// User-visible memory starts at `self + offset`.
    pub offset: u32,
    pub alloc_tid: u32,
    pub free_tid: u32,
    /// Size requested by the user.
    pub used_size: usize,
    /// Free-list / quarantine link; the real chunk for a memalign header.
    pub next: *mut Chunk,
}

// The header must fit in the smallest accepted redzone.
const _: () = assert!(size_of::<Chunk>() <= 32);

impl Chunk {
    #[inline]
    pub fn beg(&self) -> usize {
        self as *const Chunk as usize + self.offset as usize
    }

    /// Backing size of this chunk (total footprint).
    #[inline]
    pub fn size(&self) -> usize {
        size_class::class_size(self.size_class)
    }

    /// The compressed allocation stack fills the left redzone after the
    /// header. Empty when the redzone is exactly the header.
    pub fn alloc_stack_slot(&self) -> (*mut u32, usize) {
        let redzone = config::redzone();
        check!(redzone >= size_of::<Chunk>());
        let base = self as *const Chunk as usize + size_of::<Chunk>();
        (base as *mut u32, (redzone - size_of::<Chunk>()) / 4)
    }

    /// The compressed free stack starts at offset `redzone`, aliasing the
    /// first bytes of the user body of a non-over-aligned chunk.
    pub fn free_stack_slot(&self) -> (*mut u32, usize) {
        let redzone = config::redzone();
        let base = self as *const Chunk as usize + redzone;
        (base as *mut u32, redzone / 4)
    }

    pub fn addr_is_inside(&self, addr: usize, access_size: usize, offset: &mut usize) -> bool {
        if addr >= self.beg() && addr + access_size <= self.beg() + self.used_size {
            *offset = addr - self.beg();
            return true;
        }
        false
    }

    pub fn addr_is_at_left(&self, addr: usize, _access_size: usize, offset: &mut usize) -> bool {
        let this = self as *const Chunk as usize;
        if addr >= this && addr < self.beg() {
            *offset = self.beg() - addr;
            return true;
        }
        false
    }

    pub fn addr_is_at_right(&self, addr: usize, access_size: usize, offset: &mut usize) -> bool {
        let this = self as *const Chunk as usize;
        if addr + access_size >= self.beg() + self.used_size
            && addr < this + self.size() + config::redzone()
        {
            *offset = if addr <= self.beg() + self.used_size {
                0
            } else {
                addr - (self.beg() + self.used_size)
            };
            return true;
        }
        false
    }

    /// Print the "<addr> is located ..." report line for this chunk.
    pub fn describe_address(&self, addr: usize, access_size: usize) {
        let mut offset = 0;
        let position = if self.addr_is_inside(addr, access_size, &mut offset) {
            "inside of"
        } else if self.addr_is_at_left(addr, access_size, &mut offset) {
            "to the left of"
        } else if self.addr_is_at_right(addr, access_size, &mut offset) {
            "to the right of"
        } else {
            report!(
                "=={}== {:#x} is located somewhere around a {}-byte region [{:#x},{:#x})\n",
                report::pid(),
                addr,
                self.used_size,
                self.beg(),
                self.beg() + self.used_size
            );
            return;
        };
        report!(
            "=={}== {:#x} is located {} bytes {} {}-byte region [{:#x},{:#x})\n",
            report::pid(),
            addr,
            offset,
            position,
            self.used_size,
            self.beg(),
            self.beg() + self.used_size
        );
    }
}

/// Resolve a user pointer to its chunk header, following a memalign
/// forwarder when one is installed.
///
/// # Safety
/// `ptr - redzone` must be readable (i.e. `ptr` must lie inside a region
/// this allocator owns, or on otherwise-mapped memory for the probing
/// paths that check the resulting state).
pub unsafe fn chunk_from_user_ptr(ptr: usize) -> *mut Chunk {
    let mut m = (ptr - config::redzone()) as *mut Chunk;
    if (*m).state == CHUNK_MEMALIGN {
        m = (*m).next;
    }
    m
}

/// Intrusive FIFO of chunks with a running byte-size accumulator (backing
/// sizes, not requested sizes). Used for the quarantine on both the
/// per-thread and global sides.
pub struct ChunkFifoList {
    first: *mut Chunk,
    last: *mut Chunk,
    size: usize,
}

impl ChunkFifoList {
    pub const fn new() -> Self {
        ChunkFifoList {
            first: core::ptr::null_mut(),
            last: core::ptr::null_mut(),
            size: 0,
        }
    }

    /// Retained bytes (sum of backing sizes).
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// # Safety
    /// `n` must be a chunk that is on no other list.
    pub unsafe fn push(&mut self, n: *mut Chunk) {
        check!((*n).next.is_null());
        if !self.last.is_null() {
            check!(!self.first.is_null());
            check!((*self.last).next.is_null());
            (*self.last).next = n;
            self.last = n;
        } else {
            check!(self.first.is_null());
            self.first = n;
            self.last = n;
        }
        self.size += (*n).size();
    }

    /// Splice all of `q` onto the tail, leaving `q` empty. O(1).
    ///
    /// # Safety
    /// Both lists must be well formed.
    pub unsafe fn push_list(&mut self, q: &mut ChunkFifoList) {
        if q.first.is_null() {
            return;
        }
        if !self.last.is_null() {
            check!(!self.first.is_null());
            check!((*self.last).next.is_null());
            (*self.last).next = q.first;
            self.last = q.last;
        } else {
            check!(self.first.is_null());
            self.first = q.first;
            self.last = q.last;
        }
        self.size += q.size;
        q.first = core::ptr::null_mut();
        q.last = core::ptr::null_mut();
        q.size = 0;
    }

    /// # Safety
    /// The list must be non-empty.
    pub unsafe fn pop(&mut self) -> *mut Chunk {
        check!(!self.first.is_null());
        let res = self.first;
        self.first = (*res).next;
        if self.first.is_null() {
            self.last = core::ptr::null_mut();
        }
        check!(self.size >= (*res).size());
        self.size -= (*res).size();
        res
    }
}
