//! Per-thread fake stack: off-main-stack storage for compiler-rewritten
//! stack frames, so frames can stay poisoned after return and
//! use-after-return becomes detectable.
//!
//! Frames come in eight fixed size classes (512 B .. 64 KiB). Each class
//! lazily maps one region sized to the thread's stack and carves it into a
//! FIFO of frames; FIFO recycling maximizes the time a returned frame stays
//! poisoned.

use crate::shadow::{self, PoisonKind};
use crate::{platform, thread};
use core::mem::size_of;
use core::ptr;

pub const MIN_FRAME_SIZE_LOG: usize = 9;
pub const MAX_FRAME_SIZE_LOG: usize = 16;
pub const NUM_FRAME_CLASSES: usize = MAX_FRAME_SIZE_LOG - MIN_FRAME_SIZE_LOG + 1;
pub const MAX_STACK_MALLOC_SIZE: usize = 1 << MAX_FRAME_SIZE_LOG;

/// First word of a live frame, written by the instrumentation at frame
/// entry; the second word points at the frame's static name string.
pub const FRAME_NAME_MAGIC: usize = 0x41b5_8ab3;

static UNKNOWN_FRAME_NAME: &[u8] = b"UNKNOWN\0";

#[repr(C)]
struct FrameNode {
    next: *mut FrameNode,
}

/// Intrusive FIFO of frames, linked through the frames' own first word.
struct FrameFifo {
    first: *mut FrameNode,
    last: *mut FrameNode,
}

impl FrameFifo {
    const fn new() -> Self {
        FrameFifo {
            first: ptr::null_mut(),
            last: ptr::null_mut(),
        }
    }

    unsafe fn push(&mut self, addr: usize) {
        let node = addr as *mut FrameNode;
        check!(!node.is_null());
        (*node).next = ptr::null_mut();
        if self.first.is_null() {
            check!(self.last.is_null());
            self.first = node;
            self.last = node;
        } else {
            check!(!self.last.is_null());
            (*self.last).next = node;
            self.last = node;
        }
    }

    unsafe fn pop(&mut self) -> usize {
        // Exhaustion means the thread has more live rewritten frames than
        // its whole stack could hold.
        check!(!self.first.is_null());
        let res = self.first;
        if self.first == self.last {
            self.first = ptr::null_mut();
            self.last = ptr::null_mut();
        } else {
            self.first = (*res).next;
        }
        res as usize
    }
}

pub struct FakeStack {
    alive: bool,
    stack_size: usize,
    regions: [usize; NUM_FRAME_CLASSES],
    fifos: [FrameFifo; NUM_FRAME_CLASSES],
}

impl FakeStack {
    pub const fn new() -> Self {
        const EMPTY_FIFO: FrameFifo = FrameFifo::new();
        FakeStack {
            alive: false,
            stack_size: 0,
            regions: [0; NUM_FRAME_CLASSES],
            fifos: [EMPTY_FIFO; NUM_FRAME_CLASSES],
        }
    }

    pub fn init(&mut self, stack_size: usize) {
        check!(stack_size > 0);
        self.stack_size = stack_size;
        self.alive = true;
    }

    #[inline]
    fn class_size(class: usize) -> usize {
        1 << (MIN_FRAME_SIZE_LOG + class)
    }

    /// Every class maps the same amount: enough to mirror the real stack.
    fn class_mmap_size(&self) -> usize {
        self.stack_size.next_power_of_two()
    }

    fn class_for(size: usize) -> usize {
        check!(size > 0);
        let log = size.next_power_of_two().trailing_zeros() as usize;
        let class = log.saturating_sub(MIN_FRAME_SIZE_LOG);
        check!(class < NUM_FRAME_CLASSES);
        check!(Self::class_size(class) >= size);
        class
    }

    unsafe fn map_class(&mut self, class: usize) {
        let mmap_size = self.class_mmap_size();
        check!(mmap_size >= platform::page_size());
        check!(mmap_size >= Self::class_size(class));
        let mem = platform::map_anonymous(mmap_size);
        check!(!mem.is_null());
        let mut i = 0;
        while i < mmap_size {
            self.fifos[class].push(mem as usize + i);
            i += Self::class_size(class);
        }
        self.regions[class] = mem as usize;
    }

    fn addr_is_in_class(&self, addr: usize, class: usize) -> bool {
        let mem = self.regions[class];
        mem != 0 && addr >= mem && addr < mem + self.class_mmap_size()
    }

    /// The base of the class region containing `addr`, or 0.
    pub fn addr_is_in_fake_stack(&self, addr: usize) -> usize {
        for class in 0..NUM_FRAME_CLASSES {
            if self.addr_is_in_class(addr, class) {
                return self.regions[class];
            }
        }
        0
    }

    /// Pop a frame for `size` bytes and make it addressable.
    ///
    /// # Safety
    /// The fake stack must be alive; `size` must be granularity-aligned.
    pub unsafe fn allocate(&mut self, size: usize) -> usize {
        check!(self.alive);
        check!(size <= MAX_STACK_MALLOC_SIZE);
        let class = Self::class_for(size);
        if self.regions[class] == 0 {
            self.map_class(class);
        }
        let addr = self.fifos[class].pop();
        check!(addr != 0);
        shadow::poison(addr, size, PoisonKind::Addressable);
        addr
    }

    /// Poison the returned frame and queue it for reuse.
    ///
    /// # Safety
    /// `addr` must be a frame previously returned by `allocate(size)`.
    pub unsafe fn deallocate(&mut self, addr: usize, size: usize) {
        check!(self.alive);
        let class = Self::class_for(size);
        check!(self.regions[class] != 0);
        check!(self.addr_is_in_class(addr, class));
        check!(self.addr_is_in_class(addr + size - 1, class));
        shadow::poison(addr, size, PoisonKind::StackAfterReturn);
        self.fifos[class].push(addr);
    }

    /// Scan backward from `addr` for the frame magic; returns the name
    /// pointer the instrumentation stored next to it, or "UNKNOWN".
    ///
    /// # Safety
    /// `addr` must lie within this fake stack.
    pub unsafe fn frame_name_by_addr(&self, addr: usize) -> *const libc::c_char {
        let base = self.addr_is_in_fake_stack(addr);
        check!(base != 0);
        let word = size_of::<usize>();
        let mut p = (addr & !(word - 1)) as *const usize;
        while p as usize >= base {
            if *p == FRAME_NAME_MAGIC {
                return *p.add(1) as *const libc::c_char;
            }
            p = p.sub(1);
        }
        UNKNOWN_FRAME_NAME.as_ptr() as *const libc::c_char
    }

    /// Unpoison and release every class mapping. Thread exit only.
    ///
    /// # Safety
    /// No frame from this fake stack may be used afterwards.
    pub unsafe fn cleanup(&mut self) {
        self.alive = false;
        for class in 0..NUM_FRAME_CLASSES {
            let mem = self.regions[class];
            if mem != 0 {
                shadow::poison(mem, self.class_mmap_size(), PoisonKind::Addressable);
                self.regions[class] = 0;
                self.fifos[class] = FrameFifo::new();
                platform::unmap(mem as *mut u8, self.class_mmap_size());
            }
        }
    }
}

/// Entry wrapper for instrumented frame entry. Falls back to the caller's
/// real stack when no thread record exists.
pub fn stack_malloc(size: usize, real_stack: usize) -> usize {
    crate::init::ensure_initialized();
    match thread::with(|t| t.with_fake_stack(|fs| unsafe { fs.allocate(size) })) {
        Some(Some(addr)) => addr,
        _ => real_stack,
    }
}

/// Entry wrapper for instrumented frame exit. A no-op when the frame was
/// the real stack, or when the thread record is already gone (the whole
/// fake stack has been torn down with it).
pub fn stack_free(ptr: usize, size: usize, real_stack: usize) {
    if ptr == real_stack {
        return;
    }
    let _ = thread::with(|t| t.with_fake_stack(|fs| unsafe { fs.deallocate(ptr, size) }));
}

/// Frame-name lookup for diagnostics on the current thread's fake stack.
pub fn frame_name_by_addr(addr: usize) -> *const libc::c_char {
    thread::with(|t| t.with_fake_stack(|fs| unsafe { fs.frame_name_by_addr(addr) }))
        .flatten()
        .unwrap_or(UNKNOWN_FRAME_NAME.as_ptr() as *const libc::c_char)
}
