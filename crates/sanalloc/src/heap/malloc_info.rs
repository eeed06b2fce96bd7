//! The global allocator: authoritative free lists, the global quarantine,
//! and free-list refill by mapping fresh page groups.
//!
//! One futex mutex serializes everything here. Critical sections are short
//! except refill, which holds the lock across the mapping because it
//! installs new free-list entries.

use crate::heap::chunk::{
    chunk_from_user_ptr, Chunk, ChunkFifoList, CHUNK_ALLOCATED, CHUNK_AVAILABLE, CHUNK_QUARANTINED,
};
use crate::heap::page_group::{self, PageGroup};
use crate::heap::size_class::{class_size, NUM_SIZE_CLASSES};
use crate::shadow::{self, PoisonKind};
use crate::sync::Mutex;
use crate::thread::{self, ThreadMallocStorage, Tid};
use crate::util::MIN_MMAP_PAGES;
use crate::{config, platform, report, stats};
use core::ptr;

struct MallocInfo {
    free_lists: [*mut Chunk; NUM_SIZE_CLASSES],
    quarantine: ChunkFifoList,
}

unsafe impl Send for MallocInfo {}

impl MallocInfo {
    const fn new() -> Self {
        MallocInfo {
            free_lists: [ptr::null_mut(); NUM_SIZE_CLASSES],
            quarantine: ChunkFifoList::new(),
        }
    }
}

static MALLOC_INFO: Mutex<MallocInfo> = Mutex::new(MallocInfo::new());

/// Pop `n` chunks of `class` off the global free list, refilling from the
/// OS when it runs dry. Returns them linked through `next`.
///
/// # Safety
/// The allocator must be initialized.
pub unsafe fn allocate_chunks(class: u8, n: usize) -> *mut Chunk {
    let mut info = MALLOC_INFO.lock();
    let mut m: *mut Chunk = ptr::null_mut();
    for _ in 0..n {
        if info.free_lists[class as usize].is_null() {
            info.free_lists[class as usize] = refill(class);
        }
        let t = info.free_lists[class as usize];
        info.free_lists[class as usize] = (*t).next;
        check!((*t).state == CHUNK_AVAILABLE);
        (*t).next = m;
        m = t;
    }
    m
}

/// Map a fresh page group for `class` and carve it into Available chunks.
/// Called with the allocator lock held. Returns the head of the new list.
unsafe fn refill(class: u8) -> *mut Chunk {
    let unit = class_size(class);
    let page = platform::page_size();
    let min_mmap = MIN_MMAP_PAGES * page;
    check!(min_mmap.is_power_of_two());
    check!(unit < min_mmap || unit % min_mmap == 0);

    let mut map_size = unit.max(min_mmap);
    let mut n_chunks = map_size / unit;
    check!(n_chunks * unit == map_size);
    if unit < page {
        // Reserve the trailing chunk: its body separates the last real
        // chunk from the page-group header and stays poisoned.
        n_chunks -= 1;
    } else {
        // Large chunks: one extra page holds the header and the trailing
        // poison.
        map_size += page;
    }
    check!(n_chunks > 0);

    let mem = platform::map_anonymous(map_size);
    if mem.is_null() {
        report!(
            "=={}== ERROR: sanalloc failed to allocate {:#x} ({}) bytes (page group) in {}\n",
            report::pid(),
            map_size,
            map_size,
            Tid(thread::current_tid())
        );
        report::die();
    }
    stats::record_mmap(map_size);
    if config::debug() {
        report!(
            "=={}== mapped [{:#x},{:#x}) for size class {}\n",
            report::pid(),
            mem as usize,
            mem as usize + map_size,
            class
        );
    }
    shadow::poison(mem as usize, map_size, PoisonKind::HeapLeftRedzone);

    let mut res: *mut Chunk = ptr::null_mut();
    for i in 0..n_chunks {
        let m = mem.add(i * unit) as *mut Chunk;
        (*m).state = CHUNK_AVAILABLE;
        (*m).size_class = class;
        (*m).next = res;
        res = m;
    }

    // The group header lives in the already-poisoned tail of its own
    // mapping.
    let pg = mem.add(n_chunks * unit) as *mut PageGroup;
    (*pg).beg = mem as usize;
    (*pg).end = mem as usize + map_size;
    (*pg).size_of_chunk = unit;
    page_group::register(pg);

    res
}

/// Splice a thread's local quarantine into the global one and trim the
/// global quarantine back under its byte budget. With `eat_free_lists`,
/// also drain every per-thread free-list cache into the global lists
/// (thread exit).
///
/// # Safety
/// `ms` must be the calling thread's own storage (or an exiting thread's).
pub unsafe fn swallow_thread_storage(ms: &mut ThreadMallocStorage, eat_free_lists: bool) {
    check!(config::quarantine_size() > 0);
    let mut info = MALLOC_INFO.lock();
    if ms.quarantine.size() > 0 {
        info.quarantine.push_list(&mut ms.quarantine);
        while info.quarantine.size() > config::quarantine_size() {
            recycle_oldest(&mut info);
        }
    }
    if eat_free_lists {
        for class in 0..NUM_SIZE_CLASSES {
            let mut m = ms.free_lists[class];
            while !m.is_null() {
                let t = (*m).next;
                (*m).next = info.free_lists[class];
                info.free_lists[class] = m;
                m = t;
            }
            ms.free_lists[class] = ptr::null_mut();
        }
    }
}

/// Quarantine a chunk for a thread that no longer has thread-local storage.
///
/// # Safety
/// `chunk` must be a chunk in state Quarantined that is on no list.
pub unsafe fn bypass_thread_quarantine(chunk: *mut Chunk) {
    let mut info = MALLOC_INFO.lock();
    info.quarantine.push(chunk);
}

/// Oldest quarantined chunk goes back to the free list of its class.
unsafe fn recycle_oldest(info: &mut MallocInfo) {
    check!(info.quarantine.size() > 0);
    let m = info.quarantine.pop();
    check!(!m.is_null());
    check!((*m).state == CHUNK_QUARANTINED);
    (*m).state = CHUNK_AVAILABLE;
    stats::record_really_freed((*m).used_size);
    let class = (*m).size_class as usize;
    (*m).next = info.free_lists[class];
    info.free_lists[class] = m;
}

/// `used_size` of a live allocation we own, else 0.
///
/// # Safety
/// `ptr` may be any address.
pub unsafe fn allocation_size(ptr: usize) -> usize {
    let _info = MALLOC_INFO.lock();
    // Only our own memory has a chunk header worth reading.
    if page_group::find(ptr).is_null() {
        return 0;
    }
    let m = chunk_from_user_ptr(ptr);
    if (*m).state == CHUNK_ALLOCATED {
        (*m).used_size
    } else {
        0
    }
}

/// Reverse lookup for the diagnostic path: the chunk owning `addr`, or null
/// when the address is not in any page group. Tolerates interior and
/// redzone addresses.
///
/// # Safety
/// `addr` may be any address.
pub unsafe fn find_allocated_or_freed(addr: usize) -> *mut Chunk {
    let _info = MALLOC_INFO.lock();
    find_chunk_by_addr(addr)
}

unsafe fn find_chunk_by_addr(addr: usize) -> *mut Chunk {
    let g = page_group::find(addr);
    if g.is_null() {
        return ptr::null_mut();
    }
    check!((*g).size_of_chunk > 0);
    let offset_from_beg = addr - (*g).beg;
    let this_chunk_addr = (*g).beg + (offset_from_beg / (*g).size_of_chunk) * (*g).size_of_chunk;
    check!((*g).in_range(this_chunk_addr));
    let m = this_chunk_addr as *mut Chunk;
    check!(
        (*m).state == CHUNK_ALLOCATED
            || (*m).state == CHUNK_AVAILABLE
            || (*m).state == CHUNK_QUARANTINED
    );
    let mut offset = 0;
    if (*m).addr_is_inside(addr, 1, &mut offset) || (*m).addr_is_at_right(addr, 1, &mut offset) {
        return m;
    }
    let is_at_left = (*m).addr_is_at_left(addr, 1, &mut offset);
    check!(is_at_left);
    if this_chunk_addr == (*g).beg {
        // leftmost chunk
        return m;
    }
    // The address is in this chunk's left redzone, which may equally be the
    // left neighbour's trailing redzone; report the closer of the two.
    let left_chunk_addr = this_chunk_addr - (*g).size_of_chunk;
    check!((*g).in_range(left_chunk_addr));
    let l = left_chunk_addr as *mut Chunk;
    let mut l_offset = 0;
    let is_at_right = (*l).addr_is_at_right(addr, 1, &mut l_offset);
    check!(is_at_right);
    if l_offset < offset {
        return l;
    }
    m
}

/// One-line summary of quarantine and free-list occupancy, for the
/// periodic stats dump.
pub fn print_status() {
    let info = MALLOC_INFO.lock();
    report!(
        "=={}== quarantine: {} MB; free lists (class:MB):",
        report::pid(),
        info.quarantine.size() >> 20
    );
    for class in 1..NUM_SIZE_CLASSES {
        unsafe {
            let mut m = info.free_lists[class];
            if m.is_null() {
                continue;
            }
            let mut total = 0;
            while !m.is_null() {
                total += (*m).size();
                m = (*m).next;
            }
            report!(" {}:{}", class, total >> 20);
        }
    }
    report!("\n");
}
