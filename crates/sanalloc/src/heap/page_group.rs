//! Registry of every OS mapping the allocator owns.
//!
//! Registration is append-only and the slot array is fixed-size; lookups
//! scan linearly without taking the allocator lock. That is acceptable
//! because every mapping is at least `MIN_MMAP_PAGES` pages, so the number
//! of groups stays small for the life of the process.

use crate::util::{MAX_AVAILABLE_RAM, MIN_MMAP_PAGES};
use core::ptr;
use core::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

/// One OS mapping, carved into chunks of a single backing size. The header
/// itself lives in the poisoned tail of the mapping it describes and is
/// never freed.
#[repr(C)]
pub struct PageGroup {
    pub beg: usize,
    pub end: usize,
    pub size_of_chunk: usize,
}

impl PageGroup {
    #[inline]
    pub fn in_range(&self, addr: usize) -> bool {
        addr >= self.beg && addr < self.end
    }
}

/// Slot capacity, sized so that MAX_AVAILABLE_RAM worth of minimum-size
/// mappings always fits (computed with the smallest common page size).
pub const MAX_PAGE_GROUPS: usize = MAX_AVAILABLE_RAM / (MIN_MMAP_PAGES * 4096);

struct Registry {
    groups: [AtomicPtr<PageGroup>; MAX_PAGE_GROUPS],
    count: AtomicUsize,
}

#[allow(clippy::declare_interior_mutable_const)]
const EMPTY_SLOT: AtomicPtr<PageGroup> = AtomicPtr::new(ptr::null_mut());

static REGISTRY: Registry = Registry {
    groups: [EMPTY_SLOT; MAX_PAGE_GROUPS],
    count: AtomicUsize::new(0),
};

/// Append a group. The fetch-add reserves the slot index; the release
/// store publishes it.
///
/// # Safety
/// `pg` must point to a fully initialized PageGroup that lives forever.
pub unsafe fn register(pg: *mut PageGroup) {
    let idx = REGISTRY.count.fetch_add(1, Ordering::AcqRel);
    check!(idx < MAX_PAGE_GROUPS);
    REGISTRY.groups[idx].store(pg, Ordering::Release);
}

/// Lock-free lookup. A reader may observe the count ahead of a slot store;
/// such slots read as null and are skipped.
///
/// # Safety
/// Registered groups are never unregistered, so any non-null slot is valid.
pub unsafe fn find(addr: usize) -> *mut PageGroup {
    let n = REGISTRY.count.load(Ordering::Acquire).min(MAX_PAGE_GROUPS);
    for slot in REGISTRY.groups[..n].iter() {
        let g = slot.load(Ordering::Acquire);
        if g.is_null() {
            continue;
        }
        if (*g).in_range(addr) {
            return g;
        }
    }
    ptr::null_mut()
}
