//! Allocate / Deallocate / Reallocate and the public operation surface.
//!
//! Every allocation is fronted by a poisoned left redzone holding the chunk
//! header and the compressed allocation stack; the body is rounded up to
//! the redzone width, with a byte-granular partial poison on the tail cell.
//! Frees poison the body, record the free stack over its first bytes, and
//! quarantine the chunk.

use crate::heap::chunk::{
    chunk_from_user_ptr, Chunk, CHUNK_ALLOCATED, CHUNK_AVAILABLE, CHUNK_MEMALIGN, CHUNK_QUARANTINED,
};
use crate::heap::malloc_info;
use crate::heap::page_group;
use crate::heap::size_class::{class_for_size, class_size};
use crate::shadow::{self, PoisonKind};
use crate::stacktrace::StackTrace;
use crate::thread::{self, Tid, INVALID_TID};
use crate::util::{
    align_up, is_aligned, MAX_ALLOWED_MALLOC_SIZE, MAX_SIZE_FOR_THREAD_LOCAL_FREE_LIST,
    MAX_THREAD_LOCAL_QUARANTINE,
};
use crate::{config, init, platform, report, stats};
use core::ptr;

#[cold]
fn out_of_memory(what: &str, size: usize, stack: &StackTrace) -> ! {
    report!(
        "=={}== ERROR: sanalloc failed to allocate {:#x} ({}) bytes ({}) in {}\n",
        report::pid(),
        size,
        size,
        what,
        Tid(thread::current_tid())
    );
    stack.print();
    report::die();
}

unsafe fn allocate(alignment: usize, size: usize, stack: &StackTrace) -> *mut u8 {
    init::ensure_initialized();
    let size = if size == 0 { 1 } else { size };
    check!(alignment == 0 || alignment.is_power_of_two());

    let redzone = config::redzone();
    let rounded_size = align_up(size, redzone);
    let mut needed_size = rounded_size + redzone;
    if alignment > redzone {
        // Worst-case adjustment so the aligned pointer still lands inside
        // the chunk with its redzone intact.
        needed_size += alignment;
    }
    check!(is_aligned(needed_size, redzone));
    if needed_size > MAX_ALLOWED_MALLOC_SIZE {
        out_of_memory("malloc", size, stack);
    }

    let class = class_for_size(needed_size);
    let backing_size = class_size(class);
    check!(backing_size >= 2 * redzone);
    check!(backing_size >= needed_size);
    check!(is_aligned(backing_size, redzone));

    if config::verbosity() >= 2 {
        report!(
            "sanalloc: allocate align {} size {} class {} backing {}\n",
            alignment,
            size,
            class,
            backing_size
        );
    }
    stats::record_malloc(size, backing_size);
    let stats_period = config::stats();
    if stats_period != 0 && stats::stats_due(size, stats_period) {
        stats::print_stats();
        malloc_info::print_status();
    }

    let m = if backing_size >= MAX_SIZE_FOR_THREAD_LOCAL_FREE_LIST {
        stats::record_malloc_large();
        malloc_info::allocate_chunks(class, 1)
    } else {
        thread::with(|t| {
            t.with_storage(|ms| {
                let list = &mut ms.free_lists[class as usize];
                if list.is_null() {
                    let refill_count = MAX_SIZE_FOR_THREAD_LOCAL_FREE_LIST / backing_size;
                    *list = malloc_info::allocate_chunks(class, refill_count);
                    stats::record_malloc_small_slow();
                }
                let m = *list;
                *list = (*m).next;
                m
            })
        })
        .flatten()
        .unwrap_or_else(|| malloc_info::allocate_chunks(class, 1))
    };
    check!(!m.is_null());
    check!((*m).state == CHUNK_AVAILABLE);
    (*m).state = CHUNK_ALLOCATED;
    (*m).next = ptr::null_mut();
    check!((*m).size() == backing_size);

    let mut addr = m as usize + redzone;
    {
        // The free-stack slot starts exactly at the default user address.
        let (slot, _) = (*m).free_stack_slot();
        check!(addr == slot as usize);
    }

    if alignment > redzone && !is_aligned(addr, alignment) {
        addr = align_up(addr, alignment);
        check!(is_aligned(addr, alignment));
        let forwarder = (addr - redzone) as *mut Chunk;
        (*forwarder).state = CHUNK_MEMALIGN;
        (*forwarder).next = m;
    }
    check!(m == chunk_from_user_ptr(addr));
    (*m).used_size = size;
    (*m).offset = (addr - m as usize) as u32;
    check!((*m).beg() == addr);
    (*m).alloc_tid = thread::current_tid();
    (*m).free_tid = INVALID_TID;
    {
        let (slot, len) = (*m).alloc_stack_slot();
        stack.compress_into(slot, len);
    }

    shadow::poison(addr, rounded_size, PoisonKind::Addressable);
    if size < rounded_size {
        shadow::poison_partial_right_redzone(
            addr + rounded_size - redzone,
            size & (redzone - 1),
            redzone,
        );
    }
    addr as *mut u8
}

unsafe fn deallocate(ptr: *mut u8, stack: &StackTrace) {
    if ptr.is_null() {
        return;
    }
    init::ensure_initialized();

    if config::debug() {
        check!(!page_group::find(ptr as usize).is_null());
    }

    let m = chunk_from_user_ptr(ptr as usize);
    if (*m).state == CHUNK_QUARANTINED {
        report!(
            "=={}== ERROR: attempting double-free on {:p}:\n",
            report::pid(),
            ptr
        );
        stack.print();
        (*m).describe_address(ptr as usize, 1);
        stats::print_stats();
        report::die();
    } else if (*m).state != CHUNK_ALLOCATED {
        report!(
            "=={}== ERROR: attempting free on address which was not malloc()-ed: {:p}\n",
            report::pid(),
            ptr
        );
        stack.print();
        stats::print_stats();
        report::die();
    }
    check!((*m).free_tid == INVALID_TID);
    (*m).free_tid = thread::current_tid();
    {
        // Overwrites the first bytes of the user body; the user must not
        // read them again anyway.
        let (slot, len) = (*m).free_stack_slot();
        stack.compress_into(slot, len);
    }
    let rounded_size = align_up((*m).used_size, config::redzone());
    shadow::poison(ptr as usize, rounded_size, PoisonKind::HeapFreed);
    stats::record_free((*m).used_size);
    (*m).state = CHUNK_QUARANTINED;

    let queued = thread::with(|t| {
        t.with_storage(|ms| {
            check!((*m).next.is_null());
            ms.quarantine.push(m);
            if ms.quarantine.size() > MAX_THREAD_LOCAL_QUARANTINE {
                malloc_info::swallow_thread_storage(ms, false);
            }
        })
    })
    .flatten()
    .is_some();
    if !queued {
        check!((*m).next.is_null());
        malloc_info::bypass_thread_quarantine(m);
    }
}

unsafe fn reallocate(old_ptr: *mut u8, new_size: usize, stack: &StackTrace) -> *mut u8 {
    if old_ptr.is_null() {
        return allocate(0, new_size, stack);
    }
    if new_size == 0 {
        // The old pointer is deliberately left alive; the interception
        // layer that wraps this allocator owns the release in that case.
        return ptr::null_mut();
    }
    stats::record_realloc(new_size);
    let m = chunk_from_user_ptr(old_ptr as usize);
    check!((*m).state == CHUNK_ALLOCATED);
    let old_size = (*m).used_size;
    let copy_size = old_size.min(new_size);
    let new_ptr = allocate(0, new_size, stack);
    ptr::copy_nonoverlapping(old_ptr, new_ptr, copy_size);
    deallocate(old_ptr, stack);
    new_ptr
}

/// Allocate `size` bytes; size 0 yields a distinct 1-byte allocation.
///
/// # Safety
/// Requires a usable OS mapping primitive; aborts the process on any
/// detected misuse or exhaustion.
pub unsafe fn malloc(size: usize, stack: &StackTrace) -> *mut u8 {
    allocate(0, size, stack)
}

/// Free a pointer previously returned by this allocator. Null is a no-op.
///
/// # Safety
/// `ptr` must be null or a live allocation from this allocator.
pub unsafe fn free(ptr: *mut u8, stack: &StackTrace) {
    deallocate(ptr, stack);
}

/// Allocate a zeroed array. Element-count overflow is treated as an
/// out-of-memory condition and aborts.
///
/// # Safety
/// As for `malloc`.
pub unsafe fn calloc(nmemb: usize, size: usize, stack: &StackTrace) -> *mut u8 {
    let total = match nmemb.checked_mul(size) {
        Some(total) => total,
        None => out_of_memory("calloc", usize::MAX, stack),
    };
    let ptr = allocate(0, total, stack);
    ptr::write_bytes(ptr, 0, total);
    ptr
}

/// See the module notes: `realloc(p, 0)` returns null without freeing `p`.
///
/// # Safety
/// `ptr` must be null or a live allocation from this allocator.
pub unsafe fn realloc(ptr: *mut u8, size: usize, stack: &StackTrace) -> *mut u8 {
    reallocate(ptr, size, stack)
}

/// Allocate with the given power-of-two alignment.
///
/// # Safety
/// As for `malloc`.
pub unsafe fn memalign(alignment: usize, size: usize, stack: &StackTrace) -> *mut u8 {
    allocate(alignment, size, stack)
}

/// POSIX-shaped aligned allocation; always succeeds (or aborts).
///
/// # Safety
/// `out` must be valid for a pointer write.
pub unsafe fn posix_memalign(
    out: *mut *mut u8,
    alignment: usize,
    size: usize,
    stack: &StackTrace,
) -> i32 {
    let ptr = allocate(alignment, size, stack);
    check!(is_aligned(ptr as usize, alignment));
    *out = ptr;
    0
}

/// Page-aligned allocation.
///
/// # Safety
/// As for `malloc`.
pub unsafe fn valloc(size: usize, stack: &StackTrace) -> *mut u8 {
    allocate(platform::page_size(), size, stack)
}

/// Page-aligned allocation rounded up to whole pages; size 0 becomes one
/// page.
///
/// # Safety
/// As for `malloc`.
pub unsafe fn pvalloc(size: usize, stack: &StackTrace) -> *mut u8 {
    let page = platform::page_size();
    let mut size = align_up(size, page);
    if size == 0 {
        size = page;
    }
    allocate(page, size, stack)
}

/// The exact byte count requested for a live allocation, or 0 when `ptr`
/// is not one of ours (or no longer live). Emulates malloc_usable_size.
///
/// # Safety
/// `ptr` may be any address.
pub unsafe fn allocation_size(ptr: *const u8) -> usize {
    init::ensure_initialized();
    malloc_info::allocation_size(ptr as usize)
}

/// Emit the diagnostic report for a heap address: its position relative to
/// the owning allocation and the recorded alloc/free stacks.
///
/// # Safety
/// `addr` may be any address.
pub unsafe fn describe_heap_address(addr: usize, access_size: usize) {
    init::ensure_initialized();
    let m = malloc_info::find_allocated_or_freed(addr);
    if m.is_null() {
        return;
    }
    (*m).describe_address(addr, access_size);
    let (alloc_slot, alloc_len) = (*m).alloc_stack_slot();
    let alloc_stack = StackTrace::uncompress_from(alloc_slot, alloc_len);
    if (*m).free_tid != INVALID_TID {
        report!(
            "=={}== freed by thread {} here:\n",
            report::pid(),
            Tid((*m).free_tid)
        );
        let (free_slot, free_len) = (*m).free_stack_slot();
        StackTrace::uncompress_from(free_slot, free_len).print();
        report!(
            "=={}== previously allocated by thread {} here:\n",
            report::pid(),
            Tid((*m).alloc_tid)
        );
        alloc_stack.print();
    } else {
        report!(
            "=={}== allocated by thread {} here:\n",
            report::pid(),
            Tid((*m).alloc_tid)
        );
        alloc_stack.print();
    }
}
