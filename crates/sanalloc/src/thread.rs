//! Per-thread allocator state: the free-list cache, the local quarantine
//! buffer, the fake stack, and the live-thread bookkeeping.
//!
//! A thread's context is created lazily on its first allocator call and
//! torn down by the TLS destructor, which commits all local storage back to
//! the global allocator. During the teardown window (and in signal-handler
//! re-entry before TLS exists) `with` returns None and callers fall back to
//! the global-only paths.

use crate::fake_stack::FakeStack;
use crate::heap::chunk::{Chunk, ChunkFifoList};
use crate::heap::malloc_info;
use crate::heap::size_class::NUM_SIZE_CLASSES;
use crate::platform;
use crate::sync::Mutex;
use core::cell::{Cell, RefCell};
use core::ptr;
use core::sync::atomic::{AtomicU32, Ordering};

/// `free_tid` of a chunk that has not been freed.
pub const INVALID_TID: u32 = u32::MAX;
/// Attributed when no thread record exists (TLS teardown, early signals).
/// Distinct from tid 0 so reports cannot confuse "no thread" with the first
/// thread.
pub const UNKNOWN_TID: u32 = u32::MAX - 1;

/// Thread-id wrapper for report formatting; the unknown sentinel prints as
/// `T?` so reports never attribute anonymous operations to the first
/// thread.
pub struct Tid(pub u32);

impl core::fmt::Display for Tid {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        if self.0 == UNKNOWN_TID {
            write!(f, "T?")
        } else {
            write!(f, "T{}", self.0)
        }
    }
}

pub struct ThreadMallocStorage {
    pub free_lists: [*mut Chunk; NUM_SIZE_CLASSES],
    pub quarantine: ChunkFifoList,
}

impl ThreadMallocStorage {
    pub const fn new() -> Self {
        ThreadMallocStorage {
            free_lists: [ptr::null_mut(); NUM_SIZE_CLASSES],
            quarantine: ChunkFifoList::new(),
        }
    }
}

pub struct ThreadContext {
    pub tid: u32,
    storage: RefCell<ThreadMallocStorage>,
    fake_stack: RefCell<FakeStack>,
    prev: Cell<*mut ThreadContext>,
    next: Cell<*mut ThreadContext>,
}

impl ThreadContext {
    /// Run `f` against this thread's malloc storage. None when the storage
    /// is already borrowed (re-entrant call).
    #[inline]
    pub fn with_storage<R>(&self, f: impl FnOnce(&mut ThreadMallocStorage) -> R) -> Option<R> {
        self.storage.try_borrow_mut().ok().map(|mut s| f(&mut s))
    }

    #[inline]
    pub fn with_fake_stack<R>(&self, f: impl FnOnce(&mut FakeStack) -> R) -> Option<R> {
        self.fake_stack.try_borrow_mut().ok().map(|mut fs| f(&mut fs))
    }

    fn create() -> Box<ThreadContext> {
        let tid = NEXT_TID.fetch_add(1, Ordering::Relaxed);
        let mut ctx = Box::new(ThreadContext {
            tid,
            storage: RefCell::new(ThreadMallocStorage::new()),
            fake_stack: RefCell::new(FakeStack::new()),
            prev: Cell::new(ptr::null_mut()),
            next: Cell::new(ptr::null_mut()),
        });
        ctx.fake_stack.get_mut().init(platform::thread_stack_size());
        unsafe {
            register(&mut *ctx as *mut ThreadContext);
        }
        ctx
    }
}

impl Drop for ThreadContext {
    fn drop(&mut self) {
        unsafe {
            malloc_info::swallow_thread_storage(self.storage.get_mut(), true);
            self.fake_stack.get_mut().cleanup();
            unregister(self as *mut ThreadContext);
        }
    }
}

static NEXT_TID: AtomicU32 = AtomicU32::new(0);

// Doubly-linked list of live thread contexts, guarded by its own lock (the
// allocator lock is never held while taking this one).
struct LiveList {
    head: *mut ThreadContext,
    count: usize,
}

unsafe impl Send for LiveList {}

static LIVE: Mutex<LiveList> = Mutex::new(LiveList {
    head: ptr::null_mut(),
    count: 0,
});

unsafe fn register(ctx: *mut ThreadContext) {
    let mut live = LIVE.lock();
    (*ctx).prev.set(ptr::null_mut());
    (*ctx).next.set(live.head);
    if !live.head.is_null() {
        (*live.head).prev.set(ctx);
    }
    live.head = ctx;
    live.count += 1;
}

unsafe fn unregister(ctx: *mut ThreadContext) {
    let mut live = LIVE.lock();
    let prev = (*ctx).prev.get();
    let next = (*ctx).next.get();
    if !prev.is_null() {
        (*prev).next.set(next);
    } else {
        live.head = next;
    }
    if !next.is_null() {
        (*next).prev.set(prev);
    }
    live.count -= 1;
}

pub fn live_thread_count() -> usize {
    LIVE.lock().count
}

thread_local! {
    static CONTEXT: RefCell<Option<Box<ThreadContext>>> = const { RefCell::new(None) };
}

/// Run `f` against the current thread's context, creating it on first use.
/// None when TLS is unavailable (thread teardown, nested access): the
/// caller must use the global-only path.
pub fn with<F, R>(f: F) -> Option<R>
where
    F: FnOnce(&ThreadContext) -> R,
{
    CONTEXT
        .try_with(|cell| {
            let mut slot = cell.try_borrow_mut().ok()?;
            if slot.is_none() {
                *slot = Some(ThreadContext::create());
            }
            Some(f(slot.as_deref().unwrap()))
        })
        .ok()
        .flatten()
}

/// The current thread's tid, or UNKNOWN_TID when no record exists.
pub fn current_tid() -> u32 {
    with(|t| t.tid).unwrap_or(UNKNOWN_TID)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tids_are_distinct_per_thread() {
        crate::init::ensure_initialized();
        let mine = current_tid();
        assert_ne!(mine, UNKNOWN_TID);
        let other = std::thread::spawn(current_tid).join().unwrap();
        assert_ne!(other, UNKNOWN_TID);
        assert_ne!(mine, other);
    }

    #[test]
    fn live_list_tracks_registration() {
        crate::init::ensure_initialized();
        current_tid(); // make sure this thread is registered
        assert!(live_thread_count() >= 1);
        std::thread::spawn(|| {
            current_tid();
            // Both this thread and the spawner are live now.
            assert!(live_thread_count() >= 2);
        })
        .join()
        .unwrap();
        // Exact counts race with other tests' threads; the spawner at least
        // is still registered.
        assert!(live_thread_count() >= 1);
    }
}
