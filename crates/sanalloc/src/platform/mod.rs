#[cfg(target_os = "linux")]
pub mod linux;
#[cfg(target_os = "linux")]
pub use linux as sys;

#[cfg(target_os = "macos")]
pub mod macos;
#[cfg(target_os = "macos")]
pub use macos as sys;

use core::sync::atomic::{AtomicUsize, Ordering};

/// Map anonymous read-write memory. Returns null on failure.
///
/// # Safety
/// Caller must ensure `size` is page-aligned and non-zero.
#[inline]
pub unsafe fn map_anonymous(size: usize) -> *mut u8 {
    sys::map_anonymous(size)
}

/// Unmap previously mapped memory.
///
/// # Safety
/// `ptr` must have been returned by `map_anonymous` and `size` must match.
#[inline]
pub unsafe fn unmap(ptr: *mut u8, size: usize) {
    sys::unmap(ptr, size);
}

/// The system page size, queried once and cached.
#[inline]
pub fn page_size() -> usize {
    static CACHED: AtomicUsize = AtomicUsize::new(0);
    let cached = CACHED.load(Ordering::Relaxed);
    if cached != 0 {
        return cached;
    }
    let sz = sys::query_page_size();
    CACHED.store(sz, Ordering::Relaxed);
    sz
}

/// Size of the current thread's hardware stack. Used to size the fake-stack
/// mappings so a thread's rewritten frames cannot outgrow its real stack.
pub fn thread_stack_size() -> usize {
    sys::thread_stack_size()
}

/// Fallback when the pthread stack query fails or returns garbage
/// (pthread_attr_getstack is known to misreport under some launchers).
pub(crate) const DEFAULT_STACK_SIZE: usize = 8 << 20;
pub(crate) const MAX_SANE_STACK_SIZE: usize = 16 << 20;
