use core::ptr;

/// Map anonymous read-write memory.
///
/// # Safety
/// `size` must be page-aligned and non-zero.
pub unsafe fn map_anonymous(size: usize) -> *mut u8 {
    let result = libc::mmap(
        ptr::null_mut(),
        size,
        libc::PROT_READ | libc::PROT_WRITE,
        libc::MAP_PRIVATE | libc::MAP_ANON,
        -1,
        0,
    );
    if result == libc::MAP_FAILED {
        ptr::null_mut()
    } else {
        result as *mut u8
    }
}

/// Unmap memory.
///
/// # Safety
/// `ptr` must have been returned by `map_anonymous` with the same `size`.
pub unsafe fn unmap(ptr: *mut u8, size: usize) {
    libc::munmap(ptr as *mut libc::c_void, size);
}

pub fn query_page_size() -> usize {
    let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if sz < 1 {
        4096
    } else {
        sz as usize
    }
}

pub fn thread_stack_size() -> usize {
    use crate::platform::{DEFAULT_STACK_SIZE, MAX_SANE_STACK_SIZE};
    let size = unsafe { libc::pthread_get_stacksize_np(libc::pthread_self()) };
    if size == 0 || size > MAX_SANE_STACK_SIZE {
        DEFAULT_STACK_SIZE
    } else {
        size
    }
}
