//! sanalloc: an address-sanity heap allocator.
//!
//! Every allocation is surrounded by poisoned redzones, freed blocks sit in
//! a FIFO quarantine before any reuse, and both the allocation and free
//! sites' stack traces are recorded in-band. The allocator maintains shadow
//! memory (one byte per eight) describing the addressability of everything
//! it owns, for an external memory-access checker to consult; the
//! [`shadow::check_access`] query is that checker's view. A per-thread fake
//! stack provides off-main-stack frame storage so use-after-return is
//! detectable too.
//!
//! This crate is the allocator core only: entry points take caller-captured
//! [`StackTrace`]s and there is no C-symbol interception layer here.
//! Detected misuse (double free, invalid free, out-of-memory) is reported
//! on stderr in `==pid==` lines and aborts the process; an allocator built
//! to catch memory errors must not limp past one.

#[macro_use]
pub mod report;

pub mod alloc;
pub mod config;
pub mod fake_stack;
pub mod heap;
pub mod init;
pub mod platform;
pub mod shadow;
pub mod stacktrace;
pub mod stats;
pub mod sync;
pub mod thread;
pub mod util;

pub use alloc::{
    allocation_size, calloc, describe_heap_address, free, malloc, memalign, posix_memalign,
    pvalloc, realloc, valloc,
};
pub use fake_stack::{frame_name_by_addr, stack_free, stack_malloc};
pub use stacktrace::StackTrace;
