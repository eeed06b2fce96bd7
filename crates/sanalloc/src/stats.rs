//! Allocation statistics, dumped periodically when the `stats` option is set.

use crate::report;
use core::sync::atomic::{AtomicUsize, Ordering};

static MALLOCS: AtomicUsize = AtomicUsize::new(0);
static MALLOCED: AtomicUsize = AtomicUsize::new(0);
static MALLOCED_REDZONES: AtomicUsize = AtomicUsize::new(0);
static FREES: AtomicUsize = AtomicUsize::new(0);
static FREED: AtomicUsize = AtomicUsize::new(0);
static REALLOCS: AtomicUsize = AtomicUsize::new(0);
static REALLOCED: AtomicUsize = AtomicUsize::new(0);
static REAL_FREES: AtomicUsize = AtomicUsize::new(0);
static REALLY_FREED: AtomicUsize = AtomicUsize::new(0);
static MMAPS: AtomicUsize = AtomicUsize::new(0);
static MMAPED: AtomicUsize = AtomicUsize::new(0);
static MALLOC_LARGE: AtomicUsize = AtomicUsize::new(0);
static MALLOC_SMALL_SLOW: AtomicUsize = AtomicUsize::new(0);
static ALLOCATED_SINCE_LAST_STATS: AtomicUsize = AtomicUsize::new(0);

#[inline]
pub fn record_malloc(requested: usize, backing: usize) {
    MALLOCS.fetch_add(1, Ordering::Relaxed);
    MALLOCED.fetch_add(requested, Ordering::Relaxed);
    MALLOCED_REDZONES.fetch_add(backing - requested, Ordering::Relaxed);
}

#[inline]
pub fn record_free(used_size: usize) {
    FREES.fetch_add(1, Ordering::Relaxed);
    FREED.fetch_add(used_size, Ordering::Relaxed);
}

#[inline]
pub fn record_realloc(new_size: usize) {
    REALLOCS.fetch_add(1, Ordering::Relaxed);
    REALLOCED.fetch_add(new_size, Ordering::Relaxed);
}

/// A chunk left quarantine and went back to the free lists.
#[inline]
pub fn record_really_freed(used_size: usize) {
    REAL_FREES.fetch_add(1, Ordering::Relaxed);
    REALLY_FREED.fetch_add(used_size, Ordering::Relaxed);
}

#[inline]
pub fn record_mmap(bytes: usize) {
    MMAPS.fetch_add(1, Ordering::Relaxed);
    MMAPED.fetch_add(bytes, Ordering::Relaxed);
}

#[inline]
pub fn record_malloc_large() {
    MALLOC_LARGE.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub fn record_malloc_small_slow() {
    MALLOC_SMALL_SLOW.fetch_add(1, Ordering::Relaxed);
}

/// Total bytes ever obtained from the OS.
pub fn total_mmaped() -> usize {
    MMAPED.load(Ordering::Relaxed)
}

/// Accumulate the sample counter; returns true when 2^`period_log` bytes
/// have been allocated since the last dump (and resets the counter).
#[inline]
pub fn stats_due(requested: usize, period_log: usize) -> bool {
    let before = ALLOCATED_SINCE_LAST_STATS.fetch_add(requested, Ordering::Relaxed);
    if before + requested > (1usize << period_log.min(63)) {
        ALLOCATED_SINCE_LAST_STATS.store(0, Ordering::Relaxed);
        true
    } else {
        false
    }
}

pub fn print_stats() {
    report!(
        "=={}== stats: mallocs {} ({} bytes, {} redzone bytes); frees {} ({} bytes); \
         reallocs {} ({} bytes); recycled {} ({} bytes); mmaps {} ({} bytes); \
         large {}; cache refills {}\n",
        report::pid(),
        MALLOCS.load(Ordering::Relaxed),
        MALLOCED.load(Ordering::Relaxed),
        MALLOCED_REDZONES.load(Ordering::Relaxed),
        FREES.load(Ordering::Relaxed),
        FREED.load(Ordering::Relaxed),
        REALLOCS.load(Ordering::Relaxed),
        REALLOCED.load(Ordering::Relaxed),
        REAL_FREES.load(Ordering::Relaxed),
        REALLY_FREED.load(Ordering::Relaxed),
        MMAPS.load(Ordering::Relaxed),
        MMAPED.load(Ordering::Relaxed),
        MALLOC_LARGE.load(Ordering::Relaxed),
        MALLOC_SMALL_SLOW.load(Ordering::Relaxed),
    );
}
