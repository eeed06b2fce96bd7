//! Runtime options, read once from the environment during init.

use crate::report;
use core::sync::atomic::{AtomicUsize, Ordering};

/// Left-redzone width and alignment granularity.
pub const DEFAULT_REDZONE: usize = 128;

/// Global quarantine byte budget.
pub const DEFAULT_QUARANTINE_SIZE: usize = 1 << 26;

/// On 64-bit the chunk header is 32 bytes and must fit inside the left
/// redzone, so smaller configured values are raised to this floor.
const MIN_REDZONE: usize = 32;

static REDZONE: AtomicUsize = AtomicUsize::new(DEFAULT_REDZONE);
static QUARANTINE_SIZE: AtomicUsize = AtomicUsize::new(DEFAULT_QUARANTINE_SIZE);
static STATS: AtomicUsize = AtomicUsize::new(0);
static DEBUG: AtomicUsize = AtomicUsize::new(0);
static VERBOSITY: AtomicUsize = AtomicUsize::new(0);

/// Read configuration from environment variables.
///
/// # Safety
/// Calls libc::getenv, which is not thread-safe against concurrent
/// setenv; must be called from init before the allocator is in use.
pub unsafe fn read_config() {
    if let Some(val) = getenv_usize(b"SANALLOC_REDZONE\0") {
        if !val.is_power_of_two() || val < 16 || val > 128 || val < crate::shadow::GRANULARITY {
            report!(
                "=={}== WARNING: ignoring invalid SANALLOC_REDZONE={} (want a power of two in 16..=128)\n",
                report::pid(),
                val
            );
        } else if val < MIN_REDZONE {
            report!(
                "=={}== WARNING: SANALLOC_REDZONE={} is smaller than the chunk header; using {}\n",
                report::pid(),
                val,
                MIN_REDZONE
            );
            REDZONE.store(MIN_REDZONE, Ordering::Relaxed);
        } else {
            REDZONE.store(val, Ordering::Relaxed);
        }
    }
    if let Some(val) = getenv_usize(b"SANALLOC_QUARANTINE_SIZE\0") {
        if val == 0 {
            report!(
                "=={}== WARNING: SANALLOC_QUARANTINE_SIZE must be > 0; keeping {}\n",
                report::pid(),
                DEFAULT_QUARANTINE_SIZE
            );
        } else {
            QUARANTINE_SIZE.store(val, Ordering::Relaxed);
        }
    }
    if let Some(val) = getenv_usize(b"SANALLOC_STATS\0") {
        STATS.store(val, Ordering::Relaxed);
    }
    if let Some(val) = getenv_usize(b"SANALLOC_DEBUG\0") {
        DEBUG.store(val, Ordering::Relaxed);
    }
    if let Some(val) = getenv_usize(b"SANALLOC_VERBOSE\0") {
        VERBOSITY.store(val, Ordering::Relaxed);
    }
}

#[inline]
pub fn redzone() -> usize {
    REDZONE.load(Ordering::Relaxed)
}

#[inline]
pub fn quarantine_size() -> usize {
    QUARANTINE_SIZE.load(Ordering::Relaxed)
}

/// Nonzero n means: dump statistics every 2^n bytes allocated.
#[inline]
pub fn stats() -> usize {
    STATS.load(Ordering::Relaxed)
}

#[inline]
pub fn debug() -> bool {
    DEBUG.load(Ordering::Relaxed) != 0
}

#[inline]
pub fn verbosity() -> usize {
    VERBOSITY.load(Ordering::Relaxed)
}

/// Parse an environment variable as a usize.
///
/// # Safety
/// Calls libc::getenv.
unsafe fn getenv_usize(key: &[u8]) -> Option<usize> {
    let val = libc::getenv(key.as_ptr() as *const libc::c_char);
    if val.is_null() {
        return None;
    }

    // Parse manually (no std allocation)
    let mut result: usize = 0;
    let mut ptr = val as *const u8;
    loop {
        let byte = *ptr;
        if byte == 0 {
            break;
        }
        if !byte.is_ascii_digit() {
            return None;
        }
        result = result.checked_mul(10)?.checked_add((byte - b'0') as usize)?;
        ptr = ptr.add(1);
    }
    Some(result)
}
