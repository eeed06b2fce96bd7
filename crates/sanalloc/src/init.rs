//! Construct-on-first-use initialization.
//!
//! The first allocating call on any thread (including re-entry from a
//! signal handler) must find a usable allocator, so initialization is an
//! atomic state machine: one thread wins the compare-exchange and does the
//! work, racers spin until it publishes READY.

use crate::{config, report, shadow};
use core::sync::atomic::{AtomicU8, Ordering};

const UNINIT: u8 = 0;
const INITIALIZING: u8 = 1;
const READY: u8 = 2;

static STATE: AtomicU8 = AtomicU8::new(UNINIT);

#[inline(always)]
pub fn ensure_initialized() {
    if STATE.load(Ordering::Acquire) == READY {
        return;
    }
    initialize();
}

#[cold]
#[inline(never)]
fn initialize() {
    match STATE.compare_exchange(UNINIT, INITIALIZING, Ordering::AcqRel, Ordering::Acquire) {
        Ok(_) => {}
        Err(INITIALIZING) => {
            while STATE.load(Ordering::Acquire) == INITIALIZING {
                core::hint::spin_loop();
            }
            return;
        }
        Err(_) => return,
    }

    unsafe {
        config::read_config();
        if !shadow::init() {
            report!(
                "=={}== ERROR: sanalloc could not map its shadow index\n",
                report::pid()
            );
            report::die();
        }
    }

    STATE.store(READY, Ordering::Release);
}
