#![no_main]

use libfuzzer_sys::fuzz_target;
use sanalloc::StackTrace;

/// Fuzz target over allocation sizes and alignments: every request either
/// succeeds with an exact allocation_size echo and a writable body, or the
/// process aborts (which libFuzzer reports) -- null is never returned.
fuzz_target!(|data: &[u8]| {
    let stack = StackTrace::from_pcs(&[0x1000]);

    let mut i = 0;
    while i + 4 <= data.len() {
        let raw = u32::from_le_bytes([data[i], data[i + 1], data[i + 2], data[i + 3]]);
        i += 4;

        // Keep sizes under 1 MiB so a fuzz run cannot exhaust the host.
        let size = (raw & 0x000f_ffff) as usize;
        let align_log = (raw >> 20) & 0x0f;
        let alignment = 1usize << align_log; // 1 .. 32768

        unsafe {
            let p = sanalloc::memalign(alignment, size, &stack);
            assert!(!p.is_null());
            assert_eq!(p as usize % alignment, 0);
            assert_eq!(sanalloc::allocation_size(p), size.max(1));
            std::ptr::write_bytes(p, 0x5a, size.max(1).min(512));
            sanalloc::free(p, &stack);
        }
    }
});
