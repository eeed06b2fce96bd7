#![no_main]

use libfuzzer_sys::fuzz_target;
use sanalloc::StackTrace;

/// Fuzz target that interprets a byte slice as a sequence of allocator
/// operations.
///
/// Each operation is encoded as:
///   byte 0: opcode (0=malloc, 1=free, 2=realloc, 3=calloc)
///   byte 1-2: size (little-endian u16)
///   byte 3: slot index (which tracked pointer to operate on)
///
/// We track up to 64 live pointers.
const MAX_SLOTS: usize = 64;

fuzz_target!(|data: &[u8]| {
    let stack = StackTrace::from_pcs(&[0x1000, 0x2000]);
    let mut slots: [*mut u8; MAX_SLOTS] = [std::ptr::null_mut(); MAX_SLOTS];
    let mut sizes: [usize; MAX_SLOTS] = [0; MAX_SLOTS];

    let mut i = 0;
    while i + 4 <= data.len() {
        let opcode = data[i] & 0x03;
        let size = u16::from_le_bytes([data[i + 1], data[i + 2]]) as usize;
        let slot = (data[i + 3] as usize) % MAX_SLOTS;
        i += 4;

        match opcode {
            0 => {
                // malloc
                if !slots[slot].is_null() {
                    unsafe { sanalloc::free(slots[slot], &stack) };
                }
                let ptr = unsafe { sanalloc::malloc(size, &stack) };
                assert!(!ptr.is_null(), "malloc never returns NULL");
                assert_eq!(
                    unsafe { sanalloc::allocation_size(ptr) },
                    size.max(1),
                    "allocation_size must echo the request"
                );
                slots[slot] = ptr;
                sizes[slot] = size.max(1);
                unsafe {
                    std::ptr::write_bytes(ptr, 0xaa, sizes[slot].min(256));
                }
            }
            1 => {
                // free
                if !slots[slot].is_null() {
                    unsafe { sanalloc::free(slots[slot], &stack) };
                    slots[slot] = std::ptr::null_mut();
                    sizes[slot] = 0;
                }
            }
            2 => {
                // realloc; size 0 returns null and keeps the old pointer
                // alive, so the slot must stay tracked in that case
                if !slots[slot].is_null() {
                    let ptr = unsafe { sanalloc::realloc(slots[slot], size, &stack) };
                    if size == 0 {
                        assert!(ptr.is_null(), "realloc(p, 0) returns NULL");
                    } else {
                        assert!(!ptr.is_null());
                        slots[slot] = ptr;
                        sizes[slot] = size;
                    }
                } else {
                    let ptr = unsafe { sanalloc::realloc(std::ptr::null_mut(), size, &stack) };
                    assert!(!ptr.is_null(), "realloc(NULL, n) acts as malloc");
                    slots[slot] = ptr;
                    sizes[slot] = size.max(1);
                }
            }
            3 => {
                // calloc
                if !slots[slot].is_null() {
                    unsafe { sanalloc::free(slots[slot], &stack) };
                }
                let nmemb = (size >> 8).max(1);
                let elem_size = (size & 0xff).max(1);
                let ptr = unsafe { sanalloc::calloc(nmemb, elem_size, &stack) };
                let total = nmemb * elem_size;
                assert!(!ptr.is_null());
                slots[slot] = ptr;
                sizes[slot] = total;
                let check_len = total.min(256);
                for j in 0..check_len {
                    assert_eq!(
                        unsafe { *ptr.add(j) },
                        0,
                        "calloc memory not zeroed at offset {}",
                        j
                    );
                }
            }
            _ => unreachable!(),
        }
    }

    // Cleanup
    for slot in &mut slots {
        if !slot.is_null() {
            unsafe { sanalloc::free(*slot, &stack) };
            *slot = std::ptr::null_mut();
        }
    }
});
