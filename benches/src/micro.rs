//! Microbenchmarks for the sanity allocator: per-operation latency of the
//! hot entry points across a spread of sizes. Not a correctness test; run
//! with `cargo run --release --bin micro`.

use sanalloc::StackTrace;
use std::hint::black_box;
use std::time::Instant;

fn st() -> StackTrace {
    StackTrace::from_pcs(&[0x1000, 0x2000])
}

/// Measure malloc/free latency for a given size, N iterations.
fn bench_malloc_free(size: usize, iterations: usize) -> f64 {
    let stack = st();
    // Warmup
    for _ in 0..1000 {
        unsafe {
            let ptr = sanalloc::malloc(black_box(size), &stack);
            std::ptr::write_bytes(ptr, 0xab, size.min(64));
            sanalloc::free(black_box(ptr), &stack);
        }
    }
    let start = Instant::now();
    for _ in 0..iterations {
        unsafe {
            let ptr = sanalloc::malloc(black_box(size), &stack);
            std::ptr::write_bytes(ptr, 0xab, size.min(64));
            sanalloc::free(black_box(ptr), &stack);
        }
    }
    start.elapsed().as_nanos() as f64 / iterations as f64
}

/// Measure calloc/free latency.
fn bench_calloc_free(size: usize, iterations: usize) -> f64 {
    let stack = st();
    for _ in 0..1000 {
        unsafe {
            let ptr = sanalloc::calloc(black_box(1), black_box(size), &stack);
            sanalloc::free(black_box(ptr), &stack);
        }
    }
    let start = Instant::now();
    for _ in 0..iterations {
        unsafe {
            let ptr = sanalloc::calloc(black_box(1), black_box(size), &stack);
            sanalloc::free(black_box(ptr), &stack);
        }
    }
    start.elapsed().as_nanos() as f64 / iterations as f64
}

/// Measure realloc grow latency (double the size each call, reset at 64 KiB).
fn bench_realloc_grow(iterations: usize) -> f64 {
    let stack = st();
    let start = Instant::now();
    let mut ptr = unsafe { sanalloc::malloc(16, &stack) };
    let mut size = 16;
    for _ in 0..iterations {
        size *= 2;
        if size > 65536 {
            unsafe { sanalloc::free(ptr, &stack) };
            ptr = unsafe { sanalloc::malloc(16, &stack) };
            size = 32;
        }
        ptr = unsafe { sanalloc::realloc(black_box(ptr), black_box(size), &stack) };
    }
    unsafe { sanalloc::free(ptr, &stack) };
    start.elapsed().as_nanos() as f64 / iterations as f64
}

fn main() {
    const ITERATIONS: usize = 200_000;
    let sizes = [16usize, 64, 256, 1024, 4096, 16384, 65536];

    println!("malloc/free (ns per pair):");
    for &size in &sizes {
        println!("  {:>7} B  {:>8.1}", size, bench_malloc_free(size, ITERATIONS));
    }

    println!("calloc/free (ns per pair):");
    for &size in &sizes {
        println!("  {:>7} B  {:>8.1}", size, bench_calloc_free(size, ITERATIONS / 2));
    }

    println!("realloc grow (ns per call):");
    println!("  {:>8.1}", bench_realloc_grow(ITERATIONS / 4));
}
