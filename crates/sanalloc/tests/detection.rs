//! Error detection and shadow poisoning semantics.
//!
//! Aborting paths (double free, invalid free, oversized request) are run as
//! subprocesses: we re-spawn the test binary with a scenario name in the
//! environment and check that the child dies with the expected diagnostic
//! on stderr. Report-producing and env-dependent scenarios use the same
//! driver but are expected to exit cleanly.

use sanalloc::shadow;
use sanalloc::StackTrace;
use std::collections::HashSet;
use std::process::Command;

fn st() -> StackTrace {
    StackTrace::from_pcs(&[0x1000, 0x2000, 0x3000])
}

// ---------------------------------------------------------------------------
// Subprocess plumbing
// ---------------------------------------------------------------------------

fn run_scenario(scenario_name: &str, extra_env: &[(&str, &str)]) -> std::process::Output {
    let exe = std::env::current_exe().expect("cannot determine test binary path");
    let mut cmd = Command::new(&exe);
    cmd.env("SANALLOC_SCENARIO", scenario_name)
        .arg("--exact")
        .arg("scenario_driver")
        .arg("--nocapture")
        .env("RUST_TEST_THREADS", "1");
    for (key, value) in extra_env {
        cmd.env(key, value);
    }
    cmd.output().expect("failed to spawn subprocess")
}

/// The scenario must die (SIGABRT) and leave `expected_msg` on stderr.
fn expect_abort_subprocess(scenario_name: &str, expected_msg: &str) {
    let output = run_scenario(scenario_name, &[]);
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        !output.status.success(),
        "scenario '{}' should have aborted, but exited successfully. stderr:\n{}",
        scenario_name,
        stderr
    );
    assert!(
        stderr.contains(expected_msg),
        "scenario '{}' stderr does not contain '{}'. Full stderr:\n{}",
        scenario_name,
        expected_msg,
        stderr
    );
}

/// The scenario must exit cleanly and leave `expected_msg` on stderr.
fn expect_report_subprocess(scenario_name: &str, expected_msg: &str, extra_env: &[(&str, &str)]) {
    let output = run_scenario(scenario_name, extra_env);
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        output.status.success(),
        "scenario '{}' should have exited cleanly. stderr:\n{}",
        scenario_name,
        stderr
    );
    if !expected_msg.is_empty() {
        assert!(
            stderr.contains(expected_msg),
            "scenario '{}' stderr does not contain '{}'. Full stderr:\n{}",
            scenario_name,
            expected_msg,
            stderr
        );
    }
}

// ---------------------------------------------------------------------------
// Scenario driver: when SANALLOC_SCENARIO is set, run that scenario instead
// of normal test assertions.
// ---------------------------------------------------------------------------

#[test]
fn scenario_driver() {
    let scenario = match std::env::var("SANALLOC_SCENARIO") {
        Ok(s) => s,
        Err(_) => return, // Not a subprocess invocation; skip.
    };

    match scenario.as_str() {
        "double_free" => scenario_double_free(),
        "invalid_free" => scenario_invalid_free(),
        "oversized_malloc" => scenario_oversized_malloc(),
        "calloc_overflow" => scenario_calloc_overflow(),
        "describe_overflow" => scenario_describe_overflow(),
        "describe_use_after_free" => scenario_describe_use_after_free(),
        "quarantine_recycle" => scenario_quarantine_recycle(),
        _ => panic!("unknown scenario: {}", scenario),
    }
}

/// Allocate, free, free again. The second free must abort.
fn scenario_double_free() {
    unsafe {
        let p = sanalloc::malloc(32, &st());
        assert!(!p.is_null());
        sanalloc::free(p, &st());
        sanalloc::free(p, &st());
    }
    unreachable!("double free was not detected");
}

/// Free a stack address: readable memory, but no valid chunk header.
fn scenario_invalid_free() {
    unsafe {
        let mut not_a_heap_block = [0u8; 512];
        sanalloc::free(not_a_heap_block.as_mut_ptr().add(256), &st());
        let _ = not_a_heap_block;
    }
    unreachable!("invalid free was not detected");
}

/// Requests beyond the per-call ceiling abort, not return null.
fn scenario_oversized_malloc() {
    unsafe {
        let p = sanalloc::malloc(usize::MAX / 2, &st());
        let _ = p;
    }
    unreachable!("oversized malloc was not rejected");
}

/// calloc element-count overflow is an out-of-memory condition.
fn scenario_calloc_overflow() {
    unsafe {
        let p = sanalloc::calloc(usize::MAX / 2 + 1, 2, &st());
        let _ = p;
    }
    unreachable!("calloc overflow was not rejected");
}

/// One-past-the-end of a 10-byte region: the report places the address
/// 0 bytes to the right of it.
fn scenario_describe_overflow() {
    unsafe {
        let p = sanalloc::malloc(10, &st());
        // The checker flags the access (the granule's partial byte admits
        // only bytes 8 and 9), and the report localizes it.
        assert!(shadow::check_access(p as usize + 10, 1).is_some());
        sanalloc::describe_heap_address(p as usize + 10, 1);
    }
}

/// Interior pointer of a freed region: the report shows the position, the
/// free site and the allocation site.
fn scenario_describe_use_after_free() {
    unsafe {
        let p = sanalloc::malloc(100, &st());
        sanalloc::free(p, &st());
        assert_eq!(
            shadow::check_access(p as usize + 50, 1),
            Some(shadow::PoisonKind::HeapFreed as u8)
        );
        sanalloc::describe_heap_address(p as usize + 50, 1);
    }
}

/// With a tiny quarantine budget, freed addresses must still survive the
/// FIFO delay before reuse, and reuse must eventually happen.
/// Runs with SANALLOC_QUARANTINE_SIZE=4096 in the environment.
fn scenario_quarantine_recycle() {
    const ROUNDS: usize = 10_000;
    const RECENT: usize = 16;

    unsafe {
        let mut freed: HashSet<usize> = HashSet::new();
        let mut recent: Vec<usize> = Vec::new();
        let mut reused = false;

        for _ in 0..ROUNDS {
            let p = sanalloc::malloc(64, &st()) as usize;
            assert!(
                !recent.contains(&p),
                "an address freed within the last {} frees was recycled",
                RECENT
            );
            if freed.contains(&p) {
                reused = true;
            }
            sanalloc::free(p as *mut u8, &st());
            freed.insert(p);
            recent.push(p);
            if recent.len() > RECENT {
                recent.remove(0);
            }
        }
        assert!(
            reused,
            "no freed address was ever recycled; quarantine is not draining"
        );
    }
}

// ---------------------------------------------------------------------------
// Aborting scenarios
// ---------------------------------------------------------------------------

#[test]
fn double_free_detected() {
    expect_abort_subprocess("double_free", "attempting double-free");
}

#[test]
fn invalid_free_detected() {
    expect_abort_subprocess("invalid_free", "attempting free on address which was not malloc()-ed");
}

#[test]
fn oversized_malloc_aborts() {
    expect_abort_subprocess("oversized_malloc", "failed to allocate");
}

#[test]
fn calloc_overflow_aborts() {
    expect_abort_subprocess("calloc_overflow", "failed to allocate");
}

// ---------------------------------------------------------------------------
// Address description reports
// ---------------------------------------------------------------------------

#[test]
fn describe_reports_heap_overflow_position() {
    expect_report_subprocess(
        "describe_overflow",
        "0 bytes to the right of 10-byte region",
        &[],
    );
}

#[test]
fn describe_reports_use_after_free() {
    let output = run_scenario("describe_use_after_free", &[]);
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(output.status.success(), "scenario failed:\n{}", stderr);
    assert!(
        stderr.contains("50 bytes inside of 100-byte region"),
        "missing position line:\n{}",
        stderr
    );
    assert!(
        stderr.contains("freed by thread"),
        "missing free-site attribution:\n{}",
        stderr
    );
    assert!(
        stderr.contains("previously allocated by thread"),
        "missing alloc-site attribution:\n{}",
        stderr
    );
}

// ---------------------------------------------------------------------------
// Quarantine FIFO law
// ---------------------------------------------------------------------------

#[test]
fn quarantine_delays_and_permits_reuse() {
    expect_report_subprocess(
        "quarantine_recycle",
        "",
        &[("SANALLOC_QUARANTINE_SIZE", "4096")],
    );
}

#[test]
fn quarantine_prevents_immediate_reuse() {
    unsafe {
        let p = sanalloc::malloc(64, &st());
        sanalloc::free(p, &st());
        // The freed chunk sits in the thread-local quarantine; the next
        // allocation must come from elsewhere.
        let q = sanalloc::malloc(64, &st());
        assert_ne!(q, p, "freed chunk was recycled immediately");
        sanalloc::free(q, &st());
    }
}

// ---------------------------------------------------------------------------
// Shadow poisoning as seen by the access checker
// ---------------------------------------------------------------------------

#[test]
fn freed_body_reads_as_freed_poison() {
    unsafe {
        let p = sanalloc::malloc(100, &st()) as usize;
        assert_eq!(shadow::check_access(p, 100), None);
        sanalloc::free(p as *mut u8, &st());
        for offset in [0usize, 1, 50, 99] {
            assert_eq!(
                shadow::check_access(p + offset, 1),
                Some(shadow::PoisonKind::HeapFreed as u8),
                "byte {} of a freed region must carry freed poison",
                offset
            );
        }
    }
}

#[test]
fn partial_right_redzone_encodes_exact_tail() {
    unsafe {
        let p = sanalloc::malloc(10, &st()) as usize;
        // All 10 requested bytes are addressable...
        assert_eq!(shadow::check_access(p, 10), None);
        // ...the granule covering bytes 8..16 admits exactly two...
        assert_eq!(shadow::shadow_byte(p + 8), 2);
        // ...and every byte from 10 up to the rounded size is out of bounds.
        let redzone = sanalloc::config::redzone();
        for offset in 10..redzone {
            assert!(
                shadow::check_access(p + offset, 1).is_some(),
                "byte {} past the requested size must be poisoned",
                offset
            );
        }
        sanalloc::free(p as *mut u8, &st());
    }
}

#[test]
fn left_redzone_is_poisoned() {
    unsafe {
        let p = sanalloc::malloc(32, &st()) as usize;
        assert_eq!(
            shadow::check_access(p - 1, 1),
            Some(shadow::PoisonKind::HeapLeftRedzone as u8)
        );
        sanalloc::free(p as *mut u8, &st());
    }
}
