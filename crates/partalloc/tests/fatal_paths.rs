//! Fatal-path verification: operations that must stop the process.
//!
//! Corruption and misuse are unrecoverable by design, so these paths abort
//! rather than return an error. Tests that expect an abort run the test
//! binary as a subprocess: the child reads a scenario name from the
//! environment, runs it, and dies; the parent asserts the exit was abnormal
//! and the diagnostic reached stderr.

use partalloc::{PartitionOptions, PartitionRoot};

const SCENARIO_VAR: &str = "PARTALLOC_FATAL_SCENARIO";

/// Run the current test binary with `SCENARIO_VAR` set to `scenario_name`.
/// The child detects the variable in `scenario_driver` and runs the
/// scenario, which must kill the process.
///
/// Verified:
/// 1. The child did not exit successfully.
/// 2. The child's stderr contains `expected_msg`.
fn expect_abort_subprocess(scenario_name: &str, expected_msg: &str) {
    let exe = std::env::current_exe().expect("cannot determine test binary path");

    let output = std::process::Command::new(&exe)
        .env(SCENARIO_VAR, scenario_name)
        .arg("--exact")
        .arg("scenario_driver")
        .arg("--nocapture")
        .env("RUST_TEST_THREADS", "1")
        .output()
        .expect("failed to spawn subprocess");

    let stderr = String::from_utf8_lossy(&output.stderr);

    assert!(
        !output.status.success(),
        "subprocess for scenario '{}' should have died, but exited \
         successfully. stderr:\n{}",
        scenario_name,
        stderr
    );
    assert!(
        stderr.contains(expected_msg),
        "subprocess for scenario '{}' stderr does not contain '{}'. \
         Full stderr:\n{}",
        scenario_name,
        expected_msg,
        stderr
    );
}

// ---------------------------------------------------------------------------
// Scenario driver: when the env var is set, this "test" runs the requested
// scenario instead of asserting anything.
// ---------------------------------------------------------------------------

#[test]
fn scenario_driver() {
    let scenario = match std::env::var(SCENARIO_VAR) {
        Ok(s) => s,
        Err(_) => return, // Not a subprocess invocation; skip.
    };

    match scenario.as_str() {
        "oversized_request" => scenario_oversized_request(),
        "double_free" => scenario_double_free(),
        "cookie_corruption" => scenario_cookie_corruption(),
        "foreign_pointer_free" => scenario_foreign_pointer_free(),
        "leak_on_drop" => scenario_leak_on_drop(),
        _ => panic!("unknown scenario: {scenario}"),
    }
}

/// Scenario: a request above the direct-map ceiling without `RETURN_NULL`.
fn scenario_oversized_request() {
    let root = PartitionRoot::new(PartitionOptions::default());
    let _ = root.alloc((1usize << 30) + 1, None);
    unreachable!("oversized request was not fatal");
}

/// Scenario: allocate, free, free again on a hardened root.
fn scenario_double_free() {
    let root = PartitionRoot::new(PartitionOptions {
        ref_count: true,
        ..PartitionOptions::default()
    });
    let p = root.alloc(64, None);
    assert!(!p.is_null());
    root.free(p);
    root.free(p);
    unreachable!("double free was not detected");
}

/// Scenario: overflow the payload by one byte into the trailing cookie,
/// then free.
fn scenario_cookie_corruption() {
    let root = PartitionRoot::new(PartitionOptions {
        cookie: true,
        ..PartitionOptions::default()
    });
    let p = root.alloc(64, None);
    assert!(!p.is_null());
    let usable = root.get_usable_size(p);
    unsafe { p.add(usable).write(0x00) };
    root.free(p);
    unreachable!("cookie corruption was not detected");
}

/// Scenario: free a stack address that no partition ever handed out.
fn scenario_foreign_pointer_free() {
    let root = PartitionRoot::new(PartitionOptions::default());
    let mut local: u64 = 0xDEAD;
    root.free(&mut local as *mut u64 as *mut u8);
    unreachable!("foreign pointer free was not detected");
}

/// Scenario: drop a cache-less root with an allocation still live.
/// Only fatal in debug builds; release builds log and carry on.
fn scenario_leak_on_drop() {
    let root = PartitionRoot::new(PartitionOptions::default());
    let p = root.alloc(64, None);
    assert!(!p.is_null());
    drop(root);
    // Release builds reach this; the gated test below never runs them.
    std::process::abort();
}

// ---------------------------------------------------------------------------
// The fatal paths, one subprocess each.
// ---------------------------------------------------------------------------

#[test]
fn oversized_request_without_return_null_is_fatal() {
    expect_abort_subprocess("oversized_request", "request beyond maximum size");
}

#[test]
fn double_free_detected() {
    expect_abort_subprocess("double_free", "double free detected");
}

#[test]
fn cookie_corruption_detected() {
    expect_abort_subprocess("cookie_corruption", "cookie check failed");
}

#[test]
fn foreign_pointer_free_detected() {
    expect_abort_subprocess("foreign_pointer_free", "free of foreign pointer");
}

#[test]
#[cfg(debug_assertions)]
fn leaked_allocation_detected_on_drop() {
    expect_abort_subprocess("leak_on_drop", "bytes still allocated");
}
