#![forbid(unsafe_code)]

//! FrankenSundials runtime: machine constants, tolerance assertion helpers,
//! and structured test logging shared by every crate in the workspace.
//!
//! ## Module layout
//!
//! | Module    | Contents                                                  |
//! |-----------|-----------------------------------------------------------|
//! | (root)    | [`BIG_REAL`], [`UNIT_ROUNDOFF`], `assert_close*` helpers  |
//! | `testlog` | [`TestLogEntry`] JSONL entries for forensic test replay   |

pub mod testlog;

pub use testlog::{TestLogEntry, TestLogLevel, TestResult};

/// Largest representable real value, as reported by the solver engine.
pub const BIG_REAL: f64 = f64::MAX;

/// Unit roundoff of the engine's real type (difference between 1.0 and the
/// next larger representable value).
pub const UNIT_ROUNDOFF: f64 = f64::EPSILON;

/// Assert two f64 values are close within combined absolute and relative tolerance.
///
/// Uses the formula: |actual - expected| <= atol + rtol * |expected|
pub fn assert_close(actual: f64, expected: f64, atol: f64, rtol: f64) {
    let tol = atol + rtol * expected.abs();
    assert!(
        (actual - expected).abs() <= tol,
        "assert_close failed: actual={actual} expected={expected} diff={} tol={tol} (atol={atol}, rtol={rtol})",
        (actual - expected).abs()
    );
}

/// Assert two f64 slices are element-wise close within tolerance.
pub fn assert_close_slice(actual: &[f64], expected: &[f64], atol: f64, rtol: f64) {
    assert_eq!(
        actual.len(),
        expected.len(),
        "assert_close_slice: length mismatch: actual={} expected={}",
        actual.len(),
        expected.len()
    );
    for (idx, (a, e)) in actual.iter().zip(expected.iter()).enumerate() {
        let tol = atol + rtol * e.abs();
        assert!(
            (a - e).abs() <= tol,
            "assert_close_slice[{idx}]: actual={a} expected={e} diff={} tol={tol} (atol={atol}, rtol={rtol})",
            (a - e).abs()
        );
    }
}

/// Check if a value is within absolute/relative tolerance of expected.
#[must_use]
pub fn within_tolerance(actual: f64, expected: f64, atol: f64, rtol: f64) -> bool {
    let tol = atol + rtol * expected.abs();
    (actual - expected).abs() <= tol
}
