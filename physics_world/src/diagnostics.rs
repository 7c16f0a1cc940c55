//! Diagnostic sink for the physics world
//!
//! Engine trace messages go out at `trace` level under the `physics` target.
//! Debug builds also report failed internal assertions with the expression,
//! file and line; the simulation keeps running afterwards.

use tracing::error;

/// Log a failed internal assertion
pub fn report_assert_failure(expression: &str, message: &str, file: &str, line: u32) {
    error!(
        target: "physics",
        expression,
        file,
        line,
        "Physics assert failed: {message}"
    );
}

/// Check an internal invariant in debug builds and log it if it fails
#[macro_export]
macro_rules! physics_assert {
    ($cond:expr, $($arg:tt)+) => {
        if cfg!(debug_assertions) && !($cond) {
            $crate::diagnostics::report_assert_failure(
                stringify!($cond),
                &format!($($arg)+),
                file!(),
                line!(),
            );
        }
    };
}

/// Emit an engine trace message
#[macro_export]
macro_rules! physics_trace {
    ($($arg:tt)+) => {
        tracing::trace!(target: "physics", $($arg)+)
    };
}
