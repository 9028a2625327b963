//! Helpers shared by the tests of every crate in the workspace.
#![warn(missing_docs)]

use std::sync::Once;

pub mod tracing;

static LOG_SETUP: Once = Once::new();

/// Enables debug logging if the `RUST_LOG` environment variable is
/// set. Does nothing if `RUST_LOG` is not set.
pub fn maybe_start_logging() {
    if std::env::var("RUST_LOG").is_ok() {
        start_logging()
    }
}

/// Starts logging to the test writer, honoring `RUST_LOG` filters.
///
/// Safe to call more than once; only the first call installs a subscriber.
pub fn start_logging() {
    use tracing_subscriber::{EnvFilter, FmtSubscriber};

    LOG_SETUP.call_once(|| {
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .finish();

        // another test harness may have won the race to the global default
        let _ = observability_deps::tracing::subscriber::set_global_default(subscriber);
    })
}

/// Asserts that the `Display` form of `$ACTUAL` contains `$EXPECTED`.
#[macro_export]
macro_rules! assert_contains {
    ($ACTUAL: expr, $EXPECTED: expr) => {
        let actual_value: String = $ACTUAL.to_string();
        let expected_value: String = $EXPECTED.to_string();
        assert!(
            actual_value.contains(&expected_value),
            "Can not find expected in actual.\n\nExpected:\n{}\n\nActual:\n{}",
            expected_value,
            actual_value
        );
    };
}

/// Asserts that `$ACTUAL` does not contain `$UNEXPECTED`.
#[macro_export]
macro_rules! assert_not_contains {
    ($ACTUAL: expr, $UNEXPECTED: expr) => {
        let actual_value: String = $ACTUAL.to_string();
        let unexpected_value: String = $UNEXPECTED.to_string();
        assert!(
            !actual_value.contains(&unexpected_value),
            "Found unexpected in actual.\n\nUnexpected:\n{}\n\nActual:\n{}",
            unexpected_value,
            actual_value
        );
    };
}

/// Asserts that a `Result` is an `Err` matching the given pattern.
///
/// ```
/// # use test_helpers::assert_error;
/// let r: Result<(), std::fmt::Error> = Err(std::fmt::Error);
/// assert_error!(r, std::fmt::Error);
/// ```
#[macro_export]
macro_rules! assert_error {
    ($OPERATION: expr, $(|)? $( $ERROR_TYPE:pat_param )|+ $( if $GUARD: expr )? $(,)?) => {
        let err = $OPERATION.unwrap_err();
        assert!(
            matches!(err, $( $ERROR_TYPE )|+ $( if $GUARD )?),
            "Expected {}, but got {:?}",
            stringify!($( $ERROR_TYPE )|+ $( if $GUARD )?),
            err
        );
    };
}
