//! Common test utilities for warden-conform tests
#![cfg_attr(
    test,
    allow(
        dead_code,
        clippy::expect_used,
        clippy::unwrap_used,
        clippy::panic,
        clippy::missing_panics_doc,
        clippy::missing_errors_doc,
        clippy::tests_outside_test_module,
        reason = "Test allows"
    )
)]

use std::env;
use std::sync::Once;
use tracing_subscriber::{EnvFilter, fmt};

static TRACING_INIT: Once = Once::new();

/// Initialize tracing for tests (idempotent).
/// Honors `RUST_LOG` if set, otherwise defaults to "debug".
pub fn init_tracing() {
    TRACING_INIT.call_once(|| {
        let filter = env::var("RUST_LOG").unwrap_or_else(|_| "debug".to_string());
        // Consume the result to avoid must_use warnings; if already initialized, ignore error
        if fmt()
            .with_env_filter(EnvFilter::new(filter))
            .with_test_writer()
            .try_init()
            .is_err()
        {
            // tracing already initialized in this process
        }
    });
}
