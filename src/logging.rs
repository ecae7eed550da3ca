//! Logging initialization
//!
//! The embedding application usually installs its own subscriber; this helper
//! exists for binaries and tests that run the stack standalone.

use std::sync::Once;
use tracing_subscriber::{fmt, EnvFilter};

static INIT: Once = Once::new();

/// Install a global `fmt` subscriber filtered by `RUST_LOG`, defaulting to
/// `info`. Safe to call more than once; only the first call takes effect.
pub fn init() {
    init_with_default("info");
}

/// Like [`init`] with an explicit fallback directive for when `RUST_LOG` is
/// unset (e.g. `"warren_stack=debug"`).
pub fn init_with_default(directive: &str) {
    INIT.call_once(|| {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive));
        fmt().with_env_filter(filter).with_target(true).init();
    });
}
