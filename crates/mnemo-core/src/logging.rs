//! Logging Setup
//!
//! One-call tracing initialisation for binaries and the e2e harness. The
//! filter honours `RUST_LOG`, defaulting to `info` for this crate.

use tracing_subscriber::{fmt, EnvFilter};

/// Initialise the global tracing subscriber; safe to call more than once
pub fn init() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,mnemo_core=info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
