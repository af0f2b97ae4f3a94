//! Development-time tracing for debugging forge.
//!
//! # Separation of Concerns
//!
//! - **Tracing (this module)**: Dev diagnostics via `RUST_LOG`, output to stderr.
//!   Not persisted, not part of forge product output.
//!
//! - **Product artifacts**: the interaction store, spec artifacts under
//!   `.forge/specs/`, and `.forge/events.jsonl`. Always written, unaffected by
//!   `RUST_LOG`.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber for development logging.
///
/// Reads `RUST_LOG`; defaults to `warn`. Output: stderr, compact format.
/// Calling it twice is harmless: the second subscriber is not installed.
///
/// # Example
/// ```bash
/// RUST_LOG=forge=debug forge run --prd prd.json
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .try_init();
}
