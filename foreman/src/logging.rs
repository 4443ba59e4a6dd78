//! Operator-facing tracing output.
//!
//! # Separation of Concerns
//!
//! - **Tracing (this module)**: timestamped transitions and diagnostics on
//!   stderr, filtered through `RUST_LOG`.
//!
//! - **Agent logs (`io/process`)**: agent stdout/stderr captured in files under
//!   `.foreman/` and archived with the job. Direct-prompt output is also echoed
//!   to stdout verbatim. Unaffected by `RUST_LOG`.

use tracing_subscriber::fmt::time::ChronoLocal;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Initialize the tracing subscriber.
///
/// Reads `RUST_LOG`. Defaults to `foreman=info`, or `foreman=debug` when
/// `verbose` is set.
///
/// # Example
/// ```bash
/// RUST_LOG=foreman=trace foreman run
/// ```
pub fn init(verbose: bool) {
    let default = if verbose {
        "foreman=debug"
    } else {
        "foreman=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_timer(ChronoLocal::new(TIME_FORMAT.to_string()))
                .compact(),
        )
        .init();
}
