//! Log output for the CLI.
//!
//! Logs go to stderr so documents written to stdout stay machine-readable.
//! `RUST_LOG` wins when set; otherwise `info` (or `debug` with `--verbose`)
//! for this crate and `warn` for dependencies.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub fn default_directive(verbose: bool) -> &'static str {
    if verbose {
        "warn,azdo_harness=debug,azdo=debug"
    } else {
        "warn,azdo_harness=info,azdo=info"
    }
}

/// Install the global subscriber. Calling it twice is harmless.
pub fn init(verbose: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbose)));

    let fmt_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact();

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init();
}
