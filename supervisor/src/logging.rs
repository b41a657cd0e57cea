//! Tracing setup for the supervisor binary.
//!
//! Diagnostics go to stderr so they never interleave with the status lines
//! and `--json` output written to stdout. The agent's own output is separate:
//! it inherits the terminal or goes to `agent.output_log`.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Install the global subscriber.
///
/// `RUST_LOG` wins when set; otherwise `default_level` applies (e.g. `info`
/// for `run`, `warn` for the one-shot commands). Output is compact, on stderr.
///
/// # Example
/// ```bash
/// RUST_LOG=supervisor=debug supervisor run ./project
/// ```
pub fn init(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    // A second init (e.g. from tests) keeps the first subscriber.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .try_init();
}
