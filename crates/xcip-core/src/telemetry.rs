//! Tracing initialisation for XCIP binaries.
//!
//! The subscriber carries the lifecycle events from [`crate::obs`]. Each has
//! an `event` field in one of the `manifest.*`, `plan.*`, `run.*` or
//! `waveform.*` families. Traffic runs nest their events, including
//! comm debug lines, under an `xcip.run` span holding `run_id` and `device`.
//!
//! Log lines go to stderr. Stdout is left to validation summaries, plans and
//! layouts. `RUST_LOG` overrides the level picked by `--verbose`, e.g.
//! `RUST_LOG=xcip_core::comm=debug` for comm retries and teardown.
//! Only the first call installs a subscriber; later calls are ignored.

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Install the global subscriber.
///
/// * `json`: newline-delimited JSON log lines instead of text.
/// * `level`: verbosity used when `RUST_LOG` is not set.
pub fn init_tracing(json: bool, level: Level) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_writer(std::io::stderr)
                    .json(),
            )
            .try_init()
            .ok();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .try_init()
            .ok();
    }
}
