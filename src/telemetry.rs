//! Log output for the CLI. Everything goes to stderr so scheduled runs can
//! redirect it together with the forwarded wget output.

use std::io::IsTerminal;
use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Checked before `RUST_LOG`.
pub const LOG_ENV: &str = "SITE_MIRROR_LOG";
pub const DEFAULT_FILTER: &str = "info,site_mirror=debug";

fn filter() -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Installs the global subscriber. Colours only when stderr is a terminal,
/// so cron mail and redirected logs stay plain.
pub fn init() -> Result<(), TryInitError> {
    let ansi = std::io::stderr().is_terminal();
    tracing_subscriber::registry()
        .with(filter())
        .with(fmt::layer().with_writer(std::io::stderr).with_ansi(ansi))
        .try_init()
}
