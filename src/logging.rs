use tracing_indicatif::IndicatifLayer;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::{SubscriberInitExt as _, TryInitError};
use tracing_subscriber::{EnvFilter, fmt};

/// Installs a global subscriber printing engine logs to stderr, with one
/// progress bar per running task tree.
///
/// The filter defaults to `info` and can be overridden with `RUST_LOG`.
/// Fails if a global subscriber was already installed.
pub fn init_logging() -> Result<(), TryInitError> {
    let indicatif = IndicatifLayer::new();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_writer(indicatif.get_stderr_writer()))
        .with(indicatif)
        .try_init()
}
