use anyhow::Result;
use tracing_subscriber::EnvFilter;

/// Installs the process-wide tracing subscriber, filtered by `RUST_LOG`
/// (default `info`). Returns an error if a subscriber is already set.
pub fn init() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .map_err(|e| anyhow::anyhow!("install tracing subscriber: {e}"))
}
