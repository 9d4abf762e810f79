use tracing_subscriber::EnvFilter;

/// Install the process-wide `fmt` subscriber, filtered by `RUST_LOG` and
/// defaulting to `info`. Only the binary calls this.
pub fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();
}
