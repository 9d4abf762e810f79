//! Logging setup and the Prometheus metrics registry.

mod logging;
mod metrics;

pub use self::logging::init_logging;
pub use self::metrics::MetricsRegistry;
