//! Prometheus metrics.
//!
//! Metrics tracked:
//! - `agent_scraping_service_reshard_duration_seconds{success}` - duration of full reconciliations
//! - `agent_scraping_service_tracked_configs` - configs currently running on this node
//! - `agent_scraping_service_config_events_total{action}` - per-key reconciliation decisions
//! - `agent_cluster_peer_notifications_total{result}` - reshard notifications sent to peers
//! - `agent_config_store_api_requests_total{op,result}` - config API requests

use std::sync::Arc;

use metrics::{Counter, Gauge, Histogram, Key, Label, Level, Metadata, Recorder, SharedString, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusRecorder};

/// A metrics registry owned by the process rather than installed globally.
///
/// Components register their handles at construction; `/metrics` renders the
/// registry in the Prometheus text format.
#[derive(Clone)]
pub struct MetricsRegistry {
    recorder: Arc<PrometheusRecorder>,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            recorder: Arc::new(PrometheusBuilder::new().build_recorder()),
        }
    }

    pub fn counter(&self, name: &'static str, help: &'static str, labels: &[(&'static str, String)]) -> Counter {
        self.recorder
            .describe_counter(name.into(), None, SharedString::const_str(help));
        self.recorder
            .register_counter(&Self::key(name, labels), &Self::metadata())
    }

    pub fn gauge(&self, name: &'static str, help: &'static str, labels: &[(&'static str, String)]) -> Gauge {
        self.recorder
            .describe_gauge(name.into(), None, SharedString::const_str(help));
        self.recorder
            .register_gauge(&Self::key(name, labels), &Self::metadata())
    }

    pub fn histogram(&self, name: &'static str, help: &'static str, labels: &[(&'static str, String)]) -> Histogram {
        self.recorder
            .describe_histogram(name.into(), Some(Unit::Seconds), SharedString::const_str(help));
        self.recorder
            .register_histogram(&Self::key(name, labels), &Self::metadata())
    }

    /// Render every registered metric in the Prometheus text format.
    pub fn render(&self) -> String {
        self.recorder.handle().render()
    }

    fn key(name: &'static str, labels: &[(&'static str, String)]) -> Key {
        let labels: Vec<Label> = labels
            .iter()
            .map(|(k, v)| Label::new(*k, v.clone()))
            .collect();
        Key::from_parts(name, labels)
    }

    fn metadata() -> Metadata<'static> {
        Metadata::new(module_path!(), Level::INFO, Some(module_path!()))
    }
}
