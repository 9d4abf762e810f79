//! HTTP API for managing the configs in the shared store.
//!
//! Every response uses the envelope `{"status": "success"|"error", "data": ...}`.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, put},
    Json, Router,
};
use metrics::Counter;
use serde_json::{json, Value};
use tokio::sync::Mutex;

use crate::instance::{GlobalConfig, InstanceConfig};
use crate::observability::MetricsRegistry;
use crate::store::{ConfigStore, StoreError};
use crate::validate::ConfigValidator;

const OPS: &[&str] = &["list", "get", "put", "delete"];
const RESULTS: &[&str] = &["success", "error"];

struct ApiMetrics {
    requests: HashMap<(&'static str, &'static str), Counter>,
}

impl ApiMetrics {
    fn new(registry: &MetricsRegistry) -> Self {
        let mut requests = HashMap::new();
        for op in OPS {
            for result in RESULTS {
                requests.insert(
                    (*op, *result),
                    registry.counter(
                        "agent_config_store_api_requests_total",
                        "Requests served by the config management API",
                        &[("op", op.to_string()), ("result", result.to_string())],
                    ),
                );
            }
        }
        Self { requests }
    }

    fn record(&self, op: &'static str, ok: bool) {
        let result = if ok { "success" } else { "error" };
        if let Some(counter) = self.requests.get(&(op, result)) {
            counter.increment(1);
        }
    }
}

#[derive(Debug)]
enum ApiError {
    BadRequest(String),
    NotFound(String),
    Internal(String),
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotExist { key } => ApiError::NotFound(format!("configuration {key} does not exist")),
            StoreError::Validation(msg) | StoreError::Conflict(msg) => ApiError::BadRequest(msg),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, m),
            ApiError::NotFound(m) => (StatusCode::NOT_FOUND, m),
            ApiError::Internal(m) => (StatusCode::INTERNAL_SERVER_ERROR, m),
        };
        (
            status,
            Json(json!({ "status": "error", "data": { "error": message } })),
        )
            .into_response()
    }
}

fn success(status: StatusCode, data: Value) -> Response {
    (status, Json(json!({ "status": "success", "data": data }))).into_response()
}

/// Config management API over a [`ConfigStore`].
#[derive(Clone)]
pub struct ConfigApi {
    store: Arc<dyn ConfigStore>,
    validator: ConfigValidator,
    global: GlobalConfig,
    // Uniqueness is checked across all stored configs before writing, which is
    // not atomic, so writes go through one at a time.
    put_lock: Arc<Mutex<()>>,
    metrics: Arc<ApiMetrics>,
}

impl ConfigApi {
    pub fn new(
        store: Arc<dyn ConfigStore>,
        validator: ConfigValidator,
        global: GlobalConfig,
        registry: &MetricsRegistry,
    ) -> Self {
        Self {
            store,
            validator,
            global,
            put_lock: Arc::new(Mutex::new(())),
            metrics: Arc::new(ApiMetrics::new(registry)),
        }
    }

    pub fn router(self) -> Router {
        Router::new()
            .route("/configs", get(list_configs))
            .route("/configs/:name", get(get_config))
            .route(
                "/config/:name",
                put(put_config).post(put_config).delete(delete_config),
            )
            .with_state(self)
    }

    /// Validate and store `cfg`. Returns `true` if the config was created.
    pub async fn put(&self, cfg: InstanceConfig) -> Result<bool, StoreError> {
        self.validator
            .validate(&cfg)
            .map_err(|e| StoreError::Validation(e.to_string()))?;
        cfg.clone()
            .apply_defaults(&self.global)
            .map_err(|e| StoreError::Validation(e.to_string()))?;

        let _guard = self.put_lock.lock().await;
        self.check_unique_job_names(&cfg).await?;
        self.store.put(&cfg).await
    }

    async fn check_unique_job_names(&self, cfg: &InstanceConfig) -> Result<(), StoreError> {
        let name = cfg.name.as_str();
        let others = |key: &str| key != name;
        let mut rx = self.store.all(Some(&others)).await?;

        while let Some(other) = rx.recv().await {
            for job in other.job_names() {
                if cfg.job_names().any(|j| j == job) {
                    return Err(StoreError::Conflict(format!(
                        "found multiple scrape configs in config store with job name {job:?}"
                    )));
                }
            }
        }
        Ok(())
    }
}

async fn list_configs(State(api): State<ConfigApi>) -> Result<Response, ApiError> {
    let result = api.store.list().await;
    api.metrics.record("list", result.is_ok());
    let configs = result?;
    Ok(success(StatusCode::OK, json!({ "configs": configs })))
}

async fn get_config(State(api): State<ConfigApi>, Path(name): Path<String>) -> Result<Response, ApiError> {
    let result = api.store.get(&name).await;
    api.metrics.record("get", result.is_ok());
    let cfg = result?;
    Ok(success(StatusCode::OK, json!({ "value": cfg })))
}

async fn put_config(
    State(api): State<ConfigApi>,
    Path(name): Path<String>,
    body: String,
) -> Result<Response, ApiError> {
    let result = decode_config(&name, &body);
    let result = match result {
        Ok(cfg) => api.put(cfg).await.map_err(ApiError::from),
        Err(e) => Err(e),
    };
    api.metrics.record("put", result.is_ok());

    if let Err(e) = &result {
        tracing::debug!(name = %name, error = ?e, "Rejected config write");
    }
    let created = result?;
    tracing::info!(name = %name, created, "Stored config");
    let status = if created { StatusCode::CREATED } else { StatusCode::OK };
    Ok(success(status, json!({})))
}

async fn delete_config(State(api): State<ConfigApi>, Path(name): Path<String>) -> Result<Response, ApiError> {
    let result = api.store.delete(&name).await;
    api.metrics.record("delete", result.is_ok());
    result?;
    tracing::info!(name = %name, "Deleted config");
    Ok(success(StatusCode::OK, json!({})))
}

/// The name in the path is authoritative: an empty body name takes it, a
/// different one is rejected.
fn decode_config(name: &str, body: &str) -> Result<InstanceConfig, ApiError> {
    let mut value: Value =
        serde_json::from_str(body).map_err(|e| ApiError::BadRequest(format!("failed to parse config: {e}")))?;
    if let Value::Object(map) = &mut value {
        map.entry("name").or_insert_with(|| Value::String(name.to_string()));
    }
    let mut cfg: InstanceConfig =
        serde_json::from_value(value).map_err(|e| ApiError::BadRequest(format!("failed to parse config: {e}")))?;

    if cfg.name.is_empty() {
        cfg.name = name.to_string();
    }
    if cfg.name != name {
        return Err(ApiError::BadRequest(format!(
            "config name {:?} does not match path {:?}",
            cfg.name, name
        )));
    }
    Ok(cfg)
}
