//! Data model for a single collection config.
//!
//! An [`InstanceConfig`] is the unit stored in the shared config store and
//! sharded across agents. Its shape follows the Prometheus scrape and
//! remote-write sections closely enough that the validator can reason about
//! every field that may point at a local file.

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cluster::ring::key_hash;
use crate::instance::InstanceError;

/// Discovery sections recognised inside a scrape config. Anything else ending
/// in `_sd_configs` is captured in [`ScrapeConfig::unknown_discovery`].
pub const KNOWN_DISCOVERY_KEYS: &[&str] = &[
    "static_configs",
    "dns_sd_configs",
    "file_sd_configs",
    "kubernetes_sd_configs",
    "consul_sd_configs",
    "ec2_sd_configs",
    "marathon_sd_configs",
    "openstack_sd_configs",
    "eureka_sd_configs",
];

/// Settings shared by every config on an agent, used to fill in defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalConfig {
    pub scrape_interval: Duration,
    pub scrape_timeout: Duration,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            scrape_interval: Duration::from_secs(60),
            scrape_timeout: Duration::from_secs(10),
        }
    }
}

/// A named collection job: scrape rules plus where to upload the samples.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceConfig {
    pub name: String,
    #[serde(default)]
    pub host_filter: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scrape_configs: Vec<ScrapeConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub remote_write: Vec<RemoteWriteConfig>,
    #[serde(default = "default_wal_truncate_frequency_secs")]
    pub wal_truncate_frequency_secs: u64,
    #[serde(default = "default_remote_flush_deadline_secs")]
    pub remote_flush_deadline_secs: u64,
    #[serde(default)]
    pub write_stale_on_shutdown: bool,
}

fn default_wal_truncate_frequency_secs() -> u64 {
    60
}

fn default_remote_flush_deadline_secs() -> u64 {
    60
}

/// One scrape job inside a config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrapeConfig {
    pub job_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scrape_interval_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scrape_timeout_secs: Option<u64>,
    #[serde(default = "default_metrics_path")]
    pub metrics_path: String,
    #[serde(default = "default_scheme")]
    pub scheme: String,
    #[serde(flatten)]
    pub http_client: HttpClientConfig,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub static_configs: Vec<StaticConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dns_sd_configs: Vec<DnsSdConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub file_sd_configs: Vec<FileSdConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub kubernetes_sd_configs: Vec<KubernetesSdConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub consul_sd_configs: Vec<ConsulSdConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ec2_sd_configs: Vec<Ec2SdConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub marathon_sd_configs: Vec<MarathonSdConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub openstack_sd_configs: Vec<OpenstackSdConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub eureka_sd_configs: Vec<EurekaSdConfig>,
    /// Keys this agent does not understand, kept verbatim. Unknown
    /// `*_sd_configs` sections are refused by the validator.
    #[serde(flatten)]
    pub unknown_discovery: BTreeMap<String, serde_json::Value>,
}

fn default_metrics_path() -> String {
    "/metrics".to_string()
}

fn default_scheme() -> String {
    "http".to_string()
}

impl ScrapeConfig {
    pub fn new(job_name: impl Into<String>) -> Self {
        Self {
            job_name: job_name.into(),
            scrape_interval_secs: None,
            scrape_timeout_secs: None,
            metrics_path: default_metrics_path(),
            scheme: default_scheme(),
            http_client: HttpClientConfig::default(),
            static_configs: Vec::new(),
            dns_sd_configs: Vec::new(),
            file_sd_configs: Vec::new(),
            kubernetes_sd_configs: Vec::new(),
            consul_sd_configs: Vec::new(),
            ec2_sd_configs: Vec::new(),
            marathon_sd_configs: Vec::new(),
            openstack_sd_configs: Vec::new(),
            eureka_sd_configs: Vec::new(),
            unknown_discovery: BTreeMap::new(),
        }
    }

    pub fn with_static_targets(mut self, targets: &[&str]) -> Self {
        self.static_configs.push(StaticConfig {
            targets: targets.iter().map(|t| t.to_string()).collect(),
            labels: BTreeMap::new(),
        });
        self
    }
}

/// Upload target for collected samples.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteWriteConfig {
    pub url: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default = "default_remote_timeout_secs")]
    pub remote_timeout_secs: u64,
    #[serde(flatten)]
    pub http_client: HttpClientConfig,
}

fn default_remote_timeout_secs() -> u64 {
    30
}

impl RemoteWriteConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            name: String::new(),
            remote_timeout_secs: default_remote_timeout_secs(),
            http_client: HttpClientConfig::default(),
        }
    }
}

/// Credentials and transport settings for an outbound HTTP client.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpClientConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bearer_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bearer_token_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub basic_auth: Option<BasicAuth>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authorization: Option<Authorization>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oauth2: Option<OAuth2>,
    #[serde(default, skip_serializing_if = "TlsConfig::is_empty")]
    pub tls_config: TlsConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_url: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BasicAuth {
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_file: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Authorization {
    #[serde(rename = "type", default = "default_authorization_type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials_file: Option<String>,
}

fn default_authorization_type() -> String {
    "Bearer".to_string()
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuth2 {
    pub client_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret_file: Option<String>,
    pub token_url: String,
    #[serde(default, skip_serializing_if = "TlsConfig::is_empty")]
    pub tls_config: TlsConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,
    #[serde(default)]
    pub insecure_skip_verify: bool,
}

impl TlsConfig {
    pub fn is_empty(&self) -> bool {
        *self == TlsConfig::default()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticConfig {
    pub targets: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsSdConfig {
    pub names: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSdConfig {
    pub files: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KubernetesSdConfig {
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_server: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubeconfig_file: Option<String>,
    #[serde(flatten)]
    pub http_client: HttpClientConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsulSdConfig {
    pub server: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(flatten)]
    pub http_client: HttpClientConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ec2SdConfig {
    pub region: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarathonSdConfig {
    pub servers: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token_file: Option<String>,
    #[serde(flatten)]
    pub http_client: HttpClientConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenstackSdConfig {
    pub region: String,
    pub role: String,
    #[serde(default, skip_serializing_if = "TlsConfig::is_empty")]
    pub tls_config: TlsConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EurekaSdConfig {
    pub server: String,
    #[serde(flatten)]
    pub http_client: HttpClientConfig,
}

impl InstanceConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            host_filter: false,
            scrape_configs: Vec::new(),
            remote_write: Vec::new(),
            wal_truncate_frequency_secs: default_wal_truncate_frequency_secs(),
            remote_flush_deadline_secs: default_remote_flush_deadline_secs(),
            write_stale_on_shutdown: false,
        }
    }

    pub fn with_scrape_config(mut self, sc: ScrapeConfig) -> Self {
        self.scrape_configs.push(sc);
        self
    }

    pub fn with_remote_write(mut self, rw: RemoteWriteConfig) -> Self {
        self.remote_write.push(rw);
        self
    }

    /// Every externally visible job name declared by this config.
    pub fn job_names(&self) -> impl Iterator<Item = &str> {
        self.scrape_configs.iter().map(|sc| sc.job_name.as_str())
    }

    /// Fill in unset values from `global` and check the config is runnable.
    ///
    /// Configs in the store are validated at upload time, but the globals of
    /// the agent reading them may have changed since, so this runs again
    /// before every apply.
    pub fn apply_defaults(&mut self, global: &GlobalConfig) -> Result<(), InstanceError> {
        if self.name.is_empty() {
            return Err(InstanceError::Invalid("missing instance name".to_string()));
        }
        if self.wal_truncate_frequency_secs == 0 {
            return Err(InstanceError::Invalid(
                "wal_truncate_frequency must be greater than 0s".to_string(),
            ));
        }
        if self.remote_flush_deadline_secs == 0 {
            return Err(InstanceError::Invalid(
                "remote_flush_deadline must be greater than 0s".to_string(),
            ));
        }

        let wal_truncate = Duration::from_secs(self.wal_truncate_frequency_secs);
        let mut job_names = HashSet::new();
        for sc in &mut self.scrape_configs {
            let interval = *sc
                .scrape_interval_secs
                .get_or_insert(global.scrape_interval.as_secs());

            if let Some(timeout) = sc.scrape_timeout_secs {
                if timeout > interval {
                    return Err(InstanceError::Invalid(format!(
                        "scrape timeout greater than scrape interval for scrape config with job name {:?}",
                        sc.job_name
                    )));
                }
            }
            if Duration::from_secs(interval) > wal_truncate {
                return Err(InstanceError::Invalid(format!(
                    "scrape interval greater than wal_truncate_frequency for scrape config with job name {:?}",
                    sc.job_name
                )));
            }
            if sc.scrape_timeout_secs.is_none() {
                sc.scrape_timeout_secs = Some(interval.min(global.scrape_timeout.as_secs()));
            }

            if !job_names.insert(sc.job_name.clone()) {
                return Err(InstanceError::Invalid(format!(
                    "found multiple scrape configs with job name {:?}",
                    sc.job_name
                )));
            }
        }

        let mut rw_names = HashSet::new();
        for rw in &mut self.remote_write {
            let mut generated = false;
            if rw.name.is_empty() {
                // Unnamed remote_writes need a stable unique name so their
                // queue metrics can be told apart across configs.
                rw.name = format!("{}-{}", self.name, &remote_write_hash(rw)[..6]);
                generated = true;
            }
            if !rw_names.insert(rw.name.clone()) {
                return Err(InstanceError::Invalid(if generated {
                    "found two identical remote_write configs".to_string()
                } else {
                    format!("found duplicate remote write configs with name {:?}", rw.name)
                }));
            }
        }

        Ok(())
    }
}

/// Hex FNV-1a of the section's JSON, identical on every agent.
fn remote_write_hash(rw: &RemoteWriteConfig) -> String {
    let raw = serde_json::to_string(rw).unwrap_or_else(|_| rw.url.clone());
    format!("{:08x}", key_hash(&raw))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> InstanceConfig {
        InstanceConfig::new("team-a")
            .with_scrape_config(ScrapeConfig::new("node").with_static_targets(&["localhost:9100"]))
            .with_remote_write(RemoteWriteConfig::new("http://cortex/api/v1/push"))
    }

    #[test]
    fn apply_defaults_fills_scrape_settings() {
        let mut cfg = sample();
        cfg.apply_defaults(&GlobalConfig::default()).unwrap();

        let sc = &cfg.scrape_configs[0];
        assert_eq!(sc.scrape_interval_secs, Some(60));
        assert_eq!(sc.scrape_timeout_secs, Some(10));
        assert!(cfg.remote_write[0].name.starts_with("team-a-"));
        assert_eq!(cfg.remote_write[0].name.len(), "team-a-".len() + 6);
    }

    #[test]
    fn apply_defaults_clamps_timeout_to_interval() {
        let mut cfg = sample();
        cfg.scrape_configs[0].scrape_interval_secs = Some(5);
        cfg.apply_defaults(&GlobalConfig::default()).unwrap();
        assert_eq!(cfg.scrape_configs[0].scrape_timeout_secs, Some(5));
    }

    #[test]
    fn apply_defaults_rejects_missing_name() {
        let mut cfg = sample();
        cfg.name.clear();
        let err = cfg.apply_defaults(&GlobalConfig::default()).unwrap_err();
        assert!(err.to_string().contains("missing instance name"));
    }

    #[test]
    fn apply_defaults_rejects_duplicate_job_names() {
        let mut cfg = sample().with_scrape_config(ScrapeConfig::new("node"));
        let err = cfg.apply_defaults(&GlobalConfig::default()).unwrap_err();
        assert!(err.to_string().contains("multiple scrape configs"));
    }

    #[test]
    fn apply_defaults_rejects_timeout_above_interval() {
        let mut cfg = sample();
        cfg.scrape_configs[0].scrape_interval_secs = Some(10);
        cfg.scrape_configs[0].scrape_timeout_secs = Some(20);
        assert!(cfg.apply_defaults(&GlobalConfig::default()).is_err());
    }

    #[test]
    fn apply_defaults_rejects_interval_above_wal_truncation() {
        let mut cfg = sample();
        cfg.wal_truncate_frequency_secs = 30;
        assert!(cfg.apply_defaults(&GlobalConfig::default()).is_err());
    }

    #[test]
    fn apply_defaults_rejects_identical_unnamed_remote_writes() {
        let mut cfg = sample().with_remote_write(RemoteWriteConfig::new("http://cortex/api/v1/push"));
        let err = cfg.apply_defaults(&GlobalConfig::default()).unwrap_err();
        assert!(err.to_string().contains("identical remote_write"));
    }

    #[test]
    fn unknown_discovery_sections_are_preserved() {
        let raw = r#"{
            "name": "x",
            "scrape_configs": [{
                "job_name": "j",
                "nomad_sd_configs": [{"server": "http://nomad"}]
            }]
        }"#;
        let cfg: InstanceConfig = serde_json::from_str(raw).unwrap();
        let sc = &cfg.scrape_configs[0];
        assert!(sc.unknown_discovery.contains_key("nomad_sd_configs"));
        assert_eq!(sc.metrics_path, "/metrics");
    }

    #[test]
    fn json_round_trip_keeps_secrets() {
        let mut cfg = sample();
        cfg.remote_write[0].http_client.basic_auth = Some(BasicAuth {
            username: "user".to_string(),
            password: Some("hunter2".to_string()),
            password_file: None,
        });
        let raw = serde_json::to_string(&cfg).unwrap();
        let back: InstanceConfig = serde_json::from_str(&raw).unwrap();
        assert_eq!(cfg, back);
    }
}
