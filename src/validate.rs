//! Upload-time validation protecting the shared config store.
//!
//! Configs in the store are read by every agent in the fleet. A config that
//! names a local file (a token file, a client key, a kubeconfig) would make
//! whichever agent owns it read that file off its own host, so such fields are
//! refused unless the operator opts in with `allow_local_file_reads`.

use thiserror::Error;

use crate::instance::config::{
    HttpClientConfig, InstanceConfig, ScrapeConfig, TlsConfig, KNOWN_DISCOVERY_KEYS,
};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{field} is not allowed in {section}: local file reads are disabled")]
    LocalFileRead { section: String, field: String },

    #[error("{mechanism} is not supported in {section}")]
    UnsupportedDiscovery { section: String, mechanism: String },
}

/// Rejects configs that would read local files on the agent that runs them.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConfigValidator {
    allow_local_file_reads: bool,
}

impl ConfigValidator {
    pub fn new(allow_local_file_reads: bool) -> Self {
        Self {
            allow_local_file_reads,
        }
    }

    /// Validate every HTTP-client-like section of `cfg`.
    ///
    /// Discovery mechanisms are checked against an allow-list: an unknown
    /// `*_sd_configs` section fails even when local file reads are allowed,
    /// since its fields cannot be inspected.
    pub fn validate(&self, cfg: &InstanceConfig) -> Result<(), ValidationError> {
        for (i, rw) in cfg.remote_write.iter().enumerate() {
            let section = if rw.name.is_empty() {
                format!("remote_write[{i}]")
            } else {
                format!("remote_write {:?}", rw.name)
            };
            self.check_http_client(&section, &rw.http_client)?;
        }

        for sc in &cfg.scrape_configs {
            self.check_scrape_config(sc)?;
        }

        Ok(())
    }

    fn check_scrape_config(&self, sc: &ScrapeConfig) -> Result<(), ValidationError> {
        let section = format!("scrape config {:?}", sc.job_name);

        for key in sc.unknown_discovery.keys() {
            if key.ends_with("_sd_configs") && !KNOWN_DISCOVERY_KEYS.contains(&key.as_str()) {
                return Err(ValidationError::UnsupportedDiscovery {
                    section,
                    mechanism: key.clone(),
                });
            }
            if key.ends_with("_file") {
                self.deny(&section, key, true)?;
            }
        }

        self.check_http_client(&section, &sc.http_client)?;

        if !sc.file_sd_configs.is_empty() {
            self.deny(&format!("{section} file_sd_configs"), "files", true)?;
        }
        for k8s in &sc.kubernetes_sd_configs {
            let sub = format!("{section} kubernetes_sd_configs");
            self.deny(&sub, "kubeconfig_file", k8s.kubeconfig_file.is_some())?;
            self.check_http_client(&sub, &k8s.http_client)?;
        }
        for consul in &sc.consul_sd_configs {
            self.check_http_client(&format!("{section} consul_sd_configs"), &consul.http_client)?;
        }
        for marathon in &sc.marathon_sd_configs {
            let sub = format!("{section} marathon_sd_configs");
            self.deny(&sub, "auth_token_file", marathon.auth_token_file.is_some())?;
            self.check_http_client(&sub, &marathon.http_client)?;
        }
        for openstack in &sc.openstack_sd_configs {
            self.check_tls(&format!("{section} openstack_sd_configs"), &openstack.tls_config)?;
        }
        for eureka in &sc.eureka_sd_configs {
            self.check_http_client(&format!("{section} eureka_sd_configs"), &eureka.http_client)?;
        }

        Ok(())
    }

    fn check_http_client(&self, section: &str, client: &HttpClientConfig) -> Result<(), ValidationError> {
        self.deny(section, "bearer_token_file", client.bearer_token_file.is_some())?;
        if let Some(basic) = &client.basic_auth {
            self.deny(section, "basic_auth password_file", basic.password_file.is_some())?;
        }
        if let Some(authz) = &client.authorization {
            self.deny(section, "authorization credentials_file", authz.credentials_file.is_some())?;
        }
        if let Some(oauth2) = &client.oauth2 {
            self.deny(section, "oauth2 client_secret_file", oauth2.client_secret_file.is_some())?;
            self.check_tls(&format!("{section} oauth2"), &oauth2.tls_config)?;
        }
        self.check_tls(section, &client.tls_config)
    }

    fn check_tls(&self, section: &str, tls: &TlsConfig) -> Result<(), ValidationError> {
        self.deny(section, "tls_config ca_file", tls.ca_file.is_some())?;
        self.deny(section, "tls_config cert_file", tls.cert_file.is_some())?;
        self.deny(section, "tls_config key_file", tls.key_file.is_some())
    }

    fn deny(&self, section: &str, field: &str, set: bool) -> Result<(), ValidationError> {
        if set && !self.allow_local_file_reads {
            return Err(ValidationError::LocalFileRead {
                section: section.to_string(),
                field: field.to_string(),
            });
        }
        Ok(())
    }
}
