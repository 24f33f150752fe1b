//! Configuration module
//!
//! YAML configuration for the two agents. The core consumes the parsed
//! structures; nothing below touches the network.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;
use tokio::fs;

/// Reserved proxy name meaning "no proxy"
pub const DIRECT: &str = "DIRECT";

/// Client agent configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Local HTTP proxy listen address
    #[serde(default = "default_client_listen")]
    pub listen: String,

    pub username: String,

    /// Access token presented as the Basic password
    #[serde(default)]
    pub token: String,

    /// Enables the background token refresh loop when set
    #[serde(default, rename = "refresh-token")]
    pub refresh_token: Option<String>,

    /// Host of the auth backend (defaults to the first proxy host)
    #[serde(default, rename = "auth-host")]
    pub auth_host: Option<String>,

    #[serde(default = "default_auth_base_path", rename = "auth-base-path")]
    pub auth_base_path: String,

    pub proxies: Vec<ProxyConfig>,

    #[serde(default)]
    pub rules: Vec<RuleConfig>,

    #[serde(default, rename = "unmatched-policy")]
    pub unmatched_policy: UnmatchedPolicyConfig,

    #[serde(default = "default_latency_interval", rename = "latency-test-interval-secs")]
    pub latency_test_interval_secs: u64,

    #[serde(default = "default_first_read_timeout", rename = "first-read-timeout-ms")]
    pub first_read_timeout_ms: u64,

    #[serde(default, rename = "skip-cert-verify")]
    pub skip_cert_verify: bool,

    #[serde(default, rename = "log-level")]
    pub log_level: Option<String>,
}

/// A named pool of remote proxy hosts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub name: String,

    /// `host` or `host:port` (port defaults to 443)
    pub hosts: Vec<String>,

    #[serde(default, rename = "select-policy")]
    pub select_policy: SelectPolicy,
}

/// Host selection policy of a proxy pool
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SelectPolicy {
    Random,
    Latency,
    #[default]
    RandomOnSimilarLowestLatency,
}

/// Routes a set of domain suffixes to a proxy (or `DIRECT`)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleConfig {
    #[serde(rename = "proxy-name")]
    pub proxy_name: String,
    pub domains: Vec<String>,
}

/// What to do with domains no rule matches
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnmatchedPolicyConfig {
    #[serde(rename = "proxy-name")]
    pub proxy_name: String,

    /// Race direct against the proxy instead of proxying outright
    #[serde(default)]
    pub detect: bool,

    #[serde(default = "default_detect_delay", rename = "detect-delay-ms")]
    pub detect_delay_ms: u64,

    #[serde(default = "default_detect_expires", rename = "detect-expires-second")]
    pub detect_expires_second: u64,
}

impl Default for UnmatchedPolicyConfig {
    fn default() -> Self {
        UnmatchedPolicyConfig {
            proxy_name: DIRECT.to_string(),
            detect: false,
            detect_delay_ms: default_detect_delay(),
            detect_expires_second: default_detect_expires(),
        }
    }
}

fn default_client_listen() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_server_listen() -> String {
    "0.0.0.0:443".to_string()
}

fn default_auth_base_path() -> String {
    "/auth/".to_string()
}

fn default_latency_interval() -> u64 {
    60
}

fn default_first_read_timeout() -> u64 {
    10_000
}

fn default_detect_delay() -> u64 {
    50
}

fn default_detect_expires() -> u64 {
    3600
}

impl ClientConfig {
    /// Load configuration from file (synchronous)
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from file (async)
    pub async fn load_async<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path).await?;
        Self::from_str(&content)
    }

    /// Load from string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self> {
        let config: ClientConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.username.is_empty() {
            return Err(Error::config("username is required"));
        }
        if self.token.is_empty() && self.refresh_token.is_none() {
            return Err(Error::config("either token or refresh-token is required"));
        }
        if self.proxies.is_empty() {
            return Err(Error::config("at least one proxy is required"));
        }
        validate_base_path(&self.auth_base_path)?;

        let mut names = HashSet::new();
        for proxy in &self.proxies {
            proxy.validate()?;
            if !names.insert(proxy.name.as_str()) {
                return Err(Error::config(format!("duplicate proxy name: {}", proxy.name)));
            }
        }

        let known = |name: &str| name == DIRECT || names.contains(name);
        for (idx, rule) in self.rules.iter().enumerate() {
            if !known(&rule.proxy_name) {
                return Err(Error::config(format!(
                    "rule {} references unknown proxy: {}",
                    idx, rule.proxy_name
                )));
            }
            if rule.domains.is_empty() {
                return Err(Error::config(format!("rule {} has no domains", idx)));
            }
        }

        if !known(&self.unmatched_policy.proxy_name) {
            return Err(Error::config(format!(
                "unmatched-policy references unknown proxy: {}",
                self.unmatched_policy.proxy_name
            )));
        }
        if self.latency_test_interval_secs == 0 {
            return Err(Error::config("latency-test-interval-secs must be positive"));
        }

        Ok(())
    }

    pub fn latency_test_interval(&self) -> Duration {
        Duration::from_secs(self.latency_test_interval_secs)
    }

    pub fn first_read_timeout(&self) -> Duration {
        Duration::from_millis(self.first_read_timeout_ms)
    }
}

impl ProxyConfig {
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::config("proxy name is required"));
        }
        if self.name == DIRECT {
            return Err(Error::config("DIRECT is a reserved proxy name"));
        }
        if self.hosts.is_empty() {
            return Err(Error::config(format!("proxy {} has no hosts", self.name)));
        }
        for host in &self.hosts {
            crate::common::Target::from_authority(host)
                .map_err(|e| Error::config(format!("proxy {}: {}", self.name, e)))?;
        }
        Ok(())
    }
}

impl UnmatchedPolicyConfig {
    pub fn detect_delay(&self) -> Duration {
        Duration::from_millis(self.detect_delay_ms)
    }

    pub fn detect_expires(&self) -> Duration {
        Duration::from_secs(self.detect_expires_second)
    }
}

/// Server agent configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_server_listen")]
    pub listen: String,

    #[serde(rename = "cert-file")]
    pub cert_file: String,

    #[serde(rename = "key-file")]
    pub key_file: String,

    /// Static credentials: username -> token
    #[serde(default)]
    pub auth: HashMap<String, String>,

    #[serde(default = "default_auth_base_path", rename = "auth-base-path")]
    pub auth_base_path: String,

    /// Public hostname, used in the `Proxy-Authenticate` realm
    #[serde(default)]
    pub hostname: Option<String>,

    #[serde(default, rename = "log-level")]
    pub log_level: Option<String>,
}

impl ServerConfig {
    /// Load configuration from file (synchronous)
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load from string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self> {
        let config: ServerConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.cert_file.is_empty() || self.key_file.is_empty() {
            return Err(Error::config("cert-file and key-file are required"));
        }
        validate_base_path(&self.auth_base_path)?;
        if self.auth.keys().any(|user| user.is_empty()) {
            return Err(Error::config("empty username in auth"));
        }
        Ok(())
    }
}

fn validate_base_path(path: &str) -> Result<()> {
    if !path.starts_with('/') || !path.ends_with('/') {
        return Err(Error::config(format!(
            "auth-base-path must start and end with '/': {}",
            path
        )));
    }
    Ok(())
}
