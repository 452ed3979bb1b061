//! Declarative policy document
//!
//! Parses the YAML configuration document that drives the proxy: listener
//! parameters, upstream targets, and security policy. Unknown fields are
//! ignored; an invalid regex or a malformed target URL rejects the whole
//! document so a bad reload never reaches the pipeline.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{ProxyError, Result};
use crate::rules::{RuleEngine, RuleLocation};

/// Root of the configuration document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub security: SecurityConfig,
}

/// Listener parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: String,
    #[serde(default = "default_read_timeout", with = "duration_str")]
    pub read_timeout: Duration,
    #[serde(default = "default_write_timeout", with = "duration_str")]
    pub write_timeout: Duration,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_file: Option<String>,
    /// Port for the observability sidecar (dashboard, stats API, metrics)
    #[serde(default = "default_stats_port")]
    pub stats_port: u16,
}

/// Upstream target set
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(default)]
    pub targets: Vec<String>,
}

/// Security policy: UA denylist, rate limiting, pattern rules
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Case-insensitive substrings; an empty token matches a missing or
    /// empty User-Agent
    #[serde(default)]
    pub block_user_agents: Vec<String>,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
    /// Whether X-Forwarded-For / X-Real-IP are believed for client identity.
    /// Defaults to true; set false when not behind a trusted proxy.
    #[serde(default = "default_true")]
    pub trust_proxy_headers: bool,
}

/// Token-bucket admission settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: i64,
}

/// Source form of one signature rule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleConfig {
    pub name: String,
    pub pattern: String,
    pub location: RuleLocation,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            read_timeout: default_read_timeout(),
            write_timeout: default_write_timeout(),
            cert_file: None,
            key_file: None,
            stats_port: default_stats_port(),
        }
    }
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            block_user_agents: Vec::new(),
            rate_limit: RateLimitConfig::default(),
            rules: Vec::new(),
            trust_proxy_headers: true,
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            requests_per_minute: default_requests_per_minute(),
        }
    }
}

fn default_port() -> String {
    "8080".to_string()
}

fn default_read_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_write_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_stats_port() -> u16 {
    8081
}

fn default_requests_per_minute() -> i64 {
    60
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Load and validate the document at `path`
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|e| {
            ProxyError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::parse(&raw)
    }

    /// Parse and validate a YAML document
    pub fn parse(raw: &str) -> Result<Self> {
        let cfg: Config = serde_yaml::from_str(raw)
            .map_err(|e| ProxyError::Config(format!("invalid configuration: {}", e)))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject documents that would misbehave at runtime: unparseable ports,
    /// relative or schemeless targets, non-positive rate limits, and rules
    /// whose patterns do not compile.
    pub fn validate(&self) -> Result<()> {
        self.server
            .port
            .parse::<u16>()
            .map_err(|_| ProxyError::Config(format!("invalid server port: {}", self.server.port)))?;

        for target in &self.proxy.targets {
            let url = Url::parse(target)
                .map_err(|e| ProxyError::Config(format!("invalid target {}: {}", target, e)))?;
            if url.scheme() != "http" && url.scheme() != "https" {
                return Err(ProxyError::Config(format!(
                    "target {} must use http or https",
                    target
                )));
            }
            if url.host_str().is_none() {
                return Err(ProxyError::Config(format!("target {} has no host", target)));
            }
        }

        if self.security.rate_limit.enabled && self.security.rate_limit.requests_per_minute <= 0 {
            return Err(ProxyError::Config(format!(
                "requests_per_minute must be positive, got {}",
                self.security.rate_limit.requests_per_minute
            )));
        }

        // Compile once to surface bad patterns at load time
        RuleEngine::new(&self.security.rules)?;

        Ok(())
    }
}

/// Serde adapter for Go-style duration strings ("250ms", "10s", "5m", "1h").
/// Bare integers are treated as seconds. Serialization emits milliseconds so
/// a persisted document re-parses to the identical value.
mod duration_str {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("{}ms", d.as_millis()))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        super::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

pub(crate) fn parse_duration(raw: &str) -> std::result::Result<Duration, String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err("empty duration".to_string());
    }

    let (value, unit) = match raw.find(|c: char| !c.is_ascii_digit()) {
        Some(idx) => raw.split_at(idx),
        None => (raw, "s"),
    };

    let value: u64 = value
        .parse()
        .map_err(|_| format!("invalid duration: {}", raw))?;

    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 3600)),
        _ => Err(format!("unknown duration unit: {}", unit)),
    }
}
