//! Policy snapshots and hot reload
//!
//! A snapshot is the immutable bundle of active policy: the parsed document,
//! the compiled rule set, and the lowercased User-Agent denylist. Snapshots
//! are published through an atomic pointer swap; every request loads exactly
//! one snapshot at entry and keeps it for its whole lifecycle, so in-flight
//! requests never observe a torn configuration.
//!
//! The reload supervisor polls the document's mtime. A rebuild that fails at
//! any step (read, parse, validate, compile) keeps the current snapshot and
//! logs the error; traffic continues on the old policy.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use arc_swap::ArcSwap;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::error::{ProxyError, Result};
use crate::rules::RuleEngine;

pub const RELOAD_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Immutable bundle of active policy
pub struct PolicySnapshot {
    pub config: Config,
    pub engine: RuleEngine,
    /// Lowercased denylist tokens; an empty token matches an absent UA
    ua_denylist: Vec<String>,
}

impl PolicySnapshot {
    pub fn build(config: Config) -> Result<Self> {
        config.validate()?;
        let engine = RuleEngine::new(&config.security.rules)?;
        let ua_denylist = config
            .security
            .block_user_agents
            .iter()
            .map(|token| token.to_lowercase())
            .collect();

        Ok(Self {
            config,
            engine,
            ua_denylist,
        })
    }

    /// Case-insensitive substring check of the User-Agent against the
    /// denylist; returns the matching token.
    pub fn blocked_agent(&self, user_agent: &str) -> Option<&str> {
        let ua = user_agent.to_lowercase();
        self.ua_denylist
            .iter()
            .find(|token| {
                if token.is_empty() {
                    ua.is_empty()
                } else {
                    ua.contains(token.as_str())
                }
            })
            .map(String::as_str)
    }
}

/// Shared pointer to the active snapshot; cloning is cheap and all clones
/// observe the same publications.
#[derive(Clone)]
pub struct PolicyHandle {
    inner: Arc<ArcSwap<PolicySnapshot>>,
}

impl PolicyHandle {
    pub fn new(snapshot: PolicySnapshot) -> Self {
        Self {
            inner: Arc::new(ArcSwap::from_pointee(snapshot)),
        }
    }

    /// Acquire the active snapshot; called once per request at entry
    pub fn load(&self) -> Arc<PolicySnapshot> {
        self.inner.load_full()
    }

    pub fn publish(&self, snapshot: PolicySnapshot) {
        self.inner.store(Arc::new(snapshot));
    }
}

/// Watch the document at `path` and republish on change.
///
/// `running_targets` is the upstream set the load balancer was built with;
/// the balancer is carried for the process lifetime, so a reload that
/// changes the target set only logs a warning.
pub fn spawn_supervisor(
    handle: PolicyHandle,
    path: PathBuf,
    running_targets: Vec<String>,
) -> JoinHandle<()> {
    spawn_supervisor_with_interval(handle, path, running_targets, RELOAD_POLL_INTERVAL)
}

pub fn spawn_supervisor_with_interval(
    handle: PolicyHandle,
    path: PathBuf,
    running_targets: Vec<String>,
    poll_interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut last_modified = modified_at(&path);
        let mut ticker = tokio::time::interval(poll_interval);
        ticker.tick().await;

        loop {
            ticker.tick().await;

            let Some(modified) = modified_at(&path) else {
                continue;
            };

            if last_modified.is_some_and(|last| modified > last) {
                info!("Configuration change detected, reloading");
                match reload(&handle, &path, &running_targets) {
                    Ok(()) => info!("Configuration reloaded successfully"),
                    Err(e) => error!(error = %e, "Failed to reload configuration"),
                }
            }
            last_modified = Some(modified);
        }
    })
}

fn reload(handle: &PolicyHandle, path: &Path, running_targets: &[String]) -> Result<()> {
    let config = Config::load(path)?;
    warn_if_targets_changed(&config.proxy.targets, running_targets);
    let snapshot = PolicySnapshot::build(config)?;
    handle.publish(snapshot);
    Ok(())
}

/// Imperative update from the admin surface: validate and build first, then
/// persist the document, then publish synchronously. A document that fails
/// to build is never written; a write failure leaves the old snapshot live.
pub fn apply_update(
    handle: &PolicyHandle,
    path: &Path,
    config: Config,
    running_targets: &[String],
) -> Result<()> {
    let snapshot = PolicySnapshot::build(config.clone())?;

    let yaml = serde_yaml::to_string(&config)
        .map_err(|e| ProxyError::Persist(std::io::Error::other(e)))?;
    std::fs::write(path, yaml).map_err(ProxyError::Persist)?;

    warn_if_targets_changed(&config.proxy.targets, running_targets);
    handle.publish(snapshot);
    info!("Configuration updated and published");
    Ok(())
}

fn warn_if_targets_changed(new_targets: &[String], running_targets: &[String]) {
    if new_targets != running_targets {
        warn!(
            "Upstream target set changed in configuration; the running \
             balancer keeps its original targets until restart"
        );
    }
}

fn modified_at(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RateLimitConfig, RuleConfig};
    use crate::rules::RuleLocation;

    fn config_with_agents(agents: &[&str]) -> Config {
        let mut config = Config::default();
        config.security.block_user_agents = agents.iter().map(|s| s.to_string()).collect();
        config
    }

    #[test]
    fn test_build_rejects_invalid_rule() {
        let mut config = Config::default();
        config.security.rules.push(RuleConfig {
            name: "broken".to_string(),
            pattern: "(".to_string(),
            location: RuleLocation::Uri,
        });
        assert!(PolicySnapshot::build(config).is_err());
    }

    #[test]
    fn test_build_rejects_nonpositive_rate() {
        let mut config = Config::default();
        config.security.rate_limit = RateLimitConfig {
            enabled: true,
            requests_per_minute: -5,
        };
        assert!(PolicySnapshot::build(config).is_err());
    }

    #[test]
    fn test_blocked_agent_is_case_insensitive_substring() {
        let snap = PolicySnapshot::build(config_with_agents(&["curl", "wget"])).unwrap();

        assert_eq!(snap.blocked_agent("CURL/7.64.1"), Some("curl"));
        assert_eq!(snap.blocked_agent("Wget/1.20.3"), Some("wget"));
        assert!(snap.blocked_agent("Mozilla/5.0").is_none());
        assert!(snap.blocked_agent("").is_none());
    }

    #[test]
    fn test_empty_token_matches_missing_agent() {
        let snap = PolicySnapshot::build(config_with_agents(&[""])).unwrap();

        assert_eq!(snap.blocked_agent(""), Some(""));
        assert!(snap.blocked_agent("Mozilla/5.0").is_none());
    }

    #[test]
    fn test_publish_swaps_atomically() {
        let handle = PolicyHandle::new(PolicySnapshot::build(Config::default()).unwrap());
        let before = handle.load();
        assert!(before.ua_denylist.is_empty());

        handle.publish(PolicySnapshot::build(config_with_agents(&["curl"])).unwrap());

        // The old snapshot is unchanged for holders; new loads see the update
        assert!(before.ua_denylist.is_empty());
        assert_eq!(handle.load().ua_denylist, vec!["curl"]);
    }

    #[test]
    fn test_apply_update_persists_then_publishes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policy.yaml");
        let handle = PolicyHandle::new(PolicySnapshot::build(Config::default()).unwrap());

        let config = config_with_agents(&["curl"]);
        apply_update(&handle, &path, config, &[]).unwrap();

        assert_eq!(handle.load().blocked_agent("curl/7.1"), Some("curl"));
        let persisted = Config::load(&path).unwrap();
        assert_eq!(persisted.security.block_user_agents, vec!["curl"]);
    }

    #[test]
    fn test_apply_update_rejects_invalid_document_without_writing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policy.yaml");
        let handle = PolicyHandle::new(PolicySnapshot::build(Config::default()).unwrap());

        let mut config = Config::default();
        config.security.rules.push(RuleConfig {
            name: "broken".to_string(),
            pattern: "[".to_string(),
            location: RuleLocation::Body,
        });

        assert!(apply_update(&handle, &path, config, &[]).is_err());
        assert!(!path.exists());
    }
}
