//! Round-robin load balancing over healthy backends
//!
//! Holds the ordered backend set and a monotonically advancing cursor.
//! Selection skips backends that are dead (health check) or whose breaker
//! rejects; forwarding feeds the observed status back into the chosen
//! backend's breaker. The balancer is the terminal handler of the pipeline.

pub mod health;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use hyper::body::Bytes;
use hyper::header::HeaderValue;
use hyper::{Request, Response, StatusCode};
use tracing::{error, warn};
use url::Url;

use crate::breaker::CircuitBreaker;
use crate::error::{ProxyError, Result};
use crate::middleware::{text_response, Handler, PipelineBody, RequestContext};
use crate::proxy::UpstreamClient;

/// A single upstream origin
pub struct Backend {
    pub url: Url,
    /// host:port as sent in the Host header (port omitted when the URL has none)
    pub authority: String,
    pub(crate) authority_value: HeaderValue,
    /// host:port used for TCP liveness probes, scheme-default port applied
    probe_addr: String,
    alive: AtomicBool,
    pub breaker: CircuitBreaker,
}

impl Backend {
    fn new(url: Url) -> Result<Self> {
        let host = url
            .host_str()
            .ok_or_else(|| ProxyError::Config(format!("target {} has no host", url)))?
            .to_string();

        let authority = match url.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.clone(),
        };
        let authority_value = HeaderValue::from_str(&authority)
            .map_err(|_| ProxyError::Config(format!("target {} has an invalid authority", url)))?;

        let probe_port = url.port_or_known_default().unwrap_or(80);
        let probe_addr = format!("{}:{}", host, probe_port);

        Ok(Self {
            url,
            authority,
            authority_value,
            probe_addr,
            alive: AtomicBool::new(true),
            breaker: CircuitBreaker::default(),
        })
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    pub fn set_alive(&self, alive: bool) {
        self.alive.store(alive, Ordering::Relaxed);
    }

    pub fn probe_addr(&self) -> &str {
        &self.probe_addr
    }
}

/// Round-robin selector and forwarder over the backend set
pub struct LoadBalancer {
    backends: Vec<Arc<Backend>>,
    cursor: AtomicUsize,
    client: UpstreamClient,
    targets: Vec<String>,
}

impl LoadBalancer {
    pub fn new(targets: &[String]) -> Result<Self> {
        if targets.is_empty() {
            return Err(ProxyError::Config(
                "at least one proxy target is required".to_string(),
            ));
        }

        let mut backends = Vec::with_capacity(targets.len());
        for target in targets {
            let url = Url::parse(target)
                .map_err(|e| ProxyError::Config(format!("invalid target {}: {}", target, e)))?;
            backends.push(Arc::new(Backend::new(url)?));
        }

        Ok(Self {
            backends,
            cursor: AtomicUsize::new(0),
            client: UpstreamClient::new(),
            targets: targets.to_vec(),
        })
    }

    pub fn backends(&self) -> &[Arc<Backend>] {
        &self.backends
    }

    pub fn targets(&self) -> &[String] {
        &self.targets
    }

    fn next_index(&self) -> usize {
        self.cursor
            .fetch_add(1, Ordering::Relaxed)
            .wrapping_add(1)
            % self.backends.len()
    }

    /// Select the next admissible backend: scan up to N entries from the
    /// cursor, taking the first that is alive and whose breaker admits, and
    /// re-anchor the cursor there so the following call starts after it.
    pub fn next_peer(&self) -> Option<Arc<Backend>> {
        let len = self.backends.len();
        let start = self.next_index();

        for i in start..start + len {
            let idx = i % len;
            let backend = &self.backends[idx];
            if backend.is_alive() && backend.breaker.allow_request() {
                if i != start {
                    self.cursor.store(idx, Ordering::Relaxed);
                }
                return Some(backend.clone());
            }
        }
        None
    }
}

#[async_trait]
impl Handler for LoadBalancer {
    async fn call(&self, req: Request<PipelineBody>, ctx: &RequestContext) -> Response<Bytes> {
        let Some(backend) = self.next_peer() else {
            error!("All backends unavailable");
            for b in &self.backends {
                error!(
                    url = %b.url,
                    alive = b.is_alive(),
                    breaker = %b.breaker.state(),
                    "Backend status"
                );
            }
            return text_response(StatusCode::SERVICE_UNAVAILABLE, "Service Unavailable");
        };

        match self.client.forward(req, &backend, ctx.client_addr).await {
            Ok(response) => {
                if response.status().as_u16() >= 500 {
                    backend.breaker.record_failure();
                } else {
                    backend.breaker.record_success();
                }
                response
            }
            Err(ProxyError::UpstreamTimeout) => {
                warn!(url = %backend.url, "Upstream request timed out");
                backend.breaker.record_failure();
                text_response(StatusCode::GATEWAY_TIMEOUT, "Gateway Timeout")
            }
            Err(e) => {
                warn!(url = %backend.url, error = %e, "Upstream request failed");
                backend.breaker.record_failure();
                text_response(StatusCode::BAD_GATEWAY, "Bad Gateway")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn balancer(targets: &[&str]) -> LoadBalancer {
        let targets: Vec<String> = targets.iter().map(|s| s.to_string()).collect();
        LoadBalancer::new(&targets).unwrap()
    }

    #[test]
    fn test_requires_at_least_one_target() {
        assert!(LoadBalancer::new(&[]).is_err());
    }

    #[test]
    fn test_rejects_malformed_target() {
        assert!(LoadBalancer::new(&["not a url".to_string()]).is_err());
    }

    #[test]
    fn test_round_robin_rotation() {
        let lb = balancer(&["http://a:3000", "http://b:3000", "http://c:3000"]);

        let first = lb.next_peer().unwrap();
        let second = lb.next_peer().unwrap();
        let third = lb.next_peer().unwrap();
        let fourth = lb.next_peer().unwrap();

        assert_eq!(first.authority, "b:3000");
        assert_eq!(second.authority, "c:3000");
        assert_eq!(third.authority, "a:3000");
        assert_eq!(fourth.authority, "b:3000");
    }

    #[test]
    fn test_selection_skips_dead_backends() {
        let lb = balancer(&["http://a:3000", "http://b:3000"]);
        lb.backends()[1].set_alive(false);

        for _ in 0..4 {
            assert_eq!(lb.next_peer().unwrap().authority, "a:3000");
        }
    }

    #[test]
    fn test_selection_skips_open_breakers() {
        let lb = balancer(&["http://a:3000", "http://b:3000"]);
        for _ in 0..crate::breaker::DEFAULT_FAILURE_THRESHOLD {
            lb.backends()[0].breaker.record_failure();
        }

        for _ in 0..4 {
            assert_eq!(lb.next_peer().unwrap().authority, "b:3000");
        }
    }

    #[test]
    fn test_no_admissible_backend_yields_none() {
        let lb = balancer(&["http://a:3000", "http://b:3000"]);
        lb.backends()[0].set_alive(false);
        lb.backends()[1].set_alive(false);

        assert!(lb.next_peer().is_none());
    }

    #[test]
    fn test_probe_addr_applies_scheme_default_port() {
        let lb = balancer(&["http://plain.example", "https://secure.example"]);
        assert_eq!(lb.backends()[0].probe_addr(), "plain.example:80");
        assert_eq!(lb.backends()[1].probe_addr(), "secure.example:443");

        let lb = balancer(&["http://explicit.example:9001"]);
        assert_eq!(lb.backends()[0].probe_addr(), "explicit.example:9001");
        assert_eq!(lb.backends()[0].authority, "explicit.example:9001");
    }
}
