//! Periodic TCP liveness checks
//!
//! A background loop, started once per load balancer. Liveness is decoupled
//! from the circuit breaker: a backend can be alive with an open breaker, or
//! dead with a closed one.

use std::sync::Arc;
use std::time::Duration;

use metrics::gauge;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::balancer::LoadBalancer;

pub const STARTUP_GRACE: Duration = Duration::from_secs(3);
pub const CHECK_INTERVAL: Duration = Duration::from_secs(10);
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Spawn the health-check loop for every backend of `balancer`
pub fn spawn_health_checker(balancer: Arc<LoadBalancer>) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(STARTUP_GRACE).await;

        let mut ticker = tokio::time::interval(CHECK_INTERVAL);
        loop {
            ticker.tick().await;
            for backend in balancer.backends() {
                let alive = probe(backend.probe_addr()).await;
                backend.set_alive(alive);
                gauge!("backend_alive", "backend" => backend.url.to_string())
                    .set(if alive { 1.0 } else { 0.0 });

                if alive {
                    debug!(url = %backend.url, "Backend health check passed");
                } else {
                    warn!(url = %backend.url, "Backend health check failed");
                }
            }
        }
    })
}

async fn probe(addr: &str) -> bool {
    matches!(
        tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await,
        Ok(Ok(_))
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_probe_succeeds_against_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        assert!(probe(&addr.to_string()).await);
    }

    #[tokio::test]
    async fn test_probe_fails_against_closed_port() {
        // Bind and drop to find a port that is very likely closed
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        assert!(!probe(&addr.to_string()).await);
    }
}
