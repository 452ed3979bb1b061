//! Palisade - Entry point

use std::path::PathBuf;
use std::sync::Arc;

use metrics_exporter_prometheus::PrometheusBuilder;
use palisade::balancer::health::spawn_health_checker;
use palisade::balancer::LoadBalancer;
use palisade::config::Config;
use palisade::middleware::compress::Gzip;
use palisade::middleware::headers::{RequestId, SecureHeaders};
use palisade::middleware::logging::RequestLogger;
use palisade::middleware::metrics::Metrics;
use palisade::middleware::ratelimit::RateLimiter;
use palisade::middleware::security::Security;
use palisade::middleware::{Chain, Middleware};
use palisade::policy::{spawn_supervisor, PolicyHandle, PolicySnapshot};
use palisade::server::Server;
use palisade::sidecar::{spawn_sidecar, Sidecar};
use palisade::stats::Stats;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

const DEFAULT_CONFIG_PATH: &str = "configs/palisade.yaml";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .init();

    let config_path = PathBuf::from(
        std::env::args()
            .nth(1)
            .or_else(|| std::env::var("PALISADE_CONFIG").ok())
            .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string()),
    );

    info!("Starting Palisade");
    let config = Config::load(&config_path)?;

    info!("Listening port: {}", config.server.port);
    info!("Upstream targets: {:?}", config.proxy.targets);
    info!(
        "Rate limiting: enabled={}, requests_per_minute={}",
        config.security.rate_limit.enabled, config.security.rate_limit.requests_per_minute
    );
    info!(
        "Security rules: {}, blocked user agents: {}",
        config.security.rules.len(),
        config.security.block_user_agents.len()
    );

    let prometheus = PrometheusBuilder::new().install_recorder()?;

    let policy = PolicyHandle::new(PolicySnapshot::build(config.clone())?);

    let balancer = Arc::new(LoadBalancer::new(&config.proxy.targets)?);
    spawn_health_checker(balancer.clone());

    let stats = Stats::new();

    let limiter = RateLimiter::new();
    limiter.spawn_sweeper();

    // Pipeline order, outermost first; recovery is built into the chain
    let stages: Vec<Arc<dyn Middleware>> = vec![
        Arc::new(RequestId),
        Arc::new(SecureHeaders),
        Arc::new(Gzip),
        Arc::new(Metrics::new(stats.clone())),
        Arc::new(limiter),
        Arc::new(Security),
        Arc::new(RequestLogger::new(stats.clone())),
    ];
    let chain = Arc::new(Chain::new(balancer.clone(), stages));

    spawn_supervisor(
        policy.clone(),
        config_path.clone(),
        balancer.targets().to_vec(),
    );

    spawn_sidecar(
        config.server.stats_port,
        Arc::new(Sidecar {
            stats,
            policy: policy.clone(),
            config_path,
            prometheus,
            running_targets: balancer.targets().to_vec(),
        }),
    );

    let server = Server::bind(&config.server, chain, policy).await?;
    info!("Server listening on {}", server.addr());

    server.run(shutdown_signal()).await?;

    info!("Server exited properly");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(%e, "Failed to listen for shutdown signal");
    }
}
