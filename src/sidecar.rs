//! Observability sidecar
//!
//! A second, read-mostly HTTP surface on its own port: the embedded
//! dashboard, the logs/stats/rules/config JSON API, and the prometheus
//! metrics render. `POST /api/config` is the imperative reload path: it
//! persists the document and publishes the new snapshot synchronously.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use http_body_util::{BodyExt, Full, Limited};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::error::ProxyError;
use crate::policy::{self, PolicyHandle};
use crate::stats::Stats;

const DASHBOARD_HTML: &str = include_str!("../assets/dashboard.html");

/// Cap on accepted configuration documents
const MAX_CONFIG_BYTES: usize = 1024 * 1024;

/// Shared state behind the sidecar endpoints
pub struct Sidecar {
    pub stats: Arc<Stats>,
    pub policy: PolicyHandle,
    pub config_path: PathBuf,
    pub prometheus: PrometheusHandle,
    pub running_targets: Vec<String>,
}

/// Bind the sidecar and start its accept loop; returns the bound address.
pub async fn bind(
    addr: SocketAddr,
    state: Arc<Sidecar>,
) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
    let listener = TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;
    let handle = tokio::spawn(accept_loop(listener, state));
    Ok((local_addr, handle))
}

/// Serve the sidecar on `port`. Bind failures are logged, not fatal: the
/// data plane keeps running without its dashboard.
pub fn spawn_sidecar(port: u16, state: Arc<Sidecar>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let addr: SocketAddr = ([0, 0, 0, 0], port).into();
        match bind(addr, state).await {
            Ok((local_addr, handle)) => {
                info!(addr = %local_addr, "Stats server listening");
                let _ = handle.await;
            }
            Err(e) => error!(%addr, %e, "Failed to bind stats server"),
        }
    })
}

async fn accept_loop(listener: TcpListener, state: Arc<Sidecar>) {
    loop {
        let (stream, _) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                error!(%e, "Failed to accept stats connection");
                continue;
            }
        };

        let state = state.clone();
        tokio::spawn(async move {
            let service = service_fn(move |req| handle(req, state.clone()));
            if let Err(e) = http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .await
            {
                warn!(%e, "Stats connection error");
            }
        });
    }
}

async fn handle(
    req: Request<Incoming>,
    state: Arc<Sidecar>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let response = match (method, path.as_str()) {
        (Method::GET, "/") | (Method::GET, "/index.html") => html(DASHBOARD_HTML),
        (Method::GET, "/api/logs") => json(&state.stats.recent_logs()),
        (Method::GET, "/api/stats") => json(&state.stats.system_stats()),
        (Method::GET, "/api/rules") => json(&state.policy.load().config.security.rules),
        (Method::GET, "/api/config") => json(&state.policy.load().config),
        (Method::POST, "/api/config") => update_config(req, &state).await,
        (Method::GET, "/metrics") => text(state.prometheus.render()),
        _ => plain(StatusCode::NOT_FOUND, "Not Found".to_string()),
    };

    Ok(response)
}

async fn update_config(req: Request<Incoming>, state: &Sidecar) -> Response<Full<Bytes>> {
    let body = match Limited::new(req.into_body(), MAX_CONFIG_BYTES).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            return plain(
                StatusCode::BAD_REQUEST,
                format!("failed to read body: {}", e),
            )
        }
    };

    let config: Config = match serde_json::from_slice(&body) {
        Ok(config) => config,
        Err(e) => {
            return plain(
                StatusCode::BAD_REQUEST,
                format!("invalid configuration: {}", e),
            )
        }
    };

    match policy::apply_update(
        &state.policy,
        &state.config_path,
        config,
        &state.running_targets,
    ) {
        Ok(()) => json(&serde_json::json!({ "status": "ok" })),
        Err(ProxyError::Persist(e)) => {
            error!(%e, "Failed to persist configuration");
            plain(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("failed to save config: {}", e),
            )
        }
        Err(e) => plain(StatusCode::BAD_REQUEST, e.to_string()),
    }
}

fn json<T: Serialize>(value: &T) -> Response<Full<Bytes>> {
    match serde_json::to_vec(value) {
        Ok(body) => with_content_type(
            StatusCode::OK,
            Bytes::from(body),
            "application/json",
        ),
        Err(e) => {
            error!(%e, "Failed to serialize response");
            plain(
                StatusCode::INTERNAL_SERVER_ERROR,
                "serialization failure".to_string(),
            )
        }
    }
}

fn html(body: &'static str) -> Response<Full<Bytes>> {
    with_content_type(
        StatusCode::OK,
        Bytes::from_static(body.as_bytes()),
        "text/html; charset=utf-8",
    )
}

fn text(body: String) -> Response<Full<Bytes>> {
    with_content_type(StatusCode::OK, Bytes::from(body), "text/plain; version=0.0.4")
}

fn plain(status: StatusCode, body: String) -> Response<Full<Bytes>> {
    with_content_type(status, Bytes::from(body), "text/plain; charset=utf-8")
}

fn with_content_type(
    status: StatusCode,
    body: Bytes,
    content_type: &'static str,
) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}
