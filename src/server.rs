//! Public listener with connection handling
//!
//! Responsibilities:
//! - Accept TCP connections, optionally terminating TLS
//! - HTTP/1.1 parsing via hyper
//! - Spawn per-connection tasks
//! - Acquire one policy snapshot per request and run the pipeline
//! - Graceful shutdown: stop accepting, drain in-flight work for a bounded
//!   grace window, then exit
//!
//! Timeout model: reading a request's headers is bounded by the configured
//! `read_timeout` (hyper's header-read timer); each request's service (body
//! read, inspection, upstream exchange) is bounded by the configured
//! `write_timeout`; a keep-alive connection that has not started a new
//! request for [`IDLE_TIMEOUT`] is drained and closed by a per-connection
//! watchdog.

use std::future::Future;
use std::io::BufReader;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, StatusCode};
use hyper_util::rt::{TokioIo, TokioTimer};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio_rustls::rustls::ServerConfig as RustlsServerConfig;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::error::{ProxyError, Result};
use crate::middleware::{text_response, Chain, RequestContext};
use crate::policy::PolicyHandle;

/// Keep-alive connections idle longer than this are closed
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(120);

/// How long in-flight requests may run after shutdown is requested
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Main server with the assembled pipeline
pub struct Server {
    listener: TcpListener,
    addr: SocketAddr,
    tls: Option<TlsAcceptor>,
    chain: Arc<Chain>,
    policy: PolicyHandle,
    read_timeout: Duration,
    write_timeout: Duration,
}

impl Server {
    pub async fn bind(cfg: &ServerConfig, chain: Arc<Chain>, policy: PolicyHandle) -> Result<Self> {
        let addr: SocketAddr = format!("0.0.0.0:{}", cfg.port)
            .parse()
            .map_err(|e| ProxyError::Config(format!("invalid server port {}: {}", cfg.port, e)))?;

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ProxyError::Bind { addr, source: e })?;

        let actual_addr = listener
            .local_addr()
            .map_err(|e| ProxyError::Config(format!("failed to get local address: {}", e)))?;

        let tls = match (&cfg.cert_file, &cfg.key_file) {
            (Some(cert), Some(key)) => Some(load_tls(cert, key)?),
            _ => None,
        };

        info!(addr = %actual_addr, tls = tls.is_some(), "Server bound successfully");

        Ok(Self {
            listener,
            addr: actual_addr,
            tls,
            chain,
            policy,
            read_timeout: cfg.read_timeout,
            write_timeout: cfg.write_timeout,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Accept until `shutdown` resolves, then drain within the grace window.
    pub async fn run(self, shutdown: impl Future<Output = ()> + Send) -> Result<()> {
        info!(addr = %self.addr, "Starting server");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        // Each connection task holds a clone; recv() resolves once all drop
        let (done_tx, mut done_rx) = mpsc::channel::<()>(1);

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown signal received, draining connections");
                    break;
                }
                accepted = self.listener.accept() => {
                    let (stream, remote_addr) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            error!(%e, "Failed to accept connection");
                            continue;
                        }
                    };
                    self.spawn_connection(stream, remote_addr, shutdown_rx.clone(), done_tx.clone());
                }
            }
        }

        drop(self.listener);
        let _ = shutdown_tx.send(true);
        drop(done_tx);

        tokio::select! {
            _ = done_rx.recv() => info!("All connections drained"),
            _ = tokio::time::sleep(SHUTDOWN_GRACE) => {
                warn!("Grace window elapsed, abandoning in-flight connections");
            }
        }

        Ok(())
    }

    fn spawn_connection(
        &self,
        stream: TcpStream,
        remote_addr: SocketAddr,
        shutdown_rx: watch::Receiver<bool>,
        done_tx: mpsc::Sender<()>,
    ) {
        let chain = self.chain.clone();
        let policy = self.policy.clone();
        let read_timeout = self.read_timeout;
        let write_timeout = self.write_timeout;
        let tls = self.tls.clone();

        tokio::spawn(async move {
            let _done = done_tx;
            match tls {
                Some(acceptor) => match acceptor.accept(stream).await {
                    Ok(tls_stream) => {
                        serve(
                            tls_stream,
                            remote_addr,
                            chain,
                            policy,
                            read_timeout,
                            write_timeout,
                            shutdown_rx,
                        )
                        .await
                    }
                    Err(e) => warn!(%remote_addr, %e, "TLS handshake failed"),
                },
                None => {
                    serve(
                        stream,
                        remote_addr,
                        chain,
                        policy,
                        read_timeout,
                        write_timeout,
                        shutdown_rx,
                    )
                    .await
                }
            }
        });
    }
}

async fn serve<I>(
    io: I,
    remote_addr: SocketAddr,
    chain: Arc<Chain>,
    policy: PolicyHandle,
    read_timeout: Duration,
    write_timeout: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    // Stamped at request start and completion; the watchdog below closes
    // keep-alive connections that stay quiet past IDLE_TIMEOUT
    let last_activity = Arc::new(Mutex::new(Instant::now()));

    let activity = last_activity.clone();
    let service = service_fn(move |req: Request<Incoming>| {
        let chain = chain.clone();
        let policy = policy.clone();
        let activity = activity.clone();
        async move {
            *activity.lock() = Instant::now();

            // Exactly one snapshot per request, held for its whole lifecycle
            let ctx = RequestContext {
                client_addr: remote_addr,
                policy: policy.load(),
                received_at: Instant::now(),
            };
            let req = req.map(|body| body.boxed());

            let response = match tokio::time::timeout(write_timeout, chain.execute(req, ctx)).await
            {
                Ok(response) => response,
                Err(_) => {
                    warn!(%remote_addr, "Request exceeded service deadline");
                    text_response(StatusCode::GATEWAY_TIMEOUT, "Gateway Timeout")
                }
            };

            *activity.lock() = Instant::now();
            Ok::<_, hyper::Error>(response.map(Full::new))
        }
    });

    let idle_watchdog = {
        let last_activity = last_activity.clone();
        async move {
            loop {
                let idle_for = last_activity.lock().elapsed();
                if idle_for >= IDLE_TIMEOUT {
                    return;
                }
                tokio::time::sleep(IDLE_TIMEOUT - idle_for).await;
            }
        }
    };

    let conn = http1::Builder::new()
        .timer(TokioTimer::new())
        .header_read_timeout(read_timeout)
        .serve_connection(TokioIo::new(io), service);
    tokio::pin!(conn);

    tokio::select! {
        result = conn.as_mut() => {
            if let Err(e) = result {
                warn!(%remote_addr, %e, "Connection error");
            }
        }
        _ = shutdown_rx.changed() => {
            conn.as_mut().graceful_shutdown();
            if let Err(e) = conn.as_mut().await {
                warn!(%remote_addr, %e, "Connection error during drain");
            }
        }
        _ = idle_watchdog => {
            debug!(%remote_addr, "Closing idle connection");
            conn.as_mut().graceful_shutdown();
            if let Err(e) = conn.as_mut().await {
                warn!(%remote_addr, %e, "Connection error during idle close");
            }
        }
    }
}

fn load_tls(cert_path: &str, key_path: &str) -> Result<TlsAcceptor> {
    let cert_file = std::fs::File::open(cert_path)
        .map_err(|e| ProxyError::Config(format!("failed to open {}: {}", cert_path, e)))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(cert_file))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| ProxyError::Config(format!("invalid cert file {}: {}", cert_path, e)))?;

    let key_file = std::fs::File::open(key_path)
        .map_err(|e| ProxyError::Config(format!("failed to open {}: {}", key_path, e)))?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(key_file))
        .map_err(|e| ProxyError::Config(format!("invalid key file {}: {}", key_path, e)))?
        .ok_or_else(|| ProxyError::Config(format!("no private key found in {}", key_path)))?;

    let config = RustlsServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| ProxyError::Config(format!("invalid TLS material: {}", e)))?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}
