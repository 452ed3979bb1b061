//! Ordered request-processing pipeline
//!
//! A middleware wraps everything inside it: it may short-circuit with its
//! own response, mutate the request before handing it on, or observe the
//! response on the way back out. Composition is ordered; the terminal
//! handler is the load balancer.
//!
//! Assembly order (outermost first): recovery (built into [`Chain`]),
//! request id, secure headers, compression, metrics, rate limiter,
//! security, request logger, load balancer.

pub mod compress;
pub mod headers;
pub mod logging;
pub mod metrics;
pub mod ratelimit;
pub mod security;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Request, Response, StatusCode};
use tracing::error;

use crate::policy::PolicySnapshot;

/// Request body type flowing through the pipeline
pub type PipelineBody = BoxBody<Bytes, hyper::Error>;

/// Per-request state shared with every stage. The policy snapshot is
/// acquired once at entry and used for the whole request lifecycle.
pub struct RequestContext {
    pub client_addr: SocketAddr,
    pub policy: Arc<PolicySnapshot>,
    pub received_at: Instant,
}

/// One stage of the pipeline
#[async_trait]
pub trait Middleware: Send + Sync {
    async fn handle(
        &self,
        req: Request<PipelineBody>,
        ctx: &RequestContext,
        next: Next<'_>,
    ) -> Response<Bytes>;

    /// Stage name for logging
    fn name(&self) -> &'static str;
}

/// Terminal request handler at the end of the chain
#[async_trait]
pub trait Handler: Send + Sync {
    async fn call(&self, req: Request<PipelineBody>, ctx: &RequestContext) -> Response<Bytes>;
}

/// Continuation into the remainder of the chain
pub struct Next<'a> {
    stages: &'a [Arc<dyn Middleware>],
    terminal: &'a dyn Handler,
}

impl<'a> Next<'a> {
    pub async fn run(self, req: Request<PipelineBody>, ctx: &RequestContext) -> Response<Bytes> {
        match self.stages.split_first() {
            Some((stage, rest)) => {
                let next = Next {
                    stages: rest,
                    terminal: self.terminal,
                };
                stage.handle(req, ctx, next).await
            }
            None => self.terminal.call(req, ctx).await,
        }
    }
}

/// The assembled pipeline.
///
/// `execute` is also the recovery boundary: the chain runs on its own task,
/// so a panic anywhere inside becomes a logged 500 instead of a dropped
/// connection, and is never re-raised.
pub struct Chain {
    stages: Vec<Arc<dyn Middleware>>,
    terminal: Arc<dyn Handler>,
}

impl Chain {
    pub fn new(terminal: Arc<dyn Handler>, stages: Vec<Arc<dyn Middleware>>) -> Self {
        Self { stages, terminal }
    }

    pub async fn execute(
        self: Arc<Self>,
        req: Request<PipelineBody>,
        ctx: RequestContext,
    ) -> Response<Bytes> {
        let outcome = tokio::spawn(async move {
            Next {
                stages: &self.stages,
                terminal: self.terminal.as_ref(),
            }
            .run(req, &ctx)
            .await
        })
        .await;

        match outcome {
            Ok(response) => response,
            Err(e) => {
                if e.is_panic() {
                    error!("Handler panicked, responding 500");
                } else {
                    error!(error = %e, "Handler task failed, responding 500");
                }
                text_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
            }
        }
    }
}

/// Plain-text response with the given status
pub fn text_response(status: StatusCode, body: &'static str) -> Response<Bytes> {
    let mut response = Response::new(Bytes::from_static(body.as_bytes()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

/// Rebuild a pipeline body from buffered bytes
pub fn buffered_body(bytes: Bytes) -> PipelineBody {
    Full::new(bytes).map_err(|never| match never {}).boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use parking_lot::Mutex;

    fn test_ctx() -> RequestContext {
        RequestContext {
            client_addr: "127.0.0.1:9999".parse().unwrap(),
            policy: Arc::new(PolicySnapshot::build(Config::default()).unwrap()),
            received_at: Instant::now(),
        }
    }

    fn empty_request() -> Request<PipelineBody> {
        Request::builder()
            .uri("/")
            .body(buffered_body(Bytes::new()))
            .unwrap()
    }

    struct Tag {
        label: &'static str,
        trace: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Middleware for Tag {
        async fn handle(
            &self,
            req: Request<PipelineBody>,
            ctx: &RequestContext,
            next: Next<'_>,
        ) -> Response<Bytes> {
            self.trace.lock().push(format!("enter:{}", self.label));
            let response = next.run(req, ctx).await;
            self.trace.lock().push(format!("exit:{}", self.label));
            response
        }

        fn name(&self) -> &'static str {
            self.label
        }
    }

    struct ShortCircuit;

    #[async_trait]
    impl Middleware for ShortCircuit {
        async fn handle(
            &self,
            _req: Request<PipelineBody>,
            _ctx: &RequestContext,
            _next: Next<'_>,
        ) -> Response<Bytes> {
            text_response(StatusCode::FORBIDDEN, "Forbidden")
        }

        fn name(&self) -> &'static str {
            "short_circuit"
        }
    }

    struct Panicking;

    #[async_trait]
    impl Middleware for Panicking {
        async fn handle(
            &self,
            _req: Request<PipelineBody>,
            _ctx: &RequestContext,
            _next: Next<'_>,
        ) -> Response<Bytes> {
            panic!("boom");
        }

        fn name(&self) -> &'static str {
            "panicking"
        }
    }

    struct Terminal {
        trace: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Handler for Terminal {
        async fn call(&self, _req: Request<PipelineBody>, _ctx: &RequestContext) -> Response<Bytes> {
            self.trace.lock().push("terminal".to_string());
            text_response(StatusCode::OK, "OK")
        }
    }

    #[tokio::test]
    async fn test_stages_run_in_order_and_unwind() {
        let trace = Arc::new(Mutex::new(Vec::new()));
        let chain = Arc::new(Chain::new(
            Arc::new(Terminal {
                trace: trace.clone(),
            }),
            vec![
                Arc::new(Tag {
                    label: "outer",
                    trace: trace.clone(),
                }),
                Arc::new(Tag {
                    label: "inner",
                    trace: trace.clone(),
                }),
            ],
        ));

        let response = chain.execute(empty_request(), test_ctx()).await;
        assert_eq!(response.status(), StatusCode::OK);

        let seen = trace.lock().clone();
        assert_eq!(
            seen,
            vec![
                "enter:outer",
                "enter:inner",
                "terminal",
                "exit:inner",
                "exit:outer"
            ]
        );
    }

    #[tokio::test]
    async fn test_short_circuit_skips_inner_stages() {
        let trace = Arc::new(Mutex::new(Vec::new()));
        let chain = Arc::new(Chain::new(
            Arc::new(Terminal {
                trace: trace.clone(),
            }),
            vec![
                Arc::new(Tag {
                    label: "outer",
                    trace: trace.clone(),
                }),
                Arc::new(ShortCircuit),
                Arc::new(Tag {
                    label: "inner",
                    trace: trace.clone(),
                }),
            ],
        ));

        let response = chain.execute(empty_request(), test_ctx()).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let seen = trace.lock().clone();
        assert_eq!(seen, vec!["enter:outer", "exit:outer"]);
    }

    #[tokio::test]
    async fn test_panic_becomes_500() {
        let trace = Arc::new(Mutex::new(Vec::new()));
        let chain = Arc::new(Chain::new(
            Arc::new(Terminal { trace }),
            vec![Arc::new(Panicking)],
        ));

        let response = chain.execute(empty_request(), test_ctx()).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
