//! Request logging
//!
//! Records one entry per completed request: structured log line plus a
//! dashboard entry forwarded through the stats collector's bounded channel.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use hyper::body::Bytes;
use hyper::{Request, Response};
use tracing::info;

use crate::middleware::{Middleware, Next, PipelineBody, RequestContext};
use crate::stats::{LogEntry, Stats};

pub struct RequestLogger {
    stats: Arc<Stats>,
}

impl RequestLogger {
    pub fn new(stats: Arc<Stats>) -> Self {
        Self { stats }
    }
}

#[async_trait]
impl Middleware for RequestLogger {
    async fn handle(
        &self,
        req: Request<PipelineBody>,
        ctx: &RequestContext,
        next: Next<'_>,
    ) -> Response<Bytes> {
        let start = Instant::now();
        let method = req.method().to_string();
        let path = req.uri().path().to_string();

        let response = next.run(req, ctx).await;

        let latency = start.elapsed();
        let status = response.status().as_u16();
        let action = if status == 403 || status == 429 {
            "BLOCKED"
        } else {
            "ALLOWED"
        };
        let client_ip = ctx.client_addr.ip().to_string();

        info!(
            client_ip = %client_ip,
            method = %method,
            path = %path,
            status_code = status,
            latency = ?latency,
            action,
            "Request processed"
        );

        self.stats.push_log(LogEntry {
            timestamp: chrono::Utc::now().to_rfc3339(),
            client_ip,
            method,
            path,
            status_code: status,
            latency: format!("{:?}", latency),
            action: action.to_string(),
        });

        response
    }

    fn name(&self) -> &'static str {
        "request_logger"
    }
}
