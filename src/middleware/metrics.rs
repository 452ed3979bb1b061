//! Request metrics
//!
//! Counts requests, accumulates latency, buckets status codes, and counts
//! blocked outcomes (403/429). Everything is recorded twice: into the
//! process-local stats collector that feeds `/api/stats`, and through the
//! `metrics` facade for the prometheus surface.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use hyper::body::Bytes;
use hyper::{Request, Response};
use metrics::{counter, histogram};

use crate::middleware::{Middleware, Next, PipelineBody, RequestContext};
use crate::stats::Stats;

pub struct Metrics {
    stats: Arc<Stats>,
}

impl Metrics {
    pub fn new(stats: Arc<Stats>) -> Self {
        Self { stats }
    }
}

#[async_trait]
impl Middleware for Metrics {
    async fn handle(
        &self,
        req: Request<PipelineBody>,
        ctx: &RequestContext,
        next: Next<'_>,
    ) -> Response<Bytes> {
        let start = Instant::now();
        self.stats.inflight_inc();

        let response = next.run(req, ctx).await;

        let latency = start.elapsed();
        let status = response.status().as_u16();

        self.stats.inflight_dec();
        self.stats.record_request(status, latency);

        counter!("requests_total").increment(1);
        counter!("status_codes_total", "code" => status.to_string()).increment(1);
        histogram!("request_duration_seconds").record(latency.as_secs_f64());
        if status == 403 || status == 429 {
            counter!("requests_blocked_total").increment(1);
        }

        response
    }

    fn name(&self) -> &'static str {
        "metrics"
    }
}
