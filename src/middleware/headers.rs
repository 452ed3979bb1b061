//! Request identification and security response headers

use async_trait::async_trait;
use hyper::body::Bytes;
use hyper::header::HeaderValue;
use hyper::{Request, Response};
use rand::Rng;

use crate::middleware::{Middleware, Next, PipelineBody, RequestContext};

const REQUEST_ID_HEADER: &str = "x-request-id";

/// Propagates a client-supplied `X-Request-ID` or generates a fresh one
/// (16 random bytes, hex-encoded) and sets it on the response.
pub struct RequestId;

#[async_trait]
impl Middleware for RequestId {
    async fn handle(
        &self,
        req: Request<PipelineBody>,
        ctx: &RequestContext,
        next: Next<'_>,
    ) -> Response<Bytes> {
        let request_id = req
            .headers()
            .get(REQUEST_ID_HEADER)
            .cloned()
            .unwrap_or_else(generate_request_id);

        let mut response = next.run(req, ctx).await;
        response.headers_mut().insert(REQUEST_ID_HEADER, request_id);
        response
    }

    fn name(&self) -> &'static str {
        "request_id"
    }
}

fn generate_request_id() -> HeaderValue {
    let id: u128 = rand::thread_rng().gen();
    let hex = format!("{:032x}", id);
    // 32 lowercase hex characters are always a valid header value
    HeaderValue::from_str(&hex).unwrap_or_else(|_| HeaderValue::from_static("invalid"))
}

/// Sets the standard security headers on every response.
pub struct SecureHeaders;

#[async_trait]
impl Middleware for SecureHeaders {
    async fn handle(
        &self,
        req: Request<PipelineBody>,
        ctx: &RequestContext,
        next: Next<'_>,
    ) -> Response<Bytes> {
        let mut response = next.run(req, ctx).await;

        let headers = response.headers_mut();
        headers.insert(
            "x-content-type-options",
            HeaderValue::from_static("nosniff"),
        );
        headers.insert("x-frame-options", HeaderValue::from_static("DENY"));
        headers.insert(
            "x-xss-protection",
            HeaderValue::from_static("1; mode=block"),
        );
        headers.insert(
            "strict-transport-security",
            HeaderValue::from_static("max-age=31536000; includeSubDomains"),
        );
        response
    }

    fn name(&self) -> &'static str {
        "secure_headers"
    }
}
