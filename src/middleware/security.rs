//! User-Agent denylist and rule-engine inspection
//!
//! Checks the User-Agent against the snapshot's denylist, then evaluates
//! the compiled rules. For POST/PUT/PATCH the body is buffered up to
//! [`MAX_INSPECTED_BODY_BYTES`] so body rules can run, and the buffered
//! bytes are restored for downstream handlers, which therefore observe
//! exactly the bytes the engine evaluated. Oversize bodies fail closed
//! with 413; read failures yield 500.

use async_trait::async_trait;
use http_body_util::{BodyExt, Limited};
use hyper::body::Bytes;
use hyper::header::USER_AGENT;
use hyper::{Method, Request, Response, StatusCode};
use tracing::{error, warn};

use crate::middleware::{
    buffered_body, text_response, Middleware, Next, PipelineBody, RequestContext,
};

/// Cap on the bytes buffered for body inspection
pub const MAX_INSPECTED_BODY_BYTES: usize = 1024 * 1024;

pub struct Security;

#[async_trait]
impl Middleware for Security {
    async fn handle(
        &self,
        req: Request<PipelineBody>,
        ctx: &RequestContext,
        next: Next<'_>,
    ) -> Response<Bytes> {
        let policy = &ctx.policy;

        let user_agent = req
            .headers()
            .get(USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if let Some(token) = policy.blocked_agent(user_agent) {
            warn!(
                client_ip = %ctx.client_addr,
                user_agent = if user_agent.is_empty() { "empty" } else { user_agent },
                token,
                "Blocked suspicious User-Agent"
            );
            return text_response(StatusCode::FORBIDDEN, "Forbidden");
        }

        if policy.engine.is_empty() {
            return next.run(req, ctx).await;
        }

        let inspect_body = matches!(
            req.method(),
            &Method::POST | &Method::PUT | &Method::PATCH
        );

        let req = if inspect_body {
            let (parts, body) = req.into_parts();
            let body_bytes = match Limited::new(body, MAX_INSPECTED_BODY_BYTES).collect().await {
                Ok(collected) => collected.to_bytes(),
                Err(e) if e.downcast_ref::<http_body_util::LengthLimitError>().is_some() => {
                    warn!(client_ip = %ctx.client_addr, "Request body exceeds inspection cap");
                    return text_response(StatusCode::PAYLOAD_TOO_LARGE, "Payload Too Large");
                }
                Err(e) => {
                    error!(error = %e, "Failed to read request body");
                    return text_response(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "Internal Server Error",
                    );
                }
            };

            if let Some(rule) = policy.engine.check(
                parts.uri.path(),
                parts.uri.query(),
                &parts.headers,
                &body_bytes,
            ) {
                warn!(client_ip = %ctx.client_addr, rule, "Request blocked by security rule");
                return text_response(StatusCode::FORBIDDEN, "Forbidden");
            }

            // Hand downstream exactly the bytes the engine saw
            Request::from_parts(parts, buffered_body(body_bytes))
        } else {
            if let Some(rule) =
                policy
                    .engine
                    .check(req.uri().path(), req.uri().query(), req.headers(), &[])
            {
                warn!(client_ip = %ctx.client_addr, rule, "Request blocked by security rule");
                return text_response(StatusCode::FORBIDDEN, "Forbidden");
            }
            req
        };

        next.run(req, ctx).await
    }

    fn name(&self) -> &'static str {
        "security"
    }
}
