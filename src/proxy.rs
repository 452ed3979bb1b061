//! Upstream request forwarding
//!
//! Handles forwarding to a chosen backend with:
//! - Connection pooling across backends
//! - Header rewriting (Host, X-Forwarded-Host, X-Forwarded-For, X-Real-IP)
//! - Hop-by-hop header stripping
//! - A bounded upstream request timeout

use std::net::SocketAddr;
use std::time::Duration;

use http_body_util::BodyExt;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, HOST};
use hyper::{HeaderMap, Request, Response, Uri};
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;

use crate::balancer::Backend;
use crate::error::{ProxyError, Result};
use crate::middleware::PipelineBody;

/// Request-level upstream timeout, covering dial, send, and response read.
pub const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(30);

/// Pooled client used to forward requests to any backend
pub struct UpstreamClient {
    client: Client<HttpConnector, PipelineBody>,
}

impl Default for UpstreamClient {
    fn default() -> Self {
        Self::new()
    }
}

impl UpstreamClient {
    pub fn new() -> Self {
        let client = Client::builder(TokioExecutor::new()).build_http();
        Self { client }
    }

    /// Forward `req` to `backend`, buffering the upstream response.
    ///
    /// The original path and query are preserved; `Host` is overridden with
    /// the upstream authority and the original host moves to
    /// `X-Forwarded-Host`. All other client headers, including `Cookie`,
    /// travel unchanged, and response headers, including `Set-Cookie`, are
    /// returned verbatim.
    pub async fn forward(
        &self,
        mut req: Request<PipelineBody>,
        backend: &Backend,
        client_addr: SocketAddr,
    ) -> Result<Response<Bytes>> {
        let path_and_query = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");

        let upstream_uri: Uri = format!(
            "{}://{}{}",
            backend.url.scheme(),
            backend.authority,
            path_and_query
        )
        .parse()
        .map_err(|e| ProxyError::Upstream(format!("failed to build upstream URI: {}", e)))?;

        let original_host = req.headers().get(HOST).cloned();
        *req.uri_mut() = upstream_uri;

        rewrite_headers(
            req.headers_mut(),
            &backend.authority_value,
            original_host,
            client_addr,
        );

        let response = tokio::time::timeout(UPSTREAM_TIMEOUT, self.client.request(req))
            .await
            .map_err(|_| ProxyError::UpstreamTimeout)?
            .map_err(|e| ProxyError::Upstream(e.to_string()))?;

        let (mut parts, body) = response.into_parts();
        let body_bytes = body
            .collect()
            .await
            .map_err(|e| ProxyError::Upstream(format!("failed to read upstream response: {}", e)))?
            .to_bytes();

        // The body is re-emitted whole, so connection-level framing headers
        // from the upstream no longer apply.
        parts.headers.remove("connection");
        parts.headers.remove("keep-alive");
        parts.headers.remove("transfer-encoding");

        Ok(Response::from_parts(parts, body_bytes))
    }
}

/// Rewrite request headers for the upstream hop
fn rewrite_headers(
    headers: &mut HeaderMap,
    upstream_authority: &HeaderValue,
    original_host: Option<HeaderValue>,
    client_addr: SocketAddr,
) {
    let client_ip = client_addr.ip().to_string();

    if let Some(host) = original_host {
        headers.insert("x-forwarded-host", host);
    }
    headers.insert(HOST, upstream_authority.clone());

    if let Some(existing) = headers.get("x-forwarded-for") {
        if let Ok(value) = existing.to_str() {
            let new_value = format!("{}, {}", value, client_ip);
            if let Ok(parsed) = new_value.parse() {
                headers.insert("x-forwarded-for", parsed);
            }
        }
    } else if let Ok(parsed) = client_ip.parse() {
        headers.insert("x-forwarded-for", parsed);
    }

    if let Ok(parsed) = client_ip.parse() {
        headers.insert("x-real-ip", parsed);
    }

    headers.remove("connection");
    headers.remove("keep-alive");
    headers.remove("proxy-authenticate");
    headers.remove("proxy-authorization");
    headers.remove("te");
    headers.remove("trailers");
    headers.remove("transfer-encoding");
    headers.remove("upgrade");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "203.0.113.9:40000".parse().unwrap()
    }

    #[test]
    fn test_rewrite_sets_host_and_forwarded_host() {
        let mut headers = HeaderMap::new();
        headers.insert(HOST, "public.example.com".parse().unwrap());
        let authority = HeaderValue::from_static("backend:3000");

        let original = headers.get(HOST).cloned();
        rewrite_headers(&mut headers, &authority, original, addr());

        assert_eq!(headers.get(HOST).unwrap(), "backend:3000");
        assert_eq!(
            headers.get("x-forwarded-host").unwrap(),
            "public.example.com"
        );
        assert_eq!(headers.get("x-real-ip").unwrap(), "203.0.113.9");
        assert_eq!(headers.get("x-forwarded-for").unwrap(), "203.0.113.9");
    }

    #[test]
    fn test_rewrite_appends_to_existing_forwarded_for() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "198.51.100.1".parse().unwrap());
        let authority = HeaderValue::from_static("backend:3000");

        rewrite_headers(&mut headers, &authority, None, addr());

        assert_eq!(
            headers.get("x-forwarded-for").unwrap(),
            "198.51.100.1, 203.0.113.9"
        );
    }

    #[test]
    fn test_rewrite_strips_hop_by_hop_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", "keep-alive".parse().unwrap());
        headers.insert("upgrade", "h2c".parse().unwrap());
        headers.insert("cookie", "session=abc".parse().unwrap());
        let authority = HeaderValue::from_static("backend:3000");

        rewrite_headers(&mut headers, &authority, None, addr());

        assert!(headers.get("connection").is_none());
        assert!(headers.get("upgrade").is_none());
        // Cookies survive the hop
        assert_eq!(headers.get("cookie").unwrap(), "session=abc");
    }
}
