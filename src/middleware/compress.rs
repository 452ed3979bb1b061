//! Response compression
//!
//! Gzips the buffered response body when the client's `Accept-Encoding`
//! names gzip. Responses that already carry a `Content-Encoding` (for
//! example, an upstream that compressed its own body) pass through
//! untouched so bytes are never double-encoded.

use std::io::Write;

use async_trait::async_trait;
use flate2::write::GzEncoder;
use flate2::Compression;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, ACCEPT_ENCODING, CONTENT_ENCODING, CONTENT_LENGTH, VARY};
use hyper::{HeaderMap, Request, Response};
use tracing::error;

use crate::middleware::{Middleware, Next, PipelineBody, RequestContext};

pub struct Gzip;

#[async_trait]
impl Middleware for Gzip {
    async fn handle(
        &self,
        req: Request<PipelineBody>,
        ctx: &RequestContext,
        next: Next<'_>,
    ) -> Response<Bytes> {
        let accepts = accepts_gzip(req.headers());
        let response = next.run(req, ctx).await;

        if !accepts
            || response.body().is_empty()
            || response.headers().contains_key(CONTENT_ENCODING)
        {
            return response;
        }

        let (mut parts, body) = response.into_parts();
        match gzip(&body) {
            Ok(compressed) => {
                parts
                    .headers
                    .insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
                parts
                    .headers
                    .append(VARY, HeaderValue::from_static("accept-encoding"));
                // Length changed; let the server frame the new body
                parts.headers.remove(CONTENT_LENGTH);
                Response::from_parts(parts, compressed)
            }
            Err(e) => {
                error!(error = %e, "Failed to compress response, sending identity");
                Response::from_parts(parts, body)
            }
        }
    }

    fn name(&self) -> &'static str {
        "compression"
    }
}

fn accepts_gzip(headers: &HeaderMap) -> bool {
    headers
        .get_all(ACCEPT_ENCODING)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.contains("gzip"))
}

fn gzip(bytes: &Bytes) -> std::io::Result<Bytes> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(bytes.len() / 2), Compression::default());
    encoder.write_all(bytes)?;
    Ok(Bytes::from(encoder.finish()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use std::io::Read;

    #[test]
    fn test_accepts_gzip_matches_token() {
        let mut headers = HeaderMap::new();
        assert!(!accepts_gzip(&headers));

        headers.insert(ACCEPT_ENCODING, "gzip, deflate, br".parse().unwrap());
        assert!(accepts_gzip(&headers));

        headers.insert(ACCEPT_ENCODING, "identity".parse().unwrap());
        assert!(!accepts_gzip(&headers));
    }

    #[test]
    fn test_gzip_round_trip() {
        let original = Bytes::from_static(b"hello hello hello hello hello");
        let compressed = gzip(&original).unwrap();

        let mut decoder = GzDecoder::new(&compressed[..]);
        let mut decoded = Vec::new();
        decoder.read_to_end(&mut decoded).unwrap();

        assert_eq!(decoded, original);
    }
}
