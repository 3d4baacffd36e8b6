use std::collections::HashMap;
use std::io::Read;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use log::{debug, error, warn};
use tokio::sync::Mutex;

use crate::chunks;
use crate::config::{TlsOptions, TunnelConfig};
use crate::errors::{self, ErrorKind, ForwardError};
use crate::health::{CircuitBreaker, HealthProber};
use crate::metrics::METRICS;
use crate::protocol::{Frame, RequestPayload, ResponsePayload};
use crate::session::OutboundQueue;
use crate::sse;

// ------------------------------------------------------------
// Forward context
// ------------------------------------------------------------
//
// Everything one relayed request needs, shared across the concurrent
// per-request tasks the session spawns. The origin client is built
// once at session start; when TLS material is unreadable the build
// error is kept and every request fails with it instead of taking the
// whole session down.
//

pub struct ForwardContext {
    pub config: Arc<TunnelConfig>,
    pub origin: Result<reqwest::Client, String>,
    pub sse: reqwest::Client,
    pub breaker: Arc<Mutex<CircuitBreaker>>,
    pub prober: Arc<Mutex<HealthProber>>,
    pub outbound: OutboundQueue,
}

// ------------------------------------------------------------
// Client construction
// ------------------------------------------------------------

/// HTTP client for regular forwarding and health probes.
///
/// Redirects are never followed; the public caller sees whatever the
/// origin answered, redirect or not.
pub fn build_origin_client(cfg: &TunnelConfig) -> Result<reqwest::Client, String> {
    let builder = reqwest::Client::builder().redirect(reqwest::redirect::Policy::none());
    apply_tls(builder, &cfg.tls)?
        .build()
        .map_err(|e| format!("building origin HTTP client: {}", e))
}

/// Dial deadline for SSE connections.
pub const SSE_CONNECT_TIMEOUT: Duration = Duration::from_secs(300);

/// HTTP client for SSE streams: generous connect deadline, no overall
/// request timeout so a quiet stream can stay open indefinitely.
pub fn build_sse_client(cfg: &TunnelConfig) -> Result<reqwest::Client, String> {
    let builder = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .connect_timeout(SSE_CONNECT_TIMEOUT);
    apply_tls(builder, &cfg.tls)?
        .build()
        .map_err(|e| format!("building SSE HTTP client: {}", e))
}

fn apply_tls(
    mut builder: reqwest::ClientBuilder,
    tls: &TlsOptions,
) -> Result<reqwest::ClientBuilder, String> {
    if tls.allow_invalid_cert {
        return Ok(builder.danger_accept_invalid_certs(true));
    }
    if !tls.use_tls {
        return Ok(builder);
    }
    if let (Some(cert), Some(key)) = (&tls.cert_path, &tls.key_path) {
        let mut pem = std::fs::read(cert)
            .map_err(|e| format!("cannot read client certificate '{}': {}", cert, e))?;
        pem.extend(
            std::fs::read(key).map_err(|e| format!("cannot read client key '{}': {}", key, e))?,
        );
        let identity = reqwest::Identity::from_pem(&pem)
            .map_err(|e| format!("invalid client certificate/key: {}", e))?;
        builder = builder.identity(identity);

        if let Some(ca) = &tls.ca_path {
            let ca_pem =
                std::fs::read(ca).map_err(|e| format!("cannot read CA file '{}': {}", ca, e))?;
            let ca_cert = reqwest::Certificate::from_pem(&ca_pem)
                .map_err(|e| format!("invalid CA certificate: {}", e))?;
            builder = builder.add_root_certificate(ca_cert);
        }
    }
    Ok(builder)
}

// ------------------------------------------------------------
// Request handling
// ------------------------------------------------------------

/// Forwards one relayed request to the origin and writes the response
/// frame back. Runs as its own task; many of these are in flight at
/// once, correlated purely by request id.
pub async fn handle_request(ctx: Arc<ForwardContext>, req: RequestPayload) {
    METRICS.requests_received.fetch_add(1, Ordering::Relaxed);

    // Breaker gate. Rejected requests never touch the origin and do
    // not count as further errors.
    if ctx.breaker.lock().await.is_open() {
        debug!("[{}] rejected by open circuit breaker", req.id);
        send_response(&ctx, errors::breaker_response(&req.id, 30)).await;
        return;
    }

    if is_sse_request(&req) {
        sse::stream(ctx, req).await;
        return;
    }

    let client = match &ctx.origin {
        Ok(c) => c.clone(),
        Err(setup_err) => {
            let err = ForwardError::new(ErrorKind::Other, setup_err.clone());
            fail_request(&ctx, &req, err).await;
            return;
        }
    };

    let max_retries = ctx.config.max_retries;
    let mut retry: u32 = 0;
    loop {
        match attempt_once(&ctx, &client, &req, retry).await {
            Ok(resp) => {
                ctx.breaker.lock().await.record_success();
                debug!("[{}] {} {} -> {}", req.id, req.method, req.path, resp.status);
                send_response(&ctx, resp).await;
                METRICS.responses_sent.fetch_add(1, Ordering::Relaxed);
                return;
            }
            Err(err) if err.kind.is_retryable() && retry < max_retries => {
                retry += 1;
                METRICS.forward_retries.fetch_add(1, Ordering::Relaxed);
                let delay = errors::retry_delay(err.kind, retry);
                debug!(
                    "[{}] attempt {} failed ({}), retrying in {:?}",
                    req.id, retry, err, delay
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => {
                fail_request(&ctx, &req, err).await;
                return;
            }
        }
    }
}

/// One try against the origin, health gate included.
///
/// The gate runs on the first attempt and again from the fourth on;
/// the attempts in between dial directly, because a probe that just
/// failed would only repeat what the dial is about to discover.
async fn attempt_once(
    ctx: &ForwardContext,
    client: &reqwest::Client,
    req: &RequestPayload,
    retry: u32,
) -> Result<ResponsePayload, ForwardError> {
    if retry == 0 || retry >= 3 {
        let healthy = ctx.prober.lock().await.check().await;
        if !healthy {
            return Err(ForwardError::new(
                ErrorKind::ConnectionRefused,
                "origin failed health probe",
            ));
        }
    }

    let url = format!("{}{}", ctx.config.origin_base_url(), req.path);
    let method =
        reqwest::Method::from_bytes(req.method.as_bytes()).unwrap_or(reqwest::Method::GET);
    let body_len = req.body.as_ref().map_or(0, |b| b.len());
    let timeout = adaptive_timeout(
        ctx.config.timeout_ms,
        &req.method,
        &req.path,
        body_len,
        retry,
    );

    let mut builder = client.request(method, &url).timeout(timeout);
    for (name, value) in &req.headers {
        builder = builder.header(name, value);
    }
    if let Some(body) = &req.body {
        builder = builder.body(body.clone());
    }

    let resp = builder
        .send()
        .await
        .map_err(|e| ForwardError::new(errors::classify(&e), e.to_string()))?;

    let status = resp.status().as_u16();
    let mut headers = flatten_headers(resp.headers());
    let bytes = resp
        .bytes()
        .await
        .map_err(|e| ForwardError::new(errors::classify(&e), e.to_string()))?;

    let (body, is_base64) = encode_body(&mut headers, &bytes);
    Ok(ResponsePayload {
        id: req.id.clone(),
        status,
        headers,
        body,
        is_base64,
    })
}

async fn fail_request(ctx: &ForwardContext, req: &RequestPayload, err: ForwardError) {
    warn!("[{}] {} {} failed: {}", req.id, req.method, req.path, err);
    ctx.breaker.lock().await.record_error();
    METRICS.forward_errors.fetch_add(1, Ordering::Relaxed);
    send_response(
        &ctx,
        errors::error_response(&req.id, &ctx.config.origin_authority(), &err),
    )
    .await;
}

/// Serializes and enqueues a response frame, chunking as needed.
pub(crate) async fn send_response(ctx: &ForwardContext, payload: ResponsePayload) {
    send_frame(ctx, Frame::Response(payload)).await;
}

/// Serializes and enqueues any outbound frame, chunking as needed.
pub(crate) async fn send_frame(ctx: &ForwardContext, frame: Frame) {
    match chunks::encode_frame(&frame) {
        Ok(batch) => {
            if !ctx.outbound.send(batch).await {
                debug!("outbound frame dropped, broker connection is gone");
            }
        }
        Err(e) => error!("failed to encode outbound frame: {}", e),
    }
}

// ------------------------------------------------------------
// SSE detection
// ------------------------------------------------------------

/// A request is treated as SSE when the client asks for an event
/// stream, the path looks like one, or the classic no-cache marker
/// is present.
pub(crate) fn is_sse_request(req: &RequestPayload) -> bool {
    if let Some(accept) = header_get(&req.headers, "accept") {
        if accept.to_ascii_lowercase().contains("text/event-stream") {
            return true;
        }
    }
    if req.path.contains("/sse") {
        return true;
    }
    header_get(&req.headers, "cache-control").is_some_and(|v| v.eq_ignore_ascii_case("no-cache"))
}

fn header_get<'a>(headers: &'a HashMap<String, String>, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

// ------------------------------------------------------------
// Adaptive timeout
// ------------------------------------------------------------

/// Scales the configured base timeout to the shape of the request.
///
/// Ladder (first match wins):
/// - API reads stay snappy
/// - writes and uploads get twice the budget
/// - retries earn growing patience
///
/// Large request bodies then stretch whatever the ladder picked, up to
/// a hard 3-minute ceiling.
pub(crate) fn adaptive_timeout(
    base_ms: u64,
    method: &str,
    path: &str,
    body_len: usize,
    retry: u32,
) -> Duration {
    let base = base_ms as f64;
    let method = method.to_ascii_uppercase();

    let mut ms = if path.contains("/api/") && method == "GET" {
        base.min(60_000.0)
    } else if method == "POST" || method == "PUT" || path.contains("/upload") {
        (base * 2.0).min(180_000.0)
    } else if retry > 0 {
        (base * 1.5_f64.powi(retry as i32)).min(60_000.0)
    } else {
        base
    };

    if body_len > 50_000 {
        let factor = (1.0 + body_len as f64 / 500_000.0).min(2.0);
        ms = (ms * factor).min(180_000.0);
    }

    Duration::from_millis(ms as u64)
}

// ------------------------------------------------------------
// Response body encoding
// ------------------------------------------------------------
//
// The frame body is a JSON string, so bytes must either be valid
// UTF-8 text or travel as base64. Compressed text is decompressed so
// the broker can serve it to clients that did not ask for the
// encoding; compressed binary and unknown codings pass through as
// base64 of the original bytes.
//

const BINARY_TYPE_PREFIXES: [&str; 3] = ["image/", "video/", "audio/"];
const BINARY_TYPES: [&str; 2] = ["application/octet-stream", "application/pdf"];

const TEXT_TYPE_MARKERS: [&str; 7] = [
    "text/",
    "application/json",
    "application/javascript",
    "application/x-javascript",
    "text/javascript",
    "application/xml",
    "application/xhtml+xml",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ContentCoding {
    Identity,
    Gzip,
    Deflate,
    Brotli,
    Unknown,
}

fn parse_coding(value: &str) -> ContentCoding {
    match value.trim().to_ascii_lowercase().as_str() {
        "" | "identity" => ContentCoding::Identity,
        "gzip" | "x-gzip" => ContentCoding::Gzip,
        "deflate" => ContentCoding::Deflate,
        "br" => ContentCoding::Brotli,
        _ => ContentCoding::Unknown,
    }
}

fn is_binary_content_type(ct: &str) -> bool {
    BINARY_TYPE_PREFIXES.iter().any(|p| ct.starts_with(p))
        || BINARY_TYPES.iter().any(|t| ct.starts_with(t))
}

fn is_text_kind(ct: &str) -> bool {
    TEXT_TYPE_MARKERS.iter().any(|m| ct.contains(m))
}

/// Decides how the body travels in the response frame and applies the
/// decision, adjusting `headers` when an encoding is removed.
pub(crate) fn encode_body(headers: &mut HashMap<String, String>, bytes: &[u8]) -> (String, bool) {
    let ct = headers
        .get("content-type")
        .map(|v| v.to_ascii_lowercase())
        .unwrap_or_default();

    if is_binary_content_type(&ct) {
        return (BASE64.encode(bytes), true);
    }

    let ce = headers
        .get("content-encoding")
        .map(|v| v.as_str())
        .unwrap_or("");
    let coding = parse_coding(ce);

    match coding {
        ContentCoding::Identity => match std::str::from_utf8(bytes) {
            Ok(s) => (s.to_string(), false),
            Err(_) => (BASE64.encode(bytes), true),
        },
        ContentCoding::Unknown => (BASE64.encode(bytes), true),
        _ if !is_text_kind(&ct) => (BASE64.encode(bytes), true),
        _ => match decompress(coding, bytes) {
            Ok(decompressed) => match String::from_utf8(decompressed) {
                Ok(s) => {
                    headers.remove("content-encoding");
                    headers.remove("content-length");
                    (s, false)
                }
                Err(_) => {
                    warn!("decompressed body is not UTF-8, passing through compressed");
                    (BASE64.encode(bytes), true)
                }
            },
            Err(e) => {
                warn!("decompression failed ({}), passing through compressed", e);
                (BASE64.encode(bytes), true)
            }
        },
    }
}

fn decompress(coding: ContentCoding, bytes: &[u8]) -> anyhow::Result<Vec<u8>> {
    let mut out = Vec::new();
    match coding {
        ContentCoding::Gzip => {
            flate2::read::GzDecoder::new(bytes).read_to_end(&mut out)?;
        }
        ContentCoding::Deflate => {
            // Origins disagree on whether "deflate" means zlib-wrapped
            // or raw; try the standard zlib wrapper first.
            if flate2::read::ZlibDecoder::new(bytes)
                .read_to_end(&mut out)
                .is_err()
            {
                out.clear();
                flate2::read::DeflateDecoder::new(bytes).read_to_end(&mut out)?;
            }
        }
        ContentCoding::Brotli => {
            brotli::Decompressor::new(bytes, 4096).read_to_end(&mut out)?;
        }
        ContentCoding::Identity | ContentCoding::Unknown => {
            anyhow::bail!("not a decompressible coding")
        }
    }
    Ok(out)
}

/// Flattens a header map into name -> joined values, lowercase names.
pub(crate) fn flatten_headers(headers: &reqwest::header::HeaderMap) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for name in headers.keys() {
        let joined = headers
            .get_all(name)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect::<Vec<_>>()
            .join(", ");
        out.insert(name.as_str().to_string(), joined);
    }
    out
}
