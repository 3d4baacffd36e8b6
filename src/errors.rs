use std::collections::HashMap;
use std::io;
use std::time::Duration;

use crate::protocol::ResponsePayload;

// ------------------------------------------------------------
// Error taxonomy
// ------------------------------------------------------------
//
// Origin failures are classified at the error-kind level (reqwest and
// io kinds), then mapped onto the wire taxonomy the broker understands.
// The wire names intentionally mirror the classic errno spellings the
// protocol grew up with, but no message substring matching happens on
// this side.
//

/// Failure class of a single origin attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The attempt exceeded its deadline.
    Timeout,
    /// Nothing is listening on the origin port (ECONNREFUSED family).
    ConnectionRefused,
    /// The origin hostname does not resolve.
    HostNotFound,
    /// The origin dropped an established connection (ECONNRESET family).
    ConnectionReset,
    /// The network or host is unroutable (ENETUNREACH / EHOSTUNREACH).
    NetworkUnreachable,
    /// Anything else. Never retried.
    Other,
}

impl ErrorKind {
    /// Transport errors and timeouts are worth another attempt;
    /// everything else fails immediately.
    pub fn is_retryable(self) -> bool {
        !matches!(self, ErrorKind::Other)
    }

    /// HTTP status of the synthesized response for this kind.
    pub fn status(self) -> u16 {
        match self {
            ErrorKind::Timeout => 504,
            ErrorKind::ConnectionRefused
            | ErrorKind::HostNotFound
            | ErrorKind::ConnectionReset
            | ErrorKind::NetworkUnreachable => 502,
            ErrorKind::Other => 500,
        }
    }

    /// Wire identifier, used in `errorType` fields and `X-Error-Type`.
    pub fn error_type(self) -> &'static str {
        match self {
            ErrorKind::Timeout => "timeout",
            ErrorKind::ConnectionRefused => "connection-refused",
            ErrorKind::HostNotFound => "host-not-found",
            ErrorKind::ConnectionReset => "connection-reset",
            ErrorKind::NetworkUnreachable => "network-unreachable",
            ErrorKind::Other => "unknown-error",
        }
    }

    /// Human-readable summary for the synthesized body.
    pub fn summary(self) -> &'static str {
        match self {
            ErrorKind::Timeout => "Request to local server timed out",
            ErrorKind::ConnectionRefused => "Connection refused by local server",
            ErrorKind::HostNotFound => "Local server host not found",
            ErrorKind::ConnectionReset => "Connection reset by local server",
            ErrorKind::NetworkUnreachable => "Local server network unreachable",
            ErrorKind::Other => "Error forwarding request to local server",
        }
    }
}

/// One failed origin attempt: the class plus the underlying detail.
#[derive(Debug, Clone)]
pub struct ForwardError {
    pub kind: ErrorKind,
    pub detail: String,
}

impl ForwardError {
    pub fn new(kind: ErrorKind, detail: impl Into<String>) -> Self {
        ForwardError {
            kind,
            detail: detail.into(),
        }
    }
}

impl std::fmt::Display for ForwardError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind.error_type(), self.detail)
    }
}

impl std::error::Error for ForwardError {}

// ------------------------------------------------------------
// Classification
// ------------------------------------------------------------

/// Classifies a reqwest failure into the wire taxonomy.
///
/// Walks the error source chain looking for an `io::Error`, whose kind
/// is authoritative. DNS failures never surface as an io kind, so those
/// are recognized from the resolver error text as a last resort.
pub fn classify(err: &reqwest::Error) -> ErrorKind {
    if err.is_timeout() {
        return ErrorKind::Timeout;
    }

    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = source {
        if let Some(io_err) = e.downcast_ref::<io::Error>() {
            return classify_io(io_err);
        }
        let text = e.to_string().to_ascii_lowercase();
        if text.contains("dns error") || text.contains("failed to lookup") {
            return ErrorKind::HostNotFound;
        }
        source = e.source();
    }

    ErrorKind::Other
}

fn classify_io(err: &io::Error) -> ErrorKind {
    match err.kind() {
        io::ErrorKind::ConnectionRefused => ErrorKind::ConnectionRefused,
        io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted | io::ErrorKind::BrokenPipe => {
            ErrorKind::ConnectionReset
        }
        io::ErrorKind::TimedOut => ErrorKind::Timeout,
        io::ErrorKind::NetworkUnreachable | io::ErrorKind::HostUnreachable => {
            ErrorKind::NetworkUnreachable
        }
        _ => ErrorKind::Other,
    }
}

// ------------------------------------------------------------
// Retry pacing
// ------------------------------------------------------------

/// Delay before retry attempt `n` (1-indexed).
///
/// Timeouts back off more gently than hard transport errors: a slow
/// origin deserves more patience than a dead one.
pub fn retry_delay(kind: ErrorKind, attempt: u32) -> Duration {
    let n = attempt.max(1);
    let ms = match kind {
        ErrorKind::Timeout => (2000.0 * 1.5_f64.powi(n as i32 - 1)).min(8000.0),
        _ => (1000.0 * 2.0_f64.powi(n as i32 - 1)).min(5000.0),
    };
    Duration::from_millis(ms as u64)
}

// ------------------------------------------------------------
// Synthesized responses
// ------------------------------------------------------------

/// Builds the response frame payload for a request that could not be
/// forwarded, so the broker still gets something to answer with.
pub fn error_response(
    request_id: &str,
    origin_authority: &str,
    err: &ForwardError,
) -> ResponsePayload {
    let body = serde_json::json!({
        "error": err.kind.summary(),
        "errorType": err.kind.error_type(),
        "requestId": request_id,
        "localServer": origin_authority,
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "details": err.detail,
    });

    let mut headers = HashMap::new();
    headers.insert("Content-Type".to_string(), "application/json".to_string());
    headers.insert(
        "X-Error-Type".to_string(),
        err.kind.error_type().to_string(),
    );
    headers.insert("X-Local-Server".to_string(), origin_authority.to_string());

    ResponsePayload {
        id: request_id.to_string(),
        status: err.kind.status(),
        headers,
        body: body.to_string(),
        is_base64: false,
    }
}

/// Builds the 503 rejection emitted while the circuit breaker is open.
/// The origin is never dialed for these.
pub fn breaker_response(request_id: &str, retry_after_secs: u64) -> ResponsePayload {
    let body = serde_json::json!({
        "error": "Local server is unavailable, requests are temporarily rejected",
        "errorType": "circuit-breaker-open",
        "requestId": request_id,
        "retryAfterSeconds": retry_after_secs,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    });

    let mut headers = HashMap::new();
    headers.insert("Content-Type".to_string(), "application/json".to_string());
    headers.insert(
        "X-Error-Type".to_string(),
        "circuit-breaker-open".to_string(),
    );
    headers.insert("Retry-After".to_string(), retry_after_secs.to_string());

    ResponsePayload {
        id: request_id.to_string(),
        status: 503,
        headers,
        body: body.to_string(),
        is_base64: false,
    }
}
