use std::sync::Arc;
use std::sync::atomic::AtomicUsize;

use once_cell::sync::Lazy;

/// Global runtime metrics for the tunnel client.
///
/// Purpose:
/// - Track forwarded traffic (requests / responses / SSE chunks)
/// - Track chunking activity (split and reassembled messages)
/// - Track failure modes (retries, parse errors, breaker trips)
/// - Track connection churn (reconnects)
///
/// Design:
/// - Lock-free (Atomics)
/// - Cheap to update
/// - Safe in async + multithreaded contexts
#[derive(Default)]
pub struct RuntimeMetrics {
    // Traffic
    pub requests_received: AtomicUsize,
    pub responses_sent: AtomicUsize,
    pub sse_streams_started: AtomicUsize,
    pub sse_chunks_sent: AtomicUsize,

    // Chunking
    pub chunks_sent: AtomicUsize,
    pub chunks_received: AtomicUsize,
    pub reassemblies_completed: AtomicUsize,
    pub reassemblies_discarded: AtomicUsize,

    // Failures
    pub forward_retries: AtomicUsize,
    pub forward_errors: AtomicUsize,
    pub parse_errors: AtomicUsize,
    pub breaker_trips: AtomicUsize,

    // Connection
    pub ws_reconnects: AtomicUsize,
    pub pings_sent: AtomicUsize,
}

/// Global metrics registry (singleton)
pub static METRICS: Lazy<Arc<RuntimeMetrics>> =
    Lazy::new(|| Arc::new(RuntimeMetrics::default()));
