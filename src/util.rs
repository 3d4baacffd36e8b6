/// Utility helpers shared across the tunnel session.
///
/// This module contains:
/// - Time helpers
/// - Message-id generation for chunked frames
/// - Broker URL manipulation
///
/// IMPORTANT:
/// - No forwarding or protocol business logic should live here.
/// - This module must remain lightweight and deterministic
///   (apart from the random id suffix).
///
use std::time::{SystemTime, UNIX_EPOCH};

use rand::random_range;

/// Returns the current Unix timestamp in milliseconds.
///
/// Used across the session for:
/// - Keepalive ping timestamps
/// - Chunk message ids
/// - Error body timestamps
///
/// PANIC:
/// - Panics if system time is before UNIX_EPOCH (should never happen).
///
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("System time is before UNIX_EPOCH")
        .as_millis() as i64
}

const BASE36: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Generates a message id for a chunked frame.
///
/// Format:
///     {ms-since-epoch}-{9 random base36 chars}
///
/// The timestamp prefix keeps ids roughly sortable by creation time.
/// Uniqueness only has to hold among assemblies alive at the same
/// moment on one broker connection, so nine random chars are plenty.
pub fn message_id() -> String {
    let mut suffix = String::with_capacity(9);
    for _ in 0..9 {
        suffix.push(BASE36[random_range(0..36)] as char);
    }
    format!("{}-{}", now_ms(), suffix)
}

/// Derives the broker WebSocket endpoint from the broker base URL
/// and an assigned tunnel id.
///
/// Scheme mapping:
/// - "https://…" -> "wss://…"
/// - "http://…"  -> "ws://…"
///
/// Examples:
/// - ("https://lr.example.com", "ab12") -> "wss://lr.example.com/api/tunnels/ab12/ws"
///
pub fn ws_endpoint(broker_url: &str, tunnel_id: &str) -> String {
    let base = broker_url.trim_end_matches('/');
    let ws_base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        // Already ws:// or wss://, or schemeless. Pass through unchanged.
        base.to_string()
    };
    format!("{}/api/tunnels/{}/ws", ws_base, tunnel_id)
}
