use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Central frame enum for the broker control channel.
///
/// Every message on the tunnel WebSocket is one JSON text frame of the
/// shape `{"type": …, "data": {…}}`. The `type` tag and the `data`
/// envelope are added by serde and used for routing on both ends.
///
/// DESIGN NOTES:
/// - This enum is the wire contract with the broker. Any change here
///   affects every deployed broker and client.
/// - Field names inside payloads are camelCase on the wire; structs
///   below map them via serde renames.
///
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum Frame {
    /// Public HTTP request relayed by the broker.
    Request(RequestPayload),

    /// Response to a relayed request, correlated by id.
    Response(ResponsePayload),

    /// One slice of a larger logical frame.
    Chunk(ChunkPayload),

    /// Start of a server-sent-events stream (status + headers).
    SseStart(SseStartPayload),

    /// One body chunk of an SSE stream.
    SseChunk(SseChunkPayload),

    /// End of an SSE stream.
    SseEnd(SseEndPayload),

    /// Keepalive probe. Either side may send one.
    Ping(PingPayload),

    /// Keepalive reply.
    Pong(PingPayload),
}

impl Frame {
    /// The wire name of this frame's type tag.
    pub fn kind(&self) -> FrameKind {
        match self {
            Frame::Request(_) => FrameKind::Request,
            Frame::Response(_) => FrameKind::Response,
            Frame::Chunk(_) => FrameKind::Chunk,
            Frame::SseStart(_) => FrameKind::SseStart,
            Frame::SseChunk(_) => FrameKind::SseChunk,
            Frame::SseEnd(_) => FrameKind::SseEnd,
            Frame::Ping(_) => FrameKind::Ping,
            Frame::Pong(_) => FrameKind::Pong,
        }
    }
}

/// Frame type tag, used standalone in chunk frames (`originalType`).
///
/// In practice only `request` and `response` frames ever grow past the
/// chunking threshold, but the tag carries whatever type was split.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum FrameKind {
    Request,
    Response,
    Chunk,
    SseStart,
    SseChunk,
    SseEnd,
    Ping,
    Pong,
}

// ------------------------------------------------------------
// Request / response payloads
// ------------------------------------------------------------
//
// The broker flattens public HTTP traffic into these shapes. Headers
// travel as a flat string map; multi-valued headers are pre-joined
// with ", " on whichever side flattened them.
//

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct RequestPayload {
    /// Correlation id, opaque to the client.
    pub id: String,

    /// HTTP method ("GET", "POST", …).
    pub method: String,

    /// Path plus query string, starting with "/".
    pub path: String,

    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Request body as a UTF-8 string, when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ResponsePayload {
    /// Correlation id copied from the request.
    pub id: String,

    pub status: u16,

    /// Response headers, lowercased names, multi-values joined with ", ".
    pub headers: HashMap<String, String>,

    /// Body text, or base64 of the body bytes when `isBase64` is set.
    pub body: String,

    #[serde(rename = "isBase64")]
    pub is_base64: bool,
}

// ------------------------------------------------------------
// Chunk payload
// ------------------------------------------------------------
//
// Carries a slice of an oversized serialized frame. The receiver keys
// an assembly on `messageId` and re-parses the concatenation once all
// `totalChunks` slices arrived.
//

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChunkPayload {
    pub message_id: String,

    /// Zero-based position of this slice.
    pub chunk_index: usize,

    pub total_chunks: usize,

    /// Slice text. Never splits a UTF-8 code point.
    pub chunk: String,

    /// Type tag of the frame that was split.
    pub original_type: FrameKind,
}

// ------------------------------------------------------------
// SSE payloads
// ------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SseStartPayload {
    pub request_id: String,
    pub status: u16,
    pub headers: HashMap<String, String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SseChunkPayload {
    pub request_id: String,
    pub chunk: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SseEndPayload {
    pub request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

// ------------------------------------------------------------
// Keepalive payload
// ------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PingPayload {
    /// Milliseconds since the Unix epoch at send time.
    pub timestamp: i64,
}

// ------------------------------------------------------------
// Broker registration
// ------------------------------------------------------------

/// Response body of `POST {broker}/api/tunnels` and `GET {broker}/?new`.
#[derive(Debug, Deserialize, Clone)]
pub struct RegisterResponse {
    pub id: String,
    pub url: String,
    #[serde(default)]
    pub cached_url: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    /// Human-readable note from the broker, surfaced on failures.
    #[serde(default)]
    pub message: Option<String>,
}

/// Tunnel coordinates assigned by the broker. Read-only after
/// registration.
#[derive(Debug, Clone)]
pub struct TunnelInfo {
    pub id: String,
    pub url: String,
    pub cached_url: Option<String>,
    pub port: Option<u16>,
}

impl From<RegisterResponse> for TunnelInfo {
    fn from(r: RegisterResponse) -> Self {
        TunnelInfo {
            id: r.id,
            url: r.url,
            cached_url: r.cached_url,
            port: r.port,
        }
    }
}
