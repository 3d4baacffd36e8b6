use std::sync::Arc;
use std::sync::atomic::Ordering;

use futures_util::StreamExt;
use log::{debug, warn};

use crate::errors::{self, ForwardError};
use crate::forwarder::{self, ForwardContext};
use crate::metrics::METRICS;
use crate::protocol::{Frame, RequestPayload, SseChunkPayload, SseEndPayload, SseStartPayload};

// ------------------------------------------------------------
// SSE streamer
// ------------------------------------------------------------
//
// Streaming variant of the forwarder. An event-stream response has no
// natural end, so instead of collecting the body it is relayed chunk
// by chunk as it arrives:
//
//     sse-start {status, headers}
//     sse-chunk {chunk} …
//     sse-end   {reason}
//
// No retry: a broken stream cannot be resumed transparently, the
// public client has to reconnect anyway.
//

/// Clean-close reason reported to the broker.
const REASON_ENDED: &str = "stream_ended";

/// Mid-stream failure reason.
const REASON_ERROR: &str = "stream_error";

/// Relays one SSE request. Connect failures synthesize a normal error
/// response; failures after `sse-start` can only end the stream.
pub async fn stream(ctx: Arc<ForwardContext>, req: RequestPayload) {
    let resp = match dial(&ctx, &req).await {
        Ok(resp) => resp,
        Err(err) => {
            warn!("[{}] SSE connect to {} failed: {}", req.id, req.path, err);
            ctx.breaker.lock().await.record_error();
            METRICS.forward_errors.fetch_add(1, Ordering::Relaxed);
            forwarder::send_response(
                &ctx,
                errors::error_response(&req.id, &ctx.config.origin_authority(), &err),
            )
            .await;
            return;
        }
    };

    // Reaching the origin is what the breaker cares about; the stream
    // ending badly later is the origin's own business.
    ctx.breaker.lock().await.record_success();
    METRICS.sse_streams_started.fetch_add(1, Ordering::Relaxed);

    let status = resp.status().as_u16();
    let headers = forwarder::flatten_headers(resp.headers());
    debug!("[{}] SSE stream open, status {}", req.id, status);

    forwarder::send_frame(
        &ctx,
        Frame::SseStart(SseStartPayload {
            request_id: req.id.clone(),
            status,
            headers,
        }),
    )
    .await;

    let mut body = resp.bytes_stream();
    while let Some(next) = body.next().await {
        match next {
            Ok(chunk) => {
                METRICS.sse_chunks_sent.fetch_add(1, Ordering::Relaxed);
                forwarder::send_frame(
                    &ctx,
                    Frame::SseChunk(SseChunkPayload {
                        request_id: req.id.clone(),
                        chunk: String::from_utf8_lossy(&chunk).to_string(),
                    }),
                )
                .await;
            }
            Err(e) => {
                warn!("[{}] SSE stream error: {}", req.id, e);
                ctx.breaker.lock().await.record_error();
                end_stream(&ctx, &req.id, REASON_ERROR).await;
                return;
            }
        }
    }

    debug!("[{}] SSE stream ended cleanly", req.id);
    end_stream(&ctx, &req.id, REASON_ENDED).await;
}

async fn dial(
    ctx: &ForwardContext,
    req: &RequestPayload,
) -> Result<reqwest::Response, ForwardError> {
    let url = format!("{}{}", ctx.config.origin_base_url(), req.path);
    let method =
        reqwest::Method::from_bytes(req.method.as_bytes()).unwrap_or(reqwest::Method::GET);

    // The SSE client carries the long connect deadline and no overall
    // timeout, so the stream can idle for as long as the origin keeps
    // it open.
    let mut builder = ctx.sse.request(method, &url);
    for (name, value) in &req.headers {
        builder = builder.header(name, value);
    }
    if let Some(body) = &req.body {
        builder = builder.body(body.clone());
    }

    builder
        .send()
        .await
        .map_err(|e| ForwardError::new(errors::classify(&e), e.to_string()))
}

async fn end_stream(ctx: &ForwardContext, request_id: &str, reason: &str) {
    forwarder::send_frame(
        ctx,
        Frame::SseEnd(SseEndPayload {
            request_id: request_id.to_string(),
            reason: Some(reason.to_string()),
        }),
    )
    .await;
}
