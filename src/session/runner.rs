use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use rand::random_range;
use tokio::sync::mpsc;
use tokio::time::{Instant, interval_at, timeout};
use tokio_tungstenite::{connect_async, tungstenite::Message};

use crate::forwarder;
use crate::metrics::METRICS;
use crate::protocol::{Frame, PingPayload};
use crate::util;

use super::{
    HANDSHAKE_TIMEOUT, KEEPALIVE_INTERVAL, LIVENESS_TIMEOUT, MAX_RECONNECT_ATTEMPTS,
    POST_REGISTER_DELAY, RECONNECT_DELAY_CAP, SessionEvent, SessionShared, sleep_or_closed,
};

/// Why a single connection ended.
enum ConnectionEnd {
    /// `close()` was called; the loop must not reconnect.
    Intentional,
    /// The broker went away or the socket broke.
    Lost,
}

/// Runs the session's connection loop until the session closes.
///
/// GUARANTEES:
/// - At most one live WebSocket at any time
/// - At most one pending reconnect delay at any time
/// - The loop always funnels into `SessionShared::close` on exit
///
pub(crate) async fn run(shared: Arc<SessionShared>) {
    // Give the broker a beat to finish setting up the tunnel route
    // before the first connect.
    if sleep_or_closed(&shared, POST_REGISTER_DELAY).await {
        shared.close().await;
        return;
    }

    let endpoint = util::ws_endpoint(&shared.config.broker_url, &shared.info.id);
    let mut attempts: u32 = 0;

    loop {
        if shared.is_closed() {
            break;
        }

        match timeout(HANDSHAKE_TIMEOUT, connect_async(&endpoint)).await {
            Ok(Ok((ws, _))) => {
                attempts = 0;
                info!("tunnel online at {}", shared.info.url);
                shared.emit(SessionEvent::Url(shared.info.url.clone()));

                let end = run_connection(&shared, ws).await;

                // Whatever was in flight can no longer answer over
                // this socket.
                for task in shared.active_tasks.lock().await.drain(..) {
                    task.abort();
                }

                if matches!(end, ConnectionEnd::Intentional) {
                    break;
                }
                METRICS.ws_reconnects.fetch_add(1, Ordering::Relaxed);
            }
            Ok(Err(e)) => {
                warn!("tunnel connect failed: {}", e);
            }
            Err(_) => {
                warn!(
                    "tunnel handshake timed out after {:?}",
                    HANDSHAKE_TIMEOUT
                );
            }
        }

        if shared.is_closed() {
            break;
        }

        attempts += 1;
        if attempts >= MAX_RECONNECT_ATTEMPTS {
            warn!("giving up after {} reconnect attempts", attempts);
            shared.emit(SessionEvent::Error(format!(
                "tunnel lost: {} reconnect attempts exhausted",
                attempts
            )));
            break;
        }

        let delay = reconnect_delay(attempts);
        info!(
            "reconnecting in {:?} (attempt {}/{})",
            delay, attempts, MAX_RECONNECT_ATTEMPTS
        );
        if sleep_or_closed(&shared, delay).await {
            break;
        }
    }

    shared.close().await;
}

/// Jittered exponential backoff for reconnect attempt `n` (1-indexed):
/// a random 1-2 s base grown by 1.5 per attempt, capped at 30 s.
fn reconnect_delay(attempt: u32) -> Duration {
    let base = random_range(1000..2000) as f64;
    let ms = (base * 1.5_f64.powi(attempt as i32 - 1))
        .min(RECONNECT_DELAY_CAP.as_millis() as f64);
    Duration::from_millis(ms as u64)
}

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Services one live WebSocket until it ends.
///
/// The select loop is the single writer: request responses arrive
/// through the outbound queue and are drained batch by batch, so a
/// chunked frame's messages never interleave with anything else.
async fn run_connection(shared: &Arc<SessionShared>, ws: WsStream) -> ConnectionEnd {
    let (mut write, mut read) = ws.split();

    // Fresh queue per connection; stale responses die with the old one.
    let (tx, mut rx) = mpsc::channel::<Vec<String>>(1024);
    shared.outbound.replace(tx).await;

    let mut keepalive = interval_at(Instant::now() + KEEPALIVE_INTERVAL, KEEPALIVE_INTERVAL);
    let mut last_inbound = Instant::now();

    loop {
        tokio::select! {
            inbound = read.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    last_inbound = Instant::now();
                    handle_text(shared, &text).await;
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                    last_inbound = Instant::now();
                }
                Some(Ok(Message::Close(_))) => {
                    info!("broker closed the tunnel connection");
                    return ConnectionEnd::Lost;
                }
                Some(Ok(_)) => {
                    // Binary frames are not part of the protocol.
                }
                Some(Err(e)) => {
                    warn!("tunnel read error: {}", e);
                    return ConnectionEnd::Lost;
                }
                None => {
                    info!("tunnel connection ended (EOF)");
                    return ConnectionEnd::Lost;
                }
            },

            outbound = rx.recv() => {
                if let Some(batch) = outbound {
                    for msg in batch {
                        if let Err(e) = write.send(Message::Text(msg.into())).await {
                            warn!("tunnel write error: {}", e);
                            return ConnectionEnd::Lost;
                        }
                    }
                }
            },

            _ = keepalive.tick() => {
                if last_inbound.elapsed() > LIVENESS_TIMEOUT {
                    warn!(
                        "no traffic for {:?}, forcing reconnect",
                        LIVENESS_TIMEOUT
                    );
                    let _ = write.send(Message::Close(None)).await;
                    return ConnectionEnd::Lost;
                }
                let ping = Frame::Ping(PingPayload { timestamp: util::now_ms() });
                let json = serde_json::to_string(&ping).expect("ping frame serializes");
                METRICS.pings_sent.fetch_add(1, Ordering::Relaxed);
                if let Err(e) = write.send(Message::Text(json.into())).await {
                    warn!("keepalive write failed: {}", e);
                    return ConnectionEnd::Lost;
                }
            },

            () = shared.close_notify.notified() => {
                let _ = write.send(Message::Close(None)).await;
                return ConnectionEnd::Intentional;
            }
        }

        if shared.is_closed() {
            return ConnectionEnd::Intentional;
        }
    }
}

/// Parses one inbound text message and routes it.
async fn handle_text(shared: &Arc<SessionShared>, text: &str) {
    match serde_json::from_str::<Frame>(text) {
        Ok(Frame::Chunk(payload)) => {
            let completed = shared.chunk_table.lock().await.ingest(payload);
            if let Some(done) = completed {
                match serde_json::from_str::<Frame>(&done.text) {
                    Ok(Frame::Chunk(_)) => {
                        warn!("reassembled message is itself a chunk, dropping");
                        METRICS.parse_errors.fetch_add(1, Ordering::Relaxed);
                    }
                    Ok(inner) => deliver(shared, inner).await,
                    Err(e) => {
                        // Not fatal: the sender gets no response, the
                        // session keeps going.
                        warn!("reassembled message failed to parse: {}", e);
                        METRICS.parse_errors.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }
        Ok(frame) => deliver(shared, frame).await,
        Err(e) => {
            warn!("unparseable frame from broker: {}", e);
            METRICS.parse_errors.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Routes one complete (never chunk) inbound frame.
async fn deliver(shared: &Arc<SessionShared>, frame: Frame) {
    match frame {
        Frame::Request(req) => {
            debug!("[{}] {} {}", req.id, req.method, req.path);
            shared.emit(SessionEvent::Request {
                method: req.method.clone(),
                path: req.path.clone(),
                headers: req.headers.clone(),
            });

            let ctx = shared.forward.clone();
            let task = tokio::spawn(forwarder::handle_request(ctx, req));

            let mut tasks = shared.active_tasks.lock().await;
            tasks.retain(|t| !t.is_finished());
            tasks.push(task);
        }

        Frame::Ping(ping) => {
            debug!("broker ping (t={})", ping.timestamp);
            let pong = Frame::Pong(PingPayload { timestamp: util::now_ms() });
            let json = serde_json::to_string(&pong).expect("pong frame serializes");
            shared.outbound.send(vec![json]).await;
        }

        Frame::Pong(pong) => {
            debug!(
                "broker pong (t={}, age {} ms)",
                pong.timestamp,
                util::now_ms() - pong.timestamp
            );
        }

        other => {
            debug!("ignoring unexpected inbound frame: {:?}", other.kind());
        }
    }
}
