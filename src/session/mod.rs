/// Session module
///
/// This module groups the tunnel session lifecycle:
/// - Registering with the broker over HTTP
/// - Running the persistent WebSocket connection (see `runner`)
/// - Reconnecting with jittered exponential backoff
/// - Surfacing events to the embedding program
///
/// The session layer orchestrates; forwarding itself lives in the
/// forwarder and SSE modules, framing in the protocol and chunks
/// modules.
pub(crate) mod runner;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Context;
use log::{debug, info, warn};
use tokio::sync::{Mutex, Notify, mpsc};
use tokio::task::JoinHandle;

use crate::chunks::ChunkTable;
use crate::config::TunnelConfig;
use crate::forwarder::{self, ForwardContext};
use crate::health::{CircuitBreaker, HealthProber};
use crate::protocol::{RegisterResponse, TunnelInfo};

// ------------------------------------------------------------
// Timing constants
// ------------------------------------------------------------

/// Broker registration call deadline.
pub const REGISTER_TIMEOUT: Duration = Duration::from_secs(10);

/// WebSocket handshake deadline.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Pause between registration and the first WebSocket connect.
pub const POST_REGISTER_DELAY: Duration = Duration::from_millis(10);

/// Keepalive ping cadence.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Inbound silence after which the connection is declared dead.
/// Two missed keepalive rounds.
pub const LIVENESS_TIMEOUT: Duration = Duration::from_secs(60);

/// Reconnect attempts before giving up for good.
pub const MAX_RECONNECT_ATTEMPTS: u32 = 10;

/// Ceiling on the reconnect backoff delay.
pub const RECONNECT_DELAY_CAP: Duration = Duration::from_secs(30);

/// How long a graceful shutdown waits for open chunk assemblies.
pub const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

// ------------------------------------------------------------
// Events
// ------------------------------------------------------------

/// Observable session events, delivered over the receiver returned by
/// [`Session::take_events`].
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// The tunnel is connected and reachable at this public URL.
    /// Emitted on every (re)connect.
    Url(String),

    /// A public request was relayed to the origin.
    Request {
        method: String,
        path: String,
        headers: HashMap<String, String>,
    },

    /// A non-fatal or fatal problem, as text.
    Error(String),

    /// The origin tripped the circuit breaker.
    CircuitBreakerOpen {
        consecutive_errors: u32,
        cooldown_ms: u64,
    },

    /// The origin recovered and the breaker closed again.
    CircuitBreakerClosed,

    /// The session reached its terminal state. Emitted exactly once.
    Closed,
}

// ------------------------------------------------------------
// Outbound queue
// ------------------------------------------------------------

/// Queue feeding the WebSocket writer.
///
/// The sender is replaced on every (re)connect; anything enqueued while
/// no connection exists is dropped, matching what the broker would do
/// with a response for a request it can no longer answer.
///
/// One queue item is one logical frame: either a single serialized
/// message or the full chunk batch of an oversized frame. The writer
/// drains an item's messages back to back, which keeps a chunked
/// frame contiguous on the socket.
#[derive(Clone)]
pub struct OutboundQueue {
    inner: Arc<Mutex<mpsc::Sender<Vec<String>>>>,
}

impl OutboundQueue {
    fn new() -> Self {
        // Starts disconnected: the receiver is dropped immediately, so
        // sends fail until the first connection installs a live pair.
        let (tx, _) = mpsc::channel(1024);
        OutboundQueue {
            inner: Arc::new(Mutex::new(tx)),
        }
    }

    /// Installs the sender of a fresh connection.
    pub(crate) async fn replace(&self, tx: mpsc::Sender<Vec<String>>) {
        *self.inner.lock().await = tx;
    }

    /// Enqueues one logical frame. Returns false when the connection
    /// is gone or the queue is saturated.
    pub(crate) async fn send(&self, batch: Vec<String>) -> bool {
        let tx = self.inner.lock().await;
        match tx.try_send(batch) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("outbound queue full, dropping frame");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

// ------------------------------------------------------------
// Shared session state
// ------------------------------------------------------------

pub(crate) struct SessionShared {
    pub config: Arc<TunnelConfig>,
    pub info: TunnelInfo,
    pub events: mpsc::Sender<SessionEvent>,
    pub outbound: OutboundQueue,
    pub forward: Arc<ForwardContext>,
    /// Open chunk reassemblies. Only the WebSocket reader mutates it;
    /// shutdown paths clear it.
    pub chunk_table: Mutex<ChunkTable>,
    /// In-flight per-request forwarder tasks.
    pub active_tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
    pub close_notify: Notify,
}

impl SessionShared {
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Best-effort event delivery. A slow consumer loses events rather
    /// than stalling the session.
    pub(crate) fn emit(&self, event: SessionEvent) {
        if self.events.try_send(event).is_err() {
            debug!("event receiver full or gone, event dropped");
        }
    }

    /// Moves the session to its terminal state. Idempotent: only the
    /// first call tears anything down or emits `Closed`.
    pub(crate) async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("closing tunnel session {}", self.info.id);
        self.close_notify.notify_waiters();

        for task in self.active_tasks.lock().await.drain(..) {
            task.abort();
        }
        self.chunk_table.lock().await.clear();
        self.emit(SessionEvent::Closed);
    }
}

/// Waits for `duration`, returning early when the session closes.
/// Returns true when the session is closed.
pub(crate) async fn sleep_or_closed(shared: &SessionShared, duration: Duration) -> bool {
    if shared.is_closed() {
        return true;
    }
    tokio::select! {
        () = tokio::time::sleep(duration) => {}
        () = shared.close_notify.notified() => {}
    }
    shared.is_closed()
}

// ------------------------------------------------------------
// Session
// ------------------------------------------------------------

/// One tunnel session: registered with the broker, holding (at most)
/// one live WebSocket, forwarding relayed requests to the local
/// origin until closed.
pub struct Session {
    shared: Arc<SessionShared>,
    events: Option<mpsc::Receiver<SessionEvent>>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session").finish_non_exhaustive()
    }
}

impl Session {
    /// Registers with the broker and starts the connection loop.
    ///
    /// Resolves as soon as registration succeeds; the public URL is
    /// available immediately via [`Session::info`], and again as a
    /// [`SessionEvent::Url`] once the WebSocket is actually up.
    ///
    /// Registration failures are not retried here. The caller decides
    /// whether starting over makes sense.
    pub async fn open(config: TunnelConfig) -> anyhow::Result<Session> {
        config.validate()?;
        let config = Arc::new(config);

        let info = register(&config).await?;
        info!(
            "tunnel registered: id={} url={} -> {}",
            info.id,
            info.url,
            config.origin_authority()
        );

        let (events_tx, events_rx) = mpsc::channel(256);

        let origin_client = forwarder::build_origin_client(&config);
        let sse_client = forwarder::build_sse_client(&config)
            .map_err(|e| anyhow::anyhow!("session setup failed: {}", e))?;
        let probe_client = match &origin_client {
            Ok(c) => c.clone(),
            // TLS setup failed; probes share the forwarder's fate, a
            // plain client keeps the prober functional for logging.
            Err(_) => reqwest::Client::new(),
        };

        let outbound = OutboundQueue::new();
        let forward = Arc::new(ForwardContext {
            config: config.clone(),
            origin: origin_client,
            sse: sse_client,
            breaker: Arc::new(Mutex::new(CircuitBreaker::new(events_tx.clone()))),
            prober: Arc::new(Mutex::new(HealthProber::new(
                probe_client,
                config.origin_base_url(),
            ))),
            outbound: outbound.clone(),
        });

        let shared = Arc::new(SessionShared {
            config,
            info: info.clone(),
            events: events_tx,
            outbound,
            forward,
            chunk_table: Mutex::new(ChunkTable::new()),
            active_tasks: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            close_notify: Notify::new(),
        });

        tokio::spawn(runner::run(shared.clone()));

        Ok(Session {
            shared,
            events: Some(events_rx),
        })
    }

    /// Tunnel coordinates assigned by the broker.
    pub fn info(&self) -> &TunnelInfo {
        &self.shared.info
    }

    /// The public URL of this tunnel.
    pub fn url(&self) -> &str {
        &self.shared.info.url
    }

    /// Takes the event receiver. Yields `None` on the second call.
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<SessionEvent>> {
        self.events.take()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Closes the session immediately. Idempotent.
    pub async fn close(&self) {
        self.shared.close().await;
    }

    /// Waits up to [`SHUTDOWN_DRAIN_TIMEOUT`] for open chunk
    /// assemblies to drain, then closes.
    pub async fn graceful_shutdown(&self) {
        let deadline = tokio::time::Instant::now() + SHUTDOWN_DRAIN_TIMEOUT;
        loop {
            if self.shared.is_closed() {
                return;
            }
            if self.shared.chunk_table.lock().await.is_empty() {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                debug!("shutdown drain timed out with assemblies still open");
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        self.shared.close().await;
    }
}

// ------------------------------------------------------------
// Broker registration
// ------------------------------------------------------------

/// One HTTP call to the broker:
/// - `POST {broker}/api/tunnels` with `{subdomain}` when one is wanted
/// - `GET {broker}/?new` otherwise
async fn register(config: &TunnelConfig) -> anyhow::Result<TunnelInfo> {
    let client = reqwest::Client::builder()
        .timeout(REGISTER_TIMEOUT)
        .build()
        .context("building broker HTTP client")?;

    let base = config.broker_url.trim_end_matches('/');
    let result = match &config.subdomain {
        Some(subdomain) => {
            client
                .post(format!("{}/api/tunnels", base))
                .json(&serde_json::json!({ "subdomain": subdomain }))
                .send()
                .await
        }
        None => client.get(format!("{}/?new", base)).send().await,
    };

    let resp = result.with_context(|| format!("broker at {} is unreachable", base))?;
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        let message = serde_json::from_str::<serde_json::Value>(&body)
            .ok()
            .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(String::from));
        match message {
            Some(m) => anyhow::bail!("broker rejected registration: {}", m),
            None => anyhow::bail!("broker rejected registration with status {}", status),
        }
    }

    let reg: RegisterResponse = resp
        .json()
        .await
        .context("broker returned an unparseable registration response")?;
    Ok(reg.into())
}
