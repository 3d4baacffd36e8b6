use std::sync::atomic::Ordering;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::metrics::METRICS;
use crate::session::SessionEvent;

// ------------------------------------------------------------
// Circuit breaker
// ------------------------------------------------------------
//
// Gates forwarding after repeated origin failures so a dead origin is
// answered instantly instead of burning a dial-and-retry cycle per
// relayed request. Shared by every in-flight forwarder behind a mutex.
//

/// Consecutive failures needed to open the breaker.
pub const BREAKER_THRESHOLD: u32 = 5;

/// How long the breaker stays open without fresh errors.
pub const BREAKER_COOLDOWN: Duration = Duration::from_secs(30);

pub struct CircuitBreaker {
    consecutive_errors: u32,
    last_error: Option<Instant>,
    open: bool,
    events: mpsc::Sender<SessionEvent>,
}

impl CircuitBreaker {
    pub fn new(events: mpsc::Sender<SessionEvent>) -> Self {
        CircuitBreaker {
            consecutive_errors: 0,
            last_error: None,
            open: false,
            events,
        }
    }

    /// Records one failed forward. A request counts once no matter how
    /// many attempts it burned.
    pub fn record_error(&mut self) {
        self.consecutive_errors += 1;
        self.last_error = Some(Instant::now());
        if !self.open && self.consecutive_errors >= BREAKER_THRESHOLD {
            self.open = true;
            METRICS.breaker_trips.fetch_add(1, Ordering::Relaxed);
            warn!(
                "circuit breaker open after {} consecutive errors",
                self.consecutive_errors
            );
            let _ = self.events.try_send(SessionEvent::CircuitBreakerOpen {
                consecutive_errors: self.consecutive_errors,
                cooldown_ms: BREAKER_COOLDOWN.as_millis() as u64,
            });
        }
    }

    /// Records a successful forward, closing the breaker if needed.
    pub fn record_success(&mut self) {
        let was_open = self.open;
        self.consecutive_errors = 0;
        self.last_error = None;
        self.open = false;
        if was_open {
            info!("circuit breaker closed, origin recovered");
            let _ = self.events.try_send(SessionEvent::CircuitBreakerClosed);
        }
    }

    /// Whether requests should be rejected right now.
    ///
    /// An open breaker self-resets once the cooldown elapses without
    /// new errors; the next request then probes the origin again.
    pub fn is_open(&mut self) -> bool {
        if !self.open {
            return false;
        }
        let cooled = self
            .last_error
            .is_none_or(|t| t.elapsed() > BREAKER_COOLDOWN);
        if cooled {
            debug!("circuit breaker cooldown elapsed, allowing a probe request");
            self.open = false;
            self.consecutive_errors = 0;
            return false;
        }
        true
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors
    }
}

// ------------------------------------------------------------
// Health prober
// ------------------------------------------------------------
//
// Cheap reachability check against the origin, cached so a burst of
// requests costs one probe. `/health` is tried first; origins without
// a health route are accepted via `/` where any non-5xx status proves
// something is listening.
//

/// Per-probe deadline.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// How long one probe result stays valid.
pub const HEALTH_TTL: Duration = Duration::from_secs(10);

pub struct HealthProber {
    client: reqwest::Client,
    base_url: String,
    cached: Option<(bool, Instant)>,
    /// Sticky: once a path produced a usable answer it is reused.
    probe_path: Option<&'static str>,
}

impl HealthProber {
    pub fn new(client: reqwest::Client, base_url: String) -> Self {
        HealthProber {
            client,
            base_url,
            cached: None,
            probe_path: None,
        }
    }

    /// Returns origin health, probing only when the cache expired.
    pub async fn check(&mut self) -> bool {
        if let Some((healthy, at)) = self.cached {
            if at.elapsed() <= HEALTH_TTL {
                return healthy;
            }
        }
        let healthy = self.probe().await;
        self.cached = Some((healthy, Instant::now()));
        healthy
    }

    /// Drops the cached result so the next check hits the network.
    pub fn invalidate(&mut self) {
        self.cached = None;
    }

    async fn probe(&mut self) -> bool {
        if self.probe_path == Some("/") {
            return self.probe_root().await;
        }

        let url = format!("{}/health", self.base_url);
        match self
            .client
            .head(&url)
            .timeout(PROBE_TIMEOUT)
            .send()
            .await
        {
            Ok(resp) if resp.status().is_success() => {
                self.probe_path = Some("/health");
                debug!("health probe ok via /health ({})", resp.status());
                true
            }
            Ok(resp) => {
                debug!("health probe got {} from /health", resp.status());
                if self.probe_path.is_none() {
                    self.probe_root().await
                } else {
                    false
                }
            }
            Err(e) => {
                debug!("health probe error on /health: {}", e);
                self.probe_root().await
            }
        }
    }

    /// Fallback probe against `/`. Any status up to 499 means a server
    /// is answering, even if it hates HEAD or the path.
    async fn probe_root(&mut self) -> bool {
        let url = format!("{}/", self.base_url);
        match self.client.head(&url).timeout(PROBE_TIMEOUT).send().await {
            Ok(resp) if resp.status().as_u16() < 500 => {
                self.probe_path = Some("/");
                debug!("health probe ok via / ({})", resp.status());
                true
            }
            Ok(resp) => {
                debug!("health probe got {} from /", resp.status());
                false
            }
            Err(e) => {
                debug!("health probe error on /: {}", e);
                false
            }
        }
    }
}
