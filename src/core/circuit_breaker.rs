//! Per-target circuit breaking.
//!
//! Each upstream target key (service id or direct URL) owns an independent
//! Closed / Open / HalfOpen state machine. A 5xx upstream response or a
//! transport failure counts as a failure; 4xx counts as a success. While
//! Open, requests are rejected without touching the upstream; once the
//! reset timeout elapses a single probe is admitted, and its outcome alone
//! decides the next state. The probe slot is held by a [`ProbeGuard`] so a
//! cancelled request frees it on drop.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use axum::body::Body;
use hyper::{Response, StatusCode, header};

use crate::metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub reset_timeout: Duration,
}

/// Outcome of asking a breaker whether a request may proceed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerDecision {
    Allow { probe: bool },
    Reject { retry_after_secs: u64, state: CircuitState },
}

#[derive(Debug)]
struct Breaker {
    state: CircuitState,
    consecutive_failures: u32,
    last_transition: Instant,
    probe_in_flight: bool,
}

impl Breaker {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            last_transition: Instant::now(),
            probe_in_flight: false,
        }
    }

    fn check(&mut self, now: Instant, settings: &BreakerSettings) -> BreakerDecision {
        match self.state {
            CircuitState::Closed => BreakerDecision::Allow { probe: false },
            CircuitState::Open => {
                let elapsed = now.saturating_duration_since(self.last_transition);
                if elapsed >= settings.reset_timeout {
                    self.state = CircuitState::HalfOpen;
                    self.last_transition = now;
                    self.probe_in_flight = true;
                    BreakerDecision::Allow { probe: true }
                } else {
                    let remaining = settings.reset_timeout - elapsed;
                    BreakerDecision::Reject {
                        retry_after_secs: remaining.as_secs().max(1),
                        state: CircuitState::Open,
                    }
                }
            }
            CircuitState::HalfOpen => {
                if self.probe_in_flight {
                    // One probe at a time; everyone else waits it out.
                    BreakerDecision::Reject {
                        retry_after_secs: 1,
                        state: CircuitState::HalfOpen,
                    }
                } else {
                    self.probe_in_flight = true;
                    BreakerDecision::Allow { probe: true }
                }
            }
        }
    }

    fn on_success(&mut self, probe: bool, now: Instant) {
        if probe {
            self.probe_in_flight = false;
        }
        match self.state {
            CircuitState::HalfOpen if probe => {
                self.state = CircuitState::Closed;
                self.consecutive_failures = 0;
                self.last_transition = now;
            }
            CircuitState::Closed => {
                self.consecutive_failures = 0;
            }
            _ => {}
        }
    }

    fn on_failure(&mut self, probe: bool, now: Instant, settings: &BreakerSettings) {
        if probe {
            self.probe_in_flight = false;
        }
        match self.state {
            CircuitState::HalfOpen if probe => {
                self.state = CircuitState::Open;
                self.consecutive_failures = 0;
                self.last_transition = now;
            }
            CircuitState::Closed => {
                self.consecutive_failures += 1;
                if self.consecutive_failures >= settings.failure_threshold {
                    self.state = CircuitState::Open;
                    self.consecutive_failures = 0;
                    self.last_transition = now;
                }
            }
            _ => {}
        }
    }

    fn clear_probe(&mut self) {
        self.probe_in_flight = false;
    }
}

/// Breakers keyed by upstream target; transitions are serialized per key
/// and independent across keys.
pub struct BreakerRegistry {
    settings: BreakerSettings,
    breakers: scc::HashMap<String, Breaker>,
}

impl BreakerRegistry {
    pub fn new(settings: BreakerSettings) -> Self {
        Self {
            settings,
            breakers: scc::HashMap::new(),
        }
    }

    fn with<R>(&self, key: &str, mut f: impl FnMut(&mut Breaker) -> R) -> R {
        loop {
            if let Some(result) = self.breakers.update(key, |_, breaker| f(breaker)) {
                return result;
            }
            let _ = self.breakers.insert(key.to_string(), Breaker::new());
        }
    }

    pub fn check(&self, key: &str) -> BreakerDecision {
        let now = Instant::now();
        let settings = self.settings;
        let decision = self.with(key, |b| b.check(now, &settings));
        if let BreakerDecision::Reject { state, .. } = decision {
            metrics::increment_breaker_rejection(key, state.as_str());
        }
        decision
    }

    pub fn record_success(&self, key: &str, probe: bool) {
        let now = Instant::now();
        let previous = self.with(key, |b| {
            let before = b.state;
            b.on_success(probe, now);
            (before, b.state)
        });
        if previous.0 != previous.1 {
            tracing::info!(target_key = key, state = previous.1.as_str(), "circuit closed");
        }
    }

    pub fn record_failure(&self, key: &str, probe: bool) {
        let now = Instant::now();
        let settings = self.settings;
        let transition = self.with(key, |b| {
            let before = b.state;
            b.on_failure(probe, now, &settings);
            (before, b.state)
        });
        if transition.0 != transition.1 {
            tracing::warn!(
                target_key = key,
                state = transition.1.as_str(),
                "circuit opened"
            );
        }
    }

    /// Release an unresolved probe slot (request cancelled mid-flight).
    pub fn clear_probe(&self, key: &str) {
        self.with(key, |b| b.clear_probe());
    }

    pub fn state(&self, key: &str) -> CircuitState {
        self.breakers
            .read(key, |_, b| b.state)
            .unwrap_or(CircuitState::Closed)
    }

    pub fn reject_response(&self, key: &str, retry_after_secs: u64, state: CircuitState) -> Response<Body> {
        let body = serde_json::json!({
            "error": "upstream_unavailable",
            "target": key,
        });
        Response::builder()
            .status(StatusCode::SERVICE_UNAVAILABLE)
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::RETRY_AFTER, retry_after_secs.to_string())
            .header("X-Circuit-State", state.as_str())
            .body(Body::from(body.to_string()))
            .unwrap_or_else(|_| Response::new(Body::from(body.to_string())))
    }
}

/// Holds a half-open probe slot until the probe resolves. Dropping an armed
/// guard (client disconnect, deadline) frees the slot so the next request
/// can probe instead of deadlocking the target in HalfOpen.
pub struct ProbeGuard {
    registry: Arc<BreakerRegistry>,
    key: String,
    armed: bool,
}

impl ProbeGuard {
    pub fn new(registry: Arc<BreakerRegistry>, key: String) -> Self {
        Self {
            registry,
            key,
            armed: true,
        }
    }

    /// Mark the probe as resolved; `record_success`/`record_failure` own
    /// the slot from here.
    pub fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for ProbeGuard {
    fn drop(&mut self) {
        if self.armed {
            self.registry.clear_probe(&self.key);
        }
    }
}
