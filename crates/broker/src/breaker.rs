//! Sliding-window circuit breaker for backend spawns.
//!
//! `closed → open` when the failure count inside the rolling window crosses
//! the threshold; `open → half_open` after the recovery time; `half_open`
//! admits a single trial — enough consecutive successes close the breaker,
//! any failure reopens it.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use bc_domain::config::BreakerConfig;
use bc_domain::{Error, Result};
use bc_protocol::CircuitSnapshot;
use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

struct BreakerInner {
    state: BreakerState,
    /// Timestamps of recorded failures, oldest first.
    failures: VecDeque<Instant>,
    opened_at: Option<Instant>,
    half_open_successes: u32,
    /// Whether the single half-open trial slot is taken.
    trial_in_flight: bool,
}

pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                failures: VecDeque::new(),
                opened_at: None,
                half_open_successes: 0,
                trial_in_flight: false,
            }),
        }
    }

    /// Ask permission to attempt a spawn.
    pub fn try_acquire(&self) -> Result<()> {
        self.try_acquire_at(Instant::now())
    }

    pub fn record_success(&self) {
        self.record_success_at(Instant::now());
    }

    pub fn record_failure(&self) {
        self.record_failure_at(Instant::now());
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        self.snapshot_at(Instant::now())
    }

    // ── Time-injected variants ────────────────────────────────────────

    pub(crate) fn try_acquire_at(&self, now: Instant) -> Result<()> {
        let mut inner = self.inner.lock();
        self.slide_window(&mut inner, now);
        match inner.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open => {
                let recovered = inner
                    .opened_at
                    .map(|at| now.duration_since(at) >= self.recovery_time())
                    .unwrap_or(true);
                if recovered {
                    self.transition(&mut inner, BreakerState::HalfOpen);
                    inner.trial_in_flight = true;
                    Ok(())
                } else {
                    Err(Error::CircuitOpen)
                }
            }
            BreakerState::HalfOpen => {
                if inner.trial_in_flight {
                    Err(Error::CircuitOpen)
                } else {
                    inner.trial_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    pub(crate) fn record_success_at(&self, _now: Instant) {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => {}
            BreakerState::HalfOpen => {
                inner.trial_in_flight = false;
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.config.success_threshold {
                    inner.failures.clear();
                    self.transition(&mut inner, BreakerState::Closed);
                }
            }
            BreakerState::Open => {
                // A success while open means an in-flight probe from before
                // the trip finished late. Ignore.
            }
        }
    }

    pub(crate) fn record_failure_at(&self, now: Instant) {
        let mut inner = self.inner.lock();
        inner.failures.push_back(now);
        self.slide_window(&mut inner, now);
        match inner.state {
            BreakerState::Closed => {
                if inner.failures.len() as u32 >= self.config.failure_threshold {
                    inner.opened_at = Some(now);
                    self.transition(&mut inner, BreakerState::Open);
                }
            }
            BreakerState::HalfOpen => {
                inner.trial_in_flight = false;
                inner.opened_at = Some(now);
                self.transition(&mut inner, BreakerState::Open);
            }
            BreakerState::Open => {}
        }
    }

    pub(crate) fn snapshot_at(&self, now: Instant) -> CircuitSnapshot {
        let mut inner = self.inner.lock();
        self.slide_window(&mut inner, now);
        let remaining = match (inner.state, inner.opened_at) {
            (BreakerState::Open, Some(at)) => self
                .recovery_time()
                .saturating_sub(now.duration_since(at))
                .as_millis() as u64,
            _ => 0,
        };
        CircuitSnapshot {
            state: inner.state.as_str().into(),
            failure_count: inner.failures.len() as u32,
            failure_threshold: self.config.failure_threshold,
            success_threshold: self.config.success_threshold,
            window_ms: self.config.window_ms,
            recovery_time_ms: self.config.recovery_time_ms,
            recovery_time_remaining_ms: remaining,
        }
    }

    // ── Internals ─────────────────────────────────────────────────────

    fn recovery_time(&self) -> Duration {
        Duration::from_millis(self.config.recovery_time_ms)
    }

    fn slide_window(&self, inner: &mut BreakerInner, now: Instant) {
        let window = Duration::from_millis(self.config.window_ms);
        while let Some(oldest) = inner.failures.front() {
            if now.duration_since(*oldest) > window {
                inner.failures.pop_front();
            } else {
                break;
            }
        }
    }

    fn transition(&self, inner: &mut BreakerInner, to: BreakerState) {
        if inner.state != to {
            tracing::info!(
                from = inner.state.as_str(),
                to = to.as_str(),
                "circuit breaker transition"
            );
            if matches!(to, BreakerState::HalfOpen | BreakerState::Closed) {
                inner.half_open_successes = 0;
            }
            inner.state = to;
        }
    }
}
