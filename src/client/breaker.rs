//! Circuit breaker guarding worker-side calls into the queue service.
//!
//! Three states: closed (normal), open (fail fast), half-open (single
//! probe). The breaker opens after a run of consecutive failures, holds
//! open for a cool-down window, then lets exactly one probe through; the
//! probe's outcome decides whether it closes again or reopens. Fail-fast
//! while open is what keeps retry storms off the store during incidents.

use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct Inner {
    state: State,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    inner: Mutex<Inner>,
    failure_threshold: u32,
    cooldown: Duration,
}

/// Returned by `preflight` when the circuit is open and the cool-down has
/// not elapsed (or another probe is already in flight).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitOpen;

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: State::Closed,
                consecutive_failures: 0,
                opened_at: None,
                probe_in_flight: false,
            }),
            failure_threshold,
            cooldown,
        }
    }

    /// Gate a call. While open, fails fast until the cool-down elapses;
    /// the first call after that becomes the half-open probe and further
    /// calls keep failing fast until the probe resolves.
    pub fn preflight(&self) -> Result<(), CircuitOpen> {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            State::Closed => Ok(()),
            State::Open => {
                let cooled = inner
                    .opened_at
                    .is_some_and(|at| at.elapsed() >= self.cooldown);
                if cooled {
                    inner.state = State::HalfOpen;
                    inner.probe_in_flight = true;
                    Ok(())
                } else {
                    Err(CircuitOpen)
                }
            }
            State::HalfOpen => {
                if inner.probe_in_flight {
                    Err(CircuitOpen)
                } else {
                    inner.probe_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    /// A single success closes the circuit from any state.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.state = State::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.probe_in_flight = false;
    }

    /// A failure while half-open reopens immediately; while closed, a run
    /// of `failure_threshold` consecutive failures opens the circuit.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            State::HalfOpen => {
                inner.state = State::Open;
                inner.opened_at = Some(Instant::now());
                inner.probe_in_flight = false;
            }
            State::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.failure_threshold {
                    inner.state = State::Open;
                    inner.opened_at = Some(Instant::now());
                }
            }
            State::Open => {}
        }
    }
}
