//! Per-service circuit breakers.
//!
//! A breaker is consulted before every physical forward attempt. Callers
//! obtain a [`Permit`] with [`CircuitBreaker::try_acquire`] and report the
//! attempt's outcome through it. A permit dropped without an outcome (for
//! example because the client went away mid-request) gives its half-open
//! probe slot back.
//!
//! ```text
//!            window full and failure rate >= threshold
//!   Closed ───────────────────────────────────────────▶ Open
//!     ▲                                                  │ wait_duration
//!     │ probe succeeds                                   ▼
//!     └────────────────────────────────────────────── HalfOpen
//!                       probe fails: back to Open ◀──────┘
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Instant;

use serde::Serialize;
use tracing::{info, warn};

use relaygrid_core::{BreakerParams, CircuitBreakerSettings, SharedClock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitStatus {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
}

#[derive(Debug)]
struct State {
    status: CircuitStatus,
    window: VecDeque<Outcome>,
    opened_at: Option<Instant>,
    probes_admitted: u32,
    /// Bumped on every transition; outcomes from older permits are ignored.
    generation: u64,
}

/// Breaker for a single target service.
#[derive(Debug)]
pub struct CircuitBreaker {
    service: String,
    params: BreakerParams,
    clock: SharedClock,
    state: Mutex<State>,
}

/// Read-only view of a breaker, served by the management API.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitSnapshot {
    pub service: String,
    pub status: CircuitStatus,
    pub window_len: usize,
    pub window_size: usize,
    pub failures: usize,
    pub failure_rate: f64,
    /// Milliseconds since the breaker last opened, while Open or HalfOpen.
    pub open_for_ms: Option<u64>,
    pub probes_in_flight: u32,
}

impl CircuitBreaker {
    pub fn new(service: impl Into<String>, params: BreakerParams, clock: SharedClock) -> Self {
        let window = VecDeque::with_capacity(params.window_size);
        Self {
            service: service.into(),
            params,
            clock,
            state: Mutex::new(State {
                status: CircuitStatus::Closed,
                window,
                opened_at: None,
                probes_admitted: 0,
                generation: 0,
            }),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn params(&self) -> &BreakerParams {
        &self.params
    }

    /// Whether `status` counts as a failed attempt for this service.
    pub fn is_failure_status(&self, status: u16) -> bool {
        self.params.failure_status_codes.contains(&status)
    }

    pub fn status(&self) -> CircuitStatus {
        let mut state = self.lock();
        self.refresh(&mut state);
        state.status
    }

    /// Ask to make one attempt. `None` means fail fast.
    pub fn try_acquire(self: &Arc<Self>) -> Option<Permit> {
        let mut state = self.lock();
        self.refresh(&mut state);

        let probe = match state.status {
            CircuitStatus::Closed => false,
            CircuitStatus::Open => return None,
            CircuitStatus::HalfOpen => {
                if state.probes_admitted >= self.params.half_open_probes {
                    return None;
                }
                state.probes_admitted += 1;
                true
            }
        };

        Some(Permit {
            breaker: Arc::clone(self),
            generation: state.generation,
            probe,
            done: false,
        })
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let mut state = self.lock();
        self.refresh(&mut state);

        let failures = state
            .window
            .iter()
            .filter(|o| **o == Outcome::Failure)
            .count();
        let window_len = state.window.len();
        let failure_rate = if window_len == 0 {
            0.0
        } else {
            failures as f64 * 100.0 / window_len as f64
        };
        let now = self.clock.now();

        CircuitSnapshot {
            service: self.service.clone(),
            status: state.status,
            window_len,
            window_size: self.params.window_size,
            failures,
            failure_rate,
            open_for_ms: state
                .opened_at
                .map(|t| now.saturating_duration_since(t).as_millis() as u64),
            probes_in_flight: if state.status == CircuitStatus::HalfOpen {
                state.probes_admitted
            } else {
                0
            },
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply the time-driven Open -> HalfOpen transition.
    fn refresh(&self, state: &mut State) {
        if state.status != CircuitStatus::Open {
            return;
        }
        let Some(opened_at) = state.opened_at else {
            return;
        };
        if self.clock.now().saturating_duration_since(opened_at) >= self.params.wait_duration {
            info!(service = %self.service, "circuit half-open, admitting probes");
            state.status = CircuitStatus::HalfOpen;
            state.probes_admitted = 0;
            state.generation += 1;
        }
    }

    fn record(&self, generation: u64, probe: bool, outcome: Outcome) {
        let mut state = self.lock();
        if state.generation != generation {
            return;
        }

        match state.status {
            CircuitStatus::Closed => {
                if state.window.len() == self.params.window_size {
                    state.window.pop_front();
                }
                state.window.push_back(outcome);

                let len = state.window.len();
                if len < self.params.window_size {
                    return;
                }
                let failures = state
                    .window
                    .iter()
                    .filter(|o| **o == Outcome::Failure)
                    .count();
                if failures as f64 * 100.0 >= self.params.failure_rate_threshold * len as f64 {
                    warn!(
                        service = %self.service,
                        failures,
                        window = len,
                        "circuit opened"
                    );
                    self.open(&mut state);
                }
            }
            CircuitStatus::HalfOpen if probe => match outcome {
                Outcome::Success => {
                    info!(service = %self.service, "probe succeeded, circuit closed");
                    state.status = CircuitStatus::Closed;
                    state.window.clear();
                    state.opened_at = None;
                    state.probes_admitted = 0;
                    state.generation += 1;
                }
                Outcome::Failure => {
                    warn!(service = %self.service, "probe failed, circuit re-opened");
                    self.open(&mut state);
                }
            },
            _ => {}
        }
    }

    fn release(&self, generation: u64) {
        let mut state = self.lock();
        if state.generation == generation && state.status == CircuitStatus::HalfOpen {
            state.probes_admitted = state.probes_admitted.saturating_sub(1);
        }
    }

    fn open(&self, state: &mut State) {
        state.status = CircuitStatus::Open;
        state.opened_at = Some(self.clock.now());
        state.probes_admitted = 0;
        state.generation += 1;
    }
}

/// Permission for one attempt against a service.
#[derive(Debug)]
#[must_use = "report the attempt's outcome with `record`"]
pub struct Permit {
    breaker: Arc<CircuitBreaker>,
    generation: u64,
    probe: bool,
    done: bool,
}

impl Permit {
    /// Whether this attempt is a half-open probe.
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    pub fn record(mut self, outcome: Outcome) {
        self.done = true;
        self.breaker.record(self.generation, self.probe, outcome);
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        if !self.done && self.probe {
            self.breaker.release(self.generation);
        }
    }
}

/// Lazily created breakers, one per target service.
#[derive(Debug)]
pub struct CircuitBreakers {
    settings: CircuitBreakerSettings,
    clock: SharedClock,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakers {
    pub fn new(settings: CircuitBreakerSettings, clock: SharedClock) -> Self {
        Self {
            settings,
            clock,
            breakers: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, service: &str) -> Arc<CircuitBreaker> {
        {
            let breakers = self.breakers.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(b) = breakers.get(service) {
                return Arc::clone(b);
            }
        }
        let mut breakers = self.breakers.write().unwrap_or_else(PoisonError::into_inner);
        let breaker = breakers.entry(service.to_string()).or_insert_with(|| {
            Arc::new(CircuitBreaker::new(
                service,
                self.settings.for_service(service),
                Arc::clone(&self.clock),
            ))
        });
        Arc::clone(breaker)
    }

    /// Snapshots of every breaker created so far, ordered by service.
    pub fn snapshots(&self) -> Vec<CircuitSnapshot> {
        let breakers: Vec<Arc<CircuitBreaker>> = self
            .breakers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        let mut snapshots: Vec<CircuitSnapshot> = breakers.iter().map(|b| b.snapshot()).collect();
        snapshots.sort_by(|a, b| a.service.cmp(&b.service));
        snapshots
    }
}
