use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use strata_core::config::{BreakerConfig, BreakersConfig};
use strata_core::error::{Result, StrataError};
use strata_core::event::EventBus;
use strata_core::types::{CircuitMode, CircuitSnapshot, OperationClass, SystemEvent};

// ---------------------------------------------------------------------------
// Inner state (behind Mutex)
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct InnerState {
    state: CircuitMode,
    failure_count: u32,
    success_count: u32,
    last_failure_time: Option<Instant>,
    last_failure_at: Option<DateTime<Utc>>,
    /// Probe calls currently running in half-open.
    probes_in_flight: u32,
    /// Bumped on every entry into half-open so stale probe slots can be told apart.
    probe_generation: u64,
}

/// Releases a half-open probe slot, including when the call is dropped mid-flight.
struct ProbeSlot<'a> {
    breaker: &'a CircuitBreaker,
    generation: u64,
}

impl Drop for ProbeSlot<'_> {
    fn drop(&mut self) {
        let mut guard = self.breaker.lock();
        if guard.probe_generation == self.generation {
            guard.probes_in_flight = guard.probes_in_flight.saturating_sub(1);
        }
    }
}

// ---------------------------------------------------------------------------
// CircuitBreaker
// ---------------------------------------------------------------------------

/// Fault isolator for one operation class.
///
/// `Closed` passes calls through and counts consecutive failures; reaching
/// `failure_threshold` opens the circuit. `Open` rejects immediately until the
/// cooldown elapses, then moves to `HalfOpen`, where at most
/// `half_open_max_calls` probes run concurrently. `success_threshold`
/// consecutive probe successes close the circuit; any probe failure reopens it.
///
/// Only `Err` results count as failures. Deadlines belong to the wrapped call.
pub struct CircuitBreaker {
    class: OperationClass,
    config: BreakerConfig,
    inner: Mutex<InnerState>,
    events: Option<Arc<EventBus>>,
}

impl CircuitBreaker {
    pub fn new(class: OperationClass, config: BreakerConfig) -> Self {
        Self {
            class,
            config,
            inner: Mutex::new(InnerState {
                state: CircuitMode::Closed,
                failure_count: 0,
                success_count: 0,
                last_failure_time: None,
                last_failure_at: None,
                probes_in_flight: 0,
                probe_generation: 0,
            }),
            events: None,
        }
    }

    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn class(&self) -> OperationClass {
        self.class
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, InnerState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Current mode. An expired `Open` still reports `Open` until the next call.
    pub fn state(&self) -> CircuitMode {
        self.lock().state
    }

    pub fn failure_count(&self) -> u32 {
        self.lock().failure_count
    }

    pub fn success_count(&self) -> u32 {
        self.lock().success_count
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let guard = self.lock();
        CircuitSnapshot {
            class: self.class,
            mode: guard.state,
            consecutive_failures: guard.failure_count,
            consecutive_successes: guard.success_count,
            last_failure_at: guard.last_failure_at,
        }
    }

    /// Execute `f` through the circuit breaker.
    ///
    /// Rejections never invoke `f`: an open circuit yields
    /// [`StrataError::CircuitOpen`] with the remaining cooldown, a saturated
    /// half-open circuit yields [`StrataError::CircuitProbeBusy`].
    pub async fn call<F, Fut, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let slot = self.acquire()?;
        let result = f().await;

        match &result {
            Ok(_) => self.record_success(),
            Err(e) => self.record_failure(e),
        }
        drop(slot);
        result
    }

    /// Pre-flight check; returns a probe slot when running half-open.
    fn acquire(&self) -> Result<Option<ProbeSlot<'_>>> {
        let mut guard = self.lock();

        if guard.state == CircuitMode::Open {
            let cooldown = self.config.cooldown();
            let elapsed = guard
                .last_failure_time
                .map(|t| t.elapsed())
                .unwrap_or(cooldown);
            if elapsed < cooldown {
                return Err(StrataError::CircuitOpen {
                    class: self.class.to_string(),
                    remaining_ms: (cooldown - elapsed).as_millis() as u64,
                });
            }
            guard.success_count = 0;
            guard.probes_in_flight = 0;
            guard.probe_generation += 1;
            self.transition(&mut guard, CircuitMode::HalfOpen);
        }

        match guard.state {
            CircuitMode::Closed => Ok(None),
            CircuitMode::HalfOpen => {
                if guard.probes_in_flight >= self.config.half_open_max_calls {
                    debug!(class = %self.class, "Half-open probe capacity exhausted");
                    return Err(StrataError::CircuitProbeBusy {
                        class: self.class.to_string(),
                    });
                }
                guard.probes_in_flight += 1;
                Ok(Some(ProbeSlot {
                    breaker: self,
                    generation: guard.probe_generation,
                }))
            }
            CircuitMode::Open => Err(StrataError::CircuitOpen {
                class: self.class.to_string(),
                remaining_ms: 0,
            }),
        }
    }

    fn record_success(&self) {
        let mut guard = self.lock();
        match guard.state {
            CircuitMode::HalfOpen => {
                guard.success_count += 1;
                if guard.success_count >= self.config.success_threshold {
                    guard.failure_count = 0;
                    guard.success_count = 0;
                    self.transition(&mut guard, CircuitMode::Closed);
                }
            }
            CircuitMode::Closed => {
                guard.failure_count = 0;
            }
            // A call admitted before the circuit opened; it says nothing about recovery
            CircuitMode::Open => {}
        }
    }

    fn record_failure(&self, error: &StrataError) {
        let mut guard = self.lock();
        match guard.state {
            CircuitMode::Closed => {
                guard.failure_count += 1;
                guard.last_failure_time = Some(Instant::now());
                guard.last_failure_at = Some(Utc::now());
                if guard.failure_count >= self.config.failure_threshold {
                    warn!(
                        class = %self.class,
                        failures = guard.failure_count,
                        error = %error,
                        "Failure threshold reached"
                    );
                    self.transition(&mut guard, CircuitMode::Open);
                }
            }
            CircuitMode::HalfOpen => {
                guard.failure_count += 1;
                guard.success_count = 0;
                guard.last_failure_time = Some(Instant::now());
                guard.last_failure_at = Some(Utc::now());
                warn!(class = %self.class, error = %error, "Probe failed");
                self.transition(&mut guard, CircuitMode::Open);
            }
            CircuitMode::Open => {
                guard.failure_count += 1;
            }
        }
    }

    fn transition(&self, guard: &mut InnerState, to: CircuitMode) {
        let from = guard.state;
        if from == to {
            return;
        }
        guard.state = to;
        match to {
            CircuitMode::Open => warn!(class = %self.class, ?from, "Circuit opened"),
            _ => info!(class = %self.class, ?from, ?to, "Circuit state changed"),
        }
        if let Some(events) = &self.events {
            events.publish(SystemEvent::CircuitChanged {
                class: self.class,
                mode: to,
            });
        }
    }

    /// Manually reset to `Closed`.
    pub fn reset(&self) {
        let mut guard = self.lock();
        guard.failure_count = 0;
        guard.success_count = 0;
        guard.last_failure_time = None;
        guard.probes_in_flight = 0;
        guard.probe_generation += 1;
        self.transition(&mut guard, CircuitMode::Closed);
    }
}

// ---------------------------------------------------------------------------
// One breaker per operation class
// ---------------------------------------------------------------------------

/// Independent breakers for every operation class.
pub struct CircuitBreakers {
    decision: CircuitBreaker,
    data: CircuitBreaker,
    analysis: CircuitBreaker,
    generation: CircuitBreaker,
    output: CircuitBreaker,
}

impl CircuitBreakers {
    pub fn new(config: &BreakersConfig, events: Option<Arc<EventBus>>) -> Self {
        let build = |class: OperationClass| {
            let breaker = CircuitBreaker::new(class, config.for_class(class).clone());
            match &events {
                Some(bus) => breaker.with_events(Arc::clone(bus)),
                None => breaker,
            }
        };
        Self {
            decision: build(OperationClass::Decision),
            data: build(OperationClass::Data),
            analysis: build(OperationClass::Analysis),
            generation: build(OperationClass::Generation),
            output: build(OperationClass::Output),
        }
    }

    pub fn for_class(&self, class: OperationClass) -> &CircuitBreaker {
        match class {
            OperationClass::Decision => &self.decision,
            OperationClass::Data => &self.data,
            OperationClass::Analysis => &self.analysis,
            OperationClass::Generation => &self.generation,
            OperationClass::Output => &self.output,
        }
    }

    pub fn snapshot(&self) -> Vec<CircuitSnapshot> {
        OperationClass::ALL
            .iter()
            .map(|class| self.for_class(*class).snapshot())
            .collect()
    }

    pub fn reset_all(&self) {
        for class in OperationClass::ALL {
            self.for_class(class).reset();
        }
    }
}

impl Default for CircuitBreakers {
    fn default() -> Self {
        Self::new(&BreakersConfig::default(), None)
    }
}
