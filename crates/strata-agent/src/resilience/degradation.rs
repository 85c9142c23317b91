use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{info, warn};

use strata_core::config::DegradationConfig;
use strata_core::event::EventBus;
use strata_core::types::{DegradationLevel, Severity, SystemEvent};

/// Configuration bundle bound to one degradation level.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LevelPolicy {
    pub level: DegradationLevel,
    /// Live `progress`/`start` envelopes; `end` and `error` always go out.
    pub streaming: bool,
    /// Whether the autonomous loop consults its decision source at all.
    pub decisions_enabled: bool,
    pub checkpoint_batch: usize,
    pub timeout_multiplier: f64,
    pub max_concurrent: usize,
    /// Minimum gap between two `progress` envelopes of one execution.
    #[serde(with = "duration_ms")]
    pub progress_interval: Duration,
}

impl LevelPolicy {
    pub fn for_level(level: DegradationLevel) -> Self {
        match level {
            DegradationLevel::Full => Self {
                level,
                streaming: true,
                decisions_enabled: true,
                checkpoint_batch: 10,
                timeout_multiplier: 1.0,
                max_concurrent: 50,
                progress_interval: Duration::ZERO,
            },
            DegradationLevel::Reduced => Self {
                level,
                streaming: true,
                decisions_enabled: true,
                checkpoint_batch: 20,
                timeout_multiplier: 1.5,
                max_concurrent: 25,
                progress_interval: Duration::from_millis(250),
            },
            DegradationLevel::Minimal => Self {
                level,
                streaming: false,
                decisions_enabled: false,
                checkpoint_batch: 50,
                timeout_multiplier: 2.0,
                max_concurrent: 10,
                progress_interval: Duration::from_secs(1),
            },
            DegradationLevel::Emergency => Self {
                level,
                streaming: false,
                decisions_enabled: false,
                checkpoint_batch: 100,
                timeout_multiplier: 3.0,
                max_concurrent: 2,
                progress_interval: Duration::from_secs(5),
            },
        }
    }

    pub fn scale_timeout(&self, base: Duration) -> Duration {
        base.mul_f64(self.timeout_multiplier)
    }
}

mod duration_ms {
    use std::time::Duration;

    pub fn serialize<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
}

struct Inner {
    window: VecDeque<(Instant, f64)>,
    /// Automatically computed level; left alone while pinned.
    level: DegradationLevel,
    consecutive_successes: u32,
    pinned: Option<DegradationLevel>,
}

/// System-wide service level derived from a rolling window of weighted errors.
///
/// Every error recomputes the level immediately and can only make it worse.
/// Recovery waits for `recovery_successes` consecutive successes and then moves
/// at most one level up.
pub struct DegradationController {
    config: DegradationConfig,
    inner: Mutex<Inner>,
    events: Option<Arc<EventBus>>,
}

impl DegradationController {
    pub fn new(config: DegradationConfig) -> Self {
        let pinned = config.pinned_level;
        Self {
            config,
            inner: Mutex::new(Inner {
                window: VecDeque::new(),
                level: DegradationLevel::Full,
                consecutive_successes: 0,
                pinned,
            }),
            events: None,
        }
    }

    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn window(&self) -> Duration {
        Duration::from_secs(self.config.window_secs)
    }

    /// Effective level: the pinned one if set, else the computed one.
    pub fn level(&self) -> DegradationLevel {
        let inner = self.lock();
        inner.pinned.unwrap_or(inner.level)
    }

    pub fn policy(&self) -> LevelPolicy {
        LevelPolicy::for_level(self.level())
    }

    pub fn pinned(&self) -> Option<DegradationLevel> {
        self.lock().pinned
    }

    pub fn record_error(&self, severity: Severity) {
        self.record_error_at(severity, Instant::now());
    }

    pub fn record_error_at(&self, severity: Severity, now: Instant) {
        let mut inner = self.lock();
        inner.window.push_back((now, severity.weight()));
        inner.consecutive_successes = 0;
        self.prune(&mut inner, now);

        if inner.pinned.is_some() {
            return;
        }
        let computed = self.level_for(Self::score(&inner));
        if computed > inner.level {
            self.set_level(&mut inner, computed);
        }
    }

    pub fn record_success(&self) {
        self.record_success_at(Instant::now());
    }

    pub fn record_success_at(&self, now: Instant) {
        let mut inner = self.lock();
        if inner.pinned.is_some() {
            return;
        }
        inner.consecutive_successes += 1;
        if inner.consecutive_successes < self.config.recovery_successes {
            return;
        }
        inner.consecutive_successes = 0;
        self.prune(&mut inner, now);

        let computed = self.level_for(Self::score(&inner));
        if computed < inner.level {
            if let Some(next) = inner.level.better() {
                self.set_level(&mut inner, next);
            }
        }
    }

    /// Pin a level; automatic recomputation stops until [`unpin`](Self::unpin).
    pub fn pin(&self, level: DegradationLevel) {
        let mut inner = self.lock();
        let before = inner.pinned.unwrap_or(inner.level);
        inner.pinned = Some(level);
        info!(level = %level, "Degradation level pinned");
        self.announce(before, level);
    }

    pub fn unpin(&self) {
        let mut inner = self.lock();
        let Some(was) = inner.pinned.take() else {
            return;
        };
        info!(level = %inner.level, "Degradation override cleared");
        let now_level = inner.level;
        self.announce(was, now_level);
    }

    /// Sum of weights currently inside the window.
    pub fn weighted_score(&self) -> f64 {
        let mut inner = self.lock();
        self.prune(&mut inner, Instant::now());
        Self::score(&inner)
    }

    fn prune(&self, inner: &mut Inner, now: Instant) {
        let window = self.window();
        while let Some((at, _)) = inner.window.front() {
            if now.saturating_duration_since(*at) > window {
                inner.window.pop_front();
            } else {
                break;
            }
        }
    }

    fn score(inner: &Inner) -> f64 {
        inner.window.iter().map(|(_, w)| w).sum()
    }

    fn level_for(&self, score: f64) -> DegradationLevel {
        if score >= self.config.emergency_threshold {
            DegradationLevel::Emergency
        } else if score >= self.config.minimal_threshold {
            DegradationLevel::Minimal
        } else if score >= self.config.reduced_threshold {
            DegradationLevel::Reduced
        } else {
            DegradationLevel::Full
        }
    }

    fn set_level(&self, inner: &mut Inner, to: DegradationLevel) {
        let from = inner.level;
        inner.level = to;
        if to > from {
            warn!(from = %from, to = %to, score = Self::score(inner), "Service degraded");
        } else {
            info!(from = %from, to = %to, "Service level recovered");
        }
        self.announce(from, to);
    }

    fn announce(&self, from: DegradationLevel, to: DegradationLevel) {
        if from == to {
            return;
        }
        if let Some(events) = &self.events {
            events.publish(SystemEvent::DegradationChanged { from, to });
        }
    }
}

impl Default for DegradationController {
    fn default() -> Self {
        Self::new(DegradationConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use DegradationLevel::*;

    fn controller() -> DegradationController {
        DegradationController::new(DegradationConfig {
            recovery_successes: 3,
            ..DegradationConfig::default()
        })
    }

    #[test]
    fn test_levels_follow_weighted_thresholds() {
        // (severity, expected level after the report); thresholds 5 / 15 / 30
        let table = [
            (Severity::Normal, Full), // 1
            (Severity::High, Full), // 3
            (Severity::Low, Full), // 3.5
            (Severity::Low, Full), // 4
            (Severity::Normal, Reduced), // 5
            (Severity::Critical, Reduced), // 10
            (Severity::Critical, Minimal), // 15
            (Severity::Critical, Minimal), // 20
            (Severity::Critical, Minimal), // 25
            (Severity::High, Minimal), // 27
            (Severity::High, Minimal), // 29
            (Severity::Normal, Emergency), // 30
        ];
        let c = controller();
        let now = Instant::now();
        for (i, (severity, expected)) in table.iter().enumerate() {
            c.record_error_at(*severity, now);
            assert_eq!(c.level(), *expected, "after report {i}");
        }
    }

    #[test]
    fn test_errors_outside_window_are_forgotten() {
        let c = DegradationController::new(DegradationConfig {
            window_secs: 10,
            recovery_successes: 1,
            ..DegradationConfig::default()
        });
        let start = Instant::now();
        for _ in 0..5 {
            c.record_error_at(Severity::Normal, start);
        }
        assert_eq!(c.level(), Reduced);

        c.record_success_at(start + Duration::from_secs(11));
        assert_eq!(c.level(), Full);
    }

    #[test]
    fn test_recovery_moves_one_level_at_a_time() {
        let c = DegradationController::new(DegradationConfig {
            window_secs: 10,
            recovery_successes: 3,
            ..DegradationConfig::default()
        });
        let start = Instant::now();
        for _ in 0..6 {
            c.record_error_at(Severity::Critical, start);
        }
        assert_eq!(c.level(), Emergency);

        let later = start + Duration::from_secs(60);
        let mut seen = vec![];
        for _ in 0..9 {
            c.record_success_at(later);
            seen.push(c.level());
        }
        assert_eq!(
            seen,
            vec![
                Emergency, Emergency, Minimal,
                Minimal, Minimal, Reduced,
                Reduced, Reduced, Full,
            ]
        );
    }

    #[test]
    fn test_error_resets_success_streak() {
        let c = DegradationController::new(DegradationConfig {
            window_secs: 10,
            recovery_successes: 3,
            ..DegradationConfig::default()
        });
        let start = Instant::now();
        for _ in 0..5 {
            c.record_error_at(Severity::Normal, start);
        }
        let later = start + Duration::from_secs(20);
        c.record_success_at(later);
        c.record_success_at(later);
        c.record_error_at(Severity::Low, later);
        c.record_success_at(later);
        c.record_success_at(later);
        assert_eq!(c.level(), Reduced);
        c.record_success_at(later);
        assert_eq!(c.level(), Full);
    }

    #[test]
    fn test_no_recovery_while_errors_remain_in_window() {
        let c = controller();
        let now = Instant::now();
        for _ in 0..5 {
            c.record_error_at(Severity::Normal, now);
        }
        for _ in 0..10 {
            c.record_success_at(now);
        }
        assert_eq!(c.level(), Reduced);
    }

    #[test]
    fn test_pin_overrides_automatic_level() {
        let c = controller();
        c.pin(Minimal);
        let now = Instant::now();
        for _ in 0..10 {
            c.record_error_at(Severity::Critical, now);
        }
        assert_eq!(c.level(), Minimal);
        assert_eq!(c.policy().max_concurrent, 10);

        c.unpin();
        // Automatic level was not recomputed while pinned
        assert_eq!(c.level(), Full);
        c.record_error_at(Severity::Low, now);
        assert_eq!(c.level(), Emergency);
    }

    #[test]
    fn test_policy_bundles_shrink_with_level() {
        let levels = [Full, Reduced, Minimal, Emergency];
        for pair in levels.windows(2) {
            let better = LevelPolicy::for_level(pair[0]);
            let worse = LevelPolicy::for_level(pair[1]);
            assert!(worse.max_concurrent < better.max_concurrent);
            assert!(worse.checkpoint_batch > better.checkpoint_batch);
            assert!(worse.timeout_multiplier > better.timeout_multiplier);
        }
        assert!(!LevelPolicy::for_level(Minimal).streaming);
        assert!(!LevelPolicy::for_level(Minimal).decisions_enabled);
        assert_eq!(
            LevelPolicy::for_level(Reduced).scale_timeout(Duration::from_secs(10)),
            Duration::from_secs(15)
        );
    }

    #[tokio::test]
    async fn test_level_changes_are_published() {
        let bus = Arc::new(EventBus::default());
        let mut rx = bus.subscribe();
        let c = controller().with_events(Arc::clone(&bus));
        c.record_error_at(Severity::Critical, Instant::now());
        match rx.recv().await.unwrap() {
            SystemEvent::DegradationChanged { from, to } => {
                assert_eq!(from, Full);
                assert_eq!(to, Reduced);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
}
