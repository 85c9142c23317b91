use std::sync::Arc;
use std::time::Instant;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::debug;

use strata_core::traits::{NullProgressSink, ProgressSink};
use strata_core::types::{ExecutionId, ProgressEnvelope, ProgressSubtype, SessionId};

use crate::resilience::DegradationController;

/// Applies the current degradation policy to outbound progress envelopes.
///
/// `end` and `error` envelopes always go out. With streaming disabled,
/// everything else is dropped; `progress` envelopes are additionally
/// throttled per execution by the policy interval.
pub struct ProgressEmitter {
    sink: Arc<dyn ProgressSink>,
    degradation: Arc<DegradationController>,
    last_progress: DashMap<ExecutionId, Instant>,
}

impl ProgressEmitter {
    pub fn new(sink: Arc<dyn ProgressSink>, degradation: Arc<DegradationController>) -> Self {
        Self {
            sink,
            degradation,
            last_progress: DashMap::new(),
        }
    }

    /// Emitter that sends nowhere.
    pub fn silent(degradation: Arc<DegradationController>) -> Self {
        Self::new(Arc::new(NullProgressSink), degradation)
    }

    /// Send an envelope if the policy allows it; returns whether it was sent.
    pub async fn emit(&self, session: &SessionId, envelope: ProgressEnvelope) -> bool {
        if !envelope.is_urgent() {
            let policy = self.degradation.policy();
            if !policy.streaming {
                debug!(
                    execution_id = %envelope.execution_id,
                    kind = %envelope.kind,
                    level = %policy.level,
                    "Progress suppressed, streaming disabled"
                );
                return false;
            }
            if envelope.subtype == ProgressSubtype::Progress && !policy.progress_interval.is_zero() {
                let now = Instant::now();
                match self.last_progress.entry(envelope.execution_id.clone()) {
                    Entry::Occupied(mut last) => {
                        if now.duration_since(*last.get()) < policy.progress_interval {
                            return false;
                        }
                        last.insert(now);
                    }
                    Entry::Vacant(slot) => {
                        slot.insert(now);
                    }
                }
            }
        }
        self.sink.emit(session, envelope).await;
        true
    }

    /// Drop throttle bookkeeping of a finished execution.
    pub fn forget(&self, execution: &ExecutionId) {
        self.last_progress.remove(execution);
    }
}

#[cfg(test)]
mod tests {
    use strata_core::config::DegradationConfig;
    use strata_core::types::{DegradationLevel, ExecutionStatus};
    use strata_test_utils::RecordingProgressSink;

    use super::*;

    fn envelope(subtype: ProgressSubtype, exec: &ExecutionId) -> ProgressEnvelope {
        ProgressEnvelope::new("node", subtype, exec.clone(), 1, ExecutionStatus::Running)
    }

    fn setup(level: Option<DegradationLevel>) -> (ProgressEmitter, Arc<RecordingProgressSink>) {
        let sink = Arc::new(RecordingProgressSink::new());
        let degradation = Arc::new(DegradationController::new(DegradationConfig {
            pinned_level: level,
            ..DegradationConfig::default()
        }));
        (ProgressEmitter::new(sink.clone(), degradation), sink)
    }

    #[tokio::test]
    async fn test_full_level_sends_everything() {
        let (emitter, sink) = setup(None);
        let session = SessionId::new();
        let exec = ExecutionId::new();
        for subtype in [ProgressSubtype::Start, ProgressSubtype::Progress, ProgressSubtype::Progress, ProgressSubtype::End] {
            assert!(emitter.emit(&session, envelope(subtype, &exec)).await);
        }
        assert_eq!(sink.envelopes().len(), 4);
    }

    #[tokio::test]
    async fn test_streaming_off_keeps_only_urgent() {
        let (emitter, sink) = setup(Some(DegradationLevel::Minimal));
        let session = SessionId::new();
        let exec = ExecutionId::new();
        assert!(!emitter.emit(&session, envelope(ProgressSubtype::Start, &exec)).await);
        assert!(!emitter.emit(&session, envelope(ProgressSubtype::Progress, &exec)).await);
        assert!(emitter.emit(&session, envelope(ProgressSubtype::Error, &exec)).await);
        assert!(emitter.emit(&session, envelope(ProgressSubtype::End, &exec)).await);
        assert_eq!(sink.count(ProgressSubtype::Error), 1);
        assert_eq!(sink.count(ProgressSubtype::End), 1);
        assert_eq!(sink.envelopes().len(), 2);
    }

    #[tokio::test]
    async fn test_progress_throttled_per_execution() {
        let (emitter, sink) = setup(Some(DegradationLevel::Reduced));
        let session = SessionId::new();
        let a = ExecutionId::new();
        let b = ExecutionId::new();
        assert!(emitter.emit(&session, envelope(ProgressSubtype::Progress, &a)).await);
        assert!(!emitter.emit(&session, envelope(ProgressSubtype::Progress, &a)).await);
        assert!(emitter.emit(&session, envelope(ProgressSubtype::Progress, &b)).await);
        // Start envelopes are not throttled
        assert!(emitter.emit(&session, envelope(ProgressSubtype::Start, &a)).await);
        assert_eq!(sink.count(ProgressSubtype::Progress), 2);

        emitter.forget(&a);
        assert!(emitter.emit(&session, envelope(ProgressSubtype::Progress, &a)).await);
    }
}
