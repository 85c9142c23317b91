use std::sync::Mutex;

use futures::future::BoxFuture;

use strata_core::traits::ProgressSink;
use strata_core::types::{ProgressEnvelope, ProgressSubtype, SessionId};

/// Progress sink that keeps everything it was handed.
#[derive(Default)]
pub struct RecordingProgressSink {
    envelopes: Mutex<Vec<(SessionId, ProgressEnvelope)>>,
}

impl RecordingProgressSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn envelopes(&self) -> Vec<ProgressEnvelope> {
        self.envelopes
            .lock()
            .map(|v| v.iter().map(|(_, e)| e.clone()).collect())
            .unwrap_or_default()
    }

    pub fn for_session(&self, session: &SessionId) -> Vec<ProgressEnvelope> {
        self.envelopes
            .lock()
            .map(|v| {
                v.iter()
                    .filter(|(s, _)| s == session)
                    .map(|(_, e)| e.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn count(&self, subtype: ProgressSubtype) -> usize {
        self.envelopes().iter().filter(|e| e.subtype == subtype).count()
    }
}

impl ProgressSink for RecordingProgressSink {
    fn emit(&self, session: &SessionId, envelope: ProgressEnvelope) -> BoxFuture<'_, ()> {
        if let Ok(mut v) = self.envelopes.lock() {
            v.push((session.clone(), envelope));
        }
        Box::pin(async {})
    }
}
