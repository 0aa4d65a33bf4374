use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::models::{Fingerprint, ImagePayload, JobError};

/// Receives terminal job outcomes ("display this result for this job").
pub trait ResultSink: Send + Sync {
    fn notify_result(&self, fingerprint: &Fingerprint, payload: &ImagePayload);
    fn notify_failure(&self, fingerprint: &Fingerprint, error: &JobError);
}

// Just logs outcomes
pub struct LogSink;

impl ResultSink for LogSink {
    fn notify_result(&self, fingerprint: &Fingerprint, payload: &ImagePayload) {
        info!(%fingerprint, mime = payload.mime_type(), "image ready");
    }

    fn notify_failure(&self, fingerprint: &Fingerprint, error: &JobError) {
        warn!(%fingerprint, class = ?error.class, error = %error.message, "image failed");
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEvent {
    Done {
        fingerprint: Fingerprint,
        payload: ImagePayload,
    },
    Failed {
        fingerprint: Fingerprint,
        error: JobError,
    },
}

impl JobEvent {
    pub fn fingerprint(&self) -> &Fingerprint {
        match self {
            JobEvent::Done { fingerprint, .. } | JobEvent::Failed { fingerprint, .. } => {
                fingerprint
            }
        }
    }
}

// events sent while nobody listens are dropped
pub struct BroadcastSink {
    tx: broadcast::Sender<JobEvent>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.tx.subscribe()
    }
}

impl ResultSink for BroadcastSink {
    fn notify_result(&self, fingerprint: &Fingerprint, payload: &ImagePayload) {
        LogSink.notify_result(fingerprint, payload);
        let _ = self.tx.send(JobEvent::Done {
            fingerprint: fingerprint.clone(),
            payload: payload.clone(),
        });
    }

    fn notify_failure(&self, fingerprint: &Fingerprint, error: &JobError) {
        LogSink.notify_failure(fingerprint, error);
        let _ = self.tx.send(JobEvent::Failed {
            fingerprint: fingerprint.clone(),
            error: error.clone(),
        });
    }
}

#[cfg(test)]
pub(crate) mod memory {
    use super::*;
    use std::sync::Mutex;

    // Keeps every event for assertions
    #[derive(Default)]
    pub struct MemorySink {
        pub events: Mutex<Vec<JobEvent>>,
    }

    impl MemorySink {
        pub fn events(&self) -> Vec<JobEvent> {
            self.events.lock().unwrap().clone()
        }

        pub fn done_count(&self, fingerprint: &Fingerprint) -> usize {
            self.events()
                .iter()
                .filter(|e| matches!(e, JobEvent::Done { .. }) && e.fingerprint() == fingerprint)
                .count()
        }
    }

    impl ResultSink for MemorySink {
        fn notify_result(&self, fingerprint: &Fingerprint, payload: &ImagePayload) {
            self.events.lock().unwrap().push(JobEvent::Done {
                fingerprint: fingerprint.clone(),
                payload: payload.clone(),
            });
        }

        fn notify_failure(&self, fingerprint: &Fingerprint, error: &JobError) {
            self.events.lock().unwrap().push(JobEvent::Failed {
                fingerprint: fingerprint.clone(),
                error: error.clone(),
            });
        }
    }
}
