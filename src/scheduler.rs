use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::jobs::JobRunner;
use crate::models::{Fingerprint, JobStatus};

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct DrainSummary {
    pub done: usize,
    pub failed: usize,
    // already claimed elsewhere, or gone
    pub skipped: usize,
}

// at most `limit` backend calls in flight across every drain; a finished job
// frees its slot for the next one straight away
pub struct BacklogScheduler {
    runner: Arc<JobRunner>,
    limit: usize,
    slots: Arc<Semaphore>,
}

impl BacklogScheduler {
    pub fn new(runner: Arc<JobRunner>, limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            runner,
            limit,
            slots: Arc::new(Semaphore::new(limit)),
        }
    }

    pub async fn drain_pending(&self) -> DrainSummary {
        self.drain(self.runner.pending()).await
    }

    pub async fn drain(&self, backlog: Vec<Fingerprint>) -> DrainSummary {
        let mut summary = DrainSummary::default();
        if backlog.is_empty() {
            return summary;
        }
        info!(jobs = backlog.len(), limit = self.limit, "draining backlog");

        let mut tasks = JoinSet::new();
        for fingerprint in backlog {
            // wait for a free slot before starting the next job
            let Ok(permit) = Arc::clone(&self.slots).acquire_owned().await else {
                break;
            };
            let runner = Arc::clone(&self.runner);
            tasks.spawn(async move {
                let _permit = permit;
                runner.run(&fingerprint).await
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Some(JobStatus::Done)) => summary.done += 1,
                Ok(Some(JobStatus::Failed)) => summary.failed += 1,
                Ok(_) => summary.skipped += 1,
                Err(e) => {
                    warn!(error = %e, "backlog task panicked");
                    summary.failed += 1;
                }
            }
        }
        info!(?summary, "backlog drained");
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::fake::CountingBackend;
    use crate::jobs::Registration;
    use crate::jobs::testing::runner;
    use crate::models::GenerationRequest;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn enqueue(runner: &JobRunner, count: usize) -> Vec<Fingerprint> {
        (0..count)
            .map(|i| match runner.register(GenerationRequest::new(format!("scene {}", i))) {
                Registration::Created(fp) => fp,
                Registration::Existing(record) => record.fingerprint,
            })
            .collect()
    }

    #[tokio::test]
    async fn never_exceeds_the_limit() {
        let backend = Arc::new(CountingBackend::slow(Duration::from_millis(20)));
        let (runner, _) = runner(backend.clone());
        let backlog = enqueue(&runner, 10);

        let summary = BacklogScheduler::new(Arc::clone(&runner), 3)
            .drain(backlog)
            .await;

        assert_eq!(summary.done, 10);
        assert_eq!(backend.calls(), 10);
        let peak = backend.peak.load(Ordering::SeqCst);
        assert!(peak <= 3, "peak in flight was {}", peak);
        assert!(peak >= 2, "slots were not used in parallel");
    }

    #[tokio::test]
    async fn overlapping_drains_share_the_limit() {
        let backend = Arc::new(CountingBackend::slow(Duration::from_millis(50)));
        let (runner, _) = runner(backend.clone());
        let mut first = enqueue(&runner, 10);
        let second = first.split_off(5);

        let scheduler = BacklogScheduler::new(Arc::clone(&runner), 2);
        let (a, b) = tokio::join!(scheduler.drain(first), scheduler.drain(second));

        assert_eq!(a.done + b.done, 10);
        let peak = backend.peak.load(Ordering::SeqCst);
        assert!(peak <= 2, "limit 2 but {} calls in flight", peak);
    }

    #[tokio::test]
    async fn drain_pending_skips_finished_jobs() {
        let backend = Arc::new(CountingBackend::default());
        let (runner, _) = runner(backend.clone());
        let backlog = enqueue(&runner, 4);
        runner.run(&backlog[0]).await;

        let scheduler = BacklogScheduler::new(Arc::clone(&runner), 1);
        let summary = scheduler.drain_pending().await;
        assert_eq!(summary.done, 3);
        assert_eq!(backend.calls(), 4);

        // a second pass finds nothing left to do
        assert_eq!(scheduler.drain_pending().await, DrainSummary::default());
        let again = scheduler.drain(backlog).await;
        assert_eq!(again.skipped, 4);
    }

    #[tokio::test]
    async fn failures_are_counted() {
        let backend = Arc::new(CountingBackend::failing());
        let (runner, _) = runner(backend);
        let backlog = enqueue(&runner, 2);
        let summary = BacklogScheduler::new(runner, 0).drain(backlog).await;
        assert_eq!(summary.failed, 2);
    }
}
