use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::backend::{BackendError, BackendSelector};
use crate::cache::FingerprintCache;
use crate::metrics::{BACKEND_LATENCY, JOBS_FINISHED, JOBS_STARTED};
use crate::models::{Fingerprint, GenerationRequest, ImagePayload, JobRecord, JobStatus};
use crate::sink::ResultSink;

pub enum Registration {
    Created(Fingerprint),
    Existing(JobRecord),
}

// pending -> generating -> done | failed, never touched again once terminal
pub struct JobRunner {
    cache: Arc<FingerprintCache>,
    selector: Arc<BackendSelector>,
    sink: Arc<dyn ResultSink>,
    records: DashMap<Fingerprint, JobRecord>,
}

impl JobRunner {
    pub fn new(
        cache: Arc<FingerprintCache>,
        selector: Arc<BackendSelector>,
        sink: Arc<dyn ResultSink>,
    ) -> Self {
        Self {
            cache,
            selector,
            sink,
            records: DashMap::new(),
        }
    }

    pub fn register(&self, request: GenerationRequest) -> Registration {
        let fingerprint = request.fingerprint();
        match self.records.entry(fingerprint.clone()) {
            Entry::Occupied(existing) => Registration::Existing(existing.get().clone()),
            Entry::Vacant(slot) => {
                debug!(%fingerprint, prompt = %request.prompt, "job registered");
                slot.insert(JobRecord::pending(request));
                Registration::Created(fingerprint)
            }
        }
    }

    pub fn backend_name(&self) -> &str {
        self.selector.active().name()
    }

    pub fn record(&self, fingerprint: &Fingerprint) -> Option<JobRecord> {
        self.records.get(fingerprint).map(|record| record.clone())
    }

    pub fn pending(&self) -> Vec<Fingerprint> {
        self.records
            .iter()
            .filter(|record| record.status == JobStatus::Pending)
            .map(|record| record.key().clone())
            .collect()
    }

    // None when the job is unknown or already claimed
    pub async fn run(&self, fingerprint: &Fingerprint) -> Option<JobStatus> {
        // claim under the shard lock so a job runs at most once
        let request = {
            let mut record = self.records.get_mut(fingerprint)?;
            if record.status != JobStatus::Pending {
                return None;
            }
            record.status = JobStatus::Generating;
            record.request.clone()
        };
        JOBS_STARTED.inc();
        let started = Instant::now();

        let outcome = match self.cache.get(fingerprint).await {
            Some(payload) => Ok(payload),
            None => {
                info!(%fingerprint, backend = self.selector.active().name(), "generating");
                let on_progress = |elapsed: Duration| {
                    if let Some(mut record) = self.records.get_mut(fingerprint) {
                        record.elapsed_ms = elapsed.as_millis() as u64;
                    }
                };
                let result = self.selector.generate(&request, &on_progress).await;
                BACKEND_LATENCY.observe(started.elapsed().as_secs_f64());
                if let Ok(payload) = &result {
                    self.cache.put(fingerprint, payload).await;
                }
                result
            }
        };

        Some(self.finish(fingerprint, outcome, started.elapsed()))
    }

    fn finish(
        &self,
        fingerprint: &Fingerprint,
        outcome: Result<ImagePayload, BackendError>,
        elapsed: Duration,
    ) -> JobStatus {
        let elapsed_ms = elapsed.as_millis() as u64;
        match outcome {
            Ok(payload) => {
                if let Some(mut record) = self.records.get_mut(fingerprint) {
                    record.status = JobStatus::Done;
                    record.payload = Some(payload.clone());
                    record.elapsed_ms = elapsed_ms;
                }
                JOBS_FINISHED.with_label_values(&["done"]).inc();
                self.sink.notify_result(fingerprint, &payload);
                JobStatus::Done
            }
            Err(e) => {
                let error = e.to_job_error();
                warn!(%fingerprint, error = %e, "job failed");
                if let Some(mut record) = self.records.get_mut(fingerprint) {
                    record.status = JobStatus::Failed;
                    record.error = Some(error.clone());
                    record.elapsed_ms = elapsed_ms;
                }
                JOBS_FINISHED.with_label_values(&["failed"]).inc();
                self.sink.notify_failure(fingerprint, &error);
                JobStatus::Failed
            }
        }
    }

    // A span seen again in a later message: replay the outcome if there is one
    pub fn reannounce(&self, record: &JobRecord) {
        match (record.status, &record.payload, &record.error) {
            (JobStatus::Done, Some(payload), _) => {
                debug!(fingerprint = %record.fingerprint, "re-announcing finished job");
                self.sink.notify_result(&record.fingerprint, payload);
            }
            (JobStatus::Failed, _, Some(error)) => {
                self.sink.notify_failure(&record.fingerprint, error);
            }
            _ => {}
        }
    }

    pub fn retry(&self, fingerprint: &Fingerprint) -> bool {
        let Some(mut record) = self.records.get_mut(fingerprint) else {
            return false;
        };
        if record.status != JobStatus::Failed {
            return false;
        }
        let request = record.request.clone();
        *record = JobRecord::pending(request);
        info!(%fingerprint, "job reset for retry");
        true
    }

    // outside the job table; true on a cache hit
    pub async fn generate_once(
        &self,
        request: &GenerationRequest,
    ) -> Result<(ImagePayload, bool), BackendError> {
        let fingerprint = request.fingerprint();
        if let Some(payload) = self.cache.get(&fingerprint).await {
            return Ok((payload, true));
        }

        let started = Instant::now();
        let result = self.selector.generate(request, &|_: Duration| {}).await;
        BACKEND_LATENCY.observe(started.elapsed().as_secs_f64());
        let payload = result?;
        self.cache.put(&fingerprint, &payload).await;
        Ok((payload, false))
    }
}
