use dashmap::DashMap;
use std::collections::HashSet;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::jobs::{JobRunner, Registration};
use crate::metrics::STREAM_UPDATES;
use crate::models::{Fingerprint, GenerationRequest, JobRecord};
use crate::retry::poll_until;
use crate::scanner::MarkerScanner;
use crate::scheduler::BacklogScheduler;

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    // fire jobs while the text streams; otherwise queue them for the backlog
    pub speculative: bool,
    pub buffer_ceiling: usize,
    pub attach_attempts: u32,
    pub attach_delay: Duration,
    // streams untouched this long are forgotten, zero keeps them forever
    pub stream_idle: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            speculative: true,
            buffer_ceiling: 256 * 1024,
            attach_attempts: 10,
            attach_delay: Duration::from_millis(200),
            stream_idle: Duration::from_secs(600),
        }
    }
}

// Per-message scan state; job records outlive it
struct StreamState {
    buffer: String,
    seen: HashSet<Fingerprint>,
    heuristic_fired: bool,
    marker_seen: bool,
    touched: Instant,
}

impl Default for StreamState {
    fn default() -> Self {
        Self {
            buffer: String::new(),
            seen: HashSet::new(),
            heuristic_fired: false,
            marker_seen: false,
            touched: Instant::now(),
        }
    }
}

// fires jobs as soon as a complete span shows up in the streamed text
pub struct SpeculativeDispatcher {
    config: DispatchConfig,
    scanner: MarkerScanner,
    runner: Arc<JobRunner>,
    scheduler: Arc<BacklogScheduler>,
    streams: DashMap<String, StreamState>,
}

impl SpeculativeDispatcher {
    pub fn new(
        config: DispatchConfig,
        scanner: MarkerScanner,
        runner: Arc<JobRunner>,
        scheduler: Arc<BacklogScheduler>,
    ) -> Self {
        Self {
            config,
            scanner,
            runner,
            scheduler,
            streams: DashMap::new(),
        }
    }

    pub fn begin_stream(&self, stream_id: &str) {
        debug!(stream = stream_id, "stream started");
        self.streams
            .insert(stream_id.to_string(), StreamState::default());
    }

    pub fn buffer_ceiling(&self) -> usize {
        self.config.buffer_ceiling
    }

    pub fn stream_idle(&self) -> Duration {
        self.config.stream_idle
    }

    // returns the fingerprints first seen by this call
    pub fn push_delta(&self, stream_id: &str, delta: &str) -> Vec<Fingerprint> {
        STREAM_UPDATES.inc();
        let found = {
            let mut state = self.streams.entry(stream_id.to_string()).or_default();
            state.touched = Instant::now();
            state.buffer.push_str(delta);
            truncate_front(&mut state.buffer, self.config.buffer_ceiling);
            self.collect(&mut state)
        };
        self.dispatch(found)
    }

    // for callers that only have the cumulative text
    pub fn push_snapshot(&self, stream_id: &str, text: &str) -> Vec<Fingerprint> {
        STREAM_UPDATES.inc();
        let found = {
            let mut state = self.streams.entry(stream_id.to_string()).or_default();
            state.touched = Instant::now();
            state.buffer.clear();
            state.buffer.push_str(text);
            truncate_front(&mut state.buffer, self.config.buffer_ceiling);
            self.collect(&mut state)
        };
        self.dispatch(found)
    }

    // with speculative dispatch off this is where queued spans get generated
    pub fn end_stream(&self, stream_id: &str) -> bool {
        let existed = self.streams.remove(stream_id).is_some();
        debug!(stream = stream_id, existed, "stream ended");
        self.drain_backlog();
        existed
    }

    // abandoned streams count as ended
    pub fn evict_idle(&self, max_idle: Duration) -> usize {
        let before = self.streams.len();
        self.streams.retain(|_, state| state.touched.elapsed() < max_idle);
        let evicted = before.saturating_sub(self.streams.len());
        if evicted > 0 {
            info!(evicted, "forgot idle streams");
            self.drain_backlog();
        }
        evicted
    }

    fn drain_backlog(&self) {
        if self.config.speculative {
            return;
        }
        let scheduler = Arc::clone(&self.scheduler);
        tokio::spawn(async move {
            scheduler.drain_pending().await;
        });
    }

    // waits for a terminal record, None once the attempts run out
    pub async fn await_record(&self, fingerprint: &Fingerprint) -> Option<JobRecord> {
        poll_until(
            self.config.attach_delay,
            self.config.attach_attempts,
            move |_, _| async move {
                let record = self
                    .runner
                    .record(fingerprint)
                    .filter(|record| record.status.is_terminal());
                Ok::<_, Infallible>(record)
            },
        )
        .await
        .ok()
    }

    pub fn retry(&self, fingerprint: &Fingerprint) -> bool {
        if !self.runner.retry(fingerprint) {
            return false;
        }
        self.spawn(fingerprint.clone());
        true
    }

    fn collect(&self, state: &mut StreamState) -> Vec<GenerationRequest> {
        let mut fresh = Vec::new();

        let spans = self.scanner.scan(&state.buffer);
        if !spans.is_empty() {
            state.marker_seen = true;
        }
        for request in spans {
            if state.seen.insert(request.fingerprint()) {
                fresh.push(request);
            }
        }

        // at most once per message, and only until an explicit span appears
        if !state.marker_seen && !state.heuristic_fired {
            if let Some(request) = self.scanner.heuristic(&state.buffer) {
                state.heuristic_fired = true;
                if state.seen.insert(request.fingerprint()) {
                    fresh.push(request);
                }
            }
        }
        fresh
    }

    fn dispatch(&self, requests: Vec<GenerationRequest>) -> Vec<Fingerprint> {
        let mut dispatched = Vec::with_capacity(requests.len());
        for request in requests {
            match self.runner.register(request) {
                Registration::Created(fingerprint) => {
                    if self.config.speculative {
                        self.spawn(fingerprint.clone());
                    } else {
                        debug!(%fingerprint, "span queued for backlog");
                    }
                    dispatched.push(fingerprint);
                }
                Registration::Existing(record) => {
                    self.runner.reannounce(&record);
                    dispatched.push(record.fingerprint);
                }
            }
        }
        dispatched
    }

    fn spawn(&self, fingerprint: Fingerprint) {
        info!(%fingerprint, "dispatching job");
        let runner = Arc::clone(&self.runner);
        tokio::spawn(async move {
            runner.run(&fingerprint).await;
        });
    }
}

// Drops the oldest text so the buffer stays under `ceiling` bytes
fn truncate_front(buffer: &mut String, ceiling: usize) {
    if buffer.len() <= ceiling {
        return;
    }
    let mut cut = buffer.len() - ceiling;
    while !buffer.is_char_boundary(cut) {
        cut += 1;
    }
    buffer.drain(..cut);
}
