use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tracing::info;

use crate::backend::BackendSelector;
use crate::cache::FingerprintCache;
use crate::dispatcher::{DispatchConfig, SpeculativeDispatcher};
use crate::jobs::JobRunner;
use crate::references::ReferenceStore;
use crate::scanner::MarkerScanner;
use crate::scheduler::BacklogScheduler;
use crate::sink::BroadcastSink;
use crate::sse::SseDecoder;

// app's shared state: the whole pipeline, built once and shared by handlers
pub struct AppState {
    pub dispatcher: Arc<SpeculativeDispatcher>,
    pub runner: Arc<JobRunner>,
    pub scheduler: Arc<BacklogScheduler>,
    pub events: Arc<BroadcastSink>,
    pub cache: Arc<FingerprintCache>,
    pub references: Arc<ReferenceStore>,
    pub decoders: DashMap<String, SseDecoder>, // stream id -> partial SSE input
}

impl AppState {
    pub fn new(
        selector: Arc<BackendSelector>,
        cache: Arc<FingerprintCache>,
        references: Arc<ReferenceStore>,
        scanner: MarkerScanner,
        dispatch: DispatchConfig,
        concurrency: usize,
    ) -> Self {
        let events = Arc::new(BroadcastSink::new(256));
        let runner = Arc::new(JobRunner::new(Arc::clone(&cache), selector, events.clone()));
        let scheduler = Arc::new(BacklogScheduler::new(Arc::clone(&runner), concurrency));
        let dispatcher = Arc::new(SpeculativeDispatcher::new(
            dispatch,
            scanner,
            Arc::clone(&runner),
            Arc::clone(&scheduler),
        ));
        Self {
            dispatcher,
            runner,
            scheduler,
            events,
            cache,
            references,
            decoders: DashMap::new(),
        }
    }

    // forgets streams and half-read event bodies nobody has touched lately
    pub fn evict_idle(&self, max_idle: Duration) -> usize {
        self.decoders.retain(|_, decoder| decoder.idle_for() < max_idle);
        self.dispatcher.evict_idle(max_idle)
    }
}

// Sweep loop - clients that vanish mid-stream never send the end
pub async fn idle_sweeper(state: Arc<AppState>, max_idle: Duration) {
    let mut interval = interval((max_idle / 4).max(Duration::from_secs(1)));

    info!(?max_idle, "idle stream sweeper started");

    loop {
        interval.tick().await;
        state.evict_idle(max_idle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::fake::CountingBackend;
    use crate::backend::{BackendSelector, ImageBackend};
    use crate::cache::{CacheConfig, FingerprintCache};
    use crate::scanner::ScannerConfig;

    fn state() -> AppState {
        let references = Arc::new(ReferenceStore::new(None));
        let backend: Arc<dyn ImageBackend> = Arc::new(CountingBackend::default());
        let selector = BackendSelector::new(backend, None, Arc::clone(&references));
        AppState::new(
            Arc::new(selector),
            Arc::new(FingerprintCache::new(CacheConfig {
                ttl_days: 1,
                path: None,
                max_entries: 16,
            })),
            references,
            MarkerScanner::new(ScannerConfig::default()).unwrap(),
            DispatchConfig::default(),
            1,
        )
    }

    #[tokio::test]
    async fn idle_decoders_and_streams_are_evicted() {
        let state = state();
        state
            .decoders
            .entry("s".to_string())
            .or_insert_with(|| SseDecoder::new(1024))
            .feed(b"data: {\"choices\"");
        state.dispatcher.push_delta("s", "image:{a ");

        assert_eq!(state.evict_idle(Duration::from_secs(60)), 0);
        assert_eq!(state.decoders.len(), 1);

        assert_eq!(state.evict_idle(Duration::ZERO), 1);
        assert!(state.decoders.is_empty());
    }
}
