use lazy_static::lazy_static;
use prometheus::{
    Counter, Gauge, Histogram, IntCounterVec, register_counter, register_gauge,
    register_histogram, register_int_counter_vec,
};

lazy_static! {
    pub static ref STREAM_UPDATES: Counter =
        register_counter!("imagegen_stream_updates_total", "Total text updates ingested").unwrap();
    pub static ref JOBS_STARTED: Counter =
        register_counter!("imagegen_jobs_started_total", "Total generation jobs started").unwrap();
    pub static ref JOBS_FINISHED: IntCounterVec = register_int_counter_vec!(
        "imagegen_jobs_finished_total",
        "Generation jobs reaching a terminal state",
        &["status"]
    )
    .unwrap();
    pub static ref CACHE_HITS: Counter =
        register_counter!("imagegen_cache_hits_total", "Total cache hits").unwrap();
    pub static ref CACHE_MISSES: Counter =
        register_counter!("imagegen_cache_misses_total", "Total cache misses").unwrap();
    pub static ref CACHE_SIZE: Gauge =
        register_gauge!("imagegen_cache_size", "Current number of items in cache").unwrap();
    pub static ref BACKEND_LATENCY: Histogram = register_histogram!(
        "imagegen_backend_latency_seconds",
        "Backend generation latency in seconds"
    )
    .unwrap();
}
