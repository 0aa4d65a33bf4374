use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::Json;
use serde::Serialize;
use std::sync::Arc;

use crate::models::{Fingerprint, StreamText};
use crate::sse::SseDecoder;
use crate::state::AppState;

#[derive(Serialize)]
pub struct StreamUpdate {
    pub stream: String,
    pub dispatched: Vec<Fingerprint>,
    pub ended: bool,
}

pub async fn begin_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Json<StreamUpdate> {
    state.decoders.remove(&id);
    state.dispatcher.begin_stream(&id);
    Json(StreamUpdate {
        stream: id,
        dispatched: Vec::new(),
        ended: false,
    })
}

// body carries the whole message so far
pub async fn snapshot_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<StreamText>,
) -> Json<StreamUpdate> {
    let dispatched = state.dispatcher.push_snapshot(&id, &body.text);
    Json(StreamUpdate {
        stream: id,
        dispatched,
        ended: false,
    })
}

pub async fn delta_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<StreamText>,
) -> Json<StreamUpdate> {
    let dispatched = state.dispatcher.push_delta(&id, &body.text);
    Json(StreamUpdate {
        stream: id,
        dispatched,
        ended: false,
    })
}

// Raw event-stream bytes, as relayed from an OpenAI-style chat completion
pub async fn sse_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Bytes,
) -> Json<StreamUpdate> {
    let (text, done) = {
        let mut decoder = state
            .decoders
            .entry(id.clone())
            .or_insert_with(|| SseDecoder::new(state.dispatcher.buffer_ceiling()));
        let text = decoder.feed(&body).concat();
        (text, decoder.is_done())
    };

    let dispatched = if text.is_empty() {
        Vec::new()
    } else {
        state.dispatcher.push_delta(&id, &text)
    };
    if done {
        state.decoders.remove(&id);
        state.dispatcher.end_stream(&id);
    }
    Json(StreamUpdate {
        stream: id,
        dispatched,
        ended: done,
    })
}

pub async fn end_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Json<StreamUpdate> {
    state.decoders.remove(&id);
    let ended = state.dispatcher.end_stream(&id);
    Json(StreamUpdate {
        stream: id,
        dispatched: Vec::new(),
        ended,
    })
}
