use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::Stream;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;

use crate::sink::JobEvent;
use crate::state::AppState;

// Live feed of finished and failed jobs
pub async fn events_handler(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<Event, axum::Error>>> {
    let rx = state.events.subscribe();
    let stream = futures::stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let name = match &event {
                        JobEvent::Done { .. } => "done",
                        JobEvent::Failed { .. } => "failed",
                    };
                    let sse = Event::default()
                        .event(name)
                        .id(event.fingerprint().as_str())
                        .json_data(&event);
                    return Some((sse, rx));
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event subscriber fell behind");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}
