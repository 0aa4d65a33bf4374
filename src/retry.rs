use std::future::Future;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::time::sleep;

#[derive(Debug, Error)]
pub enum PollError<E> {
    #[error("gave up after {attempts} attempts ({elapsed:?})")]
    Exhausted { attempts: u32, elapsed: Duration },
    #[error("{0}")]
    Probe(E),
}

/// Calls `probe` (1-based attempt, elapsed time) until it yields a value.
/// `Ok(None)` means not ready yet; an `Err` stops polling.
pub async fn poll_until<T, E, F, Fut>(
    interval: Duration,
    max_attempts: u32,
    mut probe: F,
) -> Result<T, PollError<E>>
where
    F: FnMut(u32, Duration) -> Fut,
    Fut: Future<Output = Result<Option<T>, E>>,
{
    let started = Instant::now();
    for attempt in 1..=max_attempts {
        if let Some(value) = probe(attempt, started.elapsed()).await.map_err(PollError::Probe)? {
            return Ok(value);
        }
        if attempt < max_attempts {
            sleep(interval).await;
        }
    }
    Err(PollError::Exhausted {
        attempts: max_attempts,
        elapsed: started.elapsed(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn returns_first_ready_value() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let result: Result<u32, PollError<String>> =
            poll_until(Duration::from_millis(1), 10, move |attempt, _| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok((attempt == 3).then_some(attempt))
                }
            })
            .await;
        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let result: Result<(), PollError<String>> =
            poll_until(Duration::from_millis(1), 4, |_, _| async { Ok(None) }).await;
        match result {
            Err(PollError::Exhausted { attempts, .. }) => assert_eq!(attempts, 4),
            other => panic!("expected exhaustion, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn probe_error_stops_polling() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let result: Result<(), PollError<String>> =
            poll_until(Duration::from_millis(1), 10, move |_, _| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err("boom".to_string())
                }
            })
            .await;
        assert!(matches!(result, Err(PollError::Probe(ref e)) if e == "boom"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
