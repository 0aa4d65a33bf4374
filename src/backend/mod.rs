mod direct;
mod local;
mod proxy;
mod selector;

pub use direct::DirectKeyBackend;
pub use local::ComfyUiBackend;
pub use proxy::ProxyBackend;
pub use selector::{BackendMode, BackendSelector};

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

use crate::models::{ErrorClass, ImagePayload, JobError, ReferenceImage};

#[derive(Debug, Clone, Error)]
pub enum BackendError {
    #[error("no credential configured for {0}")]
    MissingCredential(&'static str),
    #[error("no endpoint configured for {0}")]
    MissingEndpoint(&'static str),
    #[error("reference image '{0}' not found")]
    MissingReference(String),
    #[error("backend returned HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("backend request timed out")]
    Timeout,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("unreadable backend response: {0}")]
    InvalidResponse(String),
    #[error("no image produced: {0}")]
    NoResultProduced(String),
}

impl BackendError {
    pub fn class(&self) -> ErrorClass {
        match self {
            BackendError::MissingCredential(_)
            | BackendError::MissingEndpoint(_)
            | BackendError::MissingReference(_) => ErrorClass::Config,
            BackendError::NoResultProduced(_) => ErrorClass::ContentPolicy,
            BackendError::Http { .. }
            | BackendError::Timeout
            | BackendError::Transport(_)
            | BackendError::InvalidResponse(_) => ErrorClass::Transport,
        }
    }

    pub fn to_job_error(&self) -> JobError {
        JobError {
            class: self.class(),
            message: self.to_string(),
        }
    }
}

impl From<reqwest::Error> for BackendError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            BackendError::Timeout
        } else {
            BackendError::Transport(err.to_string())
        }
    }
}

/// One generation call as seen by a backend.
pub struct BackendCall<'a> {
    pub prompt: &'a str,
    pub reference: Option<&'a ReferenceImage>,
    // told how long the call has been running; only polling backends use it
    pub on_progress: &'a (dyn Fn(Duration) + Send + Sync),
}

#[async_trait]
pub trait ImageBackend: Send + Sync {
    fn name(&self) -> &str;

    fn supports_reference(&self) -> bool {
        true
    }

    async fn generate(&self, call: BackendCall<'_>) -> Result<ImagePayload, BackendError>;
}

// Reads a JSON body, turning non-2xx statuses into Http errors
pub(crate) async fn response_json(response: reqwest::Response) -> Result<Value, BackendError> {
    let status = response.status();
    let body = response.text().await?;
    if !status.is_success() {
        return Err(BackendError::Http {
            status: status.as_u16(),
            body: truncate_text(&body, 512),
        });
    }
    serde_json::from_str(&body).map_err(|e| BackendError::InvalidResponse(e.to_string()))
}

pub(crate) fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}


#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Counts calls and tracks how many run at once.
    #[derive(Default)]
    pub struct CountingBackend {
        pub calls: AtomicUsize,
        pub in_flight: AtomicUsize,
        pub peak: AtomicUsize,
        pub fail: AtomicBool,
        pub delay: Duration,
    }

    impl CountingBackend {
        pub fn slow(delay: Duration) -> Self {
            Self {
                delay,
                ..Self::default()
            }
        }

        pub fn failing() -> Self {
            let backend = Self::default();
            backend.fail.store(true, Ordering::SeqCst);
            backend
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ImageBackend for CountingBackend {
        fn name(&self) -> &str {
            "counting"
        }

        async fn generate(&self, call: BackendCall<'_>) -> Result<ImagePayload, BackendError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if self.fail.load(Ordering::SeqCst) {
                return Err(BackendError::NoResultProduced("SAFETY".to_string()));
            }
            Ok(ImagePayload::from_bytes("image/png", call.prompt.as_bytes()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_map_to_classes() {
        assert_eq!(BackendError::MissingCredential("direct").class(), ErrorClass::Config);
        assert_eq!(BackendError::MissingReference("x".into()).class(), ErrorClass::Config);
        assert_eq!(BackendError::Timeout.class(), ErrorClass::Transport);
        assert_eq!(
            BackendError::Http { status: 502, body: String::new() }.class(),
            ErrorClass::Transport
        );
        assert_eq!(
            BackendError::NoResultProduced("SAFETY".into()).class(),
            ErrorClass::ContentPolicy
        );
    }

    #[test]
    fn job_error_keeps_message() {
        let err = BackendError::NoResultProduced("SAFETY".into()).to_job_error();
        assert_eq!(err.class, ErrorClass::ContentPolicy);
        assert_eq!(err.message, "no image produced: SAFETY");
    }
}
