use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::debug;

use super::{BackendCall, BackendError, ImageBackend, response_json};
use crate::models::ImagePayload;

// key index advances on every call, whatever the outcome
pub struct DirectKeyBackend {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    keys: Vec<String>,
    next_key: AtomicUsize,
    timeout: Duration,
}

impl DirectKeyBackend {
    pub fn new(
        client: reqwest::Client,
        endpoint: impl Into<String>,
        model: impl Into<String>,
        keys: Vec<String>,
        timeout: Duration,
    ) -> Self {
        let keys = keys
            .into_iter()
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
            .collect();
        Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            model: model.into(),
            keys,
            next_key: AtomicUsize::new(0),
            timeout,
        }
    }

    fn next_key(&self) -> Option<&str> {
        if self.keys.is_empty() {
            return None;
        }
        let idx = self.next_key.fetch_add(1, Ordering::Relaxed) % self.keys.len();
        Some(self.keys[idx].as_str())
    }

    fn request_body(call: &BackendCall<'_>) -> Value {
        let mut parts = vec![json!({ "text": call.prompt })];
        if let Some(reference) = call.reference {
            parts.push(json!({
                "inlineData": {
                    "mimeType": reference.mime_type,
                    "data": reference.base64_data(),
                }
            }));
        }
        json!({
            "contents": [{ "role": "user", "parts": parts }],
            "generationConfig": { "responseModalities": ["TEXT", "IMAGE"] },
        })
    }
}

#[async_trait]
impl ImageBackend for DirectKeyBackend {
    fn name(&self) -> &str {
        "direct-key"
    }

    async fn generate(&self, call: BackendCall<'_>) -> Result<ImagePayload, BackendError> {
        if self.endpoint.is_empty() {
            return Err(BackendError::MissingEndpoint("direct-key"));
        }
        let key = self
            .next_key()
            .ok_or(BackendError::MissingCredential("direct-key"))?;

        let url = format!("{}/models/{}:generateContent", self.endpoint, self.model);
        debug!(%url, "direct-key request");
        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", key)
            .timeout(self.timeout)
            .json(&Self::request_body(&call))
            .send()
            .await?;
        let body = response_json(response).await?;
        extract_inline_image(&body)
    }
}

// First inline image part of the first candidate that has one
fn extract_inline_image(body: &Value) -> Result<ImagePayload, BackendError> {
    let candidates = body
        .get("candidates")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    for candidate in &candidates {
        let parts = candidate
            .pointer("/content/parts")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for part in &parts {
            let inline = part.get("inlineData").or_else(|| part.get("inline_data"));
            let Some(inline) = inline else { continue };
            let data = inline.get("data").and_then(Value::as_str).unwrap_or_default();
            if data.is_empty() {
                continue;
            }
            let mime = inline
                .get("mimeType")
                .or_else(|| inline.get("mime_type"))
                .and_then(Value::as_str)
                .unwrap_or("image/png");
            return Ok(ImagePayload::from_base64(mime, data));
        }
    }

    // no image: report why, so a safety block reads differently from an outage
    let reason = candidates
        .first()
        .and_then(|c| c.get("finishReason"))
        .and_then(Value::as_str)
        .or_else(|| {
            body.pointer("/promptFeedback/blockReason")
                .and_then(Value::as_str)
        })
        .unwrap_or("response contained no image");
    Err(BackendError::NoResultProduced(reason.to_string()))
}
