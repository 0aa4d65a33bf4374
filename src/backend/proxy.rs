use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::{BackendCall, BackendError, ImageBackend, response_json};
use crate::load_balancer::LoadBalancer;
use crate::models::ImagePayload;

/// Recognises one way a proxy can hand back an image.
pub type ShapeDetector = fn(&Value) -> Option<ImagePayload>;

// Tried in order; the first match wins. A new vendor shape is one more entry.
pub const DEFAULT_DETECTORS: &[ShapeDetector] =
    &[detect_message_images, detect_content_data_uri, detect_data_b64];

lazy_static! {
    static ref DATA_URI: Regex =
        Regex::new(r"data:image/[a-zA-Z0-9.+-]+;base64,[A-Za-z0-9+/=]+").unwrap();
}

/// OpenAI-compatible chat endpoint behind a pool of reverse proxies sharing
/// one bearer credential.
pub struct ProxyBackend {
    client: reqwest::Client,
    balancer: Arc<LoadBalancer>,
    api_key: Option<String>,
    model: String,
    timeout: Duration,
    detectors: Vec<ShapeDetector>,
}

impl ProxyBackend {
    pub fn new(
        client: reqwest::Client,
        balancer: Arc<LoadBalancer>,
        api_key: Option<String>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            balancer,
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            model: model.into(),
            timeout,
            detectors: DEFAULT_DETECTORS.to_vec(),
        }
    }

    fn request_body(&self, call: &BackendCall<'_>) -> Value {
        let content = match call.reference {
            Some(reference) => json!([
                { "type": "text", "text": call.prompt },
                { "type": "image_url", "image_url": { "url": reference.data_uri() } },
            ]),
            None => json!(call.prompt),
        };
        json!({
            "model": self.model,
            "messages": [{ "role": "user", "content": content }],
            "stream": false,
        })
    }

    fn detect(&self, body: &Value) -> Option<ImagePayload> {
        self.detectors.iter().find_map(|detect| detect(body))
    }
}

#[async_trait]
impl ImageBackend for ProxyBackend {
    fn name(&self) -> &str {
        "load-balanced-proxy"
    }

    async fn generate(&self, call: BackendCall<'_>) -> Result<ImagePayload, BackendError> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or(BackendError::MissingCredential("load-balanced-proxy"))?;
        let endpoint = self
            .balancer
            .get_endpoint()
            .ok_or(BackendError::MissingEndpoint("load-balanced-proxy"))?;
        debug!(endpoint = %endpoint.url, "proxy request");

        let result = self
            .client
            .post(format!("{}/v1/chat/completions", endpoint.url))
            .bearer_auth(api_key)
            .timeout(self.timeout)
            .json(&self.request_body(&call))
            .send()
            .await;

        let response = match result {
            Ok(res) => res,
            // Marking endpoint as unhealthy on transport error
            Err(e) => {
                endpoint.set_healthy(false);
                warn!(endpoint = %endpoint.url, error = %e, "proxy endpoint failed, marked unhealthy");
                return Err(e.into());
            }
        };

        let body = response_json(response).await?;
        self.detect(&body).ok_or_else(|| {
            let reason = body
                .pointer("/choices/0/finish_reason")
                .and_then(Value::as_str)
                .unwrap_or("response contained no image");
            BackendError::NoResultProduced(reason.to_string())
        })
    }
}

// choices[0].message.images[0].image_url.url
pub fn detect_message_images(body: &Value) -> Option<ImagePayload> {
    let image = body.pointer("/choices/0/message/images/0")?;
    let url = image
        .pointer("/image_url/url")
        .or_else(|| image.get("url"))
        .and_then(Value::as_str)?;
    ImagePayload::from_data_uri(url)
}

// a data URI somewhere in the text content, bare or inside ![..](..)
pub fn detect_content_data_uri(body: &Value) -> Option<ImagePayload> {
    let content = body.pointer("/choices/0/message/content")?;
    let text = match content {
        Value::String(text) => text.clone(),
        Value::Array(parts) => parts
            .iter()
            .filter_map(|part| part.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        _ => return None,
    };
    let found = DATA_URI.find(&text)?;
    ImagePayload::from_data_uri(found.as_str())
}

// data[0].b64_json, images-API style
pub fn detect_data_b64(body: &Value) -> Option<ImagePayload> {
    let item = body.pointer("/data/0")?;
    if let Some(b64) = item.get("b64_json").and_then(Value::as_str) {
        if !b64.trim().is_empty() {
            return Some(ImagePayload::from_base64("image/png", b64));
        }
    }
    item.get("url")
        .and_then(Value::as_str)
        .and_then(ImagePayload::from_data_uri)
}
