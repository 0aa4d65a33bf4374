use async_trait::async_trait;
use serde_json::{Value, json};
use std::time::Duration;
use tracing::{debug, info};

use super::{BackendCall, BackendError, ImageBackend, response_json, truncate_text};
use crate::models::ImagePayload;
use crate::references::mime_for_path;
use crate::retry::{PollError, poll_until};

pub const DEFAULT_WORKFLOW: &str = include_str!("resources/default_workflow.json");

const PROMPT_PLACEHOLDER: &str = "%prompt%";
const SEED_PLACEHOLDER: &str = "%seed%";

#[derive(Debug, Clone, PartialEq, Eq)]
struct OutputImage {
    filename: String,
    subfolder: String,
    kind: String,
}

/// Local workflow server (ComfyUI API): submit a workflow, poll its history
/// until outputs appear, then download the first image.
pub struct ComfyUiBackend {
    client: reqwest::Client,
    base_url: String,
    workflow: Value,
    client_id: String,
    poll_interval: Duration,
    max_attempts: u32,
    timeout: Duration,
}

impl ComfyUiBackend {
    pub fn new(
        client: reqwest::Client,
        base_url: impl Into<String>,
        workflow: Value,
        poll_interval: Duration,
        max_attempts: u32,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            workflow,
            client_id: format!("{:016x}", rand::random::<u64>()),
            poll_interval,
            max_attempts: max_attempts.max(1),
            timeout,
        }
    }

    fn build_workflow(&self, prompt: &str, seed: u64) -> Value {
        substitute(&self.workflow, prompt, seed)
    }

    async fn submit(&self, workflow: Value) -> Result<String, BackendError> {
        let response = self
            .client
            .post(format!("{}/prompt", self.base_url))
            .timeout(self.timeout)
            .json(&json!({ "prompt": workflow, "client_id": self.client_id }))
            .send()
            .await?;
        let body = response_json(response).await?;

        match body.get("prompt_id") {
            Some(Value::String(id)) if !id.is_empty() => Ok(id.clone()),
            Some(Value::Number(id)) => Ok(id.to_string()),
            _ => {
                let detail = body
                    .get("error")
                    .or_else(|| body.get("node_errors"))
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| body.to_string());
                Err(BackendError::InvalidResponse(format!(
                    "workflow was not queued: {}",
                    truncate_text(&detail, 512)
                )))
            }
        }
    }

    async fn check_history(&self, prompt_id: &str) -> Result<Option<OutputImage>, BackendError> {
        let response = self
            .client
            .get(format!("{}/history/{}", self.base_url, prompt_id))
            .timeout(self.timeout)
            .send()
            .await?;
        let body = response_json(response).await?;
        let Some(entry) = body.get(prompt_id) else {
            return Ok(None);
        };

        if entry.pointer("/status/status_str").and_then(Value::as_str) == Some("error") {
            return Err(BackendError::NoResultProduced(
                "workflow execution failed".to_string(),
            ));
        }
        if let Some(image) = first_output_image(entry) {
            return Ok(Some(image));
        }
        if entry.pointer("/status/completed").and_then(Value::as_bool) == Some(true) {
            return Err(BackendError::NoResultProduced(
                "workflow finished without images".to_string(),
            ));
        }
        Ok(None)
    }

    async fn fetch(&self, image: &OutputImage) -> Result<ImagePayload, BackendError> {
        let mut url = reqwest::Url::parse(&format!("{}/view", self.base_url))
            .map_err(|e| BackendError::InvalidResponse(e.to_string()))?;
        url.query_pairs_mut()
            .append_pair("filename", &image.filename)
            .append_pair("subfolder", &image.subfolder)
            .append_pair("type", &image.kind);

        let response = self.client.get(url).timeout(self.timeout).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::Http {
                status: status.as_u16(),
                body: truncate_text(&body, 512),
            });
        }
        let header_mime = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .filter(|value| value.starts_with("image/"))
            .map(str::to_string);
        let bytes = response.bytes().await?;
        let mime = header_mime
            .or_else(|| mime_for_path(std::path::Path::new(&image.filename)).map(str::to_string))
            .unwrap_or_else(|| "image/png".to_string());
        Ok(ImagePayload::from_bytes(&mime, &bytes))
    }
}

#[async_trait]
impl ImageBackend for ComfyUiBackend {
    fn name(&self) -> &str {
        "local-workflow"
    }

    fn supports_reference(&self) -> bool {
        false
    }

    async fn generate(&self, call: BackendCall<'_>) -> Result<ImagePayload, BackendError> {
        if self.base_url.is_empty() {
            return Err(BackendError::MissingEndpoint("local-workflow"));
        }
        let workflow = self.build_workflow(call.prompt, rand::random::<u32>() as u64);
        let prompt_id = self.submit(workflow).await?;
        info!(%prompt_id, "workflow queued");

        let image = poll_until(self.poll_interval, self.max_attempts, |attempt, elapsed| {
            (call.on_progress)(elapsed);
            debug!(%prompt_id, attempt, "polling workflow history");
            self.check_history(&prompt_id)
        })
        .await
        .map_err(|e| match e {
            PollError::Exhausted { .. } => BackendError::Timeout,
            PollError::Probe(e) => e,
        })?;

        self.fetch(&image).await
    }
}

fn first_output_image(entry: &Value) -> Option<OutputImage> {
    let outputs = entry.get("outputs")?.as_object()?;
    outputs
        .values()
        .filter_map(|node| node.get("images").and_then(Value::as_array))
        .flatten()
        .find_map(|image| {
            let filename = image.get("filename").and_then(Value::as_str)?;
            if filename.is_empty() {
                return None;
            }
            Some(OutputImage {
                filename: filename.to_string(),
                subfolder: image
                    .get("subfolder")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                kind: image
                    .get("type")
                    .and_then(Value::as_str)
                    .unwrap_or("output")
                    .to_string(),
            })
        })
}

// %seed% as a whole value becomes a number; %prompt% is replaced anywhere
fn substitute(value: &Value, prompt: &str, seed: u64) -> Value {
    match value {
        Value::String(s) if s == SEED_PLACEHOLDER => json!(seed),
        Value::String(s) if s.contains(PROMPT_PLACEHOLDER) => {
            Value::String(s.replace(PROMPT_PLACEHOLDER, prompt))
        }
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| substitute(item, prompt, seed))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), substitute(v, prompt, seed)))
                .collect(),
        ),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::test_server;
    use axum::extract::{Path, Query, State};
    use axum::http::header;
    use axum::response::IntoResponse;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    #[derive(Clone)]
    struct FakeComfy {
        polls: Arc<AtomicU32>,
        ready_after: u32,
        submitted: Arc<Mutex<Option<Value>>>,
    }

    async fn comfy(ready_after: u32) -> (String, FakeComfy) {
        let state = FakeComfy {
            polls: Arc::new(AtomicU32::new(0)),
            ready_after,
            submitted: Arc::new(Mutex::new(None)),
        };
        let app = Router::new()
            .route(
                "/prompt",
                post(|State(s): State<FakeComfy>, Json(body): Json<Value>| async move {
                    *s.submitted.lock().unwrap() = Some(body);
                    Json(json!({ "prompt_id": "job-1", "number": 0 }))
                }),
            )
            .route(
                "/history/{id}",
                get(|State(s): State<FakeComfy>, Path(id): Path<String>| async move {
                    let polls = s.polls.fetch_add(1, Ordering::SeqCst) + 1;
                    if polls < s.ready_after {
                        return Json(json!({}));
                    }
                    let mut body = serde_json::Map::new();
                    body.insert(
                        id,
                        json!({
                            "outputs": { "9": { "images": [
                                { "filename": "imagegen_0001.png", "subfolder": "", "type": "output" }
                            ]}},
                            "status": { "status_str": "success", "completed": true }
                        }),
                    );
                    Json(Value::Object(body))
                }),
            )
            .route(
                "/view",
                get(|Query(q): Query<HashMap<String, String>>| async move {
                    assert_eq!(q.get("filename").map(String::as_str), Some("imagegen_0001.png"));
                    assert_eq!(q.get("type").map(String::as_str), Some("output"));
                    ([(header::CONTENT_TYPE, "image/png")], b"PNGDATA".to_vec()).into_response()
                }),
            )
            .with_state(state.clone());
        (test_server::spawn(app).await, state)
    }

    fn backend(url: String, max_attempts: u32) -> ComfyUiBackend {
        let workflow: Value = serde_json::from_str(DEFAULT_WORKFLOW).unwrap();
        ComfyUiBackend::new(
            reqwest::Client::new(),
            url,
            workflow,
            Duration::from_millis(5),
            max_attempts,
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn polls_until_outputs_then_fetches() {
        let (url, fake) = comfy(3).await;
        let ticks = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&ticks);
        let on_progress = move |_: Duration| {
            counter.fetch_add(1, Ordering::SeqCst);
        };

        let payload = backend(url, 10)
            .generate(BackendCall {
                prompt: "a red fox",
                reference: None,
                on_progress: &on_progress,
            })
            .await
            .unwrap();

        assert_eq!(payload, ImagePayload::from_bytes("image/png", b"PNGDATA"));
        assert_eq!(fake.polls.load(Ordering::SeqCst), 3);
        assert_eq!(ticks.load(Ordering::SeqCst), 3);

        let submitted = fake.submitted.lock().unwrap().clone().unwrap();
        assert_eq!(submitted.pointer("/prompt/6/inputs/text"), Some(&json!("a red fox")));
        assert!(submitted.pointer("/prompt/3/inputs/seed").unwrap().is_u64());
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let (url, fake) = comfy(u32::MAX).await;
        let err = backend(url, 2)
            .generate(BackendCall {
                prompt: "a red fox",
                reference: None,
                on_progress: &|_: Duration| {},
            })
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Timeout));
        assert_eq!(fake.polls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn error_entry_has_no_output_image() {
        let entry = json!({ "outputs": {}, "status": { "status_str": "error", "completed": false } });
        assert!(first_output_image(&entry).is_none());
    }

    #[test]
    fn substitution_keeps_other_values() {
        let template = json!({
            "a": { "inputs": { "text": "masterpiece, %prompt%", "seed": "%seed%", "steps": 20 } },
            "b": ["4", 0]
        });
        let built = substitute(&template, "a kite", 42);
        assert_eq!(built.pointer("/a/inputs/text"), Some(&json!("masterpiece, a kite")));
        assert_eq!(built.pointer("/a/inputs/seed"), Some(&json!(42)));
        assert_eq!(built.pointer("/a/inputs/steps"), Some(&json!(20)));
        assert_eq!(built.pointer("/b"), Some(&json!(["4", 0])));
    }
}
