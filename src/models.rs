use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

// A single image generation request found in the text stream
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub prompt: String,
    #[serde(default)]
    pub reference: Option<String>,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            reference: None,
        }
    }

    pub fn with_reference(prompt: impl Into<String>, reference: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            reference: Some(reference.into()),
        }
    }

    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::of(self)
    }
}

/// Cache and dedup key of a request: a short hash of `reference:prompt`
/// (or just `prompt` when there is no reference).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn of(request: &GenerationRequest) -> Self {
        let mut hasher = Sha256::new();
        if let Some(reference) = &request.reference {
            hasher.update(reference.as_bytes());
            hasher.update(b":");
        }
        hasher.update(request.prompt.as_bytes());
        let digest = hasher.finalize();
        Self(hex::encode(&digest[..8]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for Fingerprint {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// Self-describing embedded image: "data:<mime>;base64,<data>"
// Every backend returns this, so nothing downstream cares which one ran.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ImagePayload(String);

impl ImagePayload {
    pub fn from_bytes(mime_type: &str, bytes: &[u8]) -> Self {
        Self(format!("data:{};base64,{}", mime_type, BASE64.encode(bytes)))
    }

    pub fn from_base64(mime_type: &str, data: &str) -> Self {
        Self(format!("data:{};base64,{}", mime_type, data.trim()))
    }

    // Accepts an existing data URI, rejects anything else
    pub fn from_data_uri(uri: &str) -> Option<Self> {
        let uri = uri.trim();
        let rest = uri.strip_prefix("data:")?;
        let (header, data) = rest.split_once(',')?;
        if !header.starts_with("image/") || !header.ends_with(";base64") || data.is_empty() {
            return None;
        }
        Some(Self(uri.to_string()))
    }

    pub fn mime_type(&self) -> &str {
        self.0
            .strip_prefix("data:")
            .and_then(|rest| rest.split(';').next())
            .unwrap_or("application/octet-stream")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

// Reference image resolved by name before a backend call
#[derive(Debug, Clone)]
pub struct ReferenceImage {
    pub name: String,
    pub data: Vec<u8>,
    pub mime_type: String,
}

impl ReferenceImage {
    pub fn base64_data(&self) -> String {
        BASE64.encode(&self.data)
    }

    pub fn data_uri(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, self.base64_data())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Generating,
    Done,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    // missing credential, endpoint or reference; nothing was sent
    Config,
    Transport,
    // the backend ran but produced no image
    ContentPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobError {
    pub class: ErrorClass,
    pub message: String,
}

// In-memory record of one generation job, keyed by fingerprint
#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    pub fingerprint: Fingerprint,
    pub request: GenerationRequest,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<ImagePayload>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
    pub elapsed_ms: u64,
}

impl JobRecord {
    pub fn pending(request: GenerationRequest) -> Self {
        Self {
            fingerprint: request.fingerprint(),
            request,
            status: JobStatus::Pending,
            payload: None,
            error: None,
            elapsed_ms: 0,
        }
    }
}

// HTTP body for stream ingestion
#[derive(Deserialize)]
pub struct StreamText {
    pub text: String,
}

// HTTP body for one-off generation
#[derive(Deserialize)]
pub struct GenerateBody {
    pub prompt: String,
    #[serde(default)]
    pub reference: Option<String>,
}

#[derive(Serialize)]
pub struct GenerateResponse {
    pub fingerprint: Fingerprint,
    pub payload: ImagePayload,
    pub cached: bool,
}
