use anyhow::Context;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use super::local::DEFAULT_WORKFLOW;
use super::{
    BackendCall, BackendError, ComfyUiBackend, DirectKeyBackend, ImageBackend, ProxyBackend,
};
use crate::config::BackendConfig;
use crate::load_balancer::LoadBalancer;
use crate::models::{GenerationRequest, ImagePayload};
use crate::references::ReferenceStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum BackendMode {
    DirectKey,
    LoadBalancedProxy,
}

/// Routes every request to the active backend. References resolve here,
/// before any network call.
pub struct BackendSelector {
    primary: Arc<dyn ImageBackend>,
    local: Option<Arc<dyn ImageBackend>>,
    references: Arc<ReferenceStore>,
    balancer: Option<Arc<LoadBalancer>>,
}

impl BackendSelector {
    pub fn new(
        primary: Arc<dyn ImageBackend>,
        local: Option<Arc<dyn ImageBackend>>,
        references: Arc<ReferenceStore>,
    ) -> Self {
        Self {
            primary,
            local,
            references,
            balancer: None,
        }
    }

    pub fn from_config(
        config: &BackendConfig,
        client: reqwest::Client,
        references: Arc<ReferenceStore>,
    ) -> anyhow::Result<Self> {
        let mut balancer = None;
        let primary: Arc<dyn ImageBackend> = match config.mode {
            BackendMode::DirectKey => Arc::new(DirectKeyBackend::new(
                client.clone(),
                config.direct_endpoint.clone(),
                config.direct_model.clone(),
                config.api_keys.clone(),
                config.request_timeout,
            )),
            BackendMode::LoadBalancedProxy => {
                let lb = Arc::new(LoadBalancer::new(
                    &config.proxy_urls,
                    config.balance_policy,
                ));
                balancer = Some(Arc::clone(&lb));
                Arc::new(ProxyBackend::new(
                    client.clone(),
                    lb,
                    config.proxy_api_key.clone(),
                    config.proxy_model.clone(),
                    config.request_timeout,
                ))
            }
        };

        let local: Option<Arc<dyn ImageBackend>> = if config.local_workflow {
            let workflow = load_workflow(config.workflow_file.as_deref())?;
            Some(Arc::new(ComfyUiBackend::new(
                client,
                config.comfy_url.clone(),
                workflow,
                config.poll_interval,
                config.poll_max_attempts,
                config.request_timeout,
            )))
        } else {
            None
        };

        let mut selector = Self::new(primary, local, references);
        selector.balancer = balancer;
        info!(backend = selector.active().name(), "backend selected");
        Ok(selector)
    }

    pub fn active(&self) -> &Arc<dyn ImageBackend> {
        self.local.as_ref().unwrap_or(&self.primary)
    }

    pub fn balancer(&self) -> Option<&Arc<LoadBalancer>> {
        self.balancer.as_ref()
    }

    pub async fn generate(
        &self,
        request: &GenerationRequest,
        on_progress: &(dyn Fn(Duration) + Send + Sync),
    ) -> Result<ImagePayload, BackendError> {
        let backend = self.active();

        let reference = match &request.reference {
            Some(name) if backend.supports_reference() => Some(
                self.references
                    .resolve(name)
                    .await
                    .ok_or_else(|| BackendError::MissingReference(name.clone()))?,
            ),
            Some(name) => {
                warn!(
                    backend = backend.name(),
                    reference = %name,
                    "backend does not take reference images, ignoring"
                );
                None
            }
            None => None,
        };

        backend
            .generate(BackendCall {
                prompt: &request.prompt,
                reference: reference.as_ref(),
                on_progress,
            })
            .await
    }
}

fn load_workflow(path: Option<&std::path::Path>) -> anyhow::Result<Value> {
    let raw = match path {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("failed reading workflow {}", path.display()))?,
        None => DEFAULT_WORKFLOW.to_string(),
    };
    serde_json::from_str(&raw).context("workflow is not valid JSON")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ReferenceImage;
    use async_trait::async_trait;
    use std::sync::Mutex;

    // Records what each call looked like
    struct Recording {
        name: &'static str,
        takes_reference: bool,
        calls: Mutex<Vec<(String, Option<String>)>>,
    }

    #[async_trait]
    impl ImageBackend for Recording {
        fn name(&self) -> &str {
            self.name
        }

        fn supports_reference(&self) -> bool {
            self.takes_reference
        }

        async fn generate(&self, call: BackendCall<'_>) -> Result<ImagePayload, BackendError> {
            self.calls.lock().unwrap().push((
                call.prompt.to_string(),
                call.reference.map(|r| r.name.clone()),
            ));
            Ok(ImagePayload::from_bytes("image/png", self.name.as_bytes()))
        }
    }

    fn recording(name: &'static str, takes_reference: bool) -> Arc<Recording> {
        Arc::new(Recording {
            name,
            takes_reference,
            calls: Mutex::new(Vec::new()),
        })
    }

    fn noop(_: Duration) {}

    #[tokio::test]
    async fn missing_reference_fails_before_backend_call() {
        let primary = recording("primary", true);
        let selector = BackendSelector::new(
            primary.clone(),
            None,
            Arc::new(ReferenceStore::new(None)),
        );
        let err = selector
            .generate(&GenerationRequest::with_reference("wave", "ghost"), &noop)
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::MissingReference(ref n) if n == "ghost"));
        assert_eq!(err.class(), crate::models::ErrorClass::Config);
        assert!(primary.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn resolved_reference_is_passed_through() {
        let primary = recording("primary", true);
        let references = Arc::new(ReferenceStore::new(None));
        references.insert(ReferenceImage {
            name: "alice".into(),
            data: vec![1],
            mime_type: "image/png".into(),
        });
        let selector = BackendSelector::new(primary.clone(), None, references);
        selector
            .generate(&GenerationRequest::with_reference("wave", "alice"), &noop)
            .await
            .unwrap();
        assert_eq!(
            primary.calls.lock().unwrap().as_slice(),
            &[("wave".to_string(), Some("alice".to_string()))]
        );
    }

    #[tokio::test]
    async fn local_workflow_wins_and_ignores_reference() {
        let primary = recording("primary", true);
        let local = recording("local", false);
        let selector = BackendSelector::new(
            primary.clone(),
            Some(local.clone() as Arc<dyn ImageBackend>),
            Arc::new(ReferenceStore::new(None)),
        );
        let payload = selector
            .generate(&GenerationRequest::with_reference("wave", "ghost"), &noop)
            .await
            .unwrap();

        assert_eq!(payload, ImagePayload::from_bytes("image/png", b"local"));
        assert!(primary.calls.lock().unwrap().is_empty());
        assert_eq!(
            local.calls.lock().unwrap().as_slice(),
            &[("wave".to_string(), None)]
        );
    }

    #[test]
    fn builds_proxy_selector_with_balancer() {
        let config = BackendConfig {
            mode: BackendMode::LoadBalancedProxy,
            proxy_urls: vec!["http://a".into(), "http://b".into()],
            ..BackendConfig::default()
        };
        let selector = BackendSelector::from_config(
            &config,
            reqwest::Client::new(),
            Arc::new(ReferenceStore::new(None)),
        )
        .unwrap();
        assert_eq!(selector.active().name(), "load-balanced-proxy");
        assert_eq!(selector.balancer().map(|lb| lb.len()), Some(2));
    }

    #[test]
    fn bad_workflow_file_is_a_startup_error() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("workflow.json");
        std::fs::write(&path, "{ not json").unwrap();
        let config = BackendConfig {
            local_workflow: true,
            workflow_file: Some(path),
            ..BackendConfig::default()
        };
        let result = BackendSelector::from_config(
            &config,
            reqwest::Client::new(),
            Arc::new(ReferenceStore::new(None)),
        );
        assert!(result.is_err());
    }
}
