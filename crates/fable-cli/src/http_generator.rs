//! HTTP generation routine.
//!
//! One configured backend is one HTTP endpoint. An attempt posts the prompt,
//! retries transient failures up to the backend's budget and stores the
//! resulting artifact. Failures whose text matches one of the backend's
//! `forbid_patterns` mean the prompt itself was refused; those turn into a
//! split request when the caller allows it.

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use fable_config::{BackendConfig, ForgeConfig};
use fable_core::{AppError, AttemptOutcome, BackendCandidate, TaskKind};
use fable_scheduler::Generator;
use regex::Regex;
use reqwest::header::CONTENT_TYPE;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::store::FsArtifactStore;

const MAX_ERROR_BODY_CHARS: usize = 500;

struct HttpBackend {
    config: BackendConfig,
    forbid: Vec<Regex>,
}

impl HttpBackend {
    fn is_refusal(&self, failure: &str) -> bool {
        self.forbid.iter().any(|re| re.is_match(failure))
    }
}

pub(crate) struct HttpGenerator {
    kind: TaskKind,
    client: reqwest::Client,
    backends: HashMap<String, HttpBackend>,
    split_prompt_template: String,
    store: Arc<FsArtifactStore>,
}

impl HttpGenerator {
    pub fn new(kind: TaskKind, config: &ForgeConfig, store: Arc<FsArtifactStore>) -> Result<Self> {
        let mut backends = HashMap::new();
        for (name, backend) in &config.backends {
            let forbid = backend
                .forbid_patterns
                .iter()
                .map(|pattern| {
                    Regex::new(pattern).with_context(|| {
                        format!("backends.{name}.forbid_patterns: invalid regex '{pattern}'")
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            backends.insert(
                name.clone(),
                HttpBackend {
                    config: backend.clone(),
                    forbid,
                },
            );
        }

        Ok(Self {
            kind,
            client: reqwest::Client::new(),
            backends,
            split_prompt_template: config.run.split_prompt_template.clone(),
            store,
        })
    }

    #[cfg(test)]
    fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    async fn request_once(&self, backend: &HttpBackend, prompt: &str) -> Result<Vec<u8>> {
        let config = &backend.config;
        let body = render_body(config.body.as_deref(), prompt)?;

        let mut request = self
            .client
            .post(&config.endpoint)
            .timeout(config.timeout())
            .header(CONTENT_TYPE, "application/json")
            .body(body);
        for (name, value) in &config.headers {
            request = request.header(name, value);
        }
        if let Some(var) = &config.api_key_env {
            let token = std::env::var(var)
                .with_context(|| format!("environment variable {var} is not set"))?;
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("request to {} failed", config.endpoint))?;
        let status = response.status();
        let bytes = response
            .bytes()
            .await
            .context("failed to read response body")?;

        if !status.is_success() {
            bail!(
                "status {status}: {}",
                truncate(&String::from_utf8_lossy(&bytes), MAX_ERROR_BODY_CHARS)
            );
        }

        let Some(pointer) = &config.result_pointer else {
            return Ok(bytes.to_vec());
        };
        let value: Value =
            serde_json::from_slice(&bytes).context("failed to parse response JSON")?;
        let url = value
            .pointer(pointer)
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("missing string at {pointer} in response"))?;
        debug!(url, "Downloading artifact");

        let download = self
            .client
            .get(url)
            .timeout(config.timeout())
            .send()
            .await
            .with_context(|| format!("download from {url} failed"))?
            .error_for_status()
            .with_context(|| format!("download from {url} failed"))?;
        Ok(download
            .bytes()
            .await
            .context("failed to read downloaded artifact")?
            .to_vec())
    }
}

#[async_trait]
impl Generator for HttpGenerator {
    async fn attempt(
        &self,
        backend: &BackendCandidate,
        prompt: &str,
        key: &str,
        allow_split: bool,
    ) -> Result<AttemptOutcome> {
        let Some(http) = self.backends.get(&backend.name) else {
            warn!(backend = %backend.name, "No [backends] entry for model backend");
            return Ok(AttemptOutcome::PermanentFailure);
        };

        let retries = http.config.retries.max(1);
        let mut refused = false;
        let mut last_failure = String::new();

        for attempt in 1..=retries {
            match self.request_once(http, prompt).await {
                Ok(bytes) => {
                    let path = self.store.write(self.kind, key, &bytes).await?;
                    info!(key, backend = %backend.name, path = %path.display(), "Stored artifact");
                    return Ok(AttemptOutcome::Success);
                }
                Err(e) => {
                    let failure = format!("{e:#}");
                    if http.is_refusal(&failure) {
                        refused = true;
                    }
                    warn!(
                        key,
                        backend = %backend.name,
                        attempt,
                        retries,
                        refused,
                        error = %failure,
                        "Generation request failed"
                    );
                    last_failure = failure;
                }
            }
            if attempt < retries {
                tokio::time::sleep(http.config.retry_delay()).await;
            }
        }

        if refused && allow_split {
            return Ok(AttemptOutcome::Split(
                self.split_prompt_template.replace("{prompt}", prompt),
            ));
        }

        let err = AppError::BackendPermanentFailure {
            backend: backend.name.clone(),
            reason: last_failure,
        };
        debug!(key, "{err}");
        Ok(AttemptOutcome::PermanentFailure)
    }
}

/// Request body: the template with `{prompt}` replaced by the JSON-encoded
/// prompt, or `{"prompt": ...}` when there is no template.
fn render_body(template: Option<&str>, prompt: &str) -> Result<String> {
    match template {
        Some(template) => {
            let encoded = serde_json::to_string(prompt)?;
            Ok(template.replace("{prompt}", &encoded))
        }
        None => Ok(json!({ "prompt": prompt }).to_string()),
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

#[cfg(test)]
#[path = "http_generator_tests.rs"]
mod tests;
