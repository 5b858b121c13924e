//! Embedding client for LocalRAG
//! Talks to the local runtime's embedding endpoint, with retrying batch
//! embedding and on-demand model provisioning from the offline bundle

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::RagConfig;
use crate::error::ErrorCategory;
use crate::retry::RetryPolicy;
use crate::runtime::assets::{BundledAssets, RuntimeLayout};
use crate::runtime::{ModelListing, ProvisionError, DELETE_PATH, EMBEDDINGS_PATH, TAGS_PATH};

#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("Cannot embed empty text")]
    EmptyInput,
    #[error("Embedding request timed out after {secs}s")]
    Timeout { secs: u64 },
    #[error("Runtime returned HTTP {status}: {body}")]
    Upstream { status: u16, body: String },
    #[error("Runtime request failed: {0}")]
    Transport(String),
    #[error("Invalid embedding response: {0}")]
    InvalidResponse(String),
    #[error("Model provisioning failed: {0}")]
    Provisioning(String),
}

impl EmbeddingError {
    /// Timeouts, upstream failures and transport errors are worth another attempt
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::Upstream { .. } | Self::Transport(_)
        )
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::EmptyInput => ErrorCategory::Validation,
            Self::Timeout { .. } => ErrorCategory::Timeout,
            Self::Upstream { .. } | Self::Transport(_) | Self::InvalidResponse(_) => {
                ErrorCategory::Upstream
            }
            Self::Provisioning(_) => ErrorCategory::Provisioning,
        }
    }
}

/// Anything that turns text into vectors
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Model id requests are issued against
    fn model(&self) -> &str;

    /// Embed a single text. One request, no retry.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;

    /// Make sure `model` is installed in the runtime, provisioning it from the
    /// bundle if needed. `Ok(false)` means the model cannot be made available.
    /// `on_progress` receives a fraction in `0.0..=1.0`.
    async fn ensure_model_available(
        &self,
        model: &str,
        on_progress: &(dyn Fn(f32) + Send + Sync),
    ) -> Result<bool, EmbeddingError>;
}

/// Batch embedding options
#[derive(Debug, Clone)]
pub struct BatchOptions {
    /// Requests in flight; 1 keeps the runtime's accelerator stable
    pub concurrency: usize,
    pub retry: RetryPolicy,
    /// Pause between sequential requests
    pub inter_call_delay: Duration,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            concurrency: 1,
            retry: RetryPolicy::exponential(3, Duration::from_secs(1)),
            inter_call_delay: Duration::from_secs(1),
        }
    }
}

impl BatchOptions {
    pub fn from_config(config: &RagConfig) -> Self {
        Self {
            concurrency: config.embedding.concurrency.max(1),
            retry: config.embedding.retry.clone(),
            inter_call_delay: Duration::from_millis(config.embedding.inter_call_delay_ms),
        }
    }
}

/// Per-item batch progress
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BatchProgress {
    pub processed: usize,
    pub total: usize,
    pub percent: f32,
}

impl BatchProgress {
    fn new(processed: usize, total: usize) -> Self {
        let percent = if total == 0 {
            100.0
        } else {
            processed as f32 * 100.0 / total as f32
        };
        Self {
            processed,
            total,
            percent,
        }
    }
}

/// Embed a single text, retrying transient failures per `policy`
pub async fn embed_with_retry(
    embedder: &dyn Embedder,
    text: &str,
    policy: &RetryPolicy,
) -> Result<Vec<f32>, EmbeddingError> {
    policy
        .run(|_| embedder.embed(text), EmbeddingError::is_retryable)
        .await
}

/// Embed texts in order. Sequential by default with a fixed pause between
/// calls; with `concurrency > 1` requests overlap but results keep input order.
pub async fn embed_batch<P>(
    embedder: &dyn Embedder,
    texts: &[String],
    options: &BatchOptions,
    on_progress: P,
) -> Result<Vec<Vec<f32>>, EmbeddingError>
where
    P: Fn(BatchProgress) + Send,
{
    let total = texts.len();
    let mut vectors = Vec::with_capacity(total);

    if options.concurrency <= 1 {
        for (i, text) in texts.iter().enumerate() {
            if i > 0 && !options.inter_call_delay.is_zero() {
                tokio::time::sleep(options.inter_call_delay).await;
            }
            vectors.push(embed_with_retry(embedder, text, &options.retry).await?);
            on_progress(BatchProgress::new(i + 1, total));
        }
        return Ok(vectors);
    }

    let mut results = futures::stream::iter(texts.iter())
        .map(|text| embed_with_retry(embedder, text, &options.retry))
        .buffered(options.concurrency)
        .boxed();
    while let Some(result) = results.next().await {
        vectors.push(result?);
        on_progress(BatchProgress::new(vectors.len(), total));
    }
    Ok(vectors)
}

/// Whether `wanted` is in the installed list, allowing the implicit `:latest` tag
pub fn model_matches(installed: &[String], wanted: &str) -> bool {
    let (wanted_base, wanted_tag) = split_tag(wanted);
    installed.iter().any(|name| {
        if name == wanted {
            return true;
        }
        let (base, tag) = split_tag(name);
        base == wanted_base
            && match (wanted_tag, tag) {
                (None, _) => true,
                (Some("latest"), None) => true,
                _ => false,
            }
    })
}

fn split_tag(name: &str) -> (&str, Option<&str>) {
    match name.rsplit_once(':') {
        Some((base, tag)) => (base, Some(tag)),
        None => (name, None),
    }
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    prompt: &'a str,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    embedding: Option<Vec<serde_json::Value>>,
}

/// HTTP client for the local runtime
pub struct EmbeddingClient {
    base_url: String,
    model: String,
    timeout: Duration,
    http: reqwest::Client,
    assets: BundledAssets,
    models_dir: PathBuf,
    model_poll: RetryPolicy,
}

impl EmbeddingClient {
    pub fn new(config: &RagConfig) -> Result<Self, EmbeddingError> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| EmbeddingError::Transport(e.to_string()))?;
        let layout = RuntimeLayout::new(config.runtime_dir());

        Ok(Self {
            base_url: config.runtime.base_url.trim_end_matches('/').to_string(),
            model: config.embedding.model.clone(),
            timeout: Duration::from_secs(config.embedding.request_timeout_secs),
            http,
            assets: BundledAssets::new(config.bundle_dir()),
            models_dir: layout.models_dir(),
            model_poll: config.embedding.model_poll.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn map_send_error(&self, e: reqwest::Error) -> EmbeddingError {
        if e.is_timeout() {
            EmbeddingError::Timeout {
                secs: self.timeout.as_secs(),
            }
        } else {
            EmbeddingError::Transport(e.to_string())
        }
    }

    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, EmbeddingError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(EmbeddingError::Upstream {
            status: status.as_u16(),
            body,
        })
    }

    /// Names of the models installed in the runtime
    pub async fn list_models(&self) -> Result<Vec<String>, EmbeddingError> {
        let response = self
            .http
            .get(self.url(TAGS_PATH))
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;
        let listing: ModelListing = Self::check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| EmbeddingError::InvalidResponse(e.to_string()))?;
        Ok(listing.models.into_iter().map(|m| m.name).collect())
    }

    /// Remove a model from the runtime
    pub async fn delete_model(&self, name: &str) -> Result<(), EmbeddingError> {
        if name.trim().is_empty() {
            return Err(EmbeddingError::EmptyInput);
        }
        let response = self
            .http
            .delete(self.url(DELETE_PATH))
            .json(&serde_json::json!({ "name": name }))
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;
        Self::check_status(response).await?;
        tracing::info!("Deleted model '{}' from runtime", name);
        Ok(())
    }
}

#[async_trait]
impl Embedder for EmbeddingClient {
    fn model(&self) -> &str {
        &self.model
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        if text.trim().is_empty() {
            return Err(EmbeddingError::EmptyInput);
        }

        let response = self
            .http
            .post(self.url(EMBEDDINGS_PATH))
            .json(&EmbeddingRequest {
                model: &self.model,
                prompt: text,
            })
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;

        let body: EmbeddingResponse = Self::check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| EmbeddingError::InvalidResponse(e.to_string()))?;

        let values = body
            .embedding
            .ok_or_else(|| EmbeddingError::InvalidResponse("missing embedding field".into()))?;
        if values.is_empty() {
            return Err(EmbeddingError::InvalidResponse("empty embedding".into()));
        }

        values
            .iter()
            .enumerate()
            .map(|(i, v)| {
                v.as_f64()
                    .filter(|f| f.is_finite())
                    .map(|f| f as f32)
                    .ok_or_else(|| {
                        EmbeddingError::InvalidResponse(format!("non-numeric value at index {}", i))
                    })
            })
            .collect()
    }

    async fn ensure_model_available(
        &self,
        model: &str,
        on_progress: &(dyn Fn(f32) + Send + Sync),
    ) -> Result<bool, EmbeddingError> {
        on_progress(0.0);
        let installed = self.list_models().await?;
        if model_matches(&installed, model) {
            on_progress(1.0);
            return Ok(true);
        }

        if self.assets.model_dir(model).is_none() {
            tracing::warn!("Model '{}' is not installed and not bundled", model);
            return Ok(false);
        }

        match self.assets.install_model(model, &self.models_dir) {
            Ok(_) => {}
            Err(ProvisionError::MissingAsset(path)) => {
                tracing::warn!("Bundled model '{}' is incomplete: {:?} missing", model, path);
                return Ok(false);
            }
            Err(e) => return Err(EmbeddingError::Provisioning(e.to_string())),
        }
        on_progress(0.5);

        let attempts = self.model_poll.attempts();
        let recognized = self
            .model_poll
            .poll(|attempt| async move {
                on_progress(0.5 + 0.5 * (attempt + 1) as f32 / attempts as f32);
                match self.list_models().await {
                    Ok(names) => model_matches(&names, model),
                    Err(e) => {
                        tracing::debug!("Model listing failed while waiting for '{}': {}", model, e);
                        false
                    }
                }
            })
            .await;

        if recognized {
            on_progress(1.0);
            tracing::info!("Model '{}' provisioned from bundle", model);
        } else {
            tracing::warn!("Runtime never recognized provisioned model '{}'", model);
        }
        Ok(recognized)
    }
}
