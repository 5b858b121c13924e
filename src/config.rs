//! Configuration for LocalRAG
//! YAML file + environment overrides, with defaults matching the bundled runtime

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::retry::RetryPolicy;

/// Application data directory name under the platform data dir
pub const APP_DIR_NAME: &str = "LocalRAG";

/// Default local runtime endpoint
pub const DEFAULT_RUNTIME_URL: &str = "http://127.0.0.1:11434";

const DEFAULT_BIND_HOST: &str = "127.0.0.1";
const DEFAULT_RUNTIME_PORT: u16 = 11434;

/// Default embedding model and its vector width
pub const DEFAULT_EMBEDDING_MODEL: &str = "nomic-embed-text";
pub const DEFAULT_EMBEDDING_DIM: usize = 768;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid config file: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid config value: {0}")]
    Invalid(String),
}

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RagConfig {
    pub data_dir: PathBuf,
    pub runtime: RuntimeConfig,
    pub embedding: EmbeddingConfig,
    pub chunking: ChunkingConfig,
    pub ingest: IngestConfig,
    pub search: SearchConfig,
}

/// Local inference runtime settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub base_url: String,
    pub probe_timeout_ms: u64,
    /// Host:port the self-managed runtime binds to. Follows `base_url` when unset.
    pub bind_host: Option<String>,
    /// Read-only directory holding the bundled executable and model blobs.
    /// Defaults to `<data_dir>/bundle`.
    pub bundle_dir: Option<PathBuf>,
    pub ready_poll: RetryPolicy,
}

/// Embedding client settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub model: String,
    pub dimension: usize,
    pub request_timeout_secs: u64,
    pub retry: RetryPolicy,
    /// Pause between consecutive chunk embeddings
    pub inter_call_delay_ms: u64,
    /// Concurrent requests in a batch; 1 keeps the accelerator stable
    pub concurrency: usize,
    pub model_poll: RetryPolicy,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    pub max_size: usize,
    pub overlap: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    pub max_file_bytes: u64,
    pub allowed_extensions: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub default_limit: usize,
    pub max_context_chars: usize,
}

impl Default for RagConfig {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .map(|d| d.join(APP_DIR_NAME))
            .unwrap_or_else(|| PathBuf::from(".localrag"));
        Self {
            data_dir,
            runtime: RuntimeConfig::default(),
            embedding: EmbeddingConfig::default(),
            chunking: ChunkingConfig::default(),
            ingest: IngestConfig::default(),
            search: SearchConfig::default(),
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_RUNTIME_URL.to_string(),
            probe_timeout_ms: 2_000,
            bind_host: None,
            bundle_dir: None,
            ready_poll: RetryPolicy::fixed(30, Duration::from_millis(500)),
        }
    }
}

impl RuntimeConfig {
    /// Address handed to a self-managed runtime, so it listens where
    /// `base_url` points
    pub fn bind_address(&self) -> String {
        if let Some(host) = self.bind_host.as_ref().filter(|h| !h.trim().is_empty()) {
            return host.clone();
        }
        match url::Url::parse(&self.base_url) {
            Ok(url) => {
                let host = url.host_str().unwrap_or(DEFAULT_BIND_HOST);
                match url.port_or_known_default() {
                    Some(port) => format!("{}:{}", host, port),
                    None => host.to_string(),
                }
            }
            Err(_) => format!("{}:{}", DEFAULT_BIND_HOST, DEFAULT_RUNTIME_PORT),
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_EMBEDDING_MODEL.to_string(),
            dimension: DEFAULT_EMBEDDING_DIM,
            request_timeout_secs: 60,
            retry: RetryPolicy::exponential(3, Duration::from_secs(1)),
            inter_call_delay_ms: 1_000,
            concurrency: 1,
            model_poll: RetryPolicy::fixed(10, Duration::from_secs(1)),
        }
    }
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_size: 1000,
            overlap: 200,
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_file_bytes: 50 * 1024 * 1024,
            allowed_extensions: ["txt", "text", "md", "markdown", "log", "csv", "json"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            default_limit: 5,
            max_context_chars: 8_000,
        }
    }
}

impl RagConfig {
    /// Load config from an optional YAML file, then apply environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) if p.exists() => {
                let raw = std::fs::read_to_string(p)?;
                serde_yaml::from_str::<RagConfig>(&raw)?
            }
            Some(p) => {
                tracing::warn!("Config file {:?} not found, using defaults", p);
                RagConfig::default()
            }
            None => RagConfig::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Apply `LOCALRAG_*` overrides from the given lookup
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup("LOCALRAG_DATA_DIR").filter(|v| !v.trim().is_empty()) {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(url) = lookup("LOCALRAG_RUNTIME_URL").filter(|v| !v.trim().is_empty()) {
            self.runtime.base_url = url;
        }
        if let Some(dir) = lookup("LOCALRAG_BUNDLE_DIR").filter(|v| !v.trim().is_empty()) {
            self.runtime.bundle_dir = Some(PathBuf::from(dir));
        }
        if let Some(model) = lookup("LOCALRAG_EMBED_MODEL").filter(|v| !v.trim().is_empty()) {
            self.embedding.model = model;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.embedding.dimension == 0 {
            return Err(ConfigError::Invalid("embedding.dimension must be > 0".into()));
        }
        if self.embedding.model.trim().is_empty() {
            return Err(ConfigError::Invalid("embedding.model cannot be empty".into()));
        }
        if self.chunking.max_size == 0 {
            return Err(ConfigError::Invalid("chunking.max_size must be > 0".into()));
        }
        let parsed = url::Url::parse(&self.runtime.base_url)
            .map_err(|e| ConfigError::Invalid(format!("runtime.base_url: {}", e)))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(ConfigError::Invalid(format!(
                "runtime.base_url must be http(s), got {}",
                parsed.scheme()
            )));
        }
        Ok(())
    }

    /// Directory holding LanceDB collections
    pub fn vectors_dir(&self) -> PathBuf {
        self.data_dir.join("vectors")
    }

    /// Directory holding persisted uploaded files
    pub fn files_dir(&self) -> PathBuf {
        self.data_dir.join("files")
    }

    /// Bundled asset directory, following `data_dir` unless set explicitly
    pub fn bundle_dir(&self) -> PathBuf {
        self.runtime
            .bundle_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("bundle"))
    }

    /// Writable root for the self-managed runtime
    pub fn runtime_dir(&self) -> PathBuf {
        self.data_dir.join("runtime")
    }
}
