//! Local inference runtime provisioning for LocalRAG
//! Detects an already-running runtime or materializes and launches the bundled one,
//! remembering which it was so shutdown never touches a process we did not start.

pub mod assets;
pub mod process;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::RagConfig;
use crate::error::ErrorCategory;
use crate::retry::RetryPolicy;
use assets::{BundledAssets, RuntimeLayout};
use process::ProcessControl;

/// Runtime endpoint listing installed models
pub const TAGS_PATH: &str = "/api/tags";
/// Runtime embedding endpoint
pub const EMBEDDINGS_PATH: &str = "/api/embeddings";
/// Runtime model removal endpoint
pub const DELETE_PATH: &str = "/api/delete";

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("Bundled asset missing: {0}")]
    MissingAsset(PathBuf),
    #[error("Failed to start runtime: {0}")]
    Spawn(String),
    #[error("Runtime did not become reachable after {attempts} attempts")]
    NotReachable { attempts: u32 },
    #[error("Process control error: {0}")]
    Process(String),
    #[error("HTTP client error: {0}")]
    Http(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProvisionError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Http(_) => ErrorCategory::Upstream,
            Self::Io(_) => ErrorCategory::Storage,
            _ => ErrorCategory::Provisioning,
        }
    }
}

/// Who owns the runtime process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeSource {
    /// Already running when we looked; never touched
    External,
    /// Launched by us from bundled assets; terminated on shutdown
    SelfManaged,
    Unresolved,
}

impl std::fmt::Display for RuntimeSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::External => write!(f, "external"),
            Self::SelfManaged => write!(f, "self_managed"),
            Self::Unresolved => write!(f, "unresolved"),
        }
    }
}

/// Provenance of the runtime for this process lifetime
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisioningState {
    pub source: RuntimeSource,
    pub base_url: String,
}

/// Entry in the runtime's model listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelTag {
    pub name: String,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub digest: Option<String>,
}

/// `GET /api/tags` response body
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelListing {
    pub models: Vec<ModelTag>,
}

/// What a probe of the runtime endpoint found
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// Responded with a models listing
    Recognized(Vec<String>),
    /// Something answered, but not with a models listing
    Unrecognized,
    Unreachable,
}

/// Detects or provisions the local inference runtime
pub struct RuntimeProvisioner {
    base_url: String,
    bind_host: String,
    probe_timeout: Duration,
    ready_poll: RetryPolicy,
    assets: BundledAssets,
    layout: RuntimeLayout,
    process: Arc<dyn ProcessControl>,
    http: reqwest::Client,
    state: RwLock<ProvisioningState>,
    init_lock: tokio::sync::Mutex<()>,
}

impl RuntimeProvisioner {
    pub fn new(config: &RagConfig, process: Arc<dyn ProcessControl>) -> Result<Self, ProvisionError> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| ProvisionError::Http(e.to_string()))?;
        let base_url = config.runtime.base_url.trim_end_matches('/').to_string();

        Ok(Self {
            state: RwLock::new(ProvisioningState {
                source: RuntimeSource::Unresolved,
                base_url: base_url.clone(),
            }),
            base_url,
            bind_host: config.runtime.bind_address(),
            probe_timeout: Duration::from_millis(config.runtime.probe_timeout_ms),
            ready_poll: config.runtime.ready_poll.clone(),
            assets: BundledAssets::new(config.bundle_dir()),
            layout: RuntimeLayout::new(config.runtime_dir()),
            process,
            http,
            init_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Current provenance
    pub fn state(&self) -> ProvisioningState {
        self.state.read().clone()
    }

    pub fn layout(&self) -> &RuntimeLayout {
        &self.layout
    }

    pub fn assets(&self) -> &BundledAssets {
        &self.assets
    }

    /// Probe the runtime endpoint with the short probe timeout
    pub async fn probe(&self) -> ProbeOutcome {
        let url = format!("{}{}", self.base_url, TAGS_PATH);
        let response = match self.http.get(&url).timeout(self.probe_timeout).send().await {
            Ok(r) => r,
            Err(e) => {
                tracing::debug!("Runtime probe {} unreachable: {}", url, e);
                return ProbeOutcome::Unreachable;
            }
        };

        if !response.status().is_success() {
            return ProbeOutcome::Unrecognized;
        }

        match response.json::<ModelListing>().await {
            Ok(listing) => {
                ProbeOutcome::Recognized(listing.models.into_iter().map(|m| m.name).collect())
            }
            Err(_) => ProbeOutcome::Unrecognized,
        }
    }

    /// Resolve the runtime once per process lifetime.
    ///
    /// An already-running runtime is adopted as `External`. Otherwise bundled
    /// assets are installed, the runtime is launched if none of ours is running,
    /// and readiness is polled before marking it `SelfManaged`.
    pub async fn initialize(&self) -> Result<ProvisioningState, ProvisionError> {
        let _guard = self.init_lock.lock().await;
        {
            let state = self.state.read();
            if state.source != RuntimeSource::Unresolved {
                return Ok(state.clone());
            }
        }

        if let ProbeOutcome::Recognized(models) = self.probe().await {
            tracing::info!(
                "Using external runtime at {} ({} models installed)",
                self.base_url,
                models.len()
            );
            return Ok(self.resolve(RuntimeSource::External));
        }

        let executable = self.assets.install_runtime(&self.layout)?;
        for model in self.assets.bundled_models() {
            self.assets.install_model(&model, &self.layout.models_dir())?;
        }

        let running = self.process.find_by_executable(&executable)?;
        if running.is_empty() {
            let pid = self.process.spawn(&executable, &["serve"], &self.runtime_env())?;
            tracing::info!("Spawned runtime {:?} (pid {})", executable, pid);
        } else {
            tracing::info!("Runtime {:?} already running (pids {:?})", executable, running);
        }

        let ready = self
            .ready_poll
            .poll(|_| async { matches!(self.probe().await, ProbeOutcome::Recognized(_)) })
            .await;
        if !ready {
            return Err(ProvisionError::NotReachable {
                attempts: self.ready_poll.attempts(),
            });
        }

        tracing::info!("Self-managed runtime ready at {}", self.base_url);
        Ok(self.resolve(RuntimeSource::SelfManaged))
    }

    /// Stop the runtime if and only if we launched it
    pub async fn shutdown(&self) -> Result<(), ProvisionError> {
        let state = self.state();
        if state.source != RuntimeSource::SelfManaged {
            tracing::debug!("Runtime source is {}, leaving it running", state.source);
            return Ok(());
        }

        self.terminate_provisioned()?;
        self.resolve(RuntimeSource::Unresolved);
        Ok(())
    }

    /// Terminate processes whose executable is the provisioned binary.
    /// Returns how many were signalled successfully.
    pub fn terminate_provisioned(&self) -> Result<usize, ProvisionError> {
        let executable = self.layout.executable();
        let pids = self.process.find_by_executable(&executable)?;
        let mut terminated = 0;
        for pid in &pids {
            match self.process.terminate(*pid) {
                Ok(()) => {
                    tracing::info!("Terminated runtime pid {}", pid);
                    terminated += 1;
                }
                Err(e) => tracing::warn!("Failed to terminate runtime pid {}: {}", pid, e),
            }
        }
        Ok(terminated)
    }

    /// Environment handed to the self-managed runtime
    pub fn runtime_env(&self) -> Vec<(String, String)> {
        let home = self.layout.home_dir().to_string_lossy().to_string();
        let tmp = self.layout.tmp_dir().to_string_lossy().to_string();
        let mut env = vec![
            ("OLLAMA_HOST".to_string(), self.bind_host.clone()),
            (
                "OLLAMA_MODELS".to_string(),
                self.layout.models_dir().to_string_lossy().to_string(),
            ),
            ("OLLAMA_TMPDIR".to_string(), tmp.clone()),
            ("TMPDIR".to_string(), tmp),
            ("HOME".to_string(), home.clone()),
        ];
        if cfg!(windows) {
            env.push(("USERPROFILE".to_string(), home));
        }
        env
    }

    fn resolve(&self, source: RuntimeSource) -> ProvisioningState {
        let mut state = self.state.write();
        state.source = source;
        state.clone()
    }
}
