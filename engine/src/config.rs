use serde::Deserialize;
use std::{env, path::Path, path::PathBuf, time::Duration};

use keel_context::{ModelLimits, ModelRegistry, PruningConfig};
use keel_types::ModelRef;
use thiserror::Error;

const CONFIG_ENV: &str = "KEEL_CONFIG";

pub(crate) const fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct KeelConfig {
    pub storage: Option<StorageConfig>,
    pub compaction: Option<CompactionConfig>,
    pub pruning: Option<PruningSettings>,
    pub continuation: Option<ContinuationConfig>,
    pub self_loop: Option<SelfLoopConfig>,
    pub recovery: Option<RecoveryConfig>,
    /// Context window overrides for models the built-in table gets wrong.
    #[serde(default)]
    pub model_limits: Vec<ModelLimitOverride>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config at {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config at {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

impl ConfigError {
    #[must_use]
    pub fn path(&self) -> &PathBuf {
        match self {
            ConfigError::Read { path, .. } | ConfigError::Parse { path, .. } => path,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageConfig {
    /// Root of the host's transcript storage.
    pub root: Option<PathBuf>,
    /// Where the bounded-loop state file lives.
    pub loop_state_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CompactionConfig {
    pub enabled: bool,
    pub debounce_ms: u64,
    /// Try truncating tool outputs before summarizing.
    pub truncation: bool,
    /// Usage target after truncation, as a fraction of the context window.
    pub target_ratio: f64,
    /// Tool outputs truncated per session before truncation gives up.
    pub max_truncation_attempts: usize,
    pub min_output_chars: usize,
    pub max_summarize_attempts: u32,
    pub initial_backoff_ms: u64,
    pub backoff_factor: f64,
    pub max_backoff_ms: u64,
    /// Commit a pruning pass and truncate what it marks before compacting.
    pub prune_first: bool,
    /// Models tried in order once summarizing with the session model fails.
    pub fallback_models: Vec<FallbackModel>,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            debounce_ms: 300,
            truncation: true,
            target_ratio: 0.5,
            max_truncation_attempts: 20,
            min_output_chars: 500,
            max_summarize_attempts: 2,
            initial_backoff_ms: 2_000,
            backoff_factor: 2.0,
            max_backoff_ms: 30_000,
            prune_first: false,
            fallback_models: Vec::new(),
        }
    }
}

impl CompactionConfig {
    #[must_use]
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    /// Delay before summarize attempt `attempt + 1` (`attempt` is 0-based).
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        #[allow(clippy::cast_precision_loss)]
        let base = self.initial_backoff_ms as f64 * self.backoff_factor.max(1.0).powi(exponent);
        #[allow(clippy::cast_precision_loss)]
        let capped = base.min(self.max_backoff_ms as f64);
        Duration::from_secs_f64(capped / 1000.0)
    }

    #[must_use]
    pub fn fallback_chain(&self) -> Vec<ModelRef> {
        self.fallback_models
            .iter()
            .map(|model| ModelRef::new(&model.provider, &model.model))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FallbackModel {
    pub provider: String,
    pub model: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PruningSettings {
    pub enabled: bool,
    /// Replaces the built-in protected tool list when set.
    pub protected_tools: Option<Vec<String>>,
    pub protected_turns: u32,
    pub deduplicate: bool,
    pub purge_errors: bool,
    pub purge_error_turns: u32,
    pub supersede_writes: bool,
}

impl Default for PruningSettings {
    fn default() -> Self {
        let defaults = PruningConfig::default();
        Self {
            enabled: true,
            protected_tools: None,
            protected_turns: defaults.protected_turns,
            deduplicate: defaults.deduplicate,
            purge_errors: defaults.purge_errors,
            purge_error_turns: defaults.purge_error_turns,
            supersede_writes: defaults.supersede_writes,
        }
    }
}

impl PruningSettings {
    #[must_use]
    pub fn to_pruning_config(&self) -> PruningConfig {
        let mut config = PruningConfig {
            protected_turns: self.protected_turns,
            deduplicate: self.deduplicate,
            purge_errors: self.purge_errors,
            purge_error_turns: self.purge_error_turns,
            supersede_writes: self.supersede_writes,
            ..PruningConfig::default()
        };
        if let Some(tools) = &self.protected_tools {
            config.protected_tools = tools.iter().cloned().collect();
        }
        config
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ContinuationConfig {
    pub enabled: bool,
    pub countdown_ms: u64,
    /// User messages arriving this soon after a countdown starts do not cancel it.
    pub grace_ms: u64,
    /// Agents that only plan; they are never nudged to keep working.
    pub skip_agents: Vec<String>,
}

impl Default for ContinuationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            countdown_ms: 2_000,
            grace_ms: 500,
            skip_agents: vec!["planner".to_string(), "compaction".to_string()],
        }
    }
}

impl ContinuationConfig {
    #[must_use]
    pub fn countdown(&self) -> Duration {
        Duration::from_millis(self.countdown_ms)
    }

    #[must_use]
    pub fn grace(&self) -> Duration {
        Duration::from_millis(self.grace_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SelfLoopConfig {
    pub enabled: bool,
    pub default_max_iterations: u32,
    pub default_completion_promise: String,
    /// How long an error keeps the loop from continuing.
    pub error_recovery_ms: u64,
}

impl Default for SelfLoopConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_max_iterations: keel_types::DEFAULT_MAX_ITERATIONS,
            default_completion_promise: keel_types::DEFAULT_COMPLETION_PROMISE.to_string(),
            error_recovery_ms: 5_000,
        }
    }
}

impl SelfLoopConfig {
    #[must_use]
    pub fn error_recovery(&self) -> Duration {
        Duration::from_millis(self.error_recovery_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    pub enabled: bool,
    /// Send a resume prompt after a successful thinking-block repair.
    pub auto_resume: bool,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            auto_resume: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ModelLimitOverride {
    pub provider: String,
    pub model: String,
    pub context_window: u32,
    #[serde(default)]
    pub max_output: u32,
}

impl KeelConfig {
    /// Load from `$KEEL_CONFIG` or `~/.keel/config.toml`. A missing file is
    /// `Ok(None)`.
    pub fn load() -> Result<Option<Self>, ConfigError> {
        let Some(path) = config_path() else {
            return Ok(None);
        };
        if !path.exists() {
            return Ok(None);
        }
        Self::load_from(&path).map(Some)
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) => {
                tracing::warn!("Failed to read config at {:?}: {}", path, err);
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: err,
                });
            }
        };

        toml::from_str(&content).map_err(|err| {
            tracing::warn!("Failed to parse config at {:?}: {}", path, err);
            ConfigError::Parse {
                path: path.to_path_buf(),
                source: err,
            }
        })
    }

    #[must_use]
    pub fn path() -> Option<PathBuf> {
        config_path()
    }

    #[must_use]
    pub fn storage_root(&self) -> Option<PathBuf> {
        self.storage
            .as_ref()
            .and_then(|storage| storage.root.clone())
            .or_else(default_storage_root)
    }

    #[must_use]
    pub fn loop_state_file(&self) -> Option<PathBuf> {
        self.storage
            .as_ref()
            .and_then(|storage| storage.loop_state_file.clone())
            .or_else(|| keel_dir().map(|dir| dir.join("loop-state.json")))
    }

    /// Built-in model table plus the configured overrides.
    #[must_use]
    pub fn model_registry(&self) -> ModelRegistry {
        let mut registry = ModelRegistry::new();
        for entry in &self.model_limits {
            registry.set_override(
                &entry.provider,
                &entry.model,
                ModelLimits::new(entry.context_window, entry.max_output),
            );
        }
        registry
    }

    #[must_use]
    pub fn compaction(&self) -> CompactionConfig {
        self.compaction.clone().unwrap_or_default()
    }

    #[must_use]
    pub fn pruning(&self) -> PruningSettings {
        self.pruning.clone().unwrap_or_default()
    }

    #[must_use]
    pub fn continuation(&self) -> ContinuationConfig {
        self.continuation.clone().unwrap_or_default()
    }

    #[must_use]
    pub fn self_loop(&self) -> SelfLoopConfig {
        self.self_loop.clone().unwrap_or_default()
    }

    #[must_use]
    pub fn recovery(&self) -> RecoveryConfig {
        self.recovery.clone().unwrap_or_default()
    }
}

fn keel_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".keel"))
}

fn default_storage_root() -> Option<PathBuf> {
    keel_dir().map(|dir| dir.join("storage"))
}

#[must_use]
pub fn config_path() -> Option<PathBuf> {
    if let Ok(path) = env::var(CONFIG_ENV)
        && !path.trim().is_empty()
    {
        return Some(PathBuf::from(path));
    }
    keel_dir().map(|dir| dir.join("config.toml"))
}
