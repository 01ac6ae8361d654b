//! Configuration system for Verdict.
//!
//! Uses `figment` for layered configuration: defaults -> config file -> environment -> overrides.
//! Configuration is loaded from `~/.config/verdict/config.toml` and/or `.verdict/config.toml`
//! in the workspace directory.

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration for the research engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    pub storage: StorageConfig,
    pub search: SearchConfig,
    pub discovery: DiscoveryConfig,
    pub inference: InferenceConfig,
    pub queue: QueueConfig,
    pub synthesis: SynthesisConfig,
    /// Optional SMTP notification settings. Notifications are only logged when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notifications: Option<NotificationConfig>,
}

/// Where plans, chunk checkpoints and the task queue are persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root directory for the JSON blob store. Defaults to the platform data dir.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
    /// Number of task-queue backups to retain.
    pub max_backups: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            max_backups: 10,
        }
    }
}

impl StorageConfig {
    /// Resolve the data directory, falling back to the platform data dir.
    pub fn resolve_data_dir(&self, workspace: &Path) -> PathBuf {
        if let Some(ref dir) = self.data_dir {
            return dir.clone();
        }
        directories::ProjectDirs::from("dev", "verdict", "verdict")
            .map(|d| d.data_dir().to_path_buf())
            .unwrap_or_else(|| workspace.join(".verdict").join("data"))
    }
}

/// Case record store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Path to the SQLite database holding the `cases` table.
    pub database_path: PathBuf,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("cases.db"),
        }
    }
}

/// Candidate discovery and chunking settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Below this many candidates the primary strategy is auto-expanded.
    pub min_results_threshold: usize,
    /// Number of case ids per chunk.
    pub chunk_size: usize,
    /// Per-strategy cap on the id list query.
    pub max_candidates: usize,
    /// Hard cap for the keyword fallback strategy.
    pub fallback_cap: usize,
    /// Number of ids fetched for the post-planning verification preview.
    pub preview_size: usize,
    /// Minimum trigram similarity for the embedding-similarity strategy.
    pub similarity_threshold: f64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            min_results_threshold: 5,
            chunk_size: 50,
            max_candidates: 500,
            fallback_cap: 100,
            preview_size: 3,
            similarity_threshold: 0.3,
        }
    }
}

/// Settings for the generative-text service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceConfig {
    /// Base URL of an OpenAI-compatible chat completions endpoint.
    pub base_url: String,
    /// Model identifier.
    pub model: String,
    /// Environment variable name containing the API key.
    pub api_key_env: String,
    /// Default per-call timeout in seconds.
    pub call_timeout_secs: u64,
    /// Timeout for the (larger) synthesis calls, in seconds.
    pub synthesis_timeout_secs: u64,
    /// Attempts allowed when asking for a discovery strategy.
    pub planning_attempts: u32,
    /// Character budget for a serialized chunk prompt.
    pub chunk_payload_chars: usize,
    /// Characters reserved for the prompt template around the payload.
    pub prompt_headroom_chars: usize,
    /// Prefix length compared by echo detection.
    pub echo_prefix_chars: usize,
    /// Sampling temperature.
    pub temperature: f32,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            call_timeout_secs: 300,
            synthesis_timeout_secs: 900,
            planning_attempts: 3,
            chunk_payload_chars: 60_000,
            prompt_headroom_chars: 4_000,
            echo_prefix_chars: 200,
            temperature: 0.2,
        }
    }
}

impl InferenceConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn synthesis_timeout(&self) -> Duration {
        Duration::from_secs(self.synthesis_timeout_secs)
    }

    /// Characters left for the serialized chunk rows.
    pub fn payload_budget(&self) -> usize {
        self.chunk_payload_chars
            .saturating_sub(self.prompt_headroom_chars)
    }
}

/// Serialization queue settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Maximum number of waiting jobs before submissions are rejected.
    pub max_backlog: usize,
    /// Per-job timeout in seconds.
    pub job_timeout_secs: u64,
    /// Finished job records retained for polling.
    pub retained_records: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_backlog: 50,
            job_timeout_secs: 4 * 60 * 60,
            retained_records: 256,
        }
    }
}

impl QueueConfig {
    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }
}

/// Cooldown applied before a repeated synthesis attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CooldownPolicy {
    /// No pause between attempts.
    None,
    /// A fixed pause before every retry.
    Fixed { secs: u64 },
}

impl CooldownPolicy {
    /// Delay to wait before the given (1-based) attempt.
    pub fn delay_before(&self, attempt: u32) -> Duration {
        match self {
            CooldownPolicy::None => Duration::ZERO,
            CooldownPolicy::Fixed { secs } if attempt > 1 => Duration::from_secs(*secs),
            CooldownPolicy::Fixed { .. } => Duration::ZERO,
        }
    }
}

/// Final report synthesis settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynthesisConfig {
    /// Attempts before falling back to the deterministic report.
    pub max_retries: u32,
    /// Pause policy between attempts.
    pub cooldown: CooldownPolicy,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            cooldown: CooldownPolicy::Fixed { secs: 30 },
        }
    }
}

/// SMTP relay settings for completion/error mails.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationConfig {
    pub smtp_host: String,
    pub smtp_port: u16,
    pub username: String,
    /// Environment variable name containing the SMTP password.
    pub password_env: String,
    pub from_address: String,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            smtp_host: "smtp.gmail.com".to_string(),
            smtp_port: 587,
            username: String::new(),
            password_env: "VERDICT_SMTP_PASSWORD".to_string(),
            from_address: String::new(),
        }
    }
}

/// Load configuration from layered sources.
///
/// Priority (highest to lowest):
/// 1. Explicit overrides (passed as argument)
/// 2. Environment variables (prefixed with `VERDICT_`)
/// 3. Workspace-local config (`.verdict/config.toml`)
/// 4. User config (`~/.config/verdict/config.toml`)
/// 5. Built-in defaults
pub fn load_config(
    workspace: Option<&Path>,
    overrides: Option<&EngineConfig>,
) -> Result<EngineConfig, Box<figment::Error>> {
    let mut figment = Figment::from(Serialized::defaults(EngineConfig::default()));

    if let Some(config_dir) = directories::ProjectDirs::from("dev", "verdict", "verdict") {
        let user_config = config_dir.config_dir().join("config.toml");
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    if let Some(ws) = workspace {
        let ws_config = ws.join(".verdict").join("config.toml");
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    // VERDICT_DISCOVERY__CHUNK_SIZE, VERDICT_INFERENCE__MODEL, etc.
    figment = figment.merge(Env::prefixed("VERDICT_").split("__"));

    if let Some(overrides) = overrides {
        figment = figment.merge(Serialized::defaults(overrides));
    }

    figment.extract().map_err(Box::new)
}
