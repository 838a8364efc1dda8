use crate::events::EventClass;
use anyhow::{Context, Result};
use directories::UserDirs;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

const CONFIG_DIR_NAME: &str = ".native-bridge";
const CONFIG_FILE_NAME: &str = "config.toml";

// ── Top-level config ──────────────────────────────────────────────

/// Bridge configuration, loaded from `config.toml`.
///
/// Resolution order: explicit path → `~/.native-bridge/config.toml` → defaults.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct BridgeConfig {
    /// Directory the config was loaded from; base for relative paths. Not serialized.
    #[serde(skip)]
    pub config_dir: PathBuf,

    /// Default per-call response timeout in milliseconds. Default: `10000`.
    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: u64,

    /// Per-subscriber buffer of the broadcast stream. Slow subscribers that
    /// fall further behind skip the oldest events. Default: `256`.
    #[serde(default = "default_broadcast_capacity")]
    pub broadcast_capacity: usize,

    /// Interval of the expiry sweep for abandoned calls, in milliseconds.
    /// `0` disables the sweep. Default: `1000`.
    #[serde(default = "default_reap_interval_ms")]
    pub reap_interval_ms: u64,

    /// Operation keys of progress events. These never consume a pending call.
    #[serde(default = "default_progress_operations")]
    pub progress_operations: Vec<String>,

    /// Operation keys of task completion events. These never consume a pending call.
    #[serde(default = "default_completion_operations")]
    pub completion_operations: Vec<String>,

    /// Operation key of the correlated "stop task" call. Default: `"stop_task"`.
    #[serde(default = "default_stop_task_operation")]
    pub stop_task_operation: String,

    /// Payload field carrying the task identifier in task events. Default: `"task_id"`.
    #[serde(default = "default_task_id_field")]
    pub task_id_field: String,

    /// Dispatch trace persistence (`[trace]`).
    #[serde(default)]
    pub trace: TraceConfig,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            config_dir: PathBuf::new(),
            response_timeout_ms: default_response_timeout_ms(),
            broadcast_capacity: default_broadcast_capacity(),
            reap_interval_ms: default_reap_interval_ms(),
            progress_operations: default_progress_operations(),
            completion_operations: default_completion_operations(),
            stop_task_operation: default_stop_task_operation(),
            task_id_field: default_task_id_field(),
            trace: TraceConfig::default(),
        }
    }
}

fn default_response_timeout_ms() -> u64 {
    10_000
}

fn default_broadcast_capacity() -> usize {
    256
}

fn default_reap_interval_ms() -> u64 {
    1_000
}

fn default_progress_operations() -> Vec<String> {
    vec!["upload_progress".into(), "download_progress".into()]
}

fn default_completion_operations() -> Vec<String> {
    vec!["upload_complete".into(), "download_complete".into()]
}

fn default_stop_task_operation() -> String {
    "stop_task".into()
}

fn default_task_id_field() -> String {
    "task_id".into()
}

// ── Trace ─────────────────────────────────────────────────────────

/// Dispatch trace configuration (`[trace]` section).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct TraceConfig {
    /// Trace storage mode: "none" | "rolling" | "full".
    #[serde(default = "default_trace_mode")]
    pub mode: String,

    /// Trace file path. Relative paths are resolved under the config directory.
    #[serde(default = "default_trace_path")]
    pub path: String,

    /// Maximum entries retained when mode = "rolling".
    #[serde(default = "default_trace_max_entries")]
    pub max_entries: usize,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            mode: default_trace_mode(),
            path: default_trace_path(),
            max_entries: default_trace_max_entries(),
        }
    }
}

fn default_trace_mode() -> String {
    "none".to_string()
}

fn default_trace_path() -> String {
    "state/dispatch-trace.jsonl".to_string()
}

fn default_trace_max_entries() -> usize {
    200
}

// ── Loading ───────────────────────────────────────────────────────

/// Default config directory: `~/.native-bridge`.
pub fn default_config_dir() -> Result<PathBuf> {
    let home = UserDirs::new()
        .map(|u| u.home_dir().to_path_buf())
        .context("Could not find home directory")?;
    Ok(home.join(CONFIG_DIR_NAME))
}

impl BridgeConfig {
    /// Load from `path`, falling back to defaults when the file does not exist.
    /// Env overrides are applied and the result validated.
    pub async fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let contents = fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            let config: BridgeConfig = toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config file {}", path.display()))?;
            tracing::info!(path = %path.display(), "Config loaded");
            config
        } else {
            tracing::debug!(path = %path.display(), "Config file absent; using defaults");
            BridgeConfig::default()
        };
        config.config_dir = path.parent().map(Path::to_path_buf).unwrap_or_default();

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load from `~/.native-bridge/config.toml`.
    pub async fn load_default() -> Result<Self> {
        let path = default_config_dir()?.join(CONFIG_FILE_NAME);
        Self::load(&path).await
    }

    /// Apply `NATIVE_BRIDGE_*` environment overrides.
    pub fn apply_env_overrides(&mut self) {
        if let Some(timeout) = env_number::<u64>("NATIVE_BRIDGE_RESPONSE_TIMEOUT_MS") {
            self.response_timeout_ms = timeout;
        }
        if let Some(capacity) = env_number::<usize>("NATIVE_BRIDGE_BROADCAST_CAPACITY") {
            self.broadcast_capacity = capacity;
        }
        if let Ok(mode) = std::env::var("NATIVE_BRIDGE_TRACE_MODE") {
            if !mode.trim().is_empty() {
                self.trace.mode = mode.trim().to_string();
            }
        }
    }

    /// Validate configuration values that would cause runtime failures.
    pub fn validate(&self) -> Result<()> {
        if self.response_timeout_ms == 0 {
            anyhow::bail!("response_timeout_ms must be greater than 0");
        }
        if self.broadcast_capacity == 0 {
            anyhow::bail!("broadcast_capacity must be greater than 0");
        }
        if self.task_id_field.trim().is_empty() {
            anyhow::bail!("task_id_field must not be empty");
        }
        if self.stop_task_operation.trim().is_empty() {
            anyhow::bail!("stop_task_operation must not be empty");
        }

        let mut progress = HashSet::new();
        for op in &self.progress_operations {
            if op.trim().is_empty() {
                anyhow::bail!("progress_operations must not contain empty names");
            }
            progress.insert(op.as_str());
        }
        for op in &self.completion_operations {
            if op.trim().is_empty() {
                anyhow::bail!("completion_operations must not contain empty names");
            }
            if progress.contains(op.as_str()) {
                anyhow::bail!(
                    "operation '{op}' is listed in both progress_operations and completion_operations"
                );
            }
        }
        if self.is_out_of_band(&self.stop_task_operation) {
            anyhow::bail!(
                "stop_task_operation '{}' must not be a progress or completion operation",
                self.stop_task_operation
            );
        }

        Ok(())
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    /// `None` when the sweep is disabled.
    pub fn reap_interval(&self) -> Option<Duration> {
        (self.reap_interval_ms > 0).then(|| Duration::from_millis(self.reap_interval_ms))
    }

    /// Out-of-band classification of an operation key, if it has one.
    pub fn classify(&self, operation: &str) -> Option<EventClass> {
        if self.progress_operations.iter().any(|op| op == operation) {
            Some(EventClass::Progress)
        } else if self.completion_operations.iter().any(|op| op == operation) {
            Some(EventClass::Completion)
        } else {
            None
        }
    }

    /// Progress and completion keys bypass correlation entirely.
    pub fn is_out_of_band(&self, operation: &str) -> bool {
        self.classify(operation).is_some()
    }
}

fn env_number<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    match trimmed.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(var = name, value = %trimmed, "Ignoring unparsable env override");
            None
        }
    }
}
