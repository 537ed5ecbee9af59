use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, TrellisError};

/// Top-level Trellis configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    #[serde(default)]
    pub reflect: ReflectConfig,
}

/// Scheduler budgets and defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Whole-run wall-clock ceiling.
    #[serde(default = "default_max_duration")]
    pub max_duration_secs: u64,
    /// Default iteration ceiling for agent nodes.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// Scheduler steps per run before the run is forced toward END.
    #[serde(default = "default_max_steps")]
    pub max_steps: u32,
    /// Concurrent branches per fan-out.
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    /// Timeout for capabilities that do not declare their own.
    #[serde(default = "default_invocation_timeout")]
    pub invocation_timeout_secs: u64,
    /// Permissions granted to runs that do not supply their own.
    #[serde(default)]
    pub default_permissions: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_duration_secs: default_max_duration(),
            max_iterations: default_max_iterations(),
            max_steps: default_max_steps(),
            max_parallel: default_max_parallel(),
            invocation_timeout_secs: default_invocation_timeout(),
            default_permissions: vec![],
        }
    }
}

fn default_max_duration() -> u64 { 300 }
fn default_max_iterations() -> u32 { 10 }
fn default_max_steps() -> u32 { 100 }
fn default_max_parallel() -> usize { 5 }
fn default_invocation_timeout() -> u64 { 30 }

/// Checkpoint backend selection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointBackend {
    #[default]
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    #[serde(default)]
    pub backend: CheckpointBackend,
    /// SQLite database path (supports `~/`). Ignored by the memory backend.
    #[serde(default = "default_checkpoint_path")]
    pub path: String,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            backend: CheckpointBackend::default(),
            path: default_checkpoint_path(),
        }
    }
}

fn default_checkpoint_path() -> String { "~/.trellis/checkpoints.db".to_string() }

impl CheckpointConfig {
    /// Resolve the database path (expand ~).
    pub fn resolved_path(&self) -> PathBuf {
        if let Some(rest) = self.path.strip_prefix("~/") {
            if let Some(home) = home_dir() {
                return home.join(rest);
            }
        }
        PathBuf::from(&self.path)
    }
}

/// Completion detection for the agent reflect phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReflectConfig {
    #[serde(default = "default_completion_phrases")]
    pub completion_phrases: Vec<String>,
}

impl Default for ReflectConfig {
    fn default() -> Self {
        Self {
            completion_phrases: default_completion_phrases(),
        }
    }
}

fn default_completion_phrases() -> Vec<String> {
    ["task is complete", "finished", "accomplished", "done"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| TrellisError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        toml::from_str(&expanded).map_err(|e| TrellisError::Config(e.to_string()))
    }
}

/// Substitute `${NAME}` with the value of environment variable `NAME`.
/// Unset variables and an unterminated `${` are left as written.
fn expand_env_vars(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(open) = rest.find("${") {
        out.push_str(&rest[..open]);
        let after = &rest[open + 2..];
        let Some(close) = after.find('}') else {
            rest = &rest[open..];
            break;
        };
        let name = &after[..close];
        let value = if name.is_empty() || name.contains(['=', '\0']) {
            None
        } else {
            std::env::var(name).ok()
        };
        match value {
            Some(value) => out.push_str(&value),
            None => out.push_str(&rest[open..open + 2 + close + 1]),
        }
        rest = &after[close + 1..];
    }
    out.push_str(rest);
    out
}

/// The user's home directory, from `$HOME`.
pub fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME")
        .filter(|h| !h.is_empty())
        .map(PathBuf::from)
}
