use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

const CONFIG_FILE: &str = "config.toml";

/// Engine configuration from `<state-dir>/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Context window assumed when evaluating usage thresholds.
    #[serde(default = "default_max_context_tokens")]
    pub max_context_tokens: u64,
    /// Usage ratio that requests compaction once the cooldown allows.
    #[serde(default = "default_auto_threshold")]
    pub auto_compact_threshold: f64,
    /// Usage ratio past which the next send waits for compaction.
    #[serde(default = "default_force_threshold")]
    pub force_compact_threshold: f64,
    /// Minimum interval between compaction rounds, in seconds.
    #[serde(default = "default_compaction_cooldown_secs")]
    pub compaction_cooldown_secs: u64,
    /// Automatic compaction attempts per session before degrading.
    #[serde(default = "default_max_compaction_attempts")]
    pub max_compaction_attempts: u32,
    /// A streaming round is stalled after this long with no output, in seconds.
    #[serde(default = "default_stall_window_secs")]
    pub stall_window_secs: u64,
    /// Hard cap on a single round's duration, in seconds.
    #[serde(default = "default_round_timeout_secs")]
    pub round_timeout_secs: u64,
    /// Explicit agent executable; skips discovery when set.
    #[serde(default)]
    pub agent_executable: Option<PathBuf>,
    /// Model passed through to the agent.
    #[serde(default)]
    pub model: Option<String>,
    /// Appended to the agent's system prompt on every round.
    #[serde(default)]
    pub append_system_prompt: Option<String>,
    /// Working directory for sessions created without one; defaults to
    /// the engine's own working directory.
    #[serde(default)]
    pub default_working_directory: Option<PathBuf>,
}

fn default_max_context_tokens() -> u64 {
    200_000
}

fn default_auto_threshold() -> f64 {
    0.96
}

fn default_force_threshold() -> f64 {
    0.98
}

fn default_compaction_cooldown_secs() -> u64 {
    300
}

fn default_max_compaction_attempts() -> u32 {
    2
}

fn default_stall_window_secs() -> u64 {
    300
}

fn default_round_timeout_secs() -> u64 {
    600
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_context_tokens: default_max_context_tokens(),
            auto_compact_threshold: default_auto_threshold(),
            force_compact_threshold: default_force_threshold(),
            compaction_cooldown_secs: default_compaction_cooldown_secs(),
            max_compaction_attempts: default_max_compaction_attempts(),
            stall_window_secs: default_stall_window_secs(),
            round_timeout_secs: default_round_timeout_secs(),
            agent_executable: None,
            model: None,
            append_system_prompt: None,
            default_working_directory: None,
        }
    }
}

impl EngineConfig {
    pub fn compaction_cooldown(&self) -> Duration {
        Duration::from_secs(self.compaction_cooldown_secs)
    }

    pub fn stall_window(&self) -> Duration {
        Duration::from_secs(self.stall_window_secs)
    }

    pub fn round_timeout(&self) -> Duration {
        Duration::from_secs(self.round_timeout_secs)
    }
}

/// Load configuration from `config.toml` under `state_dir`.
///
/// Falls back to defaults if the file is missing.
pub fn load(state_dir: &Path) -> Result<EngineConfig> {
    let path = state_dir.join(CONFIG_FILE);
    if !path.exists() {
        return Ok(EngineConfig::default());
    }
    let contents = std::fs::read_to_string(&path)?;
    let config: EngineConfig = toml::from_str(&contents)?;
    Ok(config)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let config = load(dir.path()).unwrap();
        assert_eq!(config.max_context_tokens, 200_000);
        assert!(config.agent_executable.is_none());
    }

    #[test]
    fn partial_file_fills_remaining_defaults() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE),
            "max_context_tokens = 1000\nmodel = \"sonnet\"\n",
        )
        .unwrap();
        let config = load(dir.path()).unwrap();
        assert_eq!(config.max_context_tokens, 1000);
        assert_eq!(config.model.as_deref(), Some("sonnet"));
        assert!((config.auto_compact_threshold - 0.96).abs() < f64::EPSILON);
        assert_eq!(config.compaction_cooldown_secs, 300);
    }
}
