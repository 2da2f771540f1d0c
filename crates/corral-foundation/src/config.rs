//! Runner configuration
//!
//! Timeouts, grace periods, and per-tool concurrency limits for agent runs.
//! Loadable from a TOML file; every field has a sensible default so an empty
//! config is valid.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Default inactivity window before a run is declared dead (0 = disabled).
pub const DEFAULT_INACTIVITY_TIMEOUT_MS: u64 = 0;

/// Default grace period before escalating to signals.
pub const DEFAULT_GRACE_PERIOD_MS: u64 = 5_000;

/// Wait after SIGTERM before escalating to SIGKILL.
pub const DEFAULT_SIGTERM_WAIT_MS: u64 = 1_000;

/// Result-file polling interval.
pub const DEFAULT_FILE_POLL_INTERVAL_MS: u64 = 1_000;

/// Default per-tool concurrent run limit.
pub const DEFAULT_AGENT_CONCURRENCY: usize = 2;

/// Default concurrency for auxiliary commands (test runners, linters).
pub const DEFAULT_AUX_CONCURRENCY: usize = 4;

/// Runner configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Inactivity window in milliseconds; 0 disables the watchdog.
    pub inactivity_timeout_ms: u64,

    /// Time given to a process to exit on its own before signaling.
    pub grace_period_ms: u64,

    /// Wait after SIGTERM before escalating to SIGKILL.
    pub sigterm_wait_ms: u64,

    /// Result-file polling interval in milliseconds.
    pub file_poll_interval_ms: u64,

    /// Default concurrent runs per agent tool.
    pub agent_concurrency: usize,

    /// Concurrent auxiliary commands (shared global pool).
    pub aux_concurrency: usize,

    /// Per-tool overrides of `agent_concurrency`.
    pub tool_concurrency: HashMap<String, usize>,

    /// Compute and record termination plans without sending real signals.
    /// Test-only knob.
    pub mock_termination: bool,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            inactivity_timeout_ms: DEFAULT_INACTIVITY_TIMEOUT_MS,
            grace_period_ms: DEFAULT_GRACE_PERIOD_MS,
            sigterm_wait_ms: DEFAULT_SIGTERM_WAIT_MS,
            file_poll_interval_ms: DEFAULT_FILE_POLL_INTERVAL_MS,
            agent_concurrency: DEFAULT_AGENT_CONCURRENCY,
            aux_concurrency: DEFAULT_AUX_CONCURRENCY,
            tool_concurrency: HashMap::new(),
            mock_termination: false,
        }
    }
}

impl RunnerConfig {
    /// Load from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&text)
    }

    /// Parse from a TOML string.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::Config(e.to_string()))
    }

    pub fn with_inactivity_timeout(mut self, timeout: Duration) -> Self {
        self.inactivity_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace_period_ms = grace.as_millis() as u64;
        self
    }

    pub fn with_agent_concurrency(mut self, limit: usize) -> Self {
        self.agent_concurrency = limit;
        self
    }

    pub fn with_tool_concurrency(mut self, tool: impl Into<String>, limit: usize) -> Self {
        self.tool_concurrency.insert(tool.into(), limit);
        self
    }

    pub fn with_mock_termination(mut self) -> Self {
        self.mock_termination = true;
        self
    }

    /// Concurrency limit for a specific agent tool.
    pub fn concurrency_for(&self, tool: &str) -> usize {
        self.tool_concurrency
            .get(tool)
            .copied()
            .unwrap_or(self.agent_concurrency)
            .max(1)
    }

    /// Inactivity window as a `Duration`; `None` when disabled.
    pub fn inactivity_timeout(&self) -> Option<Duration> {
        match self.inactivity_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn sigterm_wait(&self) -> Duration {
        Duration::from_millis(self.sigterm_wait_ms)
    }

    pub fn file_poll_interval(&self) -> Duration {
        Duration::from_millis(self.file_poll_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RunnerConfig::default();
        assert_eq!(config.grace_period(), Duration::from_secs(5));
        assert_eq!(config.sigterm_wait(), Duration::from_secs(1));
        assert!(config.inactivity_timeout().is_none());
        assert_eq!(config.concurrency_for("claude"), DEFAULT_AGENT_CONCURRENCY);
    }

    #[test]
    fn test_tool_override() {
        let config = RunnerConfig::default()
            .with_agent_concurrency(3)
            .with_tool_concurrency("codex", 1);
        assert_eq!(config.concurrency_for("codex"), 1);
        assert_eq!(config.concurrency_for("claude"), 3);
    }

    #[test]
    fn test_limit_floor() {
        let config = RunnerConfig::default().with_tool_concurrency("codex", 0);
        // A zero limit would deadlock the pool; clamp to one slot.
        assert_eq!(config.concurrency_for("codex"), 1);
    }

    #[test]
    fn test_from_toml() {
        let config = RunnerConfig::from_toml_str(
            r#"
            inactivity_timeout_ms = 60000
            agent_concurrency = 4

            [tool_concurrency]
            codex = 1
            "#,
        )
        .unwrap();
        assert_eq!(config.inactivity_timeout(), Some(Duration::from_secs(60)));
        assert_eq!(config.concurrency_for("codex"), 1);
        assert_eq!(config.concurrency_for("claude"), 4);
        // Unspecified fields keep their defaults
        assert_eq!(config.grace_period_ms, DEFAULT_GRACE_PERIOD_MS);
    }

    #[test]
    fn test_bad_toml() {
        assert!(RunnerConfig::from_toml_str("inactivity_timeout_ms = \"soon\"").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("corral.toml");
        std::fs::write(&path, "grace_period_ms = 250\n").unwrap();

        let config = RunnerConfig::load(&path).unwrap();
        assert_eq!(config.grace_period(), Duration::from_millis(250));
        assert!(RunnerConfig::load(dir.path().join("missing.toml")).is_err());
    }
}
