//! File-mode result delivery
//!
//! For agents that cannot reliably issue HTTP calls: the orchestrator picks
//! a result path, tells the agent about it through its prompt, and polls for
//! the file while racing process exit. The file is read exactly once (after
//! first detection, or once after exit), so an invalid payload is terminal
//! here, unlike callback mode.

use super::payload::{parse_payload, AgentResult, PayloadFormat, ResultSchema};
use crate::spawn::ExitFuture;
use corral_foundation::{Error, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Outcome of the file-channel wait.
#[derive(Debug)]
pub enum FileWait {
    /// The result file appeared and validated.
    Delivered(AgentResult),
    /// The process exited and no file ever appeared.
    Exited(i32),
}

/// Polls a well-known path for the agent's result.
pub struct FileResultChannel {
    path: PathBuf,
    schema: Option<Arc<dyn ResultSchema>>,
    poll_interval: Duration,
}

impl FileResultChannel {
    pub fn new(
        path: impl Into<PathBuf>,
        schema: Option<Arc<dyn ResultSchema>>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            path: path.into(),
            schema,
            poll_interval: poll_interval.max(Duration::from_millis(10)),
        }
    }

    /// Deterministic result path for a run, placed next to the run's other
    /// scratch files.
    pub fn result_path(dir: impl AsRef<Path>, run_id: u64) -> PathBuf {
        dir.as_ref().join(format!("agent-result-{run_id}.json"))
    }

    /// The path the agent must write to.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Poll for the result file, racing process exit. After exit, one final
    /// existence check closes the write-then-exit race.
    pub async fn wait(&self, exit: ExitFuture) -> Result<FileWait> {
        let mut exit = exit;
        loop {
            if self.path.exists() {
                return Ok(FileWait::Delivered(self.consume().await?));
            }
            tokio::select! {
                code = &mut exit => {
                    return if self.path.exists() {
                        Ok(FileWait::Delivered(self.consume().await?))
                    } else {
                        Ok(FileWait::Exited(code))
                    };
                }
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    async fn consume(&self) -> Result<AgentResult> {
        let bytes = tokio::fs::read(&self.path).await?;
        let value = parse_payload(&bytes, PayloadFormat::Auto)
            .map_err(Error::InvalidResultPayload)?;
        if let Some(schema) = &self.schema {
            schema.validate(&value).map_err(Error::InvalidResultPayload)?;
        }
        // Best effort; a leftover file must not fail a delivered result.
        if let Err(err) = tokio::fs::remove_file(&self.path).await {
            debug!("could not remove result file {}: {err}", self.path.display());
        }
        Ok(AgentResult::new(value))
    }
}
