//! Run requests and output accumulation

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Combined output cap. The tail is kept when the cap is exceeded.
const MAX_OUTPUT_BYTES: usize = 2 * 1024 * 1024;

/// What to do with process output lines beyond accumulating them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputMode {
    /// Log each line through the active logging context.
    #[default]
    Stream,
    /// Accumulate silently; callers read the buffer afterwards.
    Capture,
}

/// A request to run one external process. Immutable once submitted.
#[derive(Debug, Clone)]
pub struct RunRequest {
    /// Resolved executable path or bare program name.
    pub program: PathBuf,

    /// Argument vector, treated as opaque.
    pub args: Vec<String>,

    /// Working directory; inherits the orchestrator's when unset.
    pub cwd: Option<PathBuf>,

    /// Environment overlay on top of the inherited environment.
    pub env: HashMap<String, String>,

    /// Stream-vs-capture mode for output lines.
    pub output_mode: OutputMode,

    /// Run under an emulated terminal (for interactive tools).
    pub use_pty: bool,

    /// Per-run override of the configured inactivity window.
    pub inactivity_timeout: Option<Duration>,

    /// Per-run override of the configured termination grace period.
    pub grace_period: Option<Duration>,
}

impl RunRequest {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: HashMap::new(),
            output_mode: OutputMode::default(),
            use_pty: false,
            inactivity_timeout: None,
            grace_period: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_output_mode(mut self, mode: OutputMode) -> Self {
        self.output_mode = mode;
        self
    }

    pub fn with_pty(mut self) -> Self {
        self.use_pty = true;
        self
    }

    pub fn with_inactivity_timeout(mut self, timeout: Duration) -> Self {
        self.inactivity_timeout = Some(timeout);
        self
    }

    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = Some(grace);
        self
    }

    /// Display form for logs.
    pub fn command_line(&self) -> String {
        let mut parts = vec![self.program.display().to_string()];
        parts.extend(self.args.iter().cloned());
        parts.join(" ")
    }
}

/// Which stream a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

/// Shared, bounded accumulator for a run's combined output.
#[derive(Clone, Default)]
pub struct OutputBuffer {
    inner: Arc<Mutex<String>>,
}

impl OutputBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one complete line; stderr lines are tagged so mixed output
    /// stays attributable after the fact.
    pub fn push_line(&self, kind: StreamKind, line: &str) {
        let Ok(mut buf) = self.inner.lock() else {
            return;
        };
        match kind {
            StreamKind::Stdout => buf.push_str(line),
            StreamKind::Stderr => {
                buf.push_str("[stderr] ");
                buf.push_str(line);
            }
        }
        buf.push('\n');

        if buf.len() > MAX_OUTPUT_BYTES {
            let mut cut = buf.len() - MAX_OUTPUT_BYTES;
            while cut < buf.len() && !buf.is_char_boundary(cut) {
                cut += 1;
            }
            buf.drain(..cut);
        }
    }

    /// Current contents.
    pub fn snapshot(&self) -> String {
        self.inner.lock().map(|buf| buf.clone()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_builder() {
        let req = RunRequest::new("claude")
            .arg("--print")
            .args(["--model", "sonnet"])
            .env("NO_COLOR", "1")
            .with_pty();
        assert_eq!(req.command_line(), "claude --print --model sonnet");
        assert!(req.use_pty);
        assert_eq!(req.env.get("NO_COLOR").map(String::as_str), Some("1"));
    }

    #[test]
    fn test_output_buffer_tags_stderr() {
        let buf = OutputBuffer::new();
        buf.push_line(StreamKind::Stdout, "hello");
        buf.push_line(StreamKind::Stderr, "boom");
        assert_eq!(buf.snapshot(), "hello\n[stderr] boom\n");
    }

    #[test]
    fn test_output_buffer_keeps_tail_under_cap() {
        let buf = OutputBuffer::new();
        let line = "x".repeat(1024);
        for _ in 0..3000 {
            buf.push_line(StreamKind::Stdout, &line);
        }
        let snapshot = buf.snapshot();
        assert!(snapshot.len() <= MAX_OUTPUT_BYTES);
        assert!(snapshot.ends_with(&format!("{line}\n")));
    }
}
