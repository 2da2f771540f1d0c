//! Nested, task-scoped logging context
//!
//! Attributes interleaved subprocess output to the correct concurrent run.
//! A context carries an optional label prefix, an optional main-stream
//! prefix, extra sinks, and a primary-sink override. Entering a child scope
//! merges additively: prefixes concatenate, sink sets union. Nothing is
//! mutated in place; each scope gets a fresh merged value.
//!
//! Every emitted line is written in two variants:
//! - `prefix + line` to the run-scoped extra sinks (a per-run log file reads
//!   cleanly without the aggregate labels)
//! - `main_prefix + prefix + line` to the primary sink, so the shared stream
//!   shows which run produced each line
//!
//! The ambient context propagates across `.await` via `tokio::task_local!`.
//! It does NOT cross `tokio::spawn`; capture `current()` and hand the value
//! to spawned reader tasks explicitly.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

tokio::task_local! {
    static LOG_CONTEXT: LogContext;
}

/// Destination for emitted log lines.
pub trait LogSink: Send + Sync {
    fn write_line(&self, line: &str);
}

/// Primary sink default: process stdout.
pub struct ConsoleSink;

impl LogSink for ConsoleSink {
    fn write_line(&self, line: &str) {
        println!("{line}");
    }
}

/// Appends lines to a file. Used for per-run log files.
pub struct FileSink {
    path: PathBuf,
    file: Mutex<File>,
}

impl FileSink {
    pub fn create(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl LogSink for FileSink {
    fn write_line(&self, line: &str) {
        if let Ok(mut file) = self.file.lock() {
            // A failed log write must not fail the run.
            let _ = writeln!(file, "{line}");
        }
    }
}

/// Collects lines in memory for test assertions.
#[derive(Default)]
pub struct MemorySink {
    lines: Mutex<Vec<String>>,
}

impl MemorySink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().map(|l| l.clone()).unwrap_or_default()
    }
}

impl LogSink for MemorySink {
    fn write_line(&self, line: &str) {
        if let Ok(mut lines) = self.lines.lock() {
            lines.push(line.to_string());
        }
    }
}

/// Logging context for one dynamic scope.
#[derive(Clone, Default)]
pub struct LogContext {
    /// Local label, e.g. `[3]`. Concatenates across nesting.
    pub prefix: Option<String>,

    /// Run-level label, e.g. `[run-1]`. Only shown on the primary stream.
    pub main_prefix: Option<String>,

    /// Additional sinks receiving the locally-prefixed variant.
    pub extra_sinks: Vec<Arc<dyn LogSink>>,

    /// Replaces the primary sink (console) when set.
    pub sink_override: Option<Arc<dyn LogSink>>,
}

impl std::fmt::Debug for LogContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogContext")
            .field("prefix", &self.prefix)
            .field("main_prefix", &self.main_prefix)
            .field("extra_sinks", &self.extra_sinks.len())
            .field("sink_override", &self.sink_override.is_some())
            .finish()
    }
}

impl LogContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    pub fn with_main_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.main_prefix = Some(prefix.into());
        self
    }

    pub fn with_extra_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.extra_sinks.push(sink);
        self
    }

    pub fn with_sink_override(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.sink_override = Some(sink);
        self
    }

    /// Merge a child context onto `self`: prefixes concatenate with a single
    /// space, sinks union (parent first), the innermost override wins.
    pub fn merged_with(&self, child: &LogContext) -> LogContext {
        let mut extra_sinks = self.extra_sinks.clone();
        extra_sinks.extend(child.extra_sinks.iter().cloned());
        LogContext {
            prefix: join_prefix(self.prefix.as_deref(), child.prefix.as_deref()),
            main_prefix: join_prefix(self.main_prefix.as_deref(), child.main_prefix.as_deref()),
            extra_sinks,
            sink_override: child
                .sink_override
                .clone()
                .or_else(|| self.sink_override.clone()),
        }
    }

    /// The locally-prefixed variant written to extra sinks.
    pub fn local_line(&self, line: &str) -> String {
        match &self.prefix {
            Some(p) => format!("{p} {line}"),
            None => line.to_string(),
        }
    }

    /// The fully-prefixed variant written to the primary sink.
    pub fn main_line(&self, line: &str) -> String {
        match join_prefix(self.main_prefix.as_deref(), self.prefix.as_deref()) {
            Some(p) => format!("{p} {line}"),
            None => line.to_string(),
        }
    }

    /// Write one line through this context's sinks.
    pub fn emit(&self, line: &str) {
        let local = self.local_line(line);
        for sink in &self.extra_sinks {
            sink.write_line(&local);
        }
        let main = self.main_line(line);
        match &self.sink_override {
            Some(sink) => sink.write_line(&main),
            None => ConsoleSink.write_line(&main),
        }
    }
}

fn join_prefix(parent: Option<&str>, child: Option<&str>) -> Option<String> {
    match (parent, child) {
        (Some(p), Some(c)) => Some(format!("{p} {c}")),
        (Some(p), None) => Some(p.to_string()),
        (None, Some(c)) => Some(c.to_string()),
        (None, None) => None,
    }
}

/// Snapshot of the ambient context (empty outside any scope).
pub fn current() -> LogContext {
    LOG_CONTEXT
        .try_with(|ctx| ctx.clone())
        .unwrap_or_default()
}

/// Run `fut` with `partial` merged into the ambient context, restoring the
/// prior context on exit. Holds across every `.await` inside `fut`.
pub async fn with_context<F>(partial: LogContext, fut: F) -> F::Output
where
    F: std::future::Future,
{
    let merged = current().merged_with(&partial);
    LOG_CONTEXT.scope(merged, fut).await
}

/// Emit one line through the ambient context.
pub fn emit(line: &str) {
    current().emit(line);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_prefixes() {
        let parent = LogContext::new().with_main_prefix("[run-1]");
        let child = LogContext::new().with_prefix("[3]");
        let merged = parent.merged_with(&child);
        assert_eq!(merged.main_line("hi"), "[run-1] [3] hi");
        assert_eq!(merged.local_line("hi"), "[3] hi");
    }

    #[test]
    fn test_merge_unions_sinks() {
        let a = MemorySink::new();
        let b = MemorySink::new();
        let parent = LogContext::new().with_extra_sink(a.clone());
        let child = LogContext::new().with_extra_sink(b.clone());
        let merged = parent.merged_with(&child);
        assert_eq!(merged.extra_sinks.len(), 2);
    }

    #[tokio::test]
    async fn test_nested_scopes() {
        let main = MemorySink::new();
        let run_file = MemorySink::new();

        let outer = LogContext::new()
            .with_main_prefix("[run-1]")
            .with_sink_override(main.clone());
        with_context(outer, async {
            let inner = LogContext::new()
                .with_prefix("[3]")
                .with_extra_sink(run_file.clone());
            with_context(inner, async {
                emit("hi");
            })
            .await;
            // Back in the outer scope: child prefix and sink are gone.
            emit("outer");
        })
        .await;

        assert_eq!(main.lines(), vec!["[run-1] [3] hi", "[run-1] outer"]);
        assert_eq!(run_file.lines(), vec!["[3] hi"]);
    }

    #[tokio::test]
    async fn test_context_survives_await() {
        let main = MemorySink::new();
        let ctx = LogContext::new()
            .with_prefix("[w]")
            .with_sink_override(main.clone());
        with_context(ctx, async {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            emit("after await");
        })
        .await;
        assert_eq!(main.lines(), vec!["[w] after await"]);
    }

    #[tokio::test]
    async fn test_file_sink_gets_local_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run-1.log");
        let sink = Arc::new(FileSink::create(&path).unwrap());
        assert_eq!(sink.path(), path);

        let outer = LogContext::new()
            .with_main_prefix("[run-1]")
            .with_sink_override(MemorySink::new());
        with_context(outer, async {
            let inner = LogContext::new().with_prefix("[3]").with_extra_sink(sink);
            with_context(inner, async {
                emit("hi");
                emit("bye");
            })
            .await;
        })
        .await;

        // The per-run file reads cleanly, without the aggregate prefix.
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "[3] hi\n[3] bye\n");
    }

    #[test]
    fn test_emit_outside_scope_is_unprefixed() {
        let ctx = current();
        assert_eq!(ctx.main_line("plain"), "plain");
    }
}
