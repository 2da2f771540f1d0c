//! Process spawner
//!
//! Launches an external command with piped stdio (or an emulated terminal
//! via portable-pty for interactive tools) and returns a kill handle, a
//! shareable exit future, and the accumulated output.
//!
//! Failure to start the process never throws: the exit future resolves with
//! a synthetic non-zero code and the spawn error is recorded as stderr
//! content, so callers always observe the same exit/result race.

use crate::linebuf::LineBuffer;
use crate::logctx::{self, LogContext};
use crate::request::{OutputBuffer, OutputMode, RunRequest, StreamKind};
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use portable_pty::{native_pty_system, CommandBuilder, PtySize};
use std::io::Read;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::{oneshot, watch};
use tracing::{debug, warn};

/// Synthetic exit code reported when the process could not be started or
/// its real status is unknowable.
pub const SYNTHETIC_EXIT_CODE: i32 = -1;

/// Shareable, clonable future for the process exit code.
pub type ExitFuture = Shared<BoxFuture<'static, i32>>;

/// Kill capability over a spawned process.
pub trait ProcessKiller: Send {
    fn kill(&mut self) -> std::io::Result<()>;
}

struct PtyKiller(Box<dyn portable_pty::ChildKiller + Send + Sync>);

impl ProcessKiller for PtyKiller {
    fn kill(&mut self) -> std::io::Result<()> {
        self.0.kill()
    }
}

/// Owned handle over one spawned process.
///
/// Exactly one lifecycle task owns the handle; nothing else signals the
/// process directly except the termination planner, which receives the
/// handle by reference.
pub struct RunHandle {
    pid: Option<u32>,
    pgid: Option<i32>,
    exit_code: Mutex<Option<i32>>,
    killed: AtomicBool,
    killer: Mutex<Option<Box<dyn ProcessKiller>>>,
    /// Serializes termination sequences; `true` once one has completed.
    termination_gate: tokio::sync::Mutex<bool>,
}

impl RunHandle {
    fn new(pid: Option<u32>, pgid: Option<i32>, killer: Option<Box<dyn ProcessKiller>>) -> Self {
        Self {
            pid,
            pgid,
            exit_code: Mutex::new(None),
            killed: AtomicBool::new(false),
            killer: Mutex::new(killer),
            termination_gate: tokio::sync::Mutex::new(false),
        }
    }

    /// Handle with no live process behind it (spawn failures, planner tests).
    pub(crate) fn detached(pid: Option<u32>, pgid: Option<i32>) -> Arc<Self> {
        Arc::new(Self::new(pid, pgid, None))
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Process-group id when the child was detached into its own group.
    pub fn pgid(&self) -> Option<i32> {
        self.pgid
    }

    /// Exit code; `None` until the process has exited.
    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code.lock().ok().and_then(|code| *code)
    }

    pub fn was_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_killed(&self) {
        self.killed.store(true, Ordering::SeqCst);
    }

    pub(crate) fn set_exit(&self, code: i32) {
        if let Ok(mut slot) = self.exit_code.lock() {
            slot.get_or_insert(code);
        }
    }

    /// Best-effort direct kill through the owned killer, if any.
    pub(crate) fn kill_direct(&self) -> std::io::Result<()> {
        if let Ok(mut killer) = self.killer.lock() {
            if let Some(killer) = killer.as_mut() {
                return killer.kill();
            }
        }
        Ok(())
    }

    pub(crate) fn termination_gate(&self) -> &tokio::sync::Mutex<bool> {
        &self.termination_gate
    }
}

impl std::fmt::Debug for RunHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunHandle")
            .field("pid", &self.pid)
            .field("pgid", &self.pgid)
            .field("exit_code", &self.exit_code())
            .field("killed", &self.was_killed())
            .finish()
    }
}

/// A launched process: handle, exit future, output, and an activity signal
/// bumped on every output event (the watchdog's reset source).
pub struct SpawnedProcess {
    pub handle: Arc<RunHandle>,
    pub exit: ExitFuture,
    pub output: OutputBuffer,
    pub activity: watch::Receiver<u64>,
}

/// Launch the requested process. Captures the ambient logging context for
/// the stream readers; never fails (see module docs).
pub async fn spawn(request: &RunRequest) -> SpawnedProcess {
    let ctx = logctx::current();
    if request.use_pty {
        spawn_pty(request, ctx)
    } else {
        spawn_piped(request, ctx).await
    }
}

fn spawn_failure(request: &RunRequest, ctx: &LogContext, err: &dyn std::fmt::Display) -> SpawnedProcess {
    let output = OutputBuffer::new();
    let line = format!("failed to start {}: {err}", request.program.display());
    output.push_line(StreamKind::Stderr, &line);
    if request.output_mode == OutputMode::Stream {
        ctx.emit(&line);
    }
    warn!("spawn failure: {line}");

    let handle = RunHandle::detached(None, None);
    handle.set_exit(SYNTHETIC_EXIT_CODE);

    // Closing the sender immediately tells the watchdog there will never be
    // further activity.
    let (_tx, activity) = watch::channel(0u64);

    SpawnedProcess {
        handle,
        exit: async { SYNTHETIC_EXIT_CODE }.boxed().shared(),
        output,
        activity,
    }
}

async fn spawn_piped(request: &RunRequest, ctx: LogContext) -> SpawnedProcess {
    let mut cmd = Command::new(&request.program);
    cmd.args(&request.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    if let Some(cwd) = &request.cwd {
        cmd.current_dir(cwd);
    }
    for (key, value) in &request.env {
        cmd.env(key, value);
    }

    // Detach into a fresh process group so descendants can be signaled as a
    // unit during termination.
    #[cfg(unix)]
    unsafe {
        cmd.pre_exec(|| {
            libc::setpgid(0, 0);
            Ok(())
        });
    }

    debug!("spawning: {}", request.command_line());

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(err) => return spawn_failure(request, &ctx, &err),
    };

    let pid = child.id();
    #[cfg(unix)]
    let pgid = pid.map(|p| p as i32);
    #[cfg(not(unix))]
    let pgid = None;

    let handle = Arc::new(RunHandle::new(pid, pgid, None));
    let output = OutputBuffer::new();
    let (activity_tx, activity) = watch::channel(0u64);
    let activity_tx = Arc::new(activity_tx);

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let mut readers = Vec::new();
    if let Some(stdout) = stdout {
        readers.push(tokio::spawn(read_stream(
            stdout,
            StreamKind::Stdout,
            ctx.clone(),
            request.output_mode,
            output.clone(),
            Arc::clone(&activity_tx),
        )));
    }
    if let Some(stderr) = stderr {
        readers.push(tokio::spawn(read_stream(
            stderr,
            StreamKind::Stderr,
            ctx.clone(),
            request.output_mode,
            output.clone(),
            Arc::clone(&activity_tx),
        )));
    }

    let (exit_tx, exit_rx) = oneshot::channel();
    let wait_handle = Arc::clone(&handle);
    tokio::spawn(async move {
        let code = match child.wait().await {
            Ok(status) => status.code().unwrap_or(SYNTHETIC_EXIT_CODE),
            Err(err) => {
                warn!("wait failed: {err}");
                SYNTHETIC_EXIT_CODE
            }
        };
        wait_handle.set_exit(code);
        let _ = exit_tx.send(code);
    });

    // Settle the exit future only after both readers drained, so callers
    // never snapshot output mid-line at exit.
    let exit = async move {
        for reader in readers {
            let _ = reader.await;
        }
        exit_rx.await.unwrap_or(SYNTHETIC_EXIT_CODE)
    }
    .boxed()
    .shared();

    SpawnedProcess {
        handle,
        exit,
        output,
        activity,
    }
}

async fn read_stream<R>(
    mut reader: R,
    kind: StreamKind,
    ctx: LogContext,
    mode: OutputMode,
    output: OutputBuffer,
    activity: Arc<watch::Sender<u64>>,
) where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut linebuf = LineBuffer::new();
    let mut chunk = [0u8; 4096];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                activity.send_modify(|events| *events += 1);
                for line in linebuf.push(&chunk[..n]) {
                    output.push_line(kind, &line);
                    if mode == OutputMode::Stream {
                        ctx.emit(&line);
                    }
                }
            }
        }
    }
    if let Some(line) = linebuf.flush() {
        output.push_line(kind, &line);
        if mode == OutputMode::Stream {
            ctx.emit(&line);
        }
    }
}

fn spawn_pty(request: &RunRequest, ctx: LogContext) -> SpawnedProcess {
    let pty_system = native_pty_system();
    let pair = match pty_system.openpty(PtySize {
        rows: 24,
        cols: 120,
        pixel_width: 0,
        pixel_height: 0,
    }) {
        Ok(pair) => pair,
        Err(err) => return spawn_failure(request, &ctx, &err),
    };

    let mut builder = CommandBuilder::new(&request.program);
    builder.args(&request.args);
    if let Some(cwd) = &request.cwd {
        builder.cwd(cwd);
    }
    for (key, value) in &request.env {
        builder.env(key, value);
    }

    debug!("spawning (pty): {}", request.command_line());

    let mut child = match pair.slave.spawn_command(builder) {
        Ok(child) => child,
        Err(err) => return spawn_failure(request, &ctx, &err),
    };
    drop(pair.slave);

    let reader = match pair.master.try_clone_reader() {
        Ok(reader) => reader,
        Err(err) => {
            // No output path; kill what we started and report as a failure.
            let _ = child.kill();
            return spawn_failure(request, &ctx, &err);
        }
    };

    let pid = child.process_id();
    let killer: Box<dyn ProcessKiller> = Box::new(PtyKiller(child.clone_killer()));
    let handle = Arc::new(RunHandle::new(pid, None, Some(killer)));
    let output = OutputBuffer::new();
    let (activity_tx, activity) = watch::channel(0u64);

    // A PTY has a single merged stream; everything reads as stdout.
    let mode = request.output_mode;
    let read_output = output.clone();
    let reader_task = tokio::task::spawn_blocking(move || {
        let mut reader = reader;
        let mut linebuf = LineBuffer::new();
        let mut chunk = [0u8; 4096];
        loop {
            match reader.read(&mut chunk) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    activity_tx.send_modify(|events| *events += 1);
                    for line in linebuf.push(&chunk[..n]) {
                        read_output.push_line(StreamKind::Stdout, &line);
                        if mode == OutputMode::Stream {
                            ctx.emit(&line);
                        }
                    }
                }
            }
        }
        if let Some(line) = linebuf.flush() {
            read_output.push_line(StreamKind::Stdout, &line);
            if mode == OutputMode::Stream {
                ctx.emit(&line);
            }
        }
    });

    let (exit_tx, exit_rx) = oneshot::channel();
    let wait_handle = Arc::clone(&handle);
    let master = pair.master;
    tokio::task::spawn_blocking(move || {
        let code = match child.wait() {
            Ok(status) => status.exit_code() as i32,
            Err(err) => {
                warn!("pty wait failed: {err}");
                SYNTHETIC_EXIT_CODE
            }
        };
        // Keep the master side open until the child is gone.
        drop(master);
        wait_handle.set_exit(code);
        let _ = exit_tx.send(code);
    });

    // Dropping the master above closes the reader's end; join it before
    // settling the exit future so snapshots see the full output.
    let exit = async move {
        let _ = reader_task.await;
        exit_rx.await.unwrap_or(SYNTHETIC_EXIT_CODE)
    }
    .boxed()
    .shared();

    SpawnedProcess {
        handle,
        exit,
        output,
        activity,
    }
}
