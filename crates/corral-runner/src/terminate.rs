//! Termination planner
//!
//! Ensures no process tree outlives its run. The sequence is
//! GraceWait -> SIGTERM -> (1s wait) -> SIGKILL -> await exit, with the
//! concrete signaling strategy chosen per platform:
//!
//! - no pid: signal the owned kill handle directly, best effort
//! - Windows: recursive tree kill via `taskkill /T`
//! - known process group: signal the negative group id, falling back to a
//!   direct kill if group delivery fails
//! - macOS without a group id: enumerate descendants from the process table
//!   and signal each (skipping our own pid/ppid)
//! - otherwise: signal only the direct child
//!
//! Every attempt snapshots an immutable [`TerminationPlan`] used for logging
//! and test assertions. Mock mode computes and records identical plans
//! without sending real signals.

use crate::spawn::{ExitFuture, RunHandle};
use corral_foundation::Error;
use serde::Serialize;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, warn};

/// Host platform, detected once at planner construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Linux,
    MacOs,
    Windows,
}

impl Platform {
    pub fn current() -> Self {
        if cfg!(windows) {
            Platform::Windows
        } else if cfg!(target_os = "macos") {
            Platform::MacOs
        } else {
            Platform::Linux
        }
    }
}

/// Which escalation step a plan belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TermSignal {
    Term,
    Kill,
}

/// How the signal is delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// No pid known; use the owned kill handle.
    NoPid,
    /// `taskkill /PID <pid> /T` (with `/F` on the kill step).
    WindowsTree,
    /// `killpg` on the process group.
    ProcessGroup,
    /// Walk the process table and signal each descendant.
    DescendantWalk,
    /// Signal only the direct child.
    DirectChild,
}

/// Real signals, or plan-recording only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TerminationMode {
    Real,
    Mock,
}

/// Snapshot of one termination attempt. Never mutated after construction.
#[derive(Debug, Clone, Serialize)]
pub struct TerminationPlan {
    pub mode: TerminationMode,
    pub platform: Platform,
    pub signal: TermSignal,
    pub pid: Option<u32>,
    pub pgid: Option<i32>,
    pub strategy: Strategy,
    pub descendants: Option<Vec<u32>>,
}

/// Executes the escalation state machine against run handles.
pub struct TerminationPlanner {
    platform: Platform,
    mode: TerminationMode,
    sigterm_wait: Duration,
    recorded: Mutex<Vec<TerminationPlan>>,
}

impl TerminationPlanner {
    pub fn new(sigterm_wait: Duration) -> Self {
        Self::with_platform(Platform::current(), TerminationMode::Real, sigterm_wait)
    }

    /// Records plans without signaling. For deterministic tests.
    pub fn mock() -> Self {
        Self::with_platform(
            Platform::current(),
            TerminationMode::Mock,
            Duration::from_millis(10),
        )
    }

    pub fn with_platform(
        platform: Platform,
        mode: TerminationMode,
        sigterm_wait: Duration,
    ) -> Self {
        Self {
            platform,
            mode,
            sigterm_wait,
            recorded: Mutex::new(Vec::new()),
        }
    }

    pub fn is_mock(&self) -> bool {
        self.mode == TerminationMode::Mock
    }

    /// Every plan recorded so far, in attempt order.
    pub fn recorded_plans(&self) -> Vec<TerminationPlan> {
        self.recorded.lock().map(|p| p.clone()).unwrap_or_default()
    }

    /// Run the full termination sequence against `handle`.
    ///
    /// At most one sequence is in flight per handle: a second call while one
    /// is pending awaits the first instead of issuing overlapping signals,
    /// and calls after completion are no-ops. Termination is best effort and
    /// never fails the caller.
    pub async fn terminate(&self, handle: &RunHandle, exit: ExitFuture, grace: Duration) {
        let mut done = handle.termination_gate().lock().await;
        if *done {
            return;
        }

        // GraceWait: give the process a chance to exit on its own.
        if handle.exit_code().is_none() && !grace.is_zero() {
            let _ = tokio::time::timeout(grace, exit.clone()).await;
        }
        if handle.exit_code().is_some() {
            // Already gone; no signal is sent and no plan recorded.
            *done = true;
            return;
        }

        handle.mark_killed();

        let plan = self.build_plan(handle, TermSignal::Term);
        debug!("termination plan: {plan:?}");
        self.execute(handle, &plan).await;
        self.record(plan);

        if tokio::time::timeout(self.sigterm_wait, exit.clone())
            .await
            .is_err()
            && handle.exit_code().is_none()
        {
            let plan = self.build_plan(handle, TermSignal::Kill);
            debug!("escalating: {plan:?}");
            self.execute(handle, &plan).await;
            self.record(plan);
        }

        // The caller must never observe a dangling process. Mock mode sent
        // no signals, so there is nothing to wait out.
        if self.mode == TerminationMode::Real {
            exit.await;
        }
        *done = true;
    }

    fn record(&self, plan: TerminationPlan) {
        if let Ok(mut recorded) = self.recorded.lock() {
            recorded.push(plan);
        }
    }

    fn build_plan(&self, handle: &RunHandle, signal: TermSignal) -> TerminationPlan {
        let pid = handle.pid();
        let pgid = handle.pgid();
        let strategy = match (pid, self.platform, pgid) {
            (None, _, _) => Strategy::NoPid,
            (_, Platform::Windows, _) => Strategy::WindowsTree,
            (_, _, Some(_)) => Strategy::ProcessGroup,
            (_, Platform::MacOs, None) => Strategy::DescendantWalk,
            _ => Strategy::DirectChild,
        };
        let descendants = match (strategy, self.mode) {
            (Strategy::DescendantWalk, TerminationMode::Real) => {
                pid.map(|p| enumerate_descendants(p, pgid))
            }
            _ => None,
        };
        TerminationPlan {
            mode: self.mode,
            platform: self.platform,
            signal,
            pid,
            pgid,
            strategy,
            descendants,
        }
    }

    async fn execute(&self, handle: &RunHandle, plan: &TerminationPlan) {
        if plan.mode == TerminationMode::Mock {
            return;
        }
        match plan.strategy {
            Strategy::NoPid => {
                if let Err(err) = handle.kill_direct() {
                    warn!("{}", Error::TerminationFailure(err.to_string()));
                }
            }
            Strategy::WindowsTree => {
                if let Some(pid) = plan.pid {
                    windows_tree_kill(pid, plan.signal).await;
                }
            }
            Strategy::ProcessGroup => {
                let (Some(pid), Some(pgid)) = (plan.pid, plan.pgid) else {
                    return;
                };
                if let Err(err) = signal_group(pgid, plan.signal) {
                    warn!(
                        "{}",
                        Error::TerminationFailure(format!(
                            "group signal to -{pgid} failed ({err}), falling back to direct kill"
                        ))
                    );
                    if let Err(err) = signal_pid(pid, plan.signal) {
                        warn!("{}", Error::TerminationFailure(err.to_string()));
                    }
                }
            }
            Strategy::DescendantWalk => {
                let Some(pid) = plan.pid else { return };
                for descendant in plan.descendants.iter().flatten() {
                    if let Err(err) = signal_pid(*descendant, plan.signal) {
                        debug!("descendant {descendant} signal failed: {err}");
                    }
                }
                if let Err(err) = signal_pid(pid, plan.signal) {
                    warn!("{}", Error::TerminationFailure(err.to_string()));
                }
            }
            Strategy::DirectChild => {
                let Some(pid) = plan.pid else { return };
                if let Err(err) = signal_pid(pid, plan.signal) {
                    warn!("{}", Error::TerminationFailure(err.to_string()));
                }
            }
        }
    }
}

#[cfg(unix)]
fn to_nix_signal(signal: TermSignal) -> nix::sys::signal::Signal {
    match signal {
        TermSignal::Term => nix::sys::signal::Signal::SIGTERM,
        TermSignal::Kill => nix::sys::signal::Signal::SIGKILL,
    }
}

#[cfg(unix)]
fn signal_pid(pid: u32, signal: TermSignal) -> std::io::Result<()> {
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), to_nix_signal(signal))
        .map_err(|errno| std::io::Error::from_raw_os_error(errno as i32))
}

#[cfg(unix)]
fn signal_group(pgid: i32, signal: TermSignal) -> std::io::Result<()> {
    nix::sys::signal::killpg(nix::unistd::Pid::from_raw(pgid), to_nix_signal(signal))
        .map_err(|errno| std::io::Error::from_raw_os_error(errno as i32))
}

#[cfg(not(unix))]
fn signal_pid(_pid: u32, _signal: TermSignal) -> std::io::Result<()> {
    Ok(())
}

#[cfg(not(unix))]
fn signal_group(_pgid: i32, _signal: TermSignal) -> std::io::Result<()> {
    Ok(())
}

#[cfg(windows)]
async fn windows_tree_kill(pid: u32, signal: TermSignal) {
    let mut cmd = tokio::process::Command::new("taskkill");
    cmd.arg("/PID").arg(pid.to_string()).arg("/T");
    if signal == TermSignal::Kill {
        cmd.arg("/F");
    }
    match cmd.output().await {
        Ok(out) if !out.status.success() => {
            warn!(
                "{}",
                Error::TerminationFailure(format!(
                    "taskkill exited with {:?}",
                    out.status.code()
                ))
            );
        }
        Err(err) => warn!("{}", Error::TerminationFailure(err.to_string())),
        _ => {}
    }
}

#[cfg(not(windows))]
async fn windows_tree_kill(_pid: u32, _signal: TermSignal) {}

/// Walk the process table for transitive children of `root`, filtered to
/// `pgid` when one is known. Skips our own pid and parent pid so the
/// orchestrator never signals itself.
#[cfg(unix)]
fn enumerate_descendants(root: u32, pgid: Option<i32>) -> Vec<u32> {
    let output = match std::process::Command::new("ps")
        .args(["-Ao", "pid=,ppid=,pgid="])
        .output()
    {
        Ok(out) if out.status.success() => out,
        _ => return Vec::new(),
    };

    let own_pid = std::process::id();
    let parent_pid = unsafe { libc::getppid() } as u32;

    let mut entries: Vec<(u32, u32, i32)> = Vec::new();
    for line in String::from_utf8_lossy(&output.stdout).lines() {
        let mut fields = line.split_whitespace();
        let (Some(pid), Some(ppid), Some(entry_pgid)) = (
            fields.next().and_then(|f| f.parse().ok()),
            fields.next().and_then(|f| f.parse().ok()),
            fields.next().and_then(|f| f.parse().ok()),
        ) else {
            continue;
        };
        entries.push((pid, ppid, entry_pgid));
    }

    let mut descendants = Vec::new();
    let mut frontier = vec![root];
    while let Some(current) = frontier.pop() {
        for (pid, ppid, entry_pgid) in &entries {
            if *ppid != current || *pid == own_pid || *pid == parent_pid {
                continue;
            }
            if let Some(group) = pgid {
                if *entry_pgid != group {
                    continue;
                }
            }
            if !descendants.contains(pid) {
                descendants.push(*pid);
                frontier.push(*pid);
            }
        }
    }
    descendants
}

#[cfg(not(unix))]
fn enumerate_descendants(_root: u32, _pgid: Option<i32>) -> Vec<u32> {
    Vec::new()
}
