//! Run orchestration
//!
//! One run: pool admission -> spawn inside a fresh logging scope -> race
//! {result, exit, watchdog} -> termination planner. The three racing
//! futures settle at most once total; whichever settles first decides the
//! outcome and the others are abandoned. The termination planner always
//! runs before control returns, so the caller never observes a dangling
//! process tree - on success, failure, or timeout alike.

use crate::channel::{AgentResult, CallbackServer, FileResultChannel, FileWait, ResultSchema};
use crate::logctx::{self, LogContext};
use crate::pool::AUX_POOL_KEY;
use crate::registry::RunnerRegistry;
use crate::request::RunRequest;
use crate::spawn::{spawn, SpawnedProcess};
use crate::watchdog::Watchdog;
use corral_foundation::{Error, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Which result-delivery strategy a run uses.
pub enum ChannelConfig {
    /// Transient loopback HTTP listener; the agent POSTs its result.
    Callback {
        schema: Option<Arc<dyn ResultSchema>>,
    },
    /// Well-known file path the orchestrator polls.
    File {
        path: PathBuf,
        schema: Option<Arc<dyn ResultSchema>>,
    },
}

/// Where the agent must deliver its result; handed to the caller's
/// request builder so the URL or path lands in the command line / prompt.
#[derive(Debug, Clone)]
pub enum ChannelEndpoint {
    Callback { url: String },
    File { path: PathBuf },
}

/// A completed agent run.
#[derive(Debug)]
pub struct AgentRun {
    pub run_id: u64,
    pub result: AgentResult,
    /// `None` only if the process was still exiting under a mock planner.
    pub exit_code: Option<i32>,
    pub output: String,
}

/// A completed auxiliary command.
#[derive(Debug)]
pub struct CommandOutcome {
    pub run_id: u64,
    pub exit_code: i32,
    pub output: String,
}

enum Raced {
    Delivered(AgentResult),
    Exited(i32),
    Inactive(Error),
    Failed(Error),
}

/// Run an agent process and wait for its structured result.
///
/// `make_request` receives the concrete channel endpoint (callback URL or
/// result-file path) and builds the spawn request around it; the runner
/// treats the resulting command as opaque.
pub async fn run_agent<F>(
    registry: &RunnerRegistry,
    tool: &str,
    channel: ChannelConfig,
    make_request: F,
) -> Result<AgentRun>
where
    F: FnOnce(&ChannelEndpoint) -> RunRequest + Send,
{
    registry
        .pools()
        .run(tool, async {
            let run_id = registry.next_run_id();
            let scope = LogContext::new().with_main_prefix(format!("[run-{run_id}]"));
            logctx::with_context(scope, run_agent_inner(registry, run_id, channel, make_request))
                .await
        })
        .await
}

async fn run_agent_inner<F>(
    registry: &RunnerRegistry,
    run_id: u64,
    channel: ChannelConfig,
    make_request: F,
) -> Result<AgentRun>
where
    F: FnOnce(&ChannelEndpoint) -> RunRequest + Send,
{
    match channel {
        ChannelConfig::Callback { schema } => {
            let mut server = CallbackServer::start(schema).await?;
            let endpoint = ChannelEndpoint::Callback {
                url: server.url().to_string(),
            };
            let request = make_request(&endpoint);
            info!("run {run_id}: {} (callback)", request.command_line());

            let spawned = spawn(&request).await;
            let watchdog = arm_watchdog(registry, &request, &spawned);
            let mut exit = spawned.exit.clone();

            let mut raced = {
                let recv = server.recv();
                tokio::pin!(recv);
                tokio::select! {
                    biased;
                    res = &mut recv => match res {
                        Ok(result) => Raced::Delivered(result),
                        Err(err) => Raced::Failed(err),
                    },
                    code = &mut exit => Raced::Exited(code),
                    err = watchdog.expired() => Raced::Inactive(err),
                }
            };
            // A result POSTed just before exit must win regardless of which
            // future settled first.
            raced = match raced {
                Raced::Exited(code) => match server.try_take() {
                    Some(result) => Raced::Delivered(result),
                    None => Raced::Exited(code),
                },
                other => other,
            };
            server.shutdown();

            settle(registry, run_id, &request, spawned, raced).await
        }
        ChannelConfig::File { path, schema } => {
            let file_channel =
                FileResultChannel::new(path, schema, registry.config().file_poll_interval());
            let endpoint = ChannelEndpoint::File {
                path: file_channel.path().to_path_buf(),
            };
            let request = make_request(&endpoint);
            info!("run {run_id}: {} (file)", request.command_line());

            let spawned = spawn(&request).await;
            let watchdog = arm_watchdog(registry, &request, &spawned);

            let raced = tokio::select! {
                biased;
                wait = file_channel.wait(spawned.exit.clone()) => match wait {
                    Ok(FileWait::Delivered(result)) => Raced::Delivered(result),
                    Ok(FileWait::Exited(code)) => Raced::Exited(code),
                    // Invalid payload is terminal in file mode.
                    Err(err) => Raced::Failed(err),
                },
                err = watchdog.expired() => Raced::Inactive(err),
            };

            settle(registry, run_id, &request, spawned, raced).await
        }
    }
}

fn arm_watchdog(
    registry: &RunnerRegistry,
    request: &RunRequest,
    spawned: &SpawnedProcess,
) -> Watchdog {
    let window = request
        .inactivity_timeout
        .or_else(|| registry.config().inactivity_timeout());
    Watchdog::arm(window, spawned.activity.clone())
}

/// Common tail of every run: terminate the process tree, then map the race
/// outcome. Fatal conditions are logged with the run's context prefix
/// before propagation so concurrent runs stay traceable in aggregate logs.
async fn settle(
    registry: &RunnerRegistry,
    run_id: u64,
    request: &RunRequest,
    spawned: SpawnedProcess,
    raced: Raced,
) -> Result<AgentRun> {
    let grace = match raced {
        // The watchdog already decided the process is wedged.
        Raced::Inactive(_) => Duration::ZERO,
        _ => request
            .grace_period
            .unwrap_or_else(|| registry.config().grace_period()),
    };
    registry
        .planner()
        .terminate(&spawned.handle, spawned.exit.clone(), grace)
        .await;

    let output = spawned.output.snapshot();
    match raced {
        Raced::Delivered(result) => Ok(AgentRun {
            run_id,
            result,
            exit_code: spawned.handle.exit_code(),
            output,
        }),
        Raced::Exited(code) => {
            let err = Error::PrematureExit { code };
            logctx::emit(&err.to_string());
            Err(err)
        }
        Raced::Inactive(err) | Raced::Failed(err) => {
            logctx::emit(&err.to_string());
            Err(err)
        }
    }
}

/// Run an auxiliary command (test runner, linter) through the shared
/// auxiliary pool. No result channel: the outcome is the exit code and the
/// accumulated output. Lines are logged under an incrementing bracketed id.
pub async fn run_command(registry: &RunnerRegistry, request: RunRequest) -> Result<CommandOutcome> {
    registry
        .pools()
        .run(AUX_POOL_KEY, async {
            let run_id = registry.next_run_id();
            let scope = LogContext::new().with_prefix(format!("[{run_id}]"));
            logctx::with_context(scope, async {
                info!("command {run_id}: {}", request.command_line());
                let spawned = spawn(&request).await;
                let watchdog = arm_watchdog(registry, &request, &spawned);
                let mut exit = spawned.exit.clone();

                let raced = tokio::select! {
                    biased;
                    code = &mut exit => Ok(code),
                    err = watchdog.expired() => Err(err),
                };

                let grace = match &raced {
                    Ok(_) => request
                        .grace_period
                        .unwrap_or_else(|| registry.config().grace_period()),
                    Err(_) => Duration::ZERO,
                };
                registry
                    .planner()
                    .terminate(&spawned.handle, spawned.exit.clone(), grace)
                    .await;

                match raced {
                    Ok(exit_code) => Ok(CommandOutcome {
                        run_id,
                        exit_code,
                        output: spawned.output.snapshot(),
                    }),
                    Err(err) => {
                        logctx::emit(&err.to_string());
                        Err(err)
                    }
                }
            })
            .await
        })
        .await
}
