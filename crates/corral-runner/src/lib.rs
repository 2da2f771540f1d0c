//! # corral-runner
//!
//! Agent process execution core for Corral. Launches long-running external
//! agent CLIs, waits for a structured result, and guarantees every launched
//! process tree is eventually cleaned up - even if it hangs, is killed out
//! of band, or never reports.
//!
//! ## Features
//!
//! - Bounded concurrent execution via per-tool pools
//! - Result delivery over a transient HTTP callback or a polled file
//! - Inactivity watchdog with immediate termination on expiry
//! - Cross-platform process-tree termination (SIGTERM -> SIGKILL)
//! - Nested logging contexts attributing interleaved output to runs

pub mod channel;
pub mod linebuf;
pub mod logctx;
pub mod pool;
pub mod registry;
pub mod request;
pub mod runner;
pub mod spawn;
pub mod terminate;
pub mod watchdog;

// Run orchestration
pub use registry::RunnerRegistry;
pub use runner::{
    run_agent, run_command, AgentRun, ChannelConfig, ChannelEndpoint, CommandOutcome,
};

// Requests and spawning
pub use request::{OutputBuffer, OutputMode, RunRequest, StreamKind};
pub use spawn::{spawn, ExitFuture, RunHandle, SpawnedProcess, SYNTHETIC_EXIT_CODE};

// Result channels
pub use channel::{
    AgentResult, CallbackServer, FileResultChannel, FileWait, PayloadFormat, ResultSchema,
    TypedSchema, CALLBACK_PATH,
};

// Termination
pub use terminate::{
    Platform, Strategy, TermSignal, TerminationMode, TerminationPlan, TerminationPlanner,
};

// Concurrency
pub use pool::{PoolRegistry, AUX_POOL_KEY};

// Logging context
pub use logctx::{
    with_context, ConsoleSink, FileSink, LogContext, LogSink, MemorySink,
};

// Line buffering
pub use linebuf::LineBuffer;

// Watchdog
pub use watchdog::Watchdog;

// Re-export the foundation error/result for downstream convenience
pub use corral_foundation::{Error, Result, RunnerConfig};
