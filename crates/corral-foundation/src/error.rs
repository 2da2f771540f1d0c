//! Error types for Corral
//!
//! Every fatal run condition surfaces as a single `Error` from the run
//! functions; the caller decides whether to retry the whole run.

use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Corral error type
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Run lifecycle
    // ========================================================================
    /// The process exited before a result was delivered. Fatal to the run.
    #[error("process exited with code {code} before reporting a result")]
    PrematureExit { code: i32 },

    /// No output was observed within the configured inactivity window.
    #[error("no output for {idle_ms}ms, run declared inactive")]
    InactivityTimeout { idle_ms: u64 },

    /// The agent's result payload was malformed or failed schema validation.
    /// Recoverable in callback mode (the agent may resubmit); terminal in
    /// file mode, where the file is read only once.
    #[error("invalid result payload: {0}")]
    InvalidResultPayload(String),

    /// Signal delivery failed. Logged and handled with a best-effort
    /// fallback; never propagated to run callers.
    #[error("termination failure: {0}")]
    TerminationFailure(String),

    // ========================================================================
    // Channels
    // ========================================================================
    #[error("result channel error: {0}")]
    Channel(String),

    // ========================================================================
    // Configuration / environment
    // ========================================================================
    #[error("configuration error: {0}")]
    Config(String),

    #[error("executable not found: {0}")]
    ExecutableNotFound(String),

    // ========================================================================
    // Passthrough
    // ========================================================================
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// True for conditions that end the run and should be reported to the
    /// caller (as opposed to recoverable payload rejections in callback mode).
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Error::TerminationFailure(_))
    }
}
