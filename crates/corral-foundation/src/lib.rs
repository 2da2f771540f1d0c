//! # corral-foundation
//!
//! Foundation layer for Corral:
//! - Error: central error taxonomy for agent runs
//! - Config: runner configuration (timeouts, grace periods, concurrency)

pub mod config;
pub mod error;

// ============================================================================
// Error
// ============================================================================
pub use error::{Error, Result};

// ============================================================================
// Config
// ============================================================================
pub use config::{
    RunnerConfig, DEFAULT_AGENT_CONCURRENCY, DEFAULT_AUX_CONCURRENCY, DEFAULT_GRACE_PERIOD_MS,
    DEFAULT_SIGTERM_WAIT_MS,
};
