//! Runner registry
//!
//! Explicit top-level owner of the process-wide mutable state: concurrency
//! pools, the termination planner, the run-id counter, and cached executable
//! resolution. Constructed once and passed by reference into the run
//! functions, so limits are testable in isolation and nothing leaks across
//! tests through module globals.

use crate::pool::PoolRegistry;
use crate::terminate::TerminationPlanner;
use corral_foundation::{Error, Result, RunnerConfig};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tracing::debug;

pub struct RunnerRegistry {
    config: RunnerConfig,
    pools: PoolRegistry,
    planner: TerminationPlanner,
    run_counter: AtomicU64,
    binaries: Mutex<HashMap<String, PathBuf>>,
}

impl RunnerRegistry {
    pub fn new(config: RunnerConfig) -> Self {
        let planner = if config.mock_termination {
            TerminationPlanner::mock()
        } else {
            TerminationPlanner::new(config.sigterm_wait())
        };

        let pools = PoolRegistry::new(config.agent_concurrency);
        pools.set_limit(crate::pool::AUX_POOL_KEY, config.aux_concurrency);
        for (tool, limit) in &config.tool_concurrency {
            pools.set_limit(tool.clone(), *limit);
        }

        Self {
            config,
            pools,
            planner,
            run_counter: AtomicU64::new(0),
            binaries: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    pub fn pools(&self) -> &PoolRegistry {
        &self.pools
    }

    pub fn planner(&self) -> &TerminationPlanner {
        &self.planner
    }

    /// Next bracketed run id, in admission order.
    pub fn next_run_id(&self) -> u64 {
        self.run_counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Resolve an agent tool name to an executable path via `PATH` lookup,
    /// cached per name for the registry's lifetime.
    pub fn resolve_binary(&self, name: &str) -> Result<PathBuf> {
        if let Ok(cache) = self.binaries.lock() {
            if let Some(path) = cache.get(name) {
                return Ok(path.clone());
            }
        }
        let path =
            which::which(name).map_err(|_| Error::ExecutableNotFound(name.to_string()))?;
        debug!("resolved {name} -> {}", path.display());
        if let Ok(mut cache) = self.binaries.lock() {
            cache.insert(name.to_string(), path.clone());
        }
        Ok(path)
    }
}
