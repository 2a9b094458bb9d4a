use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Global knobs that tune orchestrator behaviour.
///
/// All fields carry defaults so callers can adopt individual settings
/// without supplying a full configuration payload.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Size of the worker pool. This bounds the number of scan processes
    /// alive at any moment, independent of how many domains were submitted.
    pub worker_count: usize,
    /// Wall-clock budget applied to jobs whose plan entry carries no
    /// explicit timeout (seconds).
    pub default_job_timeout_secs: u64,
    /// Per-job runner tuning shared by all workers.
    pub runner: RunnerConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            default_job_timeout_secs: 3_600,
            runner: RunnerConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    pub fn default_job_timeout(&self) -> Duration {
        Duration::from_secs(self.default_job_timeout_secs)
    }
}

/// Tuning for a single job's supervision loop.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Cadence at which a runner re-checks its deadline between output
    /// reads (milliseconds). Bounds how stale a stop request can go
    /// unobserved.
    pub poll_interval_ms: u64,
    /// Grace window between SIGTERM and a forced kill (milliseconds).
    pub term_grace_ms: u64,
    /// Upper bound on draining buffered output after the process is torn
    /// down (milliseconds).
    pub drain_timeout_ms: u64,
    /// Capacity of the bounded channel carrying output lines from the
    /// process readers to the supervision loop.
    pub line_capacity: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 500,
            term_grace_ms: 4_000,
            drain_timeout_ms: 1_000,
            line_capacity: 256,
        }
    }
}

impl RunnerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn term_grace(&self) -> Duration {
        Duration::from_millis(self.term_grace_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}
