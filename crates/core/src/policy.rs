// Run admission, timeout and retry policy for the orchestration service

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Limits and retry behaviour applied to every triggered run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionPolicy {
    /// Runs allowed to execute at the same time, system-wide
    pub max_concurrent_runs: usize,
    /// How long a trigger waits for a free slot before failing with `SystemBusy`
    pub admission_wait: Duration,
    /// Deadline shared by all attempts of one run
    pub run_timeout: Duration,
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// Linear backoff unit: attempt `n + 1` waits `n * retry_backoff`
    pub retry_backoff: Duration,
    /// Carry successful tasks over into retry attempts instead of re-running them
    pub skip_succeeded_on_retry: bool,
}

impl Default for ExecutionPolicy {
    fn default() -> Self {
        Self {
            max_concurrent_runs: 20,
            admission_wait: Duration::from_secs(30),
            run_timeout: Duration::from_secs(60 * 60),
            max_attempts: 3,
            retry_backoff: Duration::from_secs(5),
            skip_succeeded_on_retry: false,
        }
    }
}

impl ExecutionPolicy {
    /// Delay before attempt `failed_attempt + 1`, saturating at `Duration::MAX`
    pub fn backoff_after(&self, failed_attempt: u32) -> Duration {
        self.retry_backoff.saturating_mul(failed_attempt)
    }
}
