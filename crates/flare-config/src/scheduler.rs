use flare_dsl::WindowDuration;
use serde::Deserialize;

/// Scheduler and worker-pool knobs. All fields have defaults so the entire
/// `[scheduler]` section may be omitted.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// How often the scheduler enqueues evaluation jobs for active signals.
    pub tick_interval: WindowDuration,
    /// Number of worker tasks consuming the job queue.
    pub workers: usize,
    /// Upper bound on concurrent per-chain RPC evaluations across all jobs.
    pub chain_parallelism: usize,
    /// Hard deadline for one evaluation job; an expired job commits nothing.
    pub job_deadline: WindowDuration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: WindowDuration::from_secs(60),
            workers: 4,
            chain_parallelism: 8,
            job_deadline: WindowDuration::from_secs(120),
        }
    }
}
