use serde::{Deserialize, Serialize};

/// Worker-pool sizing and idle-cull policy.
///
/// Defaults mirror the governing specification's §6 default table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Lower bound on the worker population; never laid off below this.
    pub workers_min: u32,
    /// Upper bound on the worker population; `hire_worker` refuses above this.
    pub workers_max: u32,
    /// Soft reservation: `can_keep_sticky()` uses this to decide whether a
    /// peer may keep a dedicated worker around.
    pub workers_sticky: u32,
    /// Seconds an above-minimum idle worker may sit parked before the idle
    /// monitor considers it for layoff.
    pub max_idle_interval_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        let workers_max: u32 = 8192;
        Self {
            workers_min: 8,
            workers_max,
            workers_sticky: workers_max - (workers_max * 3 / 4),
            max_idle_interval_secs: 780,
        }
    }
}

impl PoolConfig {
    /// Clamp `workers_max` (and proportionally `workers_min`) to an OS-reported
    /// thread ceiling, mirroring the rlimit clamp the reaper performs at
    /// startup. Exposed separately so tests can exercise the clamp logic
    /// without touching the real process rlimit.
    pub fn clamp_to_os_limit(&mut self, os_limit: u32) {
        if self.workers_max > os_limit {
            self.workers_max = os_limit.max(1);
            self.workers_min = self.workers_min.min(self.workers_max).max(1);
            self.workers_sticky = self.workers_sticky.min(self.workers_max);
        }
    }
}

/// Per-connection send-queue tunables. These are process-global: configured
/// once, before any `SendQueue` is created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendQueueConfig {
    /// Discard messages once a queue holds this many already. Default is
    /// effectively unbounded, matching the upstream `qMax` default.
    pub queue_hard_max: u32,
    /// Emit an escalating backlog warning every this-many queued messages.
    pub queue_warn_step: u32,
    /// Whether a slow-peer warning should be considered a permanent
    /// condition (reserved for embedders that want to latch discard state).
    pub queue_perm: bool,
}

impl Default for SendQueueConfig {
    fn default() -> Self {
        Self { queue_hard_max: u32::MAX, queue_warn_step: 3, queue_perm: false }
    }
}
