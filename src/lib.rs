// vaultd-core: elastic worker-pool scheduler, delay-scheduling timer queue,
// and per-connection send queue for the vaultd storage/compute server.

// Lint is relaxed under `cfg(test)` since test assertions legitimately use
// unwrap/expect; production code paths must never panic on a recoverable
// error (see error.rs and the scheduler's failure semantics).
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]

pub mod config;
pub mod error;
pub mod job;
pub mod scheduler;
pub mod sendq;
mod semaphore;
pub mod stats;

pub use config::{PoolConfig, SendQueueConfig};
pub use error::{SchedError, SchedResult};
pub use job::{FnJob, Job};
pub use scheduler::Scheduler;
pub use sendq::{Link, Transport};
pub use stats::SchedulerStats;

/// Install a `tracing` subscriber honoring `RUST_LOG`. Call once from an
/// embedder's entry point before starting a `Scheduler`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).try_init();
}
