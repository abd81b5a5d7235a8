use std::fmt;

/// A single unit of work the scheduler can run on a worker thread.
///
/// Implementors own whatever state `execute()` needs; the scheduler takes no
/// responsibility for errors raised inside it and never inspects a job's
/// internals beyond this trait.
pub trait Job: Send + Sync {
    /// Run the job. Called exactly once for any job that is successfully
    /// submitted and not cancelled while still on the timer queue.
    fn execute(&self);

    /// Short description used only for diagnostics (stats, log lines).
    fn description(&self) -> &str {
        "job"
    }
}

impl fmt::Debug for dyn Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job").field("description", &self.description()).finish()
    }
}

/// Convenience wrapper for submitting a plain closure as a job.
pub struct FnJob<F: Fn() + Send + Sync> {
    desc: String,
    f: F,
}

impl<F: Fn() + Send + Sync> FnJob<F> {
    pub fn new(desc: impl Into<String>, f: F) -> Self {
        Self { desc: desc.into(), f }
    }
}

impl<F: Fn() + Send + Sync> Job for FnJob<F> {
    fn execute(&self) {
        (self.f)()
    }

    fn description(&self) -> &str {
        &self.desc
    }
}
