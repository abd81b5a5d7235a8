use thiserror::Error;

/// Result alias for the few scheduler operations that can genuinely fail.
pub type SchedResult<T> = Result<T, SchedError>;

/// Errors surfaced across the scheduler/timer/send-queue boundary.
///
/// Most faults this crate encounters (capacity exceeded, queue underflow,
/// overload discard) are absorbed internally and logged rather than
/// propagated — see the ERROR HANDLING DESIGN section of the governing
/// specification. This enum exists only for the calls that must report
/// failure to their caller.
#[derive(Debug, Error)]
pub enum SchedError {
    #[error("fork failed: {0}")]
    ForkFailed(#[source] std::io::Error),

    #[error("failed to spawn {kind} thread: {source}")]
    ThreadSpawnFailed {
        kind: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("send to peer failed: {0}")]
    SendFailed(#[source] std::io::Error),

    #[error("scheduler is shutting down")]
    ShuttingDown,

    #[error("operation not supported on this platform: {0}")]
    Unsupported(&'static str),
}
