//! The elastic worker-pool job scheduler.
//!
//! Lock order when more than one of `{ready, dispatch, params}` is held at
//! once: `ready -> dispatch -> params`. The idle counter lives in its own
//! `dispatch` mutex, distinct from `ready`, precisely so a worker waking up
//! to decrement its idle count never contends with a producer holding
//! `ready` to append a job.

pub mod timer;

#[cfg(unix)]
mod reaper;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::warn;

use crate::config::PoolConfig;
use crate::error::SchedResult;
use crate::job::Job;
use crate::semaphore::Semaphore;
use crate::stats::SchedulerStats;

use timer::TimerQueue;

/// Every Nth capacity-exceeded event gets a log line instead of all of them.
const CAPACITY_LOG_EVERY: u64 = 4096;

struct ReadyState {
    queue: VecDeque<Arc<dyn Job>>,
}

struct DispatchState {
    idle: u32,
    layoffs: u32,
}

struct PoolParams {
    workers: u32,
    min: u32,
    max: u32,
    sticky: u32,
    max_idle: Duration,
    params_set_once: bool,
}

#[derive(Default)]
struct Counters {
    total_submitted: AtomicU64,
    max_depth_ever: AtomicU64,
    total_created: AtomicU64,
    total_destroyed: AtomicU64,
    capacity_limited_events: AtomicU64,
}

/// The idle monitor is itself a job: every `max_idle` seconds it checks
/// whether the pool is carrying more idle workers than `workers_min` and, if
/// so, lays off half the excess, then re-submits itself.
struct IdleMonitor {
    inner: Weak<Inner>,
}

impl Job for IdleMonitor {
    fn execute(&self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.run_idle_monitor();
        }
    }

    fn description(&self) -> &str {
        "idle monitor"
    }
}

pub(crate) struct Inner {
    ready: Mutex<ReadyState>,
    ready_sem: Semaphore,
    dispatch: Mutex<DispatchState>,
    params: Mutex<PoolParams>,
    counters: Counters,
    timer: Arc<TimerQueue>,
    #[cfg(unix)]
    reaper: Arc<reaper::Reaper>,
    idle_monitor: Arc<IdleMonitor>,
    shutdown: AtomicBool,
    started: AtomicBool,
    worker_threads: Mutex<Vec<JoinHandle<()>>>,
    timer_thread: Mutex<Option<JoinHandle<()>>>,
}

impl Inner {
    fn push_ready(self: &Arc<Self>, job: Arc<dyn Job>) {
        let depth = {
            let mut ready = self.ready.lock();
            ready.queue.push_back(job);
            ready.queue.len() as u64
        };
        self.counters.total_submitted.fetch_add(1, Ordering::Relaxed);
        self.counters.max_depth_ever.fetch_max(depth, Ordering::Relaxed);
        self.ready_sem.post();
    }

    /// Entry point the timer thread uses to hand a due job to the ready FIFO.
    pub(crate) fn admit_ready(self: &Arc<Self>, job: Arc<dyn Job>) {
        self.push_ready(job);
    }

    fn hire_worker(self: &Arc<Self>) {
        {
            let mut params = self.params.lock();
            if params.workers >= params.max {
                drop(params);
                let n = self.counters.capacity_limited_events.fetch_add(1, Ordering::Relaxed) + 1;
                if n % CAPACITY_LOG_EVERY == 0 {
                    warn!(events = n, max = self.params.lock().max, "worker pool at capacity");
                }
                return;
            }
            params.workers += 1;
        }

        self.counters.total_created.fetch_add(1, Ordering::Relaxed);
        let inner = self.clone();
        match std::thread::Builder::new().name("sched-worker".into()).spawn(move || inner.worker_loop()) {
            Ok(handle) => self.worker_threads.lock().push(handle),
            Err(e) => {
                warn!(error = %e, "failed to spawn worker thread; lowering pool ceiling");
                self.counters.total_created.fetch_sub(1, Ordering::Relaxed);
                let mut params = self.params.lock();
                params.workers = params.workers.saturating_sub(1);
                params.max = params.workers.max(1);
                params.min = (params.max / 10).max(1);
            }
        }
    }

    fn worker_loop(self: Arc<Self>) {
        loop {
            {
                let mut dispatch = self.dispatch.lock();
                dispatch.idle += 1;
            }

            self.ready_sem.wait();

            let waiting_after = {
                let mut dispatch = self.dispatch.lock();
                dispatch.idle = dispatch.idle.saturating_sub(1);
                dispatch.idle
            };

            if self.shutdown.load(Ordering::SeqCst) {
                self.retire();
                return;
            }

            let job = {
                let mut ready = self.ready.lock();
                ready.queue.pop_front()
            };

            let job = match job {
                Some(job) => job,
                None => {
                    let should_retire = {
                        let mut dispatch = self.dispatch.lock();
                        if dispatch.layoffs > 0 && waiting_after > 0 {
                            dispatch.layoffs -= 1;
                            true
                        } else {
                            false
                        }
                    };
                    if should_retire {
                        self.retire();
                        return;
                    }
                    continue;
                }
            };

            // Keep-one-idle: if dispatching this job would leave no idle
            // worker behind, try to hire one before running it.
            if waiting_after == 0 {
                self.hire_worker();
            }

            job.execute();
        }
    }

    fn retire(self: &Arc<Self>) {
        let mut params = self.params.lock();
        params.workers = params.workers.saturating_sub(1);
        drop(params);
        self.counters.total_destroyed.fetch_add(1, Ordering::Relaxed);
    }

    fn run_idle_monitor(self: &Arc<Self>) {
        let ready_empty = self.ready.lock().queue.is_empty();
        if ready_empty {
            let (extra,) = {
                let dispatch = self.dispatch.lock();
                let params = self.params.lock();
                (dispatch.idle.saturating_sub(params.min),)
            };
            if extra > 1 {
                let layoffs = extra / 2;
                {
                    let mut dispatch = self.dispatch.lock();
                    dispatch.layoffs = layoffs;
                }
                self.ready_sem.post_n(layoffs);
            }
        }
        self.reschedule_idle_monitor();
    }

    fn reschedule_idle_monitor(self: &Arc<Self>) {
        if self.shutdown.load(Ordering::SeqCst) {
            return;
        }
        let interval = self.params.lock().max_idle;
        let deadline = timer::now_secs() + interval.as_secs().max(1);
        self.timer.schedule(self.idle_monitor.clone(), deadline);
    }
}

/// Handle to the elastic worker-pool scheduler. Cheap to clone; all clones
/// share the same underlying pool.
#[derive(Clone)]
pub struct Scheduler(Arc<Inner>);

impl Scheduler {
    pub fn new(mut config: PoolConfig) -> Self {
        #[cfg(unix)]
        config.clamp_to_os_limit(reaper::nproc_ceiling());

        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| {
            let timer = Arc::new(TimerQueue::new());
            timer.bind(weak.clone());
            let idle_monitor = Arc::new(IdleMonitor { inner: weak.clone() });
            Inner {
                ready: Mutex::new(ReadyState { queue: VecDeque::new() }),
                ready_sem: Semaphore::new(0),
                dispatch: Mutex::new(DispatchState { idle: 0, layoffs: 0 }),
                params: Mutex::new(PoolParams {
                    workers: 0,
                    min: config.workers_min,
                    max: config.workers_max,
                    sticky: config.workers_sticky,
                    max_idle: Duration::from_secs(config.max_idle_interval_secs),
                    params_set_once: false,
                }),
                counters: Counters::default(),
                timer,
                #[cfg(unix)]
                reaper: Arc::new(reaper::Reaper::new()),
                idle_monitor,
                shutdown: AtomicBool::new(false),
                started: AtomicBool::new(false),
                worker_threads: Mutex::new(Vec::new()),
                timer_thread: Mutex::new(None),
            }
        });
        Scheduler(inner)
    }

    /// Append a job to the ready FIFO. Never blocks.
    pub fn submit(&self, job: Arc<dyn Job>) {
        self.0.push_ready(job);
    }

    /// Splice a batch of jobs onto the ready FIFO in one locked pass.
    pub fn submit_batch(&self, jobs: Vec<Arc<dyn Job>>) {
        let n = jobs.len();
        if n == 0 {
            return;
        }
        let depth = {
            let mut ready = self.0.ready.lock();
            ready.queue.extend(jobs);
            ready.queue.len() as u64
        };
        self.0.counters.total_submitted.fetch_add(n as u64, Ordering::Relaxed);
        self.0.counters.max_depth_ever.fetch_max(depth, Ordering::Relaxed);
        self.0.ready_sem.post_n(n as u32);
    }

    /// Admit `job` for execution at or after `scheduled_at` (unix epoch
    /// seconds). Replaces any still-pending timer entry for the same job.
    pub fn submit_delayed(&self, job: Arc<dyn Job>, scheduled_at: u64) {
        self.0.timer.schedule(job, scheduled_at);
    }

    /// Cancel a job still sitting on the timer queue. Returns `false` if it
    /// was not found there (already dispatched, or never submitted here).
    pub fn cancel(&self, job: &Arc<dyn Job>) -> bool {
        self.0.timer.cancel(job)
    }

    pub fn stats(&self) -> SchedulerStats {
        let depth = self.0.ready.lock().queue.len() as u64;
        let (workers, idle) = {
            let dispatch = self.0.dispatch.lock();
            let params = self.0.params.lock();
            (params.workers, dispatch.idle)
        };
        SchedulerStats {
            total_submitted: self.0.counters.total_submitted.load(Ordering::Relaxed),
            depth,
            max_depth_ever: self.0.counters.max_depth_ever.load(Ordering::Relaxed),
            workers,
            idle,
            total_created: self.0.counters.total_created.load(Ordering::Relaxed),
            total_destroyed: self.0.counters.total_destroyed.load(Ordering::Relaxed),
            capacity_limited_events: self.0.counters.capacity_limited_events.load(Ordering::Relaxed),
        }
    }

    /// Update worker-pool policy. If `once` is set and a prior `once` call
    /// already landed, this call is a no-op. Re-arms the idle-monitor job at
    /// the new `max_idle` interval so a shortened interval takes effect
    /// immediately rather than waiting out the previously scheduled tick.
    pub fn set_params(&self, min: u32, max: u32, sticky: u32, max_idle: Duration, once: bool) {
        let mut params = self.0.params.lock();
        if once && params.params_set_once {
            return;
        }
        params.min = min;
        params.max = max.max(min);
        params.sticky = sticky;
        params.max_idle = max_idle;
        if once {
            params.params_set_once = true;
        }
        drop(params);

        let idle_monitor: Arc<dyn Job> = self.0.idle_monitor.clone();
        self.0.timer.cancel(&idle_monitor);
        self.0.reschedule_idle_monitor();
    }

    /// Launch the timer thread and the initial worker population. Must be
    /// called exactly once; subsequent calls are no-ops.
    pub fn start(&self) {
        if self.0.started.swap(true, Ordering::SeqCst) {
            return;
        }

        let initial = {
            let params = self.0.params.lock();
            (params.min / 3).max(2).min(params.max)
        };
        for _ in 0..initial {
            self.0.hire_worker();
        }

        let timer = self.0.timer.clone();
        match std::thread::Builder::new().name("sched-timer".into()).spawn(move || timer.run()) {
            Ok(handle) => *self.0.timer_thread.lock() = Some(handle),
            Err(e) => warn!(error = %e, "failed to spawn timer thread; delayed jobs will never fire"),
        }

        self.0.reschedule_idle_monitor();
    }

    /// Flip the shutdown flag, wake every parked worker and the timer
    /// thread so each observes it, and join everything this scheduler
    /// spawned. The reaper thread (if any) is intentionally left running:
    /// like the system this crate is extracted from, child reaping is
    /// treated as a process-lifetime concern, not a per-scheduler one.
    pub fn stop(&self) {
        self.0.shutdown.store(true, Ordering::SeqCst);
        self.0.timer.shutdown();

        let worker_count = self.0.params.lock().workers.max(1);
        self.0.ready_sem.post_n(worker_count);

        let mut threads = self.0.worker_threads.lock();
        for handle in threads.drain(..) {
            let _ = handle.join();
        }

        if let Some(handle) = self.0.timer_thread.lock().take() {
            let _ = handle.join();
        }
    }

    /// `workers - idle + depth`: a live "how busy is this pool" figure.
    pub fn active_count(&self) -> i64 {
        let depth = self.0.ready.lock().queue.len() as i64;
        let dispatch = self.0.dispatch.lock();
        let params = self.0.params.lock();
        params.workers as i64 - dispatch.idle as i64 + depth
    }

    /// Whether the pool has room under `workers_sticky` to dedicate a
    /// worker to a single long-lived caller.
    pub fn can_keep_sticky(&self) -> bool {
        let dispatch = self.0.dispatch.lock();
        let params = self.0.params.lock();
        params.workers < params.sticky || (params.workers.saturating_sub(dispatch.idle)) < params.sticky
    }

    #[cfg(unix)]
    pub fn fork_with_reap(&self, description: &str) -> SchedResult<libc::pid_t> {
        self.0.reaper.fork_with_reap(description)
    }

    #[cfg(not(unix))]
    pub fn fork_with_reap(&self, _description: &str) -> SchedResult<i32> {
        Err(crate::error::SchedError::Unsupported("fork_with_reap requires a unix target"))
    }
}
