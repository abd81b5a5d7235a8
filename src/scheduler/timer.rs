//! Deadline-sorted admission queue. Jobs submitted via `submit_delayed` sit
//! here until their deadline arrives, at which point the timer thread moves
//! them onto the scheduler's ready FIFO.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::{Condvar, Mutex};
use tracing::warn;

use crate::job::Job;

use super::Inner;

/// Upper bound on how long the timer thread sleeps with an empty queue.
const DEFAULT_LONG_WAIT: Duration = Duration::from_secs(3600);

pub(crate) fn now_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

struct TimerEntry {
    job: Arc<dyn Job>,
    scheduled_at: u64,
    seq: u64,
}

struct TimerState {
    entries: Vec<TimerEntry>,
    shutdown: bool,
}

pub(crate) struct TimerQueue {
    state: Mutex<TimerState>,
    cond: Condvar,
    next_seq: AtomicU64,
    scheduler: Mutex<Weak<Inner>>,
}

impl TimerQueue {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(TimerState { entries: Vec::new(), shutdown: false }),
            cond: Condvar::new(),
            next_seq: AtomicU64::new(0),
            scheduler: Mutex::new(Weak::new()),
        }
    }

    pub(crate) fn bind(&self, scheduler: Weak<Inner>) {
        *self.scheduler.lock() = scheduler;
    }

    /// Cancel any existing entry for this exact job, then insert it sorted
    /// by `scheduled_at` (ties broken by insertion order).
    pub(crate) fn schedule(&self, job: Arc<dyn Job>, scheduled_at: u64) {
        let mut state = self.state.lock();
        Self::remove_locked(&mut state, &job);

        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let pos = state
            .entries
            .partition_point(|e| e.scheduled_at < scheduled_at);
        let was_head = pos == 0;
        state.entries.insert(pos, TimerEntry { job, scheduled_at, seq });
        if was_head {
            self.cond.notify_one();
        }
    }

    /// Remove a job by exact pointer identity. Returns `true` if it was
    /// still pending (and therefore will never execute).
    pub(crate) fn cancel(&self, job: &Arc<dyn Job>) -> bool {
        let mut state = self.state.lock();
        Self::remove_locked(&mut state, job)
    }

    fn remove_locked(state: &mut TimerState, job: &Arc<dyn Job>) -> bool {
        if let Some(idx) = state.entries.iter().position(|e| Arc::ptr_eq(&e.job, job)) {
            state.entries.remove(idx);
            true
        } else {
            false
        }
    }

    pub(crate) fn shutdown(&self) {
        let mut state = self.state.lock();
        state.shutdown = true;
        self.cond.notify_all();
    }

    /// The timer thread's main loop.
    pub(crate) fn run(self: &Arc<TimerQueue>) {
        loop {
            let mut state = self.state.lock();
            if state.shutdown {
                return;
            }

            let wait = match state.entries.first() {
                None => DEFAULT_LONG_WAIT,
                Some(head) => {
                    let now = now_secs();
                    if head.scheduled_at <= now {
                        Duration::ZERO
                    } else {
                        Duration::from_secs(head.scheduled_at - now)
                    }
                }
            };

            if wait > Duration::ZERO {
                self.cond.wait_for(&mut state, wait);
                continue;
            }

            let entry = state.entries.remove(0);
            drop(state);

            let scheduler = self.scheduler.lock().upgrade();
            match scheduler {
                Some(inner) => inner.admit_ready(entry.job),
                None => warn!("timer fired after scheduler was dropped, job discarded"),
            }
        }
    }
}
