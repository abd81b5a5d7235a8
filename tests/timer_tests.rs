use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use vaultd_core::{FnJob, Job, PoolConfig, Scheduler};

fn now_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs()
}

#[test]
fn delayed_jobs_fire_in_deadline_order() {
    let sched = Scheduler::new(PoolConfig { workers_min: 2, workers_max: 4, workers_sticky: 2, max_idle_interval_secs: 60 });
    sched.start();

    let order: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));
    let base = now_secs();

    for (delay, tag) in [(3u64, 3u32), (1, 1), (2, 2)] {
        let order = order.clone();
        sched.submit_delayed(
            Arc::new(FnJob::new("timed", move || {
                order.lock().unwrap().push(tag);
            })),
            base + delay,
        );
    }

    let deadline = Instant::now() + Duration::from_secs(5);
    while order.lock().unwrap().len() < 3 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(50));
    }

    assert_eq!(*order.lock().unwrap(), vec![1, 2, 3]);
    sched.stop();
}

#[test]
fn cancel_before_fire_prevents_execution() {
    let sched = Scheduler::new(PoolConfig { workers_min: 2, workers_max: 4, workers_sticky: 2, max_idle_interval_secs: 60 });
    sched.start();

    let ran = Arc::new(AtomicUsize::new(0));
    let ran2 = ran.clone();
    let job: Arc<dyn Job> = Arc::new(FnJob::new("never", move || {
        ran2.fetch_add(1, Ordering::SeqCst);
    }));

    sched.submit_delayed(job.clone(), now_secs() + 5);
    assert!(sched.cancel(&job));

    std::thread::sleep(Duration::from_secs(6));
    assert_eq!(ran.load(Ordering::SeqCst), 0);

    sched.stop();
}

#[test]
fn cancel_unknown_job_is_a_harmless_no_op() {
    let sched = Scheduler::new(PoolConfig::default());
    sched.start();

    let job: Arc<dyn Job> = Arc::new(FnJob::new("unsubmitted", || {}));
    assert!(!sched.cancel(&job));

    sched.stop();
}
