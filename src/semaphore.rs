use parking_lot::{Condvar, Mutex};

/// A counting semaphore built on `parking_lot`'s mutex and condvar, since
/// neither std nor parking_lot ship one directly. Used for the ready-queue
/// wake/park protocol and for layoff signaling.
pub struct Semaphore {
    count: Mutex<i64>,
    cond: Condvar,
}

impl Semaphore {
    pub fn new(initial: i64) -> Self {
        Self { count: Mutex::new(initial), cond: Condvar::new() }
    }

    /// Block until a permit is available, then consume it.
    pub fn wait(&self) {
        let mut count = self.count.lock();
        while *count <= 0 {
            self.cond.wait(&mut count);
        }
        *count -= 1;
    }

    /// Release one permit, waking a single waiter if any is parked.
    pub fn post(&self) {
        let mut count = self.count.lock();
        *count += 1;
        self.cond.notify_one();
    }

    /// Release `n` permits, waking up to `n` waiters.
    pub fn post_n(&self, n: u32) {
        if n == 0 {
            return;
        }
        let mut count = self.count.lock();
        *count += n as i64;
        self.cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn wait_blocks_until_post() {
        let sem = Arc::new(Semaphore::new(0));
        let sem2 = sem.clone();
        let handle = std::thread::spawn(move || {
            sem2.wait();
        });
        std::thread::sleep(Duration::from_millis(50));
        assert!(!handle.is_finished());
        sem.post();
        handle.join().unwrap();
    }

    #[test]
    fn post_n_wakes_multiple() {
        let sem = Arc::new(Semaphore::new(0));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let sem = sem.clone();
                std::thread::spawn(move || sem.wait())
            })
            .collect();
        std::thread::sleep(Duration::from_millis(50));
        sem.post_n(4);
        for h in handles {
            h.join().unwrap();
        }
    }
}
