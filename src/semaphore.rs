//! A plain counting semaphore with an explicit wake-one/wake-all distinction
//! on `post`, used by the task-queue thread pool to gate worker wakeups and
//! by the poller's `sync`/`sync_first` to block a caller until its submitted
//! closure has run.

use parking_lot::{Condvar, Mutex};

/// Counting semaphore. `post(1)` wakes a single waiter; `post(n)` for `n > 1`
/// wakes every current waiter, matching the distinction the original
/// implementation draws between `notify_one` and `notify_all`.
pub struct Semaphore {
    count: Mutex<usize>,
    condition: Condvar,
}

impl Semaphore {
    /// A new semaphore with a zero count.
    pub fn new() -> Self {
        Self {
            count: Mutex::new(0),
            condition: Condvar::new(),
        }
    }

    /// Increment the count by `num` and wake waiters: a single waiter when
    /// `num == 1`, every waiter when `num > 1`.
    pub fn post(&self, num: usize) {
        let mut count = self.count.lock();
        *count += num;
        drop(count);
        if num == 1 {
            self.condition.notify_one();
        } else {
            self.condition.notify_all();
        }
    }

    /// Block until the count is non-zero, then decrement it.
    pub fn wait(&self) {
        let mut count = self.count.lock();
        while *count == 0 {
            self.condition.wait(&mut count);
        }
        *count -= 1;
    }

    /// Decrement and return `true` if the count is already non-zero;
    /// otherwise return `false` without blocking.
    pub fn try_wait(&self) -> bool {
        let mut count = self.count.lock();
        if *count == 0 {
            return false;
        }
        *count -= 1;
        true
    }
}

impl Default for Semaphore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn post_then_wait_does_not_block() {
        let sem = Semaphore::new();
        sem.post(1);
        sem.wait();
    }

    #[test]
    fn post_one_wakes_single_waiter() {
        let sem = Arc::new(Semaphore::new());
        let s1 = Arc::clone(&sem);
        let handle = thread::spawn(move || {
            s1.wait();
        });
        thread::sleep(Duration::from_millis(20));
        sem.post(1);
        handle.join().unwrap();
    }

    #[test]
    fn post_n_wakes_n_waiters() {
        let sem = Arc::new(Semaphore::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let s = Arc::clone(&sem);
                thread::spawn(move || s.wait())
            })
            .collect();
        thread::sleep(Duration::from_millis(20));
        sem.post(4);
        for h in handles {
            h.join().unwrap();
        }
    }
}
