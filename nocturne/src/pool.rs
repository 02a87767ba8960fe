//! Fixed worker pool over a shared task queue.
//!
//! Workers are detached; they hold an `Arc` to the queue state, so in-flight
//! tasks finish even if the pool handle is dropped first. Dropping the handle
//! flips `closed` and wakes everyone; idle workers then exit.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

pub type Task = Box<dyn FnOnce() + Send>;

struct PoolState {
    tasks: VecDeque<Task>,
    closed: bool,
}

struct Shared {
    state: Mutex<PoolState>,
    cond: Condvar,
}

pub struct ThreadPool {
    shared: Arc<Shared>,
}

impl ThreadPool {
    pub fn new(threads: usize) -> Self {
        assert!(threads > 0);
        let shared = Arc::new(Shared {
            state: Mutex::new(PoolState {
                tasks: VecDeque::new(),
                closed: false,
            }),
            cond: Condvar::new(),
        });

        for i in 0..threads {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name(format!("nocturne-worker-{}", i))
                .spawn(move || worker_loop(shared))
                .expect("failed to spawn worker thread");
        }

        Self { shared }
    }

    /// Enqueue a task and wake one worker.
    pub fn submit<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut state = self.shared.state.lock().unwrap();
            if state.closed {
                return;
            }
            state.tasks.push_back(Box::new(task));
        }
        self.shared.cond.notify_one();
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            state.closed = true;
        }
        self.shared.cond.notify_all();
    }
}

fn worker_loop(shared: Arc<Shared>) {
    let mut state = shared.state.lock().unwrap();
    loop {
        if let Some(task) = state.tasks.pop_front() {
            drop(state);
            task();
            state = shared.state.lock().unwrap();
        } else if state.closed {
            break;
        } else {
            state = shared.cond.wait(state).unwrap();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_tasks_all_run() {
        let pool = ThreadPool::new(4);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..100 {
            let counter = Arc::clone(&counter);
            pool.submit(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while counter.load(Ordering::SeqCst) < 100 {
            assert!(std::time::Instant::now() < deadline, "tasks did not finish");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_in_flight_tasks_survive_drop() {
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let pool = ThreadPool::new(2);
            for _ in 0..8 {
                let counter = Arc::clone(&counter);
                pool.submit(move || {
                    thread::sleep(Duration::from_millis(5));
                    counter.fetch_add(1, Ordering::SeqCst);
                });
            }
            // Handle dropped while the queue is still draining.
        }
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while counter.load(Ordering::SeqCst) < 8 {
            assert!(std::time::Instant::now() < deadline, "queued tasks were lost");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_submit_after_close_is_dropped() {
        let pool = ThreadPool::new(1);
        {
            let mut state = pool.shared.state.lock().unwrap();
            state.closed = true;
        }
        pool.submit(|| panic!("must not run"));
        thread::sleep(Duration::from_millis(20));
    }
}
