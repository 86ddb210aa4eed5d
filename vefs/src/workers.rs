//! Background worker pool for deferred archive maintenance.
//!
//! Virtual file erasure and similar cleanup runs off the calling thread. A
//! panicking task is caught at the pool boundary and reported as a failure;
//! it never unwinds into the archive.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{unbounded, Receiver, Sender};
use log::error;
use parking_lot::{Condvar, Mutex};

type Task = Box<dyn FnOnce() + Send + 'static>;

struct PoolShared {
    pending: AtomicUsize,
    idle: Mutex<()>,
    drained: Condvar,
}

/// Fixed-size thread pool; dropping it drains all queued work.
pub struct WorkerPool {
    sender: Option<Sender<Task>>,
    workers: Vec<JoinHandle<()>>,
    shared: Arc<PoolShared>,
}

impl WorkerPool {
    pub fn new(num_workers: usize) -> Self {
        let (sender, receiver): (Sender<Task>, Receiver<Task>) = unbounded();
        let shared = Arc::new(PoolShared {
            pending: AtomicUsize::new(0),
            idle: Mutex::new(()),
            drained: Condvar::new(),
        });

        let workers = (0..num_workers.max(1))
            .map(|worker| {
                let receiver = receiver.clone();
                let shared = Arc::clone(&shared);
                std::thread::Builder::new()
                    .name(format!("vefs-worker-{worker}"))
                    .spawn(move || {
                        while let Ok(task) = receiver.recv() {
                            if catch_unwind(AssertUnwindSafe(task)).is_err() {
                                error!("a background archive task panicked");
                            }
                            if shared.pending.fetch_sub(1, Ordering::AcqRel)
                                == 1
                            {
                                let _guard = shared.idle.lock();
                                shared.drained.notify_all();
                            }
                        }
                    })
                    .expect("spawning a worker thread")
            })
            .collect();

        WorkerPool {
            sender: Some(sender),
            workers,
            shared,
        }
    }

    pub fn execute(&self, task: impl FnOnce() + Send + 'static) {
        self.shared.pending.fetch_add(1, Ordering::AcqRel);
        self.sender
            .as_ref()
            .expect("pool is alive")
            .send(Box::new(task))
            .expect("workers outlive the queue");
    }

    /// Blocks until every queued task has finished.
    pub fn wait(&self) {
        let mut guard = self.shared.idle.lock();
        while self.shared.pending.load(Ordering::Acquire) != 0 {
            self.shared.drained.wait(&mut guard);
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.wait();
        self.sender.take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_blocks_until_tasks_finish() {
        let pool = WorkerPool::new(2);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..16 {
            let counter = Arc::clone(&counter);
            pool.execute(move || {
                counter.fetch_add(1, Ordering::Relaxed);
            });
        }
        pool.wait();
        assert_eq!(counter.load(Ordering::Relaxed), 16);
    }

    #[test]
    fn panicking_tasks_do_not_kill_the_pool() {
        let pool = WorkerPool::new(1);
        pool.execute(|| panic!("task failure"));
        pool.wait();

        let done = Arc::new(AtomicUsize::new(0));
        let probe = Arc::clone(&done);
        pool.execute(move || {
            probe.fetch_add(1, Ordering::Relaxed);
        });
        pool.wait();
        assert_eq!(done.load(Ordering::Relaxed), 1);
    }
}
