//! # JobQueue — the worker-thread pool
//!
//! A fixed set of worker threads drains one FIFO of boxed jobs guarded by a
//! mutex + condition variable. Submission order is preserved per submitter.
//! A panicking job is caught and logged; the worker keeps going.
//!
//! Lifecycle is `Open -> Draining -> Stopped`, one way only: `shutdown()`
//! wakes every worker, waits for whatever is mid-execution, and discards
//! jobs that never started.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum QueuePhase {
    Open,
    Draining,
    Stopped,
}

struct QueueState {
    jobs: VecDeque<Job>,
    phase: QueuePhase,
}

struct Shared {
    state: Mutex<QueueState>,
    available: Condvar,
}

/// Pool of worker threads executing submitted jobs FIFO.
pub struct JobQueue {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl JobQueue {
    /// Spawn `worker_count` workers, ready to execute jobs.
    pub fn new(worker_count: usize) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(QueueState {
                jobs: VecDeque::new(),
                phase: QueuePhase::Open,
            }),
            available: Condvar::new(),
        });

        let mut workers = Vec::with_capacity(worker_count);
        for id in 0..worker_count {
            let shared = shared.clone();
            let handle = thread::Builder::new()
                .name(format!("nisse-worker-{id}"))
                .spawn(move || worker_loop(&shared))
                .expect("failed to spawn worker thread");
            workers.push(handle);
        }

        Self {
            shared,
            workers: Mutex::new(workers),
        }
    }

    /// Enqueue a job and wake one idle worker. Jobs submitted after
    /// shutdown began are discarded.
    pub fn submit<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.shared.state.lock();
        if state.phase != QueuePhase::Open {
            tracing::debug!(target: "nisse::job_queue", "job discarded: queue is shut down");
            return;
        }
        state.jobs.push_back(Box::new(job));
        drop(state);
        self.shared.available.notify_one();
    }

    /// Stop the pool: wake all workers, join them (a worker mid-job finishes
    /// that job first), and discard jobs that never started. Idempotent.
    pub fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock();
            if state.phase != QueuePhase::Open {
                return;
            }
            state.phase = QueuePhase::Draining;
        }
        self.shared.available.notify_all();

        for handle in self.workers.lock().drain(..) {
            let _ = handle.join();
        }

        let mut state = self.shared.state.lock();
        let discarded = state.jobs.len();
        state.jobs.clear();
        state.phase = QueuePhase::Stopped;
        if discarded > 0 {
            tracing::debug!(target: "nisse::job_queue", discarded, "jobs discarded at shutdown");
        }
    }
}

impl Drop for JobQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: &Shared) {
    loop {
        let job = {
            let mut state = shared.state.lock();
            loop {
                if state.phase != QueuePhase::Open {
                    return;
                }
                if let Some(job) = state.jobs.pop_front() {
                    break job;
                }
                shared.available.wait(&mut state);
            }
        };

        if let Err(panic) = catch_unwind(AssertUnwindSafe(job)) {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_string());
            tracing::warn!(target: "nisse::job_queue", %message, "job panicked");
        }
    }
}
