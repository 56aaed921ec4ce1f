//! The fixed-size set of worker threads behind every pool.
//!
//! Workers pull jobs from one shared FIFO queue guarded by a mutex, sleeping on
//! a condvar while it is empty. There is no work stealing and no priority: the
//! queue is the only structure callers mutate concurrently.

use alloc::collections::VecDeque;
use alloc::format;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::AtomicUsize;
use core::sync::atomic::Ordering;
use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::mpsc;
use std::thread::Builder as ThreadBuilder;
use std::thread::JoinHandle;

use tracing::debug;
use tracing::trace;
use tracing::warn;

use crate::job::JobRef;
use crate::region;
use crate::thread_pool::Role;
use crate::unwind;

/// Source of pool identifiers. Zero is reserved for "not a pool thread".
static NEXT_POOL_ID: AtomicUsize = AtomicUsize::new(1);

/// A fixed-size set of long-lived worker threads consuming a job queue.
///
/// Dropping the pool halts and joins every worker. Jobs already queued at that
/// point are still executed before the workers exit.
pub struct WorkerPool {
    id: usize,
    role: Role,
    shared: Arc<Shared>,
    threads: Vec<JoinHandle<()>>,
}

/// State shared between the pool handle and its workers.
struct Shared {
    state: Mutex<QueueState>,
    job_is_ready: Condvar,
}

struct QueueState {
    jobs: VecDeque<JobRef>,
    halt: bool,
}

/// A cloneable handle that can queue jobs on a pool. Used by async task
/// schedulers, which must be `'static`.
#[derive(Clone)]
pub struct Injector {
    shared: Arc<Shared>,
}

impl Shared {
    fn push(&self, job_ref: JobRef) {
        let mut state = self.state.lock().unwrap();
        state.jobs.push_back(job_ref);
        drop(state);
        self.job_is_ready.notify_one();
    }
}

impl Injector {
    /// Queues a job on the pool this injector was taken from.
    #[inline]
    pub fn submit(&self, job_ref: JobRef) {
        self.shared.push(job_ref);
    }
}

impl WorkerPool {
    /// Spawns `size` worker threads and waits for all of them to start.
    ///
    /// # Panics
    ///
    /// Panics if `size` is zero or if the operating system refuses to spawn a
    /// thread. Threads spawned before the failure are halted and joined first.
    #[cold]
    pub fn new(role: Role, size: usize) -> WorkerPool {
        assert!(size > 0, "a worker pool needs at least one thread");

        let id = NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed);
        debug!("spawning {} pool {} with {} thread(s)", role, id, size);

        let mut pool = WorkerPool {
            id,
            role,
            shared: Arc::new(Shared {
                state: Mutex::new(QueueState {
                    jobs: VecDeque::new(),
                    halt: false,
                }),
                job_is_ready: Condvar::new(),
            }),
            threads: Vec::with_capacity(size),
        };

        let (started_tx, started_rx) = mpsc::channel();

        for index in 0..size {
            let shared = pool.shared.clone();
            let started = started_tx.clone();
            let spawned = ThreadBuilder::new()
                .name(format!("{role} worker {index}"))
                .spawn(move || {
                    region::set_pool_id(id);
                    // The pool may already be gone if a later spawn failed.
                    let _ = started.send(());
                    worker_loop(&shared);
                });
            match spawned {
                Ok(handle) => pool.threads.push(handle),
                // Unwinding drops `pool`, which halts and joins the threads
                // spawned so far.
                Err(error) => panic!("failed to spawn {role} worker {index}: {error}"),
            }
        }

        // Wait for the threads to start.
        for _ in 0..size {
            let _ = started_rx.recv();
        }

        pool
    }

    /// Returns the fixed number of worker threads.
    #[inline]
    pub fn size(&self) -> usize {
        self.threads.len()
    }

    /// Returns true if the calling thread is one of this pool's workers.
    #[inline]
    pub fn is_current_thread_member(&self) -> bool {
        region::is_pool_thread(self.id)
    }

    /// Queues a job for execution by some worker. Never blocks beyond the
    /// queue lock.
    #[inline]
    pub fn submit(&self, job_ref: JobRef) {
        self.shared.push(job_ref);
    }

    /// Returns a handle that can queue jobs on this pool from anywhere.
    pub fn injector(&self) -> Injector {
        Injector {
            shared: self.shared.clone(),
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        debug!("halting {} pool {}", self.role, self.id);

        self.shared.state.lock().unwrap().halt = true;
        // Wake any sleeping workers so they see the halt flag.
        self.shared.job_is_ready.notify_all();

        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }

        debug!("halted {} pool {}", self.role, self.id);
    }
}

// -----------------------------------------------------------------------------
// Main worker loop

/// This is the main loop for a worker thread. Workers run queued jobs in FIFO
/// order and only exit once the pool halts with an empty queue.
fn worker_loop(shared: &Shared) {
    trace!("starting worker");

    loop {
        let mut state = shared.state.lock().unwrap();
        let job_ref = loop {
            if let Some(job_ref) = state.jobs.pop_front() {
                break job_ref;
            }
            if state.halt {
                trace!("exiting worker");
                return;
            }
            state = shared.job_is_ready.wait(state).unwrap();
        };
        drop(state);

        // A panic escaping a job is the job's own failure; the worker survives.
        if let Err(payload) = unwind::halt_unwinding(|| job_ref.execute()) {
            warn!(
                "job panicked on worker thread: {}",
                unwind::payload_message(&payload)
            );
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::job::HeapJob;

    fn heap_job<F: FnOnce() + Send + 'static>(f: F) -> JobRef {
        // SAFETY: Every job built here is submitted to a pool, and pools run
        // all queued jobs before shutting down.
        unsafe { HeapJob::new(f).into_job_ref() }
    }

    #[test]
    fn size_is_fixed() {
        let pool = WorkerPool::new(Role::InterOp, 3);
        assert_eq!(pool.size(), 3);
    }

    #[test]
    #[should_panic(expected = "at least one thread")]
    fn zero_threads_is_rejected() {
        WorkerPool::new(Role::InterOp, 0);
    }

    #[test]
    fn submitted_jobs_run_on_workers() {
        let pool = WorkerPool::new(Role::InterOp, 2);
        let (sender, receiver) = mpsc::channel();
        for i in 0..10 {
            let sender = sender.clone();
            pool.submit(heap_job(move || {
                sender.send(i).unwrap();
            }));
        }
        let mut received: Vec<i32> = receiver.iter().take(10).collect();
        received.sort_unstable();
        assert_eq!(received, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn workers_are_pool_members() {
        let pool = WorkerPool::new(Role::IntraOp, 1);
        assert!(!pool.is_current_thread_member());
        let (sender, receiver) = mpsc::channel();
        let id = pool.id;
        pool.submit(heap_job(move || {
            sender.send(region::is_pool_thread(id)).unwrap();
        }));
        assert!(receiver.recv().unwrap());
    }

    #[test]
    fn panicking_job_does_not_kill_worker() {
        let pool = WorkerPool::new(Role::InterOp, 1);
        let (sender, receiver) = mpsc::channel();
        pool.submit(heap_job(|| panic!("launched job failed")));
        pool.submit(heap_job(move || sender.send("still alive").unwrap()));
        assert_eq!(receiver.recv().unwrap(), "still alive");
    }

    #[test]
    fn drop_runs_queued_jobs() {
        let counter = Arc::new(AtomicUsize::new(0));
        let pool = WorkerPool::new(Role::InterOp, 1);
        for _ in 0..50 {
            let counter = counter.clone();
            pool.submit(heap_job(move || {
                counter.fetch_add(1, Ordering::Relaxed);
            }));
        }
        drop(pool);
        assert_eq!(counter.load(Ordering::Relaxed), 50);
    }

    #[test]
    fn injector_outlives_borrow_of_pool() {
        let pool = WorkerPool::new(Role::InterOp, 1);
        let injector = pool.injector();
        let (sender, receiver) = mpsc::channel();
        std::thread::spawn(move || {
            injector.submit(heap_job(move || sender.send(7).unwrap()));
        })
        .join()
        .unwrap();
        assert_eq!(receiver.recv().unwrap(), 7);
    }
}
