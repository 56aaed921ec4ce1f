//! Thread pools with a once-only size and lazily spawned workers.
//!
//! A [`ThreadPool`] pairs a [sizing cell](crate::sizing::PoolSize) with a
//! lazily created [`WorkerPool`]. The process has two of them: [`INTRA_OP`]
//! runs fork-join chunks, [`INTER_OP`] runs launched tasks. They differ only
//! in their [`Role`].

use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;
use core::fmt::Write;
use core::future::Future;
use core::num::NonZero;
use core::ptr::NonNull;
use std::sync::OnceLock;

use async_task::Runnable;
use async_task::Task;
use tracing::debug;
use tracing::trace;

use crate::error::Error;
use crate::fork_join;
use crate::fork_join::ChunkPlan;
use crate::job::HeapJob;
use crate::job::JobRef;
use crate::region;
use crate::sizing;
use crate::sizing::PoolSize;
use crate::sizing::SizeState;
use crate::workers::WorkerPool;

// -----------------------------------------------------------------------------
// Roles

/// What a pool is used for. Only affects thread names, logs and errors.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    /// Runs the chunks of `parallel_for` and `parallel_reduce`.
    IntraOp,
    /// Runs tasks submitted with `launch` and `launch_future`.
    InterOp,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::IntraOp => f.write_str("intra-op"),
            Role::InterOp => f.write_str("inter-op"),
        }
    }
}

// -----------------------------------------------------------------------------
// Thread pool

/// A lazily created pool of worker threads with a once-only size.
///
/// The pool is created the first time work is scheduled on it. Until then its
/// size may be configured exactly once with [`ThreadPool::set_num_threads`];
/// afterwards the size is fixed for the lifetime of the pool.
///
/// Most code should use the free functions of this crate, which go through the
/// two process-wide pools. Independent pools can be declared like this:
///
/// ```
/// use fanout::Role;
/// use fanout::ThreadPool;
///
/// static POOL: ThreadPool = ThreadPool::new(Role::IntraOp);
///
/// POOL.set_num_threads(2).unwrap();
/// let sum = POOL
///     .parallel_reduce(
///         0,
///         100,
///         10,
///         0_i64,
///         |start, end, acc| acc + (start..end).sum::<i64>(),
///         |a, b| a + b,
///     )
///     .unwrap();
/// assert_eq!(sum, 4950);
/// ```
pub struct ThreadPool {
    role: Role,
    size: PoolSize,
    workers: OnceLock<WorkerPool>,
}

/// The process-wide pool behind `parallel_for` and `parallel_reduce`.
pub static INTRA_OP: ThreadPool = ThreadPool::new(Role::IntraOp);

/// The process-wide pool behind `launch` and `launch_future`.
pub static INTER_OP: ThreadPool = ThreadPool::new(Role::InterOp);

impl ThreadPool {
    /// Creates a new, unconfigured thread pool. No threads are spawned until
    /// the pool is first used.
    pub const fn new(role: Role) -> ThreadPool {
        ThreadPool {
            role,
            size: PoolSize::new(),
            workers: OnceLock::new(),
        }
    }

    /// Returns the role this pool was created with.
    #[inline]
    pub fn role(&self) -> Role {
        self.role
    }

    /// Sets the number of worker threads the pool will be created with.
    ///
    /// This succeeds at most once, and only before the pool is first used.
    /// A rejected call leaves the configuration untouched.
    ///
    /// A pool of `count` workers splits each fork-join call into at most
    /// `count` chunks, and the calling thread runs the first chunk itself. One
    /// worker is therefore usually idle during `parallel_for` and
    /// `parallel_reduce`; launched work can use all of them.
    pub fn set_num_threads(&self, count: usize) -> Result<(), Error> {
        let count = NonZero::new(count).ok_or(Error::InvalidThreadCount(self.role))?;
        if self.size.configure(count) {
            debug!("configured {} pool with {} thread(s)", self.role, count);
            Ok(())
        } else {
            debug!("rejected {} pool configuration", self.role);
            Err(Error::ConfigurationAfterUse(self.role))
        }
    }

    /// Returns the number of worker threads the pool has, or will have once it
    /// is created. Never creates the pool.
    pub fn num_threads(&self) -> usize {
        match self.size.load() {
            SizeState::UserValue(count) => count.get(),
            SizeState::Unset => sizing::default_size(),
            // The pool may still be under construction on another thread, in
            // which case this waits for it.
            SizeState::Frozen => self.workers().size(),
        }
    }

    /// Returns true once the worker threads have been spawned.
    #[inline]
    pub fn is_initialized(&self) -> bool {
        self.workers.get().is_some()
    }

    /// Returns true if the calling thread is one of this pool's workers.
    /// Never creates the pool.
    #[inline]
    pub fn is_current_thread_member(&self) -> bool {
        self.workers
            .get()
            .is_some_and(WorkerPool::is_current_thread_member)
    }

    /// Returns the worker pool, creating it if this is the first use.
    fn workers(&self) -> &WorkerPool {
        self.init_workers(WorkerPool::new)
    }

    /// Returns the worker pool, creating it with `spawn` if this is the first
    /// use.
    ///
    /// The size is frozen before `spawn` runs. If `spawn` panics the previous
    /// configuration is restored, so a later use can try again with it.
    fn init_workers(&self, spawn: impl FnOnce(Role, usize) -> WorkerPool) -> &WorkerPool {
        self.workers.get_or_init(|| {
            let state = self.size.freeze();
            let restore = RestoreOnUnwind {
                size: &self.size,
                state,
            };
            let size = match state {
                SizeState::UserValue(count) => count.get(),
                SizeState::Unset | SizeState::Frozen => sizing::default_size(),
            };
            let workers = spawn(self.role, size);
            core::mem::forget(restore);
            workers
        })
    }

    /// Decides whether a call over `[begin, end)` may fan out, returning the
    /// worker pool if so.
    ///
    /// Work stays on the calling thread when the range is shorter than the
    /// grain, or when the caller is already inside a parallel region of any
    /// pool, or is itself a worker of this one.
    fn fan_out_target(&self, begin: i64, end: i64, grain_size: u64) -> Option<&WorkerPool> {
        if end.abs_diff(begin) < grain_size {
            trace!("range shorter than grain size, running inline");
            return None;
        }
        if region::in_region() || self.is_current_thread_member() {
            trace!("already in a parallel region, running inline");
            return None;
        }
        Some(self.workers())
    }
}

/// Puts a frozen size back the way it was when dropped. Forgotten once the
/// worker pool exists.
struct RestoreOnUnwind<'a> {
    size: &'a PoolSize,
    state: SizeState,
}

impl Drop for RestoreOnUnwind<'_> {
    fn drop(&mut self) {
        debug!("restoring pool configuration after a failed start");
        self.size.unfreeze(self.state);
    }
}

// -----------------------------------------------------------------------------
// Fork-join api

/// Validates a grain size, rejecting negative values.
fn check_grain_size(grain_size: i64) -> Result<u64, Error> {
    u64::try_from(grain_size).map_err(|_| Error::InvalidGrainSize(grain_size))
}

impl ThreadPool {
    /// Calls `f` over disjoint chunks covering `[begin, end)`, possibly in
    /// parallel, and returns once every chunk is done.
    ///
    /// Chunks are contiguous and at least `grain_size` long (except possibly
    /// the last). The calling thread runs the first chunk itself. If a chunk
    /// panics, the first such panic is resumed here after all other chunks
    /// have finished.
    ///
    /// An empty range returns immediately without calling `f`, whatever the
    /// grain size. Otherwise a negative `grain_size` returns
    /// [`Error::InvalidGrainSize`] without calling `f`.
    pub fn parallel_for<F>(&self, begin: i64, end: i64, grain_size: i64, f: F) -> Result<(), Error>
    where
        F: Fn(i64, i64) + Sync,
    {
        if begin >= end {
            return Ok(());
        }
        let grain_size = check_grain_size(grain_size)?;

        match self.fan_out_target(begin, end, grain_size) {
            None => f(begin, end),
            Some(workers) => {
                let plan = ChunkPlan::new(begin, end, grain_size, workers.size());
                let body = |start: i64, end: i64, (): ()| f(start, end);
                fork_join::fork_join(workers, &plan, || (), &body);
            }
        }

        Ok(())
    }

    /// Reduces `[begin, end)` by running `f` over disjoint chunks, possibly in
    /// parallel, and folding the partial results with `combine`.
    ///
    /// Every chunk starts from its own clone of `identity`. Partial results are
    /// combined in chunk order, starting from `identity`, so `combine` only
    /// needs to be associative. An empty range returns `identity`; a range
    /// run inline returns `f(begin, end, identity)`.
    ///
    /// Errors and panics behave as for [`ThreadPool::parallel_for`].
    pub fn parallel_reduce<T, F, C>(
        &self,
        begin: i64,
        end: i64,
        grain_size: i64,
        identity: T,
        f: F,
        combine: C,
    ) -> Result<T, Error>
    where
        T: Clone + Send,
        F: Fn(i64, i64, T) -> T + Sync,
        C: Fn(T, T) -> T,
    {
        if begin >= end {
            return Ok(identity);
        }
        let grain_size = check_grain_size(grain_size)?;

        let Some(workers) = self.fan_out_target(begin, end, grain_size) else {
            return Ok(f(begin, end, identity));
        };

        let plan = ChunkPlan::new(begin, end, grain_size, workers.size());
        let partials: Vec<T> = fork_join::fork_join(workers, &plan, || identity.clone(), &f);
        Ok(partials.into_iter().fold(identity, combine))
    }
}

// -----------------------------------------------------------------------------
// Launch api

impl ThreadPool {
    /// Queues a closure on the pool and returns immediately.
    ///
    /// There is no handle to the result. If the closure panics, the panic is
    /// logged by the worker and otherwise ignored.
    pub fn launch<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let job = HeapJob::new(f);
        // SAFETY: The closure is `'static`, and a queued job is always executed
        // exactly once, even if the pool is dropped in the meantime.
        let job_ref = unsafe { job.into_job_ref() };
        self.workers().submit(job_ref);
    }

    /// Queues a future on the pool, returning a [`Task`] that resolves to its
    /// output.
    ///
    /// Each time the future is woken it is queued on the pool again. Dropping
    /// the task cancels the future; call [`Task::detach`] to let it run to
    /// completion in the background. A future woken after its pool has been
    /// dropped is never polled again.
    pub fn launch_future<F, T>(&self, future: F) -> Task<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let injector = self.workers().injector();

        // This function "schedules" the future, which here means queuing a
        // `JobRef` that knows how to poll it.
        let schedule = move |runnable: Runnable| {
            // The runnable is already heap allocated, so its raw pointer is
            // used as the job directly.
            let job_pointer = runnable.into_raw();

            fn execute_runnable(this: NonNull<()>) {
                // SAFETY: This pointer was created by `Runnable::into_raw` above.
                let runnable = unsafe { Runnable::<()>::from_raw(this) };
                // Polls the future. It is dropped if the task was canceled or
                // the future completes.
                runnable.run();
            }

            // SAFETY: The raw runnable pointer stays valid until it is used by
            // `execute_runnable`, which consumes it.
            let job_ref = unsafe { JobRef::new_raw(job_pointer, execute_runnable) };
            injector.submit(job_ref);
        };

        let (runnable, task) = async_task::spawn(future, schedule);
        runnable.schedule();
        task
    }
}

// -----------------------------------------------------------------------------
// Process-wide api

/// Sets the number of threads used for fork-join parallelism.
///
/// The calling thread runs the first chunk of every call, so `count` workers
/// leave one of them idle. See [`ThreadPool::set_num_threads`].
///
/// Fails with [`Error::ConfigurationAfterUse`] once parallel work has started
/// or after a previous successful call, and with
/// [`Error::InvalidThreadCount`] for zero.
pub fn set_num_threads(count: usize) -> Result<(), Error> {
    INTRA_OP.set_num_threads(count)
}

/// Returns the number of threads used for fork-join parallelism. Before the
/// first parallel call this is the configured or default value.
pub fn get_num_threads() -> usize {
    INTRA_OP.num_threads()
}

/// Sets the number of threads used by [`launch`] and [`launch_future`].
///
/// Same rules as [`set_num_threads`], tracked independently.
pub fn set_num_interop_threads(count: usize) -> Result<(), Error> {
    INTER_OP.set_num_threads(count)
}

/// Returns the number of threads used by [`launch`] and [`launch_future`].
pub fn get_num_interop_threads() -> usize {
    INTER_OP.num_threads()
}

/// Runs `f` over chunks of `[begin, end)` on the process-wide intra-op pool.
///
/// See [`ThreadPool::parallel_for`].
pub fn parallel_for<F>(begin: i64, end: i64, grain_size: i64, f: F) -> Result<(), Error>
where
    F: Fn(i64, i64) + Sync,
{
    INTRA_OP.parallel_for(begin, end, grain_size, f)
}

/// Reduces `[begin, end)` on the process-wide intra-op pool.
///
/// See [`ThreadPool::parallel_reduce`].
pub fn parallel_reduce<T, F, C>(
    begin: i64,
    end: i64,
    grain_size: i64,
    identity: T,
    f: F,
    combine: C,
) -> Result<T, Error>
where
    T: Clone + Send,
    F: Fn(i64, i64, T) -> T + Sync,
    C: Fn(T, T) -> T,
{
    INTRA_OP.parallel_reduce(begin, end, grain_size, identity, f, combine)
}

/// Queues a closure on the process-wide inter-op pool.
///
/// See [`ThreadPool::launch`].
pub fn launch<F>(f: F)
where
    F: FnOnce() + Send + 'static,
{
    INTER_OP.launch(f);
}

/// Queues a future on the process-wide inter-op pool.
///
/// See [`ThreadPool::launch_future`].
pub fn launch_future<F, T>(future: F) -> Task<T>
where
    F: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    INTER_OP.launch_future(future)
}

/// Returns true if the calling thread is executing a fork-join chunk, or is a
/// worker of the process-wide intra-op pool.
pub fn in_parallel_region() -> bool {
    region::in_region() || INTRA_OP.is_current_thread_member()
}

/// Returns the index of the chunk the calling thread is executing, or zero
/// outside of a parallel region.
pub fn get_thread_num() -> usize {
    region::worker_index().unwrap_or(0)
}

/// Returns a human readable report of the threading configuration.
pub fn parallel_info() -> String {
    let mut info = String::from("fanout parallel info:\n");
    for pool in [&INTRA_OP, &INTER_OP] {
        let state = if pool.is_initialized() {
            "created"
        } else {
            "not created"
        };
        // Writing to a `String` cannot fail.
        let _ = writeln!(
            info,
            "\t{} threads : {} (pool {})",
            pool.role(),
            pool.num_threads(),
            state
        );
    }
    let _ = writeln!(
        info,
        "\tavailable parallelism : {}",
        sizing::default_size()
    );
    let _ = writeln!(info, "\tin parallel region : {}", in_parallel_region());
    info
}
