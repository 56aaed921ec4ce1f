//! This module defines an executable unit of work called a [`Job`]. Jobs are
//! what get queued on a worker pool. There are two core job types:
//! [`StackJob`] and [`HeapJob`].
//!
//! After a job is allocated, we typically refer to it by a [`JobRef`]. Job refs
//! are type-erased, and can be sent between threads without moving the
//! underlying job.
//!
//! When using a job, one must be extremely careful to ensure that:
//! (a) The job does not outlive anything it closes over.
//! (b) The job remains valid until it is executed for the last time.
//! (c) Each job reference is executed exactly once.

use alloc::boxed::Box;
use core::cell::UnsafeCell;
use core::mem::ManuallyDrop;
use core::ptr::NonNull;

use crate::signal::Signal;
use crate::unwind;

// -----------------------------------------------------------------------------
// Runnable

/// A job is a unit of work that may be executed by a worker thread. The primary
/// purpose of this trait is to make it easy to create a `JobRef`. The `execute`
/// function is designed to interlock with the `JobRef::execute_fn` field.
trait Job {
    /// Calling this function runs the job.
    ///
    /// # Safety
    ///
    /// Implementers must specify the invariant of the pointer `this` that the
    /// caller is expected to uphold.
    ///
    /// This may be called from a different thread than the one which created
    /// the job. Calling this is always considered to "complete" the job, so the
    /// caller must ensure this is called exactly once.
    unsafe fn execute(this: NonNull<()>);
}

// -----------------------------------------------------------------------------
// Shared JobRef

/// Effectively a Job trait object. It can be treated as such, even though
/// sometimes a `JobRef` will not point to a type that implements `Job` (async
/// runnables are queued through the same type).
pub struct JobRef {
    /// A non-null pointer to some type-erased data which can be executed as a
    /// job by the `execute_fn`.
    job_pointer: NonNull<()>,
    /// A function pointer that can execute the job stored at `job_pointer`.
    execute_fn: unsafe fn(NonNull<()>),
}

impl JobRef {
    /// Creates a new `JobRef` from raw pointers.
    ///
    /// # Safety
    ///
    /// The caller must ensure that `job_pointer` remains valid to pass to
    /// `execute_fn` until the job is executed. What exactly this means is
    /// dependent on the implementation of the execute function.
    #[inline(always)]
    pub unsafe fn new_raw(job_pointer: NonNull<()>, execute_fn: unsafe fn(NonNull<()>)) -> JobRef {
        JobRef {
            job_pointer,
            execute_fn,
        }
    }

    /// Executes the `JobRef` by passing the execute function on the job pointer.
    #[inline(always)]
    pub fn execute(self) {
        // SAFETY: The constructor of `JobRef` is required to ensure this is valid.
        unsafe { (self.execute_fn)(self.job_pointer) }
    }
}

// SAFETY: !Send for raw pointers is not for safety, just as a lint. Every
// constructor of a `JobRef` requires the pointee to be safe to run elsewhere.
unsafe impl Send for JobRef {}

// -----------------------------------------------------------------------------
// Stack allocated work function

/// A [`StackJob`] is a job that's allocated on the stack of the thread that
/// will wait for it. It's efficient, but relies on us preventing the stack
/// frame from being dropped before the job runs. Fork-join chunks are stack
/// jobs; their return value is sent back over the embedded [`Signal`].
pub struct StackJob<F, T> {
    f: UnsafeCell<ManuallyDrop<F>>,
    signal: Signal<T>,
}

impl<F, T> StackJob<F, T>
where
    F: FnOnce() -> T + Send,
    T: Send,
{
    /// Creates a new `StackJob`.
    #[inline(always)]
    pub fn new(f: F) -> StackJob<F, T> {
        StackJob {
            f: UnsafeCell::new(ManuallyDrop::new(f)),
            signal: Signal::new(),
        }
    }

    /// Creates a `JobRef` pointing to this job.
    ///
    /// # Safety
    ///
    /// The caller must ensure that the `StackJob` is neither moved nor dropped
    /// until its signal has been received, that the data the closure borrows
    /// lives at least that long, and that at most one `JobRef` is ever created
    /// for each `StackJob`.
    #[inline(always)]
    pub unsafe fn as_job_ref(&self) -> JobRef {
        let job_pointer = NonNull::from(self).cast();
        // SAFETY: The caller ensures the `StackJob` outlives the `JobRef`, so
        // the pointer stays valid to pass to `Self::execute`, and that only one
        // `JobRef` exists, so `execute` runs at most once.
        unsafe { JobRef::new_raw(job_pointer, Self::execute) }
    }

    /// Returns the signal the closure's return value is sent over.
    #[inline(always)]
    pub fn signal(&self) -> &Signal<T> {
        &self.signal
    }
}

impl<F, T> Job for StackJob<F, T>
where
    F: FnOnce() -> T + Send,
    T: Send,
{
    /// Executes a `StackJob` from a const pointer.
    ///
    /// # Safety
    ///
    /// The caller must ensure that `this` is valid to access a `StackJob`
    /// immutably at least until its signal has been sent, and that this is
    /// only called once.
    #[inline(always)]
    unsafe fn execute(this: NonNull<()>) {
        // SAFETY: The caller ensures `this` can be converted into an immutable
        // reference until we send the signal, which has not happened yet.
        let this = unsafe { this.cast::<Self>().as_ref() };
        // If the closure panics the waiting thread would never be released, and
        // would eventually free the stack this job lives on. Abort instead.
        let abort_guard = unwind::AbortOnDrop;
        // SAFETY: This memory location is only accessed here, and this function
        // is called only once, so we have exclusive access.
        let f = unsafe { ManuallyDrop::take(&mut *this.f.get()) };
        let value = f();
        // SAFETY: The signal is valid on entry; after this call `this` may
        // dangle and is not used again.
        unsafe { Signal::send(&this.signal, value) };
        core::mem::forget(abort_guard);
    }
}

// -----------------------------------------------------------------------------
// Heap allocated work function

/// Represents a job stored in the heap. Used to implement `launch`.
pub struct HeapJob<F> {
    f: F,
}

impl<F> HeapJob<F>
where
    F: FnOnce() + Send,
{
    /// Allocates a new `HeapJob` on the heap.
    #[inline(always)]
    pub fn new(f: F) -> Box<Self> {
        Box::new(HeapJob { f })
    }

    /// Converts the heap job into an "owning" `JobRef`. The job will be
    /// automatically dropped when the `JobRef` is executed.
    ///
    /// # Safety
    ///
    /// This will leak memory if the `JobRef` is not executed, so the caller
    /// must ensure that it is eventually executed (unless the process is
    /// exiting). The caller must also ensure the job does not outlive the data
    /// the closure references.
    #[inline(always)]
    pub unsafe fn into_job_ref(self: Box<Self>) -> JobRef {
        let job_pointer = NonNull::from(Box::leak(self)).cast();
        // SAFETY: The pointer was created from a leaked box, so it is valid to
        // pass in to `Self::execute`, which reclaims it exactly once.
        unsafe { JobRef::new_raw(job_pointer, Self::execute) }
    }
}

impl<F> Job for HeapJob<F>
where
    F: FnOnce() + Send,
{
    /// Executes a `Box<HeapJob>`, dropping it when completed.
    ///
    /// # Safety
    ///
    /// The caller must ensure that `this` is a pointer created from a leaked
    /// `Box<HeapJob>`. After the call `this` must be treated as dangling.
    #[inline(always)]
    unsafe fn execute(this: NonNull<()>) {
        // SAFETY: The caller ensures `this` came from a leaked box and that this
        // is called only once.
        let this = unsafe { Box::from_raw(this.cast::<Self>().as_ptr()) };
        (this.f)();
    }
}
