//! A fork-join thread-pool for splitting large elementwise and reduction
//! workloads over index ranges.
//!
//! Fanout cuts a range `[begin, end)` into contiguous chunks, runs them on a
//! bounded pool of worker threads (the calling thread takes the first chunk)
//! and joins the results. A panic in any chunk is resumed on the caller once
//! every chunk has finished. Calls made from inside a chunk never fan out
//! again; they run inline on the current thread.
//!
//! ```
//! let total = fanout::parallel_reduce(
//!     0,
//!     1_000,
//!     100,
//!     0_i64,
//!     |start, end, acc| acc + (start..end).sum::<i64>(),
//!     |a, b| a + b,
//! )
//! .unwrap();
//! assert_eq!(total, 499_500);
//! ```
//!
//! Independent work items go to a second pool through [`launch`] and
//! [`launch_future`]. Both process-wide pools are created on first use, and
//! their sizes can be set exactly once beforehand with [`set_num_threads`] and
//! [`set_num_interop_threads`].
//!
//! # Acknowledgments
//!
//! The job and unwinding machinery follows `rayon_core`.
//! Support for futures uses `async-task`, as sketched out by members of the
//! `rayon` community.

#![no_std]
#![cfg_attr(loom, allow(dead_code))]

// -----------------------------------------------------------------------------
// Boilerplate for building without the standard library

extern crate alloc;
extern crate std;

// -----------------------------------------------------------------------------
// Modules

// Built with `--cfg loom`, only the lock-free primitives are compiled, so that
// `tests/loom.rs` can model them in isolation.

mod failure;
mod signal;
mod sizing;
mod unwind;

#[cfg(not(loom))]
mod blocker;
#[cfg(not(loom))]
mod error;
#[cfg(not(loom))]
mod fork_join;
#[cfg(not(loom))]
mod job;
#[cfg(not(loom))]
mod region;
#[cfg(not(loom))]
mod thread_pool;
#[cfg(not(loom))]
mod workers;

// -----------------------------------------------------------------------------
// Top-level exports

#[cfg(not(loom))]
pub use async_task::Task;
#[cfg(not(loom))]
pub use blocker::block_on;
#[cfg(not(loom))]
pub use error::Error;
#[cfg(not(loom))]
pub use thread_pool::Role;
#[cfg(not(loom))]
pub use thread_pool::ThreadPool;
#[cfg(not(loom))]
pub use thread_pool::get_num_interop_threads;
#[cfg(not(loom))]
pub use thread_pool::get_num_threads;
#[cfg(not(loom))]
pub use thread_pool::get_thread_num;
#[cfg(not(loom))]
pub use thread_pool::in_parallel_region;
#[cfg(not(loom))]
pub use thread_pool::launch;
#[cfg(not(loom))]
pub use thread_pool::launch_future;
#[cfg(not(loom))]
pub use thread_pool::parallel_for;
#[cfg(not(loom))]
pub use thread_pool::parallel_info;
#[cfg(not(loom))]
pub use thread_pool::parallel_reduce;
#[cfg(not(loom))]
pub use thread_pool::set_num_interop_threads;
#[cfg(not(loom))]
pub use thread_pool::set_num_threads;

/// The lock-free primitives, exposed for model checking.
#[cfg(loom)]
#[doc(hidden)]
pub mod primitives {
    pub use crate::failure::FailureSlot;
    pub use crate::signal::Signal;
    pub use crate::sizing::PoolSize;
    pub use crate::sizing::SizeState;
}

// -----------------------------------------------------------------------------
// Platform Support

// This crate uses `loom` for testing, which requires mocking the atomics, the
// cells and the futex used by the lock-free primitives.
//
// To make things a bit simpler, we re-export all the important types in the
// `platform` module.

#[cfg(not(loom))]
mod platform {

    // Core exports

    pub use core::sync::atomic::AtomicBool;
    pub use core::sync::atomic::AtomicU32;
    pub use core::sync::atomic::AtomicUsize;
    pub use core::sync::atomic::Ordering;

    // Futex

    pub use atomic_wait::wait;
    pub use atomic_wait::wake_all;
    pub use atomic_wait::wake_one;

    /// `core::cell::UnsafeCell` with the closure-based api of `loom`.
    pub struct UnsafeCell<T>(core::cell::UnsafeCell<T>);

    impl<T> UnsafeCell<T> {
        #[inline(always)]
        pub const fn new(data: T) -> UnsafeCell<T> {
            UnsafeCell(core::cell::UnsafeCell::new(data))
        }

        #[inline(always)]
        pub fn with_mut<R>(&self, f: impl FnOnce(*mut T) -> R) -> R {
            f(self.0.get())
        }
    }
}

#[cfg(loom)]
mod platform {

    // Core exports

    pub use loom::cell::UnsafeCell;
    pub use loom::sync::atomic::AtomicBool;
    pub use loom::sync::atomic::AtomicU32;
    pub use loom::sync::atomic::AtomicUsize;
    pub use loom::sync::atomic::Ordering;

    // Futex

    // Loom cannot park on an address, so waiting yields to the other modelled
    // threads instead. Callers already loop on spurious wake-ups.

    pub fn wait(atomic: &AtomicU32, value: u32) {
        if atomic.load(Ordering::Acquire) == value {
            loom::thread::yield_now();
        }
    }

    pub fn wake_one(_atomic: *const AtomicU32) {}

    pub fn wake_all(_atomic: *const AtomicU32) {}
}
