//! Thread-local bookkeeping for parallel regions.
//!
//! A thread is "in a parallel region" while it executes a fork-join chunk. The
//! scheduler refuses to fan out again from inside a region, which bounds pool
//! usage to one level and rules out a worker blocking on chunks queued behind
//! itself. Chunks also record their index, so bodies can ask which logical
//! worker they run as.

use core::cell::Cell;
use std::thread_local;

/// The per-thread region state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct RegionState {
    in_parallel_region: bool,
    worker_index: Option<usize>,
}

impl RegionState {
    const OUTSIDE: RegionState = RegionState {
        in_parallel_region: false,
        worker_index: None,
    };
}

thread_local! {
    static REGION: Cell<RegionState> = const { Cell::new(RegionState::OUTSIDE) };
    /// Identifier of the worker pool owning this thread, or zero.
    static POOL_ID: Cell<usize> = const { Cell::new(0) };
}

/// Returns true while the current thread is executing a fork-join chunk.
///
/// This only looks at the region flag. The public [`crate::in_parallel_region`]
/// additionally treats the threads of the process-wide intra-op pool as being
/// inside a region.
#[inline]
pub fn in_region() -> bool {
    REGION.with(Cell::get).in_parallel_region
}

/// Returns the index of the chunk the current thread is executing, if any.
#[inline]
pub fn worker_index() -> Option<usize> {
    REGION.with(Cell::get).worker_index
}

/// Marks the current thread as belonging to the worker pool `pool_id`.
pub fn set_pool_id(pool_id: usize) {
    POOL_ID.with(|id| id.set(pool_id));
}

/// Returns true if the current thread is a worker of the pool `pool_id`.
#[inline]
pub fn is_pool_thread(pool_id: usize) -> bool {
    POOL_ID.with(Cell::get) == pool_id
}

/// Scoped guard marking the current thread as inside a parallel region.
///
/// The previous state is restored when the guard is dropped, including while
/// unwinding out of a panicking chunk.
pub struct RegionGuard {
    outer: RegionState,
    // Region state is per-thread; the guard must be dropped where it was made.
    _not_send: core::marker::PhantomData<*const ()>,
}

impl RegionGuard {
    /// Enters a region as the chunk with the given index.
    #[inline]
    pub fn enter(worker_index: usize) -> RegionGuard {
        let inner = RegionState {
            in_parallel_region: true,
            worker_index: Some(worker_index),
        };
        let outer = REGION.with(|region| region.replace(inner));
        RegionGuard {
            outer,
            _not_send: core::marker::PhantomData,
        }
    }
}

impl Drop for RegionGuard {
    #[inline]
    fn drop(&mut self) {
        REGION.with(|region| region.set(self.outer));
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::unwind;

    #[test]
    fn guard_sets_and_restores_region() {
        assert!(!in_region());
        assert_eq!(worker_index(), None);
        {
            let _region = RegionGuard::enter(3);
            assert!(in_region());
            assert_eq!(worker_index(), Some(3));
        }
        assert!(!in_region());
        assert_eq!(worker_index(), None);
    }

    #[test]
    fn guard_restores_region_after_panic() {
        let result = unwind::halt_unwinding(|| -> u8 {
            let _region = RegionGuard::enter(1);
            panic!("chunk body failed");
        });
        assert!(result.is_err());
        assert!(!in_region());
        assert_eq!(worker_index(), None);
    }

    #[test]
    fn region_state_is_per_thread() {
        let _region = RegionGuard::enter(2);
        std::thread::spawn(|| {
            assert!(!in_region());
            assert_eq!(worker_index(), None);
        })
        .join()
        .unwrap();
        assert!(in_region());
    }

    #[test]
    fn pool_membership_is_per_thread() {
        assert!(!is_pool_thread(usize::MAX));
        std::thread::spawn(|| {
            set_pool_id(usize::MAX);
            assert!(is_pool_thread(usize::MAX));
        })
        .join()
        .unwrap();
        assert!(!is_pool_thread(usize::MAX));
    }
}
