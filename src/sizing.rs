//! The pool sizing state machine.
//!
//! Every pool carries one atomic cell holding its configured size:
//!
//! ```text
//!   Unset ──configure(n)──► UserValue(n)
//!     │                         │
//!     └────── first use ────────┴──► Frozen
//! ```
//!
//! Configuration is a single compare-and-set from `Unset`, so a second attempt
//! (or an attempt after first use) is rejected without mutating anything.
//! Freezing is a single exchange, so two threads racing to be the first user
//! see exactly one of them capture the configured value. Reads that don't
//! freeze cost one atomic load.

use core::num::NonZero;
use std::thread::available_parallelism;

use crate::platform::AtomicUsize;
use crate::platform::Ordering;

/// No value has been configured and the pool has not been used.
const UNSET: usize = 0;

/// The pool has been created; its size can no longer change.
const FROZEN: usize = usize::MAX;

/// A decoded view of the sizing cell.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SizeState {
    /// Nothing configured yet.
    Unset,
    /// Configured by the user, pool not yet created.
    UserValue(NonZero<usize>),
    /// The pool exists.
    Frozen,
}

/// Atomic tri-state holding the size of a pool before it is created.
pub struct PoolSize {
    state: AtomicUsize,
}

impl PoolSize {
    /// Creates an unset cell.
    #[cfg(not(loom))]
    pub const fn new() -> PoolSize {
        PoolSize {
            state: AtomicUsize::new(UNSET),
        }
    }

    /// Non-const constructor variant for loom.
    #[cfg(loom)]
    pub fn new() -> PoolSize {
        PoolSize {
            state: AtomicUsize::new(UNSET),
        }
    }

    /// Loads and decodes the current state.
    #[inline]
    pub fn load(&self) -> SizeState {
        decode(self.state.load(Ordering::Acquire))
    }

    /// Moves from `Unset` to `UserValue(count)`. Returns false, leaving the
    /// state untouched, when the cell was configured or frozen already.
    pub fn configure(&self, count: NonZero<usize>) -> bool {
        // `usize::MAX` is reserved for the frozen marker.
        let count = count.get().min(FROZEN - 1);
        self.state
            .compare_exchange(UNSET, count, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Moves to `Frozen`, returning whatever state was present at that instant.
    pub fn freeze(&self) -> SizeState {
        decode(self.state.swap(FROZEN, Ordering::AcqRel))
    }

    /// Undoes a [`freeze`](PoolSize::freeze) whose pool could not be created,
    /// putting back the state it returned.
    ///
    /// Only the thread that froze the cell may call this, before anyone else
    /// could have observed the pool.
    pub fn unfreeze(&self, state: SizeState) {
        let raw = match state {
            SizeState::Unset => UNSET,
            SizeState::UserValue(count) => count.get(),
            SizeState::Frozen => FROZEN,
        };
        self.state.store(raw, Ordering::Release);
    }
}

impl Default for PoolSize {
    fn default() -> PoolSize {
        PoolSize::new()
    }
}

#[inline]
fn decode(raw: usize) -> SizeState {
    match raw {
        UNSET => SizeState::Unset,
        FROZEN => SizeState::Frozen,
        count => match NonZero::new(count) {
            Some(count) => SizeState::UserValue(count),
            None => SizeState::Unset,
        },
    }
}

/// The size a pool takes when nothing was configured: the available hardware
/// parallelism, or one thread if that cannot be determined.
pub fn default_size() -> usize {
    available_parallelism().map(NonZero::get).unwrap_or(1)
}

#[cfg(all(test, not(loom)))]
mod test {
    use super::*;
    use std::sync::Barrier;
    use std::thread;

    fn count(n: usize) -> NonZero<usize> {
        NonZero::new(n).unwrap()
    }

    #[test]
    fn starts_unset() {
        assert_eq!(PoolSize::new().load(), SizeState::Unset);
    }

    #[test]
    fn configure_once() {
        let size = PoolSize::new();
        assert!(size.configure(count(5)));
        assert_eq!(size.load(), SizeState::UserValue(count(5)));
        assert!(!size.configure(count(3)));
        assert_eq!(size.load(), SizeState::UserValue(count(5)));
    }

    #[test]
    fn freeze_captures_user_value() {
        let size = PoolSize::new();
        size.configure(count(4));
        assert_eq!(size.freeze(), SizeState::UserValue(count(4)));
        assert_eq!(size.load(), SizeState::Frozen);
    }

    #[test]
    fn freeze_from_unset() {
        let size = PoolSize::new();
        assert_eq!(size.freeze(), SizeState::Unset);
        assert_eq!(size.load(), SizeState::Frozen);
    }

    #[test]
    fn no_configuration_after_freeze() {
        let size = PoolSize::new();
        size.freeze();
        assert!(!size.configure(count(2)));
        assert_eq!(size.load(), SizeState::Frozen);
        assert_eq!(size.freeze(), SizeState::Frozen);
    }

    #[test]
    fn unfreeze_restores_configuration() {
        let size = PoolSize::new();
        size.configure(count(3));
        let captured = size.freeze();
        assert!(!size.configure(count(2)));
        size.unfreeze(captured);
        assert_eq!(size.load(), SizeState::UserValue(count(3)));
        assert!(!size.configure(count(2)));
    }

    #[test]
    fn racing_configuration_has_one_winner() {
        const THREADS: usize = 8;
        let size = PoolSize::new();
        let barrier = Barrier::new(THREADS);
        let winners = thread::scope(|scope| {
            let handles: alloc::vec::Vec<_> = (1..=THREADS)
                .map(|n| {
                    let size = &size;
                    let barrier = &barrier;
                    scope.spawn(move || {
                        barrier.wait();
                        size.configure(count(n)).then_some(n)
                    })
                })
                .collect();
            handles
                .into_iter()
                .filter_map(|handle| handle.join().unwrap())
                .collect::<alloc::vec::Vec<_>>()
        });
        assert_eq!(winners.len(), 1);
        assert_eq!(size.load(), SizeState::UserValue(count(winners[0])));
    }

    #[test]
    fn default_size_is_positive() {
        assert!(default_size() >= 1);
    }
}
