//! The first-failure slot shared by the chunks of one fork-join call.

use crate::platform::AtomicBool;
use crate::platform::Ordering;
use crate::platform::UnsafeCell;
use crate::unwind::Payload;

/// Holds the first panic captured by any chunk.
///
/// Claiming is a compare-and-set on `claimed`; only the winner writes the
/// payload, later panics are dropped.
pub struct FailureSlot {
    claimed: AtomicBool,
    payload: UnsafeCell<Option<Payload>>,
}

impl FailureSlot {
    /// Creates an empty slot.
    pub fn new() -> FailureSlot {
        FailureSlot {
            claimed: AtomicBool::new(false),
            payload: UnsafeCell::new(None),
        }
    }

    /// Stores `payload` if no other panic has been stored yet.
    pub fn claim(&self, payload: Payload) {
        if self
            .claimed
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            // SAFETY: Only the thread that won the claim writes the payload,
            // and it is only read through `into_inner` once every chunk has
            // finished and been joined.
            self.payload.with_mut(|slot| unsafe { *slot = Some(payload) });
        }
    }

    /// Returns the stored panic, if any.
    pub fn into_inner(self) -> Option<Payload> {
        // SAFETY: Owning the slot means every claimer is done with it.
        self.payload.with_mut(|slot| unsafe { (*slot).take() })
    }
}

impl Default for FailureSlot {
    fn default() -> FailureSlot {
        FailureSlot::new()
    }
}

// SAFETY: The payload is written at most once, by the claim winner, and read
// only after ownership of the slot has returned to the joining thread.
unsafe impl Sync for FailureSlot {}

#[cfg(all(test, not(loom)))]
mod test {
    use alloc::boxed::Box;
    use std::thread;

    use super::*;
    use crate::unwind;

    #[test]
    fn keeps_first_claim() {
        let slot = FailureSlot::new();
        slot.claim(Box::new("first"));
        slot.claim(Box::new("second"));
        let payload = slot.into_inner().unwrap();
        assert_eq!(unwind::payload_message(&payload), "first");
    }

    #[test]
    fn empty_without_claims() {
        assert!(FailureSlot::new().into_inner().is_none());
    }

    #[test]
    fn one_of_many_racing_claims_wins() {
        let slot = FailureSlot::new();
        thread::scope(|scope| {
            for i in 0..8 {
                let slot = &slot;
                scope.spawn(move || slot.claim(Box::new(i)));
            }
        });
        let payload = slot.into_inner().unwrap();
        assert!(payload.downcast_ref::<i32>().is_some_and(|i| (0..8).contains(i)));
    }
}
