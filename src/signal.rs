//! One-shot handoff of a chunk's outcome from the worker that ran it back to
//! the thread joining the chunks.
//!
//! The implementation is loosely adapted from chili and the oneshot crate,
//! using a futex instead of a CAS loop.

use crate::platform;
use crate::platform::AtomicU32;
use crate::platform::Ordering;
use crate::platform::UnsafeCell;

// -----------------------------------------------------------------------------
// States

/// The default state of a signal, with no waiting recever and no sent value.
const IDLE: u32 = 0b00;

/// A bit set by the recever when it is waiting, and needs the sender to wake it up.
const WAIT: u32 = 0b01;

/// A bit set by the sender when data has been transmitted to the recever.
const SENT: u32 = 0b10;

// -----------------------------------------------------------------------------
// Signal

/// A signal transmits a single value across threads, exactly once.
///
/// The api contract is governed by one general principle: a signal has exactly
/// one sender and one receiver, and the receiver is the thread that owns the
/// memory the signal lives in.
pub struct Signal<T> {
    /// The state of the signal, used for synchronization and sleeping.
    state: AtomicU32,
    /// The value transmitted by the signal.
    value: UnsafeCell<Option<T>>,
}

impl<T: Send> Signal<T> {
    /// Creates a new signal.
    pub fn new() -> Self {
        Self {
            state: AtomicU32::new(IDLE),
            value: UnsafeCell::new(None),
        }
    }

    /// Receives the signal, or waits for it to be sent.
    ///
    /// # Panics
    ///
    /// This panics if called on a signal on which data has already been
    /// received.
    ///
    /// # Safety
    ///
    /// The caller must ensure that `recv` is only called from a single thread.
    pub unsafe fn recv(&self) -> T {
        // Loop to mitigate spurious wake-ups.
        loop {
            // Set the WAIT bit and load the current state.
            let state = self.state.fetch_or(WAIT, Ordering::Acquire);

            if state & SENT != 0 {
                // SAFETY: The sender only touches the value before setting
                // SENT, and the caller guarantees no other receiver exists, so
                // we have exclusive access. The acquire ordering above
                // synchronizes with the release in `send`.
                let value = self.value.with_mut(|value| unsafe { (*value).take() });
                return value.expect("signal value was already received");
            }

            // Sleep until the sender changes the state.
            platform::wait(&self.state, state | WAIT);
        }
    }

    /// Sends a value to the receiving thread.
    ///
    /// # Panics
    ///
    /// This panics if called more than once on the same signal.
    ///
    /// # Safety
    ///
    /// Sending a signal may wake the receiver, which may then deallocate the
    /// signal. This takes `*const Self` instead of `&self` so the pointer is
    /// allowed to dangle once the value is published. The caller must ensure
    /// the pointer is valid on entry and not invalidated by anything other than
    /// `send` itself.
    #[inline(always)]
    pub unsafe fn send(signal: *const Self, value: T) {
        // SAFETY: The caller ensures the pointer is valid on entry, and nothing
        // has been published yet that would let the receiver free it.
        let this = unsafe { &*signal };

        if this.state.load(Ordering::Relaxed) & SENT != 0 {
            panic!("attempted to send value over signal, but signal has already been sent");
        }

        // SAFETY: The receiver only reads the value after observing SENT,
        // which we have not set yet, so we have unique access.
        this.value.with_mut(|slot| unsafe { *slot = Some(value) });

        // Once SENT is visible the receiver may free the signal, so only this
        // raw pointer is used past the `fetch_or`.
        let state_ptr: *const AtomicU32 = &this.state;

        let state = this.state.fetch_or(SENT, Ordering::Release);
        if state & WAIT != 0 {
            // The futex wake only uses the address, which may dangle by now.
            platform::wake_one(state_ptr);
        }
    }
}

impl<T: Send> Default for Signal<T> {
    fn default() -> Self {
        Self::new()
    }
}

// SAFETY: References to signals are shared between the sending worker and the
// receiving thread, so they must be `Sync`; the value itself crosses threads,
// so `T` must be `Send`.
unsafe impl<T: Send> Sync for Signal<T> {}

#[cfg(all(test, not(loom)))]
mod test {
    use alloc::boxed::Box;
    use std::thread;

    use super::*;

    #[test]
    fn send_then_recv_on_same_thread() {
        let signal = Signal::new();
        // SAFETY: The signal lives on this stack frame for the whole test.
        unsafe { Signal::send(&signal, 5_u32) };
        // SAFETY: Only this thread receives.
        assert_eq!(unsafe { signal.recv() }, 5);
    }

    #[test]
    fn recv_blocks_until_another_thread_sends() {
        let signal = Signal::new();
        thread::scope(|scope| {
            scope.spawn(|| {
                thread::sleep(core::time::Duration::from_millis(20));
                // SAFETY: The scope keeps the signal alive until this thread exits.
                unsafe { Signal::send(&signal, "done") };
            });
            // SAFETY: Only this thread receives.
            assert_eq!(unsafe { signal.recv() }, "done");
        });
    }

    #[test]
    #[should_panic(expected = "signal has already been sent")]
    fn double_send_panics() {
        let signal = Signal::new();
        // SAFETY: The signal lives on this stack frame for the whole test.
        unsafe {
            Signal::send(&signal, 1_u8);
            Signal::send(&signal, 2_u8);
        }
    }

    #[test]
    fn receiver_may_free_signal_while_sender_wakes() {
        for _ in 0..1000 {
            let signal = Box::new(Signal::<u32>::new());
            let address = (&raw const *signal) as usize;
            thread::scope(|scope| {
                scope.spawn(move || {
                    // SAFETY: The signal is alive until its value is received,
                    // and `send` does not touch it after publishing.
                    unsafe { Signal::send(address as *const Signal<u32>, 9) };
                });
                // SAFETY: Only this thread receives.
                assert_eq!(unsafe { signal.recv() }, 9);
                drop(signal);
            });
        }
    }
}
