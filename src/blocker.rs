//! Blocking a thread on a future.

use alloc::sync::Arc;
use alloc::task::Wake;
use core::future::Future;
use core::pin::pin;
use core::task::Context;
use core::task::Poll;
use core::task::Waker;

use crate::platform;
use crate::platform::AtomicU32;
use crate::platform::Ordering;

// -----------------------------------------------------------------------------
// States

/// The blocker is not sleeping, and has not been woken.
const IDLE: u32 = 0;

// The blocker is sleeping or is about to go to sleep.
const WAIT: u32 = 1;

// The blocker has been woken at least once since the last time it slept.
const WAKE: u32 = 2;

// -----------------------------------------------------------------------------
// Blocker

/// Parks a thread until the future it is polling is woken.
///
/// Blockers are shared with the waker through an `Arc`, so wakers cloned by
/// the future may safely outlive the call to [`block_on`].
struct Blocker {
    state: AtomicU32,
}

impl Blocker {
    fn new() -> Blocker {
        Blocker {
            state: AtomicU32::new(IDLE),
        }
    }

    /// Blocks the thread until woken. Returns immediately if a wake arrived
    /// since the last call.
    fn block(&self) {
        if self.state.swap(WAIT, Ordering::Acquire) != WAKE {
            while self.state.load(Ordering::Acquire) == WAIT {
                platform::wait(&self.state, WAIT);
            }
        }
        self.state.store(IDLE, Ordering::Relaxed);
    }
}

impl Wake for Blocker {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        if self.state.swap(WAKE, Ordering::Release) == WAIT {
            platform::wake_all(&self.state);
        }
    }
}

/// Blocks the calling thread until `future` completes, and returns its output.
///
/// Typically used to wait on a [`Task`](async_task::Task) returned by
/// [`launch_future`](crate::launch_future). Calling this from a worker of the
/// pool the awaited task runs on can deadlock, if every worker ends up blocked.
pub fn block_on<F: Future>(future: F) -> F::Output {
    let mut future = pin!(future);
    let blocker = Arc::new(Blocker::new());
    let waker = Waker::from(blocker.clone());
    let mut cx = Context::from_waker(&waker);
    loop {
        if let Poll::Ready(output) = future.as_mut().poll(&mut cx) {
            return output;
        }
        blocker.block();
    }
}

#[cfg(test)]
mod test {
    use core::sync::atomic::AtomicBool;
    use core::time::Duration;
    use std::thread;

    use super::*;

    #[test]
    fn ready_future() {
        assert_eq!(block_on(async { 3 }), 3);
    }

    #[test]
    fn wake_before_block_is_not_lost() {
        let blocker = Arc::new(Blocker::new());
        Waker::from(blocker.clone()).wake_by_ref();
        // Would hang if the wake were dropped.
        blocker.block();
    }

    /// Completes on its second poll, after being woken from another thread.
    struct WokenLater {
        started: bool,
        done: Arc<AtomicBool>,
    }

    impl Future for WokenLater {
        type Output = &'static str;

        fn poll(mut self: core::pin::Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
            if self.done.load(Ordering::Acquire) {
                return Poll::Ready("woken");
            }
            if !self.started {
                self.started = true;
                let done = self.done.clone();
                let waker = cx.waker().clone();
                thread::spawn(move || {
                    thread::sleep(Duration::from_millis(10));
                    done.store(true, Ordering::Release);
                    waker.wake();
                });
            }
            Poll::Pending
        }
    }

    #[test]
    fn future_woken_from_another_thread() {
        let future = WokenLater {
            started: false,
            done: Arc::new(AtomicBool::new(false)),
        };
        assert_eq!(block_on(future), "woken");
    }
}
