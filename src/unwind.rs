//! Unwinding recovery utilities, in the style of rayon.
//!
//! Panics are the failure channel for chunk bodies and launched jobs. Fork-join
//! chunks capture them with [`halt_unwinding`] and the scheduler hands the first
//! one back to the caller with [`resume_unwinding`]. Launched jobs are captured
//! by the worker loop and only logged.

use alloc::boxed::Box;
use alloc::string::String;
use core::any::Any;
use core::panic::AssertUnwindSafe;
use std::eprintln;
use std::panic::catch_unwind;
use std::panic::resume_unwind;
use std::process::abort;
use std::thread::Result;

/// The payload carried by a captured panic.
pub type Payload = Box<dyn Any + Send>;

/// Executes `f` and captures any panic, translating that panic into a
/// `Err` result. The assumption is that any panic will be propagated
/// later with `resume_unwinding` (or deliberately dropped), and hence `f` can
/// be treated as exception safe.
#[inline(always)]
pub fn halt_unwinding<F, R>(func: F) -> Result<R>
where
    F: FnOnce() -> R,
{
    catch_unwind(AssertUnwindSafe(func))
}

#[cold]
pub fn resume_unwinding(payload: Payload) -> ! {
    resume_unwind(payload)
}

/// Best-effort extraction of the message from a panic payload, for logging.
pub fn payload_message(payload: &Payload) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        String::from(*message)
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        String::from("<non-string panic payload>")
    }
}

/// Aborts the program when dropped.
///
/// Held across sections where unwinding would leave queued jobs pointing at a
/// dead stack frame. Forget it once the section completes.
pub struct AbortOnDrop;

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        eprintln!("fanout: detected unexpected panic; aborting");
        abort();
    }
}
