//! Errors reported by the scheduling and configuration entry points.
//!
//! Failures inside chunk bodies are not errors: they are panics, resumed on the
//! caller once every chunk has finished.

use crate::thread_pool::Role;

/// Errors reported by `fanout`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// A fork-join primitive was called with a negative grain size. No work
    /// was performed.
    #[error("invalid grain size {0}: expected a non-negative value")]
    InvalidGrainSize(i64),
    /// A pool was configured with zero threads.
    #[error("invalid number of {0} threads: expected a positive value")]
    InvalidThreadCount(Role),
    /// A pool was configured after it was first used, or configured twice.
    /// The configuration had no effect.
    #[error(
        "cannot set the number of {0} threads after parallel work has started or after a previous call"
    )]
    ConfigurationAfterUse(Role),
}
