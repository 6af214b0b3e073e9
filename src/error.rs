//! Error kinds for the runtime core.
//!
//! Resource exhaustion, invalid argument, state violation and lock
//! poisoning are all recoverable and returned through [`FlowrtError`];
//! stack-canary and page-protection failures are fatal and abort the
//! process instead of unwinding (see [`fatal`]).

use std::fmt;

/// Result alias used throughout the core.
pub type FlowrtResult<T> = Result<T, FlowrtError>;

/// Recoverable error kinds produced by the runtime core.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FlowrtError {
    /// Stack, slab or worker-thread allocation failed.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Bad QoS, non-positive count, undersized buffer, unknown queue type.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Submit on an exiting queue, cancel of an already-running task,
    /// MOD of a non-existent fd, double-register of a worker count, etc.
    #[error("state violation: {0}")]
    StateViolation(String),

    /// A lock was poisoned by a panicking holder.
    #[error("lock poisoned: {0}")]
    LockPoisoned(String),
}

impl FlowrtError {
    pub fn resource_exhausted(msg: impl Into<String>) -> Self {
        Self::ResourceExhausted(msg.into())
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn state_violation(msg: impl Into<String>) -> Self {
        Self::StateViolation(msg.into())
    }

    pub fn lock_poisoned(msg: impl Into<String>) -> Self {
        Self::LockPoisoned(msg.into())
    }
}

/// Status codes mirroring a C ABI boundary's integer return values:
/// local errors are returned as integer codes across the ABI; inside
/// the core they stay booleans/options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum StatusCode {
    Success = 0,
    Failed = 1,
    InvalidArg = -1,
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatusCode::Success => write!(f, "success"),
            StatusCode::Failed => write!(f, "failed"),
            StatusCode::InvalidArg => write!(f, "invalid-arg"),
        }
    }
}

impl From<FlowrtError> for StatusCode {
    fn from(e: FlowrtError) -> Self {
        match e {
            FlowrtError::InvalidArgument(_) => StatusCode::InvalidArg,
            _ => StatusCode::Failed,
        }
    }
}

/// Abort the process with a diagnostic line. Used exclusively for the
/// fatal-error class: stack canary mismatch, page protection failure,
/// worker env allocation failure. These are not modeled as `Result`
/// because the invariant they protect (a coroutine stack is not
/// corrupted) cannot be soundly recovered from.
#[cold]
#[inline(never)]
pub fn fatal(component: &str, detail: &str) -> ! {
    log::error!("fatal error in {component}: {detail}");
    std::process::abort();
}
