//! Stackful coroutine engine.
//!
//! Built on the `context` crate rather than a hand-rolled per-arch
//! assembly shim — the same crate family `coio-rs`/`mioco` use for
//! exactly this purpose.

pub mod engine;
pub mod stack;
pub mod switch;

pub use engine::{co_start, co_wait, co_wake, co_yield_now, Coroutine};
pub use stack::CoroutineStack;
pub use switch::{with_env, PendingPredicate, SwitchOutcome, WorkerEnv};
