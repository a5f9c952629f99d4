//! Strand core runtime
//!
//! A single-threaded cooperative event loop and the composable promise
//! graph it evaluates:
//! - Promise combinators (transform, chain, fork, joins, attachments)
//! - Three-queue dispatch (depth-first, breadth-first, last)
//! - Cancellation by destruction throughout the graph
//! - External fulfillers, synchronous wait/poll
//! - Stackful fibers suspending on promise readiness
//! - Rust `Future` integration in both directions
//! - A cross-thread executor for delegating work between loops
//!
//! The loop is a per-thread singleton: create an [`EventLoop`], take its
//! [`WaitScope`], build promises, and `wait` on them.
//!
//! ```
//! use strand_core::{EventLoop, Promise};
//!
//! let event_loop = EventLoop::new();
//! let scope = event_loop.wait_scope();
//!
//! let value = Promise::resolved(1)
//!     .map(|x| x + 2)
//!     .map(|x| x * 3)
//!     .wait(&scope)
//!     .unwrap();
//! assert_eq!(value, 9);
//! ```

mod exec;
mod failure;
mod node;
mod outcome;
mod promise;

pub use exec::event_loop::{EventLoop, WaitScope};
pub use exec::executor::{current_thread_executor, Executor};
pub use exec::fiber::{start_fiber, FiberScope};
pub use failure::{Failure, FailureKind};
pub use node::{promise_and_fulfiller, ForkedPromise, Fulfiller, PromiseFuture};
pub use outcome::Outcome;
pub use promise::{
    eval_last, eval_later, join_promises, retry_on_disconnect, yield_last, yield_now, Promise,
};
