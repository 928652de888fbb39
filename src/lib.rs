//! Deferral: a pooled, exactly-once promise engine with progress and
//! cooperative cancellation.
//!
//! # Overview
//!
//! Deferral separates every async operation into a producer half
//! ([`Deferred`]) and a consumer half ([`Promise`]). A promise settles
//! exactly once into one of three terminal states (resolved, rejected,
//! cancelled); settling is a single compare-and-swap, and generation
//! counters on the pooled nodes turn every stale-handle race into a clean
//! no-op instead of a use-after-recycle.
//!
//! # Core Guarantees
//!
//! - **Exactly-once settlement**: racing settles have one winner; losers
//!   observe a `try_` failure, never a torn state
//! - **No silent rejections**: a rejection nothing observed is forwarded to
//!   the unhandled-rejection reporter exactly once per shared payload
//! - **Flat dispatch**: continuation chains run through an explicit
//!   worklist, so chain length never translates into stack depth
//! - **Monotonic progress**: chain-normalized progress never regresses and
//!   reaches `1.0` exactly at resolution
//! - **Cooperative cancellation**: tokens flip pending chains to cancelled;
//!   they never unwind in-flight work
//!
//! # Module Structure
//!
//! - [`types`]: Lifecycle state, outcomes, rejection reasons
//! - [`cancel`]: Cancellation sources, tokens, registrations
//! - [`deferred`]: The producer handle
//! - [`promise`]: The consumer handle and chaining API
//! - [`progress`]: Fixed-point progress values and listeners
//! - [`scheduler`]: The host boundary for dispatch and diagnostics
//! - [`error`]: Errors reported by the `try_` producer APIs
//!
//! # Example
//!
//! ```
//! use deferral::{Deferred, Outcome};
//!
//! let mut deferred = Deferred::new();
//! let chained = deferred.promise().then(|v: i32| v + 1);
//! deferred.resolve(41);
//! assert_eq!(chained.try_settle().ok(), Some(Outcome::Resolved(42)));
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]

pub mod cancel;
mod combinator;
pub mod deferred;
pub mod error;
mod future;
mod node;
mod pool;
pub mod progress;
pub mod promise;
pub mod scheduler;
pub mod types;

pub use cancel::{CancelRegistration, CancelSource, CancelToken};
pub use deferred::{Deferred, UnhandledDeferred};
pub use error::SettleError;
pub use progress::Fixed32;
pub use promise::{Preserved, Promise};
pub use scheduler::{
    clear_scheduler, clear_unhandled_handler, install_queue_scheduler, install_scheduler,
    run_pending, set_unhandled_handler, Job, QueueScheduler, Scheduler,
};
pub use types::{CallbackPanic, Outcome, OutcomeError, Reason, State};
