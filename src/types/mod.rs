//! Core types for the promise lifecycle.
//!
//! - [`State`]: the four-state promise lifecycle
//! - [`Outcome`]: the terminal outcome lattice
//! - [`Reason`]: shared rejection payload with exactly-once handling

pub mod outcome;
pub mod reason;
pub mod state;

pub use outcome::{Outcome, OutcomeError};
pub use reason::{CallbackPanic, Reason};
pub use state::State;
