//! Error types for the producer-facing `try_` APIs.
//!
//! The crate distinguishes three failure classes:
//!
//! - **Programming errors** (settling through an expired handle via the
//!   panicking API, racing an empty set, a self-awaiting chain, retain
//!   underflow) panic at the call site; they indicate a bug in consumer
//!   code, not an async-domain failure.
//! - **Domain rejections** travel as [`Reason`](crate::Reason) values through
//!   the chain.
//! - **Benign races** (two producers trying to settle the same deferred) are
//!   reported through [`SettleError`] by the `try_` variants.

use thiserror::Error;

/// Why a `try_` settle operation did not take effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SettleError {
    /// The deferred was already settled (or its cancellation fired first).
    #[error("deferred already settled")]
    AlreadySettled,
    /// The producer generation was invalidated under the handle, typically
    /// by a cancellation token whose settle is still in flight.
    #[error("deferred handle expired")]
    Expired,
}
