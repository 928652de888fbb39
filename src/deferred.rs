//! The producer side of a promise.
//!
//! A [`Deferred`] is the write capability for exactly one pending promise.
//! It carries a snapshot of the node's producer generation; every settle
//! attempt must win a compare-and-swap against that generation first, so two
//! racing producers (or a producer racing the cancellation callback, or a
//! handle that outlived a pool recycle) resolve to exactly one winner without
//! locks.

use crate::cancel::CancelToken;
use crate::error::SettleError;
use crate::node::{settle_now, take_core, CoreRef, Settled};
use crate::progress::Fixed32;
use crate::promise::Promise;
use crate::scheduler;
use crate::types::{Reason, State};
use core::fmt;
use core::marker::PhantomData;

/// The producer handle for a single promise.
///
/// Create one with [`Deferred::new`], hand out the consumer side via
/// [`Deferred::promise`], and settle exactly once with
/// [`resolve`](Deferred::resolve), [`reject`](Deferred::reject) or
/// [`cancel`](Deferred::cancel). The panicking settle methods treat a second
/// settle as a bug; the `try_` variants report it as [`SettleError`] for
/// producers that legitimately race (a callback racing a timeout, say).
///
/// Dropping a deferred that never settled cancels its promise and reports an
/// [`UnhandledDeferred`] diagnostic through the unhandled-rejection reporter,
/// so an abandoned producer is loud instead of leaving consumers waiting
/// forever.
pub struct Deferred<T> {
    core: Option<CoreRef>,
    deferred_id: u32,
    promise_taken: bool,
    _marker: PhantomData<fn(T)>,
}

impl<T: Send + 'static> Deferred<T> {
    /// Creates a deferred with a fresh pending promise.
    #[must_use]
    pub fn new() -> Self {
        let core = take_core(0);
        let deferred_id = core.deferred_id();
        Self {
            core: Some(core),
            deferred_id,
            promise_taken: false,
            _marker: PhantomData,
        }
    }

    /// Creates a deferred whose promise cancels when `token` cancels.
    ///
    /// The token wins ties: once it fires, resolve and reject attempts fail
    /// even if they were already in flight. Settling through this deferred
    /// unregisters the callback, releasing whatever the token captured.
    ///
    /// If the token has already cancelled, the returned deferred's promise is
    /// cancelled immediately.
    #[must_use]
    pub fn with_token(token: &CancelToken) -> Self {
        let core = take_core(0);
        let deferred_id = core.deferred_id();
        let hook = core.clone();
        let reg = token.register(move || {
            // Invalidate the producer before settling, so a resolve racing
            // this callback cannot slip in after the token observably fired.
            hook.bump_deferred_id();
            settle_now(hook.inner(), Settled::Cancelled);
        });
        core.set_cancel_registration(reg);
        Self {
            core: Some(core),
            deferred_id,
            promise_taken: false,
            _marker: PhantomData,
        }
    }

    /// Takes the consumer side.
    ///
    /// # Panics
    ///
    /// Panics if called twice; a deferred produces exactly one promise. Use
    /// [`Promise::preserve`] for multi-consumer fan-out.
    #[must_use]
    pub fn promise(&mut self) -> Promise<T> {
        assert!(!self.promise_taken, "promise already taken from this deferred");
        self.promise_taken = true;
        let core = self
            .core
            .as_ref()
            .expect("deferred core present until settle or drop");
        Promise::from_core(core.clone())
    }

    /// Returns true if this handle is still the live producer generation
    /// and the promise has not settled.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.core.as_ref().is_some_and(|core| {
            core.deferred_id() == self.deferred_id && core.state() == State::Pending
        })
    }

    /// Resolves the promise with `value`.
    ///
    /// # Panics
    ///
    /// Panics if the deferred already settled or its cancellation fired.
    pub fn resolve(self, value: T) {
        if let Err(err) = self.try_resolve(value) {
            panic!("resolve on a dead deferred: {err}");
        }
    }

    /// Rejects the promise with `reason`.
    ///
    /// # Panics
    ///
    /// Panics if the deferred already settled or its cancellation fired.
    pub fn reject(self, reason: Reason) {
        if let Err(err) = self.try_reject(reason) {
            panic!("reject on a dead deferred: {err}");
        }
    }

    /// Cancels the promise directly, without a token.
    ///
    /// # Panics
    ///
    /// Panics if the deferred already settled or its cancellation fired.
    pub fn cancel(self) {
        if let Err(err) = self.try_cancel() {
            panic!("cancel on a dead deferred: {err}");
        }
    }

    /// Attempts to resolve; a lost race drops `value` and reports why.
    pub fn try_resolve(self, value: T) -> Result<(), SettleError> {
        self.settle(Settled::Resolved(Box::new(value)))
    }

    /// Attempts to reject; a lost race drops `reason` and reports why.
    pub fn try_reject(self, reason: Reason) -> Result<(), SettleError> {
        self.settle(Settled::Rejected(reason))
    }

    /// Attempts to cancel the promise directly.
    pub fn try_cancel(self) -> Result<(), SettleError> {
        self.settle(Settled::Cancelled)
    }

    /// Reports fractional progress for the work this deferred represents.
    ///
    /// # Panics
    ///
    /// Panics if `fraction` is outside `[0, 1]` or the deferred is no longer
    /// the live pending producer.
    pub fn report_progress(&self, fraction: f64) {
        assert!(
            self.try_report_progress(fraction),
            "progress report on a dead deferred"
        );
    }

    /// Reports progress, returning false instead of panicking when this
    /// handle is no longer the live pending producer.
    ///
    /// # Panics
    ///
    /// Still panics on a `fraction` outside `[0, 1]`; that is a bug in the
    /// producer, not a race.
    pub fn try_report_progress(&self, fraction: f64) -> bool {
        assert!(
            (0.0..=1.0).contains(&fraction),
            "progress fraction must be within [0, 1], got {fraction}"
        );
        let Some(core) = self.core.as_ref() else {
            return false;
        };
        if core.deferred_id() != self.deferred_id || core.state() != State::Pending {
            return false;
        }
        core.progress
            .report(Fixed32::from_depth_and_fraction(core.depth(), fraction));
        true
    }

    fn settle(mut self, settled: Settled) -> Result<(), SettleError> {
        let core = self
            .core
            .take()
            .expect("deferred core present until settle or drop");
        if !core.try_bump_deferred_id(self.deferred_id) {
            // Still pending means the generation was invalidated under us
            // (the token callback fired but its settle is still in flight).
            return Err(if core.state() == State::Pending {
                SettleError::Expired
            } else {
                SettleError::AlreadySettled
            });
        }
        if let Some(mut reg) = core.take_cancel_registration() {
            // Losing the unregister race means the token callback is firing;
            // its settle and ours race on the state CAS, which is fine.
            reg.try_unregister();
        }
        settle_now(core.inner(), settled);
        Ok(())
    }
}

impl<T: Send + 'static> Default for Deferred<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for Deferred<T> {
    fn drop(&mut self) {
        let Some(core) = self.core.take() else {
            return;
        };
        if !core.try_bump_deferred_id(self.deferred_id) {
            return;
        }
        // Abandoned while still the live producer: nothing can ever settle
        // this promise now, so cancel it (unblocking consumers) and report
        // the abandonment.
        if let Some(mut reg) = core.take_cancel_registration() {
            reg.try_unregister();
        }
        if core.state() == State::Pending {
            let reason = Reason::new(UnhandledDeferred);
            reason.mark_handled();
            scheduler::report_unhandled(&reason);
            settle_now(core.inner(), Settled::Cancelled);
        }
    }
}

impl<T> fmt::Debug for Deferred<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.core.as_ref().map(|core| core.state());
        f.debug_struct("Deferred")
            .field("generation", &self.deferred_id)
            .field("state", &state)
            .finish()
    }
}

/// Diagnostic payload reported when a deferred is dropped without settling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnhandledDeferred;

impl fmt::Display for UnhandledDeferred {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("deferred dropped without being settled")
    }
}
