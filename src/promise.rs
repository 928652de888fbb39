//! The consumer side of a promise.
//!
//! A [`Promise`] is a single-consumer handle to one eventual [`Outcome`].
//! Every chaining method consumes the promise and returns the next link, so
//! "one continuation per promise" is enforced by ownership instead of a
//! runtime check. Fan-out goes through [`Promise::preserve`].
//!
//! Callbacks run on the thread that settles the upstream promise (or on the
//! installed scheduler's context), never on the thread that built the chain,
//! unless the upstream had already settled at chain time. A panicking
//! callback does not unwind through the dispatch loop; it is caught and
//! converted into a rejection carrying
//! [`CallbackPanic`](crate::types::CallbackPanic).

use crate::node::{
    chain_contains, finish, settle_now, subscribe_chain, take_core, AnyValue, CoreInner, CoreRef,
    PrevLink, Settled, Waiter, Worklist,
};
use crate::progress::{Fixed32, Listener, ProgressSink};
use crate::scheduler;
use crate::types::{Outcome, Reason, State};
use core::any::Any;
use core::fmt;
use core::marker::PhantomData;
use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

#[cfg(feature = "trace")]
use core::panic::Location;

/// A single-consumer handle to the eventual outcome of an async operation.
///
/// Obtained from [`Deferred::promise`](crate::Deferred::promise) or one of
/// the combinators. Dropping a promise without consuming it is fine; if it
/// carried a rejection that nothing observed, the rejection is forwarded to
/// the unhandled-rejection reporter when the node is recycled.
#[must_use = "an unconsumed promise reports its rejection as unhandled"]
pub struct Promise<T> {
    core: CoreRef,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Send + 'static> Promise<T> {
    pub(crate) fn from_core(core: CoreRef) -> Self {
        Self {
            core,
            _marker: PhantomData,
        }
    }

    pub(crate) fn into_core(self) -> CoreRef {
        self.core
    }

    pub(crate) fn core(&self) -> &CoreRef {
        &self.core
    }

    /// A promise that has already resolved with `value`.
    pub fn resolved(value: T) -> Self {
        let core = take_core(0);
        settle_now(core.inner(), Settled::Resolved(Box::new(value)));
        Self::from_core(core)
    }

    /// A promise that has already rejected with `reason`.
    pub fn rejected(reason: Reason) -> Self {
        let core = take_core(0);
        settle_now(core.inner(), Settled::Rejected(reason));
        Self::from_core(core)
    }

    /// A promise that has already been cancelled.
    pub fn cancelled() -> Self {
        let core = take_core(0);
        settle_now(core.inner(), Settled::Cancelled);
        Self::from_core(core)
    }

    /// The current lifecycle state.
    #[must_use]
    pub fn state(&self) -> State {
        self.core.state()
    }

    /// Returns true if the promise has not settled yet.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.core.state() == State::Pending
    }

    /// Takes the outcome if the promise has settled, or hands the promise
    /// back if it is still pending.
    ///
    /// Taking a rejected outcome counts as observing the rejection.
    pub fn try_settle(self) -> Result<Outcome<T>, Self> {
        if !self.core.state().is_terminal() {
            return Err(self);
        }
        match self.core.take_outcome() {
            Some(settled) => Ok(settled_into_outcome(settled, true)),
            None => Err(self),
        }
    }

    /// Chains a callback on resolution.
    ///
    /// Rejection and cancellation skip the callback and flow to the next
    /// link unchanged. A panic in the callback rejects the returned promise.
    #[cfg_attr(feature = "trace", track_caller)]
    pub fn then<U, F>(self, on_resolved: F) -> Promise<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        #[cfg(feature = "trace")]
        let site = Location::caller();
        self.chain(move |settled, target, wl| match settled {
            Settled::Resolved(value) => {
                let value = downcast_value::<T>(value);
                settle_with_callback(target, wl, move || on_resolved(value));
            }
            Settled::Rejected(reason) => {
                #[cfg(feature = "trace")]
                reason.push_site(site);
                target.inner().settle(Settled::Rejected(reason), wl);
            }
            Settled::Cancelled => {
                target.inner().settle(Settled::Cancelled, wl);
            }
        })
    }

    /// Chains a callback that itself returns a promise.
    ///
    /// The returned promise adopts the inner promise's eventual outcome, and
    /// its progress reporting bridges the inner chain into this one.
    ///
    /// # Panics
    ///
    /// The dispatch panics (on the settling thread) if the returned inner
    /// promise transitively waits on the promise returned here; that chain
    /// could never settle.
    pub fn then_promise<U, F>(self, on_resolved: F) -> Promise<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> Promise<U> + Send + 'static,
    {
        self.chain(move |settled, target, wl| match settled {
            Settled::Resolved(value) => {
                let value = downcast_value::<T>(value);
                match catch_unwind(AssertUnwindSafe(move || on_resolved(value))) {
                    Ok(inner) => adopt(inner, target, wl),
                    Err(payload) => {
                        target
                            .inner()
                            .settle(Settled::Rejected(Reason::from_panic(payload)), wl);
                    }
                }
            }
            other => {
                target.inner().settle(other, wl);
            }
        })
    }

    /// Chains a resolution callback and a catch-all rejection callback.
    ///
    /// Either way the returned promise resolves with `U` (unless a callback
    /// panics). Cancellation skips both callbacks.
    pub fn then_catch<U, F, G>(self, on_resolved: F, on_rejected: G) -> Promise<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
        G: FnOnce(&Reason) -> U + Send + 'static,
    {
        self.chain(move |settled, target, wl| match settled {
            Settled::Resolved(value) => {
                let value = downcast_value::<T>(value);
                settle_with_callback(target, wl, move || on_resolved(value));
            }
            Settled::Rejected(reason) => {
                reason.mark_handled();
                settle_with_callback(target, wl, move || on_rejected(&reason));
            }
            Settled::Cancelled => {
                target.inner().settle(Settled::Cancelled, wl);
            }
        })
    }

    /// Catches rejections whose payload has type `R`, resolving with the
    /// callback's value.
    ///
    /// Rejections of other types pass through unobserved, to be caught (or
    /// reported as unhandled) further down. Resolution and cancellation pass
    /// through unchanged.
    #[cfg_attr(feature = "trace", track_caller)]
    pub fn catch<R, F>(self, on_rejected: F) -> Promise<T>
    where
        R: Any + Send + Sync,
        F: FnOnce(&R) -> T + Send + 'static,
    {
        #[cfg(feature = "trace")]
        let site = Location::caller();
        self.chain(move |settled, target, wl| match settled {
            Settled::Rejected(reason) => {
                if reason.is::<R>() {
                    reason.mark_handled();
                    settle_with_callback(target, wl, move || {
                        let payload = reason.downcast_ref::<R>().expect("payload type checked");
                        on_rejected(payload)
                    });
                } else {
                    #[cfg(feature = "trace")]
                    reason.push_site(site);
                    target.inner().settle(Settled::Rejected(reason), wl);
                }
            }
            other => {
                target.inner().settle(other, wl);
            }
        })
    }

    /// Catches every rejection regardless of payload type.
    pub fn catch_all<F>(self, on_rejected: F) -> Promise<T>
    where
        F: FnOnce(&Reason) -> T + Send + 'static,
    {
        self.chain(move |settled, target, wl| match settled {
            Settled::Rejected(reason) => {
                reason.mark_handled();
                settle_with_callback(target, wl, move || on_rejected(&reason));
            }
            other => {
                target.inner().settle(other, wl);
            }
        })
    }

    /// Observes cancellation without consuming it.
    ///
    /// The callback runs if the chain is cancelled; the returned promise is
    /// still cancelled afterwards. A panic in the callback is reported as an
    /// unhandled rejection rather than replacing the cancellation.
    pub fn catch_cancellation<F>(self, on_cancelled: F) -> Promise<T>
    where
        F: FnOnce() + Send + 'static,
    {
        self.chain(move |settled, target, wl| {
            if matches!(settled, Settled::Cancelled) {
                if let Err(payload) = catch_unwind(AssertUnwindSafe(on_cancelled)) {
                    let reason = Reason::from_panic(payload);
                    reason.mark_handled();
                    scheduler::report_unhandled(&reason);
                }
            }
            target.inner().settle(settled, wl);
        })
    }

    /// Chains a callback that receives whatever outcome the promise settled
    /// with, including cancellation.
    ///
    /// Receiving a rejection this way counts as observing it. The returned
    /// promise resolves with the callback's value even when the input was
    /// rejected or cancelled.
    pub fn continue_with<U, F>(self, on_settled: F) -> Promise<U>
    where
        U: Send + 'static,
        F: FnOnce(Outcome<T>) -> U + Send + 'static,
    {
        self.chain(move |settled, target, wl| {
            let outcome = settled_into_outcome::<T>(settled, true);
            settle_with_callback(target, wl, move || on_settled(outcome));
        })
    }

    /// Subscribes a progress callback covering the chain up to this link.
    ///
    /// The callback receives normalized values in `[0, 1]`, monotonically
    /// non-decreasing, reaching `1.0` exactly when this promise resolves.
    /// Progress stops short of `1.0` on rejection or cancellation. The
    /// current position is replayed immediately on subscription.
    pub fn progress<F>(self, on_progress: F) -> Promise<T>
    where
        F: Fn(f64) + Send + Sync + 'static,
    {
        let listener = Listener::new(self.core.depth() + 1, Box::new(FnSink(Box::new(on_progress))));
        subscribe_chain(self.core.inner(), &listener);
        self
    }

    /// Converts to a multi-consumer handle.
    ///
    /// Each [`Preserved::promise`] call yields an independent promise that
    /// settles with a clone of the outcome, in subscription order.
    pub fn preserve(self) -> Preserved<T>
    where
        T: Clone,
    {
        let shared = Arc::new(PreserveShared {
            state: Mutex::new(PreserveState::Waiting(Vec::new())),
        });
        let core = self.into_core();
        let source = Arc::clone(core.inner());
        let mut wl = Worklist::new();
        source.attach_waiter(
            Box::new(PreserveWaiter {
                shared: Arc::clone(&shared),
                _source: core,
            }),
            &mut wl,
        );
        finish(wl);
        Preserved { shared }
    }

    fn chain<U: Send + 'static>(
        self,
        run: impl FnOnce(Settled, &CoreRef, &mut Worklist) + Send + 'static,
    ) -> Promise<U> {
        let upstream = self.into_core();
        let upstream_arc = Arc::clone(upstream.inner());
        let target = take_core(upstream.depth() + 1);
        let result = target.clone();
        target.set_previous(PrevLink {
            core: upstream,
            adopted: false,
        });
        let mut wl = Worklist::new();
        upstream_arc.attach_waiter(
            Box::new(Continuation {
                target,
                run: Box::new(run),
            }),
            &mut wl,
        );
        finish(wl);
        Promise::from_core(result)
    }
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise")
            .field("state", &self.core.state())
            .field("depth", &self.core.depth())
            .finish()
    }
}

/// The single registered continuation of one chain link.
struct Continuation {
    target: CoreRef,
    run: Box<dyn FnOnce(Settled, &CoreRef, &mut Worklist) + Send>,
}

impl Waiter for Continuation {
    fn handle(self: Box<Self>, settled: Settled, wl: &mut Worklist) {
        (self.run)(settled, &self.target, wl);
    }
}

/// Forwards an adopted promise's outcome into the adopting node.
struct Adopt {
    target: CoreRef,
}

impl Waiter for Adopt {
    fn handle(self: Box<Self>, settled: Settled, wl: &mut Worklist) {
        self.target.inner().settle(settled, wl);
    }
}

/// Re-reports an adopted chain's normalized progress in the adopting
/// chain's coordinates. Generation-checked so a recycled node never
/// receives progress meant for its previous occupant.
struct AdoptSink {
    target: Arc<CoreInner>,
    generation: u32,
    depth: u32,
}

impl ProgressSink for AdoptSink {
    fn report(&self, normalized: f64) {
        if self.target.core_id() != self.generation {
            return;
        }
        self.target
            .progress
            .report(Fixed32::from_depth_and_fraction(self.depth, normalized));
    }
}

struct FnSink(Box<dyn Fn(f64) + Send + Sync>);

impl ProgressSink for FnSink {
    fn report(&self, normalized: f64) {
        (self.0)(normalized);
    }
}

/// Adopts `inner`'s eventual outcome as `target`'s.
fn adopt<U: Send + 'static>(inner: Promise<U>, target: &CoreRef, wl: &mut Worklist) {
    let inner_core = inner.into_core();
    // Checked outside any panic guard: a self-waiting chain is fatal, not a
    // rejection, because no settle could ever reach it.
    assert!(
        !chain_contains(inner_core.inner(), target.inner()),
        "promise chain cycle: a continuation returned a promise waiting on its own result"
    );
    let bridge = Listener::new(
        inner_core.depth() + 1,
        Box::new(AdoptSink {
            target: Arc::clone(target.inner()),
            generation: target.core_id(),
            depth: target.depth(),
        }),
    );
    subscribe_chain(inner_core.inner(), &bridge);
    let inner_arc = Arc::clone(inner_core.inner());
    target.set_previous(PrevLink {
        core: inner_core,
        adopted: true,
    });
    inner_arc.attach_waiter(Box::new(Adopt { target: target.clone() }), wl);
}

/// Runs a user callback under a panic guard and settles `target` with its
/// value, or with a rejection wrapping the panic.
fn settle_with_callback<U: Send + 'static>(
    target: &CoreRef,
    wl: &mut Worklist,
    callback: impl FnOnce() -> U,
) {
    match catch_unwind(AssertUnwindSafe(callback)) {
        Ok(value) => {
            target.inner().settle(Settled::Resolved(Box::new(value)), wl);
        }
        Err(payload) => {
            target
                .inner()
                .settle(Settled::Rejected(Reason::from_panic(payload)), wl);
        }
    }
}

pub(crate) fn downcast_value<T: 'static>(value: AnyValue) -> T {
    match value.downcast::<T>() {
        Ok(boxed) => *boxed,
        Err(_) => panic!(
            "promise value was not a {}",
            core::any::type_name::<T>()
        ),
    }
}

/// Converts the wire form into the public outcome. With `observe` set, a
/// rejection is marked handled, so it will not also be reported as unhandled.
pub(crate) fn settled_into_outcome<T: 'static>(settled: Settled, observe: bool) -> Outcome<T> {
    match settled {
        Settled::Resolved(value) => Outcome::Resolved(downcast_value::<T>(value)),
        Settled::Rejected(reason) => {
            if observe {
                reason.mark_handled();
            }
            Outcome::Rejected(reason)
        }
        Settled::Cancelled => Outcome::Cancelled,
    }
}

fn outcome_into_settled<T: Send + 'static>(outcome: Outcome<T>) -> Settled {
    match outcome {
        Outcome::Resolved(value) => Settled::Resolved(Box::new(value)),
        Outcome::Rejected(reason) => Settled::Rejected(reason),
        Outcome::Cancelled => Settled::Cancelled,
    }
}

enum PreserveState<T> {
    Waiting(Vec<CoreRef>),
    Done(Outcome<T>),
}

struct PreserveShared<T> {
    state: Mutex<PreserveState<T>>,
}

impl<T> Drop for PreserveShared<T> {
    fn drop(&mut self) {
        // A preserved rejection no subscriber ever took still gets reported.
        if let PreserveState::Done(Outcome::Rejected(reason)) = &*self.state.get_mut() {
            if reason.mark_handled() {
                scheduler::report_unhandled(reason);
            }
        }
    }
}

struct PreserveWaiter<T> {
    shared: Arc<PreserveShared<T>>,
    // Keeps the source node alive until it settles.
    _source: CoreRef,
}

impl<T: Clone + Send + 'static> Waiter for PreserveWaiter<T> {
    fn handle(self: Box<Self>, settled: Settled, wl: &mut Worklist) {
        // Not observed here: each subscriber (or the unhandled reporter, if
        // there are none) observes the shared reason later.
        let outcome = settled_into_outcome::<T>(settled, false);
        let waiters = {
            let mut state = self.shared.state.lock();
            match core::mem::replace(&mut *state, PreserveState::Done(outcome.clone())) {
                PreserveState::Waiting(waiters) => waiters,
                PreserveState::Done(_) => Vec::new(),
            }
        };
        // Subscription order is delivery order.
        for target in waiters {
            target
                .inner()
                .settle(outcome_into_settled(outcome.clone()), wl);
        }
    }
}

/// A multi-consumer handle to a settled-or-pending outcome.
///
/// Cloning shares the subscription list. Each call to [`Preserved::promise`]
/// yields an independent single-consumer promise.
#[derive(Clone)]
pub struct Preserved<T> {
    shared: Arc<PreserveShared<T>>,
}

impl<T: Clone + Send + 'static> Preserved<T> {
    /// Subscribes a new consumer.
    ///
    /// If the source already settled, the returned promise settles
    /// immediately with a clone of the outcome.
    pub fn promise(&self) -> Promise<T> {
        let mut state = self.shared.state.lock();
        match &mut *state {
            PreserveState::Waiting(waiters) => {
                let target = take_core(0);
                waiters.push(target.clone());
                Promise::from_core(target)
            }
            PreserveState::Done(outcome) => {
                let settled = outcome_into_settled(outcome.clone());
                drop(state);
                let target = take_core(0);
                settle_now(target.inner(), settled);
                Promise::from_core(target)
            }
        }
    }
}

impl<T> fmt::Debug for Preserved<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let settled = matches!(&*self.shared.state.lock(), PreserveState::Done(_));
        f.debug_struct("Preserved").field("settled", &settled).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deferred::Deferred;
    use crate::types::CallbackPanic;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn settled<T: Send + 'static>(promise: Promise<T>) -> Outcome<T> {
        promise.try_settle().ok().expect("promise should have settled")
    }

    #[test]
    fn then_maps_the_resolved_value() {
        let mut deferred = Deferred::new();
        let chained = deferred.promise().then(|v: i32| v + 1);
        deferred.resolve(41);
        assert_eq!(settled(chained), Outcome::Resolved(42));
    }

    #[test]
    fn then_passes_rejection_through_unobserved() {
        let mut deferred = Deferred::<i32>::new();
        let chained = deferred
            .promise()
            .then(|_| unreachable!("resolution callback must be skipped"));
        deferred.reject(Reason::new("nope"));
        let outcome: Outcome<i32> = settled(chained);
        assert_eq!(outcome.reason().and_then(Reason::downcast_ref::<&str>), Some(&"nope"));
    }

    #[test]
    fn typed_catch_routes_by_payload_type() {
        let mut deferred = Deferred::<i32>::new();
        let chained = deferred
            .promise()
            .catch(|_: &String| unreachable!("wrong payload type"))
            .catch(|&code: &i32| code * 10);
        deferred.reject(Reason::new(7_i32));
        assert_eq!(settled(chained), Outcome::Resolved(70));
    }

    #[test]
    fn callback_panic_becomes_rejection() {
        let chained = Promise::resolved(1_i32)
            .then(|_| -> i32 { panic!("kaboom") })
            .catch(|panic: &CallbackPanic| {
                assert_eq!(panic.message(), "kaboom");
                -1
            });
        assert_eq!(settled(chained), Outcome::Resolved(-1));
    }

    #[test]
    fn then_promise_adopts_inner_outcome() {
        let mut inner = Deferred::new();
        let inner_promise = inner.promise();
        let chained = Promise::resolved(10_i32).then_promise(move |v| {
            inner_promise.then(move |w: i32| v + w)
        });
        assert!(chained.is_pending());
        inner.resolve(32);
        assert_eq!(settled(chained), Outcome::Resolved(42));
    }

    #[test]
    fn continue_with_observes_cancellation() {
        let mut deferred = Deferred::<i32>::new();
        let chained = deferred
            .promise()
            .continue_with(|outcome| matches!(outcome, Outcome::Cancelled));
        deferred.cancel();
        assert_eq!(settled(chained), Outcome::Resolved(true));
    }

    #[test]
    fn catch_cancellation_observes_but_stays_cancelled() {
        let observed = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&observed);
        let chained = Promise::<i32>::cancelled().catch_cancellation(move || {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        assert!(settled(chained).is_cancelled());
        assert_eq!(observed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn progress_reaches_one_exactly_at_resolution() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let mut deferred = Deferred::<i32>::new();
        let chained = deferred
            .promise()
            .then(|v| v)
            .progress(move |p| sink.lock().push(p));

        deferred.report_progress(0.5);
        deferred.resolve(1);
        assert!(settled(chained).is_resolved());

        let seen = seen.lock().clone();
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
        assert!((seen.last().copied().unwrap_or(0.0) - 1.0).abs() < f64::EPSILON);
        assert!(seen.iter().all(|&p| (0.0..=1.0).contains(&p)));
        // The half-done report lands at a quarter of the two-link chain.
        assert!(seen.iter().any(|&p| (p - 0.25).abs() < 0.01));
    }

    #[test]
    fn preserve_fans_out_clones_in_subscription_order() {
        let mut deferred = Deferred::new();
        let preserved = deferred.promise().preserve();
        let first = preserved.promise();
        let second = preserved.promise();
        deferred.resolve(String::from("shared"));
        assert_eq!(settled(first), Outcome::Resolved(String::from("shared")));
        // Late subscription after settle still delivers.
        let third = preserved.promise();
        assert_eq!(settled(second), Outcome::Resolved(String::from("shared")));
        assert_eq!(settled(third), Outcome::Resolved(String::from("shared")));
    }

    #[test]
    #[should_panic(expected = "promise chain cycle")]
    fn self_adoption_panics() {
        let mut outer = Deferred::new();
        let outer_promise = outer.promise();
        let holder: Arc<Mutex<Option<Promise<i32>>>> = Arc::new(Mutex::new(None));
        let stash = Arc::clone(&holder);
        let chained = outer_promise.then_promise(move |_: i32| {
            stash
                .lock()
                .take()
                .expect("result promise stashed before resolve")
        });
        *holder.lock() = Some(chained.then(|v| v));
        outer.resolve(1);
    }
}
