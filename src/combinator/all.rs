//! Waiting on every input: `Promise::all`.

use super::pass_through::{Combine, PassThrough};
use crate::node::{finish, subscribe_chain, take_core, CoreRef, Settled, Worklist};
use crate::progress::{Fixed32, Listener, ProgressSink, DECIMAL_BITS};
use crate::promise::{downcast_value, Promise};
use crate::scheduler;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

impl<T: Send + 'static> Promise<T> {
    /// Resolves with every input's value, in input order, once all inputs
    /// resolve.
    ///
    /// The first rejection or cancellation settles the result immediately
    /// with that outcome and detaches the remaining inputs; their later
    /// rejections (now unobservable through this result) go to the
    /// unhandled-rejection reporter. An empty input set resolves immediately
    /// with an empty `Vec`.
    ///
    /// Progress on the result is the unit-weighted average of the input
    /// chains, reaching `1.0` exactly when the last input resolves.
    pub fn all<I>(promises: I) -> Promise<Vec<T>>
    where
        I: IntoIterator<Item = Promise<T>>,
    {
        let cores: Vec<CoreRef> = promises.into_iter().map(Promise::into_core).collect();
        if cores.is_empty() {
            return Promise::resolved(Vec::new());
        }
        let count = cores.len();
        let units: Vec<u32> = cores.iter().map(|core| core.depth() + 1).collect();
        let total_units: u64 = units.iter().map(|&u| u64::from(u)).sum();
        let target = take_core(0);
        let result = target.clone();
        let state = Arc::new(AllState {
            target,
            decided: AtomicBool::new(false),
            remaining: AtomicUsize::new(count),
            results: Mutex::new((0..count).map(|_| None::<T>).collect()),
            inputs: Mutex::new(cores.iter().map(|core| Some(core.clone())).collect()),
            contributions: Mutex::new(vec![0_u64; count]),
            units,
            total_units,
        });

        let mut wl = Worklist::new();
        for (index, core) in cores.into_iter().enumerate() {
            let listener = Listener::new(
                state.units[index],
                Box::new(AllSink {
                    state: Arc::downgrade(&state),
                    index,
                }),
            );
            subscribe_chain(core.inner(), &listener);
            let input = Arc::clone(core.inner());
            input.attach_waiter(
                Box::new(PassThrough {
                    state: Arc::clone(&state),
                    index,
                }),
                &mut wl,
            );
        }
        finish(wl);
        Promise::from_core(result)
    }
}

struct AllState<T> {
    target: CoreRef,
    decided: AtomicBool,
    remaining: AtomicUsize,
    results: Mutex<Vec<Option<T>>>,
    inputs: Mutex<Vec<Option<CoreRef>>>,
    /// Per-input progress in raw fixed-point ticks, monotone per slot.
    contributions: Mutex<Vec<u64>>,
    units: Vec<u32>,
    total_units: u64,
}

impl<T: Send + 'static> AllState<T> {
    fn detach_others(&self, deciding: usize) {
        let mut inputs = self.inputs.lock();
        for (index, slot) in inputs.iter_mut().enumerate() {
            if index == deciding {
                continue;
            }
            if let Some(core) = slot.take() {
                drop(core.take_waiter());
            }
        }
    }
}

impl<T: Send + 'static> Combine for AllState<T> {
    fn input_settled(&self, index: usize, settled: Settled, wl: &mut Worklist) {
        self.inputs.lock()[index] = None;
        match settled {
            Settled::Resolved(value) => {
                let value = downcast_value::<T>(value);
                self.results.lock()[index] = Some(value);
                if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1
                    && !self.decided.swap(true, Ordering::AcqRel)
                {
                    let values: Vec<T> = self
                        .results
                        .lock()
                        .iter_mut()
                        .map(|slot| slot.take().expect("every input stored a value"))
                        .collect();
                    self.target
                        .inner()
                        .settle(Settled::Resolved(Box::new(values)), wl);
                }
            }
            other => {
                self.remaining.fetch_sub(1, Ordering::AcqRel);
                if !self.decided.swap(true, Ordering::AcqRel) {
                    self.detach_others(index);
                    self.target.inner().settle(other, wl);
                } else if let Settled::Rejected(reason) = other {
                    // Arrived after the decision: nothing downstream can see
                    // it anymore, same as a detached input's rejection.
                    if reason.mark_handled() {
                        scheduler::report_unhandled(&reason);
                    }
                }
            }
        }
    }
}

/// Folds one input chain's normalized progress into the aggregate.
struct AllSink<T> {
    state: Weak<AllState<T>>,
    index: usize,
}

impl<T: Send + 'static> ProgressSink for AllSink<T> {
    fn report(&self, normalized: f64) {
        let Some(state) = self.state.upgrade() else {
            return;
        };
        if state.decided.load(Ordering::Acquire) {
            return;
        }
        let span = u64::from(state.units[self.index]) << DECIMAL_BITS;
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
        let ticks = ((normalized * span as f64) as u64).min(span);
        let fraction = {
            let mut contributions = state.contributions.lock();
            if ticks <= contributions[self.index] {
                return;
            }
            contributions[self.index] = ticks;
            let sum: u64 = contributions.iter().sum();
            #[allow(clippy::cast_precision_loss)]
            {
                sum as f64 / (state.total_units as f64 * f64::from(1_u32 << DECIMAL_BITS))
            }
        };
        state
            .target
            .progress
            .report(Fixed32::from_depth_and_fraction(0, fraction));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deferred::Deferred;
    use crate::types::{Outcome, Reason, State};

    fn settled<T: Send + 'static>(promise: Promise<T>) -> Outcome<T> {
        promise.try_settle().ok().expect("promise should have settled")
    }

    #[test]
    fn all_collects_values_in_input_order() {
        let mut a = Deferred::new();
        let mut b = Deferred::new();
        let mut c = Deferred::new();
        let all = Promise::all([a.promise(), b.promise(), c.promise()]);

        // Settle out of order; the result stays in input order.
        b.resolve(2_i32);
        c.resolve(3);
        assert!(all.is_pending());
        a.resolve(1);
        assert_eq!(settled(all), Outcome::Resolved(vec![1, 2, 3]));
    }

    #[test]
    fn all_of_nothing_resolves_immediately() {
        let all = Promise::<i32>::all([]);
        assert_eq!(settled(all), Outcome::Resolved(Vec::new()));
    }

    #[test]
    fn first_rejection_decides() {
        let mut a = Deferred::<i32>::new();
        let mut b = Deferred::<i32>::new();
        let all = Promise::all([a.promise(), b.promise()]);

        b.reject(Reason::new("broken"));
        assert_eq!(all.state(), State::Rejected);
        let outcome = settled(all);
        assert_eq!(
            outcome.reason().and_then(Reason::downcast_ref::<&str>),
            Some(&"broken")
        );
        // The undecided input was detached; resolving it is a no-op here.
        a.resolve(1);
    }

    #[test]
    fn cancellation_of_any_input_cancels_the_result() {
        let mut a = Deferred::<i32>::new();
        let mut b = Deferred::<i32>::new();
        let all = Promise::all([a.promise(), b.promise()]);
        a.cancel();
        assert!(settled(all).is_cancelled());
        b.resolve(5);
    }

    #[test]
    fn all_progress_is_the_weighted_average() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let mut a = Deferred::<i32>::new();
        let mut b = Deferred::<i32>::new();
        let all = Promise::all([a.promise(), b.promise()]).progress(move |p| sink.lock().push(p));

        a.report_progress(0.5);
        a.resolve(1);
        b.resolve(2);
        assert!(settled(all).is_resolved());

        let seen = seen.lock().clone();
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
        // Two single-link inputs: half of one input is a quarter overall.
        assert!(seen.iter().any(|&p| (p - 0.25).abs() < 0.01));
        assert!(seen.iter().any(|&p| (p - 0.5).abs() < 0.01));
        assert!((seen.last().copied().unwrap_or(0.0) - 1.0).abs() < f64::EPSILON);
    }
}
