//! Waiting on the first input: `Promise::race` and `Promise::first`.

use super::pass_through::{Combine, PassThrough};
use crate::node::{drive, finish, subscribe_chain, take_core, CoreRef, Settled, Waiter, Worklist};
use crate::progress::{Fixed32, Listener, ProgressSink};
use crate::promise::Promise;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

impl<T: Send + 'static> Promise<T> {
    /// Settles with the first input to settle, whatever its outcome.
    ///
    /// Later settlements lose the race: their rejections are treated as
    /// observed and never reported as unhandled.
    ///
    /// # Panics
    ///
    /// Panics on an empty input set; a race with no contestants could never
    /// settle.
    pub fn race<I>(promises: I) -> Promise<T>
    where
        I: IntoIterator<Item = Promise<T>>,
    {
        Self::select(promises, false)
    }

    /// Settles with the first input to *resolve*.
    ///
    /// Rejections and cancellations are held back while any input is still
    /// pending; if every input loses, the result settles with the last
    /// input's non-resolve outcome. Earlier held-back rejections count as
    /// observed.
    ///
    /// # Panics
    ///
    /// Panics on an empty input set.
    pub fn first<I>(promises: I) -> Promise<T>
    where
        I: IntoIterator<Item = Promise<T>>,
    {
        Self::select(promises, true)
    }

    fn select<I>(promises: I, resolve_only: bool) -> Promise<T>
    where
        I: IntoIterator<Item = Promise<T>>,
    {
        let cores: Vec<CoreRef> = promises.into_iter().map(Promise::into_core).collect();
        assert!(!cores.is_empty(), "racing an empty set of promises");
        let min_depth = cores
            .iter()
            .map(|core| core.depth())
            .min()
            .expect("input set checked non-empty");
        // The winner might be the shallowest chain, so the race node claims
        // only that much depth; progress from deeper inputs is scaled into
        // this span.
        let target = take_core(min_depth);
        let result = target.clone();
        let state = Arc::new(RaceState {
            target,
            decided: AtomicBool::new(false),
            remaining: AtomicUsize::new(cores.len()),
            inputs: Mutex::new(cores.iter().map(|core| Some(core.clone())).collect()),
            fallback: Mutex::new(None),
            span_units: min_depth + 1,
            resolve_only,
        });

        let mut wl = Worklist::new();
        for (index, core) in cores.into_iter().enumerate() {
            let listener = Listener::new(
                core.depth() + 1,
                Box::new(RaceSink {
                    state: Arc::downgrade(&state),
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

struct RaceState {
    target: CoreRef,
    decided: AtomicBool,
    remaining: AtomicUsize,
    inputs: Mutex<Vec<Option<CoreRef>>>,
    /// The latest held-back non-resolve outcome (`first` mode only).
    fallback: Mutex<Option<Settled>>,
    span_units: u32,
    resolve_only: bool,
}

impl RaceState {
    fn detach_others(&self, deciding: usize) {
        let mut inputs = self.inputs.lock();
        for (index, slot) in inputs.iter_mut().enumerate() {
            if index == deciding {
                continue;
            }
            if let Some(core) = slot.take() {
                if core.take_waiter().is_some() {
                    // Still pending; its eventual rejection lost the race
                    // and counts as observed, so silence it. If a settle
                    // slips in between the two calls, the silencer runs
                    // right here instead.
                    let mut local = Worklist::new();
                    core.attach_waiter(Box::new(Silence), &mut local);
                    drive(&mut local);
                }
            }
        }
    }

    fn discard_fallback(&self) {
        if let Some(Settled::Rejected(reason)) = self.fallback.lock().take() {
            reason.mark_handled();
        }
    }
}

impl Combine for RaceState {
    fn input_settled(&self, index: usize, settled: Settled, wl: &mut Worklist) {
        self.inputs.lock()[index] = None;
        let wins = !self.resolve_only || matches!(settled, Settled::Resolved(_));
        if wins {
            if !self.decided.swap(true, Ordering::AcqRel) {
                self.remaining.fetch_sub(1, Ordering::AcqRel);
                self.detach_others(index);
                self.discard_fallback();
                self.target.inner().settle(settled, wl);
            } else {
                // A loser; the race observed it.
                if let Settled::Rejected(reason) = settled {
                    reason.mark_handled();
                }
                self.remaining.fetch_sub(1, Ordering::AcqRel);
            }
            return;
        }

        // `first` mode, non-resolve outcome: hold it back in case every
        // input loses.
        if let Some(Settled::Rejected(reason)) = self.fallback.lock().replace(settled) {
            reason.mark_handled();
        }
        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            // Last input. Take the stash before publishing the decision so
            // a concurrent winner's cleanup cannot steal it in between; it
            // is already gone only if a resolve won and discarded it.
            let last = self.fallback.lock().take();
            if !self.decided.swap(true, Ordering::AcqRel) {
                let last = last.expect("every losing input stored a fallback");
                self.target.inner().settle(last, wl);
            } else if let Some(Settled::Rejected(reason)) = last {
                reason.mark_handled();
            }
        }
    }
}

/// Marks a detached loser's eventual rejection observed, forwarding nothing.
struct Silence;

impl Waiter for Silence {
    fn handle(self: Box<Self>, settled: Settled, _wl: &mut Worklist) {
        if let Settled::Rejected(reason) = settled {
            reason.mark_handled();
        }
    }
}

/// Forwards one input chain's normalized progress into the race node's span.
///
/// The node's hub keeps a high-water mark, so the observed progress is the
/// maximum over the inputs, never regressing when the frontrunner changes.
struct RaceSink {
    state: Weak<RaceState>,
}

impl ProgressSink for RaceSink {
    fn report(&self, normalized: f64) {
        let Some(state) = self.state.upgrade() else {
            return;
        };
        if state.decided.load(Ordering::Acquire) {
            return;
        }
        state
            .target
            .progress
            .report(Fixed32::from_scaled_fraction(state.span_units, normalized));
    }
}
