//! The promise node: a reference-counted, pool-recycled state machine node.
//!
//! Each outstanding async operation or chain link is one [`CoreInner`]. The
//! node holds its lifecycle state, the settled outcome (or the single
//! registered waiter still due to receive it), a link to its predecessor in
//! the chain, and the progress fan-out hub.
//!
//! # Transition protocol
//!
//! The exactly-once transition is a compare-and-swap on the atomic state;
//! whichever settle call wins the CAS owns the outcome slot. Waiter dispatch
//! is iterative: settling pushes jobs onto an explicit worklist that the
//! caller drains, so a chain of N continuations costs O(1) stack frames.
//!
//! # Disposal
//!
//! [`CoreRef`] owns one unit of the node's retain count. When the count
//! reaches zero the node is wiped, a still-unobserved rejection is forwarded
//! to the unhandled-rejection reporter, the generation counter is bumped,
//! and the node returns to the pool. Dropping the resources taken out of a
//! node is deferred through a thread-local queue so that tearing down a long
//! unconsumed chain cannot recurse.

use crate::cancel::CancelRegistration;
use crate::pool::{Pool, Recycle};
use crate::progress::{Fixed32, Listener, ProgressHub};
use crate::scheduler;
use crate::types::{Reason, State};
use core::any::Any;
use core::cell::{Cell, RefCell};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::ops::Deref;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};

/// A type-erased resolved value.
pub(crate) type AnyValue = Box<dyn Any + Send>;

/// A settled outcome in type-erased form, as it travels between nodes.
pub(crate) enum Settled {
    Resolved(AnyValue),
    Rejected(Reason),
    Cancelled,
}

impl Settled {
    pub(crate) fn state(&self) -> State {
        match self {
            Self::Resolved(_) => State::Resolved,
            Self::Rejected(_) => State::Rejected,
            Self::Cancelled => State::Cancelled,
        }
    }
}

/// A node waiting on a core's transition.
pub(crate) trait Waiter: Send {
    /// Consumes the waiter with the upstream outcome. Downstream transitions
    /// are pushed onto `wl`, never invoked recursively.
    fn handle(self: Box<Self>, settled: Settled, wl: &mut Worklist);
}

/// One pending dispatch: a waiter and the outcome it is owed.
pub(crate) struct Job {
    pub(crate) waiter: Box<dyn Waiter>,
    pub(crate) settled: Settled,
}

/// FIFO worklist for trampolined dispatch.
///
/// FIFO matters: when several already-settled inputs attach to a combinator
/// in one batch, arrival order is attachment order.
pub(crate) type Worklist = VecDeque<Job>;

/// Drains the worklist, running each dispatch iteratively.
pub(crate) fn drive(wl: &mut Worklist) {
    while let Some(job) = wl.pop_front() {
        job.waiter.handle(job.settled, wl);
    }
}

/// Finishes a settle: drains inline, or posts the drain to the installed
/// scheduler so the host pumps it on its own context.
pub(crate) fn finish(wl: Worklist) {
    if wl.is_empty() {
        return;
    }
    let mut wl = wl;
    scheduler::dispatch(Box::new(move || drive(&mut wl)));
}

/// Settles a core outside any dispatch loop and drives the fallout.
pub(crate) fn settle_now(core: &Arc<CoreInner>, settled: Settled) -> bool {
    let mut wl = Worklist::new();
    let won = core.settle(settled, &mut wl);
    finish(wl);
    won
}

struct CoreSlots {
    outcome: Option<Settled>,
    waiter: Option<Box<dyn Waiter>>,
}

/// Link to the predecessor node in a chain.
pub(crate) struct PrevLink {
    pub(crate) core: CoreRef,
    /// True when the link was created by state adoption (a callback returned
    /// a promise). Progress subscription stops at adoption boundaries; a
    /// bridge installed at adoption time re-reports in local coordinates.
    pub(crate) adopted: bool,
}

/// The promise state machine node.
pub(crate) struct CoreInner {
    state: AtomicU8,
    /// Generation counter, bumped each time the node is recycled.
    core_id: AtomicU32,
    /// Producer generation, bumped each time the deferred side completes or
    /// is invalidated. Never reset on recycle, so stale deferred handles
    /// from a previous use keep failing their CAS.
    deferred_id: AtomicU32,
    retains: AtomicU32,
    depth: AtomicU32,
    slots: Mutex<CoreSlots>,
    previous: Mutex<Option<PrevLink>>,
    cancel_reg: Mutex<Option<CancelRegistration>>,
    pub(crate) progress: ProgressHub,
}

impl CoreInner {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(State::Pending.as_u8()),
            core_id: AtomicU32::new(0),
            deferred_id: AtomicU32::new(0),
            retains: AtomicU32::new(0),
            depth: AtomicU32::new(0),
            slots: Mutex::new(CoreSlots {
                outcome: None,
                waiter: None,
            }),
            previous: Mutex::new(None),
            cancel_reg: Mutex::new(None),
            progress: ProgressHub::new(),
        }
    }

    pub(crate) fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::Acquire)).unwrap_or(State::Pending)
    }

    pub(crate) fn depth(&self) -> u32 {
        self.depth.load(Ordering::Acquire)
    }

    pub(crate) fn core_id(&self) -> u32 {
        self.core_id.load(Ordering::Acquire)
    }

    pub(crate) fn deferred_id(&self) -> u32 {
        self.deferred_id.load(Ordering::Acquire)
    }

    /// Claims the producer side for generation `expected`.
    ///
    /// This is the atomic gate that makes settling a deferred exactly-once:
    /// the first caller moves the generation forward, every later caller
    /// (and every stale handle from a previous generation) fails.
    pub(crate) fn try_bump_deferred_id(&self, expected: u32) -> bool {
        self.deferred_id
            .compare_exchange(expected, expected.wrapping_add(1), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Unconditionally invalidates the producer side.
    ///
    /// Used by the cancellation callback: once the token fires, no resolve
    /// or reject attempt may succeed, even one racing ahead of the callback.
    pub(crate) fn bump_deferred_id(&self) {
        self.deferred_id.fetch_add(1, Ordering::AcqRel);
    }

    /// The exactly-once transition.
    ///
    /// Returns true if this call won; a losing call drops its outcome (a
    /// losing rejection is marked handled, since the settle race observed it).
    pub(crate) fn settle(&self, settled: Settled, wl: &mut Worklist) -> bool {
        let target = settled.state();
        if self
            .state
            .compare_exchange(
                State::Pending.as_u8(),
                target.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            if let Settled::Rejected(reason) = &settled {
                reason.mark_handled();
            }
            return false;
        }

        tracing::trace!(state = %target, depth = self.depth(), "promise settled");

        if matches!(settled, Settled::Resolved(_)) {
            self.progress.report(Fixed32::from_whole(self.depth() + 1));
        }

        // The predecessor finished feeding this node; release it. Deferred
        // to avoid recursing through a long chain of disposals.
        if let Some(prev) = self.previous.lock().take() {
            defer_drop(Box::new(move || drop(prev)));
        }

        let job = {
            let mut slots = self.slots.lock();
            debug_assert!(slots.outcome.is_none(), "settled core already had an outcome");
            match slots.waiter.take() {
                Some(waiter) => Some(Job { waiter, settled }),
                None => {
                    slots.outcome = Some(settled);
                    None
                }
            }
        };
        if let Some(job) = job {
            wl.push_back(job);
        }
        true
    }

    /// Registers the single downstream waiter.
    ///
    /// If the core already settled, the buffered outcome dispatches
    /// immediately through the worklist.
    pub(crate) fn attach_waiter(&self, waiter: Box<dyn Waiter>, wl: &mut Worklist) {
        let job = {
            let mut slots = self.slots.lock();
            if let Some(settled) = slots.outcome.take() {
                Some(Job { waiter, settled })
            } else {
                debug_assert!(slots.waiter.is_none(), "core already has a waiter");
                slots.waiter = Some(waiter);
                None
            }
        };
        if let Some(job) = job {
            wl.push_back(job);
        }
    }

    /// Removes the waiter if one is still registered (combinator detach).
    pub(crate) fn take_waiter(&self) -> Option<Box<dyn Waiter>> {
        self.slots.lock().waiter.take()
    }

    /// Takes the buffered outcome, if the core settled with no waiter.
    pub(crate) fn take_outcome(&self) -> Option<Settled> {
        self.slots.lock().outcome.take()
    }

    /// Puts a dispatched outcome back into the slot.
    ///
    /// Used by the waker handoff: the waiter that receives the outcome on
    /// the settling thread re-buffers it for the poll that follows the wake.
    pub(crate) fn restore_outcome(&self, settled: Settled) {
        self.slots.lock().outcome = Some(settled);
    }

    pub(crate) fn set_previous(&self, link: PrevLink) {
        *self.previous.lock() = Some(link);
    }

    pub(crate) fn previous_core(&self) -> Option<Arc<Self>> {
        self.previous
            .lock()
            .as_ref()
            .map(|link| Arc::clone(&link.core.inner))
    }

    fn previous_same_chain(&self) -> Option<Arc<Self>> {
        self.previous
            .lock()
            .as_ref()
            .filter(|link| !link.adopted)
            .map(|link| Arc::clone(&link.core.inner))
    }

    pub(crate) fn set_cancel_registration(&self, reg: CancelRegistration) {
        *self.cancel_reg.lock() = Some(reg);
    }

    pub(crate) fn take_cancel_registration(&self) -> Option<CancelRegistration> {
        self.cancel_reg.lock().take()
    }

    fn retain(&self) {
        let old = self.retains.fetch_add(1, Ordering::Relaxed);
        debug_assert!(old > 0, "retained a dead core");
    }
}

impl Recycle for CoreInner {
    fn recycle(&self) {
        self.core_id.fetch_add(1, Ordering::AcqRel);
        self.state.store(State::Pending.as_u8(), Ordering::Release);
        self.depth.store(0, Ordering::Release);
        // deferred_id is intentionally left alone; see its field docs.
    }
}

/// Wipes a node whose retain count reached zero and returns it to the pool.
fn dispose(core: &Arc<CoreInner>) {
    let (outcome, waiter) = {
        let mut slots = core.slots.lock();
        (slots.outcome.take(), slots.waiter.take())
    };

    if let Some(Settled::Rejected(reason)) = &outcome {
        // Disposed without any observer: hand the reason to the global
        // reporter, once per shared payload.
        if reason.mark_handled() {
            scheduler::report_unhandled(reason);
        }
    }

    let prev = core.previous.lock().take();
    let reg = core.cancel_reg.lock().take();
    core.progress.reset();

    tracing::trace!(generation = core.core_id(), "recycling promise core");
    pool().put(Arc::clone(core));

    // Dropping these may release further cores; keep the stack flat.
    defer_drop(Box::new(move || {
        drop(outcome);
        drop(waiter);
        drop(prev);
        drop(reg);
    }));
}

/// An owning handle to a core: holds exactly one unit of retain count.
pub(crate) struct CoreRef {
    inner: Arc<CoreInner>,
}

impl CoreRef {
    pub(crate) fn inner(&self) -> &Arc<CoreInner> {
        &self.inner
    }
}

impl Deref for CoreRef {
    type Target = CoreInner;

    fn deref(&self) -> &CoreInner {
        &self.inner
    }
}

impl Clone for CoreRef {
    fn clone(&self) -> Self {
        self.inner.retain();
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Drop for CoreRef {
    fn drop(&mut self) {
        let old = self.inner.retains.fetch_sub(1, Ordering::AcqRel);
        assert!(old > 0, "promise retain count underflow");
        if old == 1 {
            dispose(&self.inner);
        }
    }
}

const POOL_CAPACITY: usize = 256;

static POOL: OnceLock<Pool<CoreInner>> = OnceLock::new();

fn pool() -> &'static Pool<CoreInner> {
    POOL.get_or_init(|| Pool::new(POOL_CAPACITY))
}

/// Takes a fresh (or recycled) core at the given chain depth.
pub(crate) fn take_core(depth: u32) -> CoreRef {
    let inner = pool().take_or(CoreInner::new);
    debug_assert_eq!(inner.retains.load(Ordering::Acquire), 0);
    inner.depth.store(depth, Ordering::Release);
    inner.retains.store(1, Ordering::Release);
    CoreRef { inner }
}

/// Returns true if `candidate` is `start` or one of its predecessors.
///
/// Walked iteratively; used to reject self-awaiting adoption before it can
/// deadlock a chain.
pub(crate) fn chain_contains(start: &Arc<CoreInner>, candidate: &Arc<CoreInner>) -> bool {
    let mut cursor = Arc::clone(start);
    loop {
        if Arc::ptr_eq(&cursor, candidate) {
            return true;
        }
        match cursor.previous_core() {
            Some(next) => cursor = next,
            None => return false,
        }
    }
}

/// Subscribes a progress listener on `core` and every same-chain
/// predecessor still linked, replaying current positions.
pub(crate) fn subscribe_chain(core: &Arc<CoreInner>, listener: &Arc<Listener>) {
    let mut cursor = Arc::clone(core);
    loop {
        cursor.progress.subscribe(Arc::clone(listener));
        match cursor.previous_same_chain() {
            Some(next) => cursor = next,
            None => return,
        }
    }
}

struct DropQueue {
    draining: Cell<bool>,
    queue: RefCell<Vec<Box<dyn FnOnce()>>>,
}

thread_local! {
    static DROP_QUEUE: DropQueue = DropQueue {
        draining: Cell::new(false),
        queue: RefCell::new(Vec::new()),
    };
}

/// Runs a drop-heavy closure through a thread-local queue.
///
/// A chain of unconsumed continuations is a linked structure of waiters
/// holding `CoreRef`s; dropping it naively recurses once per link. The queue
/// flattens that into a loop at the outermost call.
fn defer_drop(f: Box<dyn FnOnce()>) {
    DROP_QUEUE.with(|dq| {
        dq.queue.borrow_mut().push(f);
        if dq.draining.get() {
            return;
        }
        dq.draining.set(true);
        loop {
            let next = dq.queue.borrow_mut().pop();
            match next {
                Some(g) => g(),
                None => break,
            }
        }
        dq.draining.set(false);
    });
}
