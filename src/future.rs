//! `std::future` interop.
//!
//! A [`Promise`] is directly awaitable; its output is the full [`Outcome`],
//! so `.await` never panics on rejection or cancellation. The waker handoff
//! re-buffers the settled outcome on the node so the wake-following poll can
//! take it, keeping the single-consumer protocol intact.

use crate::node::{drive, CoreInner, Settled, Waiter, Worklist};
use crate::promise::{settled_into_outcome, Promise};
use crate::types::Outcome;
use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Poll, Waker};
use std::sync::Arc;

struct WakeWaiter {
    core: Arc<CoreInner>,
    waker: Waker,
}

impl Waiter for WakeWaiter {
    fn handle(self: Box<Self>, settled: Settled, _wl: &mut Worklist) {
        self.core.restore_outcome(settled);
        self.waker.wake();
    }
}

impl<T: Send + 'static> Future for Promise<T> {
    type Output = Outcome<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let core = self.get_mut().core();
        if core.state().is_terminal() {
            if let Some(settled) = core.take_outcome() {
                return Poll::Ready(settled_into_outcome(settled, true));
            }
            // Outcome is mid-handoff to the waiter from an earlier poll;
            // that waiter re-buffers it and wakes us.
            return Poll::Pending;
        }

        // Replace the waker from any earlier poll with the current one.
        let _stale = core.take_waiter();
        let mut wl = Worklist::new();
        core.attach_waiter(
            Box::new(WakeWaiter {
                core: Arc::clone(core.inner()),
                waker: cx.waker().clone(),
            }),
            &mut wl,
        );
        // Non-empty only if the promise settled between the checks above;
        // driving re-buffers the outcome for the immediate re-check.
        drive(&mut wl);

        if core.state().is_terminal() {
            if let Some(settled) = core.take_outcome() {
                return Poll::Ready(settled_into_outcome(settled, true));
            }
        }
        Poll::Pending
    }
}
