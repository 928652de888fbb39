//! The shared input-forwarding waiter.

use crate::node::{Settled, Waiter, Worklist};
use std::sync::Arc;

/// A combinator's shared aggregation state.
pub(crate) trait Combine: Send + Sync {
    /// Called exactly once per still-attached input, with the input's slot
    /// index and settled outcome.
    fn input_settled(&self, index: usize, settled: Settled, wl: &mut Worklist);
}

/// Forwards one input promise's outcome into the shared combinator state.
pub(crate) struct PassThrough<S> {
    pub(crate) state: Arc<S>,
    pub(crate) index: usize,
}

impl<S: Combine + 'static> Waiter for PassThrough<S> {
    fn handle(self: Box<Self>, settled: Settled, wl: &mut Worklist) {
        self.state.input_settled(self.index, settled, wl);
    }
}
