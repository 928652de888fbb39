//! Multi-promise combinators: waiting on all inputs, or on the first.
//!
//! Each combinator attaches one [`PassThrough`](pass_through::PassThrough)
//! waiter per input; the waiters funnel outcomes into a shared aggregation
//! state that decides exactly once and detaches the inputs it no longer
//! needs. Input order is slot order, so ties between already-settled inputs
//! resolve by attachment order.

mod pass_through;

mod all;
mod race;
