//! Cancellation flowing from tokens through deferreds into chains.

use deferral::{CancelSource, Deferred, Outcome, Promise, SettleError, State};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn settled<T: Send + 'static>(promise: Promise<T>) -> Outcome<T> {
    promise.try_settle().ok().expect("promise should have settled")
}

#[test]
fn token_cancellation_flows_down_the_chain() {
    let source = CancelSource::new();
    let mut deferred = Deferred::<i32>::with_token(&source.token());
    let observed = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&observed);
    let chained = deferred
        .promise()
        .then(|v| v + 1)
        .catch_cancellation(move || {
            seen.fetch_add(1, Ordering::SeqCst);
        });

    source.cancel();
    assert!(settled(chained).is_cancelled());
    assert_eq!(observed.load(Ordering::SeqCst), 1);
    // The producer lost its write capability when the token fired.
    assert_eq!(deferred.try_resolve(5), Err(SettleError::AlreadySettled));
}

#[test]
fn linked_source_cancels_dependent_work() {
    let parent = CancelSource::new();
    let child = CancelSource::with_linked([parent.token()]);
    let mut deferred = Deferred::<i32>::with_token(&child.token());
    let promise = deferred.promise();

    parent.cancel();
    assert_eq!(promise.state(), State::Cancelled);
}

#[test]
fn cancellation_skips_resolution_and_rejection_callbacks() {
    let touched = Arc::new(AtomicUsize::new(0));
    let on_resolve = Arc::clone(&touched);
    let on_reject = Arc::clone(&touched);
    let mut deferred = Deferred::<i32>::new();
    let chained = deferred
        .promise()
        .then(move |v| {
            on_resolve.fetch_add(1, Ordering::SeqCst);
            v
        })
        .catch_all(move |_| {
            on_reject.fetch_add(1, Ordering::SeqCst);
            0
        });

    deferred.cancel();
    assert!(settled(chained).is_cancelled());
    assert_eq!(touched.load(Ordering::SeqCst), 0);
}

#[test]
fn continue_with_still_runs_on_cancellation() {
    let mut deferred = Deferred::<i32>::new();
    let chained = deferred
        .promise()
        .continue_with(|outcome| if outcome.is_cancelled() { "cancelled" } else { "other" });
    deferred.cancel();
    assert_eq!(settled(chained), Outcome::Resolved("cancelled"));
}

#[test]
fn unregistered_tokens_leave_settlement_alone() {
    let source = CancelSource::new();
    let mut deferred = Deferred::with_token(&source.token());
    let promise = deferred.promise();
    deferred.resolve(3_i32);
    // Cancelling after the fact must not disturb the resolved chain.
    source.cancel();
    assert_eq!(settled(promise), Outcome::Resolved(3));
}

#[test]
fn cancelling_one_of_many_registrations_is_independent() {
    let source = CancelSource::new();
    let mut a = Deferred::<i32>::with_token(&source.token());
    let mut b = Deferred::<i32>::with_token(&source.token());
    let pa = a.promise();
    let pb = b.promise();

    a.resolve(1);
    source.cancel();

    assert_eq!(settled(pa), Outcome::Resolved(1));
    assert_eq!(pb.state(), State::Cancelled);
    drop(pb);
}
