//! Settlement races and fixed-point arithmetic properties.

use deferral::{CancelSource, Deferred, Fixed32, Outcome, Promise, Reason, State};
use proptest::prelude::*;
use std::sync::{Arc, Barrier};
use std::thread;

fn wait_for<T: Send + 'static>(mut promise: Promise<T>) -> Outcome<T> {
    loop {
        match promise.try_settle() {
            Ok(outcome) => return outcome,
            Err(again) => {
                promise = again;
                thread::yield_now();
            }
        }
    }
}

#[test]
fn resolve_racing_token_cancellation_settles_exactly_once() {
    for _ in 0..100 {
        let source = CancelSource::new();
        let mut deferred = Deferred::with_token(&source.token());
        let promise = deferred.promise();

        let barrier = Arc::new(Barrier::new(2));
        let gate = Arc::clone(&barrier);
        let canceller = thread::spawn(move || {
            gate.wait();
            source.cancel();
        });
        barrier.wait();
        // May win or lose against the token; either way is a clean outcome.
        let _ = deferred.try_resolve(1_i32);
        canceller.join().unwrap();

        let outcome = wait_for(promise);
        assert!(
            outcome.is_resolved() || outcome.is_cancelled(),
            "unexpected outcome: {outcome:?}"
        );
    }
}

#[test]
fn concurrent_consumers_via_preserve_each_get_the_value() {
    let mut deferred = Deferred::new();
    let preserved = deferred.promise().preserve();

    let consumers: Vec<_> = (0..8)
        .map(|_| {
            let handle = preserved.clone();
            thread::spawn(move || wait_for(handle.promise()))
        })
        .collect();

    deferred.resolve(1234_u64);
    for consumer in consumers {
        assert_eq!(consumer.join().unwrap(), Outcome::Resolved(1234));
    }
}

#[test]
fn cross_thread_chain_settles_once() {
    let mut deferred = Deferred::new();
    let chained = deferred.promise().then(|v: u64| v + 1);

    let producer = thread::spawn(move || deferred.resolve(41));
    let outcome = wait_for(chained);
    producer.join().unwrap();
    assert_eq!(outcome, Outcome::Resolved(42));
    assert_eq!(outcome.unwrap(), 42);
}

#[test]
fn racing_inputs_give_the_race_one_winner() {
    for _ in 0..50 {
        let mut a = Deferred::<u32>::new();
        let mut b = Deferred::<u32>::new();
        let race = Promise::race([a.promise(), b.promise()]);

        let barrier = Arc::new(Barrier::new(2));
        let (ga, gb) = (Arc::clone(&barrier), Arc::clone(&barrier));
        let ta = thread::spawn(move || {
            ga.wait();
            a.resolve(1);
        });
        let tb = thread::spawn(move || {
            gb.wait();
            b.resolve(2);
        });

        let outcome = wait_for(race);
        ta.join().unwrap();
        tb.join().unwrap();
        assert!(matches!(
            outcome,
            Outcome::Resolved(1) | Outcome::Resolved(2)
        ));
    }
}

#[test]
fn first_with_concurrent_losses_settles_with_one_of_them() {
    for _ in 0..500 {
        let mut a = Deferred::<u32>::new();
        let mut b = Deferred::<u32>::new();
        let first = Promise::first([a.promise(), b.promise()]);

        let barrier = Arc::new(Barrier::new(2));
        let (ga, gb) = (Arc::clone(&barrier), Arc::clone(&barrier));
        let ta = thread::spawn(move || {
            ga.wait();
            a.reject(Reason::new("loss a"));
        });
        let tb = thread::spawn(move || {
            gb.wait();
            b.reject(Reason::new("loss b"));
        });

        let outcome = wait_for(first);
        ta.join().unwrap();
        tb.join().unwrap();
        let reason = outcome.reason().expect("both inputs rejected");
        assert!(matches!(
            reason.downcast_ref::<&str>(),
            Some(&"loss a") | Some(&"loss b")
        ));
    }
}

#[test]
fn state_is_terminal_after_any_settle() {
    let mut deferred = Deferred::<i32>::new();
    let promise = deferred.promise();
    assert_eq!(promise.state(), State::Pending);
    deferred.resolve(1);
    assert!(promise.state().is_terminal());
    assert_eq!(promise.state(), State::Resolved);
    drop(promise);
}

proptest! {
    #[test]
    fn normalization_is_monotone(a in any::<u32>(), b in any::<u32>(), units in 1_u32..64) {
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        prop_assert!(
            Fixed32::from_raw(lo).normalized(units) <= Fixed32::from_raw(hi).normalized(units)
        );
    }

    #[test]
    fn fractions_stay_below_their_span(units in 1_u32..1024, fraction in 0.0_f64..=1.0) {
        let value = Fixed32::from_scaled_fraction(units, fraction);
        prop_assert!(value.normalized(units) < 1.0);
        prop_assert!(value.whole_part() < units);
    }

    #[test]
    fn depth_and_fraction_round_trip(depth in 0_u32..1000, fraction in 0.0_f64..1.0) {
        let value = Fixed32::from_depth_and_fraction(depth, fraction);
        prop_assert_eq!(value.whole_part(), depth);
        let recovered = f64::from(value.decimal_part()) / f64::from(1_u32 << 16);
        prop_assert!((recovered - fraction).abs() < 1.0 / 65_536.0);
    }
}
