//! Progress normalization across chains, adoption, and combinators.

use deferral::{Deferred, Outcome, Promise};
use parking_lot::Mutex;
use std::sync::Arc;

fn capture() -> (Arc<Mutex<Vec<f64>>>, impl Fn(f64) + Send + Sync + 'static) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    (seen, move |p| sink.lock().push(p))
}

fn settled<T: Send + 'static>(promise: Promise<T>) -> Outcome<T> {
    promise.try_settle().ok().expect("promise should have settled")
}

fn assert_monotone(seen: &[f64]) {
    assert!(
        seen.windows(2).all(|w| w[0] <= w[1]),
        "progress regressed: {seen:?}"
    );
    assert!(seen.iter().all(|&p| (0.0..=1.0).contains(&p)));
}

#[test]
fn chain_progress_counts_completed_links() {
    let (seen, sink) = capture();
    let mut deferred = Deferred::<i32>::new();
    let chained = deferred
        .promise()
        .then(|v| v)
        .then(|v| v)
        .then(|v| v)
        .progress(sink);

    deferred.resolve(0);
    assert!(settled(chained).is_resolved());

    let seen = seen.lock().clone();
    assert_monotone(&seen);
    // Four links: the source resolution lands at 1/4, then each link adds.
    assert!(seen.iter().any(|&p| (p - 0.25).abs() < 0.01));
    assert!((seen.last().copied().unwrap_or(0.0) - 1.0).abs() < f64::EPSILON);
}

#[test]
fn fractional_reports_never_touch_one_early() {
    let (seen, sink) = capture();
    let mut deferred = Deferred::<i32>::new();
    let promise = deferred.promise().progress(sink);

    deferred.report_progress(0.999_999);
    deferred.report_progress(1.0);
    {
        let seen = seen.lock();
        assert!(seen.iter().all(|&p| p < 1.0), "early 1.0 in {seen:?}");
    }
    deferred.resolve(1);
    assert!((seen.lock().last().copied().unwrap_or(0.0) - 1.0).abs() < f64::EPSILON);
    assert!(settled(promise).is_resolved());
}

#[test]
fn progress_stops_short_on_rejection() {
    let (seen, sink) = capture();
    let mut deferred = Deferred::<i32>::new();
    let promise = deferred.promise().progress(sink);

    deferred.report_progress(0.5);
    deferred.reject(deferral::Reason::new("stopped"));
    let seen = seen.lock().clone();
    assert_monotone(&seen);
    assert!(seen.iter().all(|&p| p < 1.0));
    drop(promise.catch_all(|_| 0));
}

#[test]
fn late_subscription_replays_the_current_position() {
    let (seen, sink) = capture();
    let mut deferred = Deferred::<i32>::new();
    let promise = deferred.promise();
    deferred.report_progress(0.5);

    let promise = promise.progress(sink);
    assert!(seen.lock().iter().any(|&p| (p - 0.5).abs() < 0.01));
    deferred.resolve(1);
    assert!(settled(promise).is_resolved());
}

#[test]
fn adoption_scales_the_inner_chain_into_the_outer() {
    let (seen, sink) = capture();
    let mut outer = Deferred::new();
    let mut inner = Deferred::new();
    let inner_promise = inner.promise();
    let chained = outer
        .promise()
        .then_promise(move |_: i32| inner_promise)
        .progress(sink);

    outer.resolve(0);
    // The outer link is done; the adopted inner chain fills the second link.
    inner.report_progress(0.5);
    inner.resolve(1_i32);
    assert!(settled(chained).is_resolved());

    let seen = seen.lock().clone();
    assert_monotone(&seen);
    assert!((seen.last().copied().unwrap_or(0.0) - 1.0).abs() < f64::EPSILON);
}

#[test]
fn race_progress_tracks_the_frontrunner() {
    let (seen, sink) = capture();
    let mut a = Deferred::<i32>::new();
    let mut b = Deferred::<i32>::new();
    let race = Promise::race([a.promise(), b.promise()]).progress(sink);

    a.report_progress(0.25);
    b.report_progress(0.75);
    a.report_progress(0.5); // behind the frontrunner, must not regress
    b.resolve(1);
    assert!(settled(race).is_resolved());

    let seen = seen.lock().clone();
    assert_monotone(&seen);
    assert!(seen.iter().any(|&p| (p - 0.75).abs() < 0.01));
    assert!((seen.last().copied().unwrap_or(0.0) - 1.0).abs() < f64::EPSILON);
}

#[test]
fn all_progress_weights_deeper_chains_heavier() {
    let (seen, sink) = capture();
    let mut shallow = Deferred::<i32>::new();
    let mut deep = Deferred::<i32>::new();
    // Units: 1 for the shallow input, 2 for the two-link input; total 3.
    let all = Promise::all([shallow.promise(), deep.promise().then(|v| v)])
        .progress(sink);

    shallow.resolve(1);
    {
        let seen = seen.lock();
        assert!(seen.iter().any(|&p| (p - 1.0 / 3.0).abs() < 0.01), "{seen:?}");
    }
    deep.resolve(2);
    assert!(settled(all).is_resolved());

    let seen = seen.lock().clone();
    assert_monotone(&seen);
    assert!((seen.last().copied().unwrap_or(0.0) - 1.0).abs() < f64::EPSILON);
}
