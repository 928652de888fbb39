//! The host boundary: continuation posting and unhandled-rejection reporting.
//!
//! The engine never creates threads. When a promise settles, its continuation
//! chain is either driven inline on the settling thread (the default) or
//! posted to an installed [`Scheduler`] whose host drains it later, for
//! example once per frame. The only other thing the engine needs from its
//! host is somewhere to send rejections that nothing observed.

use crate::types::Reason;
use crossbeam_queue::SegQueue;
use parking_lot::RwLock;
use std::sync::Arc;

/// A unit of deferred continuation work.
pub type Job = Box<dyn FnOnce() + Send>;

/// Schedules continuation jobs onto a logical execution context.
pub trait Scheduler: Send + Sync {
    /// Enqueues `job` to run later. Must not run it inline.
    fn post(&self, job: Job);
}

/// A scheduler backed by a lock-free queue, drained by [`run_pending`].
///
/// Hosts that pump continuations once per tick install one of these and call
/// [`QueueScheduler::run_pending`] (or the free function) from the pump.
#[derive(Default)]
pub struct QueueScheduler {
    queue: SegQueue<Job>,
}

impl QueueScheduler {
    /// Creates an empty queue scheduler.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs queued jobs until the queue is empty, including jobs enqueued by
    /// the jobs themselves. Returns how many jobs ran.
    pub fn run_pending(&self) -> usize {
        let mut ran = 0;
        while let Some(job) = self.queue.pop() {
            job();
            ran += 1;
        }
        ran
    }

    /// Number of jobs currently queued.
    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Returns true if no jobs are queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

impl Scheduler for QueueScheduler {
    fn post(&self, job: Job) {
        self.queue.push(job);
    }
}

static SCHEDULER: RwLock<Option<Arc<dyn Scheduler>>> = RwLock::new(None);
static QUEUE: RwLock<Option<Arc<QueueScheduler>>> = RwLock::new(None);

/// Installs a scheduler; settled promises post their dispatch through it.
pub fn install_scheduler(scheduler: Arc<dyn Scheduler>) {
    *SCHEDULER.write() = Some(scheduler);
    *QUEUE.write() = None;
}

/// Installs a [`QueueScheduler`] and returns a handle for draining it.
pub fn install_queue_scheduler() -> Arc<QueueScheduler> {
    let queue = Arc::new(QueueScheduler::new());
    *SCHEDULER.write() = Some(Arc::clone(&queue) as Arc<dyn Scheduler>);
    *QUEUE.write() = Some(Arc::clone(&queue));
    queue
}

/// Removes any installed scheduler; dispatch runs inline again.
pub fn clear_scheduler() {
    *SCHEDULER.write() = None;
    *QUEUE.write() = None;
}

/// Drains the installed [`QueueScheduler`], if one is installed.
///
/// Returns how many jobs ran. A no-op (returning 0) under inline dispatch,
/// so tests can call it unconditionally.
pub fn run_pending() -> usize {
    let queue = QUEUE.read().clone();
    queue.map_or(0, |q| q.run_pending())
}

/// Runs `job` inline, or posts it if a scheduler is installed.
pub(crate) fn dispatch(job: Job) {
    let scheduler = SCHEDULER.read().clone();
    match scheduler {
        Some(s) => s.post(job),
        None => job(),
    }
}

type UnhandledHandler = Arc<dyn Fn(&Reason) + Send + Sync>;

static UNHANDLED: RwLock<Option<UnhandledHandler>> = RwLock::new(None);

/// Installs the process-wide reporter for rejections nothing observed.
///
/// Without a handler, unhandled rejections are logged at error level.
pub fn set_unhandled_handler<F>(handler: F)
where
    F: Fn(&Reason) + Send + Sync + 'static,
{
    *UNHANDLED.write() = Some(Arc::new(handler));
}

/// Removes the installed unhandled-rejection handler.
pub fn clear_unhandled_handler() {
    *UNHANDLED.write() = None;
}

/// Reports a rejection that was disposed without an observer.
///
/// Callers mark the reason handled first, so a reason shared between
/// combinator branches is reported at most once.
pub(crate) fn report_unhandled(reason: &Reason) {
    let handler = UNHANDLED.read().clone();
    match handler {
        Some(h) => h(reason),
        None => tracing::error!(reason = %reason, "unhandled promise rejection"),
    }
}
