//! Cooperative cancellation: source, token, registration.
//!
//! A [`CancelSource`] owns the cancel flag and the list of registered
//! callbacks. A [`CancelToken`] is a read-only reference to a source (or the
//! never-cancels token). A [`CancelRegistration`] is a handle that can be
//! unregistered exactly once, racing safely against the source firing from
//! another thread: the callback slot is taken at most once, so whichever
//! side gets there first wins and the other observes that it lost.
//!
//! Cancellation is cooperative. Signalling a token never unwinds in-flight
//! work; it only prevents future resolve/reject attempts on deferreds
//! registered against the token and flips their downstream chains to
//! cancelled.

use parking_lot::Mutex;
use smallvec::SmallVec;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

const PENDING: u8 = 0;
const CANCELLING: u8 = 1;
const CANCELLED: u8 = 2;

type Callback = Box<dyn FnOnce() + Send>;

struct RegShared {
    callback: Mutex<Option<Callback>>,
}

struct SourceInner {
    state: AtomicU8,
    registrations: Mutex<Vec<Arc<RegShared>>>,
    // Registrations held on upstream sources this one is linked to.
    links: Mutex<SmallVec<[CancelRegistration; 2]>>,
}

impl SourceInner {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(PENDING),
            registrations: Mutex::new(Vec::new()),
            links: Mutex::new(SmallVec::new()),
        }
    }
}

/// The owning side of a cancelable signal.
///
/// Cancelling is one-way and idempotent: callbacks registered through the
/// source's tokens fire exactly once, in registration order.
pub struct CancelSource {
    inner: Arc<SourceInner>,
}

impl CancelSource {
    /// Creates a new, un-cancelled source.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SourceInner::new()),
        }
    }

    /// Creates a source that cancels itself when any of `tokens` cancels.
    #[must_use]
    pub fn with_linked<I>(tokens: I) -> Self
    where
        I: IntoIterator<Item = CancelToken>,
    {
        let source = Self::new();
        let mut links = SmallVec::new();
        for token in tokens {
            let inner = Arc::clone(&source.inner);
            links.push(token.register(move || {
                cancel_inner(&inner);
            }));
        }
        *source.inner.links.lock() = links;
        source
    }

    /// Returns a token observing this source.
    #[must_use]
    pub fn token(&self) -> CancelToken {
        CancelToken {
            inner: Some(Arc::clone(&self.inner)),
        }
    }

    /// Requests cancellation.
    ///
    /// The first call fires every registered callback, in registration
    /// order, on the calling thread, and returns true. Later calls are
    /// no-ops returning false.
    pub fn cancel(&self) -> bool {
        cancel_inner(&self.inner)
    }

    /// Returns true if cancellation has been requested.
    #[must_use]
    pub fn is_cancellation_requested(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) != PENDING
    }
}

impl Default for CancelSource {
    fn default() -> Self {
        Self::new()
    }
}

fn cancel_inner(inner: &Arc<SourceInner>) -> bool {
    if inner
        .state
        .compare_exchange(PENDING, CANCELLING, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        return false;
    }
    // Drain under the lock, fire outside it: a callback may register
    // another callback (which then runs immediately) or drop a promise.
    let entries: Vec<Arc<RegShared>> = core::mem::take(&mut *inner.registrations.lock());
    for entry in entries {
        let callback = entry.callback.lock().take();
        if let Some(cb) = callback {
            cb();
        }
    }
    inner.state.store(CANCELLED, Ordering::Release);
    inner.links.lock().clear();
    true
}

/// A read-only reference to a cancelable signal.
///
/// Tokens are cheap to clone. [`CancelToken::none`] is the token that never
/// cancels; registering against it is a no-op.
#[derive(Clone)]
pub struct CancelToken {
    inner: Option<Arc<SourceInner>>,
}

impl CancelToken {
    /// The token that never cancels.
    #[must_use]
    pub const fn none() -> Self {
        Self { inner: None }
    }

    /// Returns true if this token is attached to a source at all.
    #[must_use]
    pub fn can_be_cancelled(&self) -> bool {
        self.inner.is_some()
    }

    /// Returns true if the underlying source has requested cancellation.
    #[must_use]
    pub fn is_cancellation_requested(&self) -> bool {
        self.inner
            .as_ref()
            .is_some_and(|inner| inner.state.load(Ordering::Acquire) != PENDING)
    }

    /// Registers a callback to run when the source cancels.
    ///
    /// If the source has already cancelled, the callback runs immediately on
    /// this thread. For the none token the callback is dropped unrun and the
    /// returned registration is inert.
    pub fn register<F>(&self, callback: F) -> CancelRegistration
    where
        F: FnOnce() + Send + 'static,
    {
        let Some(inner) = self.inner.as_ref() else {
            return CancelRegistration::inert();
        };

        if inner.state.load(Ordering::Acquire) != PENDING {
            callback();
            return CancelRegistration::inert();
        }

        let shared = Arc::new(RegShared {
            callback: Mutex::new(Some(Box::new(callback) as Callback)),
        });

        {
            let mut registrations = inner.registrations.lock();
            // Re-check under the lock: cancel() drains this list exactly once.
            if inner.state.load(Ordering::Acquire) == PENDING {
                registrations.push(Arc::clone(&shared));
                return CancelRegistration {
                    shared: Some(shared),
                };
            }
        }

        // Lost the race with cancel(); fire now, exactly like late register.
        let callback = shared.callback.lock().take();
        if let Some(cb) = callback {
            cb();
        }
        CancelRegistration::inert()
    }
}

/// A handle to one registered cancellation callback.
///
/// Dropping the registration does not unregister the callback; call
/// [`CancelRegistration::try_unregister`] to remove it before it fires.
pub struct CancelRegistration {
    shared: Option<Arc<RegShared>>,
}

impl CancelRegistration {
    /// An inert registration (nothing to unregister).
    #[must_use]
    pub(crate) const fn inert() -> Self {
        Self { shared: None }
    }

    /// Returns true if the callback is still registered and unfired.
    #[must_use]
    pub fn is_registered(&self) -> bool {
        self.shared
            .as_ref()
            .is_some_and(|shared| shared.callback.lock().is_some())
    }

    /// Attempts to remove the callback before the source fires it.
    ///
    /// Returns true if this call removed it; false if the callback already
    /// ran, is being run by a concurrent cancel, or was never registered.
    /// Exactly one of {this method returning true, the callback running}
    /// happens, so the resources captured by the callback are released once.
    pub fn try_unregister(&mut self) -> bool {
        let Some(shared) = self.shared.take() else {
            return false;
        };
        let removed = shared.callback.lock().take();
        removed.is_some()
    }
}
