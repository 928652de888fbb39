//! Shared rejection payloads.
//!
//! A [`Reason`] wraps an arbitrary rejection value so it can flow through a
//! promise chain, be adopted by combinators, and be reported at most once if
//! nothing ever observes it. Cloning a `Reason` shares the payload; the
//! handled flag lives on the shared allocation so concurrent observers (for
//! example combinator losers) cannot produce duplicate unhandled reports.

use core::any::Any;
use core::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[cfg(feature = "trace")]
use core::panic::Location;
#[cfg(feature = "trace")]
use parking_lot::Mutex;

struct ReasonInner {
    payload: Box<dyn Any + Send + Sync>,
    type_name: &'static str,
    description: String,
    handled: AtomicBool,
    #[cfg(feature = "trace")]
    sites: Mutex<Vec<&'static Location<'static>>>,
}

/// The reason a promise was rejected.
///
/// Reasons are cheap to clone and carry a type-erased payload that `catch`
/// callbacks recover by downcasting. A reason starts unhandled; the first
/// observer (a matching `catch`, a `continue_with`, or the unhandled-rejection
/// reporter itself) marks it handled.
#[derive(Clone)]
pub struct Reason {
    inner: Arc<ReasonInner>,
}

impl Reason {
    /// Wraps a rejection value.
    ///
    /// The `Debug` rendering is captured eagerly so unhandled reports can
    /// describe the payload without re-borrowing it.
    #[must_use]
    #[cfg_attr(feature = "trace", track_caller)]
    pub fn new<T>(payload: T) -> Self
    where
        T: Any + Send + Sync + fmt::Debug,
    {
        let description = format!("{payload:?}");
        Self {
            inner: Arc::new(ReasonInner {
                payload: Box::new(payload),
                type_name: core::any::type_name::<T>(),
                description,
                handled: AtomicBool::new(false),
                #[cfg(feature = "trace")]
                sites: Mutex::new(vec![Location::caller()]),
            }),
        }
    }

    /// Wraps the payload of a caught callback panic.
    ///
    /// Panic payloads are `&str` or `String` in practice; anything else is
    /// described by its type name only.
    #[must_use]
    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_owned()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_owned()
        };
        Self::new(CallbackPanic { message })
    }

    /// Returns a reference to the payload if it has type `T`.
    #[must_use]
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.inner.payload.downcast_ref::<T>()
    }

    /// Returns true if the payload has type `T`.
    #[must_use]
    pub fn is<T: Any>(&self) -> bool {
        self.inner.payload.is::<T>()
    }

    /// The type name of the payload, as captured at construction.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        self.inner.type_name
    }

    /// The `Debug` rendering of the payload, as captured at construction.
    #[must_use]
    pub fn description(&self) -> &str {
        &self.inner.description
    }

    /// Marks the reason handled, returning true if this call was the first.
    pub fn mark_handled(&self) -> bool {
        !self.inner.handled.swap(true, Ordering::AcqRel)
    }

    /// Returns true if some observer has already handled this reason.
    #[must_use]
    pub fn is_handled(&self) -> bool {
        self.inner.handled.load(Ordering::Acquire)
    }

    /// Records a chain hop for the causality trace.
    #[cfg(feature = "trace")]
    pub(crate) fn push_site(&self, site: &'static Location<'static>) {
        self.inner.sites.lock().push(site);
    }

    /// The call sites this reason has passed through, oldest first.
    #[cfg(feature = "trace")]
    #[must_use]
    pub fn trace(&self) -> Vec<&'static Location<'static>> {
        self.inner.sites.lock().clone()
    }

    /// Returns true if two reasons share the same payload allocation.
    #[must_use]
    pub fn same_payload(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reason")
            .field("type", &self.inner.type_name)
            .field("payload", &self.inner.description)
            .field("handled", &self.is_handled())
            .finish()
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.inner.type_name, self.inner.description)?;
        #[cfg(feature = "trace")]
        {
            for site in self.trace() {
                write!(f, "\n  at {site}")?;
            }
        }
        Ok(())
    }
}

/// Payload used when a user callback panics.
///
/// The panic is converted into an ordinary rejection so it propagates to the
/// nearest `catch` instead of unwinding through the dispatch loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackPanic {
    message: String,
}

impl CallbackPanic {
    /// The panic message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for CallbackPanic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "callback panicked: {}", self.message)
    }
}
