//! The terminal outcome of a promise.
//!
//! An [`Outcome`] is what a consumer observes once a promise settles:
//!
//! - `Resolved(T)`: success with a value
//! - `Rejected(Reason)`: a producer-supplied failure
//! - `Cancelled`: cooperative cancellation, which is not an error
//!
//! Cancellation sits between success and failure: it propagates through
//! chains transparently and is never reported as unhandled.

use super::reason::Reason;
use core::fmt;

/// The settled outcome of a promise.
#[derive(Debug, Clone)]
pub enum Outcome<T> {
    /// The promise resolved with a value.
    Resolved(T),
    /// The promise was rejected with a reason.
    Rejected(Reason),
    /// The promise was cancelled.
    Cancelled,
}

impl<T> Outcome<T> {
    /// Returns true if this outcome is `Resolved`.
    #[must_use]
    pub const fn is_resolved(&self) -> bool {
        matches!(self, Self::Resolved(_))
    }

    /// Returns true if this outcome is `Rejected`.
    #[must_use]
    pub const fn is_rejected(&self) -> bool {
        matches!(self, Self::Rejected(_))
    }

    /// Returns true if this outcome is `Cancelled`.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Maps the resolved value, passing rejection and cancellation through.
    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> Outcome<U> {
        match self {
            Self::Resolved(v) => Outcome::Resolved(f(v)),
            Self::Rejected(r) => Outcome::Rejected(r),
            Self::Cancelled => Outcome::Cancelled,
        }
    }

    /// Returns the rejection reason, if any.
    #[must_use]
    pub const fn reason(&self) -> Option<&Reason> {
        match self {
            Self::Rejected(r) => Some(r),
            _ => None,
        }
    }

    /// Converts to a `Result`, folding rejection and cancellation into
    /// [`OutcomeError`].
    pub fn into_result(self) -> Result<T, OutcomeError> {
        match self {
            Self::Resolved(v) => Ok(v),
            Self::Rejected(r) => Err(OutcomeError::Rejected(r)),
            Self::Cancelled => Err(OutcomeError::Cancelled),
        }
    }

    /// Returns the resolved value or panics.
    ///
    /// # Panics
    ///
    /// Panics if the outcome is not `Resolved`.
    #[track_caller]
    pub fn unwrap(self) -> T {
        match self {
            Self::Resolved(v) => v,
            Self::Rejected(r) => {
                panic!("called `Outcome::unwrap()` on a `Rejected` value: {r}")
            }
            Self::Cancelled => panic!("called `Outcome::unwrap()` on a `Cancelled` value"),
        }
    }
}

impl<T: PartialEq> PartialEq for Outcome<T> {
    /// Rejections compare by payload identity, not payload contents.
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Resolved(a), Self::Resolved(b)) => a == b,
            (Self::Rejected(a), Self::Rejected(b)) => a.same_payload(b),
            (Self::Cancelled, Self::Cancelled) => true,
            _ => false,
        }
    }
}

/// A non-success outcome, for `Result` interop.
#[derive(Debug, Clone, thiserror::Error)]
pub enum OutcomeError {
    /// The promise was rejected.
    #[error("promise rejected: {0}")]
    Rejected(Reason),
    /// The promise was cancelled.
    #[error("promise cancelled")]
    Cancelled,
}

impl<T: fmt::Display> fmt::Display for Outcome<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Resolved(v) => write!(f, "resolved: {v}"),
            Self::Rejected(r) => write!(f, "rejected: {r}"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_only_touches_resolved() {
        let resolved: Outcome<i32> = Outcome::Resolved(20);
        assert_eq!(resolved.map(|v| v * 2).unwrap(), 40);

        let rejected: Outcome<i32> = Outcome::Rejected(Reason::new("no"));
        assert!(rejected.map(|v| v * 2).is_rejected());

        let cancelled: Outcome<i32> = Outcome::Cancelled;
        assert!(cancelled.map(|v| v * 2).is_cancelled());
    }

    #[test]
    fn into_result_classifies() {
        let ok: Outcome<i32> = Outcome::Resolved(1);
        assert_eq!(ok.into_result().ok(), Some(1));

        let rejected: Outcome<i32> = Outcome::Rejected(Reason::new("no"));
        assert!(matches!(
            rejected.into_result(),
            Err(OutcomeError::Rejected(_))
        ));

        let cancelled: Outcome<i32> = Outcome::Cancelled;
        assert!(matches!(cancelled.into_result(), Err(OutcomeError::Cancelled)));
    }
}
