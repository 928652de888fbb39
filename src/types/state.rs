//! The promise lifecycle state machine.
//!
//! A promise starts [`Pending`](State::Pending) and transitions exactly once
//! to one of the three terminal states. Once terminal, the state and the
//! recorded outcome never change until the node is disposed.

use core::fmt;

/// The lifecycle state of a promise node.
///
/// Stored as a `u8` so it can live in an atomic; the transition out of
/// `Pending` is a single compare-and-swap, which is what makes
/// double-resolution a no-op rather than a data race.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum State {
    /// Not yet settled. The initial state.
    Pending = 0,
    /// Settled with a success value.
    Resolved = 1,
    /// Settled with a rejection reason.
    Rejected = 2,
    /// Settled by cancellation.
    Cancelled = 3,
}

impl State {
    /// Decodes a state from its atomic representation.
    ///
    /// Returns `None` for values that do not name a state.
    #[must_use]
    pub const fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::Pending),
            1 => Some(Self::Resolved),
            2 => Some(Self::Rejected),
            3 => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// Returns the atomic representation of this state.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Returns true if this state is terminal (anything but `Pending`).
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Resolved => write!(f, "resolved"),
            Self::Rejected => write!(f, "rejected"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}
