//! Fixed-point progress values and listener plumbing.
//!
//! Progress through a promise chain is tracked as an unsigned fixed-point
//! number: the whole part counts completed chain links (the depth), the
//! 16-bit decimal part is the fractional position inside the current link.
//! Keeping the arithmetic integral until the final readout avoids
//! floating-point drift when chains of different depths are aggregated;
//! only the listener boundary converts to a float.

use core::fmt;
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Number of bits in the decimal part of a [`Fixed32`].
pub const DECIMAL_BITS: u32 = 16;
/// The largest representable decimal part, strictly below the next whole.
pub const DECIMAL_MAX: u32 = (1 << DECIMAL_BITS) - 1;
const DECIMAL_ONE: f64 = (1u32 << DECIMAL_BITS) as f64;

/// An unsigned fixed-point fraction with a 16-bit decimal part.
///
/// `whole_part` is the number of fully completed chain links; `decimal_part`
/// is the position inside the link currently in flight. A fraction supplied
/// by a producer is capped just below 1.0 so that a listener observes exactly
/// 1.0 only when the subscribed promise actually resolves.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Fixed32(u32);

impl Fixed32 {
    /// Zero progress.
    pub const ZERO: Self = Self(0);

    /// Builds a value from raw bits.
    #[must_use]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Builds a value with the given whole part and zero decimal part.
    ///
    /// Saturates if the whole part does not fit.
    #[must_use]
    pub const fn from_whole(whole: u32) -> Self {
        if whole > (u32::MAX >> DECIMAL_BITS) {
            Self(u32::MAX)
        } else {
            Self(whole << DECIMAL_BITS)
        }
    }

    /// Builds a value at `depth` whole links plus a fraction of the next.
    ///
    /// The fraction is clamped to `[0, 1)`: a reported `1.0` lands on
    /// [`DECIMAL_MAX`], one ulp short of the next whole link, so only an
    /// actual resolution produces a whole-link increment.
    #[must_use]
    pub fn from_depth_and_fraction(depth: u32, fraction: f64) -> Self {
        let clamped = fraction.clamp(0.0, 1.0);
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let decimal = ((clamped * DECIMAL_ONE) as u32).min(DECIMAL_MAX);
        Self(Self::from_whole(depth).0.saturating_add(decimal))
    }

    /// Builds a value spanning `units` whole links at the given fraction.
    ///
    /// Combinator nodes stand in for several input chains at once; their
    /// aggregate fraction is scaled across the whole span and capped one tick
    /// short of completion, same as [`Fixed32::from_depth_and_fraction`].
    #[must_use]
    pub fn from_scaled_fraction(units: u32, fraction: f64) -> Self {
        let span = u64::from(units.max(1)) << DECIMAL_BITS;
        let clamped = fraction.clamp(0.0, 1.0);
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
        let ticks = ((clamped * span as f64) as u64).min(span - 1);
        Self(ticks.min(u64::from(u32::MAX)) as u32)
    }

    /// Raw bit representation.
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// The number of fully completed links.
    #[must_use]
    pub const fn whole_part(self) -> u32 {
        self.0 >> DECIMAL_BITS
    }

    /// The fractional position inside the current link, in raw ticks.
    #[must_use]
    pub const fn decimal_part(self) -> u32 {
        self.0 & DECIMAL_MAX
    }

    /// Adds `ticks`, saturating at the representation limit.
    #[must_use]
    pub const fn saturating_add(self, ticks: u32) -> Self {
        Self(self.0.saturating_add(ticks))
    }

    /// Ticks gained since a previously observed value (zero if regressed).
    #[must_use]
    pub const fn diff_since(self, observed: Self) -> u32 {
        self.0.saturating_sub(observed.0)
    }

    /// Converts to a float, the only place precision is allowed to drop.
    #[must_use]
    pub fn to_f64(self) -> f64 {
        f64::from(self.0) / DECIMAL_ONE
    }

    /// Normalizes against a chain of `units` expected whole links.
    #[must_use]
    pub fn normalized(self, units: u32) -> f64 {
        if units == 0 {
            return 1.0;
        }
        (self.to_f64() / f64::from(units)).min(1.0)
    }
}

impl fmt::Debug for Fixed32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fixed32({}+{}/{})", self.whole_part(), self.decimal_part(), 1u32 << DECIMAL_BITS)
    }
}

/// Receives normalized progress values in `[0, 1]`.
pub(crate) trait ProgressSink: Send + Sync {
    fn report(&self, normalized: f64);
}

/// A progress subscription: a sink plus the chain length it normalizes by.
///
/// The high-water mark makes delivery monotonic even when reports from
/// different chain links race: a slower link that reports late can never
/// drag the observed value backwards.
pub(crate) struct Listener {
    units: u32,
    high: AtomicU32,
    serialize: Mutex<()>,
    sink: Box<dyn ProgressSink>,
}

impl Listener {
    pub(crate) fn new(units: u32, sink: Box<dyn ProgressSink>) -> Arc<Self> {
        Arc::new(Self {
            units: units.max(1),
            high: AtomicU32::new(0),
            serialize: Mutex::new(()),
            sink,
        })
    }

    /// Offers a new chain position; delivers only if it advances the mark.
    pub(crate) fn offer(&self, value: Fixed32) {
        let prev = self.high.fetch_max(value.raw(), Ordering::AcqRel);
        if value.raw() > prev {
            // Re-read under the lock so racing offers deliver in order.
            let _guard = self.serialize.lock();
            let current = Fixed32::from_raw(self.high.load(Ordering::Acquire));
            self.sink.report(current.normalized(self.units));
        }
    }
}

/// Per-core progress fan-out point.
///
/// Each core owns a hub; producers report into it and subscriptions
/// registered while the core was pending hear every later advance.
pub(crate) struct ProgressHub {
    current: AtomicU32,
    listeners: Mutex<SmallVec<[Arc<Listener>; 2]>>,
}

impl ProgressHub {
    pub(crate) fn new() -> Self {
        Self {
            current: AtomicU32::new(0),
            listeners: Mutex::new(SmallVec::new()),
        }
    }

    /// Registers a listener and replays the current position to it.
    pub(crate) fn subscribe(&self, listener: Arc<Listener>) {
        let current = self.current();
        self.listeners.lock().push(Arc::clone(&listener));
        if current.raw() > 0 {
            listener.offer(current);
        }
    }

    /// Advances the hub position and fans out to listeners.
    pub(crate) fn report(&self, value: Fixed32) {
        self.current.fetch_max(value.raw(), Ordering::AcqRel);
        let snapshot: SmallVec<[Arc<Listener>; 2]> = self.listeners.lock().clone();
        for listener in snapshot {
            listener.offer(value);
        }
    }

    /// The current chain position.
    pub(crate) fn current(&self) -> Fixed32 {
        Fixed32::from_raw(self.current.load(Ordering::Acquire))
    }

    /// Drops all listeners and rewinds, for pool reuse.
    pub(crate) fn reset(&self) {
        self.listeners.lock().clear();
        self.current.store(0, Ordering::Release);
    }
}
