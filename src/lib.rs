//! # Rampart
//!
//! Rampart is the speculative-simulation core of a real-time multiplayer game,
//! written in 100% safe Rust. It lets an owning peer act instantly on local
//! input while an authoritative peer retains the final say over simulation
//! state, with divergences corrected without visible discontinuity.
//!
//! The crate is built from four cooperating pieces:
//!
//! - [`scheduler`]: a hierarchical, sub-tick-accurate countdown scheduler
//!   ("alarms") driving cooldowns, timeouts and periodic corrective callbacks.
//! - [`prediction`]: tick-synchronized prediction/reconciliation for
//!   continuous physical state (rollback-replay against authoritative
//!   snapshots).
//! - [`correlator`]: bounded rendezvous correlation for speculative object
//!   creation (matching authoritative spawn tickets against optimistically
//!   created placeholders, arriving in either order).
//! - [`counter`]: out-of-order-safe reconciliation for discrete speculative
//!   state (ammunition/reload), where corrections may arrive after several
//!   further local predictions have been made.
//!
//! [`context`] ties them together per peer: an explicit context owning the
//! scheduler, the tick counter and RAII tick subscriptions, so nothing in the
//! crate is a global.
//!
//! Rampart does not own a transport. All cross-peer messages are plain values
//! ([`ReplicateRecord`], [`ReconcileSnapshot`], [`CorrectionBroadcast`], spawn
//! grants/rejections); delivering them is the caller's concern. The crate
//! assumes ordered-per-channel or unordered unreliable delivery and a global
//! monotonic tick counter visible to all peers.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

use serde::{de::DeserializeOwned, Serialize};

pub use context::{RegisterContext, SimContext, Subscription};
pub use correlator::{Correlation, CorrelatorConfig, Placeholder, SpawnCorrelator, SpawnTicket};
pub use counter::{CorrectionBroadcast, CorrectionOutcome, CounterConfig, CounterReconciler};
pub use error::RampartError;
pub use heap::{HeapOrder, IndexedHeap};
pub use messages::{Pose, SpawnGrant, SpawnReject};
pub use prediction::{
    Integrator, PredictionConfig, PredictionLoop, ReconcileSnapshot, ReplicateRecord,
};
pub use scheduler::{
    AdvanceStrategy, AlarmCtl, AlarmFired, AlarmHandle, AlarmScheduler, AlarmSpec, NodeId,
};

pub mod codec;
pub mod context;
pub mod correlator;
pub mod counter;
/// Error types returned by fallible Rampart APIs.
pub mod error;
pub mod heap;
pub mod messages;
pub mod prediction;
pub mod scheduler;
pub mod telemetry;

// #############
// # CONSTANTS #
// #############

/// Internally, `u64::MAX` represents no tick / uninitialized tick.
///
/// Ticks are unsigned and monotonically increasing, so the maximum value is
/// unreachable in practice (at 60 ticks per second it lies ~9.7 billion years
/// out) and serves as the natural sentinel.
pub const NULL_TICK: u64 = u64::MAX;

/// A tick is a single step of simulation execution.
///
/// Ticks are the fundamental unit of time in the speculative simulation. Each
/// tick represents one discrete, fixed-Δt step, globally numbered per session;
/// Δt is identical on every peer. Tick numbers start at 0 and increment
/// sequentially.
///
/// The special value [`Tick::NULL`] represents "no tick" or "uninitialized".
///
/// # Type Safety
///
/// `Tick` is a newtype wrapper around `u64` that provides:
/// - Clear semantic meaning (ticks vs arbitrary integers)
/// - Helper methods like [`is_null()`](Tick::is_null) and
///   [`is_valid()`](Tick::is_valid)
/// - Arithmetic operations for tick calculations
/// - Compile-time prevention of accidentally mixing ticks with other integers
///
/// # Examples
///
/// ```
/// use rampart::Tick;
///
/// let tick = Tick::new(0);
/// assert!(tick.is_valid());
/// assert!(Tick::NULL.is_null());
///
/// let next = tick + 1;
/// assert_eq!(next.as_u64(), 1);
/// assert!(next > tick);
/// ```
#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct Tick(u64);

impl Tick {
    /// The null tick constant, representing "no tick" or "uninitialized".
    ///
    /// This is equivalent to [`NULL_TICK`] (`u64::MAX`).
    pub const NULL: Tick = Tick(NULL_TICK);

    /// Creates a new `Tick` from a `u64` value.
    ///
    /// Note: this does not reject the sentinel. Use [`Tick::is_valid()`] to
    /// check whether the tick represents a real simulation step.
    #[inline]
    #[must_use]
    pub const fn new(tick: u64) -> Self {
        Tick(tick)
    }

    /// Returns the underlying `u64` value.
    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns `true` if this tick is the null tick.
    #[inline]
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == NULL_TICK
    }

    /// Returns `true` if this tick is a real simulation step (not the
    /// sentinel).
    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 != NULL_TICK
    }

    /// Returns `Some(self)` if the tick is valid, `None` if it is the
    /// sentinel.
    #[inline]
    #[must_use]
    pub const fn to_option(self) -> Option<Tick> {
        if self.is_valid() {
            Some(self)
        } else {
            None
        }
    }
}

impl std::fmt::Display for Tick {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_null() {
            write!(f, "NULL_TICK")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl std::ops::Add<u64> for Tick {
    type Output = Tick;

    #[inline]
    fn add(self, rhs: u64) -> Self::Output {
        Tick(self.0 + rhs)
    }
}

impl std::ops::AddAssign<u64> for Tick {
    #[inline]
    fn add_assign(&mut self, rhs: u64) {
        self.0 += rhs;
    }
}

impl std::ops::Sub<u64> for Tick {
    type Output = Tick;

    #[inline]
    fn sub(self, rhs: u64) -> Self::Output {
        Tick(self.0 - rhs)
    }
}

impl std::ops::Sub<Tick> for Tick {
    type Output = u64;

    #[inline]
    fn sub(self, rhs: Tick) -> Self::Output {
        self.0 - rhs.0
    }
}

impl From<u64> for Tick {
    #[inline]
    fn from(value: u64) -> Self {
        Tick(value)
    }
}

impl From<Tick> for u64 {
    #[inline]
    fn from(tick: Tick) -> Self {
        tick.0
    }
}

impl PartialEq<u64> for Tick {
    #[inline]
    fn eq(&self, other: &u64) -> bool {
        self.0 == *other
    }
}

impl PartialOrd<u64> for Tick {
    #[inline]
    fn partial_cmp(&self, other: &u64) -> Option<std::cmp::Ordering> {
        self.0.partial_cmp(other)
    }
}

// #############
// #   ENUMS   #
// #############

/// The role a local peer plays for a given entity.
///
/// - [`Role::Authority`] is the peer whose state is ground truth. An authority
///   that also supplies input behaves as the authority for every operation
///   (it never predicts against itself).
/// - [`Role::Owner`] is a non-authoritative peer permitted to supply
///   predictive input; its speculative state is corrected by the authority.
/// - [`Role::Observer`] receives but never authors state.
///
/// Per tick, each shared field has exactly one writer role (the authority
/// writes authoritative fields, the owner writes speculative fields), which is
/// why no locking exists anywhere in this crate.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Role {
    /// This peer's state is ground truth for the entity.
    Authority,
    /// This peer supplies predictive input for the entity but is not the
    /// authority.
    Owner,
    /// This peer receives state for the entity but never authors it.
    Observer,
}

impl Role {
    /// Returns `true` if this peer is the authority for the entity.
    #[inline]
    #[must_use]
    pub const fn is_authority(self) -> bool {
        matches!(self, Role::Authority)
    }

    /// Returns `true` if this peer may author input for the entity.
    ///
    /// The authority always may; a predicting owner may as well.
    #[inline]
    #[must_use]
    pub const fn may_author_input(self) -> bool {
        matches!(self, Role::Authority | Role::Owner)
    }

    /// Returns `true` if this peer predicts speculatively (an owner that is
    /// not the authority).
    #[inline]
    #[must_use]
    pub const fn predicts(self) -> bool {
        matches!(self, Role::Owner)
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Authority => f.write_str("authority"),
            Role::Owner => f.write_str("owner"),
            Role::Observer => f.write_str("observer"),
        }
    }
}

// #############
// #  TRAITS   #
// #############

/// Compile time parameterization for the prediction loop.
///
/// This trait bundles the generic types a predicted entity needs. Implement it
/// on a marker struct to configure your entity types.
///
/// # Example
///
/// ```
/// use rampart::SimConfig;
/// use serde::{Deserialize, Serialize};
///
/// // The owner-authored input replicated to the authority.
/// #[derive(Copy, Clone, PartialEq, Default, Serialize, Deserialize)]
/// struct ShipInput {
///     thrust: i8,
///     turn: i8,
/// }
///
/// // The continuous physical state being predicted.
/// #[derive(Clone, PartialEq, Debug)]
/// struct ShipState {
///     position: [f64; 2],
///     velocity: [f64; 2],
///     heading: f64,
/// }
///
/// struct ShipConfig;
///
/// impl SimConfig for ShipConfig {
///     type Input = ShipInput;
///     type State = ShipState;
/// }
/// ```
pub trait SimConfig: 'static {
    /// The input type for a predicted entity. This is the only entity-related
    /// data transmitted from owner to authority.
    ///
    /// The implementation of [`Default`] is used to represent "no input",
    /// including when the owner's control is disabled.
    type Input: Copy + Clone + PartialEq + Default + Serialize + DeserializeOwned;

    /// The continuous physical state being predicted and reconciled.
    type State: Clone;
}

// ###################
// # UNIT TESTS      #
// ###################

#[cfg(test)]
mod tests {
    use super::*;

    // ==========================================
    // Tick Tests
    // ==========================================

    #[test]
    fn tick_null_constant() {
        assert_eq!(Tick::NULL.as_u64(), NULL_TICK);
        assert!(Tick::NULL.is_null());
        assert!(!Tick::NULL.is_valid());
    }

    #[test]
    fn tick_new() {
        let tick = Tick::new(0);
        assert_eq!(tick.as_u64(), 0);
        assert!(!tick.is_null());
        assert!(tick.is_valid());
    }

    #[test]
    fn tick_arithmetic() {
        let tick = Tick::new(10);
        assert_eq!((tick + 5).as_u64(), 15);
        assert_eq!((tick - 3).as_u64(), 7);
        assert_eq!(Tick::new(10) - Tick::new(5), 5);
    }

    #[test]
    fn tick_add_assign() {
        let mut tick = Tick::new(10);
        tick += 5;
        assert_eq!(tick.as_u64(), 15);
    }

    #[test]
    fn tick_comparison() {
        let t1 = Tick::new(5);
        let t2 = Tick::new(10);
        assert!(t1 < t2);
        assert!(t2 > t1);
        assert_eq!(t1, Tick::new(5));
        assert!(t1 < 6u64);
        assert!(t1 == 5u64);
    }

    #[test]
    fn tick_to_option() {
        assert!(Tick::NULL.to_option().is_none());
        assert_eq!(Tick::new(5).to_option(), Some(Tick::new(5)));
    }

    #[test]
    fn tick_display() {
        assert_eq!(format!("{}", Tick::new(42)), "42");
        assert_eq!(format!("{}", Tick::NULL), "NULL_TICK");
    }

    #[test]
    fn tick_serde_roundtrip() {
        let tick = Tick::new(100);
        let json = serde_json::to_string(&tick).unwrap();
        let back: Tick = serde_json::from_str(&json).unwrap();
        assert_eq!(tick, back);
    }

    // ==========================================
    // Role Tests
    // ==========================================

    #[test]
    fn role_authority_predicates() {
        assert!(Role::Authority.is_authority());
        assert!(Role::Authority.may_author_input());
        assert!(!Role::Authority.predicts());
    }

    #[test]
    fn role_owner_predicates() {
        assert!(!Role::Owner.is_authority());
        assert!(Role::Owner.may_author_input());
        assert!(Role::Owner.predicts());
    }

    #[test]
    fn role_observer_predicates() {
        assert!(!Role::Observer.is_authority());
        assert!(!Role::Observer.may_author_input());
        assert!(!Role::Observer.predicts());
    }

    #[test]
    fn role_display() {
        assert_eq!(format!("{}", Role::Authority), "authority");
        assert_eq!(format!("{}", Role::Owner), "owner");
        assert_eq!(format!("{}", Role::Observer), "observer");
    }
}
