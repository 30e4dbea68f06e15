//! Wire-facing message types shared across components.
//!
//! Everything here is a plain value: the crate never sends anything itself.
//! Per-component messages live with their component ([`ReplicateRecord`],
//! [`ReconcileSnapshot`], [`CorrectionBroadcast`], [`SpawnTicket`]); this
//! module holds the types more than one component speaks.
//!
//! [`ReplicateRecord`]: crate::ReplicateRecord
//! [`ReconcileSnapshot`]: crate::ReconcileSnapshot
//! [`CorrectionBroadcast`]: crate::CorrectionBroadcast
//! [`SpawnTicket`]: crate::SpawnTicket

use crate::Tick;

/// A world-space position and orientation.
///
/// Rotation is a quaternion in `[x, y, z, w]` order; [`Pose::default`] is the
/// origin with the identity rotation.
#[derive(Debug, Copy, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Pose {
    /// World-space position.
    pub position: [f64; 3],
    /// Orientation quaternion, `[x, y, z, w]`.
    pub rotation: [f64; 4],
}

impl Default for Pose {
    fn default() -> Self {
        Self {
            position: [0.0; 3],
            rotation: [0.0, 0.0, 0.0, 1.0],
        }
    }
}

impl Pose {
    /// Creates a pose at `position` with the identity rotation.
    #[must_use]
    pub fn at(position: [f64; 3]) -> Self {
        Self {
            position,
            ..Self::default()
        }
    }
}

/// Authority-to-peers confirmation that a speculative spawn is real.
///
/// Correlated to the owner's placeholder by its `(tick, pose)` key.
#[derive(Debug, Copy, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct SpawnGrant {
    /// The tick the spawn is stamped with.
    pub tick: Tick,
    /// The authoritative pose the spawned object was bound to.
    pub pose: Pose,
}

/// Authority-to-owner denial of a speculative spawn.
///
/// Distinct from a grant that simply never arrives: a reject hands disposal
/// of the placeholder back to its original requester.
#[derive(Debug, Copy, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct SpawnReject {
    /// The tick of the denied spawn request.
    pub tick: Tick,
    /// The pose the placeholder was submitted with.
    pub pose: Pose,
}

// #########
// # TESTS #
// #########
