use std::error::Error;
use std::fmt;
use std::fmt::Display;

use crate::{Role, Tick};

/// This enum contains all error messages this library can return. Most API
/// functions will generally return a [`Result<(), RampartError>`].
///
/// Expected steady-state conditions (queue full, watchdog timeout, stale
/// correction) are *not* errors; they resolve through defined policies and
/// never surface here. This enum covers configuration errors (fatal at setup)
/// and protocol errors (programmer errors, reported loudly via
/// [`telemetry`](crate::telemetry) and refused without corrupting state).
///
/// [`Result<(), RampartError>`]: std::result::Result
#[derive(Debug, Clone, PartialEq)]
pub enum RampartError {
    /// You made an invalid request, usually by using wrong parameters for
    /// function calls.
    InvalidRequest {
        /// Further specifies why the request was invalid.
        info: String,
    },
    /// The alarm behind a handle was already removed. Operating on a removed
    /// alarm fails rather than panicking.
    AlarmRemoved,
    /// An alarm was created or reset with a non-positive cooldown.
    InvalidCooldown {
        /// The rejected cooldown value, in seconds.
        cooldown: f64,
    },
    /// A scheduler node id did not refer to a live node.
    UnknownNode,
    /// An invalid tick was provided, for instance a snapshot tagged with the
    /// null tick.
    InvalidTick {
        /// The tick that was invalid.
        tick: Tick,
        /// A description of why the tick was invalid.
        reason: String,
    },
    /// An operation reserved for one role was invoked under another, e.g. a
    /// non-owner capturing predictive input or a non-authority emitting
    /// snapshots.
    WrongRole {
        /// The role the operation requires.
        expected: Role,
        /// The role the component actually holds.
        actual: Role,
    },
    /// Serialization or deserialization of data failed.
    SerializationError {
        /// A description of what failed to serialize/deserialize.
        context: String,
    },
    /// An internal error occurred that should not happen under normal
    /// operation. If you encounter this error, please report it as a bug.
    InternalError {
        /// A description of the internal error.
        context: String,
    },
}

impl Display for RampartError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RampartError::InvalidRequest { info } => {
                write!(f, "Invalid Request: {}", info)
            }
            RampartError::AlarmRemoved => {
                write!(f, "The alarm behind this handle was already removed.")
            }
            RampartError::InvalidCooldown { cooldown } => {
                write!(f, "Alarm cooldowns must be positive, got {}.", cooldown)
            }
            RampartError::UnknownNode => {
                write!(f, "The scheduler node id does not refer to a live node.")
            }
            RampartError::InvalidTick { tick, reason } => {
                write!(f, "Invalid tick {}: {}", tick, reason)
            }
            RampartError::WrongRole { expected, actual } => {
                write!(
                    f,
                    "Operation requires the {} role but this peer is the {}.",
                    expected, actual
                )
            }
            RampartError::SerializationError { context } => {
                write!(f, "Serialization error: {}", context)
            }
            RampartError::InternalError { context } => {
                write!(f, "Internal error (please report as bug): {}", context)
            }
        }
    }
}

impl Error for RampartError {}
