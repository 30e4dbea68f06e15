//! Centralized binary encoding for wire-facing types.
//!
//! All cross-peer messages encode through the same bincode configuration:
//! little-endian, fixed-width integers. Fixed-width encoding keeps message
//! sizes stable across value ranges, which matters for budgeting unreliable
//! channels, and the single shared config guarantees every peer decodes what
//! any peer encoded.

use bincode::config::{Configuration, Fixint, LittleEndian};
use serde::{de::DeserializeOwned, Serialize};

use crate::error::RampartError;

const CODEC_CONFIG: Configuration<LittleEndian, Fixint> =
    bincode::config::standard().with_fixed_int_encoding();

/// Encodes a value to a fresh byte vector.
///
/// # Errors
/// [`RampartError::SerializationError`] if encoding fails.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, RampartError> {
    bincode::serde::encode_to_vec(value, CODEC_CONFIG).map_err(|err| {
        RampartError::SerializationError {
            context: err.to_string(),
        }
    })
}

/// Encodes a value onto the end of an existing buffer, returning the number
/// of bytes written.
///
/// # Errors
/// [`RampartError::SerializationError`] if encoding fails.
pub fn encode_into<T: Serialize>(value: &T, buffer: &mut Vec<u8>) -> Result<usize, RampartError> {
    bincode::serde::encode_into_std_write(value, buffer, CODEC_CONFIG).map_err(|err| {
        RampartError::SerializationError {
            context: err.to_string(),
        }
    })
}

/// Decodes a value from a byte slice.
///
/// Trailing bytes after the decoded value are ignored; the caller frames
/// messages.
///
/// # Errors
/// [`RampartError::SerializationError`] if the bytes do not decode as `T`.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, RampartError> {
    bincode::serde::decode_from_slice(bytes, CODEC_CONFIG)
        .map(|(value, _)| value)
        .map_err(|err| RampartError::SerializationError {
            context: err.to_string(),
        })
}

// #########
// # TESTS #
// #########
