//! Serialization helpers for side effect and version markers.
//!
//! A side effect runs once and its result is recorded in a `MarkerRecorded`
//! event; replays read the recorded value instead of running it again.
//! Version markers record which branch of a changed workflow a run took.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const SIDE_EFFECT_MARKER_NAME: &str = "SideEffect";
pub const VERSION_MARKER_NAME: &str = "Version";

/// Version of code paths that existed before a change was introduced.
pub const DEFAULT_VERSION: i32 = -1;

/// Details stored in a side effect marker
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SideEffectDetails {
    pub side_effect_id: u64,
    pub result: Vec<u8>,
}

/// Details stored in a version marker
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct VersionDetails {
    pub change_id: String,
    pub version: i32,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SideEffectError {
    #[error("failed to encode side effect details: {0}")]
    Serialization(String),
    #[error("failed to decode side effect details: {0}")]
    Deserialization(String),
}

pub fn encode_side_effect_details(
    side_effect_id: u64,
    result: &[u8],
) -> Result<Vec<u8>, SideEffectError> {
    let details = SideEffectDetails {
        side_effect_id,
        result: result.to_vec(),
    };
    serde_json::to_vec(&details).map_err(|e| SideEffectError::Serialization(e.to_string()))
}

pub fn decode_side_effect_details(data: &[u8]) -> Result<SideEffectDetails, SideEffectError> {
    serde_json::from_slice(data).map_err(|e| SideEffectError::Deserialization(e.to_string()))
}

pub fn encode_version_details(change_id: &str, version: i32) -> Result<Vec<u8>, SideEffectError> {
    let details = VersionDetails {
        change_id: change_id.to_string(),
        version,
    };
    serde_json::to_vec(&details).map_err(|e| SideEffectError::Serialization(e.to_string()))
}

pub fn decode_version_details(data: &[u8]) -> Result<VersionDetails, SideEffectError> {
    serde_json::from_slice(data).map_err(|e| SideEffectError::Deserialization(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_side_effect_details() {
        let encoded = encode_side_effect_details(7, b"42").unwrap();
        let decoded = decode_side_effect_details(&encoded).unwrap();
        assert_eq!(decoded.side_effect_id, 7);
        assert_eq!(decoded.result, b"42".to_vec());
    }

    #[test]
    fn test_version_details() {
        let encoded = encode_version_details("add-greeting", 2).unwrap();
        let decoded = decode_version_details(&encoded).unwrap();
        assert_eq!(
            decoded,
            VersionDetails {
                change_id: "add-greeting".to_string(),
                version: 2
            }
        );
        assert!(decode_version_details(&encode_side_effect_details(1, b"x").unwrap()).is_err());
    }

    #[test]
    fn test_decode_garbage() {
        assert!(matches!(
            decode_side_effect_details(b"not json"),
            Err(SideEffectError::Deserialization(_))
        ));
    }
}
