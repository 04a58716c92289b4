//! Utility functions for scarab

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Percent-encoding set for counter ids used as file names
/// (includes /, %, and control chars)
const COUNTER_ENCODE_SET: &AsciiSet = &CONTROLS
    .add(b'/')
    .add(b'%')
    .add(b' ')
    .add(b'?')
    .add(b'#')
    .add(b'&')
    .add(b'\\');

/// Encode a counter id for filesystem usage
pub fn encode_counter_id(id: &str) -> String {
    utf8_percent_encode(id, COUNTER_ENCODE_SET).to_string()
}

/// Decode a percent-encoded counter id
pub fn decode_counter_id(encoded: &str) -> crate::Result<String> {
    percent_decode_str(encoded)
        .decode_utf8()
        .map(|s| s.to_string())
        .map_err(|e| crate::Error::Other(format!("Failed to decode counter id: {}", e)))
}

/// Validate a counter id (non-empty, bounded length, no control chars)
pub fn validate_counter_id(id: &str) -> crate::Result<()> {
    if id.is_empty() {
        return Err(crate::Error::InvalidConfig(
            "counter id cannot be empty".into(),
        ));
    }

    if id.len() > 512 {
        return Err(crate::Error::InvalidConfig(
            "counter id too long (max 512 bytes)".into(),
        ));
    }

    if id.chars().any(|c| c.is_control()) {
        return Err(crate::Error::InvalidConfig(
            "counter id contains invalid characters".into(),
        ));
    }

    Ok(())
}

/// Get current Unix timestamp (seconds)
pub fn timestamp_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Get current Unix timestamp (milliseconds)
pub fn timestamp_now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Node health state, as seen from the consensus leader's ack history
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    Alive,
    Suspect,
    Dead,
}

impl NodeState {
    /// Can this node hold counter ownership?
    pub fn can_own(&self) -> bool {
        matches!(self, NodeState::Alive)
    }
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeState::Alive => write!(f, "alive"),
            NodeState::Suspect => write!(f, "suspect"),
            NodeState::Dead => write!(f, "dead"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_counter_id() {
        let id = "epoch/partition-42";
        let encoded = encode_counter_id(id);
        assert!(encoded.contains("%2F"));

        let decoded = decode_counter_id(&encoded).unwrap();
        assert_eq!(decoded, id);
    }

    #[test]
    fn test_validate_counter_id() {
        assert!(validate_counter_id("sys/node-3/idgen").is_ok());
        assert!(validate_counter_id("epoch/part-0").is_ok());
        assert!(validate_counter_id("").is_err());
        assert!(validate_counter_id(&"x".repeat(1000)).is_err());
        assert!(validate_counter_id("bad\u{0}id").is_err());
    }

    #[test]
    fn test_node_state() {
        assert!(NodeState::Alive.can_own());
        assert!(!NodeState::Suspect.can_own());
        assert!(!NodeState::Dead.can_own());
        assert_eq!(NodeState::Dead.to_string(), "dead");
    }
}
