//! Versioned table entries and key validation.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use super::value::Value;

/// Maximum key length in bytes.
pub const MAX_KEY_LEN: usize = 1024;

/// Identity of whoever performed the last accepted write to an entry.
///
/// For browser peers this is the session's peer id; for the upstream peer it
/// is the identity announced in its `HelloAck`; local host writes use the
/// bridge's own network identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WriterId(pub String);

impl WriterId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WriterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A named, versioned slot in the table.
///
/// `value` is `None` for a tombstone: the key was deleted but the entry is
/// kept (with its version) until a garbage-collection sweep, so a later
/// re-creation keeps counting upward.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub key: String,
    pub value: Option<Value>,
    /// Starts at 1 and increases by exactly one per accepted change.
    pub version: u64,
    pub writer: WriterId,
    /// Microseconds since the Unix epoch at the time of the last change.
    pub modified_us: u64,
}

impl Entry {
    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }
}

/// Checks that `key` is usable as a table key.
///
/// Keys must be non-empty, at most [`MAX_KEY_LEN`] bytes, and contain no
/// ASCII control characters.
///
/// # Errors
///
/// Returns a human-readable reason when the key is rejected.
pub fn validate_key(key: &str) -> Result<(), String> {
    if key.is_empty() {
        return Err("key must not be empty".to_string());
    }
    if key.len() > MAX_KEY_LEN {
        return Err(format!("key is {} bytes (max {MAX_KEY_LEN})", key.len()));
    }
    if let Some(c) = key.chars().find(|c| c.is_ascii_control()) {
        return Err(format!("key contains control character {:?}", c));
    }
    Ok(())
}

pub(crate) fn now_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_key_accepts_path_like_keys() {
        assert!(validate_key("/SmartDashboard/speed").is_ok());
        assert!(validate_key("plain").is_ok());
    }

    #[test]
    fn test_validate_key_rejects_empty() {
        assert!(validate_key("").is_err());
    }

    #[test]
    fn test_validate_key_rejects_control_characters() {
        let err = validate_key("/a\nb").unwrap_err();
        assert!(err.contains("control"));
    }

    #[test]
    fn test_validate_key_rejects_overlong_key() {
        let key = "k".repeat(MAX_KEY_LEN + 1);
        assert!(validate_key(&key).is_err());
        assert!(validate_key(&key[..MAX_KEY_LEN]).is_ok());
    }

    #[test]
    fn test_tombstone_has_no_value() {
        let entry = Entry {
            key: "/x".to_string(),
            value: None,
            version: 3,
            writer: WriterId::new("local"),
            modified_us: 0,
        };
        assert!(entry.is_tombstone());
    }
}
