//! Typed, versioned wire records and their canonical serialization.
//!
//! Signatures are computed over [`canonical_json`]: object keys sorted
//! lexicographically at every depth, no whitespace. Any reordering or
//! reformatting invalidates prior signatures, so every signer and verifier
//! must go through this function.
//!
//! Incoming messages are decoded with [`decode_message`], which rejects
//! unknown schema versions before looking at anything else.

pub mod messages;

pub use messages::{
    ConfigResponse, ModelMetadata, ModelPackageResponse, RegisterRequest, SignablePayload,
    UpdateAck, UpdateRequest,
};

use std::fmt;

use serde::de::{self, DeserializeOwned};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use thiserror::Error;

/// Errors raised while decoding or validating protocol messages.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Body is not valid JSON or does not match the record
    #[error("Malformed message: {0}")]
    Malformed(String),

    /// Required field absent
    #[error("Missing field: {0}")]
    MissingField(&'static str),

    /// Schema version this build does not understand
    #[error("Unsupported schema version: {0}")]
    UnsupportedSchema(String),

    /// Field is not valid base64
    #[error("Field '{field}' is not valid base64: {reason}")]
    InvalidBase64 {
        /// Offending field
        field: &'static str,
        /// Decoder message
        reason: String,
    },

    /// Field value outside its allowed range
    #[error("Invalid field '{field}': {reason}")]
    InvalidField {
        /// Offending field
        field: &'static str,
        /// What is wrong with it
        reason: String,
    },
}

/// Message schema versions understood by this build.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum SchemaVersion {
    /// `"1.0"`
    #[default]
    V1,
}

impl SchemaVersion {
    /// Version stamped on everything this build emits.
    pub const CURRENT: SchemaVersion = SchemaVersion::V1;

    /// Wire string.
    pub fn as_str(&self) -> &'static str {
        match self {
            SchemaVersion::V1 => "1.0",
        }
    }

    /// Parse a wire string. Unknown versions are rejected, never defaulted.
    pub fn parse(s: &str) -> Result<Self, ProtocolError> {
        match s {
            "1.0" => Ok(SchemaVersion::V1),
            other => Err(ProtocolError::UnsupportedSchema(other.to_string())),
        }
    }
}

impl fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for SchemaVersion {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for SchemaVersion {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        SchemaVersion::parse(&s).map_err(de::Error::custom)
    }
}

/// Canonical bytes of any serializable value: sorted keys, compact.
pub fn canonical_json<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    let value = serde_json::to_value(value).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
    serde_json::to_vec(&sorted(value)).map_err(|e| ProtocolError::Malformed(e.to_string()))
}

fn sorted(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            Value::Object(entries.into_iter().map(|(k, v)| (k, sorted(v))).collect())
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sorted).collect()),
        other => other,
    }
}

/// Decode a message whose top-level object carries `schema_version`.
pub fn decode_message<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    decode_message_at(bytes, "/schema_version")
}

/// Decode a message whose schema version lives at the JSON `pointer`.
pub fn decode_message_at<T: DeserializeOwned>(bytes: &[u8], pointer: &'static str) -> Result<T, ProtocolError> {
    let value: Value =
        serde_json::from_slice(bytes).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
    if !value.is_object() {
        return Err(ProtocolError::Malformed("expected a JSON object".into()));
    }
    match value.pointer(pointer) {
        None => return Err(ProtocolError::MissingField("schema_version")),
        Some(Value::String(s)) => {
            SchemaVersion::parse(s)?;
        }
        Some(other) => {
            return Err(ProtocolError::InvalidField {
                field: "schema_version",
                reason: format!("expected a string, got {}", other),
            })
        }
    }
    serde_json::from_value(value).map_err(|e| ProtocolError::Malformed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_canonical_json_sorts_and_compacts() {
        let value = json!({"round": 3, "client_id": "c", "nested": {"z": 1, "a": [ {"y": 0, "b": 1} ]}});
        let bytes = canonical_json(&value).unwrap();
        assert_eq!(
            String::from_utf8(bytes).unwrap(),
            r#"{"client_id":"c","nested":{"a":[{"b":1,"y":0}],"z":1},"round":3}"#
        );
    }

    #[test]
    fn test_schema_version_roundtrip() {
        assert_eq!(serde_json::to_string(&SchemaVersion::V1).unwrap(), "\"1.0\"");
        let parsed: SchemaVersion = serde_json::from_str("\"1.0\"").unwrap();
        assert_eq!(parsed, SchemaVersion::V1);
        assert!(serde_json::from_str::<SchemaVersion>("\"2.0\"").is_err());
    }

    #[test]
    fn test_decode_rejects_unknown_schema() {
        let body = br#"{"schema_version":"9.9","anything":1}"#;
        let err = decode_message::<Value>(body).unwrap_err();
        assert_eq!(err, ProtocolError::UnsupportedSchema("9.9".into()));
    }

    #[test]
    fn test_decode_requires_schema() {
        let err = decode_message::<Value>(br#"{"round":1}"#).unwrap_err();
        assert_eq!(err, ProtocolError::MissingField("schema_version"));
    }

    #[test]
    fn test_decode_rejects_non_object() {
        assert!(matches!(
            decode_message::<Value>(b"[1,2]"),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(matches!(
            decode_message::<Value>(b"\xff\xfe"),
            Err(ProtocolError::Malformed(_))
        ));
    }
}
