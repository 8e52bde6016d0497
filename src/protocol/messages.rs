//! Federated protocol records.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{canonical_json, decode_message, decode_message_at, ProtocolError, SchemaVersion};
use crate::codec::CompressionMeta;
use crate::crypto::{self, RsaPublicKey};

/// Longest accepted client identifier.
pub const MAX_CLIENT_ID_LEN: usize = 128;

/// Coordinator announcement fetched by clients before each round.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigResponse {
    /// Round currently accepting updates
    pub current_round: u64,
    /// Head version of the model registry
    pub model_version: u64,
    /// SPKI PEM of the key updates must be encrypted for
    pub server_public_key: String,
    /// Contributions needed before a round can aggregate
    pub min_clients: u32,
    /// Grace period advertised to clients, in seconds
    pub grace_seconds: u64,
    /// Schema version of this message
    pub schema_version: SchemaVersion,
}

impl ConfigResponse {
    /// Decode and check the schema version.
    pub fn from_json(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode_message(bytes)
    }

    /// Parse the advertised encryption key.
    pub fn server_key(&self) -> Result<RsaPublicKey, ProtocolError> {
        crypto::keys::public_key_from_pem(&self.server_public_key).map_err(|e| {
            ProtocolError::InvalidField {
                field: "server_public_key",
                reason: e.to_string(),
            }
        })
    }
}

/// The fields a client signs. Serialized only through [`canonical_json`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SignablePayload<'a> {
    /// Submitting client
    pub client_id: &'a str,
    /// Target round
    pub round: u64,
    /// Base64 of the encrypted payload, exactly as sent
    pub encrypted_payload: &'a str,
    /// Schema version of the enclosing request
    pub schema_version: SchemaVersion,
}

impl SignablePayload<'_> {
    /// Canonical bytes the signature covers.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        canonical_json(self)
    }
}

/// One client's encrypted, signed contribution to a round.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpdateRequest {
    /// Submitting client
    pub client_id: String,
    /// Target round
    pub round: u64,
    /// Base64 of the hybrid-encrypted compressed update
    pub encrypted_payload: String,
    /// Shapes and parameters needed to decompress
    pub compression_meta: CompressionMeta,
    /// Base64 of the client's detached signature
    pub signature: String,
    /// Schema version of this message
    pub schema_version: SchemaVersion,
}

impl UpdateRequest {
    /// Decode, check the schema version and validate every field.
    pub fn from_json(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let request: Self = decode_message(bytes)?;
        request.validate()?;
        Ok(request)
    }

    /// Field checks that serde cannot express.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        validate_client_id(&self.client_id)?;
        if self.encrypted_payload.is_empty() {
            return Err(ProtocolError::MissingField("encrypted_payload"));
        }
        if self.signature.is_empty() {
            return Err(ProtocolError::MissingField("signature"));
        }
        Ok(())
    }

    /// The signed view of this request.
    pub fn signable(&self) -> SignablePayload<'_> {
        SignablePayload {
            client_id: &self.client_id,
            round: self.round,
            encrypted_payload: &self.encrypted_payload,
            schema_version: self.schema_version,
        }
    }

    /// Decoded encrypted payload bytes.
    pub fn payload_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        decode_b64("encrypted_payload", &self.encrypted_payload)
    }

    /// Decoded signature bytes.
    pub fn signature_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        decode_b64("signature", &self.signature)
    }
}

/// Reject empty, oversized or control-character client ids.
pub fn validate_client_id(client_id: &str) -> Result<(), ProtocolError> {
    if client_id.is_empty() {
        return Err(ProtocolError::MissingField("client_id"));
    }
    if client_id.len() > MAX_CLIENT_ID_LEN {
        return Err(ProtocolError::InvalidField {
            field: "client_id",
            reason: format!("longer than {} bytes", MAX_CLIENT_ID_LEN),
        });
    }
    if client_id.chars().any(char::is_control) {
        return Err(ProtocolError::InvalidField {
            field: "client_id",
            reason: "contains control characters".into(),
        });
    }
    Ok(())
}

/// Binds a client id to the key its updates are signed with.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegisterRequest {
    /// Client being registered
    pub client_id: String,
    /// SPKI PEM of the client's signing key
    pub public_key: String,
    /// Schema version of this message
    pub schema_version: SchemaVersion,
}

impl RegisterRequest {
    /// Decode, check the schema version and validate the client id.
    pub fn from_json(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let request: Self = decode_message(bytes)?;
        validate_client_id(&request.client_id)?;
        Ok(request)
    }
}

/// Coordinator acknowledgement of an accepted update.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateAck {
    /// Always `"accepted"`
    pub status: String,
    /// Whether this `(client_id, round)` had already been recorded
    pub duplicate: bool,
}

/// Immutable description of one model package version.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelMetadata {
    /// Registry version
    pub version: u64,
    /// Round whose aggregate produced this model
    pub base_round: u64,
    /// Publication time
    pub created_at: DateTime<Utc>,
    /// Schema version of this record
    pub schema_version: SchemaVersion,
    /// Earlier version whose blob this package restores
    pub rollback_of: Option<u64>,
}

impl ModelMetadata {
    /// Canonical JSON, the second half of the package signature input.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        canonical_json(self)
    }

    /// Decode and check the schema version.
    pub fn from_json(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode_message(bytes)
    }
}

/// Base64 envelope of a signed package, served by the coordinator and
/// written as `package.json` by the export tool.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelPackageResponse {
    /// Base64 of the model artifact
    pub model_blob_b64: String,
    /// Package metadata
    pub metadata: ModelMetadata,
    /// Base64 of the package signature
    pub signature_b64: String,
}

impl ModelPackageResponse {
    /// Build an envelope from raw parts.
    pub fn new(model_blob: &[u8], metadata: ModelMetadata, signature: &[u8]) -> Self {
        Self {
            model_blob_b64: STANDARD.encode(model_blob),
            metadata,
            signature_b64: STANDARD.encode(signature),
        }
    }

    /// Decode and check the metadata schema version.
    pub fn from_json(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode_message_at(bytes, "/metadata/schema_version")
    }

    /// Decoded model artifact.
    pub fn model_blob(&self) -> Result<Vec<u8>, ProtocolError> {
        decode_b64("model_blob_b64", &self.model_blob_b64)
    }

    /// Decoded signature.
    pub fn signature(&self) -> Result<Vec<u8>, ProtocolError> {
        decode_b64("signature_b64", &self.signature_b64)
    }

    /// Check the package signature without registry access.
    pub fn verify(&self, signing_key: &RsaPublicKey) -> Result<bool, ProtocolError> {
        let blob = self.model_blob()?;
        let signature = self.signature()?;
        let metadata = self.metadata.canonical_bytes()?;
        Ok(crypto::verify_package(&blob, &metadata, &signature, signing_key))
    }
}

fn decode_b64(field: &'static str, value: &str) -> Result<Vec<u8>, ProtocolError> {
    STANDARD
        .decode(value)
        .map_err(|e| ProtocolError::InvalidBase64 {
            field,
            reason: e.to_string(),
        })
}
