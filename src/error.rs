//! Error types for secure-fl
//!
//! [`FlError`] is the crate-level error. Codec, crypto and protocol failures
//! keep their own enums so callers can tell the taxonomy apart without
//! string matching.

use thiserror::Error;

use crate::codec::CodecError;
use crate::crypto::CryptoError;
use crate::protocol::ProtocolError;

/// All possible errors in secure-fl
#[derive(Error, Debug)]
pub enum FlError {
    /// Malformed or unrecognized-schema message
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Decryption, key or signing failure
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// Malformed compressed payload or metadata
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// A registered client's signature did not verify
    #[error("Invalid signature from client '{client_id}'")]
    InvalidSignature {
        /// Client that submitted the update
        client_id: String,
    },

    /// Registration is required and the client has no key on file
    #[error("Client '{0}' is not registered")]
    UnregisteredClient(String),

    /// Client id already bound to a different public key
    #[error("Client '{0}' is already registered with a different key")]
    ClientKeyConflict(String),

    /// Submission targets a round that is closed or aggregating
    #[error("Round {submitted} is closed (current round is {current})")]
    RoundClosed {
        /// Round named in the submission
        submitted: u64,
        /// Round the coordinator is accepting
        current: u64,
    },

    /// Submission targets a round that has not opened yet
    #[error("Round {submitted} is not open yet (current round is {current})")]
    RoundNotOpen {
        /// Round named in the submission
        submitted: u64,
        /// Round the coordinator is accepting
        current: u64,
    },

    /// The version already exists or is not the next one after the head
    #[error("Version {0} conflicts with the registry head")]
    VersionConflict(u64),

    /// A package offered for storage is not signed by the coordinator key
    #[error("Package signature for version {0} does not verify")]
    InvalidPackageSignature(u64),

    /// No package with this version exists in the registry
    #[error("Version {0} not found")]
    NotFound(u64),

    /// No updates were provided for aggregation
    #[error("Empty updates provided")]
    EmptyUpdates,

    /// Updates have inconsistent tensor counts or shapes
    #[error("Dimension mismatch in updates")]
    DimensionMismatch,

    /// Model export or import failed
    #[error("Model format error: {0}")]
    ModelFormat(String),

    /// The coordinator rejected the submission and it will not be retried
    #[error("Rejected by coordinator ({status}): {message}")]
    Rejected {
        /// Status code reported by the coordinator
        status: u16,
        /// Error message reported by the coordinator
        message: String,
    },

    /// Transient failures persisted through every attempt
    #[error("Gave up after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        /// Attempts made
        attempts: u32,
        /// Last transient failure observed
        last_error: String,
    },

    /// The operation was cancelled by the operator
    #[error("Operation cancelled")]
    Cancelled,

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Filesystem error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FlError {
    /// Status code for this error on the wire.
    ///
    /// Attacker-controlled input maps to 4xx, internal faults to 5xx.
    pub fn status_code(&self) -> u16 {
        match self {
            FlError::Protocol(_) | FlError::Codec(_) => 400,
            FlError::Crypto(CryptoError::Authentication)
            | FlError::Crypto(CryptoError::KeyMismatch)
            | FlError::Crypto(CryptoError::MalformedPayload(_))
            | FlError::Crypto(CryptoError::InvalidKey(_)) => 400,
            FlError::Crypto(_) => 500,
            FlError::InvalidSignature { .. } | FlError::UnregisteredClient(_) => 401,
            FlError::ClientKeyConflict(_) | FlError::VersionConflict(_) => 409,
            FlError::RoundClosed { .. } | FlError::RoundNotOpen { .. } => 409,
            FlError::NotFound(_) => 404,
            FlError::EmptyUpdates | FlError::DimensionMismatch => 400,
            FlError::InvalidPackageSignature(_) => 400,
            FlError::Rejected { status, .. } => *status,
            FlError::Cancelled => 499,
            FlError::RetriesExhausted { .. } => 503,
            FlError::ModelFormat(_) | FlError::Config(_) | FlError::Io(_) => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes_follow_taxonomy() {
        assert_eq!(FlError::Crypto(CryptoError::Authentication).status_code(), 400);
        assert_eq!(
            FlError::InvalidSignature {
                client_id: "a".into()
            }
            .status_code(),
            401
        );
        assert_eq!(FlError::VersionConflict(3).status_code(), 409);
        assert_eq!(FlError::NotFound(9).status_code(), 404);
        assert_eq!(FlError::InvalidPackageSignature(2).status_code(), 400);
        assert_eq!(
            FlError::RoundClosed {
                submitted: 0,
                current: 1
            }
            .status_code(),
            409
        );
    }

    #[test]
    fn test_display_mentions_versions() {
        let msg = FlError::VersionConflict(4).to_string();
        assert!(msg.contains('4'));
    }
}
