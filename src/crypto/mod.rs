//! Hybrid encryption and detached signatures.
//!
//! - [`keys`] - RSA-2048 key pairs, PEM encodings and key files
//! - [`hybrid`] - AES-256-GCM payloads whose key is wrapped with RSA-OAEP/SHA-256
//! - [`signature`] - RSASSA-PKCS1-v1_5 over SHA-256 of canonical bytes
//!
//! Only the holder of the coordinator's decryption key can open an
//! [`EncryptedPayload`]; clients and packages are authenticated with
//! detached signatures.

pub mod hybrid;
pub mod keys;
pub mod signature;

pub use hybrid::{decrypt, encrypt, EncryptedPayload};
pub use keys::{generate_keypair, KeyMaterial, KeyPair};
pub use signature::{sign, sign_package, verify, verify_package};

pub use rsa::{RsaPrivateKey, RsaPublicKey};

use thiserror::Error;

/// Errors from key handling, decryption and signing.
///
/// Verification failures are not errors: [`verify`] returns `false`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// Ciphertext or nonce was tampered with
    #[error("Authentication failed: ciphertext or nonce was modified")]
    Authentication,

    /// The wrapped key does not open with this private key
    #[error("Key mismatch: payload was not encrypted for this key")]
    KeyMismatch,

    /// Framing of the encrypted payload is invalid
    #[error("Malformed encrypted payload: {0}")]
    MalformedPayload(String),

    /// PEM could not be parsed or encoded
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// Key generation failed
    #[error("Key generation failed: {0}")]
    KeyGeneration(String),

    /// Wrapping or signing failed
    #[error("Crypto operation failed: {0}")]
    Operation(String),
}
