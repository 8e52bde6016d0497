//! Detached RSASSA-PKCS1-v1_5 signatures.
//!
//! The signed message is `SHA-256(payload)`, encoded once into the PKCS#1
//! `DigestInfo`. The payload is hashed exactly once, so signatures check out
//! with any standard RSA/SHA-256 verifier.

use rsa::{Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};

use super::CryptoError;

/// Sign the canonical bytes of a payload.
pub fn sign(payload: &[u8], private_key: &RsaPrivateKey) -> Result<Vec<u8>, CryptoError> {
    let digest = Sha256::digest(payload);
    private_key
        .sign(Pkcs1v15Sign::new::<Sha256>(), &digest)
        .map_err(|e| CryptoError::Operation(format!("sign: {}", e)))
}

/// Verify a detached signature. Malformed signatures yield `false`.
pub fn verify(payload: &[u8], signature: &[u8], public_key: &RsaPublicKey) -> bool {
    let digest = Sha256::digest(payload);
    public_key
        .verify(Pkcs1v15Sign::new::<Sha256>(), &digest, signature)
        .is_ok()
}

/// Bytes covered by a package signature: `model_blob || metadata_bytes`.
fn package_message(model_blob: &[u8], metadata_bytes: &[u8]) -> Vec<u8> {
    let mut message = Vec::with_capacity(model_blob.len() + metadata_bytes.len());
    message.extend_from_slice(model_blob);
    message.extend_from_slice(metadata_bytes);
    message
}

/// Sign a model package. `metadata_bytes` must be the canonical JSON of its metadata.
pub fn sign_package(
    model_blob: &[u8],
    metadata_bytes: &[u8],
    private_key: &RsaPrivateKey,
) -> Result<Vec<u8>, CryptoError> {
    sign(&package_message(model_blob, metadata_bytes), private_key)
}

/// Verify a model package signature.
pub fn verify_package(
    model_blob: &[u8],
    metadata_bytes: &[u8],
    signature: &[u8],
    public_key: &RsaPublicKey,
) -> bool {
    verify(&package_message(model_blob, metadata_bytes), signature, public_key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keys::fixtures;

    #[test]
    fn test_sign_verify() {
        let pair = fixtures::pair(0);
        let sig = sign(b"payload", pair.private_key()).unwrap();
        assert_eq!(sig.len(), 256);
        assert!(verify(b"payload", &sig, pair.public_key()));
    }

    #[test]
    fn test_signature_is_deterministic() {
        let pair = fixtures::pair(0);
        let a = sign(b"payload", pair.private_key()).unwrap();
        let b = sign(b"payload", pair.private_key()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_any_bit_flip_breaks_verification() {
        let pair = fixtures::pair(0);
        let payload = b"{\"client_id\":\"a\",\"round\":0}".to_vec();
        let sig = sign(&payload, pair.private_key()).unwrap();

        for byte in 0..payload.len() {
            let mut tampered = payload.clone();
            tampered[byte] ^= 0x01;
            assert!(!verify(&tampered, &sig, pair.public_key()));
        }
        for byte in [0usize, 17, 128, 255] {
            let mut tampered = sig.clone();
            tampered[byte] ^= 0x40;
            assert!(!verify(&payload, &tampered, pair.public_key()));
        }
    }

    #[test]
    fn test_wrong_public_key_fails() {
        let sig = sign(b"payload", fixtures::pair(0).private_key()).unwrap();
        assert!(!verify(b"payload", &sig, fixtures::pair(1).public_key()));
    }

    #[test]
    fn test_malformed_signature_returns_false() {
        let pair = fixtures::pair(0);
        assert!(!verify(b"payload", &[], pair.public_key()));
        assert!(!verify(b"payload", &[0u8; 3], pair.public_key()));
        assert!(!verify(b"payload", &[0xffu8; 512], pair.public_key()));
    }

    #[test]
    fn test_package_signature_binds_blob_and_metadata() {
        let pair = fixtures::pair(2);
        let sig = sign_package(b"model", b"{\"version\":1}", pair.private_key()).unwrap();
        assert!(verify_package(b"model", b"{\"version\":1}", &sig, pair.public_key()));
        assert!(!verify_package(b"model", b"{\"version\":2}", &sig, pair.public_key()));
        assert!(!verify_package(b"mode1", b"{\"version\":1}", &sig, pair.public_key()));
    }
}
