//! Hybrid encryption: AES-256-GCM for the payload, RSA-OAEP/SHA-256 for the key.
//!
//! Wire form: `u16_be(len(enc_key)) || enc_key || nonce(12) || ciphertext`.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use zeroize::Zeroizing;

use super::CryptoError;

/// AES-256 key length.
pub const KEY_LEN: usize = 32;

/// AES-GCM nonce length.
pub const NONCE_LEN: usize = 12;

/// GCM authentication tag length.
const TAG_LEN: usize = 16;

/// Encrypted payload, decryptable only with the recipient's private key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncryptedPayload {
    /// Symmetric key wrapped with RSA-OAEP
    pub enc_key: Vec<u8>,
    /// Per-message nonce
    pub nonce: [u8; NONCE_LEN],
    /// AES-GCM ciphertext including the tag
    pub ciphertext: Vec<u8>,
}

impl EncryptedPayload {
    /// Encode to the wire form.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(2 + self.enc_key.len() + NONCE_LEN + self.ciphertext.len());
        out.extend_from_slice(&(self.enc_key.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.enc_key);
        out.extend_from_slice(&self.nonce);
        out.extend_from_slice(&self.ciphertext);
        out
    }

    /// Decode from the wire form.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() < 2 {
            return Err(CryptoError::MalformedPayload("missing key length".into()));
        }
        let key_len = u16::from_be_bytes([bytes[0], bytes[1]]) as usize;
        let rest = &bytes[2..];
        if rest.len() < key_len + NONCE_LEN + TAG_LEN {
            return Err(CryptoError::MalformedPayload(format!(
                "{} bytes after header, need at least {}",
                rest.len(),
                key_len + NONCE_LEN + TAG_LEN
            )));
        }
        let (enc_key, rest) = rest.split_at(key_len);
        let (nonce, ciphertext) = rest.split_at(NONCE_LEN);
        let mut nonce_arr = [0u8; NONCE_LEN];
        nonce_arr.copy_from_slice(nonce);
        Ok(Self {
            enc_key: enc_key.to_vec(),
            nonce: nonce_arr,
            ciphertext: ciphertext.to_vec(),
        })
    }
}

/// Encrypt `plaintext` for the holder of `recipient`'s private key.
///
/// A fresh key and nonce are drawn for every call.
pub fn encrypt(plaintext: &[u8], recipient: &RsaPublicKey) -> Result<EncryptedPayload, CryptoError> {
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    OsRng.fill_bytes(&mut key[..]);
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key[..]));
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|e| CryptoError::Operation(format!("aes-gcm: {}", e)))?;

    let enc_key = recipient
        .encrypt(&mut OsRng, Oaep::new::<Sha256>(), &key[..])
        .map_err(|e| CryptoError::Operation(format!("key wrap: {}", e)))?;

    Ok(EncryptedPayload {
        enc_key,
        nonce,
        ciphertext,
    })
}

/// Decrypt a payload with the recipient's private key.
///
/// Returns [`CryptoError::KeyMismatch`] when the wrapped key does not open
/// and [`CryptoError::Authentication`] when the ciphertext or nonce was
/// modified. No partial plaintext is ever returned.
pub fn decrypt(payload: &EncryptedPayload, private_key: &RsaPrivateKey) -> Result<Vec<u8>, CryptoError> {
    let key = Zeroizing::new(
        private_key
            .decrypt(Oaep::new::<Sha256>(), &payload.enc_key)
            .map_err(|_| CryptoError::KeyMismatch)?,
    );
    if key.len() != KEY_LEN {
        return Err(CryptoError::KeyMismatch);
    }

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
    cipher
        .decrypt(Nonce::from_slice(&payload.nonce), payload.ciphertext.as_slice())
        .map_err(|_| CryptoError::Authentication)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keys::fixtures;

    #[test]
    fn test_roundtrip_various_lengths() {
        let pair = fixtures::pair(0);
        for len in [0usize, 1, 15, 16, 17, 4096] {
            let msg: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            let payload = encrypt(&msg, pair.public_key()).unwrap();
            let wire = payload.to_bytes();
            let parsed = EncryptedPayload::from_bytes(&wire).unwrap();
            assert_eq!(decrypt(&parsed, pair.private_key()).unwrap(), msg);
        }
    }

    #[test]
    fn test_fresh_key_and_nonce_per_call() {
        let pair = fixtures::pair(0);
        let a = encrypt(b"same", pair.public_key()).unwrap();
        let b = encrypt(b"same", pair.public_key()).unwrap();
        assert_ne!(a.nonce, b.nonce);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn test_wrong_private_key_is_key_mismatch() {
        let payload = encrypt(b"secret gradients", fixtures::pair(0).public_key()).unwrap();
        assert_eq!(
            decrypt(&payload, fixtures::pair(1).private_key()).unwrap_err(),
            CryptoError::KeyMismatch
        );
    }

    #[test]
    fn test_tampered_ciphertext_fails_authentication() {
        let pair = fixtures::pair(0);
        let mut payload = encrypt(b"secret gradients", pair.public_key()).unwrap();
        payload.ciphertext[0] ^= 0x01;
        assert_eq!(
            decrypt(&payload, pair.private_key()).unwrap_err(),
            CryptoError::Authentication
        );
    }

    #[test]
    fn test_tampered_nonce_fails_authentication() {
        let pair = fixtures::pair(0);
        let mut payload = encrypt(b"secret gradients", pair.public_key()).unwrap();
        payload.nonce[11] ^= 0x80;
        assert_eq!(
            decrypt(&payload, pair.private_key()).unwrap_err(),
            CryptoError::Authentication
        );
    }

    #[test]
    fn test_wire_layout() {
        let payload = encrypt(b"x", fixtures::pair(0).public_key()).unwrap();
        let wire = payload.to_bytes();
        assert_eq!(u16::from_be_bytes([wire[0], wire[1]]), 256);
        assert_eq!(wire.len(), 2 + 256 + NONCE_LEN + 1 + TAG_LEN);
    }

    #[test]
    fn test_truncated_wire_is_malformed() {
        let wire = encrypt(b"x", fixtures::pair(0).public_key()).unwrap().to_bytes();
        for cut in [0usize, 1, 2, 100, wire.len() - 2] {
            assert!(matches!(
                EncryptedPayload::from_bytes(&wire[..cut]),
                Err(CryptoError::MalformedPayload(_))
            ));
        }
    }
}
