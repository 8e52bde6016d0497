//! RSA key pairs and their PEM / key-file forms.

use std::fmt;
use std::fs;
use std::io::Write;
use std::path::Path;

use rand::rngs::OsRng;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::{RsaPrivateKey, RsaPublicKey};
use tracing::info;
use zeroize::Zeroizing;

use super::CryptoError;
use crate::error::FlError;

/// Modulus size for every key in the system.
pub const RSA_BITS: usize = 2048;

/// An RSA private key together with its public half.
#[derive(Clone)]
pub struct KeyPair {
    private: RsaPrivateKey,
    public: RsaPublicKey,
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public)
            .finish_non_exhaustive()
    }
}

impl KeyPair {
    /// Generate a fresh 2048-bit pair.
    pub fn generate() -> Result<Self, CryptoError> {
        let private = RsaPrivateKey::new(&mut OsRng, RSA_BITS)
            .map_err(|e| CryptoError::KeyGeneration(e.to_string()))?;
        Ok(Self::from_private(private))
    }

    /// Wrap an existing private key.
    pub fn from_private(private: RsaPrivateKey) -> Self {
        let public = RsaPublicKey::from(&private);
        Self { private, public }
    }

    /// Parse a PKCS#8 PEM private key.
    pub fn from_private_pem(pem: &str) -> Result<Self, CryptoError> {
        let private = RsaPrivateKey::from_pkcs8_pem(pem)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        Ok(Self::from_private(private))
    }

    /// The private half.
    pub fn private_key(&self) -> &RsaPrivateKey {
        &self.private
    }

    /// The public half.
    pub fn public_key(&self) -> &RsaPublicKey {
        &self.public
    }

    /// PKCS#8 PEM of the private key.
    pub fn private_pem(&self) -> Result<Zeroizing<String>, CryptoError> {
        self.private
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))
    }

    /// SPKI PEM of the public key.
    pub fn public_pem(&self) -> Result<String, CryptoError> {
        public_key_to_pem(&self.public)
    }

    /// Load `<stem>_priv.pem` from `dir`, generating and persisting a pair if absent.
    pub fn load_or_generate(dir: &Path, stem: &str) -> Result<Self, FlError> {
        let priv_path = dir.join(format!("{}_priv.pem", stem));
        let pub_path = dir.join(format!("{}_pub.pem", stem));

        if priv_path.exists() {
            let pem = Zeroizing::new(fs::read_to_string(&priv_path)?);
            return Ok(Self::from_private_pem(&pem)?);
        }

        fs::create_dir_all(dir)?;
        let pair = Self::generate()?;
        write_private(&priv_path, pair.private_pem()?.as_bytes())?;
        fs::write(&pub_path, pair.public_pem()?)?;
        info!(path = %priv_path.display(), "generated key pair");
        Ok(pair)
    }
}

/// Generate a pair and return `(private PKCS#8 PEM, public SPKI PEM)`.
pub fn generate_keypair() -> Result<(Zeroizing<String>, String), CryptoError> {
    let pair = KeyPair::generate()?;
    Ok((pair.private_pem()?, pair.public_pem()?))
}

/// Parse an SPKI PEM public key.
pub fn public_key_from_pem(pem: &str) -> Result<RsaPublicKey, CryptoError> {
    RsaPublicKey::from_public_key_pem(pem).map_err(|e| CryptoError::InvalidKey(e.to_string()))
}

/// Encode a public key as SPKI PEM.
pub fn public_key_to_pem(key: &RsaPublicKey) -> Result<String, CryptoError> {
    key.to_public_key_pem(LineEnding::LF)
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))
}

#[cfg(unix)]
fn write_private(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    use std::os::unix::fs::OpenOptionsExt;
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(bytes)
}

#[cfg(not(unix))]
fn write_private(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)?;
    file.write_all(bytes)
}

/// Coordinator key material: the payload decryption pair and the package signing pair.
#[derive(Clone, Debug)]
pub struct KeyMaterial {
    /// Opens client updates; its public half is advertised in the config response
    pub decryption: KeyPair,
    /// Signs published model packages
    pub signing: KeyPair,
}

impl KeyMaterial {
    /// Generate both pairs in memory.
    pub fn generate() -> Result<Self, CryptoError> {
        Ok(Self {
            decryption: KeyPair::generate()?,
            signing: KeyPair::generate()?,
        })
    }

    /// Load both pairs from `dir` (`decrypt_*.pem`, `signing_*.pem`), creating any that are missing.
    pub fn load_or_generate(dir: &Path) -> Result<Self, FlError> {
        Ok(Self {
            decryption: KeyPair::load_or_generate(dir, "decrypt")?,
            signing: KeyPair::load_or_generate(dir, "signing")?,
        })
    }
}
