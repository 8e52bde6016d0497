//! Append-only store of signed model packages.
//!
//! Each version lives in its own directory:
//!
//! ```text
//! <root>/v<version>/model.bin       opaque model artifact
//! <root>/v<version>/metadata.json   ModelMetadata
//! <root>/v<version>/signature.sig   raw package signature
//! ```
//!
//! A version directory is staged under a temporary name and renamed into
//! place, so readers see all three files or none. Existing versions are never
//! rewritten. Rollback republishes an earlier blob as a new, freshly signed
//! head instead of moving a pointer.

pub mod export;

pub use export::{export_package, read_bundle, ExportBundle};

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::crypto::{self, RsaPrivateKey, RsaPublicKey};
use crate::error::FlError;
use crate::protocol::{ModelMetadata, ModelPackageResponse, ProtocolError, SchemaVersion};

const MODEL_FILE: &str = "model.bin";
const METADATA_FILE: &str = "metadata.json";
const SIGNATURE_FILE: &str = "signature.sig";

/// One stored version.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModelPackage {
    /// Opaque model artifact
    pub blob: Vec<u8>,
    /// Package metadata
    pub metadata: ModelMetadata,
    /// Signature over `blob || canonical_json(metadata)`
    pub signature: Vec<u8>,
}

impl ModelPackage {
    /// Check the package signature.
    pub fn verify(&self, signing_key: &RsaPublicKey) -> Result<bool, FlError> {
        let metadata = self.metadata.canonical_bytes()?;
        Ok(crypto::verify_package(
            &self.blob,
            &metadata,
            &self.signature,
            signing_key,
        ))
    }

    /// Base64 envelope for transfer.
    pub fn to_response(&self) -> ModelPackageResponse {
        ModelPackageResponse::new(&self.blob, self.metadata.clone(), &self.signature)
    }
}

/// Filesystem-backed package registry.
#[derive(Debug)]
pub struct Registry {
    root: PathBuf,
    // Head version; held for the whole next-version read-modify-write.
    head: Mutex<Option<u64>>,
}

impl Registry {
    /// Open (creating if needed) a registry rooted at `root`.
    pub fn open(root: impl AsRef<Path>) -> Result<Self, FlError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        let head = scan_versions(&root)?.last().copied();
        debug!(root = %root.display(), ?head, "opened registry");
        Ok(Self {
            root,
            head: Mutex::new(head),
        })
    }

    /// Registry directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Newest stored version, if any.
    pub fn head(&self) -> Option<u64> {
        *self.head.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// All stored versions, ascending.
    pub fn versions(&self) -> Result<Vec<u64>, FlError> {
        scan_versions(&self.root)
    }

    fn version_dir(&self, version: u64) -> PathBuf {
        self.root.join(format!("v{}", version))
    }

    /// Store an externally signed package as the next version.
    ///
    /// `version` must be exactly one past the head (0 for an empty registry),
    /// otherwise [`FlError::VersionConflict`]. A `rollback_of` must name an
    /// earlier stored version. The signature must verify under `signing_key`.
    /// Prefer [`Registry::publish`], which picks the version and signs itself.
    pub fn save(
        &self,
        version: u64,
        blob: &[u8],
        metadata: &ModelMetadata,
        signature: &[u8],
        signing_key: &RsaPublicKey,
    ) -> Result<(), FlError> {
        let mut head = self.head.lock().unwrap_or_else(PoisonError::into_inner);
        let expected = head.map_or(0, |h| h + 1);
        if version != expected {
            return Err(FlError::VersionConflict(version));
        }
        if let Some(target) = metadata.rollback_of {
            if target >= version {
                return Err(ProtocolError::InvalidField {
                    field: "rollback_of",
                    reason: format!("{} is not earlier than version {}", target, version),
                }
                .into());
            }
            if !self.version_dir(target).is_dir() {
                return Err(FlError::NotFound(target));
            }
        }
        let metadata_bytes = metadata.canonical_bytes()?;
        if !crypto::verify_package(blob, &metadata_bytes, signature, signing_key) {
            warn!(version, "refusing package with bad signature");
            return Err(FlError::InvalidPackageSignature(version));
        }
        self.write_version(version, blob, metadata, signature)?;
        *head = Some(version);
        Ok(())
    }

    fn write_version(
        &self,
        version: u64,
        blob: &[u8],
        metadata: &ModelMetadata,
        signature: &[u8],
    ) -> Result<(), FlError> {
        if metadata.version != version {
            return Err(ProtocolError::InvalidField {
                field: "version",
                reason: format!("metadata says {}, saving as {}", metadata.version, version),
            }
            .into());
        }
        let dir = self.version_dir(version);
        if dir.exists() {
            return Err(FlError::VersionConflict(version));
        }

        let staging = tempfile::Builder::new()
            .prefix(".stage-")
            .tempdir_in(&self.root)?;
        fs::write(staging.path().join(MODEL_FILE), blob)?;
        let metadata_json = serde_json::to_vec_pretty(metadata)
            .map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        fs::write(staging.path().join(METADATA_FILE), metadata_json)?;
        fs::write(staging.path().join(SIGNATURE_FILE), signature)?;

        match fs::rename(staging.path(), &dir) {
            Ok(()) => {}
            Err(_) if dir.exists() => return Err(FlError::VersionConflict(version)),
            Err(e) => return Err(e.into()),
        }
        debug!(version, bytes = blob.len(), "saved package");
        Ok(())
    }

    /// Read a stored package.
    pub fn load(&self, version: u64) -> Result<ModelPackage, FlError> {
        let dir = self.version_dir(version);
        if !dir.is_dir() {
            return Err(FlError::NotFound(version));
        }
        let blob = fs::read(dir.join(MODEL_FILE))?;
        let metadata = ModelMetadata::from_json(&fs::read(dir.join(METADATA_FILE))?)?;
        let signature = fs::read(dir.join(SIGNATURE_FILE))?;
        Ok(ModelPackage {
            blob,
            metadata,
            signature,
        })
    }

    /// Read only the metadata of a stored version.
    pub fn load_metadata(&self, version: u64) -> Result<ModelMetadata, FlError> {
        let path = self.version_dir(version).join(METADATA_FILE);
        match fs::read(&path) {
            Ok(bytes) => Ok(ModelMetadata::from_json(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(FlError::NotFound(version)),
            Err(e) => Err(e.into()),
        }
    }

    /// Read the head package.
    pub fn load_head(&self) -> Result<Option<ModelPackage>, FlError> {
        self.head().map(|v| self.load(v)).transpose()
    }

    /// Sign and store `blob` as the next version.
    pub fn publish(
        &self,
        blob: &[u8],
        base_round: u64,
        signing_key: &RsaPrivateKey,
    ) -> Result<ModelPackage, FlError> {
        self.publish_next(blob.to_vec(), base_round, None, signing_key)
    }

    /// Republish `target`'s blob as a new head version with `rollback_of = target`.
    ///
    /// `target` itself is left untouched.
    pub fn rollback(&self, target: u64, signing_key: &RsaPrivateKey) -> Result<ModelPackage, FlError> {
        let source = self.load(target)?;
        let package = self.publish_next(
            source.blob,
            source.metadata.base_round,
            Some(target),
            signing_key,
        )?;
        info!(target, version = package.metadata.version, "rolled back");
        Ok(package)
    }

    fn publish_next(
        &self,
        blob: Vec<u8>,
        base_round: u64,
        rollback_of: Option<u64>,
        signing_key: &RsaPrivateKey,
    ) -> Result<ModelPackage, FlError> {
        let mut head = self.head.lock().unwrap_or_else(PoisonError::into_inner);
        let version = head.map_or(0, |h| h + 1);
        let metadata = ModelMetadata {
            version,
            base_round,
            created_at: Utc::now(),
            schema_version: SchemaVersion::CURRENT,
            rollback_of,
        };
        let signature = crypto::sign_package(&blob, &metadata.canonical_bytes()?, signing_key)?;
        self.write_version(version, &blob, &metadata, &signature)?;
        *head = Some(version);
        info!(version, base_round, ?rollback_of, "published package");
        Ok(ModelPackage {
            blob,
            metadata,
            signature,
        })
    }
}

fn scan_versions(root: &Path) -> Result<Vec<u64>, FlError> {
    let mut versions = Vec::new();
    for entry in fs::read_dir(root)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name();
        if let Some(version) = name
            .to_str()
            .and_then(|n| n.strip_prefix('v'))
            .and_then(|n| n.parse::<u64>().ok())
        {
            versions.push(version);
        }
    }
    versions.sort_unstable();
    Ok(versions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keys::fixtures;

    fn registry() -> (tempfile::TempDir, Registry) {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::open(dir.path()).unwrap();
        (dir, registry)
    }

    #[test]
    fn test_publish_is_monotonic() {
        let (_dir, registry) = registry();
        let key = fixtures::pair(0);
        assert_eq!(registry.head(), None);

        for expected in 0..3u64 {
            let pkg = registry.publish(b"blob", expected, key.private_key()).unwrap();
            assert_eq!(pkg.metadata.version, expected);
        }
        assert_eq!(registry.head(), Some(2));
        assert_eq!(registry.versions().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn test_load_verifies() {
        let (_dir, registry) = registry();
        let key = fixtures::pair(0);
        registry.publish(b"weights", 0, key.private_key()).unwrap();

        let pkg = registry.load(0).unwrap();
        assert_eq!(pkg.blob, b"weights");
        assert_eq!(registry.load_metadata(0).unwrap(), pkg.metadata);
        assert!(pkg.verify(key.public_key()).unwrap());
        assert!(!pkg.verify(fixtures::pair(1).public_key()).unwrap());
    }

    fn signed(
        version: u64,
        blob: &[u8],
        rollback_of: Option<u64>,
        key: &crate::crypto::KeyPair,
    ) -> (ModelMetadata, Vec<u8>) {
        let metadata = ModelMetadata {
            version,
            base_round: 0,
            created_at: Utc::now(),
            schema_version: SchemaVersion::CURRENT,
            rollback_of,
        };
        let signature =
            crypto::sign_package(blob, &metadata.canonical_bytes().unwrap(), key.private_key()).unwrap();
        (metadata, signature)
    }

    #[test]
    fn test_save_next_version() {
        let (_dir, registry) = registry();
        let key = fixtures::pair(0);
        registry.publish(b"a", 0, key.private_key()).unwrap();

        let (metadata, signature) = signed(1, b"b", Some(0), key);
        registry
            .save(1, b"b", &metadata, &signature, key.public_key())
            .unwrap();
        assert_eq!(registry.head(), Some(1));
        assert!(registry.load(1).unwrap().verify(key.public_key()).unwrap());
    }

    #[test]
    fn test_save_rejects_existing_version() {
        let (_dir, registry) = registry();
        let key = fixtures::pair(0);
        let pkg = registry.publish(b"a", 0, key.private_key()).unwrap();

        let err = registry
            .save(0, b"a", &pkg.metadata, &pkg.signature, key.public_key())
            .unwrap_err();
        assert!(matches!(err, FlError::VersionConflict(0)));
        assert_eq!(registry.load(0).unwrap().blob, b"a");
    }

    #[test]
    fn test_save_rejects_version_gap() {
        let (_dir, registry) = registry();
        let key = fixtures::pair(0);
        registry.publish(b"a", 0, key.private_key()).unwrap();

        let (metadata, signature) = signed(5, b"b", None, key);
        let err = registry
            .save(5, b"b", &metadata, &signature, key.public_key())
            .unwrap_err();
        assert!(matches!(err, FlError::VersionConflict(5)));
        assert_eq!(registry.head(), Some(0));
        assert_eq!(registry.versions().unwrap(), vec![0]);

        // A later publish still lands on the next version.
        let pkg = registry.publish(b"c", 1, key.private_key()).unwrap();
        assert_eq!(pkg.metadata.version, 1);
    }

    #[test]
    fn test_save_requires_matching_metadata_version() {
        let (_dir, registry) = registry();
        let key = fixtures::pair(0);
        let pkg = registry.publish(b"a", 0, key.private_key()).unwrap();
        let err = registry
            .save(1, b"a", &pkg.metadata, &pkg.signature, key.public_key())
            .unwrap_err();
        assert!(matches!(err, FlError::Protocol(_)), "{:?}", err);
        assert_eq!(registry.head(), Some(0));
    }

    #[test]
    fn test_save_rejects_bad_rollback_target() {
        let (_dir, registry) = registry();
        let key = fixtures::pair(0);
        registry.publish(b"a", 0, key.private_key()).unwrap();
        registry.publish(b"b", 0, key.private_key()).unwrap();

        let (metadata, signature) = signed(2, b"c", Some(2), key);
        let err = registry
            .save(2, b"c", &metadata, &signature, key.public_key())
            .unwrap_err();
        assert!(matches!(err, FlError::Protocol(_)), "{:?}", err);

        let (metadata, signature) = signed(2, b"c", Some(9), key);
        let err = registry
            .save(2, b"c", &metadata, &signature, key.public_key())
            .unwrap_err();
        assert!(matches!(err, FlError::Protocol(_)), "{:?}", err);
        assert_eq!(registry.head(), Some(1));
    }

    #[test]
    fn test_save_rejects_missing_rollback_target() {
        let dir = tempfile::tempdir().unwrap();
        let key = fixtures::pair(0);
        {
            let registry = Registry::open(dir.path()).unwrap();
            registry.publish(b"a", 0, key.private_key()).unwrap();
            registry.publish(b"b", 0, key.private_key()).unwrap();
        }
        fs::remove_dir_all(dir.path().join("v0")).unwrap();
        let registry = Registry::open(dir.path()).unwrap();

        let (metadata, signature) = signed(2, b"a", Some(0), key);
        let err = registry
            .save(2, b"a", &metadata, &signature, key.public_key())
            .unwrap_err();
        assert!(matches!(err, FlError::NotFound(0)), "{:?}", err);
        assert_eq!(registry.head(), Some(1));
    }

    #[test]
    fn test_save_rejects_unverified_signature() {
        let (_dir, registry) = registry();
        let key = fixtures::pair(0);
        let (metadata, signature) = signed(0, b"a", None, fixtures::pair(1));

        let err = registry
            .save(0, b"a", &metadata, &signature, key.public_key())
            .unwrap_err();
        assert!(matches!(err, FlError::InvalidPackageSignature(0)));
        assert_eq!(err.status_code(), 400);

        let (metadata, signature) = signed(0, b"a", None, key);
        let err = registry
            .save(0, b"tampered", &metadata, &signature, key.public_key())
            .unwrap_err();
        assert!(matches!(err, FlError::InvalidPackageSignature(0)));
        assert_eq!(registry.head(), None);
        assert!(registry.versions().unwrap().is_empty());
    }

    #[test]
    fn test_unknown_version_not_found() {
        let (_dir, registry) = registry();
        assert!(matches!(registry.load(7), Err(FlError::NotFound(7))));
        assert!(registry.load_head().unwrap().is_none());
    }

    #[test]
    fn test_rollback_republishes() {
        let (_dir, registry) = registry();
        let key = fixtures::pair(0);
        registry.publish(b"v0", 0, key.private_key()).unwrap();
        registry.publish(b"v1", 0, key.private_key()).unwrap();
        registry.publish(b"v2", 1, key.private_key()).unwrap();
        let before = registry.load(0).unwrap();

        let pkg = registry.rollback(0, key.private_key()).unwrap();
        assert_eq!(pkg.metadata.version, 3);
        assert_eq!(pkg.metadata.rollback_of, Some(0));
        assert_eq!(pkg.blob, b"v0");
        assert!(registry.load(3).unwrap().verify(key.public_key()).unwrap());
        assert_eq!(registry.load(0).unwrap(), before);
        assert_eq!(registry.head(), Some(3));
    }

    #[test]
    fn test_rollback_to_missing_version() {
        let (_dir, registry) = registry();
        assert!(matches!(
            registry.rollback(4, fixtures::pair(0).private_key()),
            Err(FlError::NotFound(4))
        ));
        assert_eq!(registry.head(), None);
    }

    #[test]
    fn test_reopen_restores_head() {
        let dir = tempfile::tempdir().unwrap();
        let key = fixtures::pair(0);
        {
            let registry = Registry::open(dir.path()).unwrap();
            registry.publish(b"a", 0, key.private_key()).unwrap();
            registry.publish(b"b", 1, key.private_key()).unwrap();
        }
        let registry = Registry::open(dir.path()).unwrap();
        assert_eq!(registry.head(), Some(1));
        let pkg = registry.publish(b"c", 2, key.private_key()).unwrap();
        assert_eq!(pkg.metadata.version, 2);
    }

    #[test]
    fn test_no_staging_dirs_left_behind() {
        let (dir, registry) = registry();
        registry.publish(b"a", 0, fixtures::pair(0).private_key()).unwrap();
        let leftovers = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().starts_with(".stage-"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn test_concurrent_publish_claims_distinct_versions() {
        let (_dir, registry) = registry();
        let key = fixtures::pair(0);
        std::thread::scope(|s| {
            for i in 0..4u64 {
                let registry = &registry;
                s.spawn(move || registry.publish(b"x", i, key.private_key()).unwrap());
            }
        });
        assert_eq!(registry.versions().unwrap(), vec![0, 1, 2, 3]);
    }
}
