//! Export bundles for out-of-band transfer.
//!
//! A bundle directory holds the three registry facets plus `package.json`,
//! the base64 envelope that can be verified with nothing but the signing
//! public key.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::info;

use super::{Registry, METADATA_FILE, MODEL_FILE, SIGNATURE_FILE};
use crate::error::FlError;
use crate::protocol::{ModelPackageResponse, ProtocolError};

/// File name of the base64 envelope inside a bundle.
pub const PACKAGE_FILE: &str = "package.json";

/// The envelope written as `package.json`.
pub type ExportBundle = ModelPackageResponse;

/// Write `version` (or the head) into `out_dir`. Returns the `package.json` path.
pub fn export_package(
    registry: &Registry,
    version: Option<u64>,
    out_dir: &Path,
) -> Result<PathBuf, FlError> {
    let version = match version {
        Some(v) => v,
        None => registry.head().ok_or(FlError::NotFound(0))?,
    };
    let package = registry.load(version)?;

    fs::create_dir_all(out_dir)?;
    fs::write(out_dir.join(MODEL_FILE), &package.blob)?;
    fs::write(
        out_dir.join(METADATA_FILE),
        to_pretty(&package.metadata)?,
    )?;
    fs::write(out_dir.join(SIGNATURE_FILE), &package.signature)?;

    let path = out_dir.join(PACKAGE_FILE);
    fs::write(&path, to_pretty(&package.to_response())?)?;
    info!(version, out = %out_dir.display(), "exported package");
    Ok(path)
}

/// Read an envelope from a `package.json` file or a bundle directory.
pub fn read_bundle(path: &Path) -> Result<ExportBundle, FlError> {
    let path = if path.is_dir() {
        path.join(PACKAGE_FILE)
    } else {
        path.to_path_buf()
    };
    Ok(ExportBundle::from_json(&fs::read(path)?)?)
}

fn to_pretty<T: serde::Serialize>(value: &T) -> Result<Vec<u8>, FlError> {
    serde_json::to_vec_pretty(value).map_err(|e| ProtocolError::Malformed(e.to_string()).into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keys::fixtures;

    #[test]
    fn test_export_then_verify_offline() {
        let reg_dir = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let key = fixtures::pair(3);
        let registry = Registry::open(reg_dir.path()).unwrap();
        registry.publish(b"first", 0, key.private_key()).unwrap();
        registry.publish(b"second", 1, key.private_key()).unwrap();

        let path = export_package(&registry, None, out.path()).unwrap();
        assert_eq!(path, out.path().join(PACKAGE_FILE));
        assert_eq!(fs::read(out.path().join(MODEL_FILE)).unwrap(), b"second");

        let bundle = read_bundle(out.path()).unwrap();
        assert_eq!(bundle.metadata.version, 1);
        assert!(bundle.verify(key.public_key()).unwrap());
        assert!(!bundle.verify(fixtures::pair(0).public_key()).unwrap());
    }

    #[test]
    fn test_tampered_bundle_fails() {
        let reg_dir = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let key = fixtures::pair(3);
        let registry = Registry::open(reg_dir.path()).unwrap();
        registry.publish(b"weights", 0, key.private_key()).unwrap();
        let path = export_package(&registry, Some(0), out.path()).unwrap();

        let mut bundle = read_bundle(&path).unwrap();
        bundle.metadata.base_round = 9;
        assert!(!bundle.verify(key.public_key()).unwrap());
    }

    #[test]
    fn test_export_missing_version() {
        let reg_dir = tempfile::tempdir().unwrap();
        let registry = Registry::open(reg_dir.path()).unwrap();
        assert!(matches!(
            export_package(&registry, Some(3), reg_dir.path()),
            Err(FlError::NotFound(3))
        ));
    }
}
