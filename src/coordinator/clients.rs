//! Registered client signing keys.
//!
//! When file-backed, the whole table is rewritten as a JSON object mapping
//! client id to SPKI PEM. The new file is written beside the old one and
//! renamed over it, so a crash leaves either the previous table or the new one.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::crypto::{keys, RsaPublicKey};
use crate::error::FlError;

/// Client id to signing key table.
#[derive(Debug, Default)]
pub struct ClientStore {
    keys: HashMap<String, RsaPublicKey>,
    pems: BTreeMap<String, String>,
    path: Option<PathBuf>,
}

impl ClientStore {
    /// Empty, in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a file-backed store, loading any registrations already on disk.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, FlError> {
        let path = path.as_ref().to_path_buf();
        let pems: BTreeMap<String, String> = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| FlError::Config(format!("client store {}: {}", path.display(), e)))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        let mut keys = HashMap::with_capacity(pems.len());
        for (client_id, pem) in &pems {
            let key = keys::public_key_from_pem(pem).map_err(|e| {
                FlError::Config(format!("client store {}: key for '{}': {}", path.display(), client_id, e))
            })?;
            keys.insert(client_id.clone(), key);
        }
        debug!(path = %path.display(), clients = keys.len(), "opened client store");
        Ok(Self {
            keys,
            pems,
            path: Some(path),
        })
    }

    /// Bind `client_id` to `key`.
    ///
    /// Returns `false` if it was already bound to this key and
    /// [`FlError::ClientKeyConflict`] if it is bound to another one. A new
    /// binding is persisted before it becomes visible.
    pub fn register(&mut self, client_id: &str, key: RsaPublicKey) -> Result<bool, FlError> {
        match self.keys.get(client_id) {
            Some(existing) if *existing == key => return Ok(false),
            Some(_) => return Err(FlError::ClientKeyConflict(client_id.to_string())),
            None => {}
        }
        let pem = keys::public_key_to_pem(&key)?;
        if let Some(path) = &self.path {
            let mut next = self.pems.clone();
            next.insert(client_id.to_string(), pem.clone());
            write_atomic(path, &next)?;
        }
        self.pems.insert(client_id.to_string(), pem);
        self.keys.insert(client_id.to_string(), key);
        Ok(true)
    }

    /// Signing key on file for `client_id`.
    pub fn get(&self, client_id: &str) -> Option<&RsaPublicKey> {
        self.keys.get(client_id)
    }

    /// Whether `client_id` has a key on file.
    pub fn contains(&self, client_id: &str) -> bool {
        self.keys.contains_key(client_id)
    }

    /// Number of registered clients.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Whether no client is registered.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

fn write_atomic(path: &Path, pems: &BTreeMap<String, String>) -> Result<(), FlError> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir)?;
    let json = serde_json::to_vec_pretty(pems).map_err(|e| FlError::Config(e.to_string()))?;
    let mut file = tempfile::NamedTempFile::new_in(dir)?;
    file.write_all(&json)?;
    file.as_file().sync_all()?;
    file.persist(path).map_err(|e| FlError::Io(e.error))?;
    Ok(())
}
