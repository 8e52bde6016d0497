//! Coordinator round state machine.
//!
//! A [`Coordinator`] accepts encrypted, signed updates for the current round,
//! aggregates them with FedAvg once the cohort is large enough, publishes the
//! resulting model as the next registry version and opens the next round.
//!
//! ```text
//! Accepting(r) --aggregate, cohort ready--> Aggregating(r) --publish--> Accepting(r + 1)
//!      ^                                          |
//!      +------------- publish failed -------------+
//! ```
//!
//! Locking:
//!
//! - `rounds` guards admission. Round check, duplicate check and append
//!   happen under one lock acquisition.
//! - `model` serializes aggregation and rollback against each other. It is
//!   held across the slow publish so `rounds` stays free for submissions,
//!   which see [`FlError::RoundClosed`] while the round is sealed.
//! - Version numbering is atomic inside [`Registry`].
//!
//! Admission checks for duplicates before verifying the signature, so a
//! resubmission costs no RSA work.

pub mod clients;
pub mod config;
pub mod model;
pub mod round;

pub use clients::ClientStore;
pub use config::{CoordinatorConfig, RegistrationPolicy};
pub use model::{ModelFormat, RawTensorFormat};
pub use round::{Admission, Phase, RoundTable, Seal};

use std::fs;
use std::sync::{Mutex, PoisonError, RwLock};

use chrono::Utc;
use ndarray::ArrayD;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::aggregators::{apply_step, fedavg};
use crate::audit::{AuditEntry, AuditLog};
use crate::codec::{self, CodecError, GradientSet};
use crate::crypto::{self, keys, EncryptedPayload, KeyMaterial, RsaPublicKey};
use crate::error::FlError;
use crate::protocol::messages::validate_client_id;
use crate::protocol::{ConfigResponse, ModelPackageResponse, SchemaVersion, UpdateAck, UpdateRequest};
use crate::registry::{ModelPackage, Registry};

const AUDIT_FILE: &str = "audit.jsonl";
const CLIENTS_FILE: &str = "clients.json";

/// What happened to an accepted submission.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubmissionOutcome {
    /// Recorded for the round
    Accepted,
    /// Already recorded earlier; nothing changed
    Duplicate,
}

impl SubmissionOutcome {
    /// Wire acknowledgement.
    pub fn to_ack(self) -> UpdateAck {
        UpdateAck {
            status: "accepted".to_string(),
            duplicate: self == SubmissionOutcome::Duplicate,
        }
    }
}

/// Result of an aggregation trigger.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AggregationOutcome {
    /// Not enough contributions yet; nothing changed
    CohortNotReady {
        /// Current round
        round: u64,
        /// Contributions so far
        have: usize,
        /// Contributions required
        need: usize,
    },
    /// A new version was published and the round advanced
    Published {
        /// New registry version
        version: u64,
        /// Round that was aggregated
        round: u64,
        /// Contributions averaged
        n_clients: usize,
    },
}

/// Owned coordinator state, shared by every request handler.
pub struct Coordinator {
    config: CoordinatorConfig,
    keys: KeyMaterial,
    encryption_pem: String,
    registry: Registry,
    format: Box<dyn ModelFormat>,
    clients: RwLock<ClientStore>,
    rounds: Mutex<RoundTable>,
    model: Mutex<GradientSet>,
    audit: Mutex<AuditLog>,
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl Coordinator {
    /// Open a coordinator from its configuration: key files and registered
    /// clients under `key_dir`, the registry and audit log under
    /// `registry_dir`, [`RawTensorFormat`] artifacts.
    pub fn open(config: CoordinatorConfig) -> Result<Self, FlError> {
        let keys = KeyMaterial::load_or_generate(&config.key_dir)?;
        let clients = ClientStore::open(config.key_dir.join(CLIENTS_FILE))?;
        let registry = Registry::open(&config.registry_dir)?;
        let audit = AuditLog::open(config.registry_dir.join(AUDIT_FILE))?;
        Self::new(config, keys, clients, registry, Box::new(RawTensorFormat), audit)
    }

    /// Assemble a coordinator from its parts.
    ///
    /// An empty registry is bootstrapped with the initial model as version 0.
    /// Otherwise the global model is restored from the head package and the
    /// round counter resumes after the last aggregated round.
    pub fn new(
        config: CoordinatorConfig,
        keys: KeyMaterial,
        clients: ClientStore,
        registry: Registry,
        format: Box<dyn ModelFormat>,
        mut audit: AuditLog,
    ) -> Result<Self, FlError> {
        config.validate()?;
        let encryption_pem = keys.decryption.public_pem()?;

        let (model, round) = match registry.load_head()? {
            None => {
                let model = initial_model(&config, format.as_ref())?;
                let blob = format.export(&model)?;
                let package = registry.publish(&blob, 0, keys.signing.private_key())?;
                record(&mut audit, &package, 0);
                info!(version = package.metadata.version, "bootstrapped initial model");
                (model, 0)
            }
            Some(head) => {
                if !head.verify(keys.signing.public_key())? {
                    return Err(FlError::Config(format!(
                        "head version {} does not verify with the signing key",
                        head.metadata.version
                    )));
                }
                let model = format.import(&head.blob)?;
                check_model_shapes(&model, &config.model_shapes)?;
                let round = resume_round(&registry)?;
                info!(version = head.metadata.version, round, "restored from registry");
                (model, round)
            }
        };

        Ok(Self {
            config,
            keys,
            encryption_pem,
            registry,
            format,
            clients: RwLock::new(clients),
            rounds: Mutex::new(RoundTable::new(round)),
            model: Mutex::new(model),
            audit: Mutex::new(audit),
        })
    }

    /// Announcement clients fetch before submitting.
    pub fn config_response(&self) -> ConfigResponse {
        ConfigResponse {
            current_round: self.current_round(),
            model_version: self.head_version(),
            server_public_key: self.encryption_pem.clone(),
            min_clients: self.config.min_clients,
            grace_seconds: self.config.grace_seconds,
            schema_version: SchemaVersion::CURRENT,
        }
    }

    /// Bind `client_id` to a signing key. Returns `false` if it was already bound to this key.
    pub fn register_client(&self, client_id: &str, public_key_pem: &str) -> Result<bool, FlError> {
        validate_client_id(client_id)?;
        let key = keys::public_key_from_pem(public_key_pem)?;
        let mut clients = self.clients.write().unwrap_or_else(PoisonError::into_inner);
        match clients.register(client_id, key) {
            Ok(true) => {
                info!(client_id, "client registered");
                Ok(true)
            }
            Ok(false) => Ok(false),
            Err(e @ FlError::ClientKeyConflict(_)) => {
                warn!(client_id, "registration with a different key refused");
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Whether `client_id` has a key on file.
    pub fn is_registered(&self, client_id: &str) -> bool {
        self.clients
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(client_id)
    }

    /// Decode a JSON update request and submit it.
    pub fn submit_json(&self, body: &[u8]) -> Result<UpdateAck, FlError> {
        let request = UpdateRequest::from_json(body)?;
        Ok(self.submit(&request)?.to_ack())
    }

    /// Verify, decrypt, decompress and record one update.
    pub fn submit(&self, request: &UpdateRequest) -> Result<SubmissionOutcome, FlError> {
        request.validate()?;
        let client_id = request.client_id.as_str();
        let round = request.round;

        if self.lock_rounds().check(client_id, round)? == Admission::Duplicate {
            debug!(client_id, round, "duplicate submission");
            return Ok(SubmissionOutcome::Duplicate);
        }

        self.authenticate(request)?;

        let payload = EncryptedPayload::from_bytes(&request.payload_bytes()?)?;
        let plaintext = zeroize::Zeroizing::new(crypto::decrypt(&payload, self.keys.decryption.private_key())?);
        if request.compression_meta.shapes != self.config.model_shapes {
            return Err(CodecError::MetaMismatch("shapes differ from the global model".into()).into());
        }
        let gradients = codec::decompress(&plaintext, &request.compression_meta)?;

        let admission = self.lock_rounds().insert(client_id, round, gradients)?;
        match admission {
            Admission::Fresh => {
                info!(client_id, round, "update accepted");
                Ok(SubmissionOutcome::Accepted)
            }
            Admission::Duplicate => {
                debug!(client_id, round, "duplicate submission");
                Ok(SubmissionOutcome::Duplicate)
            }
        }
    }

    fn authenticate(&self, request: &UpdateRequest) -> Result<(), FlError> {
        let key = self
            .clients
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&request.client_id)
            .cloned();
        match key {
            Some(key) => {
                let signature = request.signature_bytes()?;
                let signed = request.signable().to_bytes()?;
                if crypto::verify(&signed, &signature, &key) {
                    Ok(())
                } else {
                    warn!(client_id = %request.client_id, round = request.round, "invalid signature");
                    Err(FlError::InvalidSignature {
                        client_id: request.client_id.clone(),
                    })
                }
            }
            None => match self.config.registration {
                RegistrationPolicy::RequireRegistered => {
                    Err(FlError::UnregisteredClient(request.client_id.clone()))
                }
                RegistrationPolicy::Open => {
                    warn!(client_id = %request.client_id, "accepting unverified update from unregistered client");
                    Ok(())
                }
            },
        }
    }

    /// Aggregate the current round if its cohort is complete.
    ///
    /// With fewer than `min_clients` contributions this is a no-op returning
    /// [`AggregationOutcome::CohortNotReady`]. If publishing fails the
    /// contributions are restored and the round stays open.
    pub fn aggregate(&self) -> Result<AggregationOutcome, FlError> {
        let mut model = self.model.lock().unwrap_or_else(PoisonError::into_inner);
        let need = self.config.min_clients as usize;

        let (round, client_ids, updates) = match self.lock_rounds().seal(need) {
            Seal::NotReady { round, have } => {
                debug!(round, have, need, "cohort not ready");
                return Ok(AggregationOutcome::CohortNotReady { round, have, need });
            }
            Seal::Sealed {
                round,
                client_ids,
                updates,
            } => (round, client_ids, updates),
        };

        match self.publish_round(&model, round, &updates) {
            Ok((next_model, package)) => {
                *model = next_model;
                self.lock_rounds().finish();
                let n_clients = client_ids.len();
                self.record(&package, n_clients);
                let version = package.metadata.version;
                info!(round, version, n_clients, "round aggregated");
                Ok(AggregationOutcome::Published {
                    version,
                    round,
                    n_clients,
                })
            }
            Err(e) => {
                self.lock_rounds().abort(client_ids, updates);
                error!(round, error = %e, "aggregation failed, round reopened");
                Err(e)
            }
        }
    }

    fn publish_round(
        &self,
        model: &GradientSet,
        round: u64,
        updates: &[GradientSet],
    ) -> Result<(GradientSet, ModelPackage), FlError> {
        let mean = fedavg(updates, None)?;
        let mut next = model.clone();
        apply_step(&mut next, &mean, self.config.learning_rate)?;
        let blob = self.format.export(&next)?;
        let package = self
            .registry
            .publish(&blob, round, self.keys.signing.private_key())?;
        Ok((next, package))
    }

    /// Republish `target`'s model as the new head and restore it as the global model.
    pub fn rollback(&self, target: u64) -> Result<ModelPackage, FlError> {
        let mut model = self.model.lock().unwrap_or_else(PoisonError::into_inner);
        let restored = self.format.import(&self.registry.load(target)?.blob)?;
        check_model_shapes(&restored, &self.config.model_shapes)?;
        let package = self
            .registry
            .rollback(target, self.keys.signing.private_key())?;
        *model = restored;
        self.record(&package, 0);
        Ok(package)
    }

    /// Head package, or a specific version.
    pub fn load_package(&self, version: Option<u64>) -> Result<ModelPackage, FlError> {
        match version {
            Some(v) => self.registry.load(v),
            None => self.registry.load_head()?.ok_or(FlError::NotFound(0)),
        }
    }

    /// Check an envelope against this coordinator's package-signing key.
    pub fn verify_package(&self, package: &ModelPackageResponse) -> Result<bool, FlError> {
        Ok(package.verify(self.keys.signing.public_key())?)
    }

    /// Round currently accepting (or being aggregated).
    pub fn current_round(&self) -> u64 {
        self.lock_rounds().current()
    }

    /// Contributions recorded for the current round.
    pub fn pending(&self) -> usize {
        self.lock_rounds().len()
    }

    /// Head registry version.
    pub fn head_version(&self) -> u64 {
        self.registry.head().unwrap_or(0)
    }

    /// Key clients encrypt updates for.
    pub fn encryption_key(&self) -> &RsaPublicKey {
        self.keys.decryption.public_key()
    }

    /// Key packages are verified with.
    pub fn signing_key(&self) -> &RsaPublicKey {
        self.keys.signing.public_key()
    }

    /// Active configuration.
    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Underlying registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Snapshot of the global model.
    pub fn global_model(&self) -> GradientSet {
        self.model.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Snapshot of the audit log.
    pub fn audit_entries(&self) -> Vec<AuditEntry> {
        self.audit
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries()
            .to_vec()
    }

    fn lock_rounds(&self) -> std::sync::MutexGuard<'_, RoundTable> {
        self.rounds.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, package: &ModelPackage, n_clients: usize) {
        let mut audit = self.audit.lock().unwrap_or_else(PoisonError::into_inner);
        record(&mut audit, package, n_clients);
    }
}

// The package is already published; a failed audit write must not undo the round.
fn record(audit: &mut AuditLog, package: &ModelPackage, n_clients: usize) {
    let entry = AuditEntry {
        version: package.metadata.version,
        base_round: package.metadata.base_round,
        n_clients,
        rollback_of: package.metadata.rollback_of,
        recorded_at: Utc::now(),
    };
    if let Err(e) = audit.push(entry) {
        error!(version = package.metadata.version, error = %e, "audit write failed");
    }
}

fn initial_model(config: &CoordinatorConfig, format: &dyn ModelFormat) -> Result<GradientSet, FlError> {
    match &config.initial_model {
        Some(path) => {
            let model = format.import(&fs::read(path)?)?;
            check_model_shapes(&model, &config.model_shapes)?;
            Ok(model)
        }
        None => Ok(config
            .model_shapes
            .iter()
            .map(|shape| ArrayD::zeros(shape.as_slice()))
            .collect()),
    }
}

fn check_model_shapes(model: &GradientSet, shapes: &[Vec<usize>]) -> Result<(), FlError> {
    let matches = model.len() == shapes.len()
        && model.iter().zip(shapes).all(|(t, s)| t.shape() == s.as_slice());
    if matches {
        Ok(())
    } else {
        Err(FlError::DimensionMismatch)
    }
}

/// First round after the newest aggregation package (rollbacks and the bootstrap excluded).
fn resume_round(registry: &Registry) -> Result<u64, FlError> {
    let mut next = 0;
    for version in registry.versions()? {
        let metadata = registry.load_metadata(version)?;
        if version > 0 && metadata.rollback_of.is_none() {
            next = next.max(metadata.base_round + 1);
        }
    }
    Ok(next)
}
