//! Coordinator configuration.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::codec::shapes_total;
use crate::error::FlError;

/// How updates from clients without a registered key are treated.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationPolicy {
    /// Accept unregistered clients without signature verification
    Open,
    /// Reject updates from clients with no key on file
    #[default]
    RequireRegistered,
}

/// Settings for a [`Coordinator`](super::Coordinator).
///
/// In TOML every field except `registration` and `model_shapes` has a default:
///
/// ```toml
/// registration = "require_registered"
/// model_shapes = [[4, 3], [3]]
/// min_clients = 2
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CoordinatorConfig {
    /// Contributions needed before a round aggregates
    #[serde(default = "default_min_clients")]
    pub min_clients: u32,
    /// Grace period advertised to clients, in seconds
    #[serde(default = "default_grace_seconds")]
    pub grace_seconds: u64,
    /// Step size applied to the averaged gradient
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f32,
    /// Treatment of clients with no registered key
    pub registration: RegistrationPolicy,
    /// Shapes of the global model's tensors, in parameter order
    pub model_shapes: Vec<Vec<usize>>,
    /// Model artifact to bootstrap version 0 from; zeros when absent
    #[serde(default)]
    pub initial_model: Option<PathBuf>,
    /// Registry root
    #[serde(default = "default_registry_dir")]
    pub registry_dir: PathBuf,
    /// Directory holding the coordinator's key files
    #[serde(default = "default_key_dir")]
    pub key_dir: PathBuf,
}

fn default_min_clients() -> u32 {
    2
}

fn default_grace_seconds() -> u64 {
    300
}

fn default_learning_rate() -> f32 {
    0.1
}

fn default_registry_dir() -> PathBuf {
    PathBuf::from("registry")
}

fn default_key_dir() -> PathBuf {
    PathBuf::from("keys")
}

impl CoordinatorConfig {
    /// Defaults for everything but the two fields that must be chosen.
    pub fn new(model_shapes: Vec<Vec<usize>>, registration: RegistrationPolicy) -> Self {
        Self {
            min_clients: default_min_clients(),
            grace_seconds: default_grace_seconds(),
            learning_rate: default_learning_rate(),
            registration,
            model_shapes,
            initial_model: None,
            registry_dir: default_registry_dir(),
            key_dir: default_key_dir(),
        }
    }

    /// Parse TOML text and validate it.
    pub fn from_toml_str(text: &str) -> Result<Self, FlError> {
        let config: Self = toml::from_str(text).map_err(|e| FlError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and validate a TOML file.
    pub fn from_toml_file(path: &Path) -> Result<Self, FlError> {
        let text = fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Reject values the coordinator cannot run with.
    pub fn validate(&self) -> Result<(), FlError> {
        if self.min_clients == 0 {
            return Err(FlError::Config("min_clients must be at least 1".into()));
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(FlError::Config(format!(
                "learning_rate must be positive, got {}",
                self.learning_rate
            )));
        }
        match shapes_total(&self.model_shapes) {
            Some(n) if n > 0 => Ok(()),
            Some(_) => Err(FlError::Config("model_shapes describe no parameters".into())),
            None => Err(FlError::Config("model_shapes overflow".into())),
        }
    }
}
