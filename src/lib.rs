//! # secure-fl: Secure Aggregation for Federated Learning
//!
//! Clients submit compressed, encrypted, signed gradient updates; a
//! coordinator verifies, decrypts and averages them, and publishes each new
//! global model as an immutable, signed, versioned package.
//!
//! ## Building blocks
//!
//! - [`codec`] - Top-k sparsification with 16-bit quantization
//! - [`crypto`] - AES-256-GCM payloads keyed with RSA-OAEP, PKCS#1 v1.5 signatures
//! - [`protocol`] - Versioned wire records and canonical JSON for signing
//! - [`registry`] - Append-only package store with rollback by republication
//! - [`aggregators`] - FedAvg and the gradient-descent step
//!
//! ## Round orchestration
//!
//! - [`Coordinator`] - Round state machine: admission, cohort gating, publish, rollback
//! - [`FederatedClient`] - One client's round with bounded, cancellable retries
//! - `server` (feature `http`) - HTTP routes over a shared coordinator
//!
//! ```no_run
//! use secure_fl::coordinator::{Coordinator, CoordinatorConfig, RegistrationPolicy};
//!
//! let config = CoordinatorConfig::new(vec![vec![784, 10], vec![10]], RegistrationPolicy::RequireRegistered);
//! let coordinator = Coordinator::open(config)?;
//! println!("round {}", coordinator.current_round());
//! # Ok::<(), secure_fl::FlError>(())
//! ```

#![warn(missing_docs)]

pub mod aggregators;
pub mod audit;
pub mod client;
pub mod codec;
pub mod coordinator;
pub mod crypto;
pub mod error;
pub mod protocol;
pub mod registry;
#[cfg(feature = "http")]
pub mod server;

// Re-exports
pub use aggregators::{apply_step, fedavg};
pub use audit::{AuditEntry, AuditLog};
pub use client::{CancelToken, ClientConfig, FederatedClient, GradientSource, Transport};
pub use codec::{compress, decompress, CompressedUpdate, CompressionMeta, GradientSet, Tensor};
pub use coordinator::{AggregationOutcome, Coordinator, CoordinatorConfig, RegistrationPolicy, SubmissionOutcome};
pub use error::FlError;
pub use registry::{ModelPackage, Registry};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
