//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::path::Path;
use std::sync::{Arc, OnceLock};

use ndarray::{Array1, Array2};
use secure_fl::audit::AuditLog;
use secure_fl::coordinator::{
    ClientStore, Coordinator, CoordinatorConfig, RawTensorFormat, RegistrationPolicy,
};
use secure_fl::crypto::{KeyMaterial, KeyPair};
use secure_fl::{GradientSet, Registry};

static PAIRS: OnceLock<Vec<KeyPair>> = OnceLock::new();

/// One of six pairs generated once per test binary.
pub fn pair(n: usize) -> &'static KeyPair {
    let pairs = PAIRS.get_or_init(|| {
        (0..6)
            .map(|_| KeyPair::generate().expect("key generation"))
            .collect()
    });
    &pairs[n % pairs.len()]
}

/// Coordinator keys: pair 0 decrypts, pair 1 signs packages.
pub fn key_material() -> KeyMaterial {
    KeyMaterial {
        decryption: pair(0).clone(),
        signing: pair(1).clone(),
    }
}

/// Signing pair for client `i`.
pub fn client_pair(i: usize) -> &'static KeyPair {
    pair(2 + i % 4)
}

pub fn model_shapes() -> Vec<Vec<usize>> {
    vec![vec![3, 2], vec![2]]
}

pub fn coordinator(dir: &Path, min_clients: u32, policy: RegistrationPolicy) -> Arc<Coordinator> {
    let mut config = CoordinatorConfig::new(model_shapes(), policy);
    config.min_clients = min_clients;
    Arc::new(
        Coordinator::new(
            config,
            key_material(),
            ClientStore::new(),
            Registry::open(dir).unwrap(),
            Box::new(RawTensorFormat),
            AuditLog::new(),
        )
        .unwrap(),
    )
}

/// Deterministic gradients matching [`model_shapes`].
pub fn gradients(seed: usize) -> GradientSet {
    let w = Array2::from_shape_fn((3, 2), |(r, c)| ((seed * 6 + r * 2 + c) as f32).sin());
    let b = Array1::from_vec(vec![seed as f32 * 0.5, -1.0]);
    vec![w.into_dyn(), b.into_dyn()]
}
