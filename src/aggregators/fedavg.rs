//! FedAvg aggregation
//!
//! Federated averaging as described by McMahan et al. (2017): the
//! element-wise mean of per-client gradients, applied to the global model as
//! one gradient-descent step. No Byzantine tolerance; a single malicious
//! client can move the aggregate arbitrarily.

use ndarray::{ArrayD, Zip};
use rayon::prelude::*;

use crate::codec::{GradientSet, Tensor};
use crate::error::FlError;

/// Element-wise mean across client gradient sets.
///
/// Tensors are averaged in parallel. Every update must have the same number
/// of tensors with the same shapes, in the same order.
///
/// # Arguments
///
/// * `updates` - One `GradientSet` per client
/// * `weights` - Optional client weights (e.g., proportional to dataset size)
pub fn fedavg(updates: &[GradientSet], weights: Option<&[f32]>) -> Result<GradientSet, FlError> {
    let first = updates.first().ok_or(FlError::EmptyUpdates)?;
    check_shapes(first, &updates[1..])?;

    let (weights, total): (Vec<f32>, f32) = match weights {
        Some(w) => {
            if w.len() != updates.len() {
                return Err(FlError::DimensionMismatch);
            }
            let total: f32 = w.iter().sum();
            if total <= 0.0 || !total.is_finite() {
                return Err(FlError::EmptyUpdates);
            }
            (w.to_vec(), total)
        }
        None => (vec![1.0; updates.len()], updates.len() as f32),
    };

    Ok((0..first.len())
        .into_par_iter()
        .map(|t| {
            let mut acc: Tensor = ArrayD::zeros(first[t].raw_dim());
            for (update, &w) in updates.iter().zip(weights.iter()) {
                acc.scaled_add(w, &update[t]);
            }
            acc / total
        })
        .collect())
}

/// In place: `param -= lr * grad` for every tensor.
pub fn apply_step(params: &mut GradientSet, grads: &[Tensor], lr: f32) -> Result<(), FlError> {
    if params.len() != grads.len() {
        return Err(FlError::DimensionMismatch);
    }
    for (param, grad) in params.iter_mut().zip(grads) {
        if param.shape() != grad.shape() {
            return Err(FlError::DimensionMismatch);
        }
        Zip::from(param).and(grad).for_each(|p, &g| *p -= lr * g);
    }
    Ok(())
}

fn check_shapes(reference: &[Tensor], rest: &[GradientSet]) -> Result<(), FlError> {
    for update in rest {
        if update.len() != reference.len() {
            return Err(FlError::DimensionMismatch);
        }
        for (a, b) in reference.iter().zip(update) {
            if a.shape() != b.shape() {
                return Err(FlError::DimensionMismatch);
            }
        }
    }
    Ok(())
}
