//! Lossy gradient compression: top-k sparsification + 16-bit quantization.
//!
//! All tensors of a [`GradientSet`] are flattened (tensor order, then
//! row-major element order) into one logical vector. The `k` entries with the
//! largest magnitude are kept, normalized by their maximum magnitude and
//! quantized to `i16`. Everything else is dropped.
//!
//! # Selection order
//!
//! Entries are ranked by descending absolute value. Ties are broken by the
//! lower flat index, so the same input always selects the same indices in
//! the same order.
//!
//! # Round trip
//!
//! [`decompress`] restores the selected entries within `scale / 32767` and
//! zero everywhere else. It is not an exact inverse.

mod wire;

use ndarray::{ArrayD, IxDyn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use wire::HEADER_LEN;

/// One tensor of gradients (or model parameters).
pub type Tensor = ArrayD<f32>;

/// Ordered gradient tensors, one per model parameter, in the globally agreed key order.
pub type GradientSet = Vec<Tensor>;

/// The only quantization width currently supported.
pub const QUANT_BITS: u8 = 16;

/// Maximum magnitude of a quantized value.
pub const QUANT_MAX: f32 = 32767.0;

/// Scales below this are replaced by `1.0` (all-zero gradients).
const MIN_SCALE: f32 = 1e-9;

/// Errors raised while compressing or decompressing gradients.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CodecError {
    /// Ratio outside `(0, 1]`
    #[error("Invalid top-k ratio: {0} (must be in (0, 1])")]
    InvalidRatio(f64),

    /// Quantization width other than 16
    #[error("Unsupported quantization width: {0} bits")]
    UnsupportedBits(u8),

    /// Nothing to compress
    #[error("Gradient set has no parameters")]
    Empty,

    /// NaN or infinity in the input
    #[error("Non-finite gradient value at flat index {0}")]
    NonFinite(usize),

    /// Flat vector does not fit the 32-bit index space
    #[error("Gradient set too large: {0} parameters")]
    TooLarge(u64),

    /// Payload shorter or longer than its header announces
    #[error("Malformed payload: expected {expected} bytes, got {actual}")]
    Truncated {
        /// Bytes required by the header
        expected: usize,
        /// Bytes received
        actual: usize,
    },

    /// Index outside the flat vector
    #[error("Index {index} out of range for {total} parameters")]
    IndexOutOfRange {
        /// Offending index
        index: i64,
        /// Length of the flat vector
        total: u64,
    },

    /// Repeated index in the payload
    #[error("Duplicate index {0} in payload")]
    DuplicateIndex(i32),

    /// Payload and metadata disagree
    #[error("Metadata mismatch: {0}")]
    MetaMismatch(String),
}

/// Compressed gradient payload.
#[derive(Clone, Debug, PartialEq)]
pub struct CompressedUpdate {
    /// Maximum magnitude among the selected values
    pub scale: f32,
    /// Quantized, normalized values (`value / scale * 32767`, truncated)
    pub quantized_values: Vec<i16>,
    /// Flat indices of the selected values
    pub indices: Vec<i32>,
}

/// Metadata needed to un-flatten a [`CompressedUpdate`].
///
/// `scale` mirrors the payload header for inspection; the header value is
/// the one used when decompressing.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CompressionMeta {
    /// Scale recorded at compression time
    pub scale: f32,
    /// Shape of every tensor, in order
    pub shapes: Vec<Vec<usize>>,
    /// Sum of the element counts of all shapes
    pub total_params: u64,
    /// Number of selected entries
    pub top_k: u32,
    /// Quantization width
    pub bits: u8,
}

impl CompressedUpdate {
    /// Number of selected entries.
    pub fn top_k(&self) -> u32 {
        self.indices.len() as u32
    }
}

impl CompressionMeta {
    /// Check that `shapes` and `total_params` agree and the payload fits.
    pub fn validate(&self) -> Result<(), CodecError> {
        if self.bits != QUANT_BITS {
            return Err(CodecError::UnsupportedBits(self.bits));
        }
        let counted = shapes_total(&self.shapes);
        if counted != Some(self.total_params) {
            return Err(CodecError::MetaMismatch(format!(
                "shapes describe {:?} parameters, total_params is {}",
                counted, self.total_params
            )));
        }
        if u64::from(self.top_k) > self.total_params {
            return Err(CodecError::MetaMismatch(format!(
                "top_k {} exceeds total_params {}",
                self.top_k, self.total_params
            )));
        }
        Ok(())
    }
}

/// Element count described by a list of shapes, `None` on overflow.
pub fn shapes_total(shapes: &[Vec<usize>]) -> Option<u64> {
    shapes.iter().try_fold(0u64, |acc, shape| {
        let n = shape
            .iter()
            .try_fold(1u64, |p, &d| p.checked_mul(d as u64))?;
        acc.checked_add(n)
    })
}

/// Compress a gradient set.
///
/// # Arguments
///
/// * `gradients` - Ordered gradient tensors
/// * `ratio` - Fraction of entries to keep, in `(0, 1]`; at least one entry is always kept
/// * `bits` - Quantization width (only 16 is supported)
pub fn compress(
    gradients: &[Tensor],
    ratio: f64,
    bits: u8,
) -> Result<(CompressedUpdate, CompressionMeta), CodecError> {
    if !(ratio > 0.0 && ratio <= 1.0) {
        return Err(CodecError::InvalidRatio(ratio));
    }
    if bits != QUANT_BITS {
        return Err(CodecError::UnsupportedBits(bits));
    }

    let flat: Vec<f32> = gradients.iter().flat_map(|g| g.iter().copied()).collect();
    if flat.is_empty() {
        return Err(CodecError::Empty);
    }
    if flat.len() > i32::MAX as usize {
        return Err(CodecError::TooLarge(flat.len() as u64));
    }
    if let Some(pos) = flat.iter().position(|v| !v.is_finite()) {
        return Err(CodecError::NonFinite(pos));
    }

    let k = ((flat.len() as f64 * ratio).floor() as usize).clamp(1, flat.len());
    let selected = select_top_k(&flat, k);

    let max_abs = selected
        .iter()
        .map(|&i| flat[i].abs())
        .fold(0.0f32, f32::max);
    let scale = if max_abs < MIN_SCALE { 1.0 } else { max_abs };

    let quantized_values = selected
        .iter()
        .map(|&i| (flat[i] / scale * QUANT_MAX) as i16)
        .collect();
    let indices = selected.iter().map(|&i| i as i32).collect();

    let meta = CompressionMeta {
        scale,
        shapes: gradients.iter().map(|g| g.shape().to_vec()).collect(),
        total_params: flat.len() as u64,
        top_k: k as u32,
        bits,
    };
    let update = CompressedUpdate {
        scale,
        quantized_values,
        indices,
    };
    Ok((update, meta))
}

/// Indices of the `k` largest-magnitude entries, largest first, ties by lower index.
fn select_top_k(flat: &[f32], k: usize) -> Vec<usize> {
    let rank = |a: &usize, b: &usize| {
        flat[*b]
            .abs()
            .total_cmp(&flat[*a].abs())
            .then_with(|| a.cmp(b))
    };
    let mut order: Vec<usize> = (0..flat.len()).collect();
    if k < order.len() {
        order.select_nth_unstable_by(k - 1, rank);
        order.truncate(k);
    }
    order.sort_unstable_by(rank);
    order
}

/// Reconstruct a gradient set from compressed bytes and their metadata.
///
/// Never panics on malformed input: every inconsistency is a [`CodecError`].
pub fn decompress(bytes: &[u8], meta: &CompressionMeta) -> Result<GradientSet, CodecError> {
    let update = CompressedUpdate::from_bytes(bytes)?;
    expand(&update, meta)
}

/// Scatter an already-parsed update into zero-filled tensors.
pub fn expand(update: &CompressedUpdate, meta: &CompressionMeta) -> Result<GradientSet, CodecError> {
    meta.validate()?;
    if update.top_k() != meta.top_k {
        return Err(CodecError::MetaMismatch(format!(
            "payload carries {} entries, metadata says {}",
            update.top_k(),
            meta.top_k
        )));
    }
    if !update.scale.is_finite() {
        return Err(CodecError::MetaMismatch("non-finite scale".to_string()));
    }

    let total = meta.total_params;
    let mut flat = vec![0.0f32; total as usize];
    let mut seen = vec![false; total as usize];
    for (&q, &idx) in update.quantized_values.iter().zip(&update.indices) {
        if idx < 0 || idx as u64 >= total {
            return Err(CodecError::IndexOutOfRange {
                index: i64::from(idx),
                total,
            });
        }
        let slot = idx as usize;
        if seen[slot] {
            return Err(CodecError::DuplicateIndex(idx));
        }
        seen[slot] = true;
        flat[slot] = f32::from(q) / QUANT_MAX * update.scale;
    }

    let mut out = Vec::with_capacity(meta.shapes.len());
    let mut offset = 0usize;
    for shape in &meta.shapes {
        let n: usize = shape.iter().product();
        let values = flat[offset..offset + n].to_vec();
        let tensor = ArrayD::from_shape_vec(IxDyn(shape), values)
            .map_err(|e| CodecError::MetaMismatch(e.to_string()))?;
        out.push(tensor);
        offset += n;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr1, arr2};

    fn sample() -> GradientSet {
        vec![
            arr2(&[[0.1f32, -0.9], [0.3, 0.05]]).into_dyn(),
            arr1(&[2.0f32, -0.2, 0.0]).into_dyn(),
        ]
    }

    #[test]
    fn test_selects_largest_magnitudes() {
        let (update, meta) = compress(&sample(), 0.3, 16).unwrap();
        // 7 params * 0.3 = 2.1 -> k = 2
        assert_eq!(meta.top_k, 2);
        assert_eq!(update.indices, vec![4, 1]);
        assert_eq!(update.scale, 2.0);
        assert_eq!(update.quantized_values[0], 32767);
    }

    #[test]
    fn test_roundtrip_exact_on_selected_zero_elsewhere() {
        let grads = sample();
        let (update, meta) = compress(&grads, 0.5, 16).unwrap();
        let restored = decompress(&update.to_bytes(), &meta).unwrap();

        assert_eq!(restored.len(), 2);
        assert_eq!(restored[0].shape(), &[2, 2]);
        assert_eq!(restored[1].shape(), &[3]);

        let original: Vec<f32> = grads.iter().flat_map(|g| g.iter().copied()).collect();
        let got: Vec<f32> = restored.iter().flat_map(|g| g.iter().copied()).collect();
        let bound = update.scale / QUANT_MAX;
        for (i, (&o, &g)) in original.iter().zip(&got).enumerate() {
            if update.indices.contains(&(i as i32)) {
                assert!((o - g).abs() <= bound, "index {}: {} vs {}", i, o, g);
            } else {
                assert_eq!(g, 0.0, "index {} should be zero", i);
            }
        }
    }

    #[test]
    fn test_all_zero_gradients_use_unit_scale() {
        let grads = vec![ArrayD::<f32>::zeros(IxDyn(&[4]))];
        let (update, meta) = compress(&grads, 0.5, 16).unwrap();
        assert_eq!(update.scale, 1.0);
        assert_eq!(meta.scale, 1.0);
        assert!(update.quantized_values.iter().all(|&q| q == 0));
    }

    #[test]
    fn test_keeps_at_least_one() {
        let grads = vec![arr1(&[0.5f32, 0.25]).into_dyn()];
        let (update, _) = compress(&grads, 0.01, 16).unwrap();
        assert_eq!(update.indices, vec![0]);
    }

    #[test]
    fn test_ties_break_by_lower_index() {
        let grads = vec![arr1(&[1.0f32, -1.0, 1.0, 0.5]).into_dyn()];
        let (update, _) = compress(&grads, 0.5, 16).unwrap();
        assert_eq!(update.indices, vec![0, 1]);
    }

    #[test]
    fn test_rejects_bad_parameters() {
        assert_eq!(
            compress(&sample(), 0.0, 16).unwrap_err(),
            CodecError::InvalidRatio(0.0)
        );
        assert_eq!(
            compress(&sample(), 1.5, 16).unwrap_err(),
            CodecError::InvalidRatio(1.5)
        );
        assert_eq!(
            compress(&sample(), 0.5, 8).unwrap_err(),
            CodecError::UnsupportedBits(8)
        );
        assert_eq!(compress(&[], 0.5, 16).unwrap_err(), CodecError::Empty);
    }

    #[test]
    fn test_rejects_non_finite() {
        let grads = vec![arr1(&[1.0f32, f32::NAN]).into_dyn()];
        assert_eq!(
            compress(&grads, 1.0, 16).unwrap_err(),
            CodecError::NonFinite(1)
        );
    }

    #[test]
    fn test_decompress_rejects_out_of_range_index() {
        let (mut update, meta) = compress(&sample(), 0.3, 16).unwrap();
        update.indices[0] = 99;
        let err = decompress(&update.to_bytes(), &meta).unwrap_err();
        assert!(matches!(err, CodecError::IndexOutOfRange { index: 99, .. }));
    }

    #[test]
    fn test_decompress_rejects_inconsistent_meta() {
        let (update, mut meta) = compress(&sample(), 0.3, 16).unwrap();
        meta.total_params += 1;
        assert!(matches!(
            decompress(&update.to_bytes(), &meta),
            Err(CodecError::MetaMismatch(_))
        ));
    }

    #[test]
    fn test_decompress_rejects_duplicate_index() {
        let (mut update, meta) = compress(&sample(), 0.3, 16).unwrap();
        update.indices[1] = update.indices[0];
        assert!(matches!(
            decompress(&update.to_bytes(), &meta),
            Err(CodecError::DuplicateIndex(_))
        ));
    }

    #[test]
    fn test_meta_serde_shape() {
        let (_, meta) = compress(&sample(), 0.3, 16).unwrap();
        let json = serde_json::to_value(&meta).unwrap();
        assert_eq!(json["shapes"], serde_json::json!([[2, 2], [3]]));
        assert_eq!(json["total_params"], 7);
        let back: CompressionMeta = serde_json::from_value(json).unwrap();
        assert_eq!(back, meta);
    }
}
