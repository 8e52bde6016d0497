//! Byte layout of a compressed update:
//! `f32_le(scale) || u32_le(k) || i16_le[k] || i32_le[k]`.

use super::{CodecError, CompressedUpdate};

/// Size of the `scale || k` header.
pub const HEADER_LEN: usize = 8;

impl CompressedUpdate {
    /// Encode to the wire layout.
    pub fn to_bytes(&self) -> Vec<u8> {
        let k = self.indices.len();
        let mut out = Vec::with_capacity(HEADER_LEN + k * 6);
        out.extend_from_slice(&self.scale.to_le_bytes());
        out.extend_from_slice(&(k as u32).to_le_bytes());
        for q in &self.quantized_values {
            out.extend_from_slice(&q.to_le_bytes());
        }
        for idx in &self.indices {
            out.extend_from_slice(&idx.to_le_bytes());
        }
        out
    }

    /// Decode from the wire layout. The length must match the header exactly.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        if bytes.len() < HEADER_LEN {
            return Err(CodecError::Truncated {
                expected: HEADER_LEN,
                actual: bytes.len(),
            });
        }
        let scale = f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let k = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) as usize;

        let expected = k
            .checked_mul(6)
            .and_then(|body| body.checked_add(HEADER_LEN))
            .ok_or(CodecError::Truncated {
                expected: usize::MAX,
                actual: bytes.len(),
            })?;
        if bytes.len() != expected {
            return Err(CodecError::Truncated {
                expected,
                actual: bytes.len(),
            });
        }

        let body = &bytes[HEADER_LEN..];
        let (values, indices) = body.split_at(k * 2);
        let quantized_values = values
            .chunks_exact(2)
            .map(|c| i16::from_le_bytes([c[0], c[1]]))
            .collect();
        let indices = indices
            .chunks_exact(4)
            .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();

        Ok(Self {
            scale,
            quantized_values,
            indices,
        })
    }
}
