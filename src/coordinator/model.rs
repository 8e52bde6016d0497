//! Conversion between the global model state and published artifacts.

use ndarray::{ArrayD, IxDyn};

use crate::codec::{GradientSet, Tensor};
use crate::error::FlError;

/// Turns model parameters into the bytes the registry stores, and back.
pub trait ModelFormat: Send + Sync {
    /// Serialize parameters into an artifact.
    fn export(&self, params: &[Tensor]) -> Result<Vec<u8>, FlError>;

    /// Restore parameters from an artifact produced by [`ModelFormat::export`].
    fn import(&self, blob: &[u8]) -> Result<GradientSet, FlError>;
}

/// Built-in little-endian tensor dump.
///
/// `b"SFLT" || u32 count || per tensor: u32 ndim || u32 dims[ndim] || f32 values`
#[derive(Clone, Copy, Debug, Default)]
pub struct RawTensorFormat;

const MAGIC: &[u8; 4] = b"SFLT";

impl ModelFormat for RawTensorFormat {
    fn export(&self, params: &[Tensor]) -> Result<Vec<u8>, FlError> {
        let mut out = Vec::with_capacity(8 + params.iter().map(|t| 8 + t.len() * 4).sum::<usize>());
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&len_u32(params.len())?.to_le_bytes());
        for tensor in params {
            out.extend_from_slice(&len_u32(tensor.ndim())?.to_le_bytes());
            for &dim in tensor.shape() {
                out.extend_from_slice(&len_u32(dim)?.to_le_bytes());
            }
            for &v in tensor.iter() {
                out.extend_from_slice(&v.to_le_bytes());
            }
        }
        Ok(out)
    }

    fn import(&self, blob: &[u8]) -> Result<GradientSet, FlError> {
        let mut reader = Reader { bytes: blob, pos: 0 };
        if reader.take(4)? != MAGIC {
            return Err(FlError::ModelFormat("bad magic".into()));
        }
        let count = reader.u32()? as usize;
        let mut params = Vec::new();
        for _ in 0..count {
            let ndim = reader.u32()? as usize;
            let shape = (0..ndim)
                .map(|_| reader.u32().map(|d| d as usize))
                .collect::<Result<Vec<_>, _>>()?;
            let len = shape
                .iter()
                .try_fold(1usize, |acc, &d| acc.checked_mul(d))
                .ok_or_else(|| FlError::ModelFormat("tensor size overflow".into()))?;
            let raw = reader.take(len.checked_mul(4).ok_or_else(|| {
                FlError::ModelFormat("tensor size overflow".into())
            })?)?;
            let values: Vec<f32> = raw
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect();
            let tensor = ArrayD::from_shape_vec(IxDyn(&shape), values)
                .map_err(|e| FlError::ModelFormat(e.to_string()))?;
            params.push(tensor);
        }
        if reader.pos != blob.len() {
            return Err(FlError::ModelFormat(format!(
                "{} trailing bytes",
                blob.len() - reader.pos
            )));
        }
        Ok(params)
    }
}

fn len_u32(n: usize) -> Result<u32, FlError> {
    u32::try_from(n).map_err(|_| FlError::ModelFormat(format!("{} does not fit in u32", n)))
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], FlError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.bytes.len())
            .ok_or_else(|| FlError::ModelFormat("truncated artifact".into()))?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u32(&mut self) -> Result<u32, FlError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }
}
