//! Dense row-major tensors and the shape-level operations the merge step needs
//!
//! Merging tensor-parallel shards never does arithmetic: every operation in
//! this module is a pure rearrangement of elements (concatenate, split,
//! narrow), so a split followed by a concatenation along the same axis is
//! bit-exact.

use crate::errors::{LoaderError, Result};
use serde::{Deserialize, Serialize};

/// Multi-dimensional array of f32 values in row-major order
///
/// Decoding goes through [`Tensor::new`], so a tensor read from a shard file
/// or a stream frame always holds exactly `product(shape)` elements.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawTensor")]
pub struct Tensor {
    /// Flattened tensor data
    pub data: Vec<f32>,
    /// Shape of the tensor (e.g., [4096] for a norm, [12288, 4096] for qkv)
    pub shape: Vec<usize>,
}

#[derive(Deserialize)]
struct RawTensor {
    data: Vec<f32>,
    shape: Vec<usize>,
}

impl TryFrom<RawTensor> for Tensor {
    type Error = LoaderError;

    fn try_from(raw: RawTensor) -> Result<Self> {
        Tensor::new(raw.data, raw.shape)
    }
}

impl AsRef<Tensor> for Tensor {
    fn as_ref(&self) -> &Tensor {
        self
    }
}

impl Tensor {
    /// Create a new tensor with the given data and shape
    pub fn new(data: Vec<f32>, shape: Vec<usize>) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if data.len() != expected {
            return Err(LoaderError::Shape(format!(
                "Data length {} doesn't match shape {:?} (product {})",
                data.len(),
                shape,
                expected
            )));
        }
        Ok(Self { data, shape })
    }

    /// Create a tensor filled with zeros
    pub fn zeros(shape: Vec<usize>) -> Self {
        let len: usize = shape.iter().product();
        Self {
            data: vec![0.0; len],
            shape,
        }
    }

    /// Get the total number of elements in the tensor
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Check if the tensor is empty
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Number of dimensions
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Resident size of the element buffer in bytes
    pub fn size_bytes(&self) -> usize {
        self.data.len() * std::mem::size_of::<f32>()
    }

    /// Size of dimension `dim`
    pub fn dim(&self, dim: usize) -> Result<usize> {
        self.shape.get(dim).copied().ok_or_else(|| {
            LoaderError::Shape(format!(
                "Dimension {} out of range for tensor of shape {:?}",
                dim, self.shape
            ))
        })
    }

    /// Fails when the element buffer disagrees with the shape
    fn check_len(&self) -> Result<()> {
        let expected: usize = self.shape.iter().product();
        if self.data.len() != expected {
            return Err(LoaderError::Shape(format!(
                "Tensor of shape {:?} holds {} elements, expected {}",
                self.shape,
                self.data.len(),
                expected
            )));
        }
        Ok(())
    }

    /// Element count before and after `dim` in row-major order
    fn outer_inner(&self, dim: usize) -> (usize, usize) {
        let outer = self.shape[..dim].iter().product();
        let inner = self.shape[dim + 1..].iter().product();
        (outer, inner)
    }

    /// Concatenate tensors along `dim`
    ///
    /// All tensors must have the same rank and agree on every dimension
    /// except `dim`.
    pub fn cat<T: AsRef<Tensor>>(tensors: &[T], dim: usize) -> Result<Tensor> {
        let first = tensors
            .first()
            .ok_or_else(|| LoaderError::Shape("Cannot concatenate zero tensors".to_string()))?
            .as_ref();
        first.dim(dim)?;

        let mut cat_size = 0;
        for t in tensors.iter().map(AsRef::<Tensor>::as_ref) {
            t.check_len()?;
            let compatible = t.ndim() == first.ndim()
                && t
                    .shape
                    .iter()
                    .zip(&first.shape)
                    .enumerate()
                    .all(|(d, (a, b))| d == dim || a == b);
            if !compatible {
                return Err(LoaderError::Shape(format!(
                    "Cannot concatenate shapes {:?} and {:?} along dim {}",
                    first.shape, t.shape, dim
                )));
            }
            cat_size += t.shape[dim];
        }

        let (outer, inner) = first.outer_inner(dim);
        let mut data = Vec::with_capacity(outer * cat_size * inner);
        for o in 0..outer {
            for t in tensors.iter().map(AsRef::<Tensor>::as_ref) {
                let block = t.shape[dim] * inner;
                data.extend_from_slice(&t.data[o * block..(o + 1) * block]);
            }
        }

        let mut shape = first.shape.clone();
        shape[dim] = cat_size;
        Tensor::new(data, shape)
    }

    /// Extract `len` entries of dimension `dim` starting at `start`
    pub fn narrow(&self, dim: usize, start: usize, len: usize) -> Result<Tensor> {
        self.check_len()?;
        let size = self.dim(dim)?;
        if start + len > size {
            return Err(LoaderError::Shape(format!(
                "Invalid slice {}..{} of dim {} (size {})",
                start,
                start + len,
                dim,
                size
            )));
        }

        let (outer, inner) = self.outer_inner(dim);
        let mut data = Vec::with_capacity(outer * len * inner);
        for o in 0..outer {
            let base = o * size * inner + start * inner;
            data.extend_from_slice(&self.data[base..base + len * inner]);
        }

        let mut shape = self.shape.clone();
        shape[dim] = len;
        Tensor::new(data, shape)
    }

    /// Split into `n` equal chunks along `dim`
    ///
    /// Unlike an all-reduce chunking, the dimension must divide evenly:
    /// shard boundaries of a checkpoint are always exact.
    pub fn chunk(&self, n: usize, dim: usize) -> Result<Vec<Tensor>> {
        let size = self.dim(dim)?;
        if n == 0 || size % n != 0 {
            return Err(LoaderError::Shape(format!(
                "Dim {} of size {} cannot be split into {} equal chunks",
                dim, size, n
            )));
        }
        let step = size / n;
        (0..n).map(|i| self.narrow(dim, i * step, step)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arange(shape: Vec<usize>) -> Tensor {
        let len: usize = shape.iter().product();
        Tensor::new((0..len).map(|i| i as f32).collect(), shape).unwrap()
    }

    #[test]
    fn test_tensor_new_shape_mismatch() {
        let result = Tensor::new(vec![1.0, 2.0, 3.0], vec![4]);
        assert!(matches!(result, Err(LoaderError::Shape(_))));
    }

    #[test]
    fn test_decode_rejects_inconsistent_shape() {
        let good = Tensor::new(vec![1.0, 2.0, 3.0, 4.0], vec![2, 2]).unwrap();
        let mut buf = Vec::new();
        ciborium::into_writer(&good, &mut buf).unwrap();
        let decoded: Tensor = ciborium::from_reader(&buf[..]).unwrap();
        assert_eq!(decoded, good);

        let bad = Tensor {
            data: vec![1.0, 2.0],
            shape: vec![8, 2],
        };
        let mut buf = Vec::new();
        ciborium::into_writer(&bad, &mut buf).unwrap();
        let decoded: std::result::Result<Tensor, _> = ciborium::from_reader(&buf[..]);
        let err = LoaderError::from(decoded.unwrap_err());
        assert!(matches!(err, LoaderError::Serialization(_)));
        assert!(err.to_string().contains("[8, 2]"));
    }

    #[test]
    fn test_inconsistent_tensor_is_shape_error() {
        let bad = Tensor {
            data: vec![0.0; 4],
            shape: vec![4, 2],
        };
        let good = Tensor::zeros(vec![1, 2]);
        assert!(matches!(Tensor::cat(&[&good, &bad], 0), Err(LoaderError::Shape(_))));
        assert!(matches!(bad.narrow(0, 2, 2), Err(LoaderError::Shape(_))));
    }

    #[test]
    fn test_cat_dim0() {
        let a = Tensor::new(vec![1.0, 2.0, 3.0, 4.0], vec![2, 2]).unwrap();
        let b = Tensor::new(vec![5.0, 6.0], vec![1, 2]).unwrap();
        let c = Tensor::cat(&[a, b], 0).unwrap();
        assert_eq!(c.shape, vec![3, 2]);
        assert_eq!(c.data, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn test_cat_dim1() {
        let a = Tensor::new(vec![1.0, 2.0, 3.0, 4.0], vec![2, 2]).unwrap();
        let b = Tensor::new(vec![5.0, 6.0], vec![2, 1]).unwrap();
        let c = Tensor::cat(&[&a, &b], 1).unwrap();
        assert_eq!(c.shape, vec![2, 3]);
        assert_eq!(c.data, vec![1.0, 2.0, 5.0, 3.0, 4.0, 6.0]);
    }

    #[test]
    fn test_cat_rejects_mismatched_shapes() {
        let a = Tensor::zeros(vec![2, 3]);
        let b = Tensor::zeros(vec![2, 4]);
        assert!(Tensor::cat(&[&a, &b], 0).is_err());
        assert!(Tensor::cat(&[&a, &b], 1).is_ok());
        assert!(Tensor::cat::<Tensor>(&[], 0).is_err());
    }

    #[test]
    fn test_chunk_then_cat_is_identity() {
        let t = arange(vec![6, 4]);
        for dim in 0..2 {
            let chunks = t.chunk(2, dim).unwrap();
            assert_eq!(chunks.len(), 2);
            assert_eq!(Tensor::cat(&chunks, dim).unwrap(), t);
        }
    }

    #[test]
    fn test_chunk_uneven_is_error() {
        let t = arange(vec![5, 2]);
        assert!(t.chunk(2, 0).is_err());
        assert!(t.chunk(0, 0).is_err());
    }

    #[test]
    fn test_narrow_middle_columns() {
        let t = arange(vec![2, 4]);
        let n = t.narrow(1, 1, 2).unwrap();
        assert_eq!(n.shape, vec![2, 2]);
        assert_eq!(n.data, vec![1.0, 2.0, 5.0, 6.0]);
        assert!(t.narrow(1, 3, 2).is_err());
    }

    #[test]
    fn test_one_dimensional_ops() {
        let t = arange(vec![8]);
        let halves = t.chunk(2, 0).unwrap();
        assert_eq!(halves[1].data, vec![4.0, 5.0, 6.0, 7.0]);
        assert!(t.dim(1).is_err());
        assert_eq!(t.size_bytes(), 32);
    }
}
