//! Tensor types and backing storage
//!
//! A tensor is a shape plus exactly one storage variant. Kernels consume
//! borrowed [`TensorView`]s so the hot path never clones buffers.

pub mod quant;
pub mod storage;

pub use quant::{Q4Tensor, Q8Tensor};
pub use storage::{TensorStorage, DEFAULT_CHUNK_ELEMENTS, DENSE_MAX_ELEMENTS};

use emberlm_common::{EmberError, Result};

/// Tensor shape
pub type Shape = Vec<usize>;

/// An n-dimensional f32 tensor backed by one storage variant
#[derive(Debug)]
pub struct Tensor {
    shape: Shape,
    storage: TensorStorage,
}

impl Tensor {
    /// Create a tensor from storage, checking the shape/length invariant
    pub fn new(storage: TensorStorage, shape: Shape) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if expected != storage.len() {
            return Err(EmberError::shape(format!(
                "shape {:?} requires {} elements, storage holds {}",
                shape,
                expected,
                storage.len()
            )));
        }
        Ok(Self { shape, storage })
    }

    /// Allocate a zeroed tensor, falling through to chunked storage for
    /// very large shapes
    pub fn zeros(shape: Shape) -> Self {
        let len = shape.iter().product();
        Self {
            shape,
            storage: TensorStorage::alloc(len),
        }
    }

    /// Create a dense tensor from a buffer
    pub fn from_vec(data: Vec<f32>, shape: Shape) -> Result<Self> {
        Self::new(TensorStorage::from_vec(data), shape)
    }

    /// Tensor shape
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Total number of elements
    pub fn len(&self) -> usize {
        self.storage.len()
    }

    /// Whether the tensor is empty
    pub fn is_empty(&self) -> bool {
        self.storage.is_empty()
    }

    /// Backing storage
    pub fn storage(&self) -> &TensorStorage {
        &self.storage
    }

    /// Mutable backing storage
    pub fn storage_mut(&mut self) -> &mut TensorStorage {
        &mut self.storage
    }

    /// Contiguous read view; available unless the tensor is chunked
    pub fn as_slice(&self) -> Result<&[f32]> {
        self.storage.contiguous().ok_or_else(|| {
            EmberError::storage("tensor is chunked; stream per-chunk views instead")
        })
    }

    /// Borrowed kernel view; available unless the tensor is chunked
    pub fn view(&self) -> Result<TensorView<'_>> {
        Ok(TensorView::new(self.as_slice()?, self.shape.clone()))
    }
}

/// A borrowed tensor view with reference semantics
#[derive(Debug, Clone)]
pub struct TensorView<'a> {
    pub data: &'a [f32],
    pub shape: Shape,
}

impl<'a> TensorView<'a> {
    /// Create a new tensor view
    pub fn new(data: &'a [f32], shape: Shape) -> Self {
        debug_assert_eq!(shape.iter().product::<usize>(), data.len());
        Self { data, shape }
    }

    /// Total number of elements
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the view is empty
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Number of dimensions
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Row `r` of a 2-D view
    pub fn row(&self, r: usize) -> &'a [f32] {
        debug_assert_eq!(self.ndim(), 2);
        let cols = self.shape[1];
        &self.data[r * cols..(r + 1) * cols]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape_invariant() {
        assert!(Tensor::from_vec(vec![0.0; 6], vec![2, 3]).is_ok());
        assert!(Tensor::from_vec(vec![0.0; 5], vec![2, 3]).is_err());
    }

    #[test]
    fn test_view_rows() {
        let t = Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], vec![2, 3]).unwrap();
        let v = t.view().unwrap();
        assert_eq!(v.row(0), &[1.0, 2.0, 3.0]);
        assert_eq!(v.row(1), &[4.0, 5.0, 6.0]);
    }

    #[test]
    fn test_zeros_len() {
        let t = Tensor::zeros(vec![4, 8]);
        assert_eq!(t.len(), 32);
        assert_eq!(t.shape(), &[4, 8]);
        assert_eq!(t.as_slice().unwrap()[17], 0.0);
    }
}
