//! Device/tensor boundary.
//!
//! The core never owns tensor memory. Backends hand it opaque handles implementing
//! [`TensorView`], which exposes exactly what validation, shape classification and alias
//! bookkeeping need: extents, strides, dtype, device class and a storage identity.

pub mod dtype;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use dtype::DType;

/// Coarse device classification used when validating inputs against declarations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceClass {
    Cpu,
    Cuda(u32),
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceClass::Cpu => write!(f, "cpu"),
            DeviceClass::Cuda(index) => write!(f, "cuda:{index}"),
        }
    }
}

/// Identity of the raw storage behind a tensor handle.
///
/// Two handles with equal ids alias the same memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StorageId(pub u64);

/// Read-only view over a backend tensor handle.
pub trait TensorView {
    fn sizes(&self) -> &[usize];

    fn strides(&self) -> &[isize];

    fn dtype(&self) -> DType;

    fn device(&self) -> DeviceClass;

    fn storage_id(&self) -> StorageId;

    fn rank(&self) -> usize {
        self.sizes().len()
    }

    /// Per-axis contiguity classification, see [`compute_contiguity`].
    fn contiguity(&self) -> Vec<Option<bool>> {
        compute_contiguity(self.sizes(), self.strides())
    }
}

/// Classifies each axis of a strided layout.
///
/// * `None`: the axis is a broadcast axis (extent 1 or stride 0) and its stride is irrelevant.
/// * `Some(true)`: the axis can be merged with the next inner non-broadcast axis, or it is the
///   innermost non-broadcast axis and has unit stride.
/// * `Some(false)`: anything else.
pub fn compute_contiguity(sizes: &[usize], strides: &[isize]) -> Vec<Option<bool>> {
    debug_assert_eq!(sizes.len(), strides.len(), "sizes/strides rank mismatch");
    let mut contiguity = vec![None; sizes.len()];
    let mut inner: Option<(usize, isize)> = None;
    for axis in (0..sizes.len()).rev() {
        let size = sizes[axis];
        let stride = strides[axis];
        if size == 1 || stride == 0 {
            continue;
        }
        let expected = match inner {
            Some((inner_size, inner_stride)) => (inner_size as isize).saturating_mul(inner_stride),
            None => 1,
        };
        contiguity[axis] = Some(stride == expected);
        inner = Some((size, stride));
    }
    contiguity
}

/// Row-major strides for a dense tensor with the provided extents.
pub fn contiguous_strides(sizes: &[usize]) -> Vec<isize> {
    let mut strides = vec![0isize; sizes.len()];
    let mut acc = 1isize;
    for (i, dim) in sizes.iter().enumerate().rev() {
        strides[i] = acc;
        acc = acc.saturating_mul(*dim as isize);
    }
    strides
}
