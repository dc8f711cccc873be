//! Strided host tensors.
//!
//! Values are held as `f64` and rounded to the tensor dtype on every write, so a `Half` tensor
//! only ever stores values representable in binary16. Views created by [`HostTensor::permute`]
//! and [`HostTensor::as_strided`] share storage with their source.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use anyhow::{bail, ensure, Result};
use fuser_rs::tensor::{contiguous_strides, DType, DeviceClass, StorageId, TensorView};
use half::{bf16, f16};

static STORAGE_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

struct Storage {
    id: u64,
    data: RwLock<Vec<f64>>,
}

#[derive(Clone)]
pub struct HostTensor {
    storage: Arc<Storage>,
    sizes: Vec<usize>,
    strides: Vec<isize>,
    offset: usize,
    dtype: DType,
}

impl std::fmt::Debug for HostTensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostTensor")
            .field("storage", &self.storage.id)
            .field("sizes", &self.sizes)
            .field("strides", &self.strides)
            .field("offset", &self.offset)
            .field("dtype", &self.dtype)
            .finish()
    }
}

impl HostTensor {
    /// Dense row-major tensor. `data` is rounded to `dtype`.
    pub fn from_vec(sizes: &[usize], data: Vec<f64>, dtype: DType) -> Result<Self> {
        let expected: usize = sizes.iter().product();
        ensure!(
            data.len() == expected,
            "tensor of shape {:?} needs {} values, got {}",
            sizes,
            expected,
            data.len()
        );
        let data = data
            .into_iter()
            .map(|value| round_to_dtype(value, dtype))
            .collect();
        Ok(Self {
            storage: Arc::new(Storage {
                id: STORAGE_ID_COUNTER.fetch_add(1, Ordering::Relaxed),
                data: RwLock::new(data),
            }),
            sizes: sizes.to_vec(),
            strides: contiguous_strides(sizes),
            offset: 0,
            dtype,
        })
    }

    pub fn full(sizes: &[usize], value: f64, dtype: DType) -> Self {
        let len = sizes.iter().product();
        let value = round_to_dtype(value, dtype);
        Self {
            storage: Arc::new(Storage {
                id: STORAGE_ID_COUNTER.fetch_add(1, Ordering::Relaxed),
                data: RwLock::new(vec![value; len]),
            }),
            sizes: sizes.to_vec(),
            strides: contiguous_strides(sizes),
            offset: 0,
            dtype,
        }
    }

    pub fn ones(sizes: &[usize], dtype: DType) -> Self {
        Self::full(sizes, 1.0, dtype)
    }

    pub fn zeros(sizes: &[usize], dtype: DType) -> Self {
        Self::full(sizes, 0.0, dtype)
    }

    /// View with axes reordered so that view axis `i` is source axis `dims[i]`.
    pub fn permute(&self, dims: &[usize]) -> Result<Self> {
        ensure!(
            dims.len() == self.sizes.len(),
            "permute expects {} dims, got {}",
            self.sizes.len(),
            dims.len()
        );
        let mut seen = vec![false; dims.len()];
        for &dim in dims {
            if dim >= dims.len() || seen[dim] {
                bail!("permute dims {:?} are not a permutation", dims);
            }
            seen[dim] = true;
        }
        Ok(Self {
            storage: Arc::clone(&self.storage),
            sizes: dims.iter().map(|&dim| self.sizes[dim]).collect(),
            strides: dims.iter().map(|&dim| self.strides[dim]).collect(),
            offset: self.offset,
            dtype: self.dtype,
        })
    }

    /// Arbitrary view over this tensor's storage; every addressed element must be in bounds.
    pub fn as_strided(&self, sizes: &[usize], strides: &[isize], offset: usize) -> Result<Self> {
        ensure!(
            sizes.len() == strides.len(),
            "sizes {:?} and strides {:?} differ in rank",
            sizes,
            strides
        );
        let len = self.storage_len();
        if sizes.iter().all(|&size| size > 0) {
            let mut min = offset as isize;
            let mut max = offset as isize;
            for (&size, &stride) in sizes.iter().zip(strides) {
                let span = (size as isize - 1) * stride;
                if span < 0 {
                    min += span;
                } else {
                    max += span;
                }
            }
            ensure!(
                min >= 0 && (max as usize) < len,
                "strided view {:?}/{:?}+{} exceeds storage of {} elements",
                sizes,
                strides,
                offset,
                len
            );
        }
        Ok(Self {
            storage: Arc::clone(&self.storage),
            sizes: sizes.to_vec(),
            strides: strides.to_vec(),
            offset,
            dtype: self.dtype,
        })
    }

    pub fn storage_offset(&self) -> usize {
        self.offset
    }

    pub fn shares_storage(&self, other: &HostTensor) -> bool {
        Arc::ptr_eq(&self.storage, &other.storage)
    }

    pub fn numel(&self) -> usize {
        self.sizes.iter().product()
    }

    fn storage_len(&self) -> usize {
        self.storage
            .data
            .read()
            .expect("host tensor storage poisoned")
            .len()
    }

    fn linear_offsets(&self) -> Vec<usize> {
        let mut offsets = Vec::with_capacity(self.numel());
        if self.numel() == 0 {
            return offsets;
        }
        let mut index = vec![0usize; self.sizes.len()];
        loop {
            let mut position = self.offset as isize;
            for (coord, stride) in index.iter().zip(&self.strides) {
                position += *coord as isize * stride;
            }
            offsets.push(position as usize);
            let mut axis = self.sizes.len();
            loop {
                if axis == 0 {
                    return offsets;
                }
                axis -= 1;
                index[axis] += 1;
                if index[axis] < self.sizes[axis] {
                    break;
                }
                index[axis] = 0;
            }
        }
    }

    /// Values in logical row-major order.
    pub fn to_vec(&self) -> Vec<f64> {
        let data = self
            .storage
            .data
            .read()
            .expect("host tensor storage poisoned");
        self.linear_offsets()
            .into_iter()
            .map(|position| data[position])
            .collect()
    }

    /// Overwrites the viewed elements with `values` given in logical row-major order.
    pub fn write_dense(&self, values: &[f64]) -> Result<()> {
        ensure!(
            values.len() == self.numel(),
            "cannot write {} values into tensor of shape {:?}",
            values.len(),
            self.sizes
        );
        let offsets = self.linear_offsets();
        let mut data = self
            .storage
            .data
            .write()
            .expect("host tensor storage poisoned");
        for (position, value) in offsets.into_iter().zip(values) {
            data[position] = round_to_dtype(*value, self.dtype);
        }
        Ok(())
    }
}

impl TensorView for HostTensor {
    fn sizes(&self) -> &[usize] {
        &self.sizes
    }

    fn strides(&self) -> &[isize] {
        &self.strides
    }

    fn dtype(&self) -> DType {
        self.dtype
    }

    fn device(&self) -> DeviceClass {
        DeviceClass::Cpu
    }

    fn storage_id(&self) -> StorageId {
        StorageId(self.storage.id)
    }
}

/// Rounds `value` to the nearest value representable in `dtype`.
pub fn round_to_dtype(value: f64, dtype: DType) -> f64 {
    match dtype {
        DType::Bool => {
            if value != 0.0 {
                1.0
            } else {
                0.0
            }
        }
        DType::Int32 => {
            if value.is_nan() {
                0.0
            } else {
                value.trunc().clamp(i32::MIN as f64, i32::MAX as f64)
            }
        }
        DType::Int64 => {
            if value.is_nan() {
                0.0
            } else {
                value.trunc()
            }
        }
        DType::Half => f16::from_f64(value).to_f64(),
        DType::BFloat16 => bf16::from_f64(value).to_f64(),
        DType::Float => value as f32 as f64,
        DType::Double => value,
    }
}
