//! Load tensors from .safetensors files

use std::collections::HashMap;
use std::fs::File;
use std::ops::Range;
use std::path::Path;

use burn::prelude::*;
use burn::tensor::TensorData;
use half::{bf16, f16};
use memmap2::{Mmap, MmapOptions};
use safetensors::{Dtype, SafeTensors};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Safetensors error: {0}")]
    Safetensors(#[from] safetensors::SafeTensorError),

    #[error("Tensor not found: {0}")]
    TensorNotFound(String),

    #[error("Unsupported dtype for {name}: {dtype:?}")]
    UnsupportedDtype { name: String, dtype: Dtype },

    #[error("Shape mismatch for {name}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("Rank mismatch for {name}: expected rank {expected}, got shape {actual:?}")]
    RankMismatch {
        name: String,
        expected: usize,
        actual: Vec<usize>,
    },
}

/// A safetensors file with memory-mapped data
///
/// Only the header is parsed on open; tensor bytes are converted to `f32`
/// on demand.
pub struct SafeTensorFile {
    mmap: Mmap,
    tensors: HashMap<String, TensorInfo>,
}

struct TensorInfo {
    dtype: Dtype,
    shape: Vec<usize>,
    bytes: Range<usize>,
}

impl SafeTensorFile {
    /// Open a safetensors file
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, LoadError> {
        let file = File::open(path)?;
        // Safety: the mapping is read-only and owned by the returned value
        let mmap = unsafe { MmapOptions::new().map(&file)? };

        let base = mmap.as_ptr() as usize;
        let tensors = SafeTensors::deserialize(&mmap)?
            .tensors()
            .into_iter()
            .map(|(name, view)| {
                let start = view.data().as_ptr() as usize - base;
                let info = TensorInfo {
                    dtype: view.dtype(),
                    shape: view.shape().to_vec(),
                    bytes: start..start + view.data().len(),
                };
                (name, info)
            })
            .collect();

        Ok(Self { mmap, tensors })
    }

    /// List all tensor names
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tensors.keys().map(|s| s.as_str())
    }

    /// Number of tensors in the file
    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Check if a tensor exists
    pub fn contains(&self, name: &str) -> bool {
        self.tensors.contains_key(name)
    }

    /// Get tensor shape
    pub fn shape(&self, name: &str) -> Option<&[usize]> {
        self.tensors.get(name).map(|t| t.shape.as_slice())
    }

    /// Get tensor dtype
    pub fn dtype(&self, name: &str) -> Option<Dtype> {
        self.tensors.get(name).map(|t| t.dtype)
    }

    fn info(&self, name: &str) -> Result<&TensorInfo, LoadError> {
        self.tensors
            .get(name)
            .ok_or_else(|| LoadError::TensorNotFound(name.to_string()))
    }

    /// Reads a tensor's values as `f32`, converting from fp16/bf16 if needed
    ///
    /// Returns the flat row-major values and the stored shape.
    pub fn read_f32(&self, name: &str) -> Result<(Vec<f32>, Vec<usize>), LoadError> {
        let info = self.info(name)?;
        let data = &self.mmap[info.bytes.clone()];

        // Byte-wise decoding, the mapped data may be unaligned
        let floats: Vec<f32> = match info.dtype {
            Dtype::F32 => data
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
            Dtype::F16 => data
                .chunks_exact(2)
                .map(|c| f16::from_bits(u16::from_le_bytes([c[0], c[1]])).to_f32())
                .collect(),
            Dtype::BF16 => data
                .chunks_exact(2)
                .map(|c| bf16::from_bits(u16::from_le_bytes([c[0], c[1]])).to_f32())
                .collect(),
            dtype => {
                return Err(LoadError::UnsupportedDtype {
                    name: name.to_string(),
                    dtype,
                })
            }
        };

        Ok((floats, info.shape.clone()))
    }

    /// Load a tensor of rank `D` as f32
    pub fn load_f32<B: Backend, const D: usize>(
        &self,
        name: &str,
        device: &B::Device,
    ) -> Result<Tensor<B, D>, LoadError> {
        let (floats, shape) = self.read_f32(name)?;
        let shape: [usize; D] = shape.try_into().map_err(|actual| LoadError::RankMismatch {
            name: name.to_string(),
            expected: D,
            actual,
        })?;

        Ok(Tensor::from_data(TensorData::new(floats, shape), device))
    }

    /// Load a tensor with expected shape, converting to f32
    pub fn load_f32_checked<B: Backend, const D: usize>(
        &self,
        name: &str,
        expected_shape: [usize; D],
        device: &B::Device,
    ) -> Result<Tensor<B, D>, LoadError> {
        let info = self.info(name)?;
        if info.shape.as_slice() != expected_shape.as_slice() {
            return Err(LoadError::ShapeMismatch {
                name: name.to_string(),
                expected: expected_shape.to_vec(),
                actual: info.shape.clone(),
            });
        }

        self.load_f32::<B, D>(name, device)
    }

    /// Load a tensor as rank `D`, dropping leading unit dimensions
    ///
    /// Accepts e.g. a stored `[1, L, H]` where `[L, H]` is wanted. A tensor
    /// stored with fewer than `D` dims is a rank mismatch.
    pub fn load_f32_squeezed<B: Backend, const D: usize>(
        &self,
        name: &str,
        device: &B::Device,
    ) -> Result<Tensor<B, D>, LoadError> {
        let (floats, mut shape) = self.read_f32(name)?;
        while shape.len() > D && shape[0] == 1 {
            shape.remove(0);
        }
        let shape: [usize; D] = shape.try_into().map_err(|actual| LoadError::RankMismatch {
            name: name.to_string(),
            expected: D,
            actual,
        })?;

        Ok(Tensor::from_data(TensorData::new(floats, shape), device))
    }
}
