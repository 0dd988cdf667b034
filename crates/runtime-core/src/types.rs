//! Core tensor and state types shared by the checkpoint crates

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::device::Device;
use crate::error::{Error, Result};

/// Fully qualified tensor name, e.g. `model.layers.0.weight`
pub type TensorName = String;

/// Ordered mapping from tensor name to tensor
pub type StateDict = BTreeMap<TensorName, Tensor>;

/// Tensor element type
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    Bool,
    U8,
    I8,
    I16,
    I32,
    I64,
    F16,
    BF16,
    F32,
    F64,
}

impl DType {
    /// Size of a single element in bytes
    pub fn element_size(self) -> usize {
        match self {
            DType::Bool | DType::U8 | DType::I8 => 1,
            DType::I16 | DType::F16 | DType::BF16 => 2,
            DType::I32 | DType::F32 => 4,
            DType::I64 | DType::F64 => 8,
        }
    }

    /// Canonical name used in logs and error messages
    pub fn name(self) -> &'static str {
        match self {
            DType::Bool => "bool",
            DType::U8 => "uint8",
            DType::I8 => "int8",
            DType::I16 => "int16",
            DType::I32 => "int32",
            DType::I64 => "int64",
            DType::F16 => "float16",
            DType::BF16 => "bfloat16",
            DType::F32 => "float32",
            DType::F64 => "float64",
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Number of elements for a shape, `None` on overflow
pub fn checked_numel(shape: &[usize]) -> Option<usize> {
    shape.iter().try_fold(1usize, |acc, &dim| acc.checked_mul(dim))
}

/// Byte size of a tensor with the given shape and dtype, `None` on overflow
pub fn checked_nbytes(shape: &[usize], dtype: DType) -> Option<usize> {
    checked_numel(shape)?.checked_mul(dtype.element_size())
}

/// Rust scalar types that map onto a [`DType`]
pub trait Element: Copy {
    const DTYPE: DType;

    fn write_le(self, out: &mut Vec<u8>);

    fn read_le(bytes: &[u8]) -> Self;
}

macro_rules! impl_element {
    ($($ty:ty => $dtype:expr),* $(,)?) => {
        $(
            impl Element for $ty {
                const DTYPE: DType = $dtype;

                fn write_le(self, out: &mut Vec<u8>) {
                    out.extend_from_slice(&self.to_le_bytes());
                }

                fn read_le(bytes: &[u8]) -> Self {
                    let mut buf = [0u8; std::mem::size_of::<$ty>()];
                    buf.copy_from_slice(bytes);
                    <$ty>::from_le_bytes(buf)
                }
            }
        )*
    };
}

impl_element! {
    u8 => DType::U8,
    i8 => DType::I8,
    i16 => DType::I16,
    i32 => DType::I32,
    i64 => DType::I64,
    f32 => DType::F32,
    f64 => DType::F64,
}

/// Dense row-major tensor held in host memory
///
/// `device` records where the tensor is meant to live; the bytes are always
/// host resident.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    dtype: DType,
    shape: Vec<usize>,
    device: Device,
    data: Vec<u8>,
}

impl Tensor {
    /// Allocate a zero-filled tensor
    ///
    /// Fails with [`Error::AllocationFailed`] instead of aborting the process
    /// when the buffer cannot be reserved.
    pub fn empty(shape: &[usize], dtype: DType, device: Device) -> Result<Self> {
        let nbytes = checked_nbytes(shape, dtype).ok_or_else(|| Error::AllocationFailed {
            fqn: format!("<{} tensor of shape {:?}>", dtype, shape),
            bytes: u64::MAX,
        })?;

        let mut data = Vec::new();
        data.try_reserve_exact(nbytes)
            .map_err(|_| Error::AllocationFailed {
                fqn: format!("<{} tensor of shape {:?}>", dtype, shape),
                bytes: nbytes as u64,
            })?;
        data.resize(nbytes, 0);

        Ok(Self {
            dtype,
            shape: shape.to_vec(),
            device,
            data,
        })
    }

    /// Build a tensor from raw little-endian bytes
    pub fn from_bytes(shape: &[usize], dtype: DType, data: Vec<u8>) -> Result<Self> {
        let expected = checked_nbytes(shape, dtype).ok_or_else(|| Error::InvalidConfig {
            message: format!("tensor shape {:?} overflows", shape),
        })?;
        if data.len() != expected {
            return Err(Error::Internal {
                message: format!(
                    "buffer of {} bytes does not match {} tensor of shape {:?} ({} bytes)",
                    data.len(),
                    dtype,
                    shape,
                    expected
                ),
            });
        }

        Ok(Self {
            dtype,
            shape: shape.to_vec(),
            device: Device::Cpu,
            data,
        })
    }

    /// Build a CPU tensor from typed values
    pub fn from_slice<T: Element>(shape: &[usize], values: &[T]) -> Result<Self> {
        let mut data = Vec::with_capacity(values.len() * T::DTYPE.element_size());
        for &value in values {
            value.write_le(&mut data);
        }
        Self::from_bytes(shape, T::DTYPE, data)
    }

    /// Copy the elements out as typed values
    pub fn to_vec<T: Element>(&self) -> Result<Vec<T>> {
        if self.dtype != T::DTYPE {
            return Err(Error::DTypeMismatch {
                expected: T::DTYPE.to_string(),
                actual: self.dtype.to_string(),
            });
        }

        Ok(self
            .data
            .chunks_exact(self.dtype.element_size())
            .map(T::read_le)
            .collect())
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn device(&self) -> Device {
        self.device
    }

    /// Number of elements
    pub fn numel(&self) -> usize {
        self.data.len() / self.dtype.element_size()
    }

    /// Size of the backing buffer in bytes
    pub fn nbytes(&self) -> usize {
        self.data.len()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Same data with a different placement tag
    pub fn with_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    /// Check that the buffer length agrees with shape and dtype
    ///
    /// Needed after deserializing, where the invariant is not enforced.
    pub fn validate(&self) -> Result<()> {
        match checked_nbytes(&self.shape, self.dtype) {
            Some(expected) if expected == self.data.len() => Ok(()),
            _ => Err(Error::Internal {
                message: format!(
                    "{} tensor of shape {:?} carries {} bytes",
                    self.dtype,
                    self.shape,
                    self.data.len()
                ),
            }),
        }
    }
}

/// Total payload size of a state dict in bytes
pub fn state_dict_nbytes(state: &StateDict) -> u64 {
    state.values().map(|t| t.nbytes() as u64).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_element_sizes() {
        assert_eq!(DType::Bool.element_size(), 1);
        assert_eq!(DType::BF16.element_size(), 2);
        assert_eq!(DType::F32.element_size(), 4);
        assert_eq!(DType::I64.element_size(), 8);
    }

    #[test]
    fn test_empty_is_zeroed() {
        let t = Tensor::empty(&[2, 3], DType::F32, Device::Cpu).unwrap();
        assert_eq!(t.numel(), 6);
        assert_eq!(t.nbytes(), 24);
        assert!(t.as_bytes().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_empty_overflow_is_an_error() {
        let result = Tensor::empty(&[usize::MAX, 2], DType::F64, Device::Cpu);
        assert!(matches!(result, Err(Error::AllocationFailed { .. })));
    }

    #[test]
    fn test_typed_values() {
        let t = Tensor::from_slice(&[2, 2], &[1.5f32, -2.0, 0.0, 8.25]).unwrap();
        assert_eq!(t.dtype(), DType::F32);
        assert_eq!(t.to_vec::<f32>().unwrap(), vec![1.5, -2.0, 0.0, 8.25]);

        let err = t.to_vec::<i32>().unwrap_err();
        assert!(matches!(err, Error::DTypeMismatch { .. }));
    }

    #[test]
    fn test_from_slice_rejects_wrong_length() {
        let result = Tensor::from_slice(&[3], &[1i64, 2]);
        assert!(result.is_err());
    }

    #[test]
    fn test_scalar_tensor() {
        let t = Tensor::from_slice(&[], &[42i64]).unwrap();
        assert_eq!(t.numel(), 1);
        assert!(t.shape().is_empty());
        t.validate().unwrap();
    }

    #[test]
    fn test_state_dict_nbytes() {
        let mut state = StateDict::new();
        state.insert("a".into(), Tensor::from_slice(&[4], &[0u8; 4]).unwrap());
        state.insert("b".into(), Tensor::from_slice(&[2], &[1.0f64, 2.0]).unwrap());
        assert_eq!(state_dict_nbytes(&state), 20);
    }
}
