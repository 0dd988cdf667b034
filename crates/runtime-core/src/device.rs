//! Device placement and moving nested tensor collections between devices

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::hash::Hash;
use std::str::FromStr;

use crate::enums::AcceleratorType;
use crate::error::Error;
use crate::types::Tensor;

/// Target placement for tensor data
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Device {
    #[default]
    Cpu,
    Cuda(usize),
    Mps,
}

impl Device {
    pub fn accelerator(self) -> AcceleratorType {
        match self {
            Device::Cpu => AcceleratorType::Cpu,
            Device::Cuda(_) => AcceleratorType::Cuda,
            Device::Mps => AcceleratorType::Mps,
        }
    }

    pub fn is_cpu(self) -> bool {
        matches!(self, Device::Cpu)
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => f.write_str("cpu"),
            Device::Cuda(index) => write!(f, "cuda:{}", index),
            Device::Mps => f.write_str("mps"),
        }
    }
}

impl FromStr for Device {
    type Err = Error;

    /// Accepts `cpu`, `mps`, `cuda` and `cuda:<index>`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, index) = match s.trim().split_once(':') {
            Some((kind, index)) => (kind, Some(index)),
            None => (s.trim(), None),
        };

        let accelerator: AcceleratorType = kind.parse()?;
        match (accelerator, index) {
            (AcceleratorType::Cuda, Some(index)) => {
                let index = index.parse::<usize>().map_err(|_| Error::InvalidConfig {
                    message: format!("invalid device index in '{}'", s),
                })?;
                Ok(Device::Cuda(index))
            }
            (accelerator, None) => Ok(accelerator.default_device()),
            (_, Some(_)) => Err(Error::InvalidConfig {
                message: format!("device '{}' does not take an index", s),
            }),
        }
    }
}

/// Data that can be moved to a device, recursing into containers
pub trait MoveToDevice: Sized {
    fn move_to(self, device: Device) -> Self;
}

impl MoveToDevice for Tensor {
    fn move_to(self, device: Device) -> Self {
        self.with_device(device)
    }
}

impl<T: MoveToDevice> MoveToDevice for Vec<T> {
    fn move_to(self, device: Device) -> Self {
        self.into_iter().map(|item| item.move_to(device)).collect()
    }
}

impl<T: MoveToDevice> MoveToDevice for Option<T> {
    fn move_to(self, device: Device) -> Self {
        self.map(|item| item.move_to(device))
    }
}

impl<K: Ord, V: MoveToDevice> MoveToDevice for BTreeMap<K, V> {
    fn move_to(self, device: Device) -> Self {
        self.into_iter()
            .map(|(key, value)| (key, value.move_to(device)))
            .collect()
    }
}

impl<K: Eq + Hash, V: MoveToDevice> MoveToDevice for HashMap<K, V> {
    fn move_to(self, device: Device) -> Self {
        self.into_iter()
            .map(|(key, value)| (key, value.move_to(device)))
            .collect()
    }
}

impl<A: MoveToDevice, B: MoveToDevice> MoveToDevice for (A, B) {
    fn move_to(self, device: Device) -> Self {
        (self.0.move_to(device), self.1.move_to(device))
    }
}

/// Move every tensor inside `data` to `device`
pub fn move_data_to_device<T: MoveToDevice>(data: T, device: Device) -> T {
    data.move_to(device)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DType;

    fn tensor() -> Tensor {
        Tensor::empty(&[2], DType::F32, Device::Cpu).unwrap()
    }

    #[test]
    fn test_parse_device() {
        assert_eq!("cpu".parse::<Device>().unwrap(), Device::Cpu);
        assert_eq!("cuda".parse::<Device>().unwrap(), Device::Cuda(0));
        assert_eq!("CUDA:3".parse::<Device>().unwrap(), Device::Cuda(3));
        assert_eq!("mps".parse::<Device>().unwrap(), Device::Mps);
        assert!("cpu:1".parse::<Device>().is_err());
        assert!("cuda:x".parse::<Device>().is_err());
    }

    #[test]
    fn test_display_roundtrip() {
        for device in [Device::Cpu, Device::Cuda(1), Device::Mps] {
            assert_eq!(device.to_string().parse::<Device>().unwrap(), device);
        }
    }

    #[test]
    fn test_move_nested() {
        let mut batch = BTreeMap::new();
        batch.insert("inputs", vec![tensor(), tensor()]);
        batch.insert("targets", vec![tensor()]);
        let data = (batch, Some(tensor()));

        let (batch, extra) = move_data_to_device(data, Device::Cuda(1));
        assert!(batch
            .values()
            .flatten()
            .all(|t| t.device() == Device::Cuda(1)));
        assert_eq!(extra.unwrap().device(), Device::Cuda(1));
    }

    #[test]
    fn test_move_keeps_data() {
        let t = Tensor::from_slice(&[3], &[1i32, 2, 3]).unwrap();
        let mut map = HashMap::new();
        map.insert(0u8, t.clone());

        let moved = move_data_to_device(map, Device::Mps);
        assert_eq!(moved[&0].as_bytes(), t.as_bytes());
        assert_eq!(moved[&0].device(), Device::Mps);
    }
}
