//! Accelerator enumeration

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::device::Device;
use crate::error::Error;

/// Kind of hardware a tensor can be placed on
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum AcceleratorType {
    Cpu,
    Cuda,
    Mps,
}

impl AcceleratorType {
    pub const ALL: [AcceleratorType; 3] =
        [AcceleratorType::Cpu, AcceleratorType::Cuda, AcceleratorType::Mps];

    pub fn as_str(self) -> &'static str {
        match self {
            AcceleratorType::Cpu => "cpu",
            AcceleratorType::Cuda => "cuda",
            AcceleratorType::Mps => "mps",
        }
    }

    /// First device of this accelerator
    pub fn default_device(self) -> Device {
        match self {
            AcceleratorType::Cpu => Device::Cpu,
            AcceleratorType::Cuda => Device::Cuda(0),
            AcceleratorType::Mps => Device::Mps,
        }
    }
}

impl fmt::Display for AcceleratorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AcceleratorType {
    type Err = Error;

    /// Case-insensitive
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.trim().to_ascii_lowercase();
        AcceleratorType::ALL
            .into_iter()
            .find(|kind| kind.as_str() == lowered)
            .ok_or_else(|| Error::InvalidConfig {
                message: format!(
                    "unknown accelerator '{}', expected one of: cpu, cuda, mps",
                    s
                ),
            })
    }
}
