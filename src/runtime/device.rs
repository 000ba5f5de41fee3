//! Device identity

use std::fmt;

/// Family of memory a buffer lives in
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DeviceType {
    /// Host memory
    Cpu,
    /// Memory owned by the GPU device runtime
    Cuda,
}

impl DeviceType {
    /// Number of device types
    pub const COUNT: usize = 2;

    /// Dense index for per-device-type tables
    #[inline]
    pub const fn index(self) -> usize {
        match self {
            Self::Cpu => 0,
            Self::Cuda => 1,
        }
    }

    /// Lowercase name ("cpu", "cuda")
    pub const fn name(self) -> &'static str {
        match self {
            Self::Cpu => "cpu",
            Self::Cuda => "cuda",
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A concrete device: a type plus an ordinal
///
/// The host is always `cpu:0`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Device {
    kind: DeviceType,
    index: usize,
}

impl Device {
    /// The host device
    pub const CPU: Device = Device {
        kind: DeviceType::Cpu,
        index: 0,
    };

    /// Create a device of the given type and ordinal
    pub const fn new(kind: DeviceType, index: usize) -> Self {
        Self { kind, index }
    }

    /// The host device
    pub const fn cpu() -> Self {
        Self::CPU
    }

    /// GPU device with the given ordinal
    pub const fn cuda(index: usize) -> Self {
        Self {
            kind: DeviceType::Cuda,
            index,
        }
    }

    /// Device type
    #[inline]
    pub const fn kind(&self) -> DeviceType {
        self.kind
    }

    /// Device ordinal within its type
    #[inline]
    pub const fn index(&self) -> usize {
        self.index
    }

    /// Returns true for GPU devices
    #[inline]
    pub const fn is_cuda(&self) -> bool {
        matches!(self.kind, DeviceType::Cuda)
    }
}

impl Default for Device {
    fn default() -> Self {
        Self::CPU
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.index)
    }
}
