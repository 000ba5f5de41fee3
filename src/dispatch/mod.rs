//! Backend/type dispatch
//!
//! ```text
//! Context
//! ├── cells[variable][backend][dtype] -> Option<Arc<OperatorTable>>  (lazy, once per cell)
//! ├── kernels[backend]                -> Arc<dyn KernelTable>        (registered at init)
//! ├── AllocatorRegistry                                              (one allocator per device type)
//! └── DeviceRuntimeState                                             (once, on first GPU lookup)
//! ```
//!
//! A lookup with an undefined backend or element type always yields the
//! process-wide [`OperatorTable::undefined`] sentinel.

mod context;
mod kernels;
mod table;

pub use context::{Context, fresh_type_id, global_context};
pub use kernels::{KernelTable, StridedKernels};
pub use table::OperatorTable;

use crate::dtype::DType;
use crate::runtime::{Device, DeviceType};
use std::fmt;

/// Compute-target family: one axis of the dispatch table
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum Backend {
    /// Dense host memory
    Cpu = 0,
    /// Dense device memory
    Cuda = 1,
    /// Sparse layout in host memory
    SparseCpu = 2,
    /// Sparse layout in device memory
    SparseCuda = 3,
    /// No backend
    Undefined = 4,
}

impl Backend {
    /// Number of backends, `Undefined` included
    pub const COUNT: usize = 5;

    /// Dense table index
    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Device type whose memory this backend addresses
    pub const fn device_type(self) -> Option<DeviceType> {
        match self {
            Backend::Cpu | Backend::SparseCpu => Some(DeviceType::Cpu),
            Backend::Cuda | Backend::SparseCuda => Some(DeviceType::Cuda),
            Backend::Undefined => None,
        }
    }

    /// Whether lookups for this backend need the device runtime
    #[inline]
    pub const fn is_gpu(self) -> bool {
        matches!(self, Backend::Cuda | Backend::SparseCuda)
    }

    /// Whether this is a sparse-layout backend
    #[inline]
    pub const fn is_sparse(self) -> bool {
        matches!(self, Backend::SparseCpu | Backend::SparseCuda)
    }

    /// Dense backend for tensors on `device`
    pub const fn from_device(device: Device) -> Self {
        match device.kind() {
            DeviceType::Cpu => Backend::Cpu,
            DeviceType::Cuda => Backend::Cuda,
        }
    }

    /// Display name as used in table names ("CPU", "SparseCUDA", ...)
    pub const fn name(self) -> &'static str {
        match self {
            Backend::Cpu => "CPU",
            Backend::Cuda => "CUDA",
            Backend::SparseCpu => "SparseCPU",
            Backend::SparseCuda => "SparseCUDA",
            Backend::Undefined => "Undefined",
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Full coordinate of a dispatch cell
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct DispatchKey {
    /// Backend axis
    pub backend: Backend,
    /// Element-type axis
    pub dtype: DType,
    /// Whether the handle participates in gradient tracking
    pub is_variable: bool,
}

impl DispatchKey {
    /// Key of a non-variable cell
    pub const fn new(backend: Backend, dtype: DType) -> Self {
        Self {
            backend,
            dtype,
            is_variable: false,
        }
    }

    /// The same cell on the variable plane
    pub const fn variable(self) -> Self {
        Self {
            is_variable: true,
            ..self
        }
    }

    /// Whether either axis is undefined
    pub fn is_undefined(&self) -> bool {
        self.backend == Backend::Undefined || !self.dtype.is_defined()
    }

    pub(crate) fn cell_index(&self) -> usize {
        let plane = if self.is_variable { Backend::COUNT } else { 0 };
        (plane + self.backend.index()) * DType::COUNT + self.dtype.index()
    }

    /// Number of cells across both planes
    pub(crate) const CELLS: usize = 2 * Backend::COUNT * DType::COUNT;
}

impl fmt::Display for DispatchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}Type", self.backend, self.dtype.scalar_name())?;
        if self.is_variable {
            f.write_str("(Variable)")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_backend_device_mapping() {
        assert_eq!(Backend::from_device(Device::cpu()), Backend::Cpu);
        assert_eq!(Backend::from_device(Device::cuda(2)), Backend::Cuda);
        assert_eq!(Backend::SparseCuda.device_type(), Some(DeviceType::Cuda));
        assert_eq!(Backend::Undefined.device_type(), None);
        assert!(Backend::SparseCuda.is_gpu());
        assert!(!Backend::SparseCpu.is_gpu());
    }

    #[test]
    fn test_key_display() {
        let key = DispatchKey::new(Backend::Cuda, DType::F32);
        assert_eq!(key.to_string(), "CUDAFloatType");
        assert_eq!(key.variable().to_string(), "CUDAFloatType(Variable)");
    }

    #[test]
    fn test_cell_indices_are_distinct() {
        let backends = [
            Backend::Cpu,
            Backend::Cuda,
            Backend::SparseCpu,
            Backend::SparseCuda,
            Backend::Undefined,
        ];
        let mut seen = HashSet::new();
        for &backend in &backends {
            for dtype in DType::ALL.into_iter().chain([DType::Undefined]) {
                for variable in [false, true] {
                    let mut key = DispatchKey::new(backend, dtype);
                    key.is_variable = variable;
                    let index = key.cell_index();
                    assert!(index < DispatchKey::CELLS);
                    assert!(seen.insert(index));
                }
            }
        }
    }
}
