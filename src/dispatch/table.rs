//! Operator table: one materialized (backend, element type) cell

use super::{Backend, DispatchKey, KernelTable};
use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::runtime::{Allocator, AllocatorRegistry, Device};
use crate::tensor::{Layout, Storage, Tensor};
use std::fmt;
use std::sync::{Arc, OnceLock};

/// A dispatch cell
///
/// Tables are created by [`Context`](super::Context) on first lookup and
/// shared by every tensor of that backend and element type. They resolve
/// the allocator dynamically, so swapping an allocator in the registry
/// affects tensors created afterwards.
pub struct OperatorTable {
    id: usize,
    key: DispatchKey,
    allocators: Option<Arc<AllocatorRegistry>>,
    kernels: Option<Arc<dyn KernelTable>>,
}

impl OperatorTable {
    pub(crate) fn new(
        id: usize,
        key: DispatchKey,
        allocators: Arc<AllocatorRegistry>,
        kernels: Arc<dyn KernelTable>,
    ) -> Self {
        Self {
            id,
            key,
            allocators: Some(allocators),
            kernels: Some(kernels),
        }
    }

    /// The universal Undefined×Undefined cell
    ///
    /// Returned for every lookup where the backend or element type is
    /// undefined, and shared by every undefined tensor in the process.
    pub fn undefined() -> &'static Arc<OperatorTable> {
        static UNDEFINED: OnceLock<Arc<OperatorTable>> = OnceLock::new();
        UNDEFINED.get_or_init(|| {
            Arc::new(OperatorTable {
                id: 0,
                key: DispatchKey::new(Backend::Undefined, DType::Undefined),
                allocators: None,
                kernels: None,
            })
        })
    }

    /// Whether this is the sentinel cell
    #[inline]
    pub fn is_undefined(&self) -> bool {
        self.key.is_undefined()
    }

    /// Unique id assigned at materialization (0 for the sentinel)
    #[inline]
    pub fn id(&self) -> usize {
        self.id
    }

    /// Coordinate of this cell
    #[inline]
    pub fn key(&self) -> DispatchKey {
        self.key
    }

    /// Backend axis
    #[inline]
    pub fn backend(&self) -> Backend {
        self.key.backend
    }

    /// Element-type axis
    #[inline]
    pub fn dtype(&self) -> DType {
        self.key.dtype
    }

    /// Name in the form "CPUFloatType"
    pub fn name(&self) -> String {
        self.key.to_string()
    }

    /// Allocator currently registered for this backend's device type
    pub fn allocator(&self) -> Result<Arc<dyn Allocator>> {
        let (Some(registry), Some(kind)) = (&self.allocators, self.key.backend.device_type())
        else {
            return Err(Error::undefined("allocator"));
        };
        registry.get(kind)
    }

    /// Kernels captured when this cell was materialized
    pub fn kernels(&self) -> Result<&Arc<dyn KernelTable>> {
        self.kernels.as_ref().ok_or(Error::undefined("kernels"))
    }

    fn check_device(&self, device: Device) -> Result<()> {
        if self.key.backend.device_type() != Some(device.kind()) {
            return Err(Error::invalid_argument(
                "device",
                format!("{} cannot place tensors on {device}", self.name()),
            ));
        }
        Ok(())
    }

    /// A resizable buffer of `numel` elements on `device`
    pub fn storage(&self, device: Device, numel: usize) -> Result<Storage> {
        self.check_device(device)?;
        Storage::new(self.key.dtype, numel, device, self.allocator()?, true)
    }

    /// Uninitialized contiguous tensor on `device`
    ///
    /// Contents follow the allocator: the default host allocator zero-fills.
    pub fn empty(self: &Arc<Self>, device: Device, sizes: &[usize]) -> Result<Tensor> {
        if self.key.backend.is_sparse() {
            return Err(Error::unsupported(
                "empty",
                format!("{} has no dense layout", self.name()),
            ));
        }
        let layout = Layout::contiguous(sizes);
        let storage = self.storage(device, layout.elem_count())?;
        Tensor::new(Some(storage), layout, Arc::clone(self))
    }

    /// Contiguous tensor on `device` filled with `value`
    pub fn full(self: &Arc<Self>, device: Device, sizes: &[usize], value: f64) -> Result<Tensor> {
        let tensor = self.empty(device, sizes)?;
        tensor.fill_(value)?;
        Ok(tensor)
    }

    /// Contiguous zero tensor on `device`
    pub fn zeros(self: &Arc<Self>, device: Device, sizes: &[usize]) -> Result<Tensor> {
        self.full(device, sizes, 0.0)
    }
}

impl PartialEq for OperatorTable {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.key == other.key
    }
}

impl Eq for OperatorTable {}

impl fmt::Debug for OperatorTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperatorTable")
            .field("id", &self.id)
            .field("key", &format_args!("{}", self.key))
            .field(
                "kernels",
                &self.kernels.as_ref().map(|kernels| kernels.name().to_string()),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sentinel_is_a_singleton() {
        let a = OperatorTable::undefined();
        let b = OperatorTable::undefined();
        assert!(Arc::ptr_eq(a, b));
        assert!(a.is_undefined());
        assert_eq!(a.name(), "UndefinedUndefinedType");
    }

    #[test]
    fn test_sentinel_has_no_allocator_or_kernels() {
        let table = OperatorTable::undefined();
        assert!(matches!(
            table.allocator(),
            Err(Error::UndefinedTensor { .. })
        ));
        assert!(table.kernels().is_err());
        assert!(table.empty(Device::cpu(), &[2]).is_err());
    }
}
