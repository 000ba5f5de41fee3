//! Memory allocator trait, owned data pointers, and the per-device-type registry

use super::{Device, DeviceType};
use crate::error::{Error, Result};
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;

/// Releases the memory behind a [`DataPtr`]; called with the raw address
pub type Deleter = Box<dyn FnOnce(u64) + Send + Sync>;

/// A raw device address together with the code that frees it
///
/// The deleter runs exactly once, when the `DataPtr` is dropped. A `DataPtr`
/// built with [`DataPtr::unowned`] has no deleter and never frees anything.
pub struct DataPtr {
    ptr: u64,
    nbytes: usize,
    device: Device,
    deleter: Option<Deleter>,
}

impl DataPtr {
    /// Wrap memory that `deleter` will release
    pub fn new(
        ptr: u64,
        nbytes: usize,
        device: Device,
        deleter: impl FnOnce(u64) + Send + Sync + 'static,
    ) -> Self {
        Self {
            ptr,
            nbytes,
            device,
            deleter: Some(Box::new(deleter)),
        }
    }

    /// Wrap memory owned elsewhere
    pub fn unowned(ptr: u64, nbytes: usize, device: Device) -> Self {
        Self {
            ptr,
            nbytes,
            device,
            deleter: None,
        }
    }

    /// A zero-byte pointer on `device`
    pub fn empty(device: Device) -> Self {
        Self::unowned(0, 0, device)
    }

    /// Raw address (0 for zero-byte allocations)
    #[inline]
    pub fn ptr(&self) -> u64 {
        self.ptr
    }

    /// Capacity in bytes
    #[inline]
    pub fn nbytes(&self) -> usize {
        self.nbytes
    }

    /// Device the memory lives on
    #[inline]
    pub fn device(&self) -> Device {
        self.device
    }

    /// Returns true if dropping this pointer frees memory
    #[inline]
    pub fn is_owned(&self) -> bool {
        self.deleter.is_some()
    }
}

impl Drop for DataPtr {
    fn drop(&mut self) {
        if let Some(deleter) = self.deleter.take() {
            deleter(self.ptr);
        }
    }
}

impl fmt::Debug for DataPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataPtr")
            .field("ptr", &format!("0x{:x}", self.ptr))
            .field("nbytes", &self.nbytes)
            .field("device", &self.device)
            .field("owned", &self.deleter.is_some())
            .finish()
    }
}

/// Memory allocator for one device type
///
/// Allocators hand out [`DataPtr`]s whose deleters return the memory to the
/// allocator. Zero-byte requests should return [`DataPtr::empty`].
pub trait Allocator: Send + Sync {
    /// Allocate `nbytes` on `device`
    fn allocate(&self, device: Device, nbytes: usize) -> Result<DataPtr>;

    /// Device type this allocator serves
    fn device_type(&self) -> DeviceType;

    /// Get the total allocated bytes
    fn allocated_bytes(&self) -> usize {
        0 // Default: tracking not supported
    }
}

/// Maps each device type to exactly one allocator
///
/// Registration normally happens once when a [`Context`](crate::dispatch::Context)
/// is built; [`replace`](Self::replace) lets an operator swap in a different
/// implementation (e.g. a caching device allocator) afterwards.
pub struct AllocatorRegistry {
    slots: RwLock<[Option<Arc<dyn Allocator>>; DeviceType::COUNT]>,
}

impl AllocatorRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            slots: RwLock::new([None, None]),
        }
    }

    /// Register the allocator for its device type
    ///
    /// Fails if that device type already has an allocator.
    pub fn register(&self, allocator: Arc<dyn Allocator>) -> Result<()> {
        let kind = allocator.device_type();
        let mut slots = self.slots.write();
        if slots[kind.index()].is_some() {
            return Err(Error::InvalidOperation(format!(
                "an allocator for {kind} is already registered"
            )));
        }
        slots[kind.index()] = Some(allocator);
        Ok(())
    }

    /// Install `allocator` for its device type, returning the previous one
    pub fn replace(&self, allocator: Arc<dyn Allocator>) -> Option<Arc<dyn Allocator>> {
        let kind = allocator.device_type();
        self.slots.write()[kind.index()].replace(allocator)
    }

    /// Allocator registered for `kind`
    pub fn get(&self, kind: DeviceType) -> Result<Arc<dyn Allocator>> {
        self.slots.read()[kind.index()].clone().ok_or_else(|| {
            Error::unsupported("allocate", format!("no allocator registered for {kind}"))
        })
    }

    /// Returns true if `kind` has an allocator
    pub fn contains(&self, kind: DeviceType) -> bool {
        self.slots.read()[kind.index()].is_some()
    }
}

impl Default for AllocatorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for AllocatorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slots = self.slots.read();
        f.debug_struct("AllocatorRegistry")
            .field("cpu", &slots[DeviceType::Cpu.index()].is_some())
            .field("cuda", &slots[DeviceType::Cuda.index()].is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NullAllocator(DeviceType);

    impl Allocator for NullAllocator {
        fn allocate(&self, device: Device, _nbytes: usize) -> Result<DataPtr> {
            Ok(DataPtr::empty(device))
        }

        fn device_type(&self) -> DeviceType {
            self.0
        }
    }

    #[test]
    fn test_deleter_runs_once_on_drop() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let ptr = DataPtr::new(0x1000, 16, Device::cpu(), move |addr| {
            assert_eq!(addr, 0x1000);
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert!(ptr.is_owned());
        drop(ptr);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_registry_lookup_and_replace() {
        let registry = AllocatorRegistry::new();
        assert!(matches!(
            registry.get(DeviceType::Cpu),
            Err(Error::Unsupported { .. })
        ));

        registry
            .register(Arc::new(NullAllocator(DeviceType::Cpu)))
            .unwrap();
        assert!(registry.contains(DeviceType::Cpu));
        assert!(!registry.contains(DeviceType::Cuda));
        assert!(
            registry
                .register(Arc::new(NullAllocator(DeviceType::Cpu)))
                .is_err()
        );

        let previous = registry.replace(Arc::new(NullAllocator(DeviceType::Cpu)));
        assert!(previous.is_some());
    }
}
