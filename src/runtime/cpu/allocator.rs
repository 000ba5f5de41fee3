//! Aligned host allocator

use super::MemoryReporter;
use crate::error::{Error, Result};
use crate::runtime::{Allocator, DataPtr, Device, DeviceType};
use std::alloc::{Layout as AllocLayout, alloc, alloc_zeroed, dealloc};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// AVX-512 alignment
const HOST_ALIGN: usize = 64;

/// Allocate `nbytes` of 64-byte aligned host memory
///
/// Returns `None` if the system allocator fails. `nbytes` must be non-zero.
pub(crate) fn host_alloc(nbytes: usize, zero_fill: bool) -> Option<u64> {
    debug_assert!(nbytes > 0);
    let layout = AllocLayout::from_size_align(nbytes, HOST_ALIGN).ok()?;
    // SAFETY: layout has non-zero size
    let ptr = unsafe {
        if zero_fill {
            alloc_zeroed(layout)
        } else {
            alloc(layout)
        }
    };
    if ptr.is_null() { None } else { Some(ptr as u64) }
}

/// Release memory obtained from [`host_alloc`] with the same `nbytes`
pub(crate) fn host_free(ptr: u64, nbytes: usize) {
    if ptr == 0 || nbytes == 0 {
        return;
    }
    if let Ok(layout) = AllocLayout::from_size_align(nbytes, HOST_ALIGN) {
        // SAFETY: ptr came from host_alloc with this layout
        unsafe { dealloc(ptr as *mut u8, layout) };
    }
}

/// Host allocator
///
/// Zero-fills new memory unless configured otherwise, and optionally reports
/// every allocation to a [`MemoryReporter`].
#[derive(Clone, Debug)]
pub struct CpuAllocator {
    zero_fill: bool,
    reporter: Option<Arc<MemoryReporter>>,
    allocated: Arc<AtomicUsize>,
}

impl CpuAllocator {
    /// Create a zero-filling allocator without reporting
    pub fn new() -> Self {
        Self {
            zero_fill: true,
            reporter: None,
            allocated: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Set whether new memory is zero-filled
    pub fn with_zero_fill(mut self, zero_fill: bool) -> Self {
        self.zero_fill = zero_fill;
        self
    }

    /// Report allocations to `reporter`
    pub fn with_reporter(mut self, reporter: Arc<MemoryReporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    /// The attached reporter, if any
    pub fn reporter(&self) -> Option<&Arc<MemoryReporter>> {
        self.reporter.as_ref()
    }
}

impl Default for CpuAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl Allocator for CpuAllocator {
    fn allocate(&self, device: Device, nbytes: usize) -> Result<DataPtr> {
        if device.kind() != DeviceType::Cpu {
            return Err(Error::DeviceMismatch {
                lhs: Device::cpu(),
                rhs: device,
            });
        }
        if nbytes == 0 {
            return Ok(DataPtr::empty(device));
        }

        let ptr = host_alloc(nbytes, self.zero_fill).ok_or(Error::OutOfMemory {
            size: nbytes,
            device,
        })?;
        self.allocated.fetch_add(nbytes, Ordering::Relaxed);
        if let Some(reporter) = &self.reporter {
            reporter.new_allocation(ptr, nbytes);
        }

        let reporter = self.reporter.clone();
        let allocated = Arc::clone(&self.allocated);
        Ok(DataPtr::new(ptr, nbytes, device, move |ptr| {
            if let Some(reporter) = reporter {
                reporter.free(ptr);
            }
            allocated.fetch_sub(nbytes, Ordering::Relaxed);
            host_free(ptr, nbytes);
        }))
    }

    fn device_type(&self) -> DeviceType {
        DeviceType::Cpu
    }

    fn allocated_bytes(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocation_is_aligned_and_zeroed() {
        let allocator = CpuAllocator::new();
        let data = allocator.allocate(Device::cpu(), 256).unwrap();
        assert_eq!(data.ptr() % HOST_ALIGN as u64, 0);
        assert_eq!(data.nbytes(), 256);
        // SAFETY: 256 live bytes at ptr
        let bytes = unsafe { std::slice::from_raw_parts(data.ptr() as *const u8, 256) };
        assert!(bytes.iter().all(|&b| b == 0));
        assert_eq!(allocator.allocated_bytes(), 256);
        drop(data);
        assert_eq!(allocator.allocated_bytes(), 0);
    }

    #[test]
    fn test_zero_byte_allocation_is_empty() {
        let data = CpuAllocator::new().allocate(Device::cpu(), 0).unwrap();
        assert_eq!(data.ptr(), 0);
        assert!(!data.is_owned());
    }

    #[test]
    fn test_reporter_does_not_change_results() {
        let reporter = Arc::new(MemoryReporter::new());
        let allocator = CpuAllocator::new().with_reporter(Arc::clone(&reporter));
        let a = allocator.allocate(Device::cpu(), 100).unwrap();
        let b = allocator.allocate(Device::cpu(), 28).unwrap();
        assert_eq!(reporter.live_bytes(), 128);
        drop(a);
        assert_eq!(reporter.live_bytes(), 28);
        drop(b);
        assert_eq!(reporter.live_allocations(), 0);
    }

    #[test]
    fn test_rejects_gpu_device() {
        let err = CpuAllocator::new().allocate(Device::cuda(0), 8).unwrap_err();
        assert!(matches!(err, Error::DeviceMismatch { .. }));
    }
}
