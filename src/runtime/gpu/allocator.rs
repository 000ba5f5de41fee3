//! Device memory allocators

use super::DeviceRuntimeState;
use crate::error::{Error, Result};
use crate::runtime::{Allocator, DataPtr, Device, DeviceType};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Block sizes are rounded up to a multiple of this
const BLOCK_ROUND: usize = 512;

fn check_device(state: &DeviceRuntimeState, device: Device) -> Result<()> {
    if device.kind() != DeviceType::Cuda {
        return Err(Error::DeviceMismatch {
            lhs: Device::cuda(0),
            rhs: device,
        });
    }
    if device.index() >= state.device_count() {
        return Err(Error::invalid_argument(
            "device",
            format!("{device} is not a visible device"),
        ));
    }
    Ok(())
}

/// Allocates straight from the platform and frees on release
#[derive(Clone, Debug)]
pub struct DeviceAllocator {
    state: Arc<DeviceRuntimeState>,
    allocated: Arc<AtomicUsize>,
}

impl DeviceAllocator {
    /// Create an allocator over `state`
    pub fn new(state: Arc<DeviceRuntimeState>) -> Self {
        Self {
            state,
            allocated: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl Allocator for DeviceAllocator {
    fn allocate(&self, device: Device, nbytes: usize) -> Result<DataPtr> {
        check_device(&self.state, device)?;
        if nbytes == 0 {
            return Ok(DataPtr::empty(device));
        }
        let ptr = self.state.malloc(device.index(), nbytes)?;
        self.allocated.fetch_add(nbytes, Ordering::Relaxed);

        let state = Arc::clone(&self.state);
        let allocated = Arc::clone(&self.allocated);
        let index = device.index();
        Ok(DataPtr::new(ptr, nbytes, device, move |ptr| {
            allocated.fetch_sub(nbytes, Ordering::Relaxed);
            state.free(index, ptr);
        }))
    }

    fn device_type(&self) -> DeviceType {
        DeviceType::Cuda
    }

    fn allocated_bytes(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }
}

/// Keeps released blocks in per-device, per-size free lists for reuse
///
/// An allocation that still fails after the runtime's reclaim hook returns
/// every cached block to the platform and tries once more.
#[derive(Clone, Debug)]
pub struct CachingDeviceAllocator {
    inner: Arc<CacheInner>,
}

#[derive(Debug)]
struct CacheInner {
    state: Arc<DeviceRuntimeState>,
    // (device, rounded size) -> free blocks
    free_blocks: Mutex<HashMap<(usize, usize), Vec<u64>>>,
    cached_bytes: AtomicUsize,
    allocated: AtomicUsize,
}

impl CachingDeviceAllocator {
    /// Create an allocator over `state`
    pub fn new(state: Arc<DeviceRuntimeState>) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                state,
                free_blocks: Mutex::new(HashMap::new()),
                cached_bytes: AtomicUsize::new(0),
                allocated: AtomicUsize::new(0),
            }),
        }
    }

    /// Return every cached block to the platform
    pub fn empty_cache(&self) {
        self.inner.empty_cache();
    }

    /// Bytes held in free lists
    pub fn cached_bytes(&self) -> usize {
        self.inner.cached_bytes.load(Ordering::Relaxed)
    }
}

impl CacheInner {
    fn take_cached(&self, device: usize, size: usize) -> Option<u64> {
        let mut free_blocks = self.free_blocks.lock();
        let ptr = free_blocks.get_mut(&(device, size))?.pop()?;
        self.cached_bytes.fetch_sub(size, Ordering::Relaxed);
        Some(ptr)
    }

    fn release(&self, device: usize, size: usize, ptr: u64) {
        self.free_blocks
            .lock()
            .entry((device, size))
            .or_default()
            .push(ptr);
        self.cached_bytes.fetch_add(size, Ordering::Relaxed);
    }

    fn empty_cache(&self) {
        let blocks: Vec<_> = self.free_blocks.lock().drain().collect();
        for ((device, size), ptrs) in blocks {
            for ptr in ptrs {
                self.state.free(device, ptr);
                self.cached_bytes.fetch_sub(size, Ordering::Relaxed);
            }
        }
    }
}

impl Drop for CacheInner {
    fn drop(&mut self) {
        self.empty_cache();
    }
}

impl Allocator for CachingDeviceAllocator {
    fn allocate(&self, device: Device, nbytes: usize) -> Result<DataPtr> {
        check_device(&self.inner.state, device)?;
        if nbytes == 0 {
            return Ok(DataPtr::empty(device));
        }
        let index = device.index();
        let size = nbytes.div_ceil(BLOCK_ROUND) * BLOCK_ROUND;

        let ptr = match self.inner.take_cached(index, size) {
            Some(ptr) => ptr,
            None => match self.inner.state.malloc(index, size) {
                Ok(ptr) => ptr,
                Err(err) if err.is_out_of_memory() => {
                    tracing::debug!(%device, size, "freeing cached blocks after allocation failure");
                    self.inner.empty_cache();
                    self.inner.state.malloc(index, size)?
                }
                Err(err) => return Err(err),
            },
        };
        self.inner.allocated.fetch_add(size, Ordering::Relaxed);

        let inner = Arc::clone(&self.inner);
        Ok(DataPtr::new(ptr, nbytes, device, move |ptr| {
            inner.allocated.fetch_sub(size, Ordering::Relaxed);
            inner.release(index, size, ptr);
        }))
    }

    fn device_type(&self) -> DeviceType {
        DeviceType::Cuda
    }

    fn allocated_bytes(&self) -> usize {
        self.inner.allocated.load(Ordering::Relaxed)
    }
}
