//! Storage: reference-counted untyped buffers with Arc-based sharing

use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::runtime::{Allocator, DataPtr, Device};
use parking_lot::RwLock;
use std::fmt;
use std::sync::{Arc, Weak};

/// Untyped device memory tagged with an element type
///
/// Storage wraps a [`DataPtr`] with reference counting, enabling zero-copy
/// views (transpose, narrow, etc.) that share the underlying buffer.
/// Cloning a `Storage` shares the buffer; the deleter runs exactly once,
/// when the last strong reference is dropped.
///
/// A resizable storage that was created by an allocator can grow or shrink
/// in place; every handle sharing it observes the new block.
#[derive(Clone)]
pub struct Storage {
    inner: Arc<StorageInner>,
}

/// Non-owning reference to a [`Storage`]
#[derive(Clone)]
pub struct WeakStorage {
    inner: Weak<StorageInner>,
}

struct StorageInner {
    dtype: DType,
    device: Device,
    resizable: bool,
    /// Allocator the block came from; `None` for adopted memory
    allocator: Option<Arc<dyn Allocator>>,
    buffer: RwLock<Buffer>,
}

struct Buffer {
    data: DataPtr,
    /// Number of elements (not bytes)
    numel: usize,
}

impl Storage {
    /// Allocate `numel` elements of `dtype` on `device`
    pub fn new(
        dtype: DType,
        numel: usize,
        device: Device,
        allocator: Arc<dyn Allocator>,
        resizable: bool,
    ) -> Result<Self> {
        if !dtype.is_defined() {
            return Err(Error::invalid_argument(
                "dtype",
                "storage cannot hold undefined elements",
            ));
        }
        let data = allocator.allocate(device, numel * dtype.size_in_bytes())?;
        Ok(Self {
            inner: Arc::new(StorageInner {
                dtype,
                device,
                resizable,
                allocator: Some(allocator),
                buffer: RwLock::new(Buffer { data, numel }),
            }),
        })
    }

    /// Adopt existing memory
    ///
    /// The storage takes ownership of `data`; its deleter (if any) runs when
    /// the last handle is dropped. Adopted storages have no allocator and so
    /// cannot be resized.
    pub fn from_data_ptr(dtype: DType, numel: usize, data: DataPtr) -> Result<Self> {
        if !dtype.is_defined() {
            return Err(Error::invalid_argument(
                "dtype",
                "storage cannot hold undefined elements",
            ));
        }
        let needed = numel * dtype.size_in_bytes();
        if data.nbytes() < needed {
            return Err(Error::invalid_argument(
                "data",
                format!(
                    "{} bytes cannot hold {numel} {dtype} elements",
                    data.nbytes()
                ),
            ));
        }
        Ok(Self {
            inner: Arc::new(StorageInner {
                dtype,
                device: data.device(),
                resizable: false,
                allocator: None,
                buffer: RwLock::new(Buffer { data, numel }),
            }),
        })
    }

    /// Element type
    #[inline]
    pub fn dtype(&self) -> DType {
        self.inner.dtype
    }

    /// Device where memory is allocated
    #[inline]
    pub fn device(&self) -> Device {
        self.inner.device
    }

    /// Whether [`Storage::resize`] is allowed
    #[inline]
    pub fn is_resizable(&self) -> bool {
        self.inner.resizable
    }

    /// The allocator backing this storage, if any
    pub fn allocator(&self) -> Option<&Arc<dyn Allocator>> {
        self.inner.allocator.as_ref()
    }

    /// Number of elements
    pub fn numel(&self) -> usize {
        self.inner.buffer.read().numel
    }

    /// Size in bytes of the addressable elements
    pub fn nbytes(&self) -> usize {
        self.numel() * self.inner.dtype.size_in_bytes()
    }

    /// Raw pointer to the first element (0 for an empty buffer)
    pub fn data_ptr(&self) -> u64 {
        self.inner.buffer.read().data.ptr()
    }

    /// Replace the backing block with one of `numel` elements
    ///
    /// The first `min(old, new)` elements are carried over. Handles that
    /// share this storage see the new block.
    ///
    /// The carry-over is a host memory copy, so device memory must be
    /// host-addressable, as it is for every platform in
    /// [`runtime::gpu`](crate::runtime::gpu).
    pub fn resize(&self, numel: usize) -> Result<()> {
        if !self.inner.resizable {
            return Err(Error::InvalidOperation(
                "Trying to resize storage that is not resizable".to_string(),
            ));
        }
        let Some(allocator) = &self.inner.allocator else {
            return Err(Error::InvalidOperation(
                "Trying to resize storage without an allocator".to_string(),
            ));
        };

        let elem = self.inner.dtype.size_in_bytes();
        let mut buffer = self.inner.buffer.write();
        if buffer.numel == numel {
            return Ok(());
        }
        let data = allocator.allocate(self.inner.device, numel * elem)?;
        let keep = buffer.numel.min(numel) * elem;
        if keep > 0 {
            // SAFETY: both blocks are host-addressable, hold at least `keep`
            // bytes, and are distinct allocations.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    buffer.data.ptr() as *const u8,
                    data.ptr() as *mut u8,
                    keep,
                );
            }
        }
        tracing::trace!(
            device = %self.inner.device,
            from = buffer.numel,
            to = numel,
            "storage resized"
        );
        // The old block is released here, after the copy
        *buffer = Buffer { data, numel };
        Ok(())
    }

    /// Number of strong handles sharing this buffer
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// Whether this is the only strong handle
    pub fn is_unique(&self) -> bool {
        Arc::strong_count(&self.inner) == 1
    }

    /// Create a weak reference that does not keep the buffer alive
    pub fn downgrade(&self) -> WeakStorage {
        WeakStorage {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Whether two handles share one buffer
    pub fn is_same(&self, other: &Storage) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl WeakStorage {
    /// Recover a strong handle if the buffer is still alive
    pub fn upgrade(&self) -> Option<Storage> {
        self.inner.upgrade().map(|inner| Storage { inner })
    }

    /// Whether the buffer has been released
    pub fn expired(&self) -> bool {
        self.inner.strong_count() == 0
    }
}

impl fmt::Debug for Storage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let buffer = self.inner.buffer.read();
        f.debug_struct("Storage")
            .field("ptr", &format_args!("0x{:x}", buffer.data.ptr()))
            .field("numel", &buffer.numel)
            .field("dtype", &self.inner.dtype)
            .field("device", &self.inner.device)
            .field("resizable", &self.inner.resizable)
            .field("refs", &Arc::strong_count(&self.inner))
            .finish()
    }
}

impl fmt::Debug for WeakStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakStorage")
            .field("expired", &self.expired())
            .finish()
    }
}
