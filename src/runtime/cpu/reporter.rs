//! Live-byte accounting for host allocations

use parking_lot::Mutex;
use std::collections::HashMap;

/// Tracks every live host allocation and the running byte total
///
/// Reporting is diagnostic only: it never changes what the allocator returns.
#[derive(Debug, Default)]
pub struct MemoryReporter {
    inner: Mutex<ReporterInner>,
}

#[derive(Debug, Default)]
struct ReporterInner {
    sizes: HashMap<u64, usize>,
    allocated: usize,
}

impl MemoryReporter {
    /// Create an empty reporter
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new allocation
    pub fn new_allocation(&self, ptr: u64, nbytes: usize) {
        let mut inner = self.inner.lock();
        inner.sizes.insert(ptr, nbytes);
        inner.allocated += nbytes;
        tracing::debug!(
            ptr = format_args!("0x{ptr:x}"),
            nbytes,
            total = inner.allocated,
            "cpu allocation"
        );
    }

    /// Record a release
    pub fn free(&self, ptr: u64) {
        let mut inner = self.inner.lock();
        match inner.sizes.remove(&ptr) {
            Some(nbytes) => {
                inner.allocated -= nbytes;
                tracing::debug!(
                    ptr = format_args!("0x{ptr:x}"),
                    nbytes,
                    total = inner.allocated,
                    "cpu free"
                );
            }
            // Memory allocated before reporting was switched on
            None => tracing::warn!(
                ptr = format_args!("0x{ptr:x}"),
                "freed a pointer the memory reporter never saw"
            ),
        }
    }

    /// Bytes currently allocated
    pub fn live_bytes(&self) -> usize {
        self.inner.lock().allocated
    }

    /// Number of live allocations
    pub fn live_allocations(&self) -> usize {
        self.inner.lock().sizes.len()
    }
}
