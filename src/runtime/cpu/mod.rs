//! Host memory
//!
//! Host buffers are 64-byte aligned so vectorized kernels can use aligned loads.

mod allocator;
mod reporter;

pub use allocator::CpuAllocator;
pub use reporter::MemoryReporter;

pub(crate) use allocator::{host_alloc, host_free};
