//! Kernel tables registered per backend

use crate::error::Result;
use crate::tensor::{Tensor, copy};

/// Element kernels a backend provides to its dispatch cells
///
/// Operator libraries register one table per backend with
/// [`Context::register_kernels`](super::Context::register_kernels) before
/// the backend's first cell is materialized. Every cell of the backend
/// shares the table, so implementations dispatch on the tensors' element
/// types themselves.
pub trait KernelTable: Send + Sync {
    /// Name used in logs and `Debug` output
    fn name(&self) -> &str;

    /// Element-wise copy from `src` into `dst`
    ///
    /// `src` must have as many elements as `dst` or broadcast to its shape.
    /// Element types may differ.
    fn copy(&self, dst: &Tensor, src: &Tensor) -> Result<()>;

    /// Set every element of `dst` to `value`, converted to its element type
    fn fill(&self, dst: &Tensor, value: f64) -> Result<()>;
}

/// Generic strided loops over host-addressable memory
///
/// Registered by default for the dense CPU backend, and for the dense GPU
/// backend when the device runtime comes up with none registered.
#[derive(Clone, Copy, Debug, Default)]
pub struct StridedKernels;

impl KernelTable for StridedKernels {
    fn name(&self) -> &str {
        "strided"
    }

    fn copy(&self, dst: &Tensor, src: &Tensor) -> Result<()> {
        copy::copy_strided(dst, src)
    }

    fn fill(&self, dst: &Tensor, value: f64) -> Result<()> {
        copy::fill_strided(dst, value)
    }
}
