//! Tensor types
//!
//! This module provides the reference-counted `Tensor` handle, its shared
//! `Storage`, and the `Layout` geometry engine that maps logical indices to
//! storage elements.

pub mod copy;
mod core;
mod id;
mod layout;
mod storage;
mod weak;

pub use core::Tensor;
pub use id::TensorId;
pub use layout::{Layout, Offsets, Shape, Strides, broadcast_shapes};
pub use storage::{Storage, WeakStorage};
pub use weak::WeakTensor;
