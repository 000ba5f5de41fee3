//! # tessera
//!
//! **Reference-counted, type-erased ndarray runtime with backend dispatch and
//! asynchronous collectives.**
//!
//! tessera is the core an array library sits on: memory, geometry, dispatch
//! and device state, without any math kernels of its own beyond strided copy
//! and fill.
//!
//! ## Components
//!
//! - **Storage & allocators**: type-tagged, reference-counted buffers; one
//!   pluggable allocator per device type
//! - **Layout**: sizes/strides/offset geometry with view, reshape, resize,
//!   transpose, narrow, squeeze, expand
//! - **Tensor**: shared handle with an undefined state and weak references
//! - **Dispatch**: lazily populated (backend × dtype) table of operator
//!   tables, with one-time GPU runtime initialization
//! - **GPU runtime**: streams, events, peer access, handle pools and RNG
//!   state over a pluggable [`DevicePlatform`](runtime::gpu::DevicePlatform)
//! - **Distributed**: process groups with a worker pool, an algorithm cache,
//!   broadcast, allreduce, barrier, send and recv
//!
//! ## Quick Start
//!
//! ```
//! use tessera::prelude::*;
//!
//! let ctx = Context::default();
//! let t = Tensor::zeros(&ctx, &[2, 3], DType::F32, Device::cpu())?;
//! let v = t.view(&[3, 2])?;
//! v.fill_(1.5)?;
//! assert_eq!(t.to_vec::<f32>()?, vec![1.5; 6]);
//! # Ok::<(), tessera::error::Error>(())
//! ```
//!
//! ## Feature Flags
//!
//! - `rayon` (default): parallel reductions in collectives, global pool sizing
//! - `f16` (default): half-precision elements

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_inception)]

pub mod config;
pub mod dispatch;
pub mod distributed;
pub mod dtype;
pub mod error;
pub mod runtime;
pub mod tensor;

pub use config::{ContextConfig, init};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::ContextConfig;
    pub use crate::dispatch::{Backend, Context, DispatchKey, OperatorTable, global_context};
    pub use crate::distributed::{
        AllreduceOptions, BroadcastOptions, ProcessGroup, ProcessGroupMesh, ProcessGroupOptions,
        ReduceOp, Work,
    };
    pub use crate::dtype::{DType, Element};
    pub use crate::error::{Error, Result};
    pub use crate::runtime::{Allocator, Device, DeviceType};
    pub use crate::tensor::{Layout, Tensor, WeakTensor};
}
