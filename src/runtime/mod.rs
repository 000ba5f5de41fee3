//! Runtime memory and device management
//!
//! ```text
//! runtime
//! ├── Device / DeviceType    (where memory lives)
//! ├── Allocator / DataPtr    (how memory is obtained and released)
//! ├── AllocatorRegistry      (one allocator per device type)
//! ├── cpu                    (aligned host allocator + memory reporter)
//! └── gpu                    (device runtime state, streams, device allocators)
//! ```

mod allocator;
pub mod cpu;
mod device;
pub mod gpu;

pub use allocator::{Allocator, AllocatorRegistry, DataPtr, Deleter};
pub use device::{Device, DeviceType};
