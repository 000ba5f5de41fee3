//! GPU device runtime
//!
//! The [`DeviceRuntimeState`] is built once per context on first GPU use and
//! drives a [`DevicePlatform`]. Device memory handed out by this crate's
//! platforms is host-addressable, which is what lets the built-in strided
//! kernels operate on it; a hardware platform registers its own kernels.

mod allocator;
mod emulated;
mod platform;
mod state;
mod stream;

pub use allocator::{CachingDeviceAllocator, DeviceAllocator};
pub use emulated::{EmulatedPlatform, PlatformOp, StreamOp};
pub use platform::{
    BlasHandle, DevicePlatform, DeviceProperties, EventId, PlatformError, PlatformResult,
    SparseHandle, StreamId,
};
pub use state::{
    DEFAULT_RNG_SEED, DeviceErrorPolicy, DeviceRuntimeState, GeneratorState, MAX_PEER_GROUP,
    MIN_SCRATCH_SPACE_PER_DEVICE, MIN_SCRATCH_SPACE_PER_SM_STREAM, PeerAccess, ReclaimHook,
    scratch_space_for,
};
pub use stream::{Event, Stream, StreamGuard};
