//! The device platform seam
//!
//! [`DevicePlatform`] is the small set of driver calls the device runtime
//! state needs. A hardware backend implements it over its driver; the crate
//! ships [`EmulatedPlatform`](super::EmulatedPlatform), which backs devices
//! with host memory.

use std::fmt;
use thiserror::Error;

/// Result of a platform call
pub type PlatformResult<T> = std::result::Result<T, PlatformError>;

/// A failed platform call: a numeric code plus the driver's message
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message} (code {code})")]
pub struct PlatformError {
    /// Driver error code
    pub code: i32,
    /// Driver message
    pub message: String,
}

impl PlatformError {
    /// Out of device memory
    pub const OUT_OF_MEMORY: i32 = 2;
    /// Device ordinal out of range
    pub const INVALID_DEVICE: i32 = 101;
    /// Handle or resource is not valid
    pub const INVALID_HANDLE: i32 = 400;
    /// The pair of devices cannot access each other
    pub const PEER_ACCESS_UNSUPPORTED: i32 = 217;
    /// Peer access was already enabled for the pair
    pub const PEER_ACCESS_ALREADY_ENABLED: i32 = 704;
    /// Peer access was not enabled for the pair
    pub const PEER_ACCESS_NOT_ENABLED: i32 = 705;

    /// Create a platform error
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Returns true for out-of-memory failures
    pub fn is_out_of_memory(&self) -> bool {
        self.code == Self::OUT_OF_MEMORY
    }
}

/// Snapshot of a device's properties, taken once at init
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceProperties {
    /// Marketing name
    pub name: String,
    /// Number of streaming multiprocessors
    pub multiprocessor_count: usize,
    /// Total device memory in bytes
    pub total_memory: usize,
}

macro_rules! platform_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }
    };
}

platform_handle!(
    /// A compute stream; `StreamId::DEFAULT` is each device's default stream
    StreamId
);
platform_handle!(
    /// A synchronization event
    EventId
);
platform_handle!(
    /// A dense linear-algebra library handle
    BlasHandle
);
platform_handle!(
    /// A sparse linear-algebra library handle
    SparseHandle
);

impl StreamId {
    /// Each device's default stream
    pub const DEFAULT: StreamId = StreamId(0);
}

/// Driver calls used by [`DeviceRuntimeState`](super::DeviceRuntimeState)
///
/// Every method is a thin wrapper over one driver call. Device ordinals are
/// zero-based and always smaller than [`device_count`](Self::device_count).
pub trait DevicePlatform: Send + Sync + fmt::Debug {
    /// Human-readable platform name
    fn name(&self) -> &str;

    /// Number of visible devices
    fn device_count(&self) -> PlatformResult<usize>;

    /// Properties of `device`
    fn properties(&self, device: usize) -> PlatformResult<DeviceProperties>;

    /// Whether `device` is able to map `peer`'s memory
    fn can_access_peer(&self, device: usize, peer: usize) -> PlatformResult<bool>;

    /// Let `device` access `peer`'s memory
    fn enable_peer_access(&self, device: usize, peer: usize) -> PlatformResult<()>;

    /// Revoke `device`'s access to `peer`'s memory
    fn disable_peer_access(&self, device: usize, peer: usize) -> PlatformResult<()>;

    /// Create a BLAS handle bound to `device`
    fn create_blas_handle(&self, device: usize) -> PlatformResult<BlasHandle>;

    /// Destroy a BLAS handle
    fn destroy_blas_handle(&self, device: usize, handle: BlasHandle) -> PlatformResult<()>;

    /// Create a sparse handle bound to `device`
    fn create_sparse_handle(&self, device: usize) -> PlatformResult<SparseHandle>;

    /// Destroy a sparse handle
    fn destroy_sparse_handle(&self, device: usize, handle: SparseHandle) -> PlatformResult<()>;

    /// Create a non-default stream on `device`
    fn create_stream(&self, device: usize) -> PlatformResult<StreamId>;

    /// Destroy a stream created by [`create_stream`](Self::create_stream)
    fn destroy_stream(&self, device: usize, stream: StreamId) -> PlatformResult<()>;

    /// Create an event on `device`
    fn create_event(&self, device: usize) -> PlatformResult<EventId>;

    /// Destroy an event
    fn destroy_event(&self, device: usize, event: EventId) -> PlatformResult<()>;

    /// Record `event` at the current tail of `stream`
    fn record_event(&self, device: usize, event: EventId, stream: StreamId)
    -> PlatformResult<()>;

    /// Make future work on `stream` wait until `event` has completed
    fn stream_wait_event(
        &self,
        device: usize,
        stream: StreamId,
        event: EventId,
    ) -> PlatformResult<()>;

    /// Block the host until all work on `stream` has completed
    fn synchronize_stream(&self, device: usize, stream: StreamId) -> PlatformResult<()>;

    /// Allocate `nbytes` of device memory
    fn malloc(&self, device: usize, nbytes: usize) -> PlatformResult<u64>;

    /// Release device memory
    fn free(&self, device: usize, ptr: u64) -> PlatformResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = PlatformError::new(PlatformError::OUT_OF_MEMORY, "out of memory");
        assert_eq!(err.to_string(), "out of memory (code 2)");
        assert!(err.is_out_of_memory());
    }

    #[test]
    fn test_handle_display() {
        assert_eq!(StreamId::DEFAULT.to_string(), "StreamId(0)");
        assert_eq!(BlasHandle(7).to_string(), "BlasHandle(7)");
    }
}
