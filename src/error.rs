//! Error types for tessera

use crate::dispatch::Backend;
use crate::dtype::DType;
use crate::runtime::Device;
use std::time::Duration;
use thiserror::Error;

/// Result type alias using tessera's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in tessera operations
///
/// `Error` is `Clone` so that a failure captured by a background collective
/// can be handed out by [`Work::exception`](crate::distributed::Work::exception)
/// any number of times.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// The allocator could not satisfy a request
    #[error("Out of memory: failed to allocate {size} bytes on {device}")]
    OutOfMemory {
        /// Requested size in bytes
        size: usize,
        /// Device the allocation targeted
        device: Device,
    },

    /// Shape mismatch in an operation
    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        /// Expected shape
        expected: Vec<usize>,
        /// Actual shape
        got: Vec<usize>,
    },

    /// Size and stride vectors have different lengths
    #[error("Stride mismatch: {sizes} sizes but {strides} strides")]
    StrideMismatch {
        /// Number of sizes
        sizes: usize,
        /// Number of strides
        strides: usize,
    },

    /// A geometry addresses elements outside its storage
    #[error(
        "Out of bounds: geometry needs {required} elements but storage holds {available}"
    )]
    OutOfBounds {
        /// Elements the geometry can reach (offset included)
        required: usize,
        /// Elements available in the storage
        available: usize,
    },

    /// A view cannot be expressed over the existing strides
    #[error("View of shape {from:?} as {to:?} is not representable without a copy")]
    UnrepresentableView {
        /// Source shape
        from: Vec<usize>,
        /// Requested shape
        to: Vec<usize>,
    },

    /// Invalid dimension index
    #[error("Invalid dimension {dim} for tensor with {ndim} dimensions")]
    InvalidDimension {
        /// The invalid dimension
        dim: isize,
        /// Number of dimensions
        ndim: usize,
    },

    /// An accessor was called on a handle with no storage
    #[error("{op} called on undefined Tensor")]
    UndefinedTensor {
        /// Name of the accessor
        op: &'static str,
    },

    /// The dispatch table has no cell for this combination
    #[error("{backend}{}Type is not enabled", .dtype.scalar_name())]
    TypeNotEnabled {
        /// Requested backend
        backend: Backend,
        /// Requested element type
        dtype: DType,
    },

    /// Unsupported dtype for an operation
    #[error("Unsupported dtype {dtype:?} for operation '{op}'")]
    UnsupportedDType {
        /// The unsupported dtype
        dtype: DType,
        /// The operation name
        op: &'static str,
    },

    /// DType mismatch between operands
    #[error("DType mismatch: {lhs:?} vs {rhs:?}")]
    DTypeMismatch {
        /// Left-hand side dtype
        lhs: DType,
        /// Right-hand side dtype
        rhs: DType,
    },

    /// Device mismatch between operands
    #[error("Device mismatch: {lhs} vs {rhs}")]
    DeviceMismatch {
        /// Left-hand side device
        lhs: Device,
        /// Right-hand side device
        rhs: Device,
    },

    /// The device platform reported a failure
    #[error("Device error {code} in {op}: {message}")]
    Device {
        /// Platform error code
        code: i32,
        /// Failing platform call
        op: &'static str,
        /// Platform message
        message: String,
    },

    /// A collective or point-to-point transfer failed
    #[error("Collective error: {0}")]
    Collective(String),

    /// Operation is valid in general but not supported here
    #[error("Unsupported operation {operation}: {reason}")]
    Unsupported {
        /// The operation being attempted
        operation: &'static str,
        /// Why it is unsupported
        reason: String,
    },

    /// Invalid argument provided to an operation
    #[error("Invalid argument '{arg}': {reason}")]
    InvalidArgument {
        /// The argument name
        arg: &'static str,
        /// Reason for invalidity
        reason: String,
    },

    /// Operation is not allowed in the object's current state
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// A rendezvous did not complete in time
    #[error("Timed out after {after:?} waiting for {what}")]
    Timeout {
        /// What was being waited for
        what: String,
        /// The timeout that elapsed
        after: Duration,
    },

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a shape mismatch error
    pub fn shape_mismatch(expected: &[usize], got: &[usize]) -> Self {
        Self::ShapeMismatch {
            expected: expected.to_vec(),
            got: got.to_vec(),
        }
    }

    /// Create an unsupported dtype error
    pub fn unsupported_dtype(dtype: DType, op: &'static str) -> Self {
        Self::UnsupportedDType { dtype, op }
    }

    /// Create an undefined-tensor error for the named accessor
    pub fn undefined(op: &'static str) -> Self {
        Self::UndefinedTensor { op }
    }

    /// Create an invalid argument error
    pub fn invalid_argument(arg: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            arg,
            reason: reason.into(),
        }
    }

    /// Create an unsupported operation error
    pub fn unsupported(operation: &'static str, reason: impl Into<String>) -> Self {
        Self::Unsupported {
            operation,
            reason: reason.into(),
        }
    }

    /// Create a collective failure
    pub fn collective(message: impl Into<String>) -> Self {
        Self::Collective(message.into())
    }

    /// Returns true if this is an allocation failure
    pub fn is_out_of_memory(&self) -> bool {
        matches!(self, Self::OutOfMemory { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_undefined_message_names_accessor() {
        let err = Error::undefined("sizes");
        assert_eq!(err.to_string(), "sizes called on undefined Tensor");
    }

    #[test]
    fn test_type_not_enabled_message() {
        let err = Error::TypeNotEnabled {
            backend: Backend::Cuda,
            dtype: DType::F32,
        };
        assert_eq!(err.to_string(), "CUDAFloatType is not enabled");
    }
}
