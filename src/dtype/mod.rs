//! Element types for tessera buffers
//!
//! Buffers are untyped; every storage and tensor carries a [`DType`] tag and
//! code that needs typed access reaches it through [`dispatch_dtype!`], which
//! matches exhaustively so a new element type fails to compile until every
//! dispatch site handles it.

mod dispatch;
mod element;

pub(crate) use dispatch::dispatch_dtype;
pub use element::Element;

use std::fmt;

/// Element types stored in tessera buffers
///
/// # Discriminant Values
///
/// The discriminant values are stable:
/// - Floats: 0-9 (F64=0, F32=1, F16=2)
/// - Signed ints: 10-19 (I64=10, I32=11, I16=12, I8=13)
/// - Unsigned ints: 20-29 (U8=23)
/// - Bool: 30
/// - Undefined: 255
///
/// `Undefined` is the element type of the undefined tensor and of the
/// sentinel dispatch cell. It has no size and can never back a storage.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[non_exhaustive]
#[repr(u8)]
pub enum DType {
    /// 64-bit floating point
    F64 = 0,
    /// 32-bit floating point
    F32 = 1,
    /// 16-bit floating point (IEEE 754)
    F16 = 2,
    /// 64-bit signed integer
    I64 = 10,
    /// 32-bit signed integer
    I32 = 11,
    /// 16-bit signed integer
    I16 = 12,
    /// 8-bit signed integer
    I8 = 13,
    /// 8-bit unsigned integer
    U8 = 23,
    /// Boolean stored as one byte
    Bool = 30,
    /// No element type
    Undefined = 255,
}

impl DType {
    /// Number of element types, `Undefined` included
    pub const COUNT: usize = 10;

    /// Every defined element type
    pub const ALL: [DType; 9] = [
        DType::F64,
        DType::F32,
        DType::F16,
        DType::I64,
        DType::I32,
        DType::I16,
        DType::I8,
        DType::U8,
        DType::Bool,
    ];

    /// Size of one element in bytes
    #[inline]
    pub const fn size_in_bytes(self) -> usize {
        match self {
            Self::F64 | Self::I64 => 8,
            Self::F32 | Self::I32 => 4,
            Self::F16 | Self::I16 => 2,
            Self::I8 | Self::U8 | Self::Bool => 1,
            Self::Undefined => 0,
        }
    }

    /// Dense position of this type in a dispatch table row
    #[inline]
    pub const fn index(self) -> usize {
        match self {
            Self::F64 => 0,
            Self::F32 => 1,
            Self::F16 => 2,
            Self::I64 => 3,
            Self::I32 => 4,
            Self::I16 => 5,
            Self::I8 => 6,
            Self::U8 => 7,
            Self::Bool => 8,
            Self::Undefined => 9,
        }
    }

    /// Returns false only for `Undefined`
    #[inline]
    pub const fn is_defined(self) -> bool {
        !matches!(self, Self::Undefined)
    }

    /// Returns true if this is a floating point type
    #[inline]
    pub const fn is_float(self) -> bool {
        matches!(self, Self::F64 | Self::F32 | Self::F16)
    }

    /// Returns true if this is an integer type
    #[inline]
    pub const fn is_int(self) -> bool {
        matches!(self, Self::I64 | Self::I32 | Self::I16 | Self::I8 | Self::U8)
    }

    /// Returns true if this is the boolean type
    #[inline]
    pub const fn is_bool(self) -> bool {
        matches!(self, Self::Bool)
    }

    /// Short name for display (e.g., "f32", "i64")
    pub const fn short_name(self) -> &'static str {
        match self {
            Self::F64 => "f64",
            Self::F32 => "f32",
            Self::F16 => "f16",
            Self::I64 => "i64",
            Self::I32 => "i32",
            Self::I16 => "i16",
            Self::I8 => "i8",
            Self::U8 => "u8",
            Self::Bool => "bool",
            Self::Undefined => "undefined",
        }
    }

    /// Scalar name used when naming operator tables (e.g. "Float" in `CPUFloatType`)
    pub const fn scalar_name(self) -> &'static str {
        match self {
            Self::F64 => "Double",
            Self::F32 => "Float",
            Self::F16 => "Half",
            Self::I64 => "Long",
            Self::I32 => "Int",
            Self::I16 => "Short",
            Self::I8 => "Char",
            Self::U8 => "Byte",
            Self::Bool => "Bool",
            Self::Undefined => "Undefined",
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.short_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dtype_sizes() {
        assert_eq!(DType::F64.size_in_bytes(), 8);
        assert_eq!(DType::F32.size_in_bytes(), 4);
        assert_eq!(DType::F16.size_in_bytes(), 2);
        assert_eq!(DType::Bool.size_in_bytes(), 1);
        assert_eq!(DType::Undefined.size_in_bytes(), 0);
    }

    #[test]
    fn test_table_indices_are_dense() {
        let mut seen = [false; DType::COUNT];
        for dtype in DType::ALL.iter().copied().chain([DType::Undefined]) {
            assert!(!seen[dtype.index()], "duplicate index for {dtype}");
            seen[dtype.index()] = true;
        }
        assert!(seen.iter().all(|&s| s));
    }

    #[test]
    fn test_undefined_is_not_in_all() {
        assert!(!DType::ALL.contains(&DType::Undefined));
        assert!(!DType::Undefined.is_defined());
    }
}
