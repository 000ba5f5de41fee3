//! Element trait for mapping Rust types to DType

use super::DType;
use bytemuck::{Pod, Zeroable};
use std::ops::{Add, Mul};

/// Trait for types that can be elements of a typed view over a buffer
///
/// This trait connects Rust's type system to the runtime dtype tag.
/// `bool` has no implementation: boolean buffers are read and written as `u8`.
///
/// # Bounds
/// - `Pod + Zeroable` - raw bytes in a buffer can be viewed as `Self` (bytemuck)
/// - `Add + Mul + PartialOrd` - what the collective reductions need
pub trait Element:
    Copy + Send + Sync + Pod + Zeroable + 'static + Add<Output = Self> + Mul<Output = Self> + PartialOrd
{
    /// The corresponding DType for this Rust type
    const DTYPE: DType;

    /// Convert to f64 for dtype-converting copies
    fn to_f64(self) -> f64;

    /// Convert from f64 to this type (saturating for integers)
    fn from_f64(v: f64) -> Self;

    /// Zero value
    fn zero() -> Self;
}

macro_rules! impl_element {
    ($($t:ty => $dtype:ident),* $(,)?) => {
        $(
            impl Element for $t {
                const DTYPE: DType = DType::$dtype;

                #[inline]
                fn to_f64(self) -> f64 {
                    self as f64
                }

                #[inline]
                fn from_f64(v: f64) -> Self {
                    v as $t
                }

                #[inline]
                fn zero() -> Self {
                    0 as $t
                }
            }
        )*
    };
}

impl_element!(
    f64 => F64,
    f32 => F32,
    i64 => I64,
    i32 => I32,
    i16 => I16,
    i8 => I8,
    u8 => U8,
);

#[cfg(feature = "f16")]
impl Element for half::f16 {
    const DTYPE: DType = DType::F16;

    #[inline]
    fn to_f64(self) -> f64 {
        self.to_f64()
    }

    #[inline]
    fn from_f64(v: f64) -> Self {
        half::f16::from_f64(v)
    }

    #[inline]
    fn zero() -> Self {
        half::f16::ZERO
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_element_dtype() {
        assert_eq!(f64::DTYPE, DType::F64);
        assert_eq!(f32::DTYPE, DType::F32);
        assert_eq!(i32::DTYPE, DType::I32);
        assert_eq!(u8::DTYPE, DType::U8);
    }

    #[test]
    fn test_element_conversions() {
        assert_eq!(f32::from_f64(2.5).to_f64(), 2.5);
        assert_eq!(i32::from_f64(42.0), 42);
        // `as` casts saturate
        assert_eq!(i8::from_f64(1000.0), i8::MAX);
        assert_eq!(u8::from_f64(-3.0), 0);
    }

    #[cfg(feature = "f16")]
    #[test]
    fn test_f16_element() {
        assert_eq!(half::f16::DTYPE, DType::F16);
        assert_eq!(half::f16::from_f64(1.5).to_f64(), 1.5);
    }
}
