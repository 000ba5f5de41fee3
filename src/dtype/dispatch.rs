//! Exhaustive runtime-to-compile-time element type dispatch

/// Macro for dtype dispatch to typed operations
///
/// Binds `$T` to the Rust type backing `$dtype` and evaluates `$body`.
/// `Bool` is backed by `u8`. `F16` needs the `f16` feature; without it, and
/// for `Undefined`, the enclosing function returns `UnsupportedDType`.
/// The enclosing function must return `Result<_>`.
macro_rules! dispatch_dtype {
    ($dtype:expr, $T:ident => $body:block, $error_op:expr) => {
        match $dtype {
            $crate::dtype::DType::F64 => {
                type $T = f64;
                $body
            }
            $crate::dtype::DType::F32 => {
                type $T = f32;
                $body
            }
            $crate::dtype::DType::F16 => {
                #[cfg(feature = "f16")]
                {
                    type $T = half::f16;
                    $body
                }
                #[cfg(not(feature = "f16"))]
                {
                    return Err($crate::error::Error::UnsupportedDType {
                        dtype: $dtype,
                        op: $error_op,
                    });
                }
            }
            $crate::dtype::DType::I64 => {
                type $T = i64;
                $body
            }
            $crate::dtype::DType::I32 => {
                type $T = i32;
                $body
            }
            $crate::dtype::DType::I16 => {
                type $T = i16;
                $body
            }
            $crate::dtype::DType::I8 => {
                type $T = i8;
                $body
            }
            $crate::dtype::DType::U8 | $crate::dtype::DType::Bool => {
                type $T = u8;
                $body
            }
            $crate::dtype::DType::Undefined => {
                return Err($crate::error::Error::UnsupportedDType {
                    dtype: $dtype,
                    op: $error_op,
                });
            }
        }
    };
}

pub(crate) use dispatch_dtype;

#[cfg(test)]
mod tests {
    use crate::dtype::{DType, Element};
    use crate::error::{Error, Result};

    fn element_size(dtype: DType) -> Result<usize> {
        dispatch_dtype!(dtype, T => { Ok(std::mem::size_of::<T>()) }, "element_size")
    }

    #[test]
    fn test_dispatch_matches_dtype_size() {
        for dtype in DType::ALL {
            #[cfg(not(feature = "f16"))]
            if dtype == DType::F16 {
                continue;
            }
            assert_eq!(element_size(dtype).unwrap(), dtype.size_in_bytes());
        }
    }

    #[test]
    fn test_dispatch_rejects_undefined() {
        let err = element_size(DType::Undefined).unwrap_err();
        assert!(matches!(err, Error::UnsupportedDType { .. }));
    }

    #[test]
    fn test_dispatch_binds_element_type() {
        fn dtype_of(dtype: DType) -> Result<DType> {
            dispatch_dtype!(dtype, T => { Ok(<T as Element>::DTYPE) }, "dtype_of")
        }
        assert_eq!(dtype_of(DType::I32).unwrap(), DType::I32);
        // Bool shares the byte representation
        assert_eq!(dtype_of(DType::Bool).unwrap(), DType::U8);
    }
}
