//! Strided element loops over host-addressable buffers

use super::{Layout, Storage, Tensor};
use crate::dtype::{DType, Element, dispatch_dtype};
use crate::error::{Error, Result};

/// Copy `src` into `dst`, converting element types as needed
///
/// `src` either has `dst`'s shape, broadcasts to it, or has the same number
/// of elements (matched in row-major order). A source that overlaps the
/// destination's memory is staged first, so in-place shuffles such as
/// `t.copy_(&t.transpose(0, 1)?)` read the source values.
pub fn copy_strided(dst: &Tensor, src: &Tensor) -> Result<()> {
    let dst_layout = dst.layout()?;
    let src_layout = src.layout()?;
    if dst_layout.has_internal_overlap() {
        return Err(Error::unsupported(
            "copy_",
            "destination has elements that share memory",
        ));
    }

    let src_layout = if src_layout.shape() == dst_layout.shape() {
        src_layout
    } else if let Some(broadcast) = src_layout.broadcast_to(dst_layout.shape()) {
        broadcast
    } else if src_layout.elem_count() == dst_layout.elem_count() {
        src_layout
    } else {
        return Err(Error::shape_mismatch(dst_layout.shape(), src_layout.shape()));
    };

    let numel = dst_layout.elem_count();
    if numel == 0 {
        return Ok(());
    }

    let dst_storage = dst.storage()?;
    let src_storage = src.storage()?;
    let src_dtype = src_storage.dtype();
    let dst_dtype = dst_storage.dtype();
    let dst_ptr = dst_storage.data_ptr() as *mut u8;

    if dst_storage.is_same(&src_storage) && ranges_overlap(&dst_layout, &src_layout) {
        let staged = gather_bytes(&src_storage, &src_layout);
        let staged_layout = Layout::contiguous(&[numel]);
        // SAFETY: `staged` holds `numel` source elements and the destination
        // layout was bounds-checked against its storage at construction.
        return unsafe {
            copy_elements(
                staged.as_ptr(),
                &staged_layout,
                src_dtype,
                dst_ptr,
                &dst_layout,
                dst_dtype,
            )
        };
    }

    let src_ptr = src_storage.data_ptr() as *const u8;
    // SAFETY: both layouts were bounds-checked against their storages, and
    // the storages stay alive for the duration of the loop.
    unsafe {
        copy_elements(
            src_ptr,
            &src_layout,
            src_dtype,
            dst_ptr,
            &dst_layout,
            dst_dtype,
        )
    }
}

/// Set every element of `dst` to `value`
pub fn fill_strided(dst: &Tensor, value: f64) -> Result<()> {
    let layout = dst.layout()?;
    if layout.elem_count() == 0 {
        return Ok(());
    }
    let storage = dst.storage()?;
    let dtype = storage.dtype();
    let base = storage.data_ptr() as *mut u8;
    let value = normalize(value, dtype);

    dispatch_dtype!(dtype, T => {
        let v = T::from_f64(value);
        let size = std::mem::size_of::<T>() as isize;
        for offset in layout.offsets() {
            // SAFETY: offsets stay inside the bounds-checked layout
            unsafe { base.offset(offset * size).cast::<T>().write_unaligned(v) };
        }
    }, "fill_");
    Ok(())
}

/// Read every element of `tensor` in row-major order
pub fn read_elements<T: Element>(tensor: &Tensor) -> Result<Vec<T>> {
    let storage = tensor.storage()?;
    let dtype = storage.dtype();
    let compatible = T::DTYPE == dtype || (dtype == DType::Bool && T::DTYPE == DType::U8);
    if !compatible {
        return Err(Error::DTypeMismatch {
            lhs: dtype,
            rhs: T::DTYPE,
        });
    }
    let layout = tensor.layout()?;
    let base = storage.data_ptr() as *const u8;
    let size = std::mem::size_of::<T>() as isize;
    Ok(layout
        .offsets()
        // SAFETY: offsets stay inside the bounds-checked layout
        .map(|offset| unsafe { base.offset(offset * size).cast::<T>().read_unaligned() })
        .collect())
}

/// Write `data` into `tensor` in row-major order
pub fn write_elements<T: Element>(tensor: &Tensor, data: &[T]) -> Result<()> {
    let storage = tensor.storage()?;
    if storage.dtype() != T::DTYPE {
        return Err(Error::DTypeMismatch {
            lhs: storage.dtype(),
            rhs: T::DTYPE,
        });
    }
    let layout = tensor.layout()?;
    if layout.elem_count() != data.len() {
        return Err(Error::shape_mismatch(layout.shape(), &[data.len()]));
    }
    if layout.has_internal_overlap() {
        return Err(Error::unsupported(
            "write",
            "destination has elements that share memory",
        ));
    }
    let base = storage.data_ptr() as *mut u8;
    let size = std::mem::size_of::<T>() as isize;
    for (offset, &value) in layout.offsets().zip(data) {
        // SAFETY: offsets stay inside the bounds-checked layout
        unsafe { base.offset(offset * size).cast::<T>().write_unaligned(value) };
    }
    Ok(())
}

/// Elements of `tensor` as contiguous bytes, row-major
pub fn gather_tensor_bytes(tensor: &Tensor) -> Result<Vec<u8>> {
    Ok(gather_bytes(&tensor.storage()?, &tensor.layout()?))
}

/// Overwrite the elements of `tensor` with contiguous row-major bytes
pub fn scatter_tensor_bytes(tensor: &Tensor, bytes: &[u8]) -> Result<()> {
    let storage = tensor.storage()?;
    let layout = tensor.layout()?;
    let size = storage.dtype().size_in_bytes();
    if bytes.len() != layout.elem_count() * size {
        return Err(Error::invalid_argument(
            "bytes",
            format!(
                "expected {} bytes, got {}",
                layout.elem_count() * size,
                bytes.len()
            ),
        ));
    }
    if layout.elem_count() == 0 {
        return Ok(());
    }
    let staged_layout = Layout::contiguous(&[layout.elem_count()]);
    let dtype = storage.dtype();
    // SAFETY: `bytes` holds every element and the layout is bounds-checked
    unsafe {
        copy_elements(
            bytes.as_ptr(),
            &staged_layout,
            dtype,
            storage.data_ptr() as *mut u8,
            &layout,
            dtype,
        )
    }
}

fn gather_bytes(storage: &Storage, layout: &Layout) -> Vec<u8> {
    let size = storage.dtype().size_in_bytes();
    let base = storage.data_ptr() as *const u8;
    let mut out = vec![0u8; layout.elem_count() * size];
    if layout.is_contiguous() {
        if !out.is_empty() {
            // SAFETY: a contiguous layout addresses `out.len()` consecutive
            // bytes starting at its offset
            unsafe {
                std::ptr::copy_nonoverlapping(
                    base.add(layout.offset() * size),
                    out.as_mut_ptr(),
                    out.len(),
                )
            };
        }
        return out;
    }
    for (chunk, offset) in out.chunks_exact_mut(size).zip(layout.offsets()) {
        // SAFETY: offsets stay inside the bounds-checked layout
        unsafe {
            std::ptr::copy_nonoverlapping(
                base.offset(offset * size as isize),
                chunk.as_mut_ptr(),
                size,
            )
        };
    }
    out
}

fn ranges_overlap(a: &Layout, b: &Layout) -> bool {
    match (a.index_range(), b.index_range()) {
        (Some((a_lo, a_hi)), Some((b_lo, b_hi))) => a_lo <= b_hi && b_lo <= a_hi,
        _ => false,
    }
}

/// Booleans store 0 or 1
fn normalize(value: f64, dtype: DType) -> f64 {
    if dtype == DType::Bool {
        if value != 0.0 { 1.0 } else { 0.0 }
    } else {
        value
    }
}

/// # Safety
///
/// Every offset of `src_layout` and `dst_layout` must address a valid
/// element of the buffer behind `src` and `dst` respectively, and both
/// layouts must have the same number of elements.
unsafe fn copy_elements(
    src: *const u8,
    src_layout: &Layout,
    src_dtype: DType,
    dst: *mut u8,
    dst_layout: &Layout,
    dst_dtype: DType,
) -> Result<()> {
    if src_dtype == dst_dtype {
        let size = src_dtype.size_in_bytes();
        if src_layout.is_contiguous() && dst_layout.is_contiguous() {
            // Same element order on both sides: one memmove
            unsafe {
                std::ptr::copy(
                    src.add(src_layout.offset() * size),
                    dst.add(dst_layout.offset() * size),
                    dst_layout.elem_count() * size,
                )
            };
            return Ok(());
        }
        let size = size as isize;
        for (s, d) in src_layout.offsets().zip(dst_layout.offsets()) {
            unsafe {
                std::ptr::copy_nonoverlapping(
                    src.offset(s * size),
                    dst.offset(d * size),
                    size as usize,
                )
            };
        }
        return Ok(());
    }

    dispatch_dtype!(src_dtype, S => {
        dispatch_dtype!(dst_dtype, D => {
            let src_size = std::mem::size_of::<S>() as isize;
            let dst_size = std::mem::size_of::<D>() as isize;
            let src_is_bool = src_dtype == DType::Bool;
            for (s, d) in src_layout.offsets().zip(dst_layout.offsets()) {
                let mut value = unsafe { src.offset(s * src_size).cast::<S>().read_unaligned() }.to_f64();
                if src_is_bool {
                    value = normalize(value, DType::Bool);
                }
                let value = D::from_f64(normalize(value, dst_dtype));
                unsafe { dst.offset(d * dst_size).cast::<D>().write_unaligned(value) };
            }
        }, "copy_");
    }, "copy_");
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::dispatch::Context;
    use crate::dtype::DType;
    use crate::runtime::Device;
    use crate::tensor::Tensor;

    #[test]
    fn test_copy_transposed_source() {
        let ctx = Context::default();
        let src = Tensor::from_slice(&ctx, &[1i32, 2, 3, 4, 5, 6], &[2, 3], Device::cpu()).unwrap();
        let dst = Tensor::empty(&ctx, &[3, 2], DType::I32, Device::cpu()).unwrap();
        dst.copy_(&src.transpose(0, 1).unwrap()).unwrap();
        assert_eq!(dst.to_vec::<i32>().unwrap(), vec![1, 4, 2, 5, 3, 6]);
    }

    #[test]
    fn test_copy_converts_types() {
        let ctx = Context::default();
        let src = Tensor::from_slice(&ctx, &[1.7f64, -2.2, 0.0], &[3], Device::cpu()).unwrap();
        let ints = Tensor::empty(&ctx, &[3], DType::I32, Device::cpu()).unwrap();
        ints.copy_(&src).unwrap();
        assert_eq!(ints.to_vec::<i32>().unwrap(), vec![1, -2, 0]);

        let flags = Tensor::empty(&ctx, &[3], DType::Bool, Device::cpu()).unwrap();
        flags.copy_(&src).unwrap();
        assert_eq!(flags.to_vec::<u8>().unwrap(), vec![1, 1, 0]);
    }

    #[test]
    fn test_copy_broadcasts_source() {
        let ctx = Context::default();
        let row = Tensor::from_slice(&ctx, &[1.0f32, 2.0], &[2], Device::cpu()).unwrap();
        let dst = Tensor::zeros(&ctx, &[3, 2], DType::F32, Device::cpu()).unwrap();
        dst.copy_(&row).unwrap();
        assert_eq!(dst.to_vec::<f32>().unwrap(), vec![1.0, 2.0, 1.0, 2.0, 1.0, 2.0]);
    }

    #[test]
    fn test_copy_with_overlapping_source() {
        let ctx = Context::default();
        let t = Tensor::from_slice(&ctx, &[1i64, 2, 3, 4], &[2, 2], Device::cpu()).unwrap();
        t.copy_(&t.transpose(0, 1).unwrap()).unwrap();
        assert_eq!(t.to_vec::<i64>().unwrap(), vec![1, 3, 2, 4]);
    }

    #[test]
    fn test_copy_rejects_overlapping_destination() {
        let ctx = Context::default();
        let src = Tensor::zeros(&ctx, &[3], DType::F32, Device::cpu()).unwrap();
        let expanded = Tensor::zeros(&ctx, &[1], DType::F32, Device::cpu())
            .unwrap()
            .expand(&[3])
            .unwrap();
        assert!(expanded.copy_(&src).is_err());
    }

    #[test]
    fn test_copy_shape_mismatch() {
        let ctx = Context::default();
        let a = Tensor::zeros(&ctx, &[3], DType::F32, Device::cpu()).unwrap();
        let b = Tensor::zeros(&ctx, &[4], DType::F32, Device::cpu()).unwrap();
        assert!(a.copy_(&b).is_err());
    }

    #[test]
    fn test_fill_strided_view() {
        let ctx = Context::default();
        let t = Tensor::zeros(&ctx, &[2, 3], DType::I16, Device::cpu()).unwrap();
        t.narrow(1, 1, 1).unwrap().fill_(7.0).unwrap();
        assert_eq!(t.to_vec::<i16>().unwrap(), vec![0, 7, 0, 0, 7, 0]);
    }
}
