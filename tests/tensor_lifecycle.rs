//! Integration tests for tensor ownership, aliasing and geometry
//!
//! Buffers come from a counting allocator so that frees and reallocations
//! are observable.

mod common;

use common::CountingAllocator;
use std::sync::Arc;
use tessera::dispatch::{Backend, Context, OperatorTable};
use tessera::dtype::DType;
use tessera::error::Error;
use tessera::runtime::Device;
use tessera::tensor::{Layout, Tensor};

fn counting_context() -> (CountingAllocator, Context) {
    let ctx = Context::default();
    let allocator = CountingAllocator::new();
    ctx.set_allocator(Arc::new(allocator.clone()));
    (allocator, ctx)
}

#[test]
fn test_buffer_freed_once_after_last_handle() {
    let (allocator, ctx) = counting_context();
    let a = Tensor::zeros(&ctx, &[4, 4], DType::F32, Device::cpu()).unwrap();
    assert_eq!(allocator.allocations(), 1);

    let b = a.clone();
    let c = a.transpose(0, 1).unwrap();
    let d = c.narrow(0, 1, 2).unwrap();
    let weak = a.downgrade();

    drop(a);
    drop(c);
    assert_eq!(allocator.frees(), 0);
    drop(b);
    assert_eq!(allocator.frees(), 0);
    assert!(weak.lock().is_none());
    drop(d);
    assert_eq!(allocator.frees(), 1);
    assert_eq!(allocator.live(), 0);
}

#[test]
fn test_view_aliasing_both_ways() {
    let (allocator, ctx) = counting_context();
    let t1 = Tensor::from_slice(&ctx, &[0i32, 1, 2, 3, 4, 5], &[2, 3], Device::cpu()).unwrap();
    let t2 = t1.view(&[3, 2]).unwrap();
    assert!(t2.shares_storage(&t1));

    t2.narrow(0, 2, 1).unwrap().fill_(9.0).unwrap();
    assert_eq!(t1.to_vec::<i32>().unwrap(), vec![0, 1, 2, 3, 9, 9]);

    t1.narrow(1, 0, 1).unwrap().fill_(-1.0).unwrap();
    assert_eq!(t2.to_vec::<i32>().unwrap(), vec![-1, 1, 2, -1, 9, 9]);

    drop(t1);
    assert_eq!(allocator.frees(), 0);
    assert_eq!(t2.to_vec::<i32>().unwrap()[0], -1);
    drop(t2);
    assert_eq!(allocator.frees(), 1);
}

#[test]
fn test_reshape_round_trip_restores_contiguous_strides() {
    let ctx = Context::default();
    let shapes: [(&[usize], &[usize]); 4] = [
        (&[2, 3, 4], &[6, 4]),
        (&[24], &[2, 3, 4]),
        (&[1, 5, 1], &[5]),
        (&[0, 3], &[3, 0]),
    ];
    for (original, other) in shapes {
        let t = Tensor::empty(&ctx, original, DType::F64, Device::cpu()).unwrap();
        let back = t.reshape(other).unwrap().reshape(original).unwrap();
        assert!(back.shares_storage(&t));
        assert_eq!(
            back.strides().unwrap().as_slice(),
            Layout::contiguous(original).strides(),
            "{original:?} -> {other:?}"
        );
    }
}

#[test]
fn test_reshape_of_non_viewable_tensor_copies() {
    let ctx = Context::default();
    let t = Tensor::from_slice(&ctx, &[1u8, 2, 3, 4, 5, 6], &[2, 3], Device::cpu()).unwrap();
    let transposed = t.transpose(0, 1).unwrap();
    assert!(matches!(
        transposed.view(&[6]),
        Err(Error::UnrepresentableView { .. })
    ));
    let flat = transposed.reshape(&[6]).unwrap();
    assert!(!flat.shares_storage(&t));
    assert_eq!(flat.to_vec::<u8>().unwrap(), vec![1, 4, 2, 5, 3, 6]);
}

#[test]
fn test_resize_to_same_geometry_is_a_no_op() {
    let (allocator, ctx) = counting_context();
    let t = Tensor::from_slice(&ctx, &[1.0f64, 2.0, 3.0, 4.0], &[2, 2], Device::cpu()).unwrap();
    let ptr = t.data_ptr().unwrap();

    t.resize_(&[2, 2]).unwrap();
    t.resize_nd_(&[2, 2], Some(&[2, 1])).unwrap();
    assert_eq!(allocator.allocations(), 1);
    assert_eq!(t.data_ptr().unwrap(), ptr);
    assert_eq!(t.to_vec::<f64>().unwrap(), vec![1.0, 2.0, 3.0, 4.0]);
}

#[test]
fn test_resize_grows_storage_and_keeps_prefix() {
    let (allocator, ctx) = counting_context();
    let t = Tensor::from_slice(&ctx, &[1i64, 2, 3], &[3], Device::cpu()).unwrap();
    let alias = t.clone();

    t.resize_(&[2, 4]).unwrap();
    assert_eq!(allocator.allocations(), 2);
    assert_eq!(allocator.live(), 1);
    // Clones share the geometry
    assert_eq!(alias.sizes().unwrap().as_slice(), &[2, 4]);
    assert_eq!(&t.to_vec::<i64>().unwrap()[..3], &[1, 2, 3]);

    // Shrinking keeps the buffer
    t.resize_(&[2]).unwrap();
    assert_eq!(allocator.allocations(), 2);
    assert_eq!(t.to_vec::<i64>().unwrap(), vec![1, 2]);
}

#[test]
fn test_undefined_handle_guard() {
    let t = Tensor::default();
    assert!(!t.defined());

    let undefined = |result: Result<(), Error>| {
        assert!(
            matches!(result, Err(Error::UndefinedTensor { .. })),
            "{result:?}"
        );
    };
    undefined(t.sizes().map(drop));
    undefined(t.strides().map(drop));
    undefined(t.numel().map(drop));
    undefined(t.dim().map(drop));
    undefined(t.storage().map(drop));
    undefined(t.storage_offset().map(drop));
    undefined(t.data_ptr().map(drop));
    undefined(t.device().map(drop));
    undefined(t.id().map(drop));
    undefined(t.view(&[1]).map(drop));
    undefined(t.transpose(0, 1).map(drop));
    undefined(t.resize_(&[2]));
    undefined(t.fill_(0.0));
    undefined(t.to_vec::<f32>().map(drop));

    // Metadata of the undefined handle comes from the sentinel table
    assert_eq!(t.dtype(), DType::Undefined);
    assert_eq!(t.backend(), Backend::Undefined);
    assert!(Arc::ptr_eq(t.table(), OperatorTable::undefined()));
    assert!(t.is_same(&Tensor::undefined()));
    assert_eq!(t.to_string(), "[ Tensor (undefined) ]");
}

#[test]
fn test_as_strided_checks_storage_bounds() {
    let ctx = Context::default();
    let t = Tensor::zeros(&ctx, &[6], DType::F32, Device::cpu()).unwrap();
    let window = t.as_strided(&[2, 2], &[1, 2], Some(1)).unwrap();
    assert_eq!(window.storage_offset().unwrap(), 1);
    assert!(matches!(
        t.as_strided(&[2, 3], &[3, 1], Some(1)),
        Err(Error::OutOfBounds { .. })
    ));
    assert!(matches!(
        t.as_strided(&[2, 3], &[1], None),
        Err(Error::StrideMismatch { .. })
    ));
}

#[test]
fn test_weak_tensor_tracks_strong_handles() {
    let ctx = Context::default();
    let t = Tensor::zeros(&ctx, &[2], DType::I32, Device::cpu()).unwrap();
    let weak = t.downgrade();
    assert_eq!(weak.use_count(), 1);

    let upgraded = weak.lock().unwrap();
    assert!(upgraded.is_same(&t));
    assert_eq!(t.use_count(), 2);
    drop(upgraded);
    drop(t);
    assert!(weak.expired());
    assert!(weak.lock().is_none());
}
