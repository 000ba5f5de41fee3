//! Integration tests for the dispatch table and the device runtime
//!
//! GPU behavior runs against the host-backed `EmulatedPlatform`.

use std::sync::Arc;
use std::thread;
use tessera::config::ContextConfig;
use tessera::dispatch::{Backend, Context, OperatorTable};
use tessera::dtype::DType;
use tessera::error::Error;
use tessera::runtime::Device;
use tessera::runtime::gpu::{DeviceErrorPolicy, EmulatedPlatform, PeerAccess, PlatformOp};
use tessera::tensor::Tensor;

fn gpu_context(devices: usize) -> (Arc<EmulatedPlatform>, Arc<Context>) {
    let platform = Arc::new(EmulatedPlatform::new(devices));
    let config = ContextConfig::default()
        .with_platform(platform.clone())
        .with_device_error_policy(DeviceErrorPolicy::Propagate);
    (platform, Arc::new(Context::new(config)))
}

#[test]
fn test_undefined_cell_is_one_sentinel() {
    let (_, gpu_ctx) = gpu_context(1);
    let contexts = [Context::default(), Context::default()];

    let mut seen = Vec::new();
    for ctx in contexts.iter().chain([gpu_ctx.as_ref()]) {
        // Materialize unrelated cells first to vary call order
        ctx.get_operator_table(Backend::Cpu, DType::F32).unwrap();
        seen.push(ctx.get_operator_table(Backend::Undefined, DType::Undefined).unwrap());
        seen.push(ctx.get_operator_table(Backend::Cpu, DType::Undefined).unwrap());
        seen.push(ctx.get_operator_table(Backend::Undefined, DType::I64).unwrap());
    }
    for table in seen {
        let table = table.expect("sentinel is always present");
        assert!(Arc::ptr_eq(&table, OperatorTable::undefined()));
        assert!(table.is_undefined());
    }
}

#[test]
fn test_dispatch_miss_is_distinct_from_undefined() {
    let ctx = Context::default();
    let err = ctx
        .get_operator_table_checked(Backend::Cuda, DType::F32)
        .unwrap_err();
    assert_eq!(
        err,
        Error::TypeNotEnabled {
            backend: Backend::Cuda,
            dtype: DType::F32
        }
    );
    assert!(matches!(
        Tensor::zeros(&ctx, &[2], DType::F32, Device::cuda(0)),
        Err(Error::TypeNotEnabled { .. })
    ));
}

#[test]
fn test_gpu_init_is_lazy_and_runs_once() {
    let (platform, ctx) = gpu_context(2);
    Tensor::zeros(&ctx, &[3], DType::F32, Device::cpu()).unwrap();
    assert_eq!(platform.calls(PlatformOp::DeviceCount), 0);

    thread::scope(|scope| {
        for _ in 0..8 {
            scope.spawn(|| {
                ctx.get_operator_table_checked(Backend::Cuda, DType::F64)
                    .unwrap();
            });
        }
    });
    assert_eq!(platform.calls(PlatformOp::DeviceCount), 1);
    assert!(ctx.device_state().is_some());
}

#[test]
fn test_gpu_tensor_round_trip_and_cross_device_copy() {
    let (platform, ctx) = gpu_context(2);
    let host = Tensor::from_slice(&ctx, &[1.0f32, 2.0, 3.0, 4.0], &[2, 2], Device::cpu()).unwrap();
    let on_gpu = Tensor::empty(&ctx, &[2, 2], DType::F32, Device::cuda(1)).unwrap();
    on_gpu.copy_(&host.transpose(0, 1).unwrap()).unwrap();
    assert_eq!(on_gpu.to_vec::<f32>().unwrap(), vec![1.0, 3.0, 2.0, 4.0]);
    assert!(platform.bytes_in_use(1) >= 16);

    let back = Tensor::zeros(&ctx, &[4], DType::F64, Device::cpu()).unwrap();
    back.copy_(&on_gpu).unwrap();
    assert_eq!(back.to_vec::<f64>().unwrap(), vec![1.0, 3.0, 2.0, 4.0]);
}

#[test]
fn test_peer_access_is_memoized() {
    let (platform, ctx) = gpu_context(2);
    let state = Arc::clone(ctx.lazy_init_gpu().unwrap().unwrap());
    assert_eq!(state.peer_access_entry(0, 1).unwrap(), PeerAccess::Unknown);

    let first = state.peer_access(0, 1).unwrap();
    assert_eq!(platform.calls(PlatformOp::CanAccessPeer), 1);
    let second = state.peer_access(0, 1).unwrap();
    assert_eq!(platform.calls(PlatformOp::CanAccessPeer), 1);
    assert_eq!(first, second);
    assert!(first);
    assert!(platform.is_peer_enabled(0, 1));
}

#[test]
fn test_denied_peer_is_memoized_as_disallowed() {
    let platform = Arc::new(EmulatedPlatform::new(2).deny_peer(1, 0));
    let ctx = Context::new(
        ContextConfig::default()
            .with_platform(platform.clone())
            .with_device_error_policy(DeviceErrorPolicy::Propagate),
    );
    let state = ctx.lazy_init_gpu().unwrap().unwrap();
    assert!(!state.peer_access(1, 0).unwrap());
    assert!(!state.peer_access(1, 0).unwrap());
    assert_eq!(platform.calls(PlatformOp::CanAccessPeer), 1);
    assert_eq!(state.peer_access_entry(1, 0).unwrap(), PeerAccess::Disallowed);
    assert!(matches!(
        state.set_peer_access(1, 0, true),
        Err(Error::Unsupported { .. })
    ));
}

#[test]
fn test_device_failure_propagates_under_propagate_policy() {
    let (platform, ctx) = gpu_context(1);
    let state = ctx.lazy_init_gpu().unwrap().unwrap();
    platform.fail_next(PlatformOp::CreateStream, 700);
    let err = state.create_stream(0).unwrap_err();
    assert!(matches!(err, Error::Device { code: 700, .. }), "{err}");
    // The next call goes through
    assert!(state.create_stream(0).is_ok());
}
