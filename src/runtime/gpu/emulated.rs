//! A device platform backed by host memory
//!
//! `EmulatedPlatform` behaves like a small multi-GPU machine: device memory is
//! real (host) memory with a per-device capacity, handles/streams/events are
//! tracked so leaks are visible, and every call is counted. Tests use it to
//! observe how the runtime drives the platform and to inject failures.

use super::platform::{
    BlasHandle, DevicePlatform, DeviceProperties, EventId, PlatformError, PlatformResult,
    SparseHandle, StreamId,
};
use crate::runtime::cpu::{host_alloc, host_free};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

/// Platform calls, used to count calls and to inject failures
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum PlatformOp {
    /// `device_count`
    DeviceCount,
    /// `properties`
    Properties,
    /// `can_access_peer`
    CanAccessPeer,
    /// `enable_peer_access`
    EnablePeerAccess,
    /// `disable_peer_access`
    DisablePeerAccess,
    /// `create_blas_handle`
    CreateBlasHandle,
    /// `destroy_blas_handle`
    DestroyBlasHandle,
    /// `create_sparse_handle`
    CreateSparseHandle,
    /// `destroy_sparse_handle`
    DestroySparseHandle,
    /// `create_stream`
    CreateStream,
    /// `destroy_stream`
    DestroyStream,
    /// `create_event`
    CreateEvent,
    /// `destroy_event`
    DestroyEvent,
    /// `record_event`
    RecordEvent,
    /// `stream_wait_event`
    StreamWaitEvent,
    /// `synchronize_stream`
    SynchronizeStream,
    /// `malloc`
    Malloc,
    /// `free`
    Free,
}

/// Stream-ordering calls, in the order the platform received them
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StreamOp {
    /// `event` recorded on `stream`
    Record {
        /// Device ordinal
        device: usize,
        /// Recorded event
        event: EventId,
        /// Stream the event was recorded on
        stream: StreamId,
    },
    /// `stream` made to wait on `event`
    Wait {
        /// Device ordinal
        device: usize,
        /// Waiting stream
        stream: StreamId,
        /// Awaited event
        event: EventId,
    },
    /// Host blocked on `stream`
    Synchronize {
        /// Device ordinal
        device: usize,
        /// Synchronized stream
        stream: StreamId,
    },
}

const DEFAULT_MULTIPROCESSORS: usize = 8;
const DEFAULT_MEMORY: usize = 1 << 30;

/// Host-memory-backed multi-device platform
#[derive(Debug)]
pub struct EmulatedPlatform {
    device_count: usize,
    multiprocessor_count: usize,
    memory_per_device: usize,
    peer_denied: HashSet<(usize, usize)>,
    next_id: AtomicU64,
    state: Mutex<EmulatedState>,
}

#[derive(Debug, Default)]
struct EmulatedState {
    calls: HashMap<PlatformOp, usize>,
    failures: HashMap<PlatformOp, i32>,
    used: Vec<usize>,
    allocations: HashMap<u64, (usize, usize)>,
    peers_enabled: HashSet<(usize, usize)>,
    blas: HashSet<u64>,
    sparse: HashSet<u64>,
    streams: HashSet<u64>,
    events: HashSet<u64>,
    log: Vec<StreamOp>,
}

impl EmulatedPlatform {
    /// Create a platform with `device_count` devices
    pub fn new(device_count: usize) -> Self {
        Self {
            device_count,
            multiprocessor_count: DEFAULT_MULTIPROCESSORS,
            memory_per_device: DEFAULT_MEMORY,
            peer_denied: HashSet::new(),
            next_id: AtomicU64::new(1),
            state: Mutex::new(EmulatedState {
                used: vec![0; device_count],
                ..Default::default()
            }),
        }
    }

    /// Set the multiprocessor count reported for every device
    pub fn with_multiprocessors(mut self, count: usize) -> Self {
        self.multiprocessor_count = count;
        self
    }

    /// Set the memory capacity of every device
    pub fn with_memory_per_device(mut self, bytes: usize) -> Self {
        self.memory_per_device = bytes;
        self
    }

    /// Report that `device` cannot access `peer`
    pub fn deny_peer(mut self, device: usize, peer: usize) -> Self {
        self.peer_denied.insert((device, peer));
        self
    }

    /// Make the next call of `op` fail with `code`
    pub fn fail_next(&self, op: PlatformOp, code: i32) {
        self.state.lock().failures.insert(op, code);
    }

    /// Number of times `op` has been called
    pub fn calls(&self, op: PlatformOp) -> usize {
        self.state.lock().calls.get(&op).copied().unwrap_or(0)
    }

    /// Stream-ordering calls received so far
    pub fn stream_log(&self) -> Vec<StreamOp> {
        self.state.lock().log.clone()
    }

    /// BLAS handles created and not yet destroyed
    pub fn live_blas_handles(&self) -> usize {
        self.state.lock().blas.len()
    }

    /// Sparse handles created and not yet destroyed
    pub fn live_sparse_handles(&self) -> usize {
        self.state.lock().sparse.len()
    }

    /// Streams created and not yet destroyed
    pub fn live_streams(&self) -> usize {
        self.state.lock().streams.len()
    }

    /// Events created and not yet destroyed
    pub fn live_events(&self) -> usize {
        self.state.lock().events.len()
    }

    /// Device allocations not yet freed
    pub fn live_allocations(&self) -> usize {
        self.state.lock().allocations.len()
    }

    /// Bytes allocated on `device`
    pub fn bytes_in_use(&self, device: usize) -> usize {
        self.state.lock().used.get(device).copied().unwrap_or(0)
    }

    /// Returns true if peer access from `device` to `peer` is enabled
    pub fn is_peer_enabled(&self, device: usize, peer: usize) -> bool {
        self.state.lock().peers_enabled.contains(&(device, peer))
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Count the call and apply an injected failure
    fn enter(&self, op: PlatformOp) -> PlatformResult<parking_lot::MutexGuard<'_, EmulatedState>> {
        let mut state = self.state.lock();
        *state.calls.entry(op).or_insert(0) += 1;
        match state.failures.remove(&op) {
            Some(code) => Err(PlatformError::new(code, format!("injected failure in {op:?}"))),
            None => Ok(state),
        }
    }

    fn check_device(&self, device: usize) -> PlatformResult<()> {
        if device < self.device_count {
            Ok(())
        } else {
            Err(PlatformError::new(
                PlatformError::INVALID_DEVICE,
                format!("invalid device ordinal {device}"),
            ))
        }
    }
}

fn invalid_handle(what: &str, id: u64) -> PlatformError {
    PlatformError::new(PlatformError::INVALID_HANDLE, format!("invalid {what} {id}"))
}

fn check_stream(state: &EmulatedState, stream: StreamId) -> PlatformResult<()> {
    if stream == StreamId::DEFAULT || state.streams.contains(&stream.0) {
        Ok(())
    } else {
        Err(invalid_handle("stream", stream.0))
    }
}

impl DevicePlatform for EmulatedPlatform {
    fn name(&self) -> &str {
        "emulated"
    }

    fn device_count(&self) -> PlatformResult<usize> {
        self.enter(PlatformOp::DeviceCount)?;
        Ok(self.device_count)
    }

    fn properties(&self, device: usize) -> PlatformResult<DeviceProperties> {
        self.enter(PlatformOp::Properties)?;
        self.check_device(device)?;
        Ok(DeviceProperties {
            name: format!("Emulated Device {device}"),
            multiprocessor_count: self.multiprocessor_count,
            total_memory: self.memory_per_device,
        })
    }

    fn can_access_peer(&self, device: usize, peer: usize) -> PlatformResult<bool> {
        self.enter(PlatformOp::CanAccessPeer)?;
        self.check_device(device)?;
        self.check_device(peer)?;
        Ok(device != peer && !self.peer_denied.contains(&(device, peer)))
    }

    fn enable_peer_access(&self, device: usize, peer: usize) -> PlatformResult<()> {
        let mut state = self.enter(PlatformOp::EnablePeerAccess)?;
        self.check_device(device)?;
        self.check_device(peer)?;
        if device == peer || self.peer_denied.contains(&(device, peer)) {
            return Err(PlatformError::new(
                PlatformError::PEER_ACCESS_UNSUPPORTED,
                "peer access is not supported between these devices",
            ));
        }
        if !state.peers_enabled.insert((device, peer)) {
            return Err(PlatformError::new(
                PlatformError::PEER_ACCESS_ALREADY_ENABLED,
                "peer access is already enabled",
            ));
        }
        Ok(())
    }

    fn disable_peer_access(&self, device: usize, peer: usize) -> PlatformResult<()> {
        let mut state = self.enter(PlatformOp::DisablePeerAccess)?;
        if !state.peers_enabled.remove(&(device, peer)) {
            return Err(PlatformError::new(
                PlatformError::PEER_ACCESS_NOT_ENABLED,
                "peer access has not been enabled",
            ));
        }
        Ok(())
    }

    fn create_blas_handle(&self, device: usize) -> PlatformResult<BlasHandle> {
        let mut state = self.enter(PlatformOp::CreateBlasHandle)?;
        self.check_device(device)?;
        let id = self.next_id();
        state.blas.insert(id);
        Ok(BlasHandle(id))
    }

    fn destroy_blas_handle(&self, _device: usize, handle: BlasHandle) -> PlatformResult<()> {
        let mut state = self.enter(PlatformOp::DestroyBlasHandle)?;
        if state.blas.remove(&handle.0) {
            Ok(())
        } else {
            Err(invalid_handle("blas handle", handle.0))
        }
    }

    fn create_sparse_handle(&self, device: usize) -> PlatformResult<SparseHandle> {
        let mut state = self.enter(PlatformOp::CreateSparseHandle)?;
        self.check_device(device)?;
        let id = self.next_id();
        state.sparse.insert(id);
        Ok(SparseHandle(id))
    }

    fn destroy_sparse_handle(&self, _device: usize, handle: SparseHandle) -> PlatformResult<()> {
        let mut state = self.enter(PlatformOp::DestroySparseHandle)?;
        if state.sparse.remove(&handle.0) {
            Ok(())
        } else {
            Err(invalid_handle("sparse handle", handle.0))
        }
    }

    fn create_stream(&self, device: usize) -> PlatformResult<StreamId> {
        let mut state = self.enter(PlatformOp::CreateStream)?;
        self.check_device(device)?;
        let id = self.next_id();
        state.streams.insert(id);
        Ok(StreamId(id))
    }

    fn destroy_stream(&self, _device: usize, stream: StreamId) -> PlatformResult<()> {
        let mut state = self.enter(PlatformOp::DestroyStream)?;
        if state.streams.remove(&stream.0) {
            Ok(())
        } else {
            Err(invalid_handle("stream", stream.0))
        }
    }

    fn create_event(&self, device: usize) -> PlatformResult<EventId> {
        let mut state = self.enter(PlatformOp::CreateEvent)?;
        self.check_device(device)?;
        let id = self.next_id();
        state.events.insert(id);
        Ok(EventId(id))
    }

    fn destroy_event(&self, _device: usize, event: EventId) -> PlatformResult<()> {
        let mut state = self.enter(PlatformOp::DestroyEvent)?;
        if state.events.remove(&event.0) {
            Ok(())
        } else {
            Err(invalid_handle("event", event.0))
        }
    }

    fn record_event(
        &self,
        device: usize,
        event: EventId,
        stream: StreamId,
    ) -> PlatformResult<()> {
        let mut state = self.enter(PlatformOp::RecordEvent)?;
        check_stream(&state, stream)?;
        if !state.events.contains(&event.0) {
            return Err(invalid_handle("event", event.0));
        }
        state.log.push(StreamOp::Record {
            device,
            event,
            stream,
        });
        Ok(())
    }

    fn stream_wait_event(
        &self,
        device: usize,
        stream: StreamId,
        event: EventId,
    ) -> PlatformResult<()> {
        let mut state = self.enter(PlatformOp::StreamWaitEvent)?;
        check_stream(&state, stream)?;
        if !state.events.contains(&event.0) {
            return Err(invalid_handle("event", event.0));
        }
        state.log.push(StreamOp::Wait {
            device,
            stream,
            event,
        });
        Ok(())
    }

    fn synchronize_stream(&self, device: usize, stream: StreamId) -> PlatformResult<()> {
        let mut state = self.enter(PlatformOp::SynchronizeStream)?;
        check_stream(&state, stream)?;
        state.log.push(StreamOp::Synchronize { device, stream });
        Ok(())
    }

    fn malloc(&self, device: usize, nbytes: usize) -> PlatformResult<u64> {
        let mut state = self.enter(PlatformOp::Malloc)?;
        self.check_device(device)?;
        let out_of_memory = || {
            PlatformError::new(
                PlatformError::OUT_OF_MEMORY,
                format!("out of memory allocating {nbytes} bytes on device {device}"),
            )
        };
        if state.used[device] + nbytes > self.memory_per_device {
            return Err(out_of_memory());
        }
        let ptr = host_alloc(nbytes.max(1), true).ok_or_else(out_of_memory)?;
        state.used[device] += nbytes;
        state.allocations.insert(ptr, (device, nbytes));
        Ok(ptr)
    }

    fn free(&self, _device: usize, ptr: u64) -> PlatformResult<()> {
        let mut state = self.enter(PlatformOp::Free)?;
        let (device, nbytes) = state
            .allocations
            .remove(&ptr)
            .ok_or_else(|| invalid_handle("device pointer", ptr))?;
        state.used[device] -= nbytes;
        host_free(ptr, nbytes.max(1));
        Ok(())
    }
}

impl Drop for EmulatedPlatform {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        for (ptr, (_, nbytes)) in state.allocations.drain() {
            host_free(ptr, nbytes.max(1));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_capacity_is_enforced() {
        let platform = EmulatedPlatform::new(1).with_memory_per_device(1024);
        let a = platform.malloc(0, 1000).unwrap();
        let err = platform.malloc(0, 100).unwrap_err();
        assert!(err.is_out_of_memory());
        platform.free(0, a).unwrap();
        assert_eq!(platform.bytes_in_use(0), 0);
        assert!(platform.malloc(0, 100).is_ok());
    }

    #[test]
    fn test_injected_failure_fires_once() {
        let platform = EmulatedPlatform::new(1);
        platform.fail_next(PlatformOp::CreateStream, 999);
        assert_eq!(platform.create_stream(0).unwrap_err().code, 999);
        assert!(platform.create_stream(0).is_ok());
        assert_eq!(platform.calls(PlatformOp::CreateStream), 2);
    }

    #[test]
    fn test_peer_enable_twice_reports_already_enabled() {
        let platform = EmulatedPlatform::new(2);
        platform.enable_peer_access(0, 1).unwrap();
        let err = platform.enable_peer_access(0, 1).unwrap_err();
        assert_eq!(err.code, PlatformError::PEER_ACCESS_ALREADY_ENABLED);
    }

    #[test]
    fn test_stream_ops_are_logged() {
        let platform = EmulatedPlatform::new(1);
        let stream = platform.create_stream(0).unwrap();
        let event = platform.create_event(0).unwrap();
        platform.record_event(0, event, StreamId::DEFAULT).unwrap();
        platform.stream_wait_event(0, stream, event).unwrap();
        assert_eq!(
            platform.stream_log(),
            vec![
                StreamOp::Record {
                    device: 0,
                    event,
                    stream: StreamId::DEFAULT
                },
                StreamOp::Wait {
                    device: 0,
                    stream,
                    event
                },
            ]
        );
    }
}
