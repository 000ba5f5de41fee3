//! Owned streams and events, and the thread-local current stream

use super::DeviceRuntimeState;
use super::platform::{EventId, StreamId};
use crate::error::Result;
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::Arc;

thread_local! {
    /// (runtime state id, device) -> stream this thread submits to
    static CURRENT_STREAMS: RefCell<HashMap<(u64, usize), StreamId>> =
        RefCell::new(HashMap::new());
}

pub(super) fn current_stream(state_id: u64, device: usize) -> StreamId {
    CURRENT_STREAMS.with(|streams| {
        streams
            .borrow()
            .get(&(state_id, device))
            .copied()
            .unwrap_or(StreamId::DEFAULT)
    })
}

pub(super) fn set_current_stream(state_id: u64, device: usize, stream: StreamId) -> StreamId {
    CURRENT_STREAMS.with(|streams| {
        let mut streams = streams.borrow_mut();
        let previous = if stream == StreamId::DEFAULT {
            streams.remove(&(state_id, device))
        } else {
            streams.insert((state_id, device), stream)
        };
        previous.unwrap_or(StreamId::DEFAULT)
    })
}

/// A non-default stream, destroyed on drop
pub struct Stream {
    id: StreamId,
    device: usize,
    state: Arc<DeviceRuntimeState>,
}

impl Stream {
    pub(super) fn new(id: StreamId, device: usize, state: Arc<DeviceRuntimeState>) -> Self {
        Self { id, device, state }
    }

    /// Platform stream id
    #[inline]
    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Device ordinal
    #[inline]
    pub fn device(&self) -> usize {
        self.device
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        let result = self.state.platform().destroy_stream(self.device, self.id);
        self.state.warn_on_failure("destroy_stream", result);
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.id)
            .field("device", &self.device)
            .finish()
    }
}

/// A synchronization event, destroyed on drop
pub struct Event {
    id: EventId,
    device: usize,
    state: Arc<DeviceRuntimeState>,
}

impl Event {
    pub(super) fn new(id: EventId, device: usize, state: Arc<DeviceRuntimeState>) -> Self {
        Self { id, device, state }
    }

    /// Platform event id
    #[inline]
    pub fn id(&self) -> EventId {
        self.id
    }

    /// Device ordinal
    #[inline]
    pub fn device(&self) -> usize {
        self.device
    }

    /// Record this event at the tail of `stream`
    pub fn record(&self, stream: StreamId) -> Result<()> {
        let result = self
            .state
            .platform()
            .record_event(self.device, self.id, stream);
        self.state.check("record_event", result)
    }

    /// Make `stream` wait for this event without blocking the host
    pub fn block(&self, stream: StreamId) -> Result<()> {
        let result = self
            .state
            .platform()
            .stream_wait_event(self.device, stream, self.id);
        self.state.check("stream_wait_event", result)
    }
}

impl Drop for Event {
    fn drop(&mut self) {
        let result = self.state.platform().destroy_event(self.device, self.id);
        self.state.warn_on_failure("destroy_event", result);
    }
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Event")
            .field("id", &self.id)
            .field("device", &self.device)
            .finish()
    }
}

/// Overrides the current stream of one device for the guard's lifetime
///
/// The previous stream is restored on drop. Guards must be dropped on the
/// thread that created them, in reverse order of creation.
pub struct StreamGuard {
    state_id: u64,
    device: usize,
    previous: StreamId,
}

impl StreamGuard {
    /// Make `stream` the current stream of `device` on this thread
    pub fn new(state: &DeviceRuntimeState, device: usize, stream: StreamId) -> Self {
        let previous = set_current_stream(state.id(), device, stream);
        Self {
            state_id: state.id(),
            device,
            previous,
        }
    }

    /// The stream that was current before this guard
    pub fn previous(&self) -> StreamId {
        self.previous
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        set_current_stream(self.state_id, self.device, self.previous);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::gpu::{DeviceErrorPolicy, EmulatedPlatform};

    fn runtime(devices: usize) -> Arc<DeviceRuntimeState> {
        DeviceRuntimeState::init(
            Arc::new(EmulatedPlatform::new(devices)),
            DeviceErrorPolicy::Propagate,
        )
        .unwrap()
    }

    #[test]
    fn test_current_stream_is_per_thread_and_per_state() {
        let state = runtime(2);
        let other_state = runtime(2);
        let stream = state.create_stream(1).unwrap();
        assert_eq!(state.current_stream(1), StreamId::DEFAULT);

        state.set_current_stream(1, stream.id()).unwrap();
        assert_eq!(state.current_stream(1), stream.id());
        assert_eq!(state.current_stream(0), StreamId::DEFAULT);
        assert_eq!(other_state.current_stream(1), StreamId::DEFAULT);

        let shared = Arc::clone(&state);
        let seen = std::thread::spawn(move || shared.current_stream(1))
            .join()
            .unwrap();
        assert_eq!(seen, StreamId::DEFAULT);

        assert!(state.set_current_stream(2, stream.id()).is_err());
        state.set_current_stream(1, StreamId::DEFAULT).unwrap();
        assert_eq!(state.current_stream(1), StreamId::DEFAULT);
    }

    #[test]
    fn test_nested_guards_restore_previous_streams() {
        let state = runtime(1);
        let outer_stream = state.create_stream(0).unwrap();
        let inner_stream = state.create_stream(0).unwrap();
        {
            let outer = StreamGuard::new(&state, 0, outer_stream.id());
            assert_eq!(outer.previous(), StreamId::DEFAULT);
            assert_eq!(state.current_stream(0), outer_stream.id());
            {
                let inner = StreamGuard::new(&state, 0, inner_stream.id());
                assert_eq!(inner.previous(), outer_stream.id());
                assert_eq!(state.current_stream(0), inner_stream.id());
            }
            assert_eq!(state.current_stream(0), outer_stream.id());

            // Overriding with the default stream is restored too
            {
                let _default = StreamGuard::new(&state, 0, StreamId::DEFAULT);
                assert_eq!(state.current_stream(0), StreamId::DEFAULT);
            }
            assert_eq!(state.current_stream(0), outer_stream.id());
        }
        assert_eq!(state.current_stream(0), StreamId::DEFAULT);
    }
}
