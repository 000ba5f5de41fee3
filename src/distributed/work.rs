//! Handles to submitted collective and point-to-point operations

use super::transport::{PostedRecv, UnboundBuffer};
use crate::error::{Error, Result};
use crate::runtime::gpu::{DeviceRuntimeState, Event};
use crate::tensor::Tensor;
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::Arc;

/// Handle to an operation submitted to a [`ProcessGroup`](super::ProcessGroup)
///
/// Failures are captured on the handle; [`wait`](Work::wait) reports whether
/// the operation succeeded and [`exception`](Work::exception) returns the
/// error.
pub trait Work: Send + Sync {
    /// Whether the operation finished, successfully or not
    fn is_completed(&self) -> bool;

    /// Whether the operation has not failed
    fn is_success(&self) -> bool;

    /// Block until the operation finishes; returns success
    ///
    /// On success, GPU work also makes the caller's current streams wait for
    /// the operation's completion events.
    fn wait(&self) -> bool;

    /// Make the caller's current streams wait for the operation
    fn synchronize(&self) -> Result<()>;

    /// The captured failure, if any
    fn exception(&self) -> Option<Error>;

    /// Rank a receive got its message from, once it completed
    fn source_rank(&self) -> Option<usize> {
        None
    }
}

/// Events recorded on an entry's private streams when its run succeeded
pub(crate) struct GpuCompletion {
    pub(crate) runtime: Arc<DeviceRuntimeState>,
    pub(crate) devices: Vec<usize>,
    pub(crate) events: Vec<Event>,
}

#[derive(Default)]
struct WorkState {
    completed: bool,
    error: Option<Error>,
    gpu: Option<GpuCompletion>,
}

/// Work handle of a queued collective
#[derive(Default)]
pub struct CollectiveWork {
    state: Mutex<WorkState>,
    done: Condvar,
}

impl CollectiveWork {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn finish(&self, gpu: Option<GpuCompletion>) {
        {
            let mut state = self.state.lock();
            state.completed = true;
            state.gpu = gpu;
        }
        self.done.notify_all();
    }

    pub(crate) fn finish_with_error(&self, error: Error) {
        {
            let mut state = self.state.lock();
            state.completed = true;
            state.error = Some(error);
        }
        self.done.notify_all();
    }
}

impl Work for CollectiveWork {
    fn is_completed(&self) -> bool {
        self.state.lock().completed
    }

    fn is_success(&self) -> bool {
        self.state.lock().error.is_none()
    }

    fn wait(&self) -> bool {
        let success = {
            let mut state = self.state.lock();
            while !state.completed {
                self.done.wait(&mut state);
            }
            state.error.is_none()
        };
        if !success {
            return false;
        }
        match self.synchronize() {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(error = %err, "failed to order current streams after collective");
                self.state.lock().error = Some(err);
                false
            }
        }
    }

    fn synchronize(&self) -> Result<()> {
        let state = self.state.lock();
        if let Some(gpu) = &state.gpu {
            for (&device, event) in gpu.devices.iter().zip(&gpu.events) {
                event.block(gpu.runtime.current_stream(device))?;
            }
        }
        Ok(())
    }

    fn exception(&self) -> Option<Error> {
        self.state.lock().error.clone()
    }
}

impl fmt::Debug for CollectiveWork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("CollectiveWork")
            .field("completed", &state.completed)
            .field("error", &state.error)
            .field("gpu", &state.gpu.is_some())
            .finish()
    }
}

/// Work handle of a send
///
/// Messages are queued at the destination on submission, so the handle is
/// complete from the start. It keeps the tensor alive for the caller.
#[derive(Debug)]
pub struct SendWork {
    _tensor: Tensor,
}

impl SendWork {
    pub(crate) fn new(tensor: Tensor) -> Self {
        Self { _tensor: tensor }
    }
}

impl Work for SendWork {
    fn is_completed(&self) -> bool {
        true
    }

    fn is_success(&self) -> bool {
        true
    }

    fn wait(&self) -> bool {
        true
    }

    fn synchronize(&self) -> Result<()> {
        Ok(())
    }

    fn exception(&self) -> Option<Error> {
        None
    }
}

/// Work handle of a receive
///
/// The receive is posted when the handle is created, so it claims messages
/// in posting order. [`wait`](Work::wait) blocks for the message and copies
/// it into the tensor.
pub struct RecvWork {
    buffer: UnboundBuffer,
    posted: Arc<PostedRecv>,
    outcome: Mutex<Option<Result<usize>>>,
}

impl RecvWork {
    pub(crate) fn post(buffer: UnboundBuffer, srcs: &[usize], tag: u32) -> Result<Self> {
        let posted = buffer.post_recv(srcs, tag)?;
        Ok(Self {
            buffer,
            posted,
            outcome: Mutex::new(None),
        })
    }

    /// Land the message in the tensor once the receive completed
    fn settle(&self) -> Option<Result<usize>> {
        if !self.posted.is_ready() {
            return None;
        }
        let mut outcome = self.outcome.lock();
        Some(
            outcome
                .get_or_insert_with(|| self.buffer.land(self.posted.wait()))
                .clone(),
        )
    }
}

impl Work for RecvWork {
    fn is_completed(&self) -> bool {
        self.posted.is_ready()
    }

    fn is_success(&self) -> bool {
        !matches!(self.settle(), Some(Err(_)))
    }

    fn wait(&self) -> bool {
        let mut outcome = self.outcome.lock();
        outcome
            .get_or_insert_with(|| self.buffer.land(self.posted.wait()))
            .is_ok()
    }

    fn synchronize(&self) -> Result<()> {
        Ok(())
    }

    fn exception(&self) -> Option<Error> {
        self.settle().and_then(Result::err)
    }

    fn source_rank(&self) -> Option<usize> {
        self.settle().and_then(Result::ok)
    }
}

impl fmt::Debug for RecvWork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecvWork")
            .field("buffer", &self.buffer)
            .field("posted", &self.posted)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_wait_blocks_until_finish() {
        let work = CollectiveWork::new();
        assert!(!work.is_completed());
        let finisher = {
            let work = Arc::clone(&work);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                work.finish(None);
            })
        };
        assert!(work.wait());
        assert!(work.is_completed());
        assert!(work.exception().is_none());
        finisher.join().unwrap();
    }

    #[test]
    fn test_failure_is_captured() {
        let work = CollectiveWork::new();
        work.finish_with_error(Error::collective("peer went away"));
        assert!(!work.wait());
        assert!(!work.is_success());
        // Queryable any number of times
        assert_eq!(work.exception(), Some(Error::collective("peer went away")));
        assert_eq!(work.exception(), Some(Error::collective("peer went away")));
    }
}
