//! Cached algorithm entries

use super::{Algorithm, AlgorithmKey};
use crate::error::Result;
use crate::runtime::gpu::{Event, Stream};
use crate::tensor::Tensor;
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

static NEXT_ENTRY_ID: AtomicU64 = AtomicU64::new(1);

/// Work captured for one run of an entry's algorithm
pub(crate) type RunFn = Box<dyn FnOnce(&mut dyn Algorithm) -> Result<()> + Send>;

/// Mutable part of an entry, touched by one call at a time
#[derive(Default)]
pub(crate) struct EntryState {
    /// Built by a worker on first use
    pub(crate) algorithm: Option<Box<dyn Algorithm>>,
    /// Private copies of the caller's tensors
    pub(crate) staging: Vec<Tensor>,
    /// One private stream per device, GPU keys only
    pub(crate) streams: Vec<Stream>,
    /// One event per device ordering the public stream before the private one
    pub(crate) events: Vec<Event>,
    /// Set by the submitting call, taken by the worker
    pub(crate) run: Option<RunFn>,
}

/// A reusable constructed collective for one [`AlgorithmKey`]
///
/// An entry is busy from checkout until its work finishes; a second caller
/// checking out the same entry blocks until then.
pub struct AlgorithmEntry {
    id: u64,
    key: AlgorithmKey,
    busy: Mutex<bool>,
    released: Condvar,
    pub(crate) state: Mutex<EntryState>,
    constructions: AtomicUsize,
    runs: AtomicUsize,
}

impl AlgorithmEntry {
    pub(crate) fn new(key: AlgorithmKey, state: EntryState) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_ENTRY_ID.fetch_add(1, Ordering::Relaxed),
            key,
            busy: Mutex::new(false),
            released: Condvar::new(),
            state: Mutex::new(state),
            constructions: AtomicUsize::new(0),
            runs: AtomicUsize::new(0),
        })
    }

    /// Unique entry id
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The key this entry serves
    #[inline]
    pub fn key(&self) -> &AlgorithmKey {
        &self.key
    }

    /// Whether a call currently holds this entry
    pub fn is_busy(&self) -> bool {
        *self.busy.lock()
    }

    /// How many times an algorithm was built for this entry
    pub fn constructions(&self) -> usize {
        self.constructions.load(Ordering::Relaxed)
    }

    /// How many runs this entry completed, successful or not
    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::Relaxed)
    }

    pub(crate) fn record_construction(&self) {
        self.constructions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_run(&self) {
        self.runs.fetch_add(1, Ordering::Relaxed);
    }

    /// Block until the entry is free, then mark it busy
    pub(crate) fn acquire(self: &Arc<Self>) -> EntryLease {
        let mut busy = self.busy.lock();
        while *busy {
            self.released.wait(&mut busy);
        }
        *busy = true;
        EntryLease {
            entry: Arc::clone(self),
        }
    }

    fn release(&self) {
        *self.busy.lock() = false;
        self.released.notify_one();
    }
}

impl fmt::Debug for AlgorithmEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlgorithmEntry")
            .field("id", &self.id)
            .field("collective", &self.key.collective)
            .field("busy", &self.is_busy())
            .field("runs", &self.runs())
            .finish()
    }
}

/// Exclusive hold on an entry, released on drop
pub(crate) struct EntryLease {
    entry: Arc<AlgorithmEntry>,
}

impl EntryLease {
    #[inline]
    pub(crate) fn entry(&self) -> &Arc<AlgorithmEntry> {
        &self.entry
    }
}

impl Drop for EntryLease {
    fn drop(&mut self) {
        self.entry.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_acquire_blocks_until_release() {
        let entry = AlgorithmEntry::new(AlgorithmKey::barrier(), EntryState::default());
        let lease = entry.acquire();
        assert!(entry.is_busy());

        let acquired = Arc::new(AtomicBool::new(false));
        let waiter = {
            let entry = Arc::clone(&entry);
            let acquired = Arc::clone(&acquired);
            thread::spawn(move || {
                let _lease = entry.acquire();
                acquired.store(true, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!acquired.load(Ordering::SeqCst));
        drop(lease);
        waiter.join().unwrap();
        assert!(acquired.load(Ordering::SeqCst));
        assert!(!entry.is_busy());
    }

    #[test]
    fn test_entry_ids_are_unique() {
        let a = AlgorithmEntry::new(AlgorithmKey::barrier(), EntryState::default());
        let b = AlgorithmEntry::new(AlgorithmKey::barrier(), EntryState::default());
        assert_ne!(a.id(), b.id());
        assert_eq!(a.constructions(), 0);
    }
}
