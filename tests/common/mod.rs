//! Common test utilities
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use tessera::distributed::{
    Algorithm, AlgorithmFactory, AlgorithmKey, CommContext, HashStore, MeshAlgorithms,
    ProcessGroupMesh, ProcessGroupOptions, TransportDevice,
};
use tessera::error::{Error, Result};
use tessera::runtime::cpu::CpuAllocator;
use tessera::runtime::{Allocator, DataPtr, Device, DeviceType};
use tessera::tensor::Tensor;

/// Host allocator that counts allocations and frees
#[derive(Clone, Default)]
pub struct CountingAllocator {
    inner: CpuAllocator,
    allocations: Arc<AtomicUsize>,
    frees: Arc<AtomicUsize>,
}

impl CountingAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocations(&self) -> usize {
        self.allocations.load(Ordering::SeqCst)
    }

    pub fn frees(&self) -> usize {
        self.frees.load(Ordering::SeqCst)
    }

    pub fn live(&self) -> usize {
        self.allocations() - self.frees()
    }
}

impl Allocator for CountingAllocator {
    fn allocate(&self, device: Device, nbytes: usize) -> Result<DataPtr> {
        let inner = self.inner.allocate(device, nbytes)?;
        self.allocations.fetch_add(1, Ordering::SeqCst);
        let frees = Arc::clone(&self.frees);
        let ptr = inner.ptr();
        Ok(DataPtr::new(ptr, nbytes, device, move |_| {
            frees.fetch_add(1, Ordering::SeqCst);
            drop(inner);
        }))
    }

    fn device_type(&self) -> DeviceType {
        DeviceType::Cpu
    }

    fn allocated_bytes(&self) -> usize {
        self.inner.allocated_bytes()
    }
}

/// Run `body` on `size` ranks of a fresh mesh, one thread per rank
///
/// Returns each rank's result in rank order.
pub fn run_ranks<T, O, F>(size: usize, options: O, body: F) -> Vec<T>
where
    T: Send,
    O: Fn(usize, Arc<TransportDevice>) -> ProcessGroupOptions + Sync,
    F: Fn(&ProcessGroupMesh) -> T + Sync,
{
    let store = Arc::new(HashStore::new());
    let device = TransportDevice::new("test-mesh");
    thread::scope(|scope| {
        let handles: Vec<_> = (0..size)
            .map(|rank| {
                let store = Arc::clone(&store);
                let device = Arc::clone(&device);
                let options = &options;
                let body = &body;
                scope.spawn(move || {
                    let pg = ProcessGroupMesh::new(store, rank, size, options(rank, device))
                        .expect("process group");
                    body(&pg)
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().expect("rank panicked"))
            .collect()
    })
}

/// Default options over `device`
pub fn default_options(_rank: usize, device: Arc<TransportDevice>) -> ProcessGroupOptions {
    ProcessGroupOptions::new(device)
}

/// Factory that counts the algorithms it builds
#[derive(Default)]
pub struct CountingFactory {
    created: AtomicUsize,
}

impl CountingFactory {
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

impl AlgorithmFactory for CountingFactory {
    fn create(
        &self,
        key: &AlgorithmKey,
        context: &Arc<CommContext>,
        staging: &[Tensor],
    ) -> Result<Box<dyn Algorithm>> {
        self.created.fetch_add(1, Ordering::SeqCst);
        MeshAlgorithms.create(key, context, staging)
    }
}

/// Factory whose algorithms fail their first `failures` runs
pub struct FlakyFactory {
    remaining: Arc<AtomicUsize>,
}

impl FlakyFactory {
    pub fn new(failures: usize) -> Self {
        Self {
            remaining: Arc::new(AtomicUsize::new(failures)),
        }
    }
}

struct FlakyAlgorithm {
    inner: Box<dyn Algorithm>,
    remaining: Arc<AtomicUsize>,
}

impl Algorithm for FlakyAlgorithm {
    fn run(&mut self) -> Result<()> {
        let failing = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(Error::collective("injected transport failure"));
        }
        self.inner.run()
    }
}

impl AlgorithmFactory for FlakyFactory {
    fn create(
        &self,
        key: &AlgorithmKey,
        context: &Arc<CommContext>,
        staging: &[Tensor],
    ) -> Result<Box<dyn Algorithm>> {
        Ok(Box::new(FlakyAlgorithm {
            inner: MeshAlgorithms.create(key, context, staging)?,
            remaining: Arc::clone(&self.remaining),
        }))
    }
}

/// Factory whose algorithms wait on a barrier before running
///
/// Lets a test hold an entry busy until it releases the barrier.
pub struct GatedFactory {
    gate: Arc<Barrier>,
}

impl GatedFactory {
    pub fn new(gate: Arc<Barrier>) -> Self {
        Self { gate }
    }
}

struct GatedAlgorithm {
    inner: Box<dyn Algorithm>,
    gate: Arc<Barrier>,
}

impl Algorithm for GatedAlgorithm {
    fn run(&mut self) -> Result<()> {
        self.gate.wait();
        self.inner.run()
    }
}

impl AlgorithmFactory for GatedFactory {
    fn create(
        &self,
        key: &AlgorithmKey,
        context: &Arc<CommContext>,
        staging: &[Tensor],
    ) -> Result<Box<dyn Algorithm>> {
        Ok(Box::new(GatedAlgorithm {
            inner: MeshAlgorithms.create(key, context, staging)?,
            gate: Arc::clone(&self.gate),
        }))
    }
}
