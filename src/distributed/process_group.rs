//! Process groups and the queued collective engine

use super::algorithm::check_collective_dtype;
use super::entry::{EntryLease, EntryState};
use super::transport::{CommContext, TransportDevice, UnboundBuffer};
use super::work::{CollectiveWork, GpuCompletion, RecvWork, SendWork};
use super::{
    AlgorithmEntry, AlgorithmFactory, AlgorithmKey, AllreduceOptions, BroadcastOptions,
    GatherOptions, MeshAlgorithms, ReduceOptions, ScatterOptions, Store, Work,
};
use crate::dispatch::{Context, OperatorTable, global_context};
use crate::error::{Error, Result};
use crate::runtime::gpu::{DeviceRuntimeState, Stream, StreamGuard, StreamId};
use crate::tensor::Tensor;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// A group of cooperating ranks running collectives together
///
/// Every call returns a [`Work`] handle; failures of the operation itself
/// are reported through the handle, argument errors synchronously.
pub trait ProcessGroup: Send + Sync {
    /// This process's rank
    fn rank(&self) -> usize;

    /// Number of ranks
    fn size(&self) -> usize;

    /// Copy `tensors[root_tensor]` of `root_rank` into every tensor of every rank
    fn broadcast(&self, tensors: &[Tensor], opts: &BroadcastOptions) -> Result<Arc<dyn Work>>;

    /// Reduce all tensors of all ranks; the result lands in every tensor
    fn allreduce(&self, tensors: &[Tensor], opts: &AllreduceOptions) -> Result<Arc<dyn Work>>;

    /// Reduce all tensors of all ranks into one tensor of the root
    fn reduce(&self, tensors: &[Tensor], opts: &ReduceOptions) -> Result<Arc<dyn Work>>;

    /// Gather every rank's inputs into every rank's outputs
    fn allgather(&self, outputs: &[Vec<Tensor>], inputs: &[Tensor]) -> Result<Arc<dyn Work>>;

    /// Gather every rank's inputs into the root's outputs
    fn gather(
        &self,
        outputs: &[Vec<Tensor>],
        inputs: &[Tensor],
        opts: &GatherOptions,
    ) -> Result<Arc<dyn Work>>;

    /// Scatter the root's inputs into every rank's outputs
    fn scatter(
        &self,
        outputs: &[Tensor],
        inputs: &[Vec<Tensor>],
        opts: &ScatterOptions,
    ) -> Result<Arc<dyn Work>>;

    /// Send a single tensor to `dst`
    fn send(&self, tensors: &[Tensor], dst: usize, tag: i32) -> Result<Arc<dyn Work>>;

    /// Receive a single tensor from `src`
    fn recv(&self, tensors: &[Tensor], src: usize, tag: i32) -> Result<Arc<dyn Work>>;

    /// Receive a single tensor from any rank in `src_ranks`
    ///
    /// An empty list accepts every other rank. The sender is reported by
    /// [`Work::source_rank`] once the receive completed.
    fn recv_anysource(
        &self,
        tensors: &[Tensor],
        src_ranks: &[usize],
        tag: i32,
    ) -> Result<Arc<dyn Work>>;

    /// Block all ranks until every rank reached the barrier
    fn barrier(&self) -> Result<Arc<dyn Work>>;

    /// Global rank of every group rank
    fn group_rank(&self) -> Result<HashMap<usize, usize>>;
}

/// Construction options of a [`ProcessGroupMesh`]
#[derive(Clone)]
pub struct ProcessGroupOptions {
    /// Transport hubs; one full mesh is connected per hub
    pub devices: Vec<Arc<TransportDevice>>,
    /// Rendezvous timeout
    pub timeout: Duration,
    /// Worker threads
    pub threads: usize,
    /// Cache entries per algorithm key, used round-robin
    pub cache_num_algorithm_entries: usize,
    /// Builds the algorithm of each cache entry
    pub algorithm_factory: Arc<dyn AlgorithmFactory>,
    /// Context the group's tensors come from
    pub context: Arc<Context>,
}

impl ProcessGroupOptions {
    /// Defaults over a single transport hub
    pub fn new(device: Arc<TransportDevice>) -> Self {
        Self {
            devices: vec![device],
            ..Self::default()
        }
    }

    /// Set the worker thread count
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    /// Set the number of cache entries per key
    pub fn with_cache_entries(mut self, entries: usize) -> Self {
        self.cache_num_algorithm_entries = entries;
        self
    }

    /// Replace the algorithm factory
    pub fn with_algorithm_factory(mut self, factory: Arc<dyn AlgorithmFactory>) -> Self {
        self.algorithm_factory = factory;
        self
    }

    /// Set the context the group's tensors come from
    pub fn with_context(mut self, context: Arc<Context>) -> Self {
        self.context = context;
        self
    }

    /// Set the rendezvous timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl Default for ProcessGroupOptions {
    fn default() -> Self {
        Self {
            devices: Vec::new(),
            timeout: Duration::from_secs(10),
            threads: 2,
            cache_num_algorithm_entries: 1,
            algorithm_factory: Arc::new(MeshAlgorithms),
            context: Arc::clone(global_context()),
        }
    }
}

impl fmt::Debug for ProcessGroupOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessGroupOptions")
            .field("devices", &self.devices)
            .field("timeout", &self.timeout)
            .field("threads", &self.threads)
            .field(
                "cache_num_algorithm_entries",
                &self.cache_num_algorithm_entries,
            )
            .finish_non_exhaustive()
    }
}

struct QueuedWork {
    lease: EntryLease,
    work: Arc<CollectiveWork>,
}

#[derive(Default)]
struct Queue {
    items: VecDeque<QueuedWork>,
    stop: bool,
}

/// State shared between the submitting threads and the workers
struct Shared {
    rank: usize,
    contexts: Vec<Arc<CommContext>>,
    factory: Arc<dyn AlgorithmFactory>,
    context: Arc<Context>,
    queue: Mutex<Queue>,
    produced: Condvar,
    consumed: Condvar,
}

impl Shared {
    fn run_loop(&self) {
        let mut queue = self.queue.lock();
        while !queue.stop {
            let Some(item) = queue.items.pop_front() else {
                self.produced.wait(&mut queue);
                continue;
            };
            self.consumed.notify_one();
            tracing::trace!(rank = self.rank, entry = item.lease.entry().id(), "dequeued");

            // Algorithms are built while the queue lock is held so that
            // ranks assign transport slots in submission order
            let built = self.ensure_algorithm(item.lease.entry());

            MutexGuard::unlocked(&mut queue, || self.run_single(item, built));
        }
    }

    fn ensure_algorithm(&self, entry: &Arc<AlgorithmEntry>) -> Result<()> {
        let mut state = entry.state.lock();
        if state.algorithm.is_some() {
            return Ok(());
        }
        let created = panic::catch_unwind(AssertUnwindSafe(|| {
            self.factory
                .create(entry.key(), &self.contexts[0], &state.staging)
        }))
        .unwrap_or_else(|payload| Err(panic_error("algorithm construction", payload)))?;
        state.algorithm = Some(created);
        entry.record_construction();
        tracing::debug!(
            rank = self.rank,
            entry = entry.id(),
            collective = ?entry.key().collective,
            "constructed algorithm"
        );
        Ok(())
    }

    fn run_single(&self, item: QueuedWork, built: Result<()>) {
        let QueuedWork { lease, work } = item;
        let entry = lease.entry();

        // A device failure under the abort policy panics; it must still
        // finish the work
        let outcome = built.and_then(|()| {
            panic::catch_unwind(AssertUnwindSafe(|| self.execute(entry)))
                .unwrap_or_else(|payload| Err(panic_error("collective", payload)))
        });
        entry.record_run();

        match outcome {
            Ok(gpu) => work.finish(gpu),
            Err(err) => {
                tracing::warn!(rank = self.rank, entry = entry.id(), error = %err, "collective failed");
                work.finish_with_error(err);
            }
        }
        // Dropping the lease unblocks the next caller of this entry
        drop(lease);
    }

    fn execute(&self, entry: &AlgorithmEntry) -> Result<Option<GpuCompletion>> {
        let mut guard = entry.state.lock();
        let state = &mut *guard;
        let run = state
            .run
            .take()
            .ok_or_else(|| Error::Internal("entry queued without a run".to_string()))?;
        let algorithm = state
            .algorithm
            .as_deref_mut()
            .ok_or_else(|| Error::Internal("entry has no algorithm".to_string()))?;
        run(algorithm)?;
        self.completion(entry.key(), &state.streams)
    }

    /// Record completion events on the entry's private streams
    fn completion(
        &self,
        key: &AlgorithmKey,
        streams: &[Stream],
    ) -> Result<Option<GpuCompletion>> {
        if !key.is_gpu() {
            return Ok(None);
        }
        let runtime = gpu_runtime(&self.context)?;
        let devices: Vec<usize> = key.devices.iter().map(|device| device.index()).collect();
        let mut events = Vec::with_capacity(devices.len());
        for (&device, stream) in devices.iter().zip(streams) {
            let event = runtime.create_event(device)?;
            event.record(stream.id())?;
            events.push(event);
        }
        Ok(Some(GpuCompletion {
            runtime: Arc::clone(runtime),
            devices,
            events,
        }))
    }
}

fn gpu_runtime(context: &Context) -> Result<&Arc<DeviceRuntimeState>> {
    context.device_state().ok_or_else(|| {
        Error::invalid_argument(
            "context",
            "GPU tensors require the process group's context to have an initialized device runtime",
        )
    })
}

fn panic_error(what: &str, payload: Box<dyn Any + Send>) -> Error {
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    Error::collective(format!("{what} panicked: {message}"))
}

/// Round-robin slots of one key
struct CacheSlots {
    entries: Vec<Option<Arc<AlgorithmEntry>>>,
    next: usize,
}

/// Process group over full-mesh transports, with a worker pool and a cache
/// of constructed algorithms
///
/// Collectives are queued: the calling thread copies its inputs into the
/// staging tensors of a cached [`AlgorithmEntry`] and returns a [`Work`]
/// handle; a worker builds the algorithm on first use, runs it, and copies
/// the results back. Entries are keyed by [`AlgorithmKey`], so repeated calls
/// with the same signature reuse staging memory and algorithm objects.
///
/// Calls that map to the same entry run in checkout order. Two entries of
/// the same key (`cache_num_algorithm_entries > 1`) may run concurrently.
pub struct ProcessGroupMesh {
    shared: Arc<Shared>,
    size: usize,
    cache_size: usize,
    cache: Mutex<HashMap<AlgorithmKey, CacheSlots>>,
    workers: Vec<JoinHandle<()>>,
}

impl ProcessGroupMesh {
    /// Connect `rank` of `size` through `store` and start the worker pool
    pub fn new(store: Arc<dyn Store>, rank: usize, size: usize, opts: ProcessGroupOptions) -> Result<Self> {
        if opts.devices.is_empty() {
            return Err(Error::invalid_argument("devices", "No device(s) specified"));
        }
        if opts.threads == 0 {
            return Err(Error::invalid_argument("threads", "requires at least one worker thread"));
        }
        if opts.cache_num_algorithm_entries == 0 {
            return Err(Error::invalid_argument(
                "cache_num_algorithm_entries",
                "requires at least one entry per key",
            ));
        }

        let contexts = opts
            .devices
            .iter()
            .enumerate()
            .map(|(index, device)| {
                CommContext::connect_full_mesh(
                    store.as_ref(),
                    device,
                    rank,
                    size,
                    opts.timeout,
                    &index.to_string(),
                )
                .map(Arc::new)
            })
            .collect::<Result<Vec<_>>>()?;

        let shared = Arc::new(Shared {
            rank,
            contexts,
            factory: opts.algorithm_factory,
            context: opts.context,
            queue: Mutex::new(Queue::default()),
            produced: Condvar::new(),
            consumed: Condvar::new(),
        });

        let mut group = Self {
            shared,
            size,
            cache_size: opts.cache_num_algorithm_entries,
            cache: Mutex::new(HashMap::new()),
            workers: Vec::with_capacity(opts.threads),
        };
        for index in 0..opts.threads {
            let shared = Arc::clone(&group.shared);
            let worker = thread::Builder::new()
                .name(format!("tessera-pg{rank}-worker{index}"))
                .spawn(move || shared.run_loop())
                .map_err(|err| Error::Internal(format!("failed to spawn worker: {err}")))?;
            group.workers.push(worker);
        }

        tracing::info!(
            rank,
            size,
            transports = group.shared.contexts.len(),
            threads = opts.threads,
            "process group ready"
        );
        Ok(group)
    }

    /// Entries currently cached for `key`
    pub fn cached_entries(&self, key: &AlgorithmKey) -> Vec<Arc<AlgorithmEntry>> {
        self.cache
            .lock()
            .get(key)
            .map(|slots| slots.entries.iter().flatten().cloned().collect())
            .unwrap_or_default()
    }

    /// Take the next entry for `key` round-robin, building it if needed,
    /// and block until it is free
    fn checkout(&self, key: &AlgorithmKey, table: Option<&Arc<OperatorTable>>) -> Result<EntryLease> {
        let entry = {
            let mut cache = self.cache.lock();
            let slots = cache.entry(key.clone()).or_insert_with(|| CacheSlots {
                entries: vec![None; self.cache_size],
                next: 0,
            });
            let index = slots.next;
            slots.next = (index + 1) % slots.entries.len();
            match &slots.entries[index] {
                Some(entry) => Arc::clone(entry),
                None => {
                    let entry = self.construct(key, table)?;
                    slots.entries[index] = Some(Arc::clone(&entry));
                    entry
                }
            }
        };
        Ok(entry.acquire())
    }

    /// Allocate staging tensors and, for GPU keys, private streams and events
    ///
    /// The algorithm itself is built later by a worker.
    fn construct(&self, key: &AlgorithmKey, table: Option<&Arc<OperatorTable>>) -> Result<Arc<AlgorithmEntry>> {
        let mut state = EntryState::default();
        if let Some(table) = table {
            state.staging = key
                .devices
                .iter()
                .zip(&key.sizes)
                .map(|(&device, sizes)| table.empty(device, sizes))
                .collect::<Result<_>>()?;
        }
        if key.is_gpu() {
            let runtime = gpu_runtime(&self.shared.context)?;
            for device in &key.devices {
                state.streams.push(runtime.create_stream(device.index())?);
                state.events.push(runtime.create_event(device.index())?);
            }
        }
        let entry = AlgorithmEntry::new(key.clone(), state);
        tracing::debug!(
            rank = self.shared.rank,
            entry = entry.id(),
            collective = ?key.collective,
            "created cache entry"
        );
        Ok(entry)
    }

    /// Capture the run of a data collective: the algorithm, then staging
    /// copied back into the caller's tensors
    fn prepare_run(&self, key: &AlgorithmKey, state: &mut EntryState, tensors: &[Tensor]) -> Result<()> {
        let tensors = tensors.to_vec();
        let staging = state.staging.clone();

        if !key.is_gpu() {
            state.run = Some(Box::new(move |algorithm| {
                algorithm.run()?;
                for (tensor, staging) in tensors.iter().zip(&staging) {
                    tensor.copy_(staging)?;
                }
                Ok(())
            }));
            return Ok(());
        }

        // Private streams wait for whatever the caller queued on its
        // current stream, staging copies included
        let runtime = Arc::clone(gpu_runtime(&self.shared.context)?);
        let mut streams: Vec<(usize, StreamId)> = Vec::with_capacity(key.devices.len());
        for ((device, stream), event) in key.devices.iter().zip(&state.streams).zip(&state.events) {
            event.record(runtime.current_stream(device.index()))?;
            event.block(stream.id())?;
            streams.push((device.index(), stream.id()));
        }

        state.run = Some(Box::new(move |algorithm| {
            algorithm.run()?;
            for ((tensor, staging), &(device, stream)) in tensors.iter().zip(&staging).zip(&streams) {
                let _guard = StreamGuard::new(&runtime, device, stream);
                tensor.copy_(staging)?;
            }
            Ok(())
        }));
        Ok(())
    }

    fn enqueue(&self, lease: EntryLease) -> Arc<dyn Work> {
        let work = CollectiveWork::new();
        {
            let mut queue = self.shared.queue.lock();
            tracing::trace!(rank = self.shared.rank, entry = lease.entry().id(), "enqueued");
            queue.items.push_back(QueuedWork {
                lease,
                work: Arc::clone(&work),
            });
        }
        self.shared.produced.notify_one();
        work
    }

    fn check_rank(&self, arg: &'static str, rank: usize) -> Result<()> {
        if rank >= self.size {
            return Err(Error::invalid_argument(
                arg,
                format!("rank {rank} is outside a group of size {}", self.size),
            ));
        }
        Ok(())
    }

    fn point_to_point(&self, tensors: &[Tensor], op: &'static str, tag: i32) -> Result<(UnboundBuffer, u32)> {
        let tensor = check_single_tensor(tensors, op)?;
        let tag = check_tag(tag)?;
        let buffer = UnboundBuffer::new(Arc::clone(&self.shared.contexts[0]), tensor.clone());
        Ok((buffer, tag))
    }
}

/// Tensors of a collective must be defined, dense, and agree in size and type
fn check_same_size_and_type(tensors: &[Tensor], op: &'static str) -> Result<()> {
    let first = tensors
        .first()
        .ok_or_else(|| Error::invalid_argument("tensors", "requires at least one tensor"))?;
    if !first.defined() {
        return Err(Error::undefined(op));
    }
    if first.backend().is_sparse() {
        return Err(Error::invalid_argument("tensors", "input tensors have to be dense"));
    }
    check_collective_dtype(first.dtype(), op)?;

    let sizes = first.sizes()?;
    for tensor in &tensors[1..] {
        if !tensor.defined() {
            return Err(Error::undefined(op));
        }
        if tensor.dispatch_key() != first.dispatch_key() {
            return Err(Error::invalid_argument("tensors", "tensors must have the same type"));
        }
        if tensor.sizes()? != sizes {
            return Err(Error::invalid_argument("tensors", "tensors must have the same size"));
        }
    }
    Ok(())
}

fn check_single_tensor<'a>(tensors: &'a [Tensor], op: &'static str) -> Result<&'a Tensor> {
    let [tensor] = tensors else {
        return Err(Error::invalid_argument(
            "tensors",
            format!("{op} takes a single tensor"),
        ));
    };
    if !tensor.defined() {
        return Err(Error::undefined(op));
    }
    if tensor.backend().is_sparse() {
        return Err(Error::invalid_argument("tensors", "input tensor has to be dense"));
    }
    if !tensor.is_contiguous()? {
        return Err(Error::invalid_argument("tensors", "input tensor has to be contiguous"));
    }
    Ok(tensor)
}

fn check_tag(tag: i32) -> Result<u32> {
    u32::try_from(tag).map_err(|_| Error::invalid_argument("tag", "Tag must be >= 0"))
}

impl ProcessGroup for ProcessGroupMesh {
    fn rank(&self) -> usize {
        self.shared.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn broadcast(&self, tensors: &[Tensor], opts: &BroadcastOptions) -> Result<Arc<dyn Work>> {
        check_same_size_and_type(tensors, "broadcast")?;
        self.check_rank("root_rank", opts.root_rank)?;
        if opts.root_tensor >= tensors.len() {
            return Err(Error::invalid_argument(
                "root_tensor",
                format!("{} is outside {} tensors", opts.root_tensor, tensors.len()),
            ));
        }

        let key = AlgorithmKey::broadcast(tensors, opts)?;
        let lease = self.checkout(&key, Some(tensors[0].table()))?;
        {
            let mut state = lease.entry().state.lock();
            if self.rank() == opts.root_rank {
                state.staging[opts.root_tensor].copy_(&tensors[opts.root_tensor])?;
            }
            self.prepare_run(&key, &mut state, tensors)?;
        }
        Ok(self.enqueue(lease))
    }

    fn allreduce(&self, tensors: &[Tensor], opts: &AllreduceOptions) -> Result<Arc<dyn Work>> {
        check_same_size_and_type(tensors, "allreduce")?;

        let key = AlgorithmKey::allreduce(tensors, opts)?;
        let lease = self.checkout(&key, Some(tensors[0].table()))?;
        {
            let mut state = lease.entry().state.lock();
            for (staging, tensor) in state.staging.iter().zip(tensors) {
                staging.copy_(tensor)?;
            }
            self.prepare_run(&key, &mut state, tensors)?;
        }
        Ok(self.enqueue(lease))
    }

    fn reduce(&self, _tensors: &[Tensor], _opts: &ReduceOptions) -> Result<Arc<dyn Work>> {
        Err(Error::unsupported("reduce", "ProcessGroupMesh does not support reduce"))
    }

    fn allgather(&self, _outputs: &[Vec<Tensor>], _inputs: &[Tensor]) -> Result<Arc<dyn Work>> {
        Err(Error::unsupported("allgather", "ProcessGroupMesh does not support allgather"))
    }

    fn gather(
        &self,
        _outputs: &[Vec<Tensor>],
        _inputs: &[Tensor],
        _opts: &GatherOptions,
    ) -> Result<Arc<dyn Work>> {
        Err(Error::unsupported("gather", "ProcessGroupMesh does not support gather"))
    }

    fn scatter(
        &self,
        _outputs: &[Tensor],
        _inputs: &[Vec<Tensor>],
        _opts: &ScatterOptions,
    ) -> Result<Arc<dyn Work>> {
        Err(Error::unsupported("scatter", "ProcessGroupMesh does not support scatter"))
    }

    fn send(&self, tensors: &[Tensor], dst: usize, tag: i32) -> Result<Arc<dyn Work>> {
        self.check_rank("dst", dst)?;
        let (buffer, tag) = self.point_to_point(tensors, "send", tag)?;
        buffer.send(dst, tag)?;
        Ok(Arc::new(SendWork::new(buffer.tensor().clone())))
    }

    fn recv(&self, tensors: &[Tensor], src: usize, tag: i32) -> Result<Arc<dyn Work>> {
        self.check_rank("src", src)?;
        let (buffer, tag) = self.point_to_point(tensors, "recv", tag)?;
        Ok(Arc::new(RecvWork::post(buffer, &[src], tag)?))
    }

    fn recv_anysource(
        &self,
        tensors: &[Tensor],
        src_ranks: &[usize],
        tag: i32,
    ) -> Result<Arc<dyn Work>> {
        let srcs: Vec<usize> = if src_ranks.is_empty() {
            (0..self.size).filter(|&rank| rank != self.rank()).collect()
        } else {
            for &src in src_ranks {
                self.check_rank("src_ranks", src)?;
            }
            src_ranks.to_vec()
        };
        let (buffer, tag) = self.point_to_point(tensors, "recv_anysource", tag)?;
        Ok(Arc::new(RecvWork::post(buffer, &srcs, tag)?))
    }

    fn barrier(&self) -> Result<Arc<dyn Work>> {
        let key = AlgorithmKey::barrier();
        let lease = self.checkout(&key, None)?;
        lease.entry().state.lock().run = Some(Box::new(|algorithm| algorithm.run()));
        Ok(self.enqueue(lease))
    }

    fn group_rank(&self) -> Result<HashMap<usize, usize>> {
        Err(Error::unsupported("group_rank", "ProcessGroupMesh does not support group_rank"))
    }
}

impl Drop for ProcessGroupMesh {
    fn drop(&mut self) {
        {
            let mut queue = self.shared.queue.lock();
            while !queue.items.is_empty() {
                self.shared.consumed.wait(&mut queue);
            }
            queue.stop = true;
        }
        self.shared.produced.notify_all();

        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                tracing::error!(rank = self.shared.rank, "worker thread panicked");
            }
        }
        tracing::debug!(rank = self.shared.rank, "process group stopped");
    }
}

impl fmt::Debug for ProcessGroupMesh {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessGroupMesh")
            .field("rank", &self.shared.rank)
            .field("size", &self.size)
            .field("workers", &self.workers.len())
            .field("cached_keys", &self.cache.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::HashStore;
    use crate::dtype::DType;
    use crate::runtime::Device;

    fn single_rank() -> (Arc<Context>, ProcessGroupMesh) {
        let ctx = Arc::new(Context::default());
        let opts = ProcessGroupOptions::new(TransportDevice::new("unit")).with_context(Arc::clone(&ctx));
        let pg = ProcessGroupMesh::new(Arc::new(HashStore::new()), 0, 1, opts).unwrap();
        (ctx, pg)
    }

    #[test]
    fn test_requires_a_device() {
        let err = ProcessGroupMesh::new(
            Arc::new(HashStore::new()),
            0,
            1,
            ProcessGroupOptions::default(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("No device(s) specified"));
    }

    #[test]
    fn test_single_rank_allreduce_sums_local_tensors() {
        let (ctx, pg) = single_rank();
        let a = Tensor::from_slice(&ctx, &[1.0f32, 2.0], &[2], Device::cpu()).unwrap();
        let b = Tensor::from_slice(&ctx, &[10.0f32, 20.0], &[2], Device::cpu()).unwrap();
        let work = pg
            .allreduce(&[a.clone(), b.clone()], &AllreduceOptions::default())
            .unwrap();
        assert!(work.wait());
        assert_eq!(a.to_vec::<f32>().unwrap(), vec![11.0, 22.0]);
        assert_eq!(b.to_vec::<f32>().unwrap(), vec![11.0, 22.0]);
    }

    #[test]
    fn test_argument_checks() {
        let (ctx, pg) = single_rank();
        let a = Tensor::zeros(&ctx, &[2], DType::F32, Device::cpu()).unwrap();
        let b = Tensor::zeros(&ctx, &[3], DType::F32, Device::cpu()).unwrap();
        let c = Tensor::zeros(&ctx, &[2], DType::I64, Device::cpu()).unwrap();

        assert!(pg.allreduce(&[], &AllreduceOptions::default()).is_err());
        assert!(pg.allreduce(&[a.clone(), b], &AllreduceOptions::default()).is_err());
        assert!(pg.allreduce(&[a.clone(), c], &AllreduceOptions::default()).is_err());
        assert!(matches!(
            pg.allreduce(&[Tensor::undefined()], &AllreduceOptions::default()),
            Err(Error::UndefinedTensor { .. })
        ));

        let bad_root = BroadcastOptions {
            root_rank: 1,
            root_tensor: 0,
        };
        assert!(pg.broadcast(&[a.clone()], &bad_root).is_err());
        assert!(pg.send(&[a.clone()], 0, -1).is_err());
        assert!(pg.send(&[a.clone(), a.clone()], 0, 0).is_err());

        let t = Tensor::zeros(&ctx, &[2, 3], DType::F32, Device::cpu()).unwrap();
        let transposed = t.transpose(0, 1).unwrap();
        assert!(pg.send(&[transposed], 0, 0).is_err());
    }

    #[test]
    fn test_bool_is_not_a_collective_type() {
        let (ctx, pg) = single_rank();
        let flags = Tensor::zeros(&ctx, &[4], DType::Bool, Device::cpu()).unwrap();
        assert!(matches!(
            pg.allreduce(&[flags], &AllreduceOptions::default()),
            Err(Error::UnsupportedDType { .. })
        ));
    }

    #[test]
    fn test_unsupported_collectives() {
        let (_ctx, pg) = single_rank();
        assert!(matches!(
            pg.reduce(&[], &ReduceOptions::default()),
            Err(Error::Unsupported { .. })
        ));
        assert!(pg.allgather(&[], &[]).is_err());
        assert!(pg.gather(&[], &[], &GatherOptions::default()).is_err());
        assert!(pg.scatter(&[], &[], &ScatterOptions::default()).is_err());
        assert!(pg.group_rank().is_err());
    }

    #[test]
    fn test_barrier_on_single_rank() {
        let (_ctx, pg) = single_rank();
        for _ in 0..3 {
            assert!(pg.barrier().unwrap().wait());
        }
        let entries = pg.cached_entries(&AlgorithmKey::barrier());
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].constructions(), 1);
        assert_eq!(entries[0].runs(), 3);
    }
}
