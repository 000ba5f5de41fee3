//! Per-process device runtime state
//!
//! One [`DeviceRuntimeState`] is created per [`Context`](crate::dispatch::Context)
//! the first time a GPU backend is used. It snapshots every device's
//! properties, owns the lazily grown BLAS/sparse handle pools, resolves and
//! memoizes peer access, keeps RNG seeds, and routes device allocations
//! through an optional reclaim hook.

use super::platform::{
    BlasHandle, DevicePlatform, DeviceProperties, PlatformError, PlatformResult, SparseHandle,
    StreamId,
};
use super::stream::{self, Event, Stream};
use crate::error::{Error, Result};
use crate::runtime::Device;
use parking_lot::{Mutex, RwLock};
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

/// Scratch space floor per device, in bytes
pub const MIN_SCRATCH_SPACE_PER_DEVICE: usize = 32768 * 4;

/// Scratch space per multiprocessor per stream, in bytes
pub const MIN_SCRATCH_SPACE_PER_SM_STREAM: usize = 4 * 4;

/// Devices are grouped in blocks of this size; peer access never crosses blocks
pub const MAX_PEER_GROUP: usize = 8;

/// Seed every generator starts with
pub const DEFAULT_RNG_SEED: u64 = 67280421310721;

static NEXT_STATE_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// runtime state id -> (current blas handle, current sparse handle), 1-based
    static CURRENT_HANDLES: RefCell<HashMap<u64, (usize, usize)>> = RefCell::new(HashMap::new());
}

/// Called when a device allocation fails, before the single retry
pub type ReclaimHook = Arc<dyn Fn() + Send + Sync>;

/// What a failed checked platform call does
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum DeviceErrorPolicy {
    /// Log the failure and panic
    #[default]
    Abort,
    /// Log the failure and return [`Error::Device`]
    Propagate,
}

/// Peer access between an ordered pair of devices
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PeerAccess {
    /// Not yet queried
    Unknown,
    /// Enabled
    Allowed,
    /// Not possible or turned off
    Disallowed,
}

/// Seed and consumed offset of one device's generator
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct GeneratorState {
    /// Current seed
    pub seed: u64,
    /// Random values already handed out for this seed
    pub offset: u64,
}

impl Default for GeneratorState {
    fn default() -> Self {
        Self {
            seed: DEFAULT_RNG_SEED,
            offset: 0,
        }
    }
}

struct DeviceResources {
    properties: DeviceProperties,
    scratch_space_per_stream: usize,
    blas_handles: Mutex<Vec<BlasHandle>>,
    sparse_handles: Mutex<Vec<SparseHandle>>,
}

/// Scratch space for a device with `multiprocessors` SMs
pub fn scratch_space_for(multiprocessors: usize) -> usize {
    MIN_SCRATCH_SPACE_PER_DEVICE.max(multiprocessors * MIN_SCRATCH_SPACE_PER_SM_STREAM)
}

fn initial_peer_matrix(count: usize) -> Vec<PeerAccess> {
    let mut matrix = vec![PeerAccess::Unknown; count * count];
    for i in 0..count {
        for j in 0..count {
            matrix[i * count + j] = if i == j {
                PeerAccess::Allowed
            } else if i / MAX_PEER_GROUP != j / MAX_PEER_GROUP {
                PeerAccess::Disallowed
            } else {
                PeerAccess::Unknown
            };
        }
    }
    matrix
}

/// Device runtime state shared by everything that touches GPU memory
pub struct DeviceRuntimeState {
    id: u64,
    platform: Arc<dyn DevicePlatform>,
    policy: DeviceErrorPolicy,
    devices: Vec<DeviceResources>,
    peer_access: Mutex<Vec<PeerAccess>>,
    kernel_peer_access: AtomicBool,
    num_blas_handles: AtomicUsize,
    num_sparse_handles: AtomicUsize,
    generators: Mutex<Vec<GeneratorState>>,
    reclaim_hook: RwLock<Option<ReclaimHook>>,
    reported_codes: Mutex<HashSet<i32>>,
    shut_down: AtomicBool,
}

impl DeviceRuntimeState {
    /// Query every visible device and build the state
    ///
    /// No handles are created here; pools start empty with one handle
    /// advertised per device.
    pub fn init(platform: Arc<dyn DevicePlatform>, policy: DeviceErrorPolicy) -> Result<Arc<Self>> {
        let mut state = Self {
            id: NEXT_STATE_ID.fetch_add(1, Ordering::Relaxed),
            platform,
            policy,
            devices: Vec::new(),
            peer_access: Mutex::new(Vec::new()),
            kernel_peer_access: AtomicBool::new(false),
            num_blas_handles: AtomicUsize::new(1),
            num_sparse_handles: AtomicUsize::new(1),
            generators: Mutex::new(Vec::new()),
            reclaim_hook: RwLock::new(None),
            reported_codes: Mutex::new(HashSet::new()),
            shut_down: AtomicBool::new(false),
        };

        // On early return the partially built state is dropped and shut down
        let count = state.check("device_count", state.platform.device_count())?;
        for device in 0..count {
            let properties = state.check("properties", state.platform.properties(device))?;
            let scratch_space_per_stream = scratch_space_for(properties.multiprocessor_count);
            state.devices.push(DeviceResources {
                properties,
                scratch_space_per_stream,
                blas_handles: Mutex::new(Vec::new()),
                sparse_handles: Mutex::new(Vec::new()),
            });
        }
        *state.peer_access.get_mut() = initial_peer_matrix(count);
        *state.generators.get_mut() = vec![GeneratorState::default(); count];

        tracing::info!(
            platform = state.platform.name(),
            devices = count,
            "device runtime initialized"
        );
        Ok(Arc::new(state))
    }

    /// Unique id of this state (keys thread-local overrides)
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The platform this state drives
    #[inline]
    pub fn platform(&self) -> &Arc<dyn DevicePlatform> {
        &self.platform
    }

    /// Number of devices found at init
    #[inline]
    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    /// Failure policy for checked platform calls
    #[inline]
    pub fn error_policy(&self) -> DeviceErrorPolicy {
        self.policy
    }

    // ===== error checking =====

    /// Apply the failure policy to a platform result
    ///
    /// The first failure of each error code is logged at `error` level.
    /// Under [`DeviceErrorPolicy::Abort`] a failure panics.
    pub fn check<T>(&self, op: &'static str, result: PlatformResult<T>) -> Result<T> {
        result.map_err(|err| self.device_failure(op, err))
    }

    fn device_failure(&self, op: &'static str, err: PlatformError) -> Error {
        if self.reported_codes.lock().insert(err.code) {
            tracing::error!(op, code = err.code, message = %err.message, "device runtime call failed");
        }
        match self.policy {
            DeviceErrorPolicy::Abort => panic!("device runtime call {op} failed: {err}"),
            DeviceErrorPolicy::Propagate => Error::Device {
                code: err.code,
                op,
                message: err.message,
            },
        }
    }

    /// Log a failure without applying the policy (teardown paths)
    pub(crate) fn warn_on_failure(&self, op: &'static str, result: PlatformResult<()>) {
        if let Err(err) = result {
            tracing::warn!(op, code = err.code, message = %err.message, "device runtime call failed during teardown");
        }
    }

    fn check_device(&self, device: usize) -> Result<()> {
        if device < self.devices.len() {
            Ok(())
        } else {
            Err(Error::invalid_argument(
                "device",
                format!(
                    "device {device} is out of range; {} devices are visible",
                    self.devices.len()
                ),
            ))
        }
    }

    fn check_running(&self) -> Result<()> {
        if self.shut_down.load(Ordering::Acquire) {
            Err(Error::InvalidOperation(
                "device runtime has been shut down".into(),
            ))
        } else {
            Ok(())
        }
    }

    // ===== device properties =====

    /// Properties captured at init
    pub fn properties(&self, device: usize) -> Result<&DeviceProperties> {
        self.check_device(device)?;
        Ok(&self.devices[device].properties)
    }

    /// Scratch bytes available to each stream on `device`
    pub fn scratch_space_per_stream(&self, device: usize) -> Result<usize> {
        self.check_device(device)?;
        Ok(self.devices[device].scratch_space_per_stream)
    }

    // ===== peer access =====

    /// Whether `device` may access `peer`'s memory
    ///
    /// Unknown pairs are resolved with one platform query; accessible pairs
    /// are enabled on the way. The answer is memoized.
    pub fn peer_access(&self, device: usize, peer: usize) -> Result<bool> {
        self.check_device(device)?;
        self.check_device(peer)?;
        let count = self.devices.len();
        let mut matrix = self.peer_access.lock();
        match matrix[device * count + peer] {
            PeerAccess::Allowed => Ok(true),
            PeerAccess::Disallowed => Ok(false),
            PeerAccess::Unknown => {
                let can_access = self.check(
                    "can_access_peer",
                    self.platform.can_access_peer(device, peer),
                )?;
                if can_access {
                    self.enable_peer(device, peer)?;
                }
                matrix[device * count + peer] = if can_access {
                    PeerAccess::Allowed
                } else {
                    PeerAccess::Disallowed
                };
                Ok(can_access)
            }
        }
    }

    /// Memoized entry for the pair, without resolving it
    pub fn peer_access_entry(&self, device: usize, peer: usize) -> Result<PeerAccess> {
        self.check_device(device)?;
        self.check_device(peer)?;
        Ok(self.peer_access.lock()[device * self.devices.len() + peer])
    }

    /// Explicitly enable or disable peer access
    ///
    /// Enabling a pair the platform cannot connect fails with `Unsupported`.
    pub fn set_peer_access(&self, device: usize, peer: usize, enable: bool) -> Result<()> {
        if device == peer {
            self.check_device(device)?;
            return if enable {
                Ok(())
            } else {
                Err(Error::invalid_argument(
                    "peer",
                    "a device always has access to its own memory",
                ))
            };
        }
        if self.peer_access(device, peer)? == enable {
            return Ok(());
        }

        let count = self.devices.len();
        let mut matrix = self.peer_access.lock();
        if enable {
            let capable = device / MAX_PEER_GROUP == peer / MAX_PEER_GROUP
                && self.check(
                    "can_access_peer",
                    self.platform.can_access_peer(device, peer),
                )?;
            if !capable {
                return Err(Error::unsupported(
                    "set_peer_access",
                    format!("device {device} cannot access memory of device {peer}"),
                ));
            }
            self.enable_peer(device, peer)?;
            matrix[device * count + peer] = PeerAccess::Allowed;
        } else {
            match self.platform.disable_peer_access(device, peer) {
                Ok(()) => {}
                Err(err) if err.code == PlatformError::PEER_ACCESS_NOT_ENABLED => {}
                Err(err) => return Err(self.device_failure("disable_peer_access", err)),
            }
            matrix[device * count + peer] = PeerAccess::Disallowed;
        }
        Ok(())
    }

    fn enable_peer(&self, device: usize, peer: usize) -> Result<()> {
        match self.platform.enable_peer_access(device, peer) {
            Ok(()) => Ok(()),
            Err(err) if err.code == PlatformError::PEER_ACCESS_ALREADY_ENABLED => Ok(()),
            Err(err) => Err(self.device_failure("enable_peer_access", err)),
        }
    }

    /// Whether kernels may read peer memory directly
    pub fn kernel_peer_access_enabled(&self) -> bool {
        self.kernel_peer_access.load(Ordering::Relaxed)
    }

    /// Allow or forbid kernels to read peer memory directly
    pub fn set_kernel_peer_access_enabled(&self, enabled: bool) {
        self.kernel_peer_access.store(enabled, Ordering::Relaxed);
    }

    // ===== handle pools =====

    /// Advertise at least `count` BLAS handles per device; never shrinks
    pub fn reserve_blas_handles(&self, count: usize) {
        self.num_blas_handles.fetch_max(count, Ordering::AcqRel);
    }

    /// Advertise at least `count` sparse handles per device; never shrinks
    pub fn reserve_sparse_handles(&self, count: usize) {
        self.num_sparse_handles.fetch_max(count, Ordering::AcqRel);
    }

    /// Advertised BLAS handles per device
    pub fn num_blas_handles(&self) -> usize {
        self.num_blas_handles.load(Ordering::Acquire)
    }

    /// Advertised sparse handles per device
    pub fn num_sparse_handles(&self) -> usize {
        self.num_sparse_handles.load(Ordering::Acquire)
    }

    /// BLAS handle `handle` (1-based) of `device`, creating it on first use
    pub fn device_blas_handle(&self, device: usize, handle: usize) -> Result<BlasHandle> {
        self.check_running()?;
        self.check_device(device)?;
        check_handle_index(handle, self.num_blas_handles())?;
        let mut pool = self.devices[device].blas_handles.lock();
        while pool.len() < handle {
            let created = self.check(
                "create_blas_handle",
                self.platform.create_blas_handle(device),
            )?;
            pool.push(created);
        }
        Ok(pool[handle - 1])
    }

    /// Sparse handle `handle` (1-based) of `device`, creating it on first use
    pub fn device_sparse_handle(&self, device: usize, handle: usize) -> Result<SparseHandle> {
        self.check_running()?;
        self.check_device(device)?;
        check_handle_index(handle, self.num_sparse_handles())?;
        let mut pool = self.devices[device].sparse_handles.lock();
        while pool.len() < handle {
            let created = self.check(
                "create_sparse_handle",
                self.platform.create_sparse_handle(device),
            )?;
            pool.push(created);
        }
        Ok(pool[handle - 1])
    }

    /// Handles created so far on `device` (blas, sparse)
    pub fn created_handles(&self, device: usize) -> Result<(usize, usize)> {
        self.check_device(device)?;
        let resources = &self.devices[device];
        Ok((
            resources.blas_handles.lock().len(),
            resources.sparse_handles.lock().len(),
        ))
    }

    /// Select the BLAS handle this thread uses
    pub fn set_current_blas_handle(&self, handle: usize) -> Result<()> {
        check_handle_index(handle, self.num_blas_handles())?;
        self.update_current_handles(|current| current.0 = handle);
        Ok(())
    }

    /// Select the sparse handle this thread uses
    pub fn set_current_sparse_handle(&self, handle: usize) -> Result<()> {
        check_handle_index(handle, self.num_sparse_handles())?;
        self.update_current_handles(|current| current.1 = handle);
        Ok(())
    }

    /// Index of this thread's BLAS handle (defaults to 1)
    pub fn current_blas_handle_index(&self) -> usize {
        self.current_handles().0
    }

    /// Index of this thread's sparse handle (defaults to 1)
    pub fn current_sparse_handle_index(&self) -> usize {
        self.current_handles().1
    }

    /// This thread's BLAS handle on `device`
    pub fn current_blas_handle(&self, device: usize) -> Result<BlasHandle> {
        self.device_blas_handle(device, self.current_blas_handle_index())
    }

    /// This thread's sparse handle on `device`
    pub fn current_sparse_handle(&self, device: usize) -> Result<SparseHandle> {
        self.device_sparse_handle(device, self.current_sparse_handle_index())
    }

    fn current_handles(&self) -> (usize, usize) {
        CURRENT_HANDLES.with(|handles| handles.borrow().get(&self.id).copied().unwrap_or((1, 1)))
    }

    fn update_current_handles(&self, update: impl FnOnce(&mut (usize, usize))) {
        CURRENT_HANDLES.with(|handles| {
            let mut handles = handles.borrow_mut();
            update(handles.entry(self.id).or_insert((1, 1)));
        });
    }

    // ===== streams =====

    /// This thread's current stream on `device`
    pub fn current_stream(&self, device: usize) -> StreamId {
        stream::current_stream(self.id, device)
    }

    /// Replace this thread's current stream on `device`
    pub fn set_current_stream(&self, device: usize, stream: StreamId) -> Result<()> {
        self.check_device(device)?;
        stream::set_current_stream(self.id, device, stream);
        Ok(())
    }

    /// Create a private stream on `device`
    pub fn create_stream(self: &Arc<Self>, device: usize) -> Result<Stream> {
        self.check_device(device)?;
        let id = self.check("create_stream", self.platform.create_stream(device))?;
        Ok(Stream::new(id, device, Arc::clone(self)))
    }

    /// Create an event on `device`
    pub fn create_event(self: &Arc<Self>, device: usize) -> Result<Event> {
        self.check_device(device)?;
        let id = self.check("create_event", self.platform.create_event(device))?;
        Ok(Event::new(id, device, Arc::clone(self)))
    }

    /// Block the host until `stream` on `device` drains
    pub fn synchronize(&self, device: usize, stream: StreamId) -> Result<()> {
        self.check_device(device)?;
        self.check(
            "synchronize_stream",
            self.platform.synchronize_stream(device, stream),
        )
    }

    // ===== random number state =====

    /// Seed `device`'s generator started from
    pub fn initial_seed(&self, device: usize) -> Result<u64> {
        self.check_device(device)?;
        Ok(self.generators.lock()[device].seed)
    }

    /// Current generator state of `device`
    pub fn generator_state(&self, device: usize) -> Result<GeneratorState> {
        self.check_device(device)?;
        Ok(self.generators.lock()[device])
    }

    /// Reseed `device` and reset its offset
    pub fn manual_seed(&self, device: usize, seed: u64) -> Result<()> {
        self.check_device(device)?;
        self.generators.lock()[device] = GeneratorState { seed, offset: 0 };
        Ok(())
    }

    /// Reseed every device
    pub fn manual_seed_all(&self, seed: u64) {
        for generator in self.generators.lock().iter_mut() {
            *generator = GeneratorState { seed, offset: 0 };
        }
    }

    /// Reserve `increment` random values; returns the seed and starting offset
    pub fn reserve_rng_offset(&self, device: usize, increment: u64) -> Result<(u64, u64)> {
        self.check_device(device)?;
        let mut generators = self.generators.lock();
        let generator = &mut generators[device];
        let start = generator.offset;
        generator.offset += increment;
        Ok((generator.seed, start))
    }

    // ===== memory =====

    /// Install or clear the hook run once when a device allocation fails
    pub fn set_reclaim_hook(&self, hook: Option<ReclaimHook>) {
        *self.reclaim_hook.write() = hook;
    }

    /// Allocate device memory
    ///
    /// On out-of-memory, a registered reclaim hook runs once and the
    /// allocation is retried once.
    pub fn malloc(&self, device: usize, nbytes: usize) -> Result<u64> {
        self.check_device(device)?;
        let out_of_memory = || Error::OutOfMemory {
            size: nbytes,
            device: Device::cuda(device),
        };
        match self.platform.malloc(device, nbytes) {
            Ok(ptr) => return Ok(ptr),
            Err(err) if err.is_out_of_memory() => {}
            Err(err) => return Err(self.device_failure("malloc", err)),
        }

        let Some(hook) = self.reclaim_hook.read().clone() else {
            return Err(out_of_memory());
        };
        tracing::debug!(device, nbytes, "device allocation failed; running reclaim hook");
        hook();
        match self.platform.malloc(device, nbytes) {
            Ok(ptr) => Ok(ptr),
            Err(err) if err.is_out_of_memory() => Err(out_of_memory()),
            Err(err) => Err(self.device_failure("malloc", err)),
        }
    }

    /// Release device memory; failures are logged
    pub fn free(&self, device: usize, ptr: u64) {
        self.warn_on_failure("free", self.platform.free(device, ptr));
    }

    // ===== teardown =====

    /// Destroy every pooled handle
    ///
    /// Idempotent and safe on a partially initialized state. Failures are
    /// logged, never raised.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        for (device, resources) in self.devices.iter().enumerate() {
            for handle in resources.blas_handles.lock().drain(..) {
                self.warn_on_failure(
                    "destroy_blas_handle",
                    self.platform.destroy_blas_handle(device, handle),
                );
            }
            for handle in resources.sparse_handles.lock().drain(..) {
                self.warn_on_failure(
                    "destroy_sparse_handle",
                    self.platform.destroy_sparse_handle(device, handle),
                );
            }
        }
        tracing::info!(platform = self.platform.name(), "device runtime shut down");
    }

    /// Returns true once [`shutdown`](Self::shutdown) has run
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }
}

fn check_handle_index(handle: usize, advertised: usize) -> Result<()> {
    if handle == 0 || handle > advertised {
        return Err(Error::invalid_argument(
            "handle",
            format!("{handle} is outside the range [1, {advertised}]"),
        ));
    }
    Ok(())
}

impl Drop for DeviceRuntimeState {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for DeviceRuntimeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceRuntimeState")
            .field("id", &self.id)
            .field("platform", &self.platform.name())
            .field("devices", &self.devices.len())
            .field("policy", &self.policy)
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}
