//! Process context: dispatch cells, allocators, kernels, device runtime

use super::{Backend, DispatchKey, KernelTable, OperatorTable, StridedKernels};
use crate::config::ContextConfig;
use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::runtime::cpu::{CpuAllocator, MemoryReporter};
use crate::runtime::gpu::{CachingDeviceAllocator, DeviceAllocator, DeviceRuntimeState};
use crate::runtime::{Allocator, AllocatorRegistry, DeviceType};
use parking_lot::RwLock;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

/// Ids handed to dispatch cells; 0 is the sentinel
static NEXT_TYPE_ID: AtomicUsize = AtomicUsize::new(1);

/// Next process-wide unique cell id
pub fn fresh_type_id() -> usize {
    NEXT_TYPE_ID.fetch_add(1, Ordering::Relaxed)
}

/// Everything a tensor needs to find its memory and kernels
///
/// A context is built explicitly and passed by reference; tests create a
/// fresh one each. [`global_context`] holds the process-wide instance.
pub struct Context {
    config: ContextConfig,
    allocators: Arc<AllocatorRegistry>,
    cpu_reporter: Option<Arc<MemoryReporter>>,
    kernels: RwLock<[Option<Arc<dyn KernelTable>>; Backend::COUNT]>,
    /// Set once any cell of the backend has been resolved
    materialized: [AtomicBool; Backend::COUNT],
    cells: Box<[OnceLock<Option<Arc<OperatorTable>>>]>,
    gpu: OnceLock<Result<Option<Arc<DeviceRuntimeState>>>>,
}

impl Context {
    /// Build a context with the host allocator and strided CPU kernels
    ///
    /// The device runtime is not touched until the first GPU lookup.
    pub fn new(config: ContextConfig) -> Self {
        let allocators = Arc::new(AllocatorRegistry::new());
        let cpu_reporter = config
            .report_cpu_memory
            .then(|| Arc::new(MemoryReporter::new()));
        let mut cpu = CpuAllocator::new().with_zero_fill(config.cpu_zero_fill);
        if let Some(reporter) = &cpu_reporter {
            cpu = cpu.with_reporter(Arc::clone(reporter));
        }
        allocators.replace(Arc::new(cpu));

        let mut kernels: [Option<Arc<dyn KernelTable>>; Backend::COUNT] = Default::default();
        kernels[Backend::Cpu.index()] = Some(Arc::new(StridedKernels));

        Self {
            config,
            allocators,
            cpu_reporter,
            kernels: RwLock::new(kernels),
            materialized: Default::default(),
            cells: (0..DispatchKey::CELLS).map(|_| OnceLock::new()).collect(),
            gpu: OnceLock::new(),
        }
    }

    /// Configuration this context was built from
    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    /// Allocator registry shared by every cell
    pub fn allocators(&self) -> &Arc<AllocatorRegistry> {
        &self.allocators
    }

    /// Host memory reporter, when enabled in the config
    pub fn cpu_memory_reporter(&self) -> Option<&Arc<MemoryReporter>> {
        self.cpu_reporter.as_ref()
    }

    /// Swap the allocator for its device type, returning the previous one
    ///
    /// Tensors already allocated keep the allocator that created them.
    pub fn set_allocator(&self, allocator: Arc<dyn Allocator>) -> Option<Arc<dyn Allocator>> {
        tracing::debug!(device_type = %allocator.device_type(), "allocator replaced");
        self.allocators.replace(allocator)
    }

    /// Install the kernel table for `backend`
    ///
    /// Must happen before any cell of the backend is looked up.
    pub fn register_kernels(&self, backend: Backend, table: Arc<dyn KernelTable>) -> Result<()> {
        if backend == Backend::Undefined {
            return Err(Error::invalid_argument(
                "backend",
                "kernels cannot be registered for the undefined backend",
            ));
        }
        let mut kernels = self.kernels.write();
        if self.materialized[backend.index()].load(Ordering::Acquire) {
            return Err(Error::InvalidOperation(format!(
                "kernels for {backend} registered after its dispatch cells were created"
            )));
        }
        tracing::debug!(%backend, kernels = table.name(), "kernels registered");
        kernels[backend.index()] = Some(table);
        Ok(())
    }

    /// Kernel table registered for `backend`, as seen through its `dtype` cell
    pub fn kernel_table_for(&self, backend: Backend, dtype: DType) -> Result<Arc<dyn KernelTable>> {
        let table = self.get_operator_table_checked(backend, dtype)?;
        Ok(Arc::clone(table.kernels()?))
    }

    /// Next process-wide unique cell id
    pub fn fresh_type_id(&self) -> usize {
        fresh_type_id()
    }

    /// Bring up the device runtime, once
    ///
    /// Concurrent first callers block until the single initialization
    /// finishes and all observe its outcome. `Ok(None)` means no platform is
    /// configured. On success a device allocator and strided GPU kernels are
    /// registered unless the caller registered their own.
    pub fn lazy_init_gpu(&self) -> Result<Option<&Arc<DeviceRuntimeState>>> {
        match self.gpu.get_or_init(|| self.init_gpu()) {
            Ok(state) => Ok(state.as_ref()),
            Err(err) => Err(err.clone()),
        }
    }

    /// The device runtime, if it has been brought up successfully
    pub fn device_state(&self) -> Option<&Arc<DeviceRuntimeState>> {
        match self.gpu.get() {
            Some(Ok(state)) => state.as_ref(),
            _ => None,
        }
    }

    fn init_gpu(&self) -> Result<Option<Arc<DeviceRuntimeState>>> {
        let Some(platform) = self.config.platform.clone() else {
            tracing::debug!("no device platform configured; GPU backends disabled");
            return Ok(None);
        };
        let state = DeviceRuntimeState::init(platform, self.config.device_error_policy)?;

        if !self.allocators.contains(DeviceType::Cuda) {
            let allocator: Arc<dyn Allocator> = if self.config.caching_allocator {
                Arc::new(CachingDeviceAllocator::new(Arc::clone(&state)))
            } else {
                Arc::new(DeviceAllocator::new(Arc::clone(&state)))
            };
            self.allocators.replace(allocator);
        }
        let mut kernels = self.kernels.write();
        if kernels[Backend::Cuda.index()].is_none() {
            kernels[Backend::Cuda.index()] = Some(Arc::new(StridedKernels));
        }
        Ok(Some(state))
    }

    /// Dispatch cell for a non-variable (backend, dtype) pair
    ///
    /// Returns the sentinel when either axis is undefined and `None` when
    /// the backend has no kernels or its device runtime is unavailable.
    pub fn get_operator_table(
        &self,
        backend: Backend,
        dtype: DType,
    ) -> Result<Option<Arc<OperatorTable>>> {
        self.get_maybe_variable_table(backend, dtype, false)
    }

    /// Dispatch cell on the variable or non-variable plane
    pub fn get_maybe_variable_table(
        &self,
        backend: Backend,
        dtype: DType,
        is_variable: bool,
    ) -> Result<Option<Arc<OperatorTable>>> {
        let mut key = DispatchKey::new(backend, dtype);
        key.is_variable = is_variable;
        if key.is_undefined() {
            return Ok(Some(Arc::clone(OperatorTable::undefined())));
        }
        if backend.is_gpu() && self.lazy_init_gpu()?.is_none() {
            return Ok(None);
        }
        let cell = self.cells[key.cell_index()].get_or_init(|| self.materialize(key));
        Ok(cell.clone())
    }

    fn materialize(&self, key: DispatchKey) -> Option<Arc<OperatorTable>> {
        let kernels = self.kernels.read();
        self.materialized[key.backend.index()].store(true, Ordering::Release);
        let table = kernels[key.backend.index()].as_ref()?;
        let id = fresh_type_id();
        tracing::debug!(%key, id, kernels = table.name(), "dispatch cell created");
        Some(Arc::new(OperatorTable::new(
            id,
            key,
            Arc::clone(&self.allocators),
            Arc::clone(table),
        )))
    }

    /// Like [`get_operator_table`](Self::get_operator_table) but a missing
    /// cell is an error
    pub fn get_operator_table_checked(
        &self,
        backend: Backend,
        dtype: DType,
    ) -> Result<Arc<OperatorTable>> {
        self.get_operator_table(backend, dtype)?
            .ok_or(Error::TypeNotEnabled { backend, dtype })
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new(ContextConfig::default())
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cells = self
            .cells
            .iter()
            .filter(|cell| matches!(cell.get(), Some(Some(_))))
            .count();
        f.debug_struct("Context")
            .field("config", &self.config)
            .field("cells", &cells)
            .field("gpu_initialized", &self.gpu.get().is_some())
            .finish()
    }
}

/// The process-wide context, built from [`ContextConfig::from_env`] on first use
pub fn global_context() -> &'static Arc<Context> {
    static GLOBAL: OnceLock<Arc<Context>> = OnceLock::new();
    GLOBAL.get_or_init(|| Arc::new(Context::new(ContextConfig::from_env())))
}
