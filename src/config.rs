//! Context configuration and process-wide initialization

use crate::error::Result;
use crate::runtime::gpu::{DeviceErrorPolicy, DevicePlatform};
use std::fmt;
use std::sync::Arc;

/// Environment variables consulted for the intra-op thread count, in order
pub const THREAD_ENV_VARS: [&str; 3] = ["TESSERA_NUM_THREADS", "OMP_NUM_THREADS", "MKL_NUM_THREADS"];

/// Settings a [`Context`](crate::dispatch::Context) is built from
///
/// # Example
///
/// ```
/// use tessera::config::ContextConfig;
///
/// let config = ContextConfig::default()
///     .with_cpu_zero_fill(false)
///     .with_num_threads(4);
/// assert_eq!(config.num_threads, Some(4));
/// ```
#[derive(Clone)]
pub struct ContextConfig {
    /// Device platform brought up on first GPU lookup; `None` leaves GPU
    /// backends disabled
    pub platform: Option<Arc<dyn DevicePlatform>>,
    /// What a failing checked device call does
    pub device_error_policy: DeviceErrorPolicy,
    /// Register the caching device allocator instead of the direct one
    pub caching_allocator: bool,
    /// Zero-fill fresh host allocations
    pub cpu_zero_fill: bool,
    /// Track live host allocations in a `MemoryReporter`
    pub report_cpu_memory: bool,
    /// Intra-op thread count applied by [`init`]
    pub num_threads: Option<usize>,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            platform: None,
            device_error_policy: DeviceErrorPolicy::default(),
            caching_allocator: true,
            cpu_zero_fill: true,
            report_cpu_memory: false,
            num_threads: None,
        }
    }
}

impl ContextConfig {
    /// Defaults with the thread count taken from the environment
    pub fn from_env() -> Self {
        Self {
            num_threads: threads_from(|name| std::env::var(name).ok()),
            ..Self::default()
        }
    }

    /// Use `platform` for GPU backends
    pub fn with_platform(mut self, platform: Arc<dyn DevicePlatform>) -> Self {
        self.platform = Some(platform);
        self
    }

    /// Set the device error policy
    pub fn with_device_error_policy(mut self, policy: DeviceErrorPolicy) -> Self {
        self.device_error_policy = policy;
        self
    }

    /// Choose between the caching and the direct device allocator
    pub fn with_caching_allocator(mut self, enabled: bool) -> Self {
        self.caching_allocator = enabled;
        self
    }

    /// Set whether host allocations are zero-filled
    pub fn with_cpu_zero_fill(mut self, enabled: bool) -> Self {
        self.cpu_zero_fill = enabled;
        self
    }

    /// Set whether host allocations are reported
    pub fn with_cpu_memory_report(mut self, enabled: bool) -> Self {
        self.report_cpu_memory = enabled;
        self
    }

    /// Set the intra-op thread count
    pub fn with_num_threads(mut self, threads: usize) -> Self {
        self.num_threads = Some(threads);
        self
    }
}

impl fmt::Debug for ContextConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextConfig")
            .field("platform", &self.platform.as_ref().map(|p| p.name()))
            .field("device_error_policy", &self.device_error_policy)
            .field("caching_allocator", &self.caching_allocator)
            .field("cpu_zero_fill", &self.cpu_zero_fill)
            .field("report_cpu_memory", &self.report_cpu_memory)
            .field("num_threads", &self.num_threads)
            .finish()
    }
}

/// First positive thread count among [`THREAD_ENV_VARS`]
fn threads_from(lookup: impl Fn(&str) -> Option<String>) -> Option<usize> {
    THREAD_ENV_VARS.iter().find_map(|name| {
        let value = lookup(name)?;
        match value.trim().parse::<usize>() {
            Ok(threads) if threads > 0 => Some(threads),
            _ => {
                tracing::warn!(var = name, %value, "ignoring invalid thread count");
                None
            }
        }
    })
}

/// Apply process-wide settings of the global context
///
/// Sizes the rayon global pool from the configured thread count. Calling
/// this more than once, or after rayon has started its pool, is harmless:
/// the existing pool is kept.
pub fn init() -> Result<()> {
    let config = crate::dispatch::global_context().config();
    #[cfg(feature = "rayon")]
    if let Some(threads) = config.num_threads {
        match rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build_global()
        {
            Ok(()) => tracing::info!(threads, "configured intra-op thread pool"),
            Err(err) => tracing::debug!(%err, "intra-op thread pool already initialized"),
        }
    }
    #[cfg(not(feature = "rayon"))]
    if let Some(threads) = config.num_threads {
        tracing::debug!(threads, "thread count ignored without the rayon feature");
    }
    Ok(())
}
