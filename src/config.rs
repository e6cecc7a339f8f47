//! Configuration types for supervised table extraction.
//!
//! Three structs cover every knob:
//!
//! * [`SupervisorConfig`]: per-call execution policy (isolation, deadline,
//!   input bound). Immutable for the lifetime of one call and always passed
//!   explicitly; nothing in the supervisor reads ambient process state.
//! * [`EngineOptions`]: the versioned capability set handed to the task body
//!   constructor, including opaque pass-through settings for the native
//!   numeric library.
//! * [`ServiceConfig`]: everything the HTTP service needs at startup.

use crate::error::ServiceError;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Current version of the [`EngineOptions`] layout.
pub const ENGINE_OPTIONS_VERSION: u32 = 1;

/// Execution policy for a single supervised call.
///
/// Built via [`SupervisorConfig::builder()`] or [`SupervisorConfig::default()`].
///
/// # Example
/// ```rust
/// use std::time::Duration;
/// use tablevisor::SupervisorConfig;
///
/// let config = SupervisorConfig::builder()
///     .deadline(Duration::from_secs(30))
///     .max_dimension(1600)
///     .build()
///     .unwrap();
/// assert!(config.isolation);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorConfig {
    /// Run the task body in a disposable worker process. Default: true.
    ///
    /// When false the in-process fallback executor is used, which has no
    /// crash or timeout protection.
    pub isolation: bool,

    /// Wall-clock limit for one worker invocation. Default: 55 s.
    pub deadline: Duration,

    /// Longest side of the preprocessed raster, in pixels. Default: 1800.
    ///
    /// Bounds worst-case memory in the worker and the size of the request
    /// written over the IPC pipe (`max_dimension² × 3` bytes before base64).
    pub max_dimension: u32,

    /// Time between SIGTERM and SIGKILL when a worker must be stopped. Default: 2 s.
    pub kill_grace: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            isolation: true,
            deadline: Duration::from_secs(55),
            max_dimension: 1800,
            kill_grace: Duration::from_secs(2),
        }
    }
}

impl SupervisorConfig {
    /// Create a new builder for `SupervisorConfig`.
    pub fn builder() -> SupervisorConfigBuilder {
        SupervisorConfigBuilder {
            config: Self::default(),
        }
    }
}

/// Builder for [`SupervisorConfig`].
#[derive(Debug)]
pub struct SupervisorConfigBuilder {
    config: SupervisorConfig,
}

impl SupervisorConfigBuilder {
    pub fn isolation(mut self, enabled: bool) -> Self {
        self.config.isolation = enabled;
        self
    }

    pub fn deadline(mut self, deadline: Duration) -> Self {
        self.config.deadline = deadline;
        self
    }

    pub fn deadline_secs(mut self, secs: u64) -> Self {
        self.config.deadline = Duration::from_secs(secs);
        self
    }

    pub fn max_dimension(mut self, px: u32) -> Self {
        self.config.max_dimension = px.max(32);
        self
    }

    pub fn kill_grace(mut self, grace: Duration) -> Self {
        self.config.kill_grace = grace;
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<SupervisorConfig, ServiceError> {
        if self.config.deadline.is_zero() {
            return Err(ServiceError::InvalidConfig(
                "Deadline must be greater than zero".into(),
            ));
        }
        Ok(self.config)
    }
}

/// Options passed to the task body constructor.
///
/// Versioned so a worker built from a different release can refuse options
/// it does not understand instead of silently misreading them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineOptions {
    /// Layout version, see [`ENGINE_OPTIONS_VERSION`].
    pub version: u32,
    /// Path to the rten text-detection model.
    pub detection_model: PathBuf,
    /// Path to the rten text-recognition model.
    pub recognition_model: PathBuf,
    /// Thread count for the numeric backend, exported to the worker as
    /// `RAYON_NUM_THREADS`. `None` leaves the backend default.
    pub num_threads: Option<usize>,
    /// Extra environment for the worker process, passed through untouched.
    #[serde(default)]
    pub env: Vec<(String, String)>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            version: ENGINE_OPTIONS_VERSION,
            detection_model: PathBuf::from("models/text-detection.rten"),
            recognition_model: PathBuf::from("models/text-recognition.rten"),
            num_threads: None,
            env: Vec::new(),
        }
    }
}

impl EngineOptions {
    /// Environment the worker process is spawned with.
    pub fn worker_env(&self) -> Vec<(String, String)> {
        let mut vars = Vec::with_capacity(self.env.len() + 1);
        if let Some(n) = self.num_threads {
            vars.push(("RAYON_NUM_THREADS".to_string(), n.to_string()));
        }
        vars.extend(self.env.iter().cloned());
        vars
    }
}

/// Parse a `KEY=VALUE,KEY=VALUE` list into environment pairs.
///
/// Entries without `=` or with an empty key are rejected.
pub fn parse_env_list(s: &str) -> Result<Vec<(String, String)>, ServiceError> {
    s.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| match entry.split_once('=') {
            Some((k, v)) if !k.trim().is_empty() => Ok((k.trim().to_string(), v.to_string())),
            _ => Err(ServiceError::InvalidConfig(format!(
                "Invalid worker env entry '{entry}', expected KEY=VALUE"
            ))),
        })
        .collect()
}

/// Startup configuration for the HTTP service.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Listen address. Default: 0.0.0.0:8000.
    pub bind: SocketAddr,
    /// Per-call execution policy.
    pub supervisor: SupervisorConfig,
    /// Options for the task body.
    pub engine: EngineOptions,
    /// Pre-load the task body in the background at startup. Default: false.
    pub warmup: bool,
    /// Maximum simultaneously running tasks; 0 means unlimited. Default: number of CPUs.
    pub max_concurrent_workers: usize,
    /// Request body limit for uploads. Default: 32 MiB.
    pub max_upload_bytes: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 8000)),
            supervisor: SupervisorConfig::default(),
            engine: EngineOptions::default(),
            warmup: false,
            max_concurrent_workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            max_upload_bytes: 32 * 1024 * 1024,
        }
    }
}
