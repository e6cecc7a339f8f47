//! The task body: table-structure extraction from a raster.
//!
//! Everything outside this module treats the engine as opaque. It consumes
//! one [`TaskInput`] and either returns a [`TableResult`] or reports an
//! [`EngineError`]; it may also crash or hang, which is why the supervisor
//! normally runs it in a disposable worker process.
//!
//! The engine is built from an explicit [`EngineOptions`] value. Nothing here
//! reads global flags or patches the backend at runtime.

pub mod layout;
#[cfg(feature = "ocr")]
pub mod ocr;

use crate::config::{EngineOptions, ENGINE_OPTIONS_VERSION};
use crate::error::{EngineError, ServiceError};
use crate::outcome::TableResult;
use crate::pipeline::prepare::TaskInput;
use once_cell::sync::OnceCell;
use std::fmt;
use std::sync::Arc;
use tracing::info;

/// A loaded task body.
pub trait TableEngine: Send + Sync {
    /// Extract table structure from one preprocessed raster.
    fn extract(&self, input: &TaskInput) -> Result<TableResult, EngineError>;
}

/// Construct the engine described by `options`.
pub fn load_engine(options: &EngineOptions) -> Result<Arc<dyn TableEngine>, EngineError> {
    if options.version != ENGINE_OPTIONS_VERSION {
        return Err(EngineError::Init(format!(
            "Unsupported engine options v{} (expected v{ENGINE_OPTIONS_VERSION})",
            options.version
        )));
    }
    load_backend(options)
}

#[cfg(feature = "ocr")]
fn load_backend(options: &EngineOptions) -> Result<Arc<dyn TableEngine>, EngineError> {
    Ok(Arc::new(ocr::OcrTableEngine::load(options)?))
}

#[cfg(not(feature = "ocr"))]
fn load_backend(_options: &EngineOptions) -> Result<Arc<dyn TableEngine>, EngineError> {
    Err(EngineError::Init(
        "tablevisor was built without the `ocr` feature".into(),
    ))
}

type EngineFactory = dyn Fn() -> Result<Arc<dyn TableEngine>, EngineError> + Send + Sync;

/// Lazily constructed engine shared for the lifetime of the service.
///
/// The first caller runs the factory while later callers block on the same
/// cell, so at most one initialisation is in flight. A failed initialisation
/// leaves the holder empty and the next call tries again.
pub struct EngineHolder {
    cell: OnceCell<Arc<dyn TableEngine>>,
    factory: Box<EngineFactory>,
}

impl fmt::Debug for EngineHolder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineHolder")
            .field("loaded", &self.cell.get().is_some())
            .finish()
    }
}

impl EngineHolder {
    /// Holder that loads the engine described by `options` on first use.
    pub fn new(options: EngineOptions) -> Self {
        Self::with_factory(move || load_engine(&options))
    }

    /// Holder with a custom constructor.
    pub fn with_factory<F>(factory: F) -> Self
    where
        F: Fn() -> Result<Arc<dyn TableEngine>, EngineError> + Send + Sync + 'static,
    {
        Self {
            cell: OnceCell::new(),
            factory: Box::new(factory),
        }
    }

    /// Return the engine, constructing it if needed.
    ///
    /// Blocks while another thread is initialising; call from a blocking
    /// context.
    pub fn get(&self) -> Result<Arc<dyn TableEngine>, ServiceError> {
        self.cell
            .get_or_try_init(|| {
                info!("Loading table engine");
                (self.factory)()
            })
            .cloned()
            .map_err(ServiceError::from)
    }

    /// Whether the engine has been constructed.
    pub fn is_loaded(&self) -> bool {
        self.cell.get().is_some()
    }
}
