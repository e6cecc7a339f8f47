//! Error types for the tablevisor library.
//!
//! Two distinct kinds of failure exist:
//!
//! * [`ServiceError`]: **Fatal for the request**: the task could not be run
//!   at all (the upload is not an image, the engine cannot be loaded, the
//!   parent could not spawn a worker). Returned as `Err(ServiceError)`.
//!
//! * [`crate::outcome::TaskOutcome`]: **Everything that happens once a task
//!   runs**: success, a reported failure, a crash, a timeout or a protocol
//!   violation. These are values, not errors; nothing a worker does can
//!   surface as an `Err` in the parent except a reported engine-init failure.
//!
//! [`EngineError`] is what the task body itself returns.

use thiserror::Error;

/// Fatal, per-request errors returned by the tablevisor library.
#[derive(Debug, Error)]
pub enum ServiceError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// The uploaded bytes could not be decoded as an image.
    #[error("Invalid image: {0}")]
    Decode(String),

    // ── Engine errors ─────────────────────────────────────────────────────
    /// The task body failed to load (missing model files, bad options).
    #[error("Backend not ready: {0}")]
    EngineInitFailed(String),

    // ── Process errors ────────────────────────────────────────────────────
    /// The parent could not start a worker process at all.
    #[error("Failed to spawn worker '{program}': {source}")]
    SpawnFailed {
        program: String,
        #[source]
        source: std::io::Error,
    },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Errors reported by a [`crate::engine::TableEngine`].
///
/// The `Inference` message is carried verbatim into
/// [`crate::outcome::TaskOutcome::Failure`], so its display is the bare text.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    /// The engine could not be constructed.
    #[error("{0}")]
    Init(String),

    /// The engine ran but could not produce a result.
    #[error("{0}")]
    Inference(String),
}

impl From<EngineError> for ServiceError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::Init(msg) => ServiceError::EngineInitFailed(msg),
            EngineError::Inference(msg) => ServiceError::Internal(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_display() {
        let e = ServiceError::Decode("unsupported format".into());
        assert_eq!(e.to_string(), "Invalid image: unsupported format");
    }

    #[test]
    fn engine_init_display() {
        let e = ServiceError::EngineInitFailed("model not found".into());
        assert!(e.to_string().starts_with("Backend not ready"));
        assert!(e.to_string().contains("model not found"));
    }

    #[test]
    fn spawn_failed_keeps_source() {
        let e = ServiceError::SpawnFailed {
            program: "/nope".into(),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        };
        assert!(e.to_string().contains("/nope"));
        assert!(std::error::Error::source(&e).is_some());
    }

    #[test]
    fn inference_message_is_verbatim() {
        assert_eq!(EngineError::Inference("OOM".into()).to_string(), "OOM");
    }

    #[test]
    fn engine_init_converts() {
        let e: ServiceError = EngineError::Init("no models".into()).into();
        assert!(matches!(e, ServiceError::EngineInitFailed(ref m) if m == "no models"));
    }
}
