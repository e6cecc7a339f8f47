//! In-process fallback executor.
//!
//! Runs the task body on the blocking pool of the current process. Selected
//! only when isolation is disabled in configuration. There is no deadline
//! and no crash protection here: a hang occupies a blocking thread for good
//! and a fatal signal takes the whole service down.

use crate::engine::EngineHolder;
use crate::error::ServiceError;
use crate::outcome::TaskOutcome;
use crate::pipeline::prepare::TaskInput;
use crate::pipeline::worker::panic_message;
use std::sync::Arc;
use tracing::warn;

/// Run one task directly in this process.
///
/// Engine errors and panics become [`TaskOutcome::Failure`]; only a failed
/// engine load is returned as `Err`.
pub async fn run_inline(
    holder: Arc<EngineHolder>,
    input: TaskInput,
) -> Result<TaskOutcome, ServiceError> {
    let joined = tokio::task::spawn_blocking(move || {
        let engine = holder.get()?;
        Ok::<_, ServiceError>(engine.extract(&input))
    })
    .await;

    match joined {
        Ok(Ok(Ok(result))) => Ok(TaskOutcome::Success(result)),
        Ok(Ok(Err(e))) => {
            warn!("Inline task failed: {e}");
            Ok(TaskOutcome::Failure(e.to_string()))
        }
        Ok(Err(e)) => Err(e),
        Err(e) if e.is_panic() => {
            let message = format!("task panicked: {}", panic_message(e.into_panic().as_ref()));
            warn!("Inline {message}");
            Ok(TaskOutcome::Failure(message))
        }
        Err(e) => Err(ServiceError::Internal(format!("Task join error: {e}"))),
    }
}
