//! Worker-process side of the IPC protocol.
//!
//! Runs inside `tablevisor worker`: read one request from stdin, load the
//! engine, run the task body once, write exactly one message to stdout,
//! exit. A panic in the task body is caught and reported as a failure; an
//! abort, a fatal signal or a hang is left for the supervisor to observe.

use crate::config::EngineOptions;
use crate::engine::{load_engine, TableEngine};
use crate::error::EngineError;
use crate::pipeline::ipc::{self, WorkerMessage};
use std::io::{self, BufRead, Write};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, error, info};

/// Serve one request over stdio and return the process exit code.
pub fn run_worker() -> i32 {
    let stdin = io::stdin();
    let message = handle_request(stdin.lock(), load_engine);

    let stdout = io::stdout();
    match write_message(stdout.lock(), &message) {
        Ok(()) => 0,
        Err(e) => {
            error!("Failed to write result: {e}");
            1
        }
    }
}

/// Read one request from `reader` and run it through the engine built by `load`.
pub fn handle_request<R, L>(mut reader: R, load: L) -> WorkerMessage
where
    R: BufRead,
    L: FnOnce(&EngineOptions) -> Result<Arc<dyn TableEngine>, EngineError>,
{
    let mut line = String::new();
    if let Err(e) = reader.read_line(&mut line) {
        return WorkerMessage::Failure {
            message: format!("Failed to read request: {e}"),
        };
    }
    let request = match ipc::decode_request(&line) {
        Ok(r) => r,
        Err(message) => return WorkerMessage::Failure { message },
    };
    debug!(
        "Worker received {}x{} input",
        request.input.width, request.input.height
    );

    let engine = match panic::catch_unwind(AssertUnwindSafe(|| load(&request.engine))) {
        Ok(Ok(engine)) => engine,
        Ok(Err(e)) => {
            return WorkerMessage::InitFailed {
                message: e.to_string(),
            }
        }
        Err(payload) => {
            return WorkerMessage::InitFailed {
                message: format!("engine load panicked: {}", panic_message(payload.as_ref())),
            }
        }
    };

    match panic::catch_unwind(AssertUnwindSafe(|| engine.extract(&request.input))) {
        Ok(Ok(result)) => {
            info!("Task finished with {} bounding boxes", result.bboxes.len());
            WorkerMessage::Success { result }
        }
        Ok(Err(e)) => WorkerMessage::Failure {
            message: e.to_string(),
        },
        Err(payload) => WorkerMessage::Failure {
            message: format!("task panicked: {}", panic_message(payload.as_ref())),
        },
    }
}

/// Write `message` as one line and flush it.
pub fn write_message<W: Write>(mut writer: W, message: &WorkerMessage) -> io::Result<()> {
    let line = ipc::encode_line(message).map_err(io::Error::other)?;
    writer.write_all(&line)?;
    writer.flush()
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
