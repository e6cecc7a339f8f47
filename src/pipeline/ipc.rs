//! IPC protocol between the supervisor and a worker process.
//!
//! Uses JSON Lines over the child's stdio pipes:
//!
//! ```text
//! supervisor ── stdin ──▶ worker    one WorkerRequest line, then EOF
//! supervisor ◀─ stdout ── worker    one WorkerMessage line, then exit
//! ```
//!
//! stderr is not part of the protocol; the worker logs there and the
//! parent inherits it. Only serialized, tagged data crosses the boundary:
//! no error type, panic or exception is ever propagated as such.

use crate::config::EngineOptions;
use crate::outcome::{ReceivedMessage, TableResult};
use crate::pipeline::prepare::TaskInput;
use serde::{Deserialize, Serialize};

/// Bumped whenever [`WorkerRequest`] or [`WorkerMessage`] change shape.
pub const PROTOCOL_VERSION: u32 = 1;

/// Upper bound on the size of a worker's result line.
pub const MAX_MESSAGE_BYTES: u64 = 16 * 1024 * 1024;

/// The single request written to a worker's stdin.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WorkerRequest {
    pub protocol: u32,
    pub engine: EngineOptions,
    pub input: TaskInput,
}

impl WorkerRequest {
    pub fn new(engine: EngineOptions, input: TaskInput) -> Self {
        Self {
            protocol: PROTOCOL_VERSION,
            engine,
            input,
        }
    }
}

/// The single message a worker writes to stdout.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WorkerMessage {
    /// The task body produced a result.
    Success { result: TableResult },
    /// The task body ran and reported an error.
    Failure { message: String },
    /// The task body could not be loaded.
    InitFailed { message: String },
}

/// Serialize a value as one newline-terminated JSON line.
pub fn encode_line<T: Serialize>(value: &T) -> Result<Vec<u8>, serde_json::Error> {
    let mut line = serde_json::to_vec(value)?;
    line.push(b'\n');
    Ok(line)
}

/// Parse and validate a result line received from a worker.
pub fn decode_message(line: &str) -> ReceivedMessage {
    let message: WorkerMessage = match serde_json::from_str(line.trim()) {
        Ok(m) => m,
        Err(e) => return ReceivedMessage::Malformed(e.to_string()),
    };
    if let WorkerMessage::Success { ref result } = message {
        if let Err(detail) = result.validate() {
            return ReceivedMessage::Malformed(detail);
        }
    }
    ReceivedMessage::Valid(message)
}

/// Whether bytes read from a worker's stdout form a finished line:
/// newline-terminated, or cut at [`MAX_MESSAGE_BYTES`].
pub fn is_complete_line(line: &[u8]) -> bool {
    line.ends_with(b"\n") || line.len() as u64 >= MAX_MESSAGE_BYTES
}

/// Decode raw worker output.
///
/// An unfinished line that does not parse was cut off mid-write and comes
/// back as [`ReceivedMessage::Truncated`].
pub fn decode_output(line: &[u8]) -> ReceivedMessage {
    match decode_message(&String::from_utf8_lossy(line)) {
        ReceivedMessage::Malformed(detail) if !is_complete_line(line) => {
            ReceivedMessage::Truncated(detail)
        }
        other => other,
    }
}

/// Parse and validate a request line received by a worker.
pub fn decode_request(line: &str) -> Result<WorkerRequest, String> {
    let request: WorkerRequest =
        serde_json::from_str(line.trim()).map_err(|e| format!("Parse error: {e}"))?;
    if request.protocol != PROTOCOL_VERSION {
        return Err(format!(
            "Protocol mismatch: worker speaks v{PROTOCOL_VERSION}, request is v{}",
            request.protocol
        ));
    }
    request.input.validate()?;
    Ok(request)
}

/// Serde adapter carrying raw bytes as a standard base64 string.
pub mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
