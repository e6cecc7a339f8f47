//! The real `tablevisor worker` subcommand behind the supervisor.
//!
//! No models are shipped with the crate, so these tests cover the paths
//! that do not need them: a worker that cannot load its engine, and a
//! protocol mismatch.

#![cfg(all(unix, feature = "cli"))]

use std::io::Write;
use std::process::{Command, Stdio};
use std::time::Duration;
use tablevisor::pipeline::ipc::{decode_message, encode_line, WorkerRequest};
use tablevisor::pipeline::prepare::TaskInput;
use tablevisor::{EngineOptions, ServiceError, Supervisor, SupervisorConfig, WorkerLauncher};

fn missing_models() -> EngineOptions {
    EngineOptions {
        detection_model: "/nonexistent/text-detection.rten".into(),
        recognition_model: "/nonexistent/text-recognition.rten".into(),
        ..EngineOptions::default()
    }
}

#[tokio::test]
async fn test_worker_without_models_reports_init_failure() {
    let launcher = WorkerLauncher::new(env!("CARGO_BIN_EXE_tablevisor")).arg("worker");
    let supervisor = Supervisor::new(launcher, missing_models());
    let config = SupervisorConfig::builder()
        .deadline(Duration::from_secs(30))
        .build()
        .unwrap();

    let err = supervisor
        .run(TaskInput::blank(32, 32), &config)
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::EngineInitFailed(_)), "got: {err}");
}

#[test]
fn test_worker_rejects_protocol_mismatch() {
    let mut request = WorkerRequest::new(missing_models(), TaskInput::blank(2, 2));
    request.protocol = 99;

    let mut child = Command::new(env!("CARGO_BIN_EXE_tablevisor"))
        .arg("worker")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();
    child
        .stdin
        .take()
        .unwrap()
        .write_all(&encode_line(&request).unwrap())
        .unwrap();
    let output = child.wait_with_output().unwrap();

    assert!(output.status.success());
    let line = String::from_utf8(output.stdout).unwrap();
    assert_eq!(line.lines().count(), 1, "exactly one message: {line}");
    let message = format!("{:?}", decode_message(&line));
    assert!(message.contains("Protocol mismatch"), "got: {message}");
}
