//! Supervisor integration tests against real child processes.
//!
//! Each test launches `/bin/sh -c <script>` as the worker. The scripts stand
//! in for the task body: they answer over the IPC protocol, hang, exit
//! without reporting or kill themselves with a signal.
//!
//! Run with:
//!   cargo test --test supervisor -- --nocapture

#![cfg(unix)]

use std::sync::Arc;
use std::time::{Duration, Instant};
use tablevisor::pipeline::prepare::TaskInput;
use tablevisor::{
    EngineOptions, ServiceError, Supervisor, SupervisorConfig, TableResult, TaskOutcome,
    WorkerLauncher,
};
use tokio_test::{assert_err, assert_ok};

// ── Test helpers ─────────────────────────────────────────────────────────────

const SUCCESS_LINE: &str = r#"{"status":"success","result":{"html":"<table><tr><td>7</td></tr></table>","cells":[["7"]],"csv":"7","bboxes":[{"x":4,"y":5,"w":60,"h":20}],"confidence":0.8}}"#;

fn sh_worker(script: &str) -> Supervisor {
    sh_worker_with_args(script, &[])
}

fn sh_worker_with_args(script: &str, args: &[&str]) -> Supervisor {
    let mut launcher = WorkerLauncher::new("/bin/sh").arg("-c").arg(script).arg("worker");
    for a in args {
        launcher = launcher.arg(*a);
    }
    Supervisor::new(launcher, EngineOptions::default())
}

fn config(deadline: Duration) -> SupervisorConfig {
    SupervisorConfig::builder()
        .deadline(deadline)
        .kill_grace(Duration::from_millis(200))
        .build()
        .unwrap()
}

fn input() -> TaskInput {
    TaskInput::blank(8, 8)
}

fn process_alive(pid: i32) -> bool {
    // A zombie has already exited; only its parent's wait is outstanding.
    if let Ok(stat) = std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        return !stat
            .rsplit(')')
            .next()
            .is_some_and(|rest| rest.trim_start().starts_with('Z'));
    }
    // Signal 0 only checks for existence; a reaped pid reports ESRCH.
    unsafe { libc::kill(pid, 0) == 0 }
}

/// Poll until `pid` is gone. Processes we did not reap die asynchronously.
async fn gone_within(pid: i32, limit: Duration) -> bool {
    let started = Instant::now();
    while started.elapsed() < limit {
        if !process_alive(pid) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    !process_alive(pid)
}

fn read_pid(path: &std::path::Path) -> i32 {
    std::fs::read_to_string(path)
        .unwrap()
        .trim()
        .parse()
        .unwrap()
}

// ── Outcomes ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_success_payload_passes_through() {
    let script = format!("cat >/dev/null; printf '%s\\n' '{SUCCESS_LINE}'");
    let outcome = assert_ok!(sh_worker(&script).run(input(), &config(Duration::from_secs(10))).await);
    match outcome {
        TaskOutcome::Success(result) => {
            assert_eq!(result.csv.as_deref(), Some("7"));
            assert_eq!(result.cells, Some(vec![vec!["7".to_string()]]));
            assert_eq!(result.confidence, 0.8);
            assert_eq!(result.bboxes.len(), 1);
        }
        other => panic!("expected success, got {other:?}"),
    }
}

#[tokio::test]
async fn test_reported_failure_keeps_exact_message() {
    let script = r#"cat >/dev/null; printf '%s\n' '{"status":"failure","message":"OOM"}'"#;
    let outcome = assert_ok!(sh_worker(script).run(input(), &config(Duration::from_secs(10))).await);
    assert_eq!(outcome, TaskOutcome::Failure("OOM".into()));
}

#[tokio::test]
async fn test_fatal_signal_is_crash_with_signal_number() {
    let script = "cat >/dev/null; kill -s ILL $$";
    let outcome = assert_ok!(sh_worker(script).run(input(), &config(Duration::from_secs(10))).await);
    assert_eq!(outcome, TaskOutcome::Crash(Some(libc::SIGILL)));
    assert_eq!(outcome.to_string(), "backend crashed (signal=4)");
}

#[tokio::test]
async fn test_clean_exit_without_message_is_protocol_violation() {
    let script = "cat >/dev/null; exit 0";
    let outcome = assert_ok!(sh_worker(script).run(input(), &config(Duration::from_secs(10))).await);
    assert_eq!(outcome, TaskOutcome::ProtocolViolation("no result".into()));
}

#[tokio::test]
async fn test_nonzero_exit_without_message_is_crash() {
    let script = "cat >/dev/null; exit 3";
    let outcome = assert_ok!(sh_worker(script).run(input(), &config(Duration::from_secs(10))).await);
    assert_eq!(outcome, TaskOutcome::Crash(None));
}

#[tokio::test]
async fn test_garbage_output_is_malformed() {
    let script = "cat >/dev/null; echo 'this is not json'";
    let outcome = assert_ok!(sh_worker(script).run(input(), &config(Duration::from_secs(10))).await);
    match outcome {
        TaskOutcome::ProtocolViolation(detail) => {
            assert!(detail.starts_with("malformed result:"), "got: {detail}")
        }
        other => panic!("expected protocol violation, got {other:?}"),
    }
}

#[tokio::test]
async fn test_worker_that_never_reads_stdin() {
    // Larger than a pipe buffer, so the request write hits a closed pipe.
    let big = TaskInput::blank(200, 200);
    let outcome = assert_ok!(sh_worker("exit 0").run(big, &config(Duration::from_secs(10))).await);
    assert_eq!(outcome, TaskOutcome::ProtocolViolation("no result".into()));
}

#[tokio::test]
async fn test_signal_mid_write_is_crash() {
    let script = r#"cat >/dev/null; printf '{"status":"succ'; kill -s ILL $$"#;
    let outcome = assert_ok!(sh_worker(script).run(input(), &config(Duration::from_secs(10))).await);
    assert_eq!(outcome, TaskOutcome::Crash(Some(libc::SIGILL)));
}

#[tokio::test]
async fn test_crash_with_descendant_holding_stdout() {
    let dir = tempfile::tempdir().unwrap();
    let pid_file = dir.path().join("pid");
    let pid_arg = pid_file.to_string_lossy().into_owned();
    let supervisor = sh_worker_with_args(
        r#"cat >/dev/null; sleep 30 & echo $! > "$1"; kill -s ILL $$"#,
        &[&pid_arg],
    );

    let started = Instant::now();
    let outcome = assert_ok!(supervisor.run(input(), &config(Duration::from_secs(10))).await);
    assert_eq!(outcome, TaskOutcome::Crash(Some(libc::SIGILL)));
    assert!(started.elapsed() < Duration::from_secs(5), "took {:?}", started.elapsed());
    assert!(
        gone_within(read_pid(&pid_file), Duration::from_secs(2)).await,
        "descendant survived the worker"
    );
}

#[tokio::test]
async fn test_init_failure_is_service_error() {
    let script = r#"cat >/dev/null; printf '%s\n' '{"status":"init_failed","message":"model file not found"}'"#;
    let err = assert_err!(sh_worker(script).run(input(), &config(Duration::from_secs(10))).await);
    match err {
        ServiceError::EngineInitFailed(msg) => assert_eq!(msg, "model file not found"),
        other => panic!("expected init failure, got {other:?}"),
    }
}

// ── Deadline & reaping ───────────────────────────────────────────────────────

#[tokio::test]
async fn test_hang_times_out_and_worker_is_gone() {
    let dir = tempfile::tempdir().unwrap();
    let pid_file = dir.path().join("pid");
    let pid_arg = pid_file.to_string_lossy().into_owned();
    let supervisor = sh_worker_with_args(r#"echo $$ > "$1"; exec sleep 60"#, &[&pid_arg]);

    let started = Instant::now();
    let outcome = assert_ok!(supervisor.run(input(), &config(Duration::from_secs(1))).await);
    assert_eq!(outcome, TaskOutcome::Timeout);
    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(!process_alive(read_pid(&pid_file)), "worker survived the deadline");
}

#[tokio::test]
async fn test_sigterm_ignoring_worker_is_killed() {
    let dir = tempfile::tempdir().unwrap();
    let pid_file = dir.path().join("pid");
    let pid_arg = pid_file.to_string_lossy().into_owned();
    let supervisor = sh_worker_with_args(
        r#"trap '' TERM; echo $$ > "$1"; cat >/dev/null; while :; do sleep 1; done"#,
        &[&pid_arg],
    );

    let outcome = assert_ok!(supervisor.run(input(), &config(Duration::from_millis(500))).await);
    assert_eq!(outcome, TaskOutcome::Timeout);
    assert!(!process_alive(read_pid(&pid_file)));
}

#[tokio::test]
async fn test_timeout_takes_descendants_down() {
    let dir = tempfile::tempdir().unwrap();
    let pid_file = dir.path().join("pid");
    let pid_arg = pid_file.to_string_lossy().into_owned();
    let supervisor = sh_worker_with_args(
        r#"sleep 60 & echo $! > "$1"; cat >/dev/null; wait"#,
        &[&pid_arg],
    );

    let outcome = assert_ok!(supervisor.run(input(), &config(Duration::from_secs(1))).await);
    assert_eq!(outcome, TaskOutcome::Timeout);
    assert!(gone_within(read_pid(&pid_file), Duration::from_secs(2)).await);
}

#[tokio::test]
async fn test_dropped_call_kills_worker() {
    let dir = tempfile::tempdir().unwrap();
    let pid_file = dir.path().join("pid");
    let pid_arg = pid_file.to_string_lossy().into_owned();
    let supervisor = sh_worker_with_args(r#"echo $$ > "$1"; exec sleep 60"#, &[&pid_arg]);

    // The caller gives up long before the deadline.
    let abandoned = tokio::time::timeout(
        Duration::from_secs(1),
        supervisor.run(input(), &config(Duration::from_secs(30))),
    )
    .await;
    assert!(abandoned.is_err());
    assert!(
        gone_within(read_pid(&pid_file), Duration::from_secs(2)).await,
        "worker survived its caller"
    );
}

#[tokio::test]
async fn test_lingering_worker_after_message_is_reaped() {
    let dir = tempfile::tempdir().unwrap();
    let pid_file = dir.path().join("pid");
    let pid_arg = pid_file.to_string_lossy().into_owned();
    let supervisor = sh_worker_with_args(
        r#"echo $$ > "$1"; cat >/dev/null; printf '%s\n' '{"status":"failure","message":"late"}'; exec sleep 60"#,
        &[&pid_arg],
    );

    let started = Instant::now();
    let outcome = assert_ok!(supervisor.run(input(), &config(Duration::from_secs(30))).await);
    assert_eq!(outcome, TaskOutcome::Failure("late".into()));
    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(!process_alive(read_pid(&pid_file)));
}

#[tokio::test]
async fn test_workers_are_independent() {
    let supervisor = Arc::new(sh_worker(
        r#"cat >/dev/null; printf '%s\n' '{"status":"failure","message":"OOM"}'"#,
    ));
    let crash = Arc::new(sh_worker("cat >/dev/null; kill -s SEGV $$"));

    let mut handles = Vec::new();
    for i in 0..6 {
        let s = if i % 2 == 0 { supervisor.clone() } else { crash.clone() };
        handles.push(tokio::spawn(async move {
            s.run(input(), &config(Duration::from_secs(10))).await
        }));
    }
    for (i, handle) in handles.into_iter().enumerate() {
        let outcome = handle.await.unwrap().unwrap();
        if i % 2 == 0 {
            assert_eq!(outcome, TaskOutcome::Failure("OOM".into()));
        } else {
            assert_eq!(outcome, TaskOutcome::Crash(Some(libc::SIGSEGV)));
        }
    }
}

#[tokio::test]
async fn test_missing_worker_program_is_spawn_error() {
    let supervisor = Supervisor::new(
        WorkerLauncher::new("/nonexistent/tablevisor-worker"),
        EngineOptions::default(),
    );
    let err = assert_err!(supervisor.run(input(), &config(Duration::from_secs(1))).await);
    assert!(matches!(err, ServiceError::SpawnFailed { .. }));
}

#[test]
fn test_empty_result_keeps_every_key() {
    // The HTTP body for "no table found" keeps every key.
    let json = serde_json::to_value(TableResult::empty()).unwrap();
    assert!(json["html"].is_null());
    assert!(json["cells"].is_null());
    assert_eq!(json["bboxes"], serde_json::json!([]));
}
