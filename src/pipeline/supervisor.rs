//! Isolated-execution supervisor: one disposable worker process per task.
//!
//! ## Lifecycle
//!
//! ```text
//! spawn ──▶ write request ──┬──▶ message arrives ──▶ wait for exit (≤ grace, else kill)
//!                           ├──▶ stdout closes ────▶ wait for exit (≤ deadline, else terminate)
//!                           ├──▶ worker exits ─────▶ drain stdout briefly
//!                           └──▶ deadline fires ───▶ SIGTERM, grace, SIGKILL, reap
//! ```
//!
//! Every branch ends with the child reaped before [`Supervisor::run`]
//! returns. Workers are never reused: a task that corrupted its address
//! space takes the whole process with it.
//!
//! On Unix each worker leads its own process group, and signals go to the
//! whole group. Anything the task body forked dies with it, even when it
//! kept the worker's stdout open.
//!
//! If the future returned by `run` is dropped mid-flight (client went away),
//! the child was spawned with `kill_on_drop` and the IPC tasks are aborted,
//! so the worker still dies and tokio reaps it in the background. Any
//! further cancellation source can be added as another branch of the wait.

use crate::config::{EngineOptions, SupervisorConfig};
use crate::error::ServiceError;
use crate::outcome::{classify, ExitState, Observation, TaskOutcome};
use crate::pipeline::ipc::{self, WorkerRequest, MAX_MESSAGE_BYTES};
use crate::pipeline::prepare::TaskInput;
use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// How long to keep reading stdout after the worker has exited.
///
/// A message written just before exit may still be in the pipe.
const EXIT_DRAIN: Duration = Duration::from_millis(250);

/// How to start a worker process.
///
/// The default launcher re-executes the current binary with the `worker`
/// subcommand; tests and alternative deployments can point it at any
/// program that speaks the [`ipc`] protocol.
#[derive(Debug, Clone)]
pub struct WorkerLauncher {
    program: PathBuf,
    args: Vec<String>,
}

impl WorkerLauncher {
    /// Launch `program` with no arguments.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Launch this executable as `<exe> worker`.
    pub fn current_exe() -> Result<Self, ServiceError> {
        let exe = std::env::current_exe()
            .map_err(|e| ServiceError::Internal(format!("Cannot find own executable: {e}")))?;
        Ok(Self::new(exe).arg("worker"))
    }

    /// Append one command-line argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }
}

/// Runs task invocations in fresh worker processes.
#[derive(Debug, Clone)]
pub struct Supervisor {
    launcher: WorkerLauncher,
    engine: EngineOptions,
}

impl Supervisor {
    pub fn new(launcher: WorkerLauncher, engine: EngineOptions) -> Self {
        Self { launcher, engine }
    }

    /// Run one task in an isolated worker and classify what happened.
    ///
    /// # Errors
    /// Only parent-side failures surface as `Err`: the worker could not be
    /// spawned ([`ServiceError::SpawnFailed`]), or it reported that the task
    /// body could not be loaded ([`ServiceError::EngineInitFailed`]). Crashes,
    /// hangs and reported failures are all `Ok(TaskOutcome)`.
    pub async fn run(
        &self,
        input: TaskInput,
        config: &SupervisorConfig,
    ) -> Result<TaskOutcome, ServiceError> {
        let request = ipc::encode_line(&WorkerRequest::new(self.engine.clone(), input))
            .map_err(|e| ServiceError::Internal(format!("Serialize error: {e}")))?;

        let mut worker = WorkerHandle::spawn(&self.launcher, &self.engine, request)?;
        let observation = worker.observe(config).await;
        let elapsed = worker.started.elapsed();
        let pid = worker.pid;
        drop(worker);

        let outcome = classify(observation)?;
        log_outcome(pid, elapsed, &outcome);
        Ok(outcome)
    }
}

fn log_outcome(pid: Option<u32>, elapsed: Duration, outcome: &TaskOutcome) {
    let pid = pid.unwrap_or_default();
    match outcome {
        TaskOutcome::Success(_) => info!("Worker {pid} succeeded in {elapsed:?}"),
        TaskOutcome::Failure(msg) => warn!("Worker {pid} reported failure after {elapsed:?}: {msg}"),
        TaskOutcome::Crash(sig) => warn!("Worker {pid} crashed after {elapsed:?} (signal={sig:?})"),
        TaskOutcome::Timeout => warn!("Worker {pid} timed out after {elapsed:?} and was reaped"),
        TaskOutcome::ProtocolViolation(detail) => {
            error!("Worker {pid} violated the IPC protocol after {elapsed:?}: {detail}")
        }
    }
}

/// One spawned worker, owned exclusively by a single `run` call.
struct WorkerHandle {
    child: Child,
    pid: Option<u32>,
    started: Instant,
    /// Single-slot result channel: the raw first stdout line, or `None` on EOF.
    result_rx: oneshot::Receiver<Option<Vec<u8>>>,
    io_tasks: [JoinHandle<()>; 2],
}

impl WorkerHandle {
    fn spawn(
        launcher: &WorkerLauncher,
        engine: &EngineOptions,
        request: Vec<u8>,
    ) -> Result<Self, ServiceError> {
        let mut command = Command::new(&launcher.program);
        command
            .args(&launcher.args)
            .envs(engine.worker_env())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn().map_err(|source| ServiceError::SpawnFailed {
            program: launcher.program.display().to_string(),
            source,
        })?;
        let pid = child.id();
        debug!("Spawned worker {pid:?}: {}", launcher.program.display());

        // Both pipes were requested above, so these only fail on a broken runtime;
        // `kill_on_drop` takes care of the child in that case.
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| ServiceError::Internal("Worker stdin not available".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ServiceError::Internal("Worker stdout not available".into()))?;

        let writer = tokio::spawn(async move {
            // A worker may exit without reading; its exit status is what matters.
            if let Err(e) = stdin.write_all(&request).await {
                debug!("Worker stdin closed early: {e}");
                return;
            }
            let _ = stdin.shutdown().await;
        });

        let (tx, result_rx) = oneshot::channel();
        let reader = tokio::spawn(async move {
            let mut reader = BufReader::new(stdout.take(MAX_MESSAGE_BYTES));
            let mut line = Vec::new();
            let received = match reader.read_until(b'\n', &mut line).await {
                Ok(0) => None,
                Ok(_) => Some(line),
                Err(e) => {
                    warn!("Worker stdout read error: {e}");
                    None
                }
            };
            let _ = tx.send(received);
        });

        Ok(Self {
            child,
            pid,
            started: Instant::now(),
            result_rx,
            io_tasks: [writer, reader],
        })
    }

    /// Wait for the first of: a message, stdout EOF, worker exit, the deadline.
    async fn observe(&mut self, config: &SupervisorConfig) -> Observation {
        let deadline = tokio::time::sleep(config.deadline);
        tokio::pin!(deadline);

        let first = tokio::select! {
            // A dropped sender means the reader task died; treat it like EOF.
            line = &mut self.result_rx => First::Output(line.unwrap_or(None)),
            status = self.child.wait() => First::Exited(status),
            _ = &mut deadline => First::Deadline,
        };

        match first {
            First::Output(Some(line)) if ipc::is_complete_line(&line) => {
                let message = ipc::decode_output(&line);
                let exit = self.wait_or_kill(config.kill_grace).await;
                Observation {
                    message: Some(message),
                    exit,
                    timed_out: false,
                }
            }
            First::Output(partial) => {
                // stdout closed, possibly in the middle of a line.
                let message = partial.as_deref().map(ipc::decode_output);
                let exited = tokio::select! {
                    status = self.child.wait() => Some(status),
                    _ = &mut deadline => None,
                };
                match exited {
                    Some(status) => Observation {
                        message,
                        exit: exit_state(status),
                        timed_out: false,
                    },
                    None => Observation {
                        message,
                        exit: self.terminate(config.kill_grace).await,
                        timed_out: true,
                    },
                }
            }
            First::Exited(status) => {
                // A descendant holding stdout open must not stall the call.
                let line = match tokio::time::timeout(EXIT_DRAIN, &mut self.result_rx).await {
                    Ok(Ok(line)) => line,
                    Ok(Err(_)) | Err(_) => None,
                };
                Observation {
                    message: line.as_deref().map(ipc::decode_output),
                    exit: exit_state(status),
                    timed_out: false,
                }
            }
            First::Deadline => Observation {
                message: None,
                exit: self.terminate(config.kill_grace).await,
                timed_out: true,
            },
        }
    }

    /// Reap a worker that already reported, killing it if it lingers.
    async fn wait_or_kill(&mut self, grace: Duration) -> ExitState {
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => status.into(),
            Ok(Err(e)) => {
                warn!("Failed to wait for worker {:?}: {e}", self.pid);
                self.kill_and_reap().await
            }
            Err(_) => {
                warn!("Worker {:?} did not exit after reporting; killing", self.pid);
                self.kill_and_reap().await
            }
        }
    }

    /// Ask the worker to stop, then force it after `grace`.
    async fn terminate(&mut self, grace: Duration) -> ExitState {
        #[cfg(unix)]
        if self.child.id().is_some() && self.signal_group(libc::SIGTERM) {
            if let Ok(Ok(status)) = tokio::time::timeout(grace, self.child.wait()).await {
                return status.into();
            }
        }
        #[cfg(not(unix))]
        let _ = grace;
        self.kill_and_reap().await
    }

    async fn kill_and_reap(&mut self) -> ExitState {
        #[cfg(unix)]
        self.signal_group(libc::SIGKILL);
        if let Err(e) = self.child.kill().await {
            warn!("Failed to kill worker {:?}: {e}", self.pid);
        }
        match self.child.wait().await {
            Ok(status) => status.into(),
            Err(_) => ExitState::Unknown,
        }
    }

    /// Send `signal` to every process in the worker's group.
    #[cfg(unix)]
    fn signal_group(&self, signal: libc::c_int) -> bool {
        let Some(pgid) = self.pid else {
            return false;
        };
        // SAFETY: kill(2) has no memory-safety preconditions. The group id is
        // the worker's pid, which is not reused while any group member lives;
        // an empty group fails with ESRCH.
        unsafe { libc::kill(-(pgid as libc::pid_t), signal) == 0 }
    }
}

/// Whichever of the observed events happened first.
enum First {
    Output(Option<Vec<u8>>),
    Exited(io::Result<ExitStatus>),
    Deadline,
}

fn exit_state(status: io::Result<ExitStatus>) -> ExitState {
    status.map(ExitState::from).unwrap_or(ExitState::Unknown)
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        for task in &self.io_tasks {
            task.abort();
        }
        // Descendants may outlive a worker that exited on its own.
        #[cfg(unix)]
        self.signal_group(libc::SIGKILL);
        // No-op once reaped; otherwise the child dies here and tokio reaps it.
        let _ = self.child.start_kill();
    }
}
