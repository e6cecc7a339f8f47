//! CLI binary for tablevisor.
//!
//! `tablevisor serve` (the default) runs the HTTP service. `tablevisor worker`
//! is what the service spawns for each request; it speaks the IPC protocol on
//! stdin/stdout and is not meant to be run by hand.

use anyhow::{Context, Result};
use clap::builder::BoolishValueParser;
use clap::{ArgAction, Args, Parser, Subcommand};
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tablevisor::config::parse_env_list;
use tablevisor::pipeline::worker::run_worker;
use tablevisor::{EngineOptions, ServiceConfig, SupervisorConfig};
use tracing_subscriber::EnvFilter;

const AFTER_HELP: &str = r#"
ENDPOINTS:
  GET  /health      liveness probe, returns {"ok": true}
  POST /pp/table    multipart form: file=<image>, roi={"x":..,"y":..,"w":..,"h":..} (optional)

STATUS CODES:
  200  table extracted
  400  missing file field or malformed form
  500  undecodable image, engine not loadable, worker could not be spawned
  502  task failed, worker crashed, or worker broke the protocol
  504  deadline exceeded (the worker is killed)

MODELS:
  The engine needs the ocrs detection and recognition models in rten format.
  Point --detection-model and --recognition-model at them.
"#;

/// Table-structure extraction service with crash-isolated workers.
#[derive(Parser, Debug)]
#[command(
    name = "tablevisor",
    version,
    about = "Table-structure extraction over HTTP with crash-isolated workers",
    args_conflicts_with_subcommands = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    #[command(flatten)]
    serve: ServeArgs,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, global = true, env = "TABLEVISOR_VERBOSE")]
    verbose: bool,

    /// Log errors only.
    #[arg(short, long, global = true, env = "TABLEVISOR_QUIET")]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP service (default).
    Serve(ServeArgs),
    /// Serve one request over stdin/stdout and exit.
    #[command(hide = true)]
    Worker,
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// Listen address.
    #[arg(long, env = "TABLEVISOR_BIND", default_value = "0.0.0.0:8000")]
    bind: SocketAddr,

    /// Run each task in a disposable worker process.
    #[arg(long, env = "TABLEVISOR_ISOLATION", default_value_t = true,
          action = ArgAction::Set, value_parser = BoolishValueParser::new())]
    isolation: bool,

    /// Per-request deadline in seconds.
    #[arg(long, env = "TABLEVISOR_DEADLINE_SECS", default_value_t = 55,
          value_parser = clap::value_parser!(u64).range(1..))]
    deadline_secs: u64,

    /// Load the engine in the background at startup.
    #[arg(long, env = "TABLEVISOR_WARMUP", default_value_t = false,
          action = ArgAction::Set, value_parser = BoolishValueParser::new())]
    warmup: bool,

    /// Longest side of the image handed to the engine, in pixels.
    #[arg(long, env = "TABLEVISOR_MAX_DIMENSION", default_value_t = 1800)]
    max_dimension: u32,

    /// Milliseconds between SIGTERM and SIGKILL for a worker being stopped.
    #[arg(long, env = "TABLEVISOR_KILL_GRACE_MS", default_value_t = 2000)]
    kill_grace_ms: u64,

    /// Maximum concurrent tasks (0 = unlimited). Defaults to the CPU count.
    #[arg(long, env = "TABLEVISOR_MAX_WORKERS")]
    max_workers: Option<usize>,

    /// Upload size limit in bytes.
    #[arg(long, env = "TABLEVISOR_MAX_UPLOAD_BYTES", default_value_t = 32 * 1024 * 1024)]
    max_upload_bytes: usize,

    /// rten text-detection model.
    #[arg(long, env = "TABLEVISOR_DETECTION_MODEL",
          default_value = "models/text-detection.rten")]
    detection_model: PathBuf,

    /// rten text-recognition model.
    #[arg(long, env = "TABLEVISOR_RECOGNITION_MODEL",
          default_value = "models/text-recognition.rten")]
    recognition_model: PathBuf,

    /// Threads for the numeric backend inside each worker.
    #[arg(long, env = "TABLEVISOR_NUM_THREADS")]
    num_threads: Option<usize>,

    /// Extra worker environment as KEY=VALUE,KEY=VALUE.
    #[arg(long, env = "TABLEVISOR_WORKER_ENV")]
    worker_env: Option<String>,
}

impl ServeArgs {
    fn into_config(self) -> Result<ServiceConfig> {
        let supervisor = SupervisorConfig::builder()
            .isolation(self.isolation)
            .deadline_secs(self.deadline_secs)
            .max_dimension(self.max_dimension)
            .kill_grace(Duration::from_millis(self.kill_grace_ms))
            .build()
            .context("Invalid supervisor configuration")?;

        let env = match self.worker_env.as_deref() {
            Some(list) => parse_env_list(list).context("Invalid TABLEVISOR_WORKER_ENV")?,
            None => Vec::new(),
        };
        let engine = EngineOptions {
            detection_model: self.detection_model,
            recognition_model: self.recognition_model,
            num_threads: self.num_threads,
            env,
            ..EngineOptions::default()
        };

        let defaults = ServiceConfig::default();
        Ok(ServiceConfig {
            bind: self.bind,
            supervisor,
            engine,
            warmup: self.warmup,
            max_concurrent_workers: self
                .max_workers
                .unwrap_or(defaults.max_concurrent_workers),
            max_upload_bytes: self.max_upload_bytes,
        })
    }
}

fn init_logging(verbose: bool, quiet: bool, default: &str) {
    let filter = if quiet {
        "error"
    } else if verbose {
        "debug"
    } else {
        default
    };
    // stdout belongs to the IPC channel in worker mode, so logs always go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command.unwrap_or(Command::Serve(cli.serve)) {
        Command::Worker => {
            init_logging(cli.verbose, cli.quiet, "warn");
            std::process::exit(run_worker());
        }
        Command::Serve(args) => {
            init_logging(cli.verbose, cli.quiet, "info");
            let config = args.into_config()?;
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("Failed to start async runtime")?;
            runtime
                .block_on(tablevisor::serve(config))
                .context("Service failed")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn bare_invocation_serves_with_defaults() {
        let cli = Cli::try_parse_from(["tablevisor"]).unwrap();
        assert!(cli.command.is_none());
        let config = cli.serve.into_config().unwrap();
        assert_eq!(config.bind.port(), 8000);
        assert!(config.supervisor.isolation);
        assert_eq!(config.supervisor.deadline, Duration::from_secs(55));
    }

    #[test]
    fn boolish_isolation_flag() {
        let cli = Cli::try_parse_from(["tablevisor", "serve", "--isolation", "off"]).unwrap();
        match cli.command {
            Some(Command::Serve(args)) => assert!(!args.isolation),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn worker_subcommand_parses() {
        let cli = Cli::try_parse_from(["tablevisor", "worker"]).unwrap();
        assert!(matches!(cli.command, Some(Command::Worker)));
    }
}
