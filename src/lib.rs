//! # tablevisor
//!
//! Table-structure extraction over HTTP, with every extraction run in a
//! disposable, deadline-bounded worker process.
//!
//! ## Why this crate?
//!
//! The extraction engine is native numeric code. On some inputs it segfaults,
//! aborts on an illegal instruction or never returns. Running it inside the
//! service process would let one bad image kill the server or pin a thread
//! forever. Instead each request gets a fresh child process, and the parent
//! turns whatever happens to that child into one of five outcomes.
//!
//! ## Request Flow
//!
//! ```text
//! POST /pp/table
//!  │
//!  ├─ 1. Prepare     decode, crop to ROI, downscale to max dimension
//!  ├─ 2. Admit       wait for a worker slot
//!  ├─ 3. Supervise   spawn worker, send input, race result against deadline
//!  ├─ 4. Classify    Success | Failure | Crash | Timeout | ProtocolViolation
//!  └─ 5. Respond     200 with the table, or an error status with a message
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tablevisor::{Supervisor, SupervisorConfig, TaskOutcome, WorkerLauncher};
//! use tablevisor::{EngineOptions, pipeline::prepare::prepare};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = SupervisorConfig::default();
//!     let input = prepare(&std::fs::read("scan.png")?, None, config.max_dimension)?;
//!
//!     let supervisor = Supervisor::new(WorkerLauncher::current_exe()?, EngineOptions::default());
//!     match supervisor.run(input, &config).await? {
//!         TaskOutcome::Success(table) => println!("{}", table.csv.unwrap_or_default()),
//!         other => eprintln!("{other}"),
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `tablevisor` binary (clap + anyhow + tracing-subscriber) |
//! | `ocr`   | on      | Builds the ocrs-backed table engine |

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod engine;
pub mod error;
pub mod outcome;
pub mod pipeline;
pub mod server;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{EngineOptions, ServiceConfig, SupervisorConfig, SupervisorConfigBuilder};
pub use engine::{EngineHolder, TableEngine};
pub use error::{EngineError, ServiceError};
pub use outcome::{TableResult, TaskOutcome};
pub use pipeline::supervisor::{Supervisor, WorkerLauncher};
pub use server::{router, serve, AppState};
