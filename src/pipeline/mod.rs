//! Per-request execution stages.
//!
//! ## Data Flow
//!
//! ```text
//! upload ──▶ prepare ──▶ supervisor ──▶ worker process ──▶ outcome
//! (bytes)    (decode,     (spawn, ipc,   (engine, one
//!             crop,        deadline)      message)
//!             resize)          │
//!                              └──▶ inline (isolation disabled)
//! ```
//!
//! 1. [`prepare`] decodes, crops to the ROI and downscales, in the parent.
//! 2. [`supervisor`] owns one worker process per call and classifies how it ended.
//! 3. [`ipc`] holds the JSON Lines messages crossing the process boundary.
//! 4. [`worker`] is the child side: load the engine, run once, report.
//! 5. [`inline`] runs the same task body on the blocking pool, without isolation.

pub mod inline;
pub mod ipc;
pub mod prepare;
pub mod supervisor;
pub mod worker;
