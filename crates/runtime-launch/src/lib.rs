//! Process launching and environment plumbing for pyrt.
//!
//! This crate provides the low-level pieces used by the `runtime-env`
//! orchestrator and the `pyrt` CLI. It includes:
//!
//! - A process runner that streams stdout/stderr line by line to a sink
//! - The environment overlay that emulates venv activation for a child
//! - Per-platform interpreter layouts (`Scripts/python.exe` vs `bin/python`)
//! - Archive download and extraction for runtime distributions
//!
//! # Running a process
//!
//! ```ignore
//! use runtime_launch::{CommandRunner, Invocation, ProcessRunner};
//!
//! let runner = ProcessRunner::new(root.clone());
//! let code = runner
//!     .run(Invocation::new(python).arg("-m").arg("pip").arg("--version"), &sink)
//!     .await?;
//! ```

pub mod activation;
pub mod fetch;
pub mod layout;
pub mod process;

// Re-export commonly used items
pub use activation::{activation_overlay, activation_overlay_from_host, EnvOverlay};
pub use fetch::{ArchiveFetcher, HttpFetcher};
pub use layout::{current_layout, layout_for, InterpreterLayout, VENV_DIR_NAME};
pub use process::{
    quote_arg, run_checked, CommandRunner, ExitFailure, Invocation, OutputSink, ProcessHandle,
    ProcessRunner,
};
