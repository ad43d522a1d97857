//! Self-contained Python runtimes with an isolated virtual environment.
//!
//! This crate provisions a Python runtime on demand and drives it from the
//! host process. It includes:
//!
//! - Bootstrap of a runtime root (distribution download, pip, virtualenv)
//! - Installation from requirements files, editable projects and ad-hoc
//!   package lists
//! - CUDA detection and matching PyTorch build selection
//! - Script execution with streamed output and venv activation emulated
//!   through environment variables
//!
//! # Event Reporting
//!
//! All operations accept an [`EventHandler`] that receives every line of
//! child output, the live process handle of each child, bootstrap phases and
//! recoverable errors.
//!
//! ```ignore
//! use runtime_env::{EnvironmentManager, LogHandler, RuntimeConfig};
//!
//! let manager = EnvironmentManager::new(RuntimeConfig::load_or_default()?)?;
//! manager.initialize(&LogHandler).await?;
//! manager.install_packages(&["numpy"], None, &LogHandler).await?;
//! ```

pub mod bootstrap;
pub mod config;
pub mod cuda;
pub mod error;
pub mod manager;
pub mod progress;
pub mod torch;

// Re-export key types
pub use config::RuntimeConfig;
pub use cuda::{normalize_tag, CudaDetector, TagDetector};
pub use error::{EnvError, FAILURE_EXIT_CODE};
pub use manager::EnvironmentManager;
pub use progress::{BootstrapPhase, EventHandler, LogHandler};
