//! Progress and output reporting for environment operations.
//!
//! Provides [`BootstrapPhase`] events covering the runtime bootstrap
//! lifecycle (download, extract, pip, virtualenv) and an [`EventHandler`]
//! trait that consumers implement to route child output, progress and errors
//! to their UI layer.

use runtime_launch::OutputSink;
use serde::{Deserialize, Serialize};

/// Phases of bootstrapping a runtime root.
///
/// Serializable for transport over IPC or logging as JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum BootstrapPhase {
    /// Starting bootstrap of a runtime root.
    Starting { root: String },
    /// The base runtime already exists (fast path, nothing to do).
    AlreadyInitialized { root: String },
    /// Downloading the runtime distribution archive.
    Downloading { url: String },
    /// Unpacking the distribution into the root.
    Extracting { archive: String },
    /// Running the package installer bootstrap script.
    InstallingPip,
    /// Enabling `import site` in the startup configuration files.
    PatchingStartupConfig { files: Vec<String> },
    /// Installing virtualenv into the base runtime.
    InstallingVirtualenv,
    /// Creating the `venv` directory.
    CreatingVenv,
    /// Bootstrap failed and the root was deleted.
    RolledBack { root: String },
    /// Runtime and virtual environment are ready.
    Ready { root: String, python_path: String },
    /// An error occurred.
    Error { message: String },
}

/// Receives child output, bootstrap progress and error reports.
///
/// The [`OutputSink`] half gets every stdout/stderr line verbatim and the
/// live process handle of each child.
pub trait EventHandler: OutputSink {
    /// Called for each bootstrap phase.
    fn on_progress(&self, phase: BootstrapPhase) {
        log_phase(&phase);
    }

    /// The error callback: recoverable failures that are reported rather
    /// than raised (undetectable hardware, failed removal).
    fn on_error(&self, message: &str) {
        log::error!("{message}");
    }
}

/// Log-only handler.
///
/// Writes child output at info/warn level and progress through the `log` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogHandler;

impl OutputSink for LogHandler {
    fn on_stdout(&self, line: &str) {
        log::info!("{line}");
    }

    fn on_stderr(&self, line: &str) {
        log::warn!("{line}");
    }
}

impl EventHandler for LogHandler {}

/// Default rendering of a phase to the log.
pub fn log_phase(phase: &BootstrapPhase) {
    match phase {
        BootstrapPhase::Starting { root } => {
            log::info!("[bootstrap] Starting runtime bootstrap at {root}");
        }
        BootstrapPhase::AlreadyInitialized { root } => {
            log::info!("[bootstrap] Runtime already present at {root}");
        }
        BootstrapPhase::Downloading { url } => {
            log::info!("[bootstrap] Downloading {url}");
        }
        BootstrapPhase::Extracting { archive } => {
            log::info!("[bootstrap] Extracting {archive}");
        }
        BootstrapPhase::InstallingPip => {
            log::info!("[bootstrap] Installing pip...");
        }
        BootstrapPhase::PatchingStartupConfig { files } => {
            log::debug!("[bootstrap] Enabled site imports in {files:?}");
        }
        BootstrapPhase::InstallingVirtualenv => {
            log::info!("[bootstrap] Installing virtualenv...");
        }
        BootstrapPhase::CreatingVenv => {
            log::info!("[bootstrap] Creating virtual environment...");
        }
        BootstrapPhase::RolledBack { root } => {
            log::warn!("[bootstrap] Removed partially bootstrapped root {root}");
        }
        BootstrapPhase::Ready { root, python_path } => {
            log::info!("[bootstrap] Ready: root={root} python={python_path}");
        }
        BootstrapPhase::Error { message } => {
            log::error!("[bootstrap] Error: {message}");
        }
    }
}
