//! Error types for environment operations.

use std::path::PathBuf;

/// Exit code returned when an operation fails without a child exit code to
/// report (undetectable hardware, failed removal).
pub const FAILURE_EXIT_CODE: i32 = -1;

/// Errors raised by [`EnvironmentManager`](crate::EnvironmentManager) operations.
///
/// Child processes that exit nonzero are *not* errors: their exit code is
/// returned to the caller. The exception is [`EnvError::ProcessFailed`],
/// produced only by the legacy raise-on-nonzero path.
#[derive(Debug, thiserror::Error)]
pub enum EnvError {
    /// A required argument was blank or empty.
    #[error("Invalid argument `{name}`: {reason}")]
    InvalidArgument { name: &'static str, reason: String },

    /// A referenced file or directory does not exist.
    #[error("{kind} not found: {}", path.display())]
    NotFound { kind: &'static str, path: PathBuf },

    /// A child exited nonzero under the legacy raise-on-nonzero convention.
    #[error("Process exited with code {code}: {stderr}")]
    ProcessFailed { code: i32, stderr: String },

    /// Bootstrapping failed; the runtime root has been removed.
    #[error("Bootstrap failed: {0:#}")]
    Bootstrap(anyhow::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl EnvError {
    pub(crate) fn invalid(name: &'static str, reason: impl Into<String>) -> Self {
        EnvError::InvalidArgument {
            name,
            reason: reason.into(),
        }
    }

    pub(crate) fn not_found(kind: &'static str, path: impl Into<PathBuf>) -> Self {
        EnvError::NotFound {
            kind,
            path: path.into(),
        }
    }
}

pub type Result<T, E = EnvError> = std::result::Result<T, E>;
