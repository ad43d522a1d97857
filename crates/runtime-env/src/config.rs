//! Runtime configuration.
//!
//! Settings are read from a JSON file in the user's config directory:
//! - macOS: ~/Library/Application Support/pyrt/config.json
//! - Linux: ~/.config/pyrt/config.json
//! - Windows: C:\Users\<User>\AppData\Roaming\pyrt\config.json
//!
//! Every field is optional in the file. The configuration is a plain value
//! handed to the orchestrator; nothing here is process-global.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Pinned CPython embeddable distribution (Windows, amd64).
pub const DEFAULT_DISTRIBUTION_URL: &str =
    "https://www.python.org/ftp/python/3.11.9/python-3.11.9-embed-amd64.zip";

/// Bootstrap script for pip. Fixed, not configurable.
pub const GET_PIP_URL: &str = "https://bootstrap.pypa.io/get-pip.py";

/// Environment variable consulted when probing finds no CUDA version.
pub const DEFAULT_CUDA_ENV_VAR: &str = "CUDA_VERSION";

/// Vendor diagnostic tool used to query the driver's CUDA version.
pub const DEFAULT_CUDA_DIAGNOSTIC_TOOL: &str = "nvidia-smi";

/// Configuration for one runtime root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Directory that owns the base runtime and its `venv`.
    pub root: PathBuf,

    /// Archive the runtime is extracted from. Only read on first bootstrap.
    pub distribution_url: String,

    /// Hardware-version override variable.
    pub cuda_env_var: String,

    /// Executable run (without arguments) to detect the CUDA version.
    pub cuda_diagnostic_tool: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
            distribution_url: DEFAULT_DISTRIBUTION_URL.to_string(),
            cuda_env_var: DEFAULT_CUDA_ENV_VAR.to_string(),
            cuda_diagnostic_tool: DEFAULT_CUDA_DIAGNOSTIC_TOOL.to_string(),
        }
    }
}

impl RuntimeConfig {
    /// Defaults with a specific root.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Default::default()
        }
    }

    /// Read a config file. Missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {:?}", path))?;
        let config = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse config {:?}", path))?;
        Ok(config)
    }

    /// Read the default config file, returning defaults if it doesn't exist.
    pub fn load_or_default() -> Result<Self> {
        let path = config_path();
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }
}

/// Default location of the config file.
pub fn config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("pyrt")
        .join("config.json")
}

/// Default runtime root.
pub fn default_root() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("pyrt")
        .join("runtime")
}
