//! CUDA version detection.
//!
//! Hardware-specific wheels (PyTorch's `+cu126` builds) need a canonical
//! tag for the host's CUDA driver. We run the vendor diagnostic tool, read
//! the `CUDA Version: 12.6` banner it prints, and fall back to an
//! environment variable when the tool is missing or fails.

use log::{debug, info};
use regex::Regex;
use std::future::Future;
use std::sync::OnceLock;

use crate::config::RuntimeConfig;
use crate::progress::EventHandler;

/// Prefix shared by every hardware tag.
pub const TAG_PREFIX: &str = "cu";

fn banner_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)CUDA\s+Version\s*:\s*(\d+)\.(\d+)").expect("CUDA banner pattern is valid")
    })
}

fn leading_version_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^(\d+)(?:\.(\d+))?").expect("version pattern is valid"))
}

/// Produces a hardware tag for the host, if it has one.
pub trait TagDetector: Send + Sync {
    /// Detect the tag. Failures are reported to `handler` and yield `None`.
    fn detect<'a, H>(&'a self, handler: &'a H) -> impl Future<Output = Option<String>> + Send + 'a
    where
        H: EventHandler + ?Sized;
}

/// Canonicalize a user- or environment-supplied CUDA version.
///
/// - `"cu121"` / `" CU121 "` pass through lowercased and trimmed
/// - `"12.6"` becomes `"cu126"`, `"8"` becomes `"cu80"`
/// - anything else passes through lowercased and trimmed
pub fn normalize_tag(input: &str) -> String {
    let trimmed = input.trim().to_lowercase();
    if trimmed.starts_with(TAG_PREFIX) {
        return trimmed;
    }
    match leading_version_pattern().captures(&trimmed) {
        Some(caps) => {
            let major = &caps[1];
            let minor = caps.get(2).map(|m| m.as_str()).unwrap_or("0");
            format!("{TAG_PREFIX}{major}{minor}")
        }
        None => trimmed,
    }
}

/// Extract the tag from diagnostic tool output (`CUDA Version: 12.6` -> `cu126`).
pub fn parse_banner(output: &str) -> Option<String> {
    let caps = banner_pattern().captures(output)?;
    Some(format!("{TAG_PREFIX}{}{}", &caps[1], &caps[2]))
}

/// [`TagDetector`] backed by `nvidia-smi` and an override variable.
#[derive(Debug, Clone)]
pub struct CudaDetector {
    tool: String,
    env_var: String,
}

impl CudaDetector {
    pub fn new(tool: impl Into<String>, env_var: impl Into<String>) -> Self {
        Self {
            tool: tool.into(),
            env_var: env_var.into(),
        }
    }

    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self::new(&config.cuda_diagnostic_tool, &config.cuda_env_var)
    }

    /// Run the diagnostic tool. `Ok(None)` when it is absent, exits nonzero,
    /// or prints no version banner.
    async fn query_tool(&self) -> std::io::Result<Option<String>> {
        let output = match tokio::process::Command::new(&self.tool).output().await {
            Ok(output) => output,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("[cuda] {} not found", self.tool);
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        if !output.status.success() {
            debug!("[cuda] {} exited with {}", self.tool, output.status);
            return Ok(None);
        }

        Ok(parse_banner(&String::from_utf8_lossy(&output.stdout)))
    }

    /// The override variable, normalized. `None` when unset or blank.
    pub fn env_override(&self) -> Option<String> {
        let value = std::env::var(&self.env_var).ok()?;
        if value.trim().is_empty() {
            return None;
        }
        Some(normalize_tag(&value))
    }
}

impl TagDetector for CudaDetector {
    fn detect<'a, H>(&'a self, handler: &'a H) -> impl Future<Output = Option<String>> + Send + 'a
    where
        H: EventHandler + ?Sized,
    {
        async move {
            match self.query_tool().await {
                Ok(Some(tag)) => {
                    info!("[cuda] Detected {} via {}", tag, self.tool);
                    Some(tag)
                }
                Ok(None) => {
                    let tag = self.env_override();
                    if let Some(ref tag) = tag {
                        info!("[cuda] Using {} from {}", tag, self.env_var);
                    }
                    tag
                }
                Err(e) => {
                    handler.on_error(&format!("CUDA detection failed: {e}"));
                    None
                }
            }
        }
    }
}
