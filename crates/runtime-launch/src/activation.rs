//! Emulate `activate` for child processes.
//!
//! Shell activation of a virtual environment only edits a handful of
//! variables. Instead of touching this process's environment we compute the
//! same variables as an [`EnvOverlay`] and hand it to each child command.

use std::collections::BTreeMap;
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};

use crate::layout::InterpreterLayout;

/// Variables merged into a child's inherited environment, entry by entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvOverlay {
    vars: BTreeMap<String, OsString>,
}

impl EnvOverlay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a variable, replacing any earlier value for the same name.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<OsString>) {
        self.vars.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&OsStr> {
        self.vars.get(name).map(OsString::as_os_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &OsStr)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_os_str()))
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }
}

impl<K, V> FromIterator<(K, V)> for EnvOverlay
where
    K: Into<String>,
    V: Into<OsString>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut overlay = EnvOverlay::new();
        for (k, v) in iter {
            overlay.insert(k, v);
        }
        overlay
    }
}

/// Build the activation overlay for the runtime at `root`.
///
/// - `VIRTUAL_ENV` points at `<root>/venv`
/// - `PATH` is the venv's executable directory followed by `host_path`
/// - `PYTHONHOME` points at the base runtime root
pub fn activation_overlay(
    layout: &dyn InterpreterLayout,
    root: &Path,
    host_path: Option<&OsStr>,
) -> EnvOverlay {
    let venv = layout.venv_dir(root);
    let bin_dir = layout.venv_bin_dir(&venv);

    let mut entries: Vec<PathBuf> = vec![bin_dir.clone()];
    if let Some(host) = host_path.filter(|p| !p.is_empty()) {
        entries.extend(std::env::split_paths(host));
    }

    // join_paths only fails on entries containing the separator itself
    let path = std::env::join_paths(&entries).unwrap_or_else(|e| {
        log::warn!("[activation] host PATH not joinable ({e}), using venv bin dir only");
        bin_dir.into_os_string()
    });

    let mut overlay = EnvOverlay::new();
    overlay.insert("VIRTUAL_ENV", venv.into_os_string());
    overlay.insert("PATH", path);
    overlay.insert("PYTHONHOME", root.as_os_str().to_os_string());
    overlay
}

/// Like [`activation_overlay`] but reads PATH from the current process.
pub fn activation_overlay_from_host(layout: &dyn InterpreterLayout, root: &Path) -> EnvOverlay {
    let host_path = std::env::var_os("PATH");
    activation_overlay(layout, root, host_path.as_deref())
}
