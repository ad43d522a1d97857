//! Per-platform interpreter layouts.
//!
//! A runtime root holds a base interpreter plus a nested `venv`. Where the
//! executables live differs between platform families, so each family gets
//! an [`InterpreterLayout`] implementation and callers never branch on
//! `cfg!(windows)` themselves.

use std::path::{Path, PathBuf};

/// Directory name of the virtual environment inside a runtime root.
pub const VENV_DIR_NAME: &str = "venv";

/// Where interpreters live inside a runtime root and its virtual environment.
pub trait InterpreterLayout: Send + Sync + std::fmt::Debug {
    /// Short identifier (`"windows"`, `"unix"`).
    fn name(&self) -> &'static str;

    /// The base runtime executable extracted from the distribution archive.
    fn base_executable(&self, root: &Path) -> PathBuf;

    /// Directory holding the venv's executables (prefixed onto PATH).
    fn venv_bin_dir(&self, venv: &Path) -> PathBuf;

    /// The venv's interpreter.
    fn venv_python(&self, venv: &Path) -> PathBuf;

    /// The virtual environment directory for a runtime root.
    fn venv_dir(&self, root: &Path) -> PathBuf {
        root.join(VENV_DIR_NAME)
    }
}

/// Embeddable-distribution layout: `python.exe` at the root, `Scripts/` in the venv.
#[derive(Debug, Clone, Copy, Default)]
pub struct WindowsLayout;

impl InterpreterLayout for WindowsLayout {
    fn name(&self) -> &'static str {
        "windows"
    }

    fn base_executable(&self, root: &Path) -> PathBuf {
        root.join("python.exe")
    }

    fn venv_bin_dir(&self, venv: &Path) -> PathBuf {
        venv.join("Scripts")
    }

    fn venv_python(&self, venv: &Path) -> PathBuf {
        self.venv_bin_dir(venv).join("python.exe")
    }
}

/// Standalone-build layout: `bin/python3` at the root, `bin/` in the venv.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnixLayout;

impl InterpreterLayout for UnixLayout {
    fn name(&self) -> &'static str {
        "unix"
    }

    fn base_executable(&self, root: &Path) -> PathBuf {
        root.join("bin").join("python3")
    }

    fn venv_bin_dir(&self, venv: &Path) -> PathBuf {
        venv.join("bin")
    }

    fn venv_python(&self, venv: &Path) -> PathBuf {
        self.venv_bin_dir(venv).join("python")
    }
}

static WINDOWS: WindowsLayout = WindowsLayout;
static UNIX: UnixLayout = UnixLayout;

/// The layout for the platform this binary was compiled for.
pub fn current_layout() -> &'static dyn InterpreterLayout {
    #[cfg(target_os = "windows")]
    {
        &WINDOWS
    }
    #[cfg(not(target_os = "windows"))]
    {
        &UNIX
    }
}

/// Look up a layout by name. Returns `None` for unknown names.
pub fn layout_for(name: &str) -> Option<&'static dyn InterpreterLayout> {
    match name.trim().to_ascii_lowercase().as_str() {
        "windows" => Some(&WINDOWS),
        "unix" | "linux" | "macos" => Some(&UNIX),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_windows_layout_paths() {
        let root = Path::new("rt");
        let layout = WindowsLayout;
        assert_eq!(layout.base_executable(root), root.join("python.exe"));
        assert_eq!(
            layout.venv_python(&layout.venv_dir(root)),
            root.join("venv").join("Scripts").join("python.exe")
        );
    }

    #[test]
    fn test_unix_layout_paths() {
        let root = Path::new("rt");
        let layout = UnixLayout;
        assert_eq!(layout.base_executable(root), root.join("bin").join("python3"));
        assert_eq!(
            layout.venv_python(&layout.venv_dir(root)),
            root.join("venv").join("bin").join("python")
        );
    }

    #[test]
    fn test_layout_for() {
        assert_eq!(layout_for("Windows").map(|l| l.name()), Some("windows"));
        assert_eq!(layout_for("linux").map(|l| l.name()), Some("unix"));
        assert!(layout_for("plan9").is_none());
    }

    #[test]
    fn test_current_layout_matches_target() {
        if cfg!(windows) {
            assert_eq!(current_layout().name(), "windows");
        } else {
            assert_eq!(current_layout().name(), "unix");
        }
    }
}
