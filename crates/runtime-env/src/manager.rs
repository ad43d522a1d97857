//! The public facade over a runtime root.
//!
//! [`EnvironmentManager`] wires the bootstrap, the process runner, CUDA
//! detection and the activation overlay into the operations callers use:
//! initialize, install (requirements file, editable project, ad-hoc
//! packages, CUDA-matched torch), run a script, and remove the root.
//!
//! Every child runs with the venv's interpreter and the activation overlay
//! applied. Child exit codes are returned as-is; only argument errors,
//! missing files and spawn failures are raised.

use log::{info, warn};
use runtime_launch::{
    activation_overlay_from_host, current_layout, run_checked, ArchiveFetcher, CommandRunner,
    EnvOverlay, ExitFailure, HttpFetcher, InterpreterLayout, Invocation, ProcessRunner,
};
use std::ffi::OsString;
use std::path::{Path, PathBuf};

use crate::bootstrap;
use crate::config::RuntimeConfig;
use crate::cuda::{normalize_tag, CudaDetector, TagDetector};
use crate::error::{EnvError, Result, FAILURE_EXIT_CODE};
use crate::progress::EventHandler;
use crate::torch;

/// Facade over one runtime root.
///
/// Not safe for concurrent bootstrap/removal of the same root; callers
/// serialize access to a given root themselves.
pub struct EnvironmentManager<R = ProcessRunner, F = HttpFetcher, D = CudaDetector> {
    config: RuntimeConfig,
    layout: &'static dyn InterpreterLayout,
    runner: R,
    fetcher: F,
    detector: D,
}

impl EnvironmentManager {
    /// A manager using real processes, HTTP downloads and `nvidia-smi`.
    pub fn new(config: RuntimeConfig) -> Result<Self> {
        let config = with_absolute_root(config);
        let runner = ProcessRunner::new(config.root.clone());
        let fetcher = HttpFetcher::new()?;
        let detector = CudaDetector::from_config(&config);
        Ok(Self::with_parts(
            config,
            current_layout(),
            runner,
            fetcher,
            detector,
        ))
    }
}

/// Children run with the root as their working directory, so a relative
/// root would be resolved twice. Anchor it to the current directory once.
fn with_absolute_root(mut config: RuntimeConfig) -> RuntimeConfig {
    if config.root.is_relative() {
        match std::path::absolute(&config.root) {
            Ok(root) => config.root = root,
            Err(e) => warn!("Cannot resolve runtime root {:?}: {}", config.root, e),
        }
    }
    config
}

fn is_blank_path(path: &Path) -> bool {
    path.to_string_lossy().trim().is_empty()
}

impl<R, F, D> EnvironmentManager<R, F, D>
where
    R: CommandRunner,
    F: ArchiveFetcher,
    D: TagDetector,
{
    pub fn with_parts(
        config: RuntimeConfig,
        layout: &'static dyn InterpreterLayout,
        runner: R,
        fetcher: F,
        detector: D,
    ) -> Self {
        Self {
            config: with_absolute_root(config),
            layout,
            runner,
            fetcher,
            detector,
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn root(&self) -> &Path {
        &self.config.root
    }

    pub fn layout(&self) -> &'static dyn InterpreterLayout {
        self.layout
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    pub fn fetcher(&self) -> &F {
        &self.fetcher
    }

    /// The base runtime interpreter extracted from the distribution.
    pub fn base_executable(&self) -> PathBuf {
        self.layout.base_executable(self.root())
    }

    pub fn venv_dir(&self) -> PathBuf {
        self.layout.venv_dir(self.root())
    }

    /// The venv interpreter every operation runs under.
    pub fn python_path(&self) -> PathBuf {
        self.layout.venv_python(&self.venv_dir())
    }

    /// Whether the venv interpreter exists.
    pub fn is_initialized(&self) -> bool {
        self.python_path().exists()
    }

    /// Variables that emulate activating the venv, computed from the host PATH.
    pub fn activation_overlay(&self) -> EnvOverlay {
        activation_overlay_from_host(self.layout, self.root())
    }

    /// Bootstrap the runtime root if needed. See [`bootstrap::initialize`].
    pub async fn initialize<H>(&self, handler: &H) -> Result<i32>
    where
        H: EventHandler + ?Sized,
    {
        bootstrap::initialize(
            &self.config,
            self.layout,
            &self.runner,
            &self.fetcher,
            handler,
        )
        .await
    }

    fn venv_invocation(&self) -> Invocation {
        Invocation::new(self.python_path()).env_overlay(self.activation_overlay())
    }

    async fn pip<H>(&self, args: Vec<OsString>, handler: &H) -> Result<i32>
    where
        H: EventHandler + ?Sized,
    {
        let invocation = self.venv_invocation().args(["-m", "pip"]).args(args);
        Ok(self.runner.run(invocation, handler).await?)
    }

    /// `pip install -r <manifest>` inside the venv.
    pub async fn install_requirements<H>(&self, manifest: &Path, handler: &H) -> Result<i32>
    where
        H: EventHandler + ?Sized,
    {
        if is_blank_path(manifest) {
            return Err(EnvError::invalid("manifest", "path is empty"));
        }
        if !manifest.is_file() {
            return Err(EnvError::not_found("Manifest", manifest));
        }
        let manifest = std::path::absolute(manifest)?;

        info!("Installing requirements from {:?}", manifest);
        self.pip(
            vec!["install".into(), "-r".into(), manifest.into_os_string()],
            handler,
        )
        .await
    }

    /// `pip install -e <project_dir>` inside the venv.
    ///
    /// The directory must hold a `pyproject.toml` or `setup.py`; that is
    /// left to pip to check and surfaces as a nonzero exit code.
    pub async fn install_editable<H>(&self, project_dir: &Path, handler: &H) -> Result<i32>
    where
        H: EventHandler + ?Sized,
    {
        if is_blank_path(project_dir) {
            return Err(EnvError::invalid("project_dir", "path is empty"));
        }
        let project_dir = std::path::absolute(project_dir)?;

        info!("Installing {:?} in editable mode", project_dir);
        self.pip(
            vec!["install".into(), "-e".into(), project_dir.into_os_string()],
            handler,
        )
        .await
    }

    /// `pip install <packages...> [--index-url <url>]` inside the venv.
    ///
    /// Names are trimmed and blank entries dropped. An empty list and a list
    /// of only blank names are rejected with distinct reasons. No state is
    /// kept between calls.
    pub async fn install_packages<S, H>(
        &self,
        packages: &[S],
        index_url: Option<&str>,
        handler: &H,
    ) -> Result<i32>
    where
        S: AsRef<str> + Sync,
        H: EventHandler + ?Sized,
    {
        if packages.is_empty() {
            return Err(EnvError::invalid("packages", "no packages given"));
        }
        let names: Vec<&str> = packages
            .iter()
            .map(|p| p.as_ref().trim())
            .filter(|p| !p.is_empty())
            .collect();
        if names.is_empty() {
            return Err(EnvError::invalid("packages", "all package names are blank"));
        }

        let mut args: Vec<OsString> = vec!["install".into()];
        args.extend(names.iter().map(|name| OsString::from(*name)));
        if let Some(url) = index_url.map(str::trim).filter(|u| !u.is_empty()) {
            args.push("--index-url".into());
            args.push(url.into());
        }

        info!("Installing packages: {:?}", names);
        self.pip(args, handler).await
    }

    /// Install torch, torchvision and torchaudio built for the host's CUDA.
    ///
    /// `cuda_override` (e.g. `"12.6"` or `"cu126"`) takes precedence over
    /// detection. When no tag can be determined the error callback is
    /// invoked and [`FAILURE_EXIT_CODE`] is returned without running pip.
    pub async fn install_torch<H>(
        &self,
        version_hint: Option<&str>,
        cuda_override: Option<&str>,
        handler: &H,
    ) -> Result<i32>
    where
        H: EventHandler + ?Sized,
    {
        let tag = match cuda_override.filter(|o| !o.trim().is_empty()) {
            Some(value) => Some(normalize_tag(value)),
            None => self.detector.detect(handler).await,
        };

        let Some(tag) = tag else {
            handler.on_error(&format!(
                "No CUDA version detected. Pass a CUDA version explicitly or set {}.",
                self.config.cuda_env_var
            ));
            return Ok(FAILURE_EXIT_CODE);
        };

        let packages = torch::package_set(version_hint, &tag);
        let index = torch::index_url(&tag);
        info!("Installing {:?} for {}", packages, tag);
        self.install_packages(packages.as_slice(), Some(index.as_str()), handler)
            .await
    }

    fn script_invocation<S: AsRef<str>>(
        &self,
        script: &Path,
        args: &[S],
        working_dir: Option<&Path>,
    ) -> Result<Invocation> {
        if is_blank_path(script) {
            return Err(EnvError::invalid("script", "path is empty"));
        }
        if !script.is_file() {
            return Err(EnvError::not_found("Script", script));
        }
        let script = std::path::absolute(script)?;

        let mut invocation = self
            .venv_invocation()
            .arg(script)
            .args(args.iter().map(|a| a.as_ref()));
        if let Some(dir) = working_dir {
            invocation = invocation.current_dir(dir);
        }
        Ok(invocation)
    }

    /// Run a Python script with the venv interpreter.
    ///
    /// `working_dir` defaults to the runtime root.
    pub async fn run_script<S, H>(
        &self,
        script: &Path,
        args: &[S],
        working_dir: Option<&Path>,
        handler: &H,
    ) -> Result<i32>
    where
        S: AsRef<str> + Sync,
        H: EventHandler + ?Sized,
    {
        let invocation = self.script_invocation(script, args, working_dir)?;
        Ok(self.runner.run(invocation, handler).await?)
    }

    /// Legacy variant of [`run_script`](Self::run_script): a nonzero exit is
    /// raised as [`EnvError::ProcessFailed`] carrying the captured stderr.
    pub async fn run_script_checked<S, H>(
        &self,
        script: &Path,
        args: &[S],
        working_dir: Option<&Path>,
        handler: &H,
    ) -> Result<()>
    where
        S: AsRef<str> + Sync,
        H: EventHandler + ?Sized,
    {
        let invocation = self.script_invocation(script, args, working_dir)?;
        run_checked(&self.runner, invocation, handler)
            .await
            .map_err(|e| match e.downcast::<ExitFailure>() {
                Ok(failure) => EnvError::ProcessFailed {
                    code: failure.code,
                    stderr: failure.stderr,
                },
                Err(other) => EnvError::Other(other),
            })
    }

    /// Delete the whole runtime root.
    ///
    /// Returns 0 on success (including when the root is already gone) and
    /// [`FAILURE_EXIT_CODE`] on failure, which is also reported through the
    /// error callback. Never raises.
    pub async fn remove<H>(&self, handler: &H) -> i32
    where
        H: EventHandler + ?Sized,
    {
        let root = self.root();
        match tokio::fs::remove_dir_all(root).await {
            Ok(()) => {
                info!("Removed runtime root {:?}", root);
                0
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => {
                handler.on_error(&format!("Failed to remove {:?}: {}", root, e));
                FAILURE_EXIT_CODE
            }
        }
    }
}
