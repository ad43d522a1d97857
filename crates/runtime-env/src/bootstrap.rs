//! Bootstrap of a self-contained Python runtime root.
//!
//! A root is populated exactly once:
//!
//! 1. download the distribution archive and extract it into the root
//! 2. run `get-pip.py` with the base interpreter
//! 3. enable `import site` in the `python*._pth` files
//! 4. `pip install virtualenv` into the base runtime
//! 5. `python -m virtualenv <root>/venv`
//!
//! If the base interpreter already exists the whole sequence is skipped
//! without further verification. Any failure, including a nonzero exit from
//! one of the child processes or dropping the future mid-way, deletes the
//! root so no partial state survives. The downloaded archive is always
//! removed.

use anyhow::{anyhow, Context};
use log::{info, warn};
use runtime_launch::{ArchiveFetcher, CommandRunner, InterpreterLayout, Invocation};
use std::path::{Path, PathBuf};

use crate::config::{RuntimeConfig, GET_PIP_URL};
use crate::error::{EnvError, Result};
use crate::progress::{BootstrapPhase, EventHandler};

/// Where `get-pip.py` is saved inside the root.
pub const GET_PIP_SCRIPT: &str = "get-pip.py";

/// Commented-out form of the directive, matched case-insensitively.
const SITE_IMPORT_COMMENTED: &str = "#import site";
const SITE_IMPORT_ACTIVE: &str = "import site";

/// Whether `name` looks like a startup configuration file (`python311._pth`).
fn is_startup_config(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    lower.starts_with("python") && lower.ends_with("._pth")
}

/// Rewrite `#import site` lines to `import site`, leaving everything else
/// untouched. Returns `None` when nothing changed.
pub fn enable_site_import(contents: &str) -> Option<String> {
    let mut changed = false;
    let patched: String = contents
        .split_inclusive('\n')
        .map(|line| {
            let is_marker = line
                .get(..SITE_IMPORT_COMMENTED.len())
                .is_some_and(|prefix| prefix.eq_ignore_ascii_case(SITE_IMPORT_COMMENTED));
            if is_marker {
                changed = true;
                format!(
                    "{}{}",
                    SITE_IMPORT_ACTIVE,
                    &line[SITE_IMPORT_COMMENTED.len()..]
                )
            } else {
                line.to_string()
            }
        })
        .collect();
    changed.then_some(patched)
}

/// Enable site imports in every `python*._pth` file directly under `root`.
///
/// Returns the files that were rewritten. Already patched files are left
/// alone, so running this twice is a no-op the second time.
pub async fn patch_startup_config(root: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut patched = Vec::new();
    let mut entries = tokio::fs::read_dir(root).await?;

    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().to_string();
        if !is_startup_config(&name) || !entry.file_type().await?.is_file() {
            continue;
        }

        let path = entry.path();
        let contents = tokio::fs::read_to_string(&path).await?;
        if let Some(updated) = enable_site_import(&contents) {
            tokio::fs::write(&path, updated).await?;
            info!("[bootstrap] Enabled site imports in {:?}", path);
            patched.push(path);
        }
    }

    Ok(patched)
}

/// Removes a partially bootstrapped root and the downloaded archive if the
/// bootstrap future is dropped before it finishes.
struct CancelGuard {
    root: PathBuf,
    archive: PathBuf,
    armed: bool,
}

impl CancelGuard {
    fn new(root: &Path, archive: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            archive: archive.to_path_buf(),
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        warn!("[bootstrap] Cancelled, removing {:?}", self.root);
        if let Err(e) = std::fs::remove_dir_all(&self.root) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("[bootstrap] Failed to remove {:?}: {}", self.root, e);
            }
        }
        if let Err(e) = std::fs::remove_file(&self.archive) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("[bootstrap] Failed to remove {:?}: {}", self.archive, e);
            }
        }
    }
}

/// Bootstrap the runtime root described by `config`.
///
/// Returns the exit code of the last child process run (0 on success, or
/// immediately when the root is already initialized). A nonzero code means
/// the bootstrap aborted and the root was removed. Dropping the returned
/// future before it completes also removes the root.
pub async fn initialize<R, F, H>(
    config: &RuntimeConfig,
    layout: &dyn InterpreterLayout,
    runner: &R,
    fetcher: &F,
    handler: &H,
) -> Result<i32>
where
    R: CommandRunner + ?Sized,
    F: ArchiveFetcher + ?Sized,
    H: EventHandler + ?Sized,
{
    // Children run with the root as cwd, so paths handed to them must be absolute
    let root = std::path::absolute(&config.root)?;
    let root_display = root.to_string_lossy().to_string();

    if layout.base_executable(&root).exists() {
        handler.on_progress(BootstrapPhase::AlreadyInitialized {
            root: root_display,
        });
        return Ok(0);
    }

    handler.on_progress(BootstrapPhase::Starting {
        root: root_display.clone(),
    });

    let archive = std::env::temp_dir().join(format!("pyrt-dist-{}.zip", uuid::Uuid::new_v4()));
    let mut guard = CancelGuard::new(&root, &archive);
    let outcome = run_steps(config, &root, layout, runner, fetcher, handler, &archive).await;
    guard.disarm();

    if archive.exists() {
        if let Err(e) = tokio::fs::remove_file(&archive).await {
            warn!("[bootstrap] Failed to remove {:?}: {}", archive, e);
        }
    }

    match outcome {
        Ok(0) => {
            let python = layout.venv_python(&layout.venv_dir(&root));
            handler.on_progress(BootstrapPhase::Ready {
                root: root_display,
                python_path: python.to_string_lossy().to_string(),
            });
            Ok(0)
        }
        Ok(code) => {
            handler.on_progress(BootstrapPhase::Error {
                message: format!("bootstrap step exited with code {code}"),
            });
            rollback(&root, handler).await;
            Ok(code)
        }
        Err(e) => {
            handler.on_progress(BootstrapPhase::Error {
                message: format!("{e:#}"),
            });
            rollback(&root, handler).await;
            Err(EnvError::Bootstrap(e))
        }
    }
}

/// The sequential bootstrap steps. `Ok(code)` with a nonzero code aborts
/// at the failing child process.
async fn run_steps<R, F, H>(
    config: &RuntimeConfig,
    root: &Path,
    layout: &dyn InterpreterLayout,
    runner: &R,
    fetcher: &F,
    handler: &H,
    archive: &Path,
) -> anyhow::Result<i32>
where
    R: CommandRunner + ?Sized,
    F: ArchiveFetcher + ?Sized,
    H: EventHandler + ?Sized,
{
    tokio::fs::create_dir_all(root)
        .await
        .with_context(|| format!("Failed to create {:?}", root))?;

    handler.on_progress(BootstrapPhase::Downloading {
        url: config.distribution_url.clone(),
    });
    fetcher.download(&config.distribution_url, archive).await?;

    handler.on_progress(BootstrapPhase::Extracting {
        archive: archive.to_string_lossy().to_string(),
    });
    fetcher.extract(archive, root).await?;

    let python = layout.base_executable(root);
    if !python.exists() {
        return Err(anyhow!(
            "Distribution {} has no interpreter at {:?}",
            config.distribution_url,
            python
        ));
    }

    let get_pip = root.join(GET_PIP_SCRIPT);
    handler.on_progress(BootstrapPhase::Downloading {
        url: GET_PIP_URL.to_string(),
    });
    fetcher.download(GET_PIP_URL, &get_pip).await?;

    handler.on_progress(BootstrapPhase::InstallingPip);
    let code = runner
        .run(
            Invocation::new(&python)
                .arg(&get_pip)
                .arg("--no-warn-script-location")
                .current_dir(root),
            handler,
        )
        .await?;
    if code != 0 {
        return Ok(code);
    }

    let patched = patch_startup_config(root).await?;
    handler.on_progress(BootstrapPhase::PatchingStartupConfig {
        files: patched
            .iter()
            .map(|p| p.to_string_lossy().to_string())
            .collect(),
    });

    handler.on_progress(BootstrapPhase::InstallingVirtualenv);
    let code = runner
        .run(
            Invocation::new(&python)
                .args(["-m", "pip", "install", "virtualenv", "--no-warn-script-location"])
                .current_dir(root),
            handler,
        )
        .await?;
    if code != 0 {
        return Ok(code);
    }

    handler.on_progress(BootstrapPhase::CreatingVenv);
    let code = runner
        .run(
            Invocation::new(&python)
                .args(["-m", "virtualenv"])
                .arg(layout.venv_dir(root))
                .current_dir(root),
            handler,
        )
        .await?;

    Ok(code)
}
