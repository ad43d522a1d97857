//! pyrt CLI entry point.
//!
//! Bootstraps a self-contained Python runtime and runs pip and scripts
//! inside its virtual environment. The process exit status mirrors the
//! child's exit code.

use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use log::{info, warn};
use runtime_env::{CudaDetector, EnvError, EnvironmentManager, RuntimeConfig, TagDetector};
use serde::Serialize;

mod console;

use crate::console::ConsoleHandler;

/// Exit status reported when the user interrupts a running child.
const INTERRUPTED_EXIT_CODE: i32 = 130;

/// How long a terminated child gets to be reaped after Ctrl-C.
const TERMINATE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "pyrt")]
#[command(author, version, about = "Self-contained Python runtimes", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Runtime root directory (default: platform data dir)
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// Config file (default: <config dir>/pyrt/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the runtime distribution archive URL
    #[arg(long, global = true)]
    distribution_url: Option<String>,

    /// Log level
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Bootstrap the runtime and its virtual environment
    Init,

    /// Install from a requirements file or a local project
    Install {
        /// Requirements file
        #[arg(short = 'r', long, required_unless_present = "editable", conflicts_with = "editable")]
        requirements: Option<PathBuf>,

        /// Project directory to install in editable mode
        #[arg(short = 'e', long)]
        editable: Option<PathBuf>,
    },

    /// Install packages by name
    Add {
        /// Package names or specifiers
        #[arg(required = true)]
        packages: Vec<String>,

        /// Alternate package index
        #[arg(long)]
        index_url: Option<String>,
    },

    /// Install PyTorch built for this machine's CUDA version
    Torch {
        /// Version hint (`2.5.1`, `torch==2.5.1`, `torch==2.5.1+cu118`)
        #[arg(long = "version")]
        torch_version: Option<String>,

        /// CUDA version to target instead of detecting it (`12.6`, `cu126`)
        #[arg(long)]
        cuda: Option<String>,
    },

    /// Run a Python script inside the virtual environment
    Run {
        /// Script path
        script: PathBuf,

        /// Working directory (default: runtime root)
        #[arg(long)]
        cwd: Option<PathBuf>,

        /// Arguments passed to the script
        #[arg(last = true)]
        args: Vec<String>,
    },

    /// Print the detected CUDA tag
    DetectCuda,

    /// Show runtime paths and status
    Info {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Delete the runtime root
    Remove,
}

#[derive(Serialize)]
struct RuntimeInfo {
    root: PathBuf,
    layout: &'static str,
    base_executable: PathBuf,
    python_path: PathBuf,
    working_dir: PathBuf,
    initialized: bool,
    distribution_url: String,
}

fn resolve_config(cli: &Cli) -> anyhow::Result<RuntimeConfig> {
    let mut config = match cli.config {
        Some(ref path) => RuntimeConfig::load(path)?,
        None => RuntimeConfig::load_or_default()?,
    };
    if let Some(ref root) = cli.root {
        config.root = root.clone();
    }
    if let Some(ref url) = cli.distribution_url {
        config.distribution_url = url.clone();
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&cli.log_level))
        .init();

    let config = resolve_config(&cli)?;
    info!("Runtime root: {:?}", config.root);

    let manager = EnvironmentManager::new(config)?;
    let handler = ConsoleHandler::default();
    let code = run_command(&manager, cli.command, &handler).await?;

    std::process::exit(exit_status(code));
}

/// Negative codes (the failure sentinel, signal deaths) would wrap to 255
/// and up; report them as a plain failure.
fn exit_status(code: i32) -> i32 {
    if code < 0 {
        1
    } else {
        code
    }
}

async fn run_command(
    manager: &EnvironmentManager,
    command: Commands,
    handler: &ConsoleHandler,
) -> anyhow::Result<i32> {
    match command {
        Commands::Init => interruptible(handler, manager.initialize(handler)).await,
        Commands::Install {
            requirements: Some(manifest),
            ..
        } => interruptible(handler, manager.install_requirements(&manifest, handler)).await,
        Commands::Install {
            editable: Some(dir),
            ..
        } => interruptible(handler, manager.install_editable(&dir, handler)).await,
        Commands::Install { .. } => anyhow::bail!("Pass either -r <file> or -e <dir>"),
        Commands::Add {
            packages,
            index_url,
        } => {
            interruptible(
                handler,
                manager.install_packages(packages.as_slice(), index_url.as_deref(), handler),
            )
            .await
        }
        Commands::Torch {
            torch_version,
            cuda,
        } => {
            interruptible(
                handler,
                manager.install_torch(torch_version.as_deref(), cuda.as_deref(), handler),
            )
            .await
        }
        Commands::Run { script, cwd, args } => {
            interruptible(
                handler,
                manager.run_script(&script, args.as_slice(), cwd.as_deref(), handler),
            )
            .await
        }
        Commands::DetectCuda => {
            let detector = CudaDetector::from_config(manager.config());
            match detector.detect(handler).await {
                Some(tag) => {
                    println!("{tag}");
                    Ok(0)
                }
                None => {
                    eprintln!(
                        "No CUDA version detected (set {} to override)",
                        manager.config().cuda_env_var
                    );
                    Ok(1)
                }
            }
        }
        Commands::Info { json } => {
            show_info(manager, json)?;
            Ok(0)
        }
        Commands::Remove => Ok(manager.remove(handler).await),
    }
}

/// Drive `operation` to completion, stopping the running child on Ctrl-C.
///
/// On interrupt the child's process tree is killed and the operation gets
/// [`TERMINATE_TIMEOUT`] to observe the exit (bootstrap uses it to roll back).
async fn interruptible<F>(handler: &ConsoleHandler, operation: F) -> anyhow::Result<i32>
where
    F: Future<Output = Result<i32, EnvError>>,
{
    tokio::pin!(operation);

    tokio::select! {
        result = &mut operation => Ok(result?),
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, stopping child process");
            if let Some(handle) = handler.current() {
                handle.terminate_tree()?;
            }
            match tokio::time::timeout(TERMINATE_TIMEOUT, &mut operation).await {
                Ok(result) => {
                    result?;
                }
                Err(_) => warn!(
                    "Operation did not finish within {}s of interrupt",
                    TERMINATE_TIMEOUT.as_secs()
                ),
            }
            Ok(INTERRUPTED_EXIT_CODE)
        }
    }
}

fn runtime_info(manager: &EnvironmentManager) -> RuntimeInfo {
    RuntimeInfo {
        root: manager.root().to_path_buf(),
        layout: manager.layout().name(),
        base_executable: manager.base_executable(),
        python_path: manager.python_path(),
        working_dir: manager.runner().default_dir().to_path_buf(),
        initialized: manager.is_initialized(),
        distribution_url: manager.config().distribution_url.clone(),
    }
}

fn show_info(manager: &EnvironmentManager, json: bool) -> anyhow::Result<()> {
    let info = runtime_info(manager);

    if json {
        println!("{}", serde_json::to_string_pretty(&info)?);
        return Ok(());
    }

    println!("Root:             {}", info.root.display());
    println!("Layout:           {}", info.layout);
    println!("Base interpreter: {}", info.base_executable.display());
    println!("Venv interpreter: {}", info.python_path.display());
    println!("Working dir:      {}", info.working_dir.display());
    println!(
        "Status:           {}",
        if info.initialized {
            "initialized"
        } else {
            "not initialized"
        }
    );
    println!("Distribution:     {}", info.distribution_url);
    Ok(())
}
