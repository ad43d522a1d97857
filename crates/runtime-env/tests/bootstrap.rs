//! Integration tests for runtime bootstrap and the manager facade.
//!
//! The network and the Python toolchain are replaced by fakes: the fetcher
//! serves an in-memory zip shaped like an embeddable distribution and the
//! runner records every invocation instead of spawning it.

use std::future::Future;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use runtime_env::bootstrap::{self, GET_PIP_SCRIPT};
use runtime_env::config::GET_PIP_URL;
use runtime_env::{
    BootstrapPhase, EnvError, EnvironmentManager, EventHandler, RuntimeConfig, TagDetector,
    FAILURE_EXIT_CODE,
};
use runtime_launch::fetch::extract_zip;
use runtime_launch::{layout_for, ArchiveFetcher, CommandRunner, Invocation, OutputSink};
use serial_test::serial;
use tempfile::TempDir;
use zip::write::SimpleFileOptions;

const DIST_URL: &str = "https://example.invalid/python-embed.zip";
const PTH_ORIGINAL: &str = "python311.zip\r\n.\r\n\r\n#import site\r\n";

/// Build a zip holding `bin/python3` and a `python311._pth`.
fn distribution_zip() -> Vec<u8> {
    let mut buf = std::io::Cursor::new(Vec::new());
    {
        let mut zip = zip::ZipWriter::new(&mut buf);
        let options = SimpleFileOptions::default();
        zip.start_file("bin/python3", options).unwrap();
        zip.write_all(b"#!/bin/sh\n").unwrap();
        zip.start_file("python311._pth", options).unwrap();
        zip.write_all(PTH_ORIGINAL.as_bytes()).unwrap();
        zip.start_file("python311.zip", options).unwrap();
        zip.write_all(b"stdlib").unwrap();
        zip.finish().unwrap();
    }
    buf.into_inner()
}

#[derive(Default)]
struct FakeFetcher {
    downloads: Mutex<Vec<(String, PathBuf)>>,
    extracts: Mutex<Vec<PathBuf>>,
    fail_extract: bool,
    empty_distribution: bool,
    stall_get_pip: bool,
}

impl FakeFetcher {
    fn calls(&self) -> usize {
        self.downloads.lock().unwrap().len() + self.extracts.lock().unwrap().len()
    }
}

impl ArchiveFetcher for FakeFetcher {
    fn download<'a>(
        &'a self,
        url: &'a str,
        dest: &'a Path,
    ) -> impl Future<Output = anyhow::Result<()>> + Send + 'a {
        async move {
            self.downloads
                .lock()
                .unwrap()
                .push((url.to_string(), dest.to_path_buf()));
            if self.stall_get_pip && url == GET_PIP_URL {
                std::future::pending::<()>().await;
            }
            let body = if url == GET_PIP_URL {
                b"print('pip')\n".to_vec()
            } else if self.empty_distribution {
                let mut buf = std::io::Cursor::new(Vec::new());
                zip::ZipWriter::new(&mut buf).finish().unwrap();
                buf.into_inner()
            } else {
                distribution_zip()
            };
            std::fs::write(dest, body)?;
            Ok(())
        }
    }

    fn extract<'a>(
        &'a self,
        archive: &'a Path,
        dest: &'a Path,
    ) -> impl Future<Output = anyhow::Result<()>> + Send + 'a {
        async move {
            self.extracts.lock().unwrap().push(archive.to_path_buf());
            if self.fail_extract {
                anyhow::bail!("corrupt archive");
            }
            extract_zip(archive, dest)?;
            Ok(())
        }
    }
}

/// Records invocations. Returns `fail_at`'s code for the call at that index
/// and creates the venv interpreter when `-m virtualenv` runs.
#[derive(Default)]
struct FakeRunner {
    calls: Mutex<Vec<Invocation>>,
    fail_at: Option<(usize, i32)>,
}

impl FakeRunner {
    fn arg_strings(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(Invocation::arg_string)
            .collect()
    }
}

impl CommandRunner for FakeRunner {
    fn run<'a, S>(
        &'a self,
        invocation: Invocation,
        sink: &'a S,
    ) -> impl Future<Output = anyhow::Result<i32>> + Send + 'a
    where
        S: OutputSink + ?Sized,
    {
        async move {
            let index = {
                let mut calls = self.calls.lock().unwrap();
                calls.push(invocation.clone());
                calls.len() - 1
            };
            if let Some((at, code)) = self.fail_at {
                if at == index {
                    sink.on_stderr("simulated failure");
                    return Ok(code);
                }
            }

            let args: Vec<String> = invocation
                .args
                .iter()
                .map(|a| a.to_string_lossy().to_string())
                .collect();
            if args.len() == 3 && args[0] == "-m" && args[1] == "virtualenv" {
                let bin = Path::new(&args[2]).join("bin");
                std::fs::create_dir_all(&bin)?;
                std::fs::write(bin.join("python"), "")?;
            }
            sink.on_stdout("ok");
            Ok(0)
        }
    }
}

struct NoCuda;

impl TagDetector for NoCuda {
    fn detect<'a, H>(&'a self, _handler: &'a H) -> impl Future<Output = Option<String>> + Send + 'a
    where
        H: EventHandler + ?Sized,
    {
        async move { None }
    }
}

#[derive(Default)]
struct Recorder {
    phases: Mutex<Vec<BootstrapPhase>>,
    errors: Mutex<Vec<String>>,
}

impl OutputSink for Recorder {
    fn on_stdout(&self, _line: &str) {}
    fn on_stderr(&self, _line: &str) {}
}

impl EventHandler for Recorder {
    fn on_progress(&self, phase: BootstrapPhase) {
        self.phases.lock().unwrap().push(phase);
    }

    fn on_error(&self, message: &str) {
        self.errors.lock().unwrap().push(message.to_string());
    }
}

fn manager(
    root: &Path,
    runner: FakeRunner,
    fetcher: FakeFetcher,
) -> EnvironmentManager<FakeRunner, FakeFetcher, NoCuda> {
    let mut config = RuntimeConfig::with_root(root);
    config.distribution_url = DIST_URL.to_string();
    EnvironmentManager::with_parts(
        config,
        layout_for("unix").unwrap(),
        runner,
        fetcher,
        NoCuda,
    )
}

fn runtime_root(temp: &TempDir) -> PathBuf {
    temp.path().join("runtime")
}

#[tokio::test]
async fn test_full_bootstrap_sequence() {
    let temp = TempDir::new().unwrap();
    let root = runtime_root(&temp);
    let mgr = manager(&root, FakeRunner::default(), FakeFetcher::default());
    let handler = Recorder::default();

    let code = mgr.initialize(&handler).await.unwrap();
    assert_eq!(code, 0);
    assert!(mgr.base_executable().exists());
    assert!(mgr.is_initialized());

    // Startup config has site imports enabled, everything else untouched
    assert_eq!(
        std::fs::read_to_string(root.join("python311._pth")).unwrap(),
        "python311.zip\r\n.\r\n\r\nimport site\r\n"
    );
    assert!(root.join(GET_PIP_SCRIPT).exists());

    let python = mgr.base_executable();
    let calls = mgr.runner().calls.lock().unwrap().clone();
    assert_eq!(calls.len(), 3);
    assert!(calls.iter().all(|c| c.program == python));
    assert!(calls
        .iter()
        .all(|c| c.working_dir.as_deref() == Some(root.as_path())));

    let args = mgr.runner().arg_strings();
    assert!(args[0].ends_with("get-pip.py --no-warn-script-location"));
    assert_eq!(
        args[1],
        "-m pip install virtualenv --no-warn-script-location"
    );
    assert!(args[2].starts_with("-m virtualenv "));
    assert!(args[2].ends_with("venv"));

    let phases = handler.phases.lock().unwrap();
    assert!(matches!(phases.first(), Some(BootstrapPhase::Starting { .. })));
    assert!(matches!(phases.last(), Some(BootstrapPhase::Ready { .. })));
    assert!(phases.contains(&BootstrapPhase::InstallingPip));
    assert!(phases.contains(&BootstrapPhase::CreatingVenv));
}

#[tokio::test]
async fn test_temp_archive_is_removed() {
    let temp = TempDir::new().unwrap();
    let mgr = manager(
        &runtime_root(&temp),
        FakeRunner::default(),
        FakeFetcher::default(),
    );
    mgr.initialize(&Recorder::default()).await.unwrap();

    let downloads = mgr.fetcher().downloads.lock().unwrap().clone();
    let (url, archive) = &downloads[0];
    assert_eq!(url, DIST_URL);
    assert!(!archive.exists(), "distribution archive should be deleted");
}

#[tokio::test]
async fn test_initialize_is_idempotent() {
    let temp = TempDir::new().unwrap();
    let root = runtime_root(&temp);
    let python = root.join("bin").join("python3");
    std::fs::create_dir_all(python.parent().unwrap()).unwrap();
    std::fs::write(&python, "").unwrap();

    let mgr = manager(&root, FakeRunner::default(), FakeFetcher::default());
    let handler = Recorder::default();

    assert_eq!(mgr.initialize(&handler).await.unwrap(), 0);
    assert_eq!(mgr.initialize(&handler).await.unwrap(), 0);

    assert_eq!(mgr.fetcher().calls(), 0);
    assert!(mgr.runner().calls.lock().unwrap().is_empty());
    assert!(handler
        .phases
        .lock()
        .unwrap()
        .iter()
        .all(|p| matches!(p, BootstrapPhase::AlreadyInitialized { .. })));
}

#[tokio::test]
async fn test_extract_failure_rolls_back() {
    let temp = TempDir::new().unwrap();
    let root = runtime_root(&temp);
    let fetcher = FakeFetcher {
        fail_extract: true,
        ..Default::default()
    };
    let mgr = manager(&root, FakeRunner::default(), fetcher);
    let handler = Recorder::default();

    let err = mgr.initialize(&handler).await.unwrap_err();
    assert!(matches!(err, EnvError::Bootstrap(_)));
    assert!(err.to_string().contains("corrupt archive"), "{err}");
    assert!(!root.exists(), "partial root must be removed");
    assert!(mgr.runner().calls.lock().unwrap().is_empty());

    let downloads = mgr.fetcher().downloads.lock().unwrap().clone();
    assert!(!downloads[0].1.exists());
    assert!(handler
        .phases
        .lock()
        .unwrap()
        .iter()
        .any(|p| matches!(p, BootstrapPhase::RolledBack { .. })));
}

#[tokio::test]
async fn test_distribution_without_interpreter_rolls_back() {
    let temp = TempDir::new().unwrap();
    let root = runtime_root(&temp);
    let fetcher = FakeFetcher {
        empty_distribution: true,
        ..Default::default()
    };
    let mgr = manager(&root, FakeRunner::default(), fetcher);

    let err = mgr.initialize(&Recorder::default()).await.unwrap_err();
    assert!(matches!(err, EnvError::Bootstrap(_)));
    assert!(!root.exists());
}

#[tokio::test]
async fn test_nonzero_step_rolls_back_and_returns_code() {
    let temp = TempDir::new().unwrap();
    let root = runtime_root(&temp);
    // Fail `pip install virtualenv`
    let runner = FakeRunner {
        fail_at: Some((1, 2)),
        ..Default::default()
    };
    let mgr = manager(&root, runner, FakeFetcher::default());
    let handler = Recorder::default();

    let code = mgr.initialize(&handler).await.unwrap();
    assert_eq!(code, 2);
    assert!(!root.exists());
    assert_eq!(
        mgr.runner().calls.lock().unwrap().len(),
        2,
        "no step runs after a failure"
    );

    // A retry starts from scratch
    let mgr = manager(&root, FakeRunner::default(), FakeFetcher::default());
    assert_eq!(mgr.initialize(&handler).await.unwrap(), 0);
    assert!(mgr.is_initialized());
}

#[tokio::test]
async fn test_get_pip_failure_rolls_back() {
    let temp = TempDir::new().unwrap();
    let root = runtime_root(&temp);
    let runner = FakeRunner {
        fail_at: Some((0, 1)),
        ..Default::default()
    };
    let mgr = manager(&root, runner, FakeFetcher::default());

    let code = mgr.initialize(&Recorder::default()).await.unwrap();
    assert_eq!(code, 1);
    assert!(!root.exists());
    assert_eq!(mgr.runner().calls.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_cancelled_bootstrap_rolls_back() {
    let temp = TempDir::new().unwrap();
    let root = runtime_root(&temp);
    let fetcher = FakeFetcher {
        stall_get_pip: true,
        ..Default::default()
    };
    let mgr = manager(&root, FakeRunner::default(), fetcher);
    let handler = Recorder::default();

    // The distribution is extracted, then the get-pip download never finishes
    let result =
        tokio::time::timeout(Duration::from_millis(200), mgr.initialize(&handler)).await;
    assert!(result.is_err(), "bootstrap should still be pending");

    assert!(!root.exists(), "dropping bootstrap must remove the root");
    let downloads = mgr.fetcher().downloads.lock().unwrap().clone();
    assert_eq!(downloads.len(), 2);
    assert!(!downloads[0].1.exists(), "distribution archive should be deleted");

    // The next attempt runs the whole sequence instead of the fast path
    let mgr = manager(&root, FakeRunner::default(), FakeFetcher::default());
    assert_eq!(mgr.initialize(&handler).await.unwrap(), 0);
    assert_eq!(mgr.runner().calls.lock().unwrap().len(), 3);
    assert!(mgr.is_initialized());
}

#[tokio::test]
#[serial]
async fn test_relative_root_is_resolved_against_cwd() {
    let temp = TempDir::new().unwrap();
    let original_cwd = std::env::current_dir().unwrap();
    std::env::set_current_dir(temp.path()).unwrap();

    let mut config = RuntimeConfig::with_root("rt");
    config.distribution_url = DIST_URL.to_string();
    let runner = FakeRunner::default();
    let result = bootstrap::initialize(
        &config,
        layout_for("unix").unwrap(),
        &runner,
        &FakeFetcher::default(),
        &Recorder::default(),
    )
    .await;

    // Restore cwd before asserting
    std::env::set_current_dir(&original_cwd).unwrap();
    assert_eq!(result.unwrap(), 0);

    let root = std::fs::canonicalize(temp.path()).unwrap().join("rt");
    assert!(root.join("bin").join("python3").exists());
    assert!(root.join("venv").join("bin").join("python").exists());

    let calls = runner.calls.lock().unwrap();
    for call in calls.iter() {
        assert!(call.program.is_absolute(), "{:?}", call.program);
        assert!(call.working_dir.as_deref().is_some_and(Path::is_absolute));
    }
    assert!(Path::new(&calls[0].args[0]).is_absolute());
    assert!(Path::new(calls[2].args.last().unwrap()).is_absolute());
}

#[tokio::test]
async fn test_requirements_install_after_bootstrap() {
    let temp = TempDir::new().unwrap();
    let root = runtime_root(&temp);
    let mgr = manager(&root, FakeRunner::default(), FakeFetcher::default());
    let handler = Recorder::default();
    mgr.initialize(&handler).await.unwrap();
    mgr.runner().calls.lock().unwrap().clear();

    let manifest = temp.path().join("requirements.txt");
    std::fs::write(&manifest, "numpy\n").unwrap();

    let code = mgr.install_requirements(&manifest, &handler).await.unwrap();
    assert_eq!(code, 0);

    let calls = mgr.runner().calls.lock().unwrap();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].program, mgr.python_path());
    assert!(calls[0].working_dir.is_none(), "runs in the runner default");
    let args = calls[0].arg_string();
    assert!(args.contains("install -r"), "{args}");
    assert!(args.contains(&manifest.to_string_lossy().to_string()), "{args}");
}

#[tokio::test]
async fn test_install_torch_without_cuda_reports_error() {
    let temp = TempDir::new().unwrap();
    let mgr = manager(
        &runtime_root(&temp),
        FakeRunner::default(),
        FakeFetcher::default(),
    );
    let handler = Recorder::default();

    let code = mgr.install_torch(None, None, &handler).await.unwrap();
    assert_eq!(code, FAILURE_EXIT_CODE);
    assert!(mgr.runner().calls.lock().unwrap().is_empty());

    let errors = handler.errors.lock().unwrap();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].contains("CUDA_VERSION"), "{}", errors[0]);
}

#[tokio::test]
async fn test_remove_after_bootstrap() {
    let temp = TempDir::new().unwrap();
    let root = runtime_root(&temp);
    let mgr = manager(&root, FakeRunner::default(), FakeFetcher::default());
    let handler = Recorder::default();
    mgr.initialize(&handler).await.unwrap();

    assert_eq!(mgr.remove(&handler).await, 0);
    assert!(!root.exists());
    assert!(!mgr.is_initialized());
}
