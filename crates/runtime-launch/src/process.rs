//! Child process execution with streamed output.
//!
//! [`ProcessRunner`] spawns a child with piped stdout/stderr and hands each
//! line to an [`OutputSink`] as soon as it arrives. Ordering is preserved
//! within a stream but not across the two streams.
//!
//! Two error conventions exist:
//!
//! - [`CommandRunner::run`] returns the exit code. A nonzero exit is not an
//!   error; only spawn/IO failures are.
//! - [`run_checked`] is the legacy convention: it captures stderr and turns
//!   a nonzero exit into an error carrying that text.
//!
//! The runner has no timeout or cancellation of its own. Callers get a
//! [`ProcessHandle`] through [`OutputSink::on_process_started`] and may
//! terminate the process tree with it.

use anyhow::{anyhow, Context, Result};
use log::{debug, info, warn};
use std::ffi::{OsStr, OsString};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;

use crate::activation::EnvOverlay;

/// Receives output and lifecycle notifications from a running child.
pub trait OutputSink: Send + Sync {
    /// One line of the child's stdout, without the trailing newline.
    fn on_stdout(&self, line: &str);

    /// One line of the child's stderr, without the trailing newline.
    fn on_stderr(&self, line: &str);

    /// Fired once, right after the child is spawned.
    fn on_process_started(&self, _handle: ProcessHandle) {}
}

/// Everything needed to launch one child process.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    /// Falls back to the runner's default directory when `None` or empty.
    pub working_dir: Option<PathBuf>,
    pub env: Option<EnvOverlay>,
}

impl Invocation {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            env: None,
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn env_overlay(mut self, overlay: EnvOverlay) -> Self {
        self.env = Some(overlay);
        self
    }

    /// The argument list as a single display string, quoted with [`quote_arg`].
    pub fn arg_string(&self) -> String {
        self.args
            .iter()
            .map(|a| quote_arg(&a.to_string_lossy()))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Program and arguments as a single display string.
    pub fn command_line(&self) -> String {
        let program = quote_arg(&self.program.to_string_lossy());
        if self.args.is_empty() {
            program
        } else {
            format!("{} {}", program, self.arg_string())
        }
    }
}

/// Double-quote a token containing whitespace or quote characters.
///
/// Embedded double quotes are backslash-escaped. Other tokens are returned
/// unchanged.
pub fn quote_arg(token: &str) -> String {
    let needs_quotes = token.is_empty()
        || token
            .chars()
            .any(|c| c.is_whitespace() || c == '"' || c == '\'');
    if !needs_quotes {
        return token.to_string();
    }
    format!("\"{}\"", token.replace('"', "\\\""))
}

/// A live child process, handed out once at spawn time.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    pid: Option<u32>,
    exit_rx: watch::Receiver<Option<i32>>,
}

impl ProcessHandle {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// The exit code once the child has been reaped, `None` while running.
    pub fn exit_code(&self) -> Option<i32> {
        *self.exit_rx.borrow()
    }

    /// Kill the child and everything it spawned.
    ///
    /// On Unix the child leads its own process group, which is sent SIGKILL.
    /// On Windows `taskkill /T /F` walks the tree.
    pub fn terminate_tree(&self) -> Result<()> {
        let Some(pid) = self.pid else {
            return Ok(());
        };
        if self.exit_code().is_some() {
            return Ok(());
        }

        #[cfg(unix)]
        {
            use nix::sys::signal::{killpg, Signal};
            use nix::unistd::Pid;
            match killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
                Ok(()) => Ok(()),
                Err(nix::errno::Errno::ESRCH) => Ok(()),
                Err(e) => Err(anyhow!("Failed to kill process group {}: {}", pid, e)),
            }
        }

        #[cfg(windows)]
        {
            let status = std::process::Command::new("taskkill")
                .args(["/T", "/F", "/PID", &pid.to_string()])
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .context("Failed to run taskkill")?;
            if !status.success() && self.exit_code().is_none() {
                return Err(anyhow!("taskkill failed for pid {}: {}", pid, status));
            }
            Ok(())
        }
    }

    /// Wait up to `timeout` for the child to exit.
    pub async fn wait(&self, timeout: Duration) -> Option<i32> {
        let mut rx = self.exit_rx.clone();
        let code = match tokio::time::timeout(timeout, rx.wait_for(Option::is_some)).await {
            Ok(Ok(code)) => *code,
            // Sender dropped without publishing: the run future was dropped,
            // and kill_on_drop already reaped the child.
            Ok(Err(_)) => self.exit_code(),
            Err(_) => None,
        };
        code
    }

    /// Terminate the tree, then wait up to `timeout` for the exit code.
    pub async fn terminate_and_wait(&self, timeout: Duration) -> Result<Option<i32>> {
        self.terminate_tree()?;
        let code = self.wait(timeout).await;
        if code.is_none() {
            warn!(
                "[process] pid {:?} did not exit within {}ms of termination",
                self.pid,
                timeout.as_millis()
            );
        }
        Ok(code)
    }
}

/// Runs child processes to completion.
pub trait CommandRunner: Send + Sync {
    /// Run `invocation`, streaming output to `sink`, and return its exit code.
    fn run<'a, S>(
        &'a self,
        invocation: Invocation,
        sink: &'a S,
    ) -> impl Future<Output = Result<i32>> + Send + 'a
    where
        S: OutputSink + ?Sized;
}

/// The production [`CommandRunner`], backed by `tokio::process`.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    default_dir: PathBuf,
}

impl ProcessRunner {
    /// `default_dir` is used when an invocation has no working directory.
    pub fn new(default_dir: impl Into<PathBuf>) -> Self {
        Self {
            default_dir: default_dir.into(),
        }
    }

    pub fn default_dir(&self) -> &Path {
        &self.default_dir
    }

    fn resolve_dir(&self, requested: Option<&Path>) -> PathBuf {
        match requested {
            Some(dir) if !dir.as_os_str().is_empty() && !is_blank(dir) => dir.to_path_buf(),
            _ => self.default_dir.clone(),
        }
    }
}

fn is_blank(path: &Path) -> bool {
    path.to_string_lossy().trim().is_empty()
}

/// Decode one line, dropping a trailing `\r` and replacing invalid UTF-8.
fn decode_line(mut bytes: Vec<u8>) -> String {
    if bytes.last() == Some(&b'\r') {
        bytes.pop();
    }
    match String::from_utf8(bytes) {
        Ok(s) => s,
        Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
    }
}

impl CommandRunner for ProcessRunner {
    fn run<'a, S>(
        &'a self,
        invocation: Invocation,
        sink: &'a S,
    ) -> impl Future<Output = Result<i32>> + Send + 'a
    where
        S: OutputSink + ?Sized,
    {
        async move {
            let cwd = self.resolve_dir(invocation.working_dir.as_deref());
            info!("[process] {} (cwd: {:?})", invocation.command_line(), cwd);

            let mut cmd = tokio::process::Command::new(&invocation.program);
            cmd.args(&invocation.args)
                .current_dir(&cwd)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped());

            if let Some(ref overlay) = invocation.env {
                cmd.envs(overlay.iter());
            }

            #[cfg(unix)]
            cmd.process_group(0);

            let mut child = cmd
                .kill_on_drop(true)
                .spawn()
                .with_context(|| format!("Failed to start {:?}", invocation.program))?;

            let (exit_tx, exit_rx) = watch::channel(None);
            sink.on_process_started(ProcessHandle {
                pid: child.id(),
                exit_rx,
            });

            let stdout = child
                .stdout
                .take()
                .ok_or_else(|| anyhow!("child stdout was not captured"))?;
            let stderr = child
                .stderr
                .take()
                .ok_or_else(|| anyhow!("child stderr was not captured"))?;

            let mut out_lines = BufReader::new(stdout).split(b'\n');
            let mut err_lines = BufReader::new(stderr).split(b'\n');
            let mut out_done = false;
            let mut err_done = false;

            while !(out_done && err_done) {
                tokio::select! {
                    segment = out_lines.next_segment(), if !out_done => {
                        match segment? {
                            Some(bytes) => sink.on_stdout(&decode_line(bytes)),
                            None => out_done = true,
                        }
                    }
                    segment = err_lines.next_segment(), if !err_done => {
                        match segment? {
                            Some(bytes) => sink.on_stderr(&decode_line(bytes)),
                            None => err_done = true,
                        }
                    }
                }
            }

            let status = child.wait().await?;
            let code = status.code().unwrap_or(-1);
            exit_tx.send_replace(Some(code));
            debug!("[process] {:?} exited with {}", invocation.program, code);

            Ok(code)
        }
    }
}

/// A nonzero exit under the legacy [`run_checked`] convention.
#[derive(Debug, thiserror::Error)]
#[error("{program} exited with code {code}: {stderr}")]
pub struct ExitFailure {
    pub program: String,
    pub code: i32,
    /// Captured stderr lines, newline-joined.
    pub stderr: String,
}

/// Forwards to an inner sink while keeping a copy of stderr.
struct CapturingSink<'a, S: OutputSink + ?Sized> {
    inner: &'a S,
    stderr: Mutex<Vec<String>>,
}

impl<S: OutputSink + ?Sized> OutputSink for CapturingSink<'_, S> {
    fn on_stdout(&self, line: &str) {
        self.inner.on_stdout(line);
    }

    fn on_stderr(&self, line: &str) {
        if let Ok(mut captured) = self.stderr.lock() {
            captured.push(line.to_string());
        }
        self.inner.on_stderr(line);
    }

    fn on_process_started(&self, handle: ProcessHandle) {
        self.inner.on_process_started(handle);
    }
}

/// Legacy convention: run and fail on a nonzero exit.
///
/// A nonzero exit becomes an [`ExitFailure`] carrying the exit code and the
/// captured stderr text.
pub async fn run_checked<R, S>(runner: &R, invocation: Invocation, sink: &S) -> Result<()>
where
    R: CommandRunner + ?Sized,
    S: OutputSink + ?Sized,
{
    let program = invocation.program.clone();
    let capture = CapturingSink {
        inner: sink,
        stderr: Mutex::new(Vec::new()),
    };

    let code = runner.run(invocation, &capture).await?;
    if code != 0 {
        let stderr = capture
            .stderr
            .into_inner()
            .unwrap_or_default()
            .join("\n");
        return Err(ExitFailure {
            program: program.to_string_lossy().into_owned(),
            code,
            stderr,
        }
        .into());
    }
    Ok(())
}
