//! Terminal event handler.
//!
//! Forwards child output to the terminal, keeps the handle of the most
//! recently started child so Ctrl-C can stop it, and logs progress.

use std::sync::Mutex;

use runtime_env::EventHandler;
use runtime_launch::{OutputSink, ProcessHandle};

#[derive(Default)]
pub struct ConsoleHandler {
    current: Mutex<Option<ProcessHandle>>,
}

impl ConsoleHandler {
    /// Handle of the last child started, if any.
    pub fn current(&self) -> Option<ProcessHandle> {
        self.current.lock().ok().and_then(|guard| guard.clone())
    }
}

/// Pip and friends emit padding lines; only lines with content are shown.
fn is_visible(line: &str) -> bool {
    !line.trim().is_empty()
}

impl OutputSink for ConsoleHandler {
    fn on_stdout(&self, line: &str) {
        if is_visible(line) {
            println!("{line}");
        }
    }

    fn on_stderr(&self, line: &str) {
        if is_visible(line) {
            eprintln!("{line}");
        }
    }

    fn on_process_started(&self, handle: ProcessHandle) {
        if let Ok(mut current) = self.current.lock() {
            *current = Some(handle);
        }
    }
}

impl EventHandler for ConsoleHandler {
    fn on_error(&self, message: &str) {
        eprintln!("Error: {message}");
    }
}
