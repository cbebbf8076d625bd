//! Process management for the backend and its helper processes
//!
//! This module provides spawning with exit tracking ([`child`]), the set of
//! live child processes shared across components ([`live_set`]) and the
//! state machine that owns the primary backend process ([`supervisor`]).

pub mod child;
pub mod live_set;
pub mod supervisor;

pub use child::{ProcessHandle, TrackedChild, spawn_tracked};
pub use live_set::{HandleId, LiveProcessSet};
pub use supervisor::ProcessSupervisor;

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::process::Command;

/// How long to wait for a process after a forceful kill
pub const FORCE_KILL_WAIT: Duration = Duration::from_secs(2);

/// Lifecycle of the primary backend process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Idle,
    Starting,
    Running,
    Stopping,
    Stopped,
}

/// What to do with the child's stdio
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StdioMode {
    /// Capture output and forward it to the log
    #[default]
    Piped,
    /// Share the host's stdio (interactive / development)
    Inherit,
}

/// How a process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
    pub success: bool,
}

impl ExitInfo {
    /// Exit of a process whose status could not be collected
    pub fn unknown() -> Self {
        Self {
            code: None,
            signal: None,
            success: false,
        }
    }
}

impl From<ExitStatus> for ExitInfo {
    fn from(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
            success: status.success(),
        }
    }
}

/// Everything needed to launch a process
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub name: String,
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Overrides applied on top of the inherited host environment
    pub env: Vec<(String, String)>,
    pub working_dir: Option<PathBuf>,
    pub stdio: StdioMode,
}

impl LaunchSpec {
    pub fn new(name: impl Into<String>, program: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            working_dir: None,
            stdio: StdioMode::Piped,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn with_env_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_stdio(mut self, stdio: StdioMode) -> Self {
        self.stdio = stdio;
        self
    }

    /// Human readable command line for logs
    pub fn command_line(&self) -> String {
        let mut line = self.program.display().to_string();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }

    pub fn to_command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args).stdin(Stdio::null());

        for (key, value) in &self.env {
            command.env(key, value);
        }

        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }

        match self.stdio {
            StdioMode::Piped => {
                command.stdout(Stdio::piped()).stderr(Stdio::piped());
            }
            StdioMode::Inherit => {
                command.stdout(Stdio::inherit()).stderr(Stdio::inherit());
            }
        }

        command
    }
}

/// Log level a backend stderr line is forwarded at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineLevel {
    Info,
    Warn,
    Error,
}

/// Classify a stderr line by its leading token.
///
/// Python-style backends log everything to stderr, so `INFO`/`DEBUG` lines
/// are not errors.
pub fn classify_stderr_line(line: &str) -> LineLevel {
    let token = line
        .trim_start()
        .split(|c: char| c.is_whitespace() || c == ':' || c == ']')
        .next()
        .unwrap_or_default()
        .trim_start_matches('[');

    match token {
        "INFO" | "DEBUG" => LineLevel::Info,
        "WARNING" | "WARN" => LineLevel::Warn,
        _ => LineLevel::Error,
    }
}

/// Error types for process management
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("Failed to spawn process '{name}': {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Process '{name}' is already running (state: {state:?})")]
    AlreadyRunning { name: String, state: SupervisorState },

    #[error("Failed to signal process '{name}' (pid: {pid}): {source}")]
    Signal {
        name: String,
        pid: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("Process '{name}' did not exit within {timeout_ms}ms after being killed")]
    KillTimeout { name: String, timeout_ms: u64 },
}
