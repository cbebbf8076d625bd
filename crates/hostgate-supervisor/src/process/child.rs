use super::{ExitInfo, FORCE_KILL_WAIT, HandleId, LiveProcessSet, ProcessError};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{ChildStderr, ChildStdout, Command};
use tokio::sync::{Notify, watch};
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Handle to a spawned child process.
///
/// The child itself is owned by a monitor task; handles only observe its
/// exit and request termination, so they can be cloned freely.
#[derive(Clone)]
pub struct ProcessHandle {
    id: HandleId,
    name: Arc<str>,
    pid: Option<u32>,
    kill: Arc<Notify>,
    exit: watch::Receiver<Option<ExitInfo>>,
}

impl ProcessHandle {
    pub fn id(&self) -> HandleId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn has_exited(&self) -> bool {
        self.exit.borrow().is_some()
    }

    pub fn exit_info(&self) -> Option<ExitInfo> {
        *self.exit.borrow()
    }

    /// Wait for the process to exit
    pub async fn wait(&self) -> ExitInfo {
        let mut exit = self.exit.clone();
        match exit.wait_for(Option::is_some).await {
            Ok(info) => info.unwrap_or_else(ExitInfo::unknown),
            // Monitor went away without reporting
            Err(_) => ExitInfo::unknown(),
        }
    }

    /// Ask the process to exit (SIGTERM on unix)
    pub fn request_stop(&self) -> Result<(), ProcessError> {
        if self.has_exited() {
            return Ok(());
        }

        #[cfg(unix)]
        if let Some(pid) = self.pid {
            let result = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
            if result != 0 {
                let source = std::io::Error::last_os_error();
                // ESRCH: already gone
                if source.raw_os_error() == Some(libc::ESRCH) {
                    return Ok(());
                }
                return Err(ProcessError::Signal {
                    name: self.name.to_string(),
                    pid,
                    source,
                });
            }
            return Ok(());
        }

        self.force_kill();
        Ok(())
    }

    /// Kill the process without giving it a chance to clean up
    pub fn force_kill(&self) {
        self.kill.notify_one();
    }

    /// Graceful stop: signal, wait up to `grace`, then kill
    pub async fn terminate(&self, grace: Duration) -> Result<ExitInfo, ProcessError> {
        if let Some(exit) = self.exit_info() {
            return Ok(exit);
        }

        debug!(name = %self.name, pid = ?self.pid, grace_ms = grace.as_millis() as u64, "Stopping process");

        if let Err(e) = self.request_stop() {
            warn!(name = %self.name, error = %e, "Graceful stop failed, killing");
        } else if let Ok(exit) = timeout(grace, self.wait()).await {
            return Ok(exit);
        }

        info!(name = %self.name, pid = ?self.pid, "Process still running after grace period, killing");
        self.force_kill();

        timeout(FORCE_KILL_WAIT, self.wait())
            .await
            .map_err(|_| ProcessError::KillTimeout {
                name: self.name.to_string(),
                timeout_ms: FORCE_KILL_WAIT.as_millis() as u64,
            })
    }
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("pid", &self.pid)
            .field("exit", &self.exit_info())
            .finish()
    }
}

/// A freshly spawned child with its captured output streams
#[derive(Debug)]
pub struct TrackedChild {
    pub handle: ProcessHandle,
    pub stdout: Option<ChildStdout>,
    pub stderr: Option<ChildStderr>,
}

/// Spawn `command` and add it to `live` until it exits.
///
/// A monitor task owns the child: it reaps the exit status (or kills the
/// child when asked), removes the entry from `live` and only then publishes
/// the exit to the handles.
pub fn spawn_tracked(
    mut command: Command,
    name: &str,
    live: &LiveProcessSet,
) -> Result<TrackedChild, ProcessError> {
    command.kill_on_drop(true);

    let mut child = command.spawn().map_err(|source| ProcessError::Spawn {
        name: name.to_string(),
        source,
    })?;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let (exit_tx, exit_rx) = watch::channel(None);
    let kill = Arc::new(Notify::new());
    let handle = ProcessHandle {
        id: live.allocate_id(),
        name: Arc::from(name),
        pid: child.id(),
        kill: Arc::clone(&kill),
        exit: exit_rx,
    };

    live.insert(handle.clone());
    debug!(name, pid = ?handle.pid, id = handle.id, "Tracking process");

    let live = live.clone();
    let id = handle.id;
    let monitor_name = handle.name.clone();
    tokio::spawn(async move {
        let reaped = tokio::select! {
            status = child.wait() => Some(status),
            _ = kill.notified() => None,
        };

        let status = match reaped {
            Some(status) => status,
            None => {
                if let Err(e) = child.start_kill() {
                    warn!(name = %monitor_name, error = %e, "Failed to kill process");
                }
                child.wait().await
            }
        };

        let exit = match status {
            Ok(status) => ExitInfo::from(status),
            Err(e) => {
                warn!(name = %monitor_name, error = %e, "Failed to collect exit status");
                ExitInfo::unknown()
            }
        };

        live.remove(id);
        debug!(name = %monitor_name, code = ?exit.code, signal = ?exit.signal, "Process exited");
        let _ = exit_tx.send(Some(exit));
    });

    Ok(TrackedChild {
        handle,
        stdout,
        stderr,
    })
}
