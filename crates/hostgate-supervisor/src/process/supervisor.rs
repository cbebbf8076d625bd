use super::{
    HandleId, LaunchSpec, LineLevel, ProcessError, ProcessHandle, StdioMode, SupervisorState,
    classify_stderr_line, spawn_tracked,
};
use crate::context::SupervisorContext;
use crate::readiness::ReadinessBus;
use futures_util::future::join_all;
use hostgate_types::SupervisorEvent;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{ChildStderr, ChildStdout};
use tracing::{debug, error, info, warn};

struct Inner {
    state: SupervisorState,
    /// Bumped on every start so exit observers of older processes stay quiet
    generation: u64,
    primary: Option<ProcessHandle>,
}

/// Owns the primary backend process and the shutdown of everything else
pub struct ProcessSupervisor {
    name: String,
    context: Arc<SupervisorContext>,
    bus: Arc<ReadinessBus>,
    inner: Arc<Mutex<Inner>>,
}

fn lock(inner: &Mutex<Inner>) -> MutexGuard<'_, Inner> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ProcessSupervisor {
    pub fn new(context: Arc<SupervisorContext>, bus: Arc<ReadinessBus>) -> Self {
        Self {
            name: "backend".to_string(),
            context,
            bus,
            inner: Arc::new(Mutex::new(Inner {
                state: SupervisorState::Idle,
                generation: 0,
                primary: None,
            })),
        }
    }

    pub fn state(&self) -> SupervisorState {
        lock(&self.inner).state
    }

    /// Pid of the running backend, if any
    pub fn pid(&self) -> Option<u32> {
        lock(&self.inner).primary.as_ref().and_then(ProcessHandle::pid)
    }

    pub fn primary(&self) -> Option<ProcessHandle> {
        lock(&self.inner).primary.clone()
    }

    /// Launch the backend. Fails if one is already starting or running.
    pub async fn start(&self, spec: &LaunchSpec) -> Result<Option<u32>, ProcessError> {
        let generation = {
            let mut inner = lock(&self.inner);
            match inner.state {
                SupervisorState::Idle | SupervisorState::Stopped => {}
                state => {
                    return Err(ProcessError::AlreadyRunning {
                        name: self.name.clone(),
                        state,
                    });
                }
            }
            inner.state = SupervisorState::Starting;
            inner.generation += 1;
            inner.generation
        };

        self.context.begin_backend_start();
        // A previous backend's announcement must not be read for this start
        if let Err(e) = self.bus.reset().await {
            warn!(error = %e, "Failed to reset readiness channel before start");
        }
        info!(name = %self.name, command = %spec.command_line(), "Starting backend");

        let tracked = match spawn_tracked(spec.to_command(), &spec.name, self.context.live_processes()) {
            Ok(tracked) => tracked,
            Err(e) => {
                error!(name = %self.name, error = %e, "Failed to start backend");
                lock(&self.inner).state = SupervisorState::Idle;
                return Err(e);
            }
        };

        let handle = tracked.handle;
        let pid = handle.pid();
        {
            let mut inner = lock(&self.inner);
            inner.state = SupervisorState::Running;
            inner.primary = Some(handle.clone());
        }
        info!(name = %self.name, pid = ?pid, "Backend started");

        if spec.stdio == StdioMode::Piped {
            forward_output(&spec.name, tracked.stdout, tracked.stderr);
        }

        let inner = Arc::clone(&self.inner);
        let context = Arc::clone(&self.context);
        let bus = Arc::clone(&self.bus);
        let name = self.name.clone();
        tokio::spawn(async move {
            let exit = handle.wait().await;
            {
                let mut inner = lock(&inner);
                if inner.generation != generation || inner.state != SupervisorState::Running {
                    return;
                }
                inner.state = SupervisorState::Stopped;
                inner.primary = None;
            }
            error!(name = %name, code = ?exit.code, signal = ?exit.signal, "Backend exited unexpectedly");
            context.reset_backend_address();
            if let Err(e) = bus.reset().await {
                warn!(error = %e, "Failed to reset readiness channel after exit");
            }
            context.emit(SupervisorEvent::BackendExited { code: exit.code });
        });

        Ok(pid)
    }

    /// Stop the backend, escalating to a kill after `grace`. No-op when
    /// nothing is running.
    pub async fn stop(&self, grace: Duration) -> Result<(), ProcessError> {
        let handle = {
            let mut inner = lock(&self.inner);
            match inner.state {
                SupervisorState::Starting | SupervisorState::Running => {
                    inner.state = SupervisorState::Stopping;
                    inner.primary.take()
                }
                state => {
                    debug!(name = %self.name, ?state, "Backend not running, nothing to stop");
                    return Ok(());
                }
            }
        };

        let result = match handle {
            Some(handle) => handle.terminate(grace).await.map(|exit| {
                info!(name = %self.name, code = ?exit.code, signal = ?exit.signal, "Backend stopped");
            }),
            None => Ok(()),
        };

        lock(&self.inner).state = SupervisorState::Stopped;
        result
    }

    /// Make a helper process part of shutdown
    pub fn track_auxiliary(&self, handle: ProcessHandle) {
        debug!(name = handle.name(), pid = ?handle.pid(), "Tracking auxiliary process");
        self.context.live_processes().insert(handle);
    }

    pub fn untrack_auxiliary(&self, id: HandleId) -> bool {
        self.context.live_processes().remove(id)
    }

    /// Stop every tracked process, then the backend, then clear the
    /// readiness channel and address.
    pub async fn shutdown_all(&self, grace: Duration) {
        let primary_id = self.primary().map(|handle| handle.id());
        let auxiliary: Vec<ProcessHandle> = self
            .context
            .live_processes()
            .snapshot()
            .into_iter()
            .filter(|handle| Some(handle.id()) != primary_id)
            .collect();

        if !auxiliary.is_empty() {
            info!(count = auxiliary.len(), "Stopping auxiliary processes");
        }

        let results = join_all(auxiliary.iter().map(|handle| handle.terminate(grace))).await;
        for (handle, result) in auxiliary.iter().zip(results) {
            if let Err(e) = result {
                error!(name = handle.name(), error = %e, "Failed to stop auxiliary process");
            }
        }

        if let Err(e) = self.stop(grace).await {
            error!(name = %self.name, error = %e, "Failed to stop backend");
        }

        for handle in self.context.live_processes().drain() {
            warn!(name = handle.name(), pid = ?handle.pid(), "Dropping unresponsive process from tracking");
        }

        if let Err(e) = self.bus.reset().await {
            warn!(error = %e, "Failed to reset readiness channel");
        }
        self.context.reset_backend_address();
        info!("Shutdown complete");
    }
}

fn forward_output(name: &str, stdout: Option<ChildStdout>, stderr: Option<ChildStderr>) {
    if let Some(stdout) = stdout {
        let name = name.to_string();
        tokio::spawn(forward_lines(stdout, move |line| {
            info!(target: "backend", process = %name, "{line}");
        }));
    }

    if let Some(stderr) = stderr {
        let name = name.to_string();
        tokio::spawn(forward_lines(stderr, move |line| match classify_stderr_line(line) {
            LineLevel::Info => info!(target: "backend", process = %name, "{line}"),
            LineLevel::Warn => warn!(target: "backend", process = %name, "{line}"),
            LineLevel::Error => error!(target: "backend", process = %name, "{line}"),
        }));
    }
}

/// Feed every line of `reader` to `sink` until EOF
pub(crate) async fn forward_lines<R, F>(reader: R, mut sink: F)
where
    R: AsyncRead + Unpin,
    F: FnMut(&str),
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim_end();
                if !line.is_empty() {
                    sink(line);
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!(error = %e, "Stopped reading process output");
                break;
            }
        }
    }
}
