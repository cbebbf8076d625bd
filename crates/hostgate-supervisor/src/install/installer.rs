use super::{InstallError, InstallLog, lock_file_digest};
use crate::config::InstallerConfig;
use crate::context::SupervisorContext;
use crate::process::spawn_tracked;
use crate::process::supervisor::forward_lines;
use crate::store::Store;
use hostgate_types::{InstallOutcome, LOCK_HASH_KEY, LockHash, SupervisorEvent};
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Time allowed for output readers to drain after the process exits
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Installs the backend's Python dependencies from its lock file
pub struct DependencyInstaller {
    config: InstallerConfig,
    context: Arc<SupervisorContext>,
    store: Arc<Store>,
    log: Arc<InstallLog>,
}

impl DependencyInstaller {
    pub fn new(config: InstallerConfig, context: Arc<SupervisorContext>, store: Arc<Store>) -> Self {
        let log = Arc::new(InstallLog::new(config.log_capacity));
        Self {
            config,
            context,
            store,
            log,
        }
    }

    pub fn config(&self) -> &InstallerConfig {
        &self.config
    }

    /// Output of the current (or last) install attempt
    pub fn log(&self) -> &Arc<InstallLog> {
        &self.log
    }

    /// Whether `lock_file` differs from the last successful install.
    ///
    /// A missing lock file means there is nothing to install.
    pub async fn should_install(&self, lock_file: &Path) -> Result<bool, InstallError> {
        self.should_install_into(lock_file, &self.config.target_dir)
            .await
    }

    async fn should_install_into(
        &self,
        lock_file: &Path,
        target_dir: &Path,
    ) -> Result<bool, InstallError> {
        if !tokio::fs::try_exists(lock_file).await.unwrap_or(false) {
            debug!(path = %lock_file.display(), "No lock file, skipping dependency install");
            return Ok(false);
        }

        let digest = lock_file_digest(lock_file)
            .await
            .map_err(|source| InstallError::Io {
                path: lock_file.to_path_buf(),
                source,
            })?;

        let Some(stored) = self.store.get_string(LOCK_HASH_KEY).await else {
            info!(digest = %digest.digest_hex, "No recorded lock file digest, install needed");
            return Ok(true);
        };

        if !digest.matches(&stored) {
            info!(stored = %stored, current = %digest.digest_hex, "Lock file changed, install needed");
            return Ok(true);
        }

        if !tokio::fs::try_exists(target_dir).await.unwrap_or(false) {
            info!(target = %target_dir.display(), "Dependency directory missing, install needed");
            return Ok(true);
        }

        debug!(digest = %digest.digest_hex, "Dependencies up to date");
        Ok(false)
    }

    /// Export the lock file to a requirements list and install it into
    /// `target_dir`. The lock digest is recorded only when both steps
    /// succeed.
    pub async fn install(
        &self,
        lock_file: &Path,
        target_dir: &Path,
        python: &Path,
    ) -> Result<LockHash, InstallError> {
        let digest = lock_file_digest(lock_file)
            .await
            .map_err(|source| InstallError::Io {
                path: lock_file.to_path_buf(),
                source,
            })?;

        tokio::fs::create_dir_all(target_dir)
            .await
            .map_err(|source| InstallError::Io {
                path: target_dir.to_path_buf(),
                source,
            })?;

        let requirements = tempfile::Builder::new()
            .prefix("requirements-")
            .suffix(".txt")
            .tempfile()
            .map_err(|source| InstallError::Io {
                path: std::env::temp_dir(),
                source,
            })?;

        info!(lock = %lock_file.display(), target = %target_dir.display(), "Installing backend dependencies");

        let mut export = Command::new(&self.config.package_manager);
        export
            .args(["export", "--frozen", "--no-hashes", "--no-emit-project"])
            .args(["--format", "requirements-txt", "--output-file"])
            .arg(requirements.path());
        if let Some(dir) = lock_file.parent().filter(|d| !d.as_os_str().is_empty()) {
            export.current_dir(dir);
        }
        self.run_step("dependency export", export, self.config.export_timeout)
            .await?;

        let mut install = Command::new(python);
        install
            .args(["-m", "pip", "install", "--upgrade", "--no-warn-script-location", "--target"])
            .arg(target_dir)
            .arg("-r")
            .arg(requirements.path());
        self.run_step("dependency install", install, self.config.install_timeout)
            .await?;

        self.store
            .set_string(LOCK_HASH_KEY, &digest.digest_hex)
            .await?;
        info!(digest = %digest.digest_hex, "Backend dependencies installed");
        Ok(digest)
    }

    /// Install if `lock_file` changed since the last successful install.
    ///
    /// The install log is reset first and always ends with the finish
    /// marker, and an `InstallFinished` event is emitted either way.
    pub async fn ensure(
        &self,
        lock_file: &Path,
        target_dir: &Path,
        python: &Path,
    ) -> Result<InstallOutcome, InstallError> {
        self.log.reset();
        let result = self.ensure_inner(lock_file, target_dir, python).await;

        let success = result.is_ok();
        if let Err(e) = &result {
            error!(error = %e, "Dependency installation failed");
            self.log.push(format!("error: {e}"));
        }
        self.log.finish();
        self.context
            .emit(SupervisorEvent::InstallFinished { success });
        result
    }

    /// [`ensure`](Self::ensure) with the configured lock file, target
    /// directory and interpreter
    pub async fn ensure_configured(&self) -> Result<InstallOutcome, InstallError> {
        let InstallerConfig {
            lock_file,
            target_dir,
            python,
            ..
        } = &self.config;
        self.ensure(lock_file, target_dir, python).await
    }

    async fn ensure_inner(
        &self,
        lock_file: &Path,
        target_dir: &Path,
        python: &Path,
    ) -> Result<InstallOutcome, InstallError> {
        if !tokio::fs::try_exists(lock_file).await.unwrap_or(false) {
            info!(path = %lock_file.display(), "No lock file, skipping dependency install");
            return Ok(InstallOutcome::Skipped);
        }

        if !self.should_install_into(lock_file, target_dir).await? {
            return Ok(InstallOutcome::UpToDate);
        }

        self.install(lock_file, target_dir, python).await?;
        Ok(InstallOutcome::Installed)
    }

    async fn run_step(
        &self,
        step: &'static str,
        mut command: Command,
        limit: Duration,
    ) -> Result<(), InstallError> {
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let tracked = spawn_tracked(command, step, self.context.live_processes())
            .map_err(|source| InstallError::Spawn { step, source })?;
        let handle = tracked.handle;

        let mut readers = Vec::new();
        if let Some(stdout) = tracked.stdout {
            readers.push(tokio::spawn(forward_lines(stdout, self.line_sink(step))));
        }
        if let Some(stderr) = tracked.stderr {
            readers.push(tokio::spawn(forward_lines(stderr, self.line_sink(step))));
        }

        let exit = match timeout(limit, handle.wait()).await {
            Ok(exit) => exit,
            Err(_) => {
                warn!(step, timeout_secs = limit.as_secs(), "Install step timed out, killing");
                handle.force_kill();
                if timeout(crate::process::FORCE_KILL_WAIT, handle.wait())
                    .await
                    .is_err()
                {
                    warn!(step, pid = ?handle.pid(), "Install step did not exit after kill");
                }
                self.context.live_processes().remove(handle.id());
                return Err(InstallError::Timeout {
                    step,
                    timeout_secs: limit.as_secs(),
                });
            }
        };

        for reader in readers {
            if timeout(OUTPUT_DRAIN_TIMEOUT, reader).await.is_err() {
                debug!(step, "Output reader still busy after exit");
            }
        }

        if exit.success {
            debug!(step, "Install step finished");
            Ok(())
        } else {
            Err(InstallError::Failed {
                step,
                code: exit.code,
            })
        }
    }

    fn line_sink(&self, step: &'static str) -> impl FnMut(&str) + Send + 'static {
        let log = Arc::clone(&self.log);
        let context = Arc::clone(&self.context);
        move |line: &str| {
            debug!(target: "installer", step, "{line}");
            log.push(line);
            context.emit(SupervisorEvent::InstallProgress {
                line: line.to_string(),
            });
        }
    }
}

impl std::fmt::Debug for DependencyInstaller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DependencyInstaller")
            .field("config", &self.config)
            .finish()
    }
}
