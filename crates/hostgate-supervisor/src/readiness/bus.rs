use super::watcher::{BusWatch, watch_file};
use super::{ReadinessError, read_message};
use crate::config::ReadinessConfig;
use crate::context::{ServiceUpCallback, SupervisorContext};
use hostgate_types::{DEFAULT_BACKEND_HOST, ReadinessMessage, SupervisorEvent};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// File based readiness channel for the backend
pub struct ReadinessBus {
    path: PathBuf,
    window: usize,
    poll_interval: Duration,
    context: Arc<SupervisorContext>,
}

impl ReadinessBus {
    pub fn new(config: &ReadinessConfig, context: Arc<SupervisorContext>) -> Self {
        Self {
            path: config.bus_path.clone(),
            window: config.window_bytes,
            poll_interval: config.poll_interval,
            context,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create the channel file (and its directory), emptying any leftover
    /// content from a previous run.
    pub async fn ensure_channel(&self) -> Result<(), ReadinessError> {
        let parent = self
            .path
            .parent()
            .ok_or_else(|| ReadinessError::NoParent(self.path.clone()))?;
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| ReadinessError::io(parent, e))?;

        self.reset().await?;

        // The backend may run as another user in some deployments
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let permissions = std::fs::Permissions::from_mode(0o666);
            if let Err(e) = tokio::fs::set_permissions(&self.path, permissions).await {
                debug!(path = %self.path.display(), error = %e, "Could not relax readiness channel permissions");
            }
        }

        debug!(path = %self.path.display(), "Readiness channel ready");
        Ok(())
    }

    /// Truncate the channel file, creating it if needed
    pub async fn reset(&self) -> Result<(), ReadinessError> {
        tokio::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.path)
            .await
            .map(|_| ())
            .map_err(|e| ReadinessError::io(&self.path, e))
    }

    /// Delete the channel file; a missing file is fine
    pub async fn remove(&self) -> Result<(), ReadinessError> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ReadinessError::io(&self.path, e)),
        }
    }

    /// Current content of the channel, if any
    pub async fn read(&self) -> Result<Option<ReadinessMessage>, ReadinessError> {
        read_message(&self.path, self.window).await
    }

    /// Watch the channel and call `on_message` for each valid message
    pub fn watch<F>(&self, on_message: F) -> Result<BusWatch, ReadinessError>
    where
        F: Fn(ReadinessMessage) + Send + Sync + 'static,
    {
        watch_file(
            self.path.clone(),
            self.window,
            self.poll_interval,
            on_message,
        )
    }

    /// Watch the channel and publish the backend address from it
    pub fn start(self: &Arc<Self>) -> Result<BusWatch, ReadinessError> {
        let bus = Arc::clone(self);
        self.watch(move |message| bus.handle_message(&message))
    }

    fn handle_message(&self, message: &ReadinessMessage) {
        let port = message.listen_port();
        if port == 0 {
            debug!(event = ?message.event, "Readiness message without a port, ignoring");
            return;
        }
        self.publish_address(message.listen_ip(), port);
    }

    /// Publish the backend address for the current start.
    ///
    /// Only the first call per start takes effect; an empty `ip` means
    /// `localhost`. Queued service-up callbacks run in registration order.
    pub fn publish_address(&self, ip: &str, port: u16) -> bool {
        if port == 0 {
            return false;
        }
        let host = if ip.is_empty() { DEFAULT_BACKEND_HOST } else { ip };

        let Some(callbacks) = self.context.deliver_address(host, port) else {
            debug!(host, port, "Backend address already published for this start");
            return false;
        };

        info!(host, port, "Backend is ready");
        self.context.emit(SupervisorEvent::BackendPort {
            host: host.to_string(),
            port,
        });

        for callback in callbacks {
            invoke_callback(callback, host, port);
        }
        true
    }

    /// Run `callback` once the backend address is known; immediately if it
    /// already is.
    pub fn register_service_up_callback<F>(&self, callback: F)
    where
        F: FnOnce(&str, u16) -> anyhow::Result<()> + Send + 'static,
    {
        if let Some((callback, address)) = self.context.register_service_up(Box::new(callback)) {
            invoke_callback(callback, &address.host, address.port);
        }
    }
}

fn invoke_callback(callback: ServiceUpCallback, host: &str, port: u16) {
    match catch_unwind(AssertUnwindSafe(|| callback(host, port))) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(host, port, error = %e, "Service-up callback failed"),
        Err(_) => error!(host, port, "Service-up callback panicked"),
    }
}

impl std::fmt::Debug for ReadinessBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadinessBus")
            .field("path", &self.path)
            .field("window", &self.window)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::TempDir;

    fn bus(dir: &TempDir) -> ReadinessBus {
        let config = ReadinessConfig {
            bus_path: dir.path().join("cache").join("bus"),
            window_bytes: 32 * 1024,
            poll_interval: Duration::from_millis(50),
        };
        ReadinessBus::new(&config, Arc::new(SupervisorContext::new()))
    }

    #[tokio::test]
    async fn test_ensure_channel_truncates() {
        let dir = TempDir::new().unwrap();
        let bus = bus(&dir);
        tokio::fs::create_dir_all(bus.path().parent().unwrap())
            .await
            .unwrap();
        tokio::fs::write(bus.path(), "stale").await.unwrap();

        bus.ensure_channel().await.unwrap();
        assert_eq!(tokio::fs::read(bus.path()).await.unwrap().len(), 0);
        assert!(bus.read().await.unwrap().is_none());

        bus.remove().await.unwrap();
        assert!(!bus.path().exists());
        bus.remove().await.unwrap();
    }

    #[test]
    fn test_publish_defaults_host_and_runs_callbacks_in_order() {
        let dir = TempDir::new().unwrap();
        let bus = bus(&dir);
        let calls = Arc::new(Mutex::new(Vec::new()));

        for n in 0..3 {
            let calls = Arc::clone(&calls);
            bus.register_service_up_callback(move |host, port| {
                calls.lock().unwrap().push(format!("{n}:{host}:{port}"));
                Ok(())
            });
        }

        assert!(bus.publish_address("", 8123));
        assert!(!bus.publish_address("10.0.0.1", 9000));
        assert_eq!(
            *calls.lock().unwrap(),
            vec!["0:localhost:8123", "1:localhost:8123", "2:localhost:8123"]
        );
    }

    #[test]
    fn test_failing_callback_does_not_block_others() {
        let dir = TempDir::new().unwrap();
        let bus = bus(&dir);
        let reached = Arc::new(Mutex::new(false));

        bus.register_service_up_callback(|_, _| anyhow::bail!("boom"));
        bus.register_service_up_callback(|_, _| panic!("callback panic"));
        {
            let reached = Arc::clone(&reached);
            bus.register_service_up_callback(move |_, _| {
                *reached.lock().unwrap() = true;
                Ok(())
            });
        }

        bus.publish_address("127.0.0.1", 4000);
        assert!(*reached.lock().unwrap());
    }

    #[test]
    fn test_zero_port_is_ignored() {
        let dir = TempDir::new().unwrap();
        let bus = bus(&dir);
        assert!(!bus.publish_address("127.0.0.1", 0));
        assert!(!bus.context.backend_address().is_set());
    }
}
