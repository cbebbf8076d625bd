//! Wires the components together for one host run

use crate::config::SupervisorConfig;
use crate::context::SupervisorContext;
use crate::gateway::{Gateway, GatewayError, GatewayState};
use crate::install::DependencyInstaller;
use crate::process::{LaunchSpec, ProcessSupervisor};
use crate::readiness::{BusWatch, ReadinessBus};
use crate::store::Store;
use crate::update::UpdateCoordinator;
use anyhow::{Context, Result, anyhow, bail};
use hostgate_types::{BackendAddress, SupervisorEvent};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

#[derive(Default)]
struct Runtime {
    bus_watch: Option<BusWatch>,
    gateway_addr: Option<SocketAddr>,
    gateway_shutdown: Option<oneshot::Sender<()>>,
    gateway_task: Option<JoinHandle<Result<(), GatewayError>>>,
    scheduler: Option<JoinHandle<()>>,
    started: bool,
}

/// The backend, its gateway and the updater for one host run
pub struct HostService {
    config: SupervisorConfig,
    context: Arc<SupervisorContext>,
    store: Arc<Store>,
    bus: Arc<ReadinessBus>,
    installer: DependencyInstaller,
    supervisor: ProcessSupervisor,
    updater: Arc<UpdateCoordinator>,
    runtime: Mutex<Runtime>,
}

impl HostService {
    pub async fn new(config: SupervisorConfig) -> Result<Self> {
        config.validate()?;

        let context = Arc::new(SupervisorContext::new());
        let store = Arc::new(
            Store::open(&config.installer.store_path)
                .await
                .context("Failed to open preferences store")?,
        );
        let client_id = store.client_id().await?;

        let bus = Arc::new(ReadinessBus::new(&config.readiness, Arc::clone(&context)));
        let installer = DependencyInstaller::new(
            config.installer.clone(),
            Arc::clone(&context),
            Arc::clone(&store),
        );
        let supervisor = ProcessSupervisor::new(Arc::clone(&context), Arc::clone(&bus));
        let updater = Arc::new(UpdateCoordinator::new(
            config.update.clone(),
            Arc::clone(&context),
            &client_id,
        )?);

        Ok(Self {
            config,
            context,
            store,
            bus,
            installer,
            supervisor,
            updater,
            runtime: Mutex::new(Runtime::default()),
        })
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn context(&self) -> &Arc<SupervisorContext> {
        &self.context
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn bus(&self) -> &Arc<ReadinessBus> {
        &self.bus
    }

    pub fn installer(&self) -> &DependencyInstaller {
        &self.installer
    }

    pub fn supervisor(&self) -> &ProcessSupervisor {
        &self.supervisor
    }

    pub fn updater(&self) -> &Arc<UpdateCoordinator> {
        &self.updater
    }

    /// Create the host directories and a fresh readiness channel
    pub async fn prepare(&self) -> Result<()> {
        for dir in [
            &self.config.config_dir,
            &self.config.cache_dir,
            &self.config.log_dir,
        ] {
            tokio::fs::create_dir_all(dir)
                .await
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        self.bus.ensure_channel().await?;
        Ok(())
    }

    /// How the backend is launched
    pub fn launch_spec(&self) -> Result<LaunchSpec> {
        let backend = &self.config.backend;

        let inherited = std::env::var_os("PATH").unwrap_or_default();
        let path = std::env::join_paths(
            backend
                .extra_path_dirs
                .iter()
                .cloned()
                .chain(std::env::split_paths(&inherited)),
        )
        .context("Invalid PATH entry")?;

        let mut spec = LaunchSpec::new("backend", &backend.program)
            .with_args(backend.args.iter().cloned())
            .with_args([
                "--port".to_string(),
                "0".to_string(),
                "--report_status_file".to_string(),
                self.bus.path().display().to_string(),
                "--log_dir".to_string(),
                self.config.log_dir.display().to_string(),
                "--plugin_config".to_string(),
                backend.plugin_config.display().to_string(),
            ])
            .with_env_var("PATH", path.to_string_lossy())
            .with_env_var("BACKEND_CONFIG_DIR", self.config.config_dir.display().to_string())
            .with_env_var("RESOURCE_DIR", self.config.cache_dir.display().to_string())
            .with_env_var(
                "PYTHONPATH",
                self.config.installer.target_dir.display().to_string(),
            )
            .with_stdio(backend.stdio);

        if let Some(dir) = &backend.working_dir {
            spec = spec.with_working_dir(dir);
        }
        Ok(spec)
    }

    /// Bring everything up: readiness watch, gateway, dependencies, backend
    /// and the update scheduler. Returns the gateway's address.
    ///
    /// A failed attempt leaves the watch and gateway running, so calling
    /// `start` again retries only the backend.
    pub async fn start(&self) -> Result<SocketAddr> {
        let mut runtime = self.runtime.lock().await;
        if runtime.started {
            return runtime
                .gateway_addr
                .ok_or_else(|| anyhow!("Service started without a gateway"));
        }

        self.prepare().await?;
        if runtime.bus_watch.is_none() {
            runtime.bus_watch = Some(self.bus.start()?);
        }

        let gateway_addr = match runtime.gateway_addr {
            Some(addr) => addr,
            None => {
                let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.config.gateway_port));
                let gateway =
                    Gateway::bind(addr, GatewayState::new(Arc::clone(&self.context))?).await?;
                let gateway_addr = gateway.local_addr()?;
                let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
                runtime.gateway_task = Some(tokio::spawn(gateway.serve(async move {
                    let _ = shutdown_rx.await;
                })));
                runtime.gateway_shutdown = Some(shutdown_tx);
                runtime.gateway_addr = Some(gateway_addr);
                gateway_addr
            }
        };

        match self.installer.ensure_configured().await {
            Ok(outcome) => info!(?outcome, "Dependency check complete"),
            Err(e) => warn!(error = %e, "Starting backend without a successful dependency install"),
        }

        let spec = self.launch_spec()?;
        self.supervisor.start(&spec).await?;

        runtime.scheduler = self.updater.spawn_scheduler();
        runtime.started = true;
        info!(gateway = %gateway_addr, "Host service started");
        Ok(gateway_addr)
    }

    /// Resolve once the backend has published its address. Nothing is left
    /// queued when `limit` passes first.
    pub async fn wait_until_ready(&self, limit: Duration) -> Result<BackendAddress> {
        let mut events = self.context.subscribe();

        tokio::time::timeout(limit, async {
            loop {
                let address = self.context.backend_address();
                if address.is_set() {
                    return Ok(address);
                }
                match events.recv().await {
                    Ok(SupervisorEvent::BackendPort { host, port }) => {
                        return Ok(BackendAddress::new(host, port));
                    }
                    Ok(_) | Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => bail!("Supervisor events closed"),
                }
            }
        })
        .await
        .context("Timed out waiting for the backend")?
    }

    /// Stop everything started by [`HostService::start`]
    pub async fn shutdown(&self) -> Result<()> {
        let mut runtime = self.runtime.lock().await;

        if let Some(scheduler) = runtime.scheduler.take() {
            scheduler.abort();
        }

        self.supervisor.shutdown_all(self.config.stop_grace).await;

        if let Some(watch) = runtime.bus_watch.take() {
            watch.stop();
        }

        if let Some(shutdown) = runtime.gateway_shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(task) = runtime.gateway_task.take() {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(error = %e, "Gateway stopped with an error"),
                Err(e) => error!(error = %e, "Gateway task failed"),
            }
        }

        runtime.gateway_addr = None;
        runtime.started = false;
        Ok(())
    }

    /// Shut the service down on SIGTERM or Ctrl+C
    pub fn setup_signal_handlers(self: &Arc<Self>) -> JoinHandle<()> {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            shutdown_signal().await;
            if let Err(e) = service.shutdown().await {
                error!(error = %e, "Shutdown failed");
            }
        })
    }
}

/// Resolve on Ctrl+C, or SIGTERM on unix
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = sigterm.recv() => warn!("Received SIGTERM, shutting down"),
                    result = tokio::signal::ctrl_c() => log_ctrl_c(result),
                }
                return;
            }
            Err(e) => error!(error = %e, "Failed to install SIGTERM handler"),
        }
    }

    log_ctrl_c(tokio::signal::ctrl_c().await);
}

fn log_ctrl_c(result: std::io::Result<()>) {
    match result {
        Ok(()) => warn!("Received Ctrl+C, shutting down"),
        Err(e) => error!(error = %e, "Failed to listen for Ctrl+C"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn service(dir: &TempDir) -> HostService {
        let mut config = SupervisorConfig::with_root(dir.path());
        config.backend.args = vec!["-m".to_string(), "server".to_string()];
        HostService::new(config).await.unwrap()
    }

    #[tokio::test]
    async fn test_launch_spec() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir).await;
        let config = service.config();
        let spec = service.launch_spec().unwrap();

        assert_eq!(spec.program, config.backend.program);
        assert_eq!(&spec.args[..2], ["-m", "server"]);
        let bus = service.bus().path().display().to_string();
        let pairs: Vec<_> = spec.args[2..].chunks(2).collect();
        assert_eq!(pairs[0], ["--port", "0"]);
        assert_eq!(pairs[1], ["--report_status_file", bus.as_str()]);
        assert_eq!(pairs[2][0], "--log_dir");
        assert_eq!(pairs[3][0], "--plugin_config");

        let env = |key: &str| {
            spec.env
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.clone())
                .unwrap()
        };
        assert_eq!(env("BACKEND_CONFIG_DIR"), config.config_dir.display().to_string());
        assert_eq!(env("RESOURCE_DIR"), config.cache_dir.display().to_string());
        let first_path = std::env::split_paths(&env("PATH")).next().unwrap();
        assert_eq!(first_path, config.backend.extra_path_dirs[0]);
        assert_eq!(spec.working_dir, config.backend.working_dir);
    }

    #[tokio::test]
    async fn test_prepare_creates_layout() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir).await;
        service.prepare().await.unwrap();
        service.prepare().await.unwrap();

        let config = service.config();
        assert!(config.config_dir.is_dir());
        assert!(config.log_dir.is_dir());
        assert_eq!(std::fs::read(service.bus().path()).unwrap().len(), 0);

        // The client id is generated once and kept
        let id = service.store().client_id().await.unwrap();
        assert_eq!(service.store().client_id().await.unwrap(), id);
    }
}
