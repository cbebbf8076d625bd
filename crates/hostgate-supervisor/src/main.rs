use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dotenvy::dotenv;
use hostgate_supervisor::{HostService, SupervisorConfig};
use hostgate_types::SupervisorEvent;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Supervises the embedded backend and serves it on a fixed local port.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Host data directory (defaults to ~/.hostgate)
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// Port the gateway listens on
    #[arg(long, global = true)]
    gateway_port: Option<u16>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Install dependencies, start the backend and serve the gateway (default)
    Run {
        /// Log a line once the backend is reachable, or give up after this many seconds
        #[arg(long, default_value_t = 120)]
        ready_timeout: u64,
    },
    /// Install backend dependencies if the lock file changed
    Install {
        /// Reinstall even if the lock file is unchanged
        #[arg(long)]
        force: bool,
    },
    /// Query the update feeds once and print the result as JSON
    CheckUpdate,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "hostgate=info,hostgate_supervisor=debug,backend=info,tower_http=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_config(cli: &Cli) -> Result<SupervisorConfig> {
    let mut config = match &cli.root {
        Some(root) => SupervisorConfig::with_root(root),
        None => SupervisorConfig::from_env()?,
    };
    if let Some(port) = cli.gateway_port {
        config.gateway_port = port;
    }
    config.validate()?;
    Ok(config)
}

async fn run(service: Arc<HostService>, ready_timeout: Duration) -> Result<()> {
    let mut events = service.context().subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match &event {
                SupervisorEvent::InstallProgress { .. } => {}
                SupervisorEvent::BackendExited { code } => {
                    error!(?code, "Backend exited; gateway will answer not_ready")
                }
                other => info!(event = other.name(), "{}", serde_json::to_string(other).unwrap_or_default()),
            }
        }
    });

    let gateway = service.start().await?;
    info!(%gateway, "Gateway up");
    let mut stopped = service.setup_signal_handlers();

    tokio::select! {
        ready = service.wait_until_ready(ready_timeout) => match ready {
            Ok(address) => info!(backend = %address, "Backend reachable through the gateway"),
            Err(e) => warn!(error = %e, "Backend did not report ready"),
        },
        result = &mut stopped => return Ok(result?),
    }

    stopped.await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    let config = load_config(&cli)?;
    let service = Arc::new(
        HostService::new(config)
            .await
            .context("Failed to initialize host service")?,
    );

    match cli.command.unwrap_or(Command::Run { ready_timeout: 120 }) {
        Command::Run { ready_timeout } => {
            run(Arc::clone(&service), Duration::from_secs(ready_timeout)).await?;
        }
        Command::Install { force } => {
            if force {
                let installer = service.installer();
                let config = installer.config();
                let digest = installer
                    .install(&config.lock_file, &config.target_dir, &config.python)
                    .await?;
                info!(digest = %digest.digest_hex, "Dependencies reinstalled");
            } else {
                let outcome = service.installer().ensure_configured().await?;
                info!(?outcome, "Dependency check complete");
            }
        }
        Command::CheckUpdate => match service.updater().check_for_updates().await {
            Ok(info) => println!("{}", serde_json::to_string_pretty(&info)?),
            Err(failure) => {
                println!("{}", serde_json::to_string_pretty(&failure)?);
                anyhow::bail!("{failure}");
            }
        },
    }

    Ok(())
}
