//! Configuration for the supervisor
//!
//! Every component receives its slice of [`SupervisorConfig`] at construction.
//! Defaults place all state under `~/.hostgate`; `from_env` applies
//! `HOSTGATE_*` overrides on top.

use crate::process::StdioMode;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Fixed port the gateway listens on
pub const DEFAULT_GATEWAY_PORT: u16 = 61990;

/// Size of the window read from the readiness file
pub const READINESS_WINDOW_BYTES: usize = 32 * 1024;

/// Top-level configuration
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Root of all supervisor state
    pub root_dir: PathBuf,

    /// Directory handed to the backend as its config directory
    pub config_dir: PathBuf,

    /// Runtime-state / resource directory handed to the backend
    pub cache_dir: PathBuf,

    /// Backend log directory
    pub log_dir: PathBuf,

    /// Fixed gateway port
    pub gateway_port: u16,

    /// Grace period between graceful and forceful termination
    pub stop_grace: Duration,

    pub readiness: ReadinessConfig,
    pub backend: BackendConfig,
    pub installer: InstallerConfig,
    pub update: UpdateConfig,
}

/// Readiness file settings
#[derive(Debug, Clone)]
pub struct ReadinessConfig {
    pub bus_path: PathBuf,
    pub window_bytes: usize,
    /// Poll interval used when no native file watcher is available
    pub poll_interval: Duration,
}

/// How to launch the backend
#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub program: PathBuf,
    /// Arguments placed before the generated ones
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub plugin_config: PathBuf,
    pub stdio: StdioMode,
    /// Bundled tool directories prepended to `PATH`
    pub extra_path_dirs: Vec<PathBuf>,
}

/// Dependency installer settings
#[derive(Debug, Clone)]
pub struct InstallerConfig {
    pub lock_file: PathBuf,
    pub target_dir: PathBuf,
    pub python: PathBuf,
    pub package_manager: PathBuf,
    pub export_timeout: Duration,
    pub install_timeout: Duration,
    /// Lines kept in the in-memory install log
    pub log_capacity: usize,
    /// Durable store holding the lock hash
    pub store_path: PathBuf,
}

/// Update coordinator settings
#[derive(Debug, Clone)]
pub struct UpdateConfig {
    /// Updates only run for packaged builds
    pub enabled: bool,
    pub app_name: String,
    pub current_version: String,
    /// Public API root; the primary feed lives at `<api_root>/api/v1/version`
    pub api_root: String,
    pub fallback_owner: String,
    pub fallback_repo: String,
    pub initial_delay: Duration,
    pub check_interval: Duration,
    pub download_dir: PathBuf,
}

impl UpdateConfig {
    pub fn primary_feed_url(&self) -> String {
        format!("{}/api/v1/version", self.api_root.trim_end_matches('/'))
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration error: {message}")]
    Invalid { message: String },

    #[error("Could not determine home directory")]
    NoHomeDir,
}

impl ConfigError {
    fn invalid(message: impl Into<String>) -> Self {
        ConfigError::Invalid {
            message: message.into(),
        }
    }
}

impl SupervisorConfig {
    /// Build the default layout under `root_dir`
    pub fn with_root(root_dir: impl Into<PathBuf>) -> Self {
        let root_dir = root_dir.into();
        let config_dir = root_dir.join("config");
        let cache_dir = root_dir.join("host_cache");
        let log_dir = root_dir.join("log");
        let bin_dir = root_dir.join("bin");
        let backend_dir = root_dir.join("backend");

        let python = if cfg!(target_os = "windows") {
            bin_dir.join("python").join("python.exe")
        } else {
            bin_dir.join("python").join("bin").join("python3")
        };

        Self {
            gateway_port: DEFAULT_GATEWAY_PORT,
            stop_grace: Duration::from_millis(100),
            readiness: ReadinessConfig {
                bus_path: cache_dir.join("bus"),
                window_bytes: READINESS_WINDOW_BYTES,
                poll_interval: Duration::from_millis(500),
            },
            backend: BackendConfig {
                program: python.clone(),
                args: Vec::new(),
                working_dir: Some(backend_dir.clone()),
                plugin_config: config_dir.join("plugin_config.json"),
                stdio: StdioMode::Piped,
                extra_path_dirs: vec![bin_dir.join("uv"), bin_dir.join("node")],
            },
            installer: InstallerConfig {
                lock_file: backend_dir.join("uv.lock"),
                target_dir: cache_dir.join("deps"),
                python,
                package_manager: PathBuf::from("uv"),
                export_timeout: Duration::from_secs(5 * 60),
                install_timeout: Duration::from_secs(10 * 60),
                log_capacity: 2000,
                store_path: config_dir.join("preferences.json"),
            },
            update: UpdateConfig {
                enabled: false,
                app_name: "Hostgate".to_string(),
                current_version: env!("CARGO_PKG_VERSION").to_string(),
                api_root: "https://hostgate.example.com".to_string(),
                fallback_owner: "hostgate".to_string(),
                fallback_repo: "hostgate".to_string(),
                initial_delay: Duration::from_secs(3),
                check_interval: Duration::from_secs(60 * 60),
                download_dir: cache_dir.join("updates"),
            },
            root_dir,
            config_dir,
            cache_dir,
            log_dir,
        }
    }

    /// Default layout under `~/.hostgate`
    pub fn default_root() -> Result<PathBuf, ConfigError> {
        dirs::home_dir()
            .map(|home| home.join(".hostgate"))
            .ok_or(ConfigError::NoHomeDir)
    }

    /// Load configuration from environment variables with defaults
    pub fn from_env() -> Result<Self, ConfigError> {
        let root = match std::env::var("HOSTGATE_ROOT") {
            Ok(root) if !root.is_empty() => PathBuf::from(root),
            _ => Self::default_root()?,
        };
        let mut config = Self::with_root(root);

        if let Some(port) = env_parse::<u16>("HOSTGATE_GATEWAY_PORT") {
            config.gateway_port = port;
        }

        if let Some(ms) = env_parse::<u64>("HOSTGATE_STOP_GRACE_MS") {
            config.stop_grace = Duration::from_millis(ms);
        }

        if let Ok(program) = std::env::var("HOSTGATE_BACKEND_PROGRAM") {
            config.backend.program = PathBuf::from(program);
        }

        if let Ok(args) = std::env::var("HOSTGATE_BACKEND_ARGS") {
            config.backend.args = args.split_whitespace().map(str::to_string).collect();
        }

        if let Ok(dir) = std::env::var("HOSTGATE_BACKEND_DIR") {
            config.backend.working_dir = Some(PathBuf::from(dir));
        }

        if let Ok(mode) = std::env::var("HOSTGATE_STDIO") {
            config.backend.stdio = if mode.eq_ignore_ascii_case("inherit") {
                StdioMode::Inherit
            } else {
                StdioMode::Piped
            };
        }

        if let Ok(path) = std::env::var("HOSTGATE_LOCK_FILE") {
            config.installer.lock_file = PathBuf::from(path);
        }

        if let Ok(path) = std::env::var("HOSTGATE_PYTHON") {
            config.installer.python = PathBuf::from(path);
        }

        if let Ok(path) = std::env::var("HOSTGATE_PACKAGE_MANAGER") {
            config.installer.package_manager = PathBuf::from(path);
        }

        if let Ok(val) = std::env::var("HOSTGATE_UPDATE_ENABLED") {
            config.update.enabled = val.to_lowercase() != "false" && val != "0";
        }

        if let Ok(root) = std::env::var("HOSTGATE_UPDATE_API_ROOT") {
            config.update.api_root = root;
        }

        if let Ok(repo) = std::env::var("HOSTGATE_UPDATE_FALLBACK_REPO") {
            if let Some((owner, name)) = repo.split_once('/') {
                config.update.fallback_owner = owner.to_string();
                config.update.fallback_repo = name.to_string();
            }
        }

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.gateway_port == 0 {
            return Err(ConfigError::invalid("gateway_port must be a fixed, non-zero port"));
        }

        if self.backend.program.as_os_str().is_empty() {
            return Err(ConfigError::invalid("backend program cannot be empty"));
        }

        if self.readiness.window_bytes == 0 {
            return Err(ConfigError::invalid("readiness window must be greater than 0"));
        }

        if self.readiness.poll_interval.is_zero() {
            return Err(ConfigError::invalid("readiness poll interval must be greater than 0"));
        }

        if self.installer.export_timeout.is_zero() || self.installer.install_timeout.is_zero() {
            return Err(ConfigError::invalid("installer timeouts must be greater than 0"));
        }

        if self.installer.log_capacity == 0 {
            return Err(ConfigError::invalid("install log capacity must be greater than 0"));
        }

        if self.update.check_interval.is_zero() {
            return Err(ConfigError::invalid("update check_interval must be greater than 0"));
        }

        Ok(())
    }

    pub fn bus_path(&self) -> &Path {
        &self.readiness.bus_path
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|value| value.parse().ok())
}
