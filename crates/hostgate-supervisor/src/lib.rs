//! Supervisor and fixed-port gateway for an embedded backend service
//!
//! The host launches a backend on an ephemeral port, learns the port from
//! the readiness channel and exposes the backend on a fixed local port
//! through the gateway. Dependency installation and application updates
//! live here as well, so an embedding application only drives a
//! [`HostService`] and listens for [`hostgate_types::SupervisorEvent`]s.

pub mod config;
pub mod context;
pub mod gateway;
pub mod install;
pub mod process;
pub mod readiness;
pub mod service;
pub mod store;
pub mod update;

pub use config::{ConfigError, SupervisorConfig};
pub use context::{ServiceUpCallback, SupervisorContext};
pub use gateway::{Gateway, GatewayError, GatewayState};
pub use install::{DependencyInstaller, InstallError, InstallLog};
pub use process::{LaunchSpec, ProcessError, ProcessHandle, ProcessSupervisor, SupervisorState};
pub use readiness::{BusWatch, ReadinessBus, ReadinessError};
pub use service::HostService;
pub use store::{Store, StoreError};
pub use update::{UpdateCoordinator, UpdateError, UpdateFeed};
