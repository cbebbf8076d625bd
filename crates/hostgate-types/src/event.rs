use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Notifications delivered to the embedding application
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum SupervisorEvent {
    /// The backend announced its listen address
    BackendPort { host: String, port: u16 },
    /// The primary backend process exited on its own
    BackendExited { code: Option<i32> },
    /// A mutating request went through the gateway successfully
    UiRefresh {
        method: String,
        path: String,
        status: u16,
    },
    /// One line of dependency installer output
    InstallProgress { line: String },
    /// Dependency installation finished (or was skipped)
    InstallFinished { success: bool },
    UpdateAvailable {
        current_version: String,
        new_version: String,
    },
    UpdateNotAvailable {
        current_version: String,
        new_version: String,
    },
    /// The host should exit and apply the downloaded update
    QuitAndInstall { installer: PathBuf },
}

impl SupervisorEvent {
    pub fn name(&self) -> &'static str {
        match self {
            SupervisorEvent::BackendPort { .. } => "backend_port",
            SupervisorEvent::BackendExited { .. } => "backend_exited",
            SupervisorEvent::UiRefresh { .. } => "ui_refresh",
            SupervisorEvent::InstallProgress { .. } => "install_progress",
            SupervisorEvent::InstallFinished { .. } => "install_finished",
            SupervisorEvent::UpdateAvailable { .. } => "update_available",
            SupervisorEvent::UpdateNotAvailable { .. } => "update_not_available",
            SupervisorEvent::QuitAndInstall { .. } => "quit_and_install",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization() {
        let event = SupervisorEvent::BackendPort {
            host: "127.0.0.1".to_string(),
            port: 4000,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "backend_port");
        assert_eq!(json["data"]["port"], 4000);
        assert_eq!(event.name(), "backend_port");
    }
}
