//! Shared helpers for integration tests

#![allow(dead_code)]

use hostgate_supervisor::{ReadinessBus, SupervisorConfig, SupervisorContext};
use hostgate_types::SupervisorEvent;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::broadcast;

/// Config rooted in a fresh temporary directory
pub fn test_config(dir: &TempDir) -> SupervisorConfig {
    let mut config = SupervisorConfig::with_root(dir.path());
    config.gateway_port = 0;
    config.readiness.poll_interval = Duration::from_millis(50);
    config
}

/// A port that was free a moment ago
pub fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// Config for a whole `HostService`: valid fixed gateway port, no working
/// directory for the backend
pub fn service_config(dir: &TempDir) -> SupervisorConfig {
    let mut config = test_config(dir);
    config.gateway_port = free_port();
    config.backend.args.clear();
    config.backend.working_dir = None;
    config.backend.extra_path_dirs.clear();
    config
}

pub fn test_bus(config: &SupervisorConfig) -> (Arc<SupervisorContext>, Arc<ReadinessBus>) {
    let context = Arc::new(SupervisorContext::new());
    let bus = Arc::new(ReadinessBus::new(&config.readiness, Arc::clone(&context)));
    (context, bus)
}

/// The status document a backend writes once it listens
pub fn readiness_json(ip: &str, port: u16) -> String {
    format!(r#"{{"event":"server_started","server":{{"listen":{{"ip":"{ip}","port":{port}}}}}}}"#)
}

/// Write an executable shell script
#[cfg(unix)]
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Poll `check` until it holds or `limit` passes
pub async fn wait_until<F>(limit: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}

/// Next event matching `predicate`, skipping others
pub async fn next_event<F>(
    events: &mut broadcast::Receiver<SupervisorEvent>,
    limit: Duration,
    mut predicate: F,
) -> Option<SupervisorEvent>
where
    F: FnMut(&SupervisorEvent) -> bool,
{
    tokio::time::timeout(limit, async {
        loop {
            match events.recv().await {
                Ok(event) if predicate(&event) => return Some(event),
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .await
    .ok()
    .flatten()
}

/// Await `future` with a generous test timeout
pub async fn within<T>(future: impl Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(10), future)
        .await
        .expect("test step timed out")
}
