//! Whole host service: readiness, gateway and backend together

#![cfg(unix)]

mod common;

use axum::Router;
use axum::routing::get;
use common::{free_port, service_config, write_script, within};
use hostgate_supervisor::{HostService, SupervisorState};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpListener;

/// Writes the readiness document for `port` to the channel it is given
fn announcing_script(port: u16) -> String {
    format!(
        r#"bus=""
while [ $# -gt 0 ]; do
  if [ "$1" = "--report_status_file" ]; then bus="$2"; shift; fi
  shift
done
printf '%s' '{{"event":"server_started","server":{{"listen":{{"ip":"127.0.0.1","port":{port}}}}}}}' > "$bus"
exec sleep 30"#
    )
}

async fn spawn_backend() -> SocketAddr {
    let app = Router::new().route("/hello", get(|| async { "hello from backend" }));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn backend_program(dir: &TempDir) -> PathBuf {
    dir.path().join("bin").join("backend")
}

fn install_backend(dir: &TempDir, port: u16) {
    let bin = dir.path().join("bin");
    std::fs::create_dir_all(&bin).unwrap();
    write_script(&bin, "backend", &announcing_script(port));
}

fn gateway_url(port: u16, path: &str) -> String {
    format!("http://127.0.0.1:{port}{path}")
}

fn client() -> reqwest::Client {
    reqwest::Client::builder().no_proxy().build().unwrap()
}

#[tokio::test]
async fn test_start_ready_forward_shutdown() {
    let dir = TempDir::new().unwrap();
    let backend = spawn_backend().await;
    install_backend(&dir, backend.port());

    let mut config = service_config(&dir);
    config.backend.program = backend_program(&dir);
    let gateway_port = config.gateway_port;
    let service = HostService::new(config).await.unwrap();

    let gateway = within(service.start()).await.unwrap();
    assert_eq!(gateway.port(), gateway_port);
    assert_eq!(service.supervisor().state(), SupervisorState::Running);

    let address = service
        .wait_until_ready(Duration::from_secs(10))
        .await
        .unwrap();
    assert_eq!(address.port, backend.port());

    let response = client()
        .get(gateway_url(gateway_port, "/hello"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert_eq!(response.text().await.unwrap(), "hello from backend");

    within(service.shutdown()).await.unwrap();
    assert_eq!(service.supervisor().state(), SupervisorState::Stopped);
    assert!(!service.context().backend_address().is_set());
    assert!(service.context().live_processes().is_empty());
    assert!(
        client()
            .get(gateway_url(gateway_port, "/hello"))
            .send()
            .await
            .is_err()
    );
}

#[tokio::test]
async fn test_start_retries_after_spawn_failure() {
    let dir = TempDir::new().unwrap();
    let backend = spawn_backend().await;

    let mut config = service_config(&dir);
    config.backend.program = backend_program(&dir);
    let gateway_port = config.gateway_port;
    let service = HostService::new(config).await.unwrap();

    assert!(!backend_program(&dir).exists());
    assert!(within(service.start()).await.is_err());
    assert_eq!(service.supervisor().state(), SupervisorState::Idle);

    // Gateway stays up and answers not ready in the meantime
    let response = client()
        .get(gateway_url(gateway_port, "/hello"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::SERVICE_UNAVAILABLE);

    install_backend(&dir, backend.port());
    let gateway = within(service.start()).await.unwrap();
    assert_eq!(gateway.port(), gateway_port);

    let address = service
        .wait_until_ready(Duration::from_secs(10))
        .await
        .unwrap();
    assert_eq!(address.port, backend.port());

    within(service.shutdown()).await.unwrap();
}

#[tokio::test]
async fn test_wait_until_ready_times_out_without_leftovers() {
    let dir = TempDir::new().unwrap();
    let service = HostService::new(service_config(&dir)).await.unwrap();

    for _ in 0..3 {
        assert!(
            service
                .wait_until_ready(Duration::from_millis(50))
                .await
                .is_err()
        );
    }
    assert_eq!(service.context().pending_service_up_count(), 0);

    service.bus().publish_address("127.0.0.1", free_port());
    assert!(
        service
            .wait_until_ready(Duration::from_millis(50))
            .await
            .is_ok()
    );
}
