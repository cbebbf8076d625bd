//! Gateway forwarding against a local stand-in backend

mod common;

use axum::extract::Request;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use common::{next_event, test_bus, test_config, within};
use hostgate_supervisor::gateway::{CORS_ALLOW_HEADERS, CORS_ALLOW_METHODS};
use hostgate_supervisor::{Gateway, GatewayState, ReadinessBus, SupervisorContext};
use hostgate_types::{GatewayErrorBody, SupervisorEvent};
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

struct Harness {
    _dir: TempDir,
    context: Arc<SupervisorContext>,
    bus: Arc<ReadinessBus>,
    gateway: SocketAddr,
    client: reqwest::Client,
    _shutdown: oneshot::Sender<()>,
}

impl Harness {
    async fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let (context, bus) = test_bus(&config);

        let state = GatewayState::new(Arc::clone(&context)).unwrap();
        let gateway = Gateway::bind("127.0.0.1:0".parse().unwrap(), state)
            .await
            .unwrap();
        let addr = gateway.local_addr().unwrap();
        let (tx, rx) = oneshot::channel::<()>();
        tokio::spawn(gateway.serve(async move {
            let _ = rx.await;
        }));

        Self {
            _dir: dir,
            context,
            bus,
            gateway: addr,
            client: reqwest::Client::builder().no_proxy().build().unwrap(),
            _shutdown: tx,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.gateway, path)
    }
}

async fn echo(request: Request) -> Json<Value> {
    let host = request
        .headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let custom = request
        .headers()
        .get("x-custom")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    Json(json!({
        "method": request.method().as_str(),
        "path": request.uri().path(),
        "query": request.uri().query(),
        "host": host,
        "custom": custom,
    }))
}

async fn create(body: String) -> impl IntoResponse {
    (StatusCode::CREATED, format!("created:{body}"))
}

async fn own_cors() -> impl IntoResponse {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        "http://app.local".parse().unwrap(),
    );
    (headers, "ok")
}

async fn failing() -> impl IntoResponse {
    (StatusCode::INTERNAL_SERVER_ERROR, "nope")
}

/// Stand-in backend on an ephemeral port
async fn spawn_backend() -> SocketAddr {
    let app = Router::new()
        .route("/echo", get(echo))
        .route("/items", post(create))
        .route("/cors", get(own_cors))
        .route("/fail", post(failing));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

#[tokio::test]
async fn test_not_ready_before_address_known() {
    let harness = Harness::new().await;

    let response = harness.client.get(harness.url("/echo")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(response.headers()["access-control-allow-origin"], "*");

    let body: GatewayErrorBody = response.json().await.unwrap();
    assert_eq!(body, GatewayErrorBody::not_ready());
}

#[tokio::test]
async fn test_preflight_answered_locally() {
    let harness = Harness::new().await;

    let response = harness
        .client
        .request(reqwest::Method::OPTIONS, harness.url("/anything"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["access-control-allow-origin"], "*");
    assert_eq!(response.headers()["access-control-allow-methods"], CORS_ALLOW_METHODS);
    assert_eq!(response.headers()["access-control-allow-headers"], CORS_ALLOW_HEADERS);
    assert!(response.bytes().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_forwards_path_query_and_headers() {
    let harness = Harness::new().await;
    let backend = spawn_backend().await;
    harness.bus.publish_address("127.0.0.1", backend.port());

    let response = harness
        .client
        .get(harness.url("/echo?name=hostgate&n=1"))
        .header("x-custom", "kept")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["access-control-allow-origin"], "*");

    let body: Value = response.json().await.unwrap();
    assert_eq!(body["method"], "GET");
    assert_eq!(body["path"], "/echo");
    assert_eq!(body["query"], "name=hostgate&n=1");
    assert_eq!(body["host"], format!("127.0.0.1:{}", backend.port()));
    assert_eq!(body["custom"], "kept");
}

#[tokio::test]
async fn test_successful_mutation_emits_refresh() {
    let harness = Harness::new().await;
    let backend = spawn_backend().await;
    harness.bus.publish_address("127.0.0.1", backend.port());
    let mut events = harness.context.subscribe();

    let response = harness
        .client
        .post(harness.url("/items"))
        .body("payload")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(response.text().await.unwrap(), "created:payload");

    let event = next_event(&mut events, Duration::from_secs(5), |e| {
        matches!(e, SupervisorEvent::UiRefresh { .. })
    })
    .await;
    assert_eq!(
        event,
        Some(SupervisorEvent::UiRefresh {
            method: "POST".to_string(),
            path: "/items".to_string(),
            status: 201,
        })
    );
}

#[tokio::test]
async fn test_failed_mutation_and_reads_do_not_refresh() {
    let harness = Harness::new().await;
    let backend = spawn_backend().await;
    harness.bus.publish_address("127.0.0.1", backend.port());
    let mut events = harness.context.subscribe();

    let response = harness.client.post(harness.url("/fail")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(response.text().await.unwrap(), "nope");

    let response = harness.client.get(harness.url("/echo")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let event = next_event(&mut events, Duration::from_millis(300), |e| {
        matches!(e, SupervisorEvent::UiRefresh { .. })
    })
    .await;
    assert!(event.is_none());
}

#[tokio::test]
async fn test_backend_cors_headers_are_kept() {
    let harness = Harness::new().await;
    let backend = spawn_backend().await;
    harness.bus.publish_address("127.0.0.1", backend.port());

    let response = harness.client.get(harness.url("/cors")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()["access-control-allow-origin"],
        "http://app.local"
    );
    assert_eq!(response.headers()["access-control-allow-methods"], CORS_ALLOW_METHODS);
}

#[tokio::test]
async fn test_unreachable_backend_is_bad_gateway() {
    let harness = Harness::new().await;

    // Grab a free port and release it so nothing listens there
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };
    harness.bus.publish_address("127.0.0.1", port);

    let response = within(harness.client.get(harness.url("/echo")).send())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    let body: GatewayErrorBody = response.json().await.unwrap();
    assert_eq!(body, GatewayErrorBody::bad_gateway());
}

#[tokio::test]
async fn test_address_change_takes_effect_without_restart() {
    let harness = Harness::new().await;
    let first = spawn_backend().await;
    let second = spawn_backend().await;

    harness.bus.publish_address("127.0.0.1", first.port());
    let body: Value = harness
        .client
        .get(harness.url("/echo"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["host"], format!("127.0.0.1:{}", first.port()));

    harness.context.begin_backend_start();
    harness.bus.publish_address("127.0.0.1", second.port());
    let body: Value = harness
        .client
        .get(harness.url("/echo"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["host"], format!("127.0.0.1:{}", second.port()));
}
