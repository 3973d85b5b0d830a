//! Tests for HttpInferenceBackend against a local axum server

use axum::{
    extract::Path,
    http::{HeaderMap, StatusCode},
    routing::post,
    Json, Router,
};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use shared::{InferenceRequest, Settings, WorkerId};

use super::common::with_timeout;
use crate::error::HypervisorError;
use crate::services::backend_client::{HttpInferenceBackend, WORKER_HEADER};
use crate::traits::InferenceBackend;

async fn echo(Path(function): Path<String>, headers: HeaderMap, Json(payload): Json<Value>) -> Json<Value> {
    let worker = headers
        .get(WORKER_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    Json(json!({ "function": function, "worker": worker, "payload": payload }))
}

async fn slow() -> Json<Value> {
    tokio::time::sleep(Duration::from_secs(30)).await;
    Json(json!({}))
}

async fn broken() -> (StatusCode, &'static str) {
    (StatusCode::INTERNAL_SERVER_ERROR, "model not loaded")
}

/// Serve a fake backend and return its port
async fn fake_backend() -> u16 {
    let router = Router::new()
        .route("/v1/slow", post(slow))
        .route("/v1/broken", post(broken))
        .route("/v1/:function", post(echo));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    port
}

fn client_for(port: u16) -> HttpInferenceBackend {
    let (_tx, rx) = watch::channel(Settings {
        backend_port: port,
        ..Settings::default()
    });
    HttpInferenceBackend::new(rx)
}

#[tokio::test]
async fn test_forwards_payload_to_configured_port() {
    let port = fake_backend().await;
    let client = client_for(port);

    let result = client
        .infer(
            WorkerId(1),
            InferenceRequest::new("caption", json!({"image_url": "cat.png"})),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(result["function"], "caption");
    assert_eq!(result["worker"], "1");
    assert_eq!(result["payload"]["image_url"], "cat.png");
}

#[tokio::test]
async fn test_error_status_is_backend_error() {
    let port = fake_backend().await;
    let client = HttpInferenceBackend::new(watch::channel(Settings::default()).1)
        .with_base_url(format!("http://127.0.0.1:{port}/"));

    let result = client
        .infer(WorkerId(0), InferenceRequest::new("broken", json!({})), CancellationToken::new())
        .await;

    match result {
        Err(HypervisorError::Backend { message }) => {
            assert!(message.contains("500"));
            assert!(message.contains("model not loaded"));
        }
        other => panic!("expected backend error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_cancellation_interrupts_call() {
    let port = fake_backend().await;
    let client = client_for(port);
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let result = with_timeout(client.infer(WorkerId(0), InferenceRequest::new("slow", json!({})), cancel))
        .await
        .expect("cancellation should end the call");

    assert!(matches!(result, Err(HypervisorError::Backend { .. })));
}

#[tokio::test]
async fn test_refused_connection_reports_backend_not_running() {
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };
    let client = client_for(port);

    let result = with_timeout(client.infer(
        WorkerId(0),
        InferenceRequest::new("caption", json!({})),
        CancellationToken::new(),
    ))
    .await
    .expect("connection attempt should fail fast");

    assert!(matches!(result, Err(HypervisorError::NotRunning)));
}
