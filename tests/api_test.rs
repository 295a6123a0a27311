//! Integration tests for the HTTP surface: endpoint contracts, error bodies
//! and API-key authentication.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::response::Response;
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tower::ServiceExt;

use gridpulse::api::{router, AppState};
use gridpulse::decode::RawEvent;
use gridpulse::registry::DeviceRegistry;
use gridpulse::subscription::BackoffPolicy;
use gridpulse::upstream::MockEventSource;

struct TestService {
    app: Router,
    source: Arc<MockEventSource>,
    registry: Arc<DeviceRegistry>,
}

fn service_with_key(api_key: Option<&str>) -> TestService {
    let source = Arc::new(MockEventSource::new());
    let (sink_tx, _sink_rx) = mpsc::channel(64);
    let registry = Arc::new(DeviceRegistry::new(
        source.clone(),
        sink_tx,
        Duration::from_secs(3600),
        BackoffPolicy {
            base: Duration::from_millis(5),
            cap: Duration::from_millis(20),
        },
    ));
    let app = router(AppState {
        registry: Arc::clone(&registry),
        api_key: api_key.map(str::to_string),
        default_device: Some("meter-1".to_string()),
    });
    TestService {
        app,
        source,
        registry,
    }
}

fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .method(Method::GET)
        .uri(uri)
        .body(Body::empty())
        .expect("request builds")
}

fn post_json(uri: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .expect("request builds")
}

fn delete(uri: &str) -> Request<Body> {
    Request::builder()
        .method(Method::DELETE)
        .uri(uri)
        .body(Body::empty())
        .expect("request builds")
}

async fn body_json(response: Response) -> Value {
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("body readable")
        .to_bytes();
    serde_json::from_slice(&bytes).expect("body is JSON")
}

#[tokio::test]
async fn register_then_reregister() {
    let service = service_with_key(None);

    let response = service
        .app
        .clone()
        .oneshot(post_json(
            "/api/register-device",
            &json!({"deviceId": "meter-1"}),
        ))
        .await
        .expect("request runs");
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["deviceId"], "meter-1");
    assert_eq!(body["status"], "registering");

    let response = service
        .app
        .clone()
        .oneshot(post_json(
            "/api/register-device",
            &json!({"deviceId": "meter-1"}),
        ))
        .await
        .expect("request runs");
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "registered");

    service.registry.shutdown().await;
}

#[tokio::test]
async fn register_without_device_id_is_bad_request() {
    let service = service_with_key(None);

    for body in [json!({}), json!({"deviceId": ""}), json!({"deviceId": "  "})] {
        let response = service
            .app
            .clone()
            .oneshot(post_json("/api/register-device", &body))
            .await
            .expect("request runs");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert!(body["error"].as_str().is_some());
    }

    service.registry.shutdown().await;
}

#[tokio::test]
async fn unregister_unknown_device_is_not_found() {
    let service = service_with_key(None);

    let response = service
        .app
        .clone()
        .oneshot(delete("/api/unregister-device/ghost"))
        .await
        .expect("request runs");
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = body_json(response).await;
    assert!(body["error"].as_str().unwrap_or("").contains("ghost"));

    service.registry.shutdown().await;
}

#[tokio::test]
async fn unregister_round_trip() {
    let service = service_with_key(None);
    service.registry.register("meter-1").await;

    let response = service
        .app
        .clone()
        .oneshot(delete("/api/unregister-device/meter-1"))
        .await
        .expect("request runs");
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["deviceId"], "meter-1");
    assert_eq!(body["status"], "unregistered");

    service.registry.shutdown().await;
}

#[tokio::test]
async fn device_list_reports_default_device() {
    let service = service_with_key(None);
    service.registry.register("meter-1").await;

    let response = service
        .app
        .clone()
        .oneshot(get("/api/devices"))
        .await
        .expect("request runs");
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["defaultDevice"], "meter-1");
    let devices = body["devices"].as_array().expect("array");
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0]["deviceId"], "meter-1");
    assert_eq!(devices[0]["isConnected"], false);
    assert!(devices[0]["registeredAt"].is_string());
    assert!(devices[0]["lastSeen"].is_string());

    service.registry.shutdown().await;
}

#[tokio::test]
async fn telemetry_for_unregistered_device_is_not_found() {
    let service = service_with_key(None);

    let response = service
        .app
        .clone()
        .oneshot(get("/api/telemetry/ghost"))
        .await
        .expect("request runs");
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    service.registry.shutdown().await;
}

#[tokio::test]
async fn telemetry_without_data_is_explicit_and_ok() {
    let service = service_with_key(None);
    service.registry.register("meter-1").await;

    let response = service
        .app
        .clone()
        .oneshot(get("/api/telemetry/meter-1"))
        .await
        .expect("request runs");
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["deviceId"], "meter-1");
    assert_eq!(body["timestamp"], Value::Null);
    assert_eq!(body["isConnected"], false);
    assert_eq!(body["voltages"].as_array().map(Vec::len), Some(0));
    assert!(body["message"].as_str().is_some());

    service.registry.shutdown().await;
}

#[tokio::test]
async fn telemetry_returns_per_phase_arrays() {
    let service = service_with_key(None);
    service.registry.register("meter-1").await;

    for _ in 0..200 {
        if service.source.open_count() >= 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    service.source.push(
        "meter-1",
        RawEvent::telemetry(
            "meter-1",
            &json!({
                "timestamp": "2025-03-01T12:00:00Z",
                "phase1": {"v": 220.1, "i": 5.2, "p": 1144.5, "f": 50.0, "pf": 0.99},
                "phase3": {"v": 229.4}
            }),
        ),
    );
    for _ in 0..200 {
        let ready = service
            .registry
            .telemetry("meter-1")
            .await
            .map(|s| s.reading.is_some())
            .unwrap_or(false);
        if ready {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    // Query-parameter form of the endpoint.
    let response = service
        .app
        .clone()
        .oneshot(get("/api/telemetry?deviceId=meter-1"))
        .await
        .expect("request runs");
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["isConnected"], true);
    assert_eq!(body["voltages"], json!([220.1, null, 229.4]));
    assert_eq!(body["currents"], json!([5.2, null, null]));
    assert_eq!(body["power"], json!([1144.5, null, null]));
    assert_eq!(body["frequency"], json!([50.0, null, null]));
    assert!(body["timestamp"].as_str().is_some());

    service.registry.shutdown().await;
}

#[tokio::test]
async fn api_key_guards_api_routes_but_not_health() {
    let service = service_with_key(Some("sesame"));

    // Missing key.
    let response = service
        .app
        .clone()
        .oneshot(get("/api/devices"))
        .await
        .expect("request runs");
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    // Wrong key.
    let request = Request::builder()
        .method(Method::GET)
        .uri("/api/devices")
        .header("X-API-Key", "guess")
        .body(Body::empty())
        .expect("request builds");
    let response = service.app.clone().oneshot(request).await.expect("runs");
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    // Header key.
    let request = Request::builder()
        .method(Method::GET)
        .uri("/api/devices")
        .header("X-API-Key", "sesame")
        .body(Body::empty())
        .expect("request builds");
    let response = service.app.clone().oneshot(request).await.expect("runs");
    assert_eq!(response.status(), StatusCode::OK);

    // Query-parameter key.
    let response = service
        .app
        .clone()
        .oneshot(get("/api/devices?api_key=sesame"))
        .await
        .expect("request runs");
    assert_eq!(response.status(), StatusCode::OK);

    // Health stays open for liveness probes.
    let response = service
        .app
        .clone()
        .oneshot(get("/health"))
        .await
        .expect("request runs");
    assert_eq!(response.status(), StatusCode::OK);

    service.registry.shutdown().await;
}

#[tokio::test]
async fn auth_disabled_when_no_key_configured() {
    let service = service_with_key(None);

    let response = service
        .app
        .clone()
        .oneshot(get("/api/devices"))
        .await
        .expect("request runs");
    assert_eq!(response.status(), StatusCode::OK);

    service.registry.shutdown().await;
}

#[tokio::test]
async fn health_reports_device_count() {
    let service = service_with_key(None);
    service.registry.register("meter-1").await;
    service.registry.register("meter-2").await;

    let response = service
        .app
        .clone()
        .oneshot(get("/health"))
        .await
        .expect("request runs");
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["devices"], 2);

    service.registry.shutdown().await;
}
