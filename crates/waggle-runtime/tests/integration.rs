//! End-to-end lifecycle tests against in-memory backends and a mocked
//! bridge.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use waggle_config::Settings;
use waggle_queue::{MemoryListStore, MessagePriority};
use waggle_runtime::App;
use waggle_store::Store;

async fn mock_bridge() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "healthy"})))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/sessions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{
            "session_id": "+5550000001",
            "status": "connected",
            "phone_number": "+5550000001"
        }])))
        .mount(&server)
        .await;
    server
}

fn settings(bridge_url: &str) -> Settings {
    let vars = HashMap::from([
        (
            "ENCRYPTION_KEY".to_string(),
            "integration-test-key-32-characters!!".to_string(),
        ),
        ("WHATSAPP_SYSTEM_NUMBER".to_string(), "+5550000001".to_string()),
        ("WHATSAPP_BRIDGE_URL".to_string(), bridge_url.to_string()),
        ("MESSAGE_PROCESSOR_WORKERS".to_string(), "2".to_string()),
    ]);
    Settings::from_vars(&vars).unwrap()
}

fn app(bridge_url: &str) -> App {
    App::assemble(
        settings(bridge_url),
        Store::open_in_memory().unwrap(),
        Arc::new(MemoryListStore::new()),
    )
}

#[tokio::test]
async fn initialize_is_idempotent() {
    let bridge = mock_bridge().await;
    let app = app(&bridge.uri());

    let first = app.orchestrator.initialize().await;
    assert_eq!(first["status"], "initialized");
    assert_eq!(first["results"]["bridge_config"]["status"], "configured");
    assert_eq!(first["results"]["system_session"]["status"], "connected");
    assert_eq!(first["results"]["message_processors"]["started"], 2);
    assert_eq!(first["results"]["health_check"]["healthy"], true);

    let second = app.orchestrator.initialize().await;
    assert_eq!(second["status"], "already_initialized");

    let status = app.orchestrator.get_status().await;
    assert_eq!(status["workers"]["configured"], 2);
    assert_eq!(status["workers"]["running"], 2);

    app.close().await;
}

#[tokio::test]
async fn shutdown_stops_workers_and_reports_status() {
    let bridge = mock_bridge().await;
    let app = app(&bridge.uri());

    assert_eq!(
        app.orchestrator.shutdown().await["status"],
        "not_initialized"
    );

    app.orchestrator.initialize().await;
    let result = app.orchestrator.shutdown().await;
    assert_eq!(result["status"], "shutdown_complete");

    let status = app.orchestrator.get_status().await;
    assert_eq!(status["initialized"], false);
    assert_eq!(status["workers"]["running"], 0);
}

#[tokio::test]
async fn status_includes_health_queue_and_bridge_when_initialized() {
    let bridge = mock_bridge().await;
    let app = app(&bridge.uri());
    app.orchestrator.initialize().await;

    let status = app.orchestrator.get_status().await;
    assert_eq!(status["initialized"], true);
    assert_eq!(status["health"]["healthy"], true);
    assert_eq!(status["health"]["summary"]["total_components"], 4);
    assert_eq!(status["bridge"]["status"], "healthy");
    assert!(status["queue"]["total"].is_number());

    app.close().await;
}

#[tokio::test]
async fn workers_drain_queued_turns() {
    let bridge = mock_bridge().await;
    let app = app(&bridge.uri());

    // A user with no LLM config: the turn completes unsuccessfully but is
    // acknowledged, draining the queue.
    let user = app.store.get_or_create_user("+1234567890", None).await.unwrap();
    app.queue
        .enqueue(user.id, "hello", MessagePriority::Normal, None)
        .await
        .unwrap();

    app.orchestrator.initialize().await;

    let mut drained = false;
    for _ in 0..50 {
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        if app.queue.get_queue_stats().await.unwrap().total == 0 {
            drained = true;
            break;
        }
    }
    assert!(drained, "workers did not drain the queue");

    // The inbound text is archived even though no reply was produced.
    let recent = app.store.get_recent_messages(user.id, 10).await.unwrap();
    assert_eq!(recent.len(), 1);
    assert_eq!(recent[0].content.as_deref(), Some("hello"));

    app.close().await;
}

#[tokio::test]
async fn monitor_reports_degraded_bridge() {
    // Bridge endpoint that immediately refuses connections.
    let app = app("http://127.0.0.1:9");
    app.orchestrator.initialize().await;

    let status = app.orchestrator.get_status().await;
    assert_eq!(status["health"]["healthy"], false);
    assert_eq!(status["health"]["status"], "degraded");
    assert_eq!(
        status["health"]["components"]["whatsapp_bridge"]["healthy"],
        false
    );
    // Database and queue components stay healthy.
    assert_eq!(status["health"]["components"]["database"]["healthy"], true);
    assert_eq!(status["health"]["components"]["message_queue"]["healthy"], true);

    app.close().await;
}
