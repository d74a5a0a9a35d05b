use sensor_ingestor::memory::{MemoryHistoryStore, MemoryLatestValueStore};
use sensor_ingestor::model::HistoryResponse;
use sensor_ingestor::mqtt::{Dispatcher, Outcome};
use sensor_ingestor::rest;
use sensor_ingestor::service::SensorDataService;
use axum::{routing::get, Router};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

struct Pipeline {
    dispatcher: Dispatcher,
    history: Arc<MemoryHistoryStore>,
    base_url: String,
    shutdown_tx: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl Pipeline {
    async fn stop(self) {
        let _ = self.shutdown_tx.send(());
        let _ = self.handle.await;
    }
}

/// Best-effort check for whether binding to loopback is permitted in the current sandbox.
async fn can_bind_loopback() -> bool {
    match TcpListener::bind("127.0.0.1:0").await {
        Ok(listener) => {
            drop(listener);
            true
        }
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => false,
        Err(_) => true,
    }
}

fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .no_proxy()
        .build()
        .expect("failed to build HTTP client")
}

fn service() -> (
    Arc<SensorDataService>,
    Arc<MemoryHistoryStore>,
    Arc<MemoryLatestValueStore>,
) {
    let history = Arc::new(MemoryHistoryStore::new());
    let latest = Arc::new(MemoryLatestValueStore::new());
    let service = Arc::new(SensorDataService::new(
        history.clone(),
        latest.clone(),
        Duration::from_secs(5),
    ));
    (service, history, latest)
}

/// Consumer side only, no HTTP listener.
fn offline_pipeline() -> (
    Dispatcher,
    Arc<MemoryHistoryStore>,
    Arc<MemoryLatestValueStore>,
) {
    let (service, history, latest) = service();
    (Dispatcher::new(service), history, latest)
}

struct Server {
    base_url: String,
    shutdown_tx: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

async fn serve(app: Router) -> Server {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("failed to bind query listener");
    let port = listener.local_addr().unwrap().port();

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let handle = tokio::spawn(async move {
        let server = axum::serve(listener, app).with_graceful_shutdown(async {
            let _ = shutdown_rx.await;
        });
        if let Err(err) = server.await {
            eprintln!("query server error: {}", err);
        }
    });

    Server {
        base_url: format!("http://127.0.0.1:{}", port),
        shutdown_tx,
        handle,
    }
}

async fn start_pipeline() -> Pipeline {
    let (service, history, _latest) = service();
    let server = serve(rest::instrument(rest::create_router(service.clone()))).await;

    Pipeline {
        dispatcher: Dispatcher::new(service),
        history,
        base_url: server.base_url,
        shutdown_tx: server.shutdown_tx,
        handle: server.handle,
    }
}

#[tokio::test]
async fn test_publish_then_query_latest_and_history() {
    if !can_bind_loopback().await {
        eprintln!("skipping: loopback bind not permitted");
        return;
    }
    let pipeline = start_pipeline().await;
    let client = http_client();

    let outcome = pipeline
        .dispatcher
        .dispatch(
            "sensors/sensor-1",
            br#"{"device":{"id":"sensor-1"},"data":{"value":21.5,"timestamp":"2024-01-01T00:00:00Z"}}"#,
        )
        .await;
    assert_eq!(outcome, Outcome::Processed);

    let resp = client
        .get(format!("{}/devices/sensor-1/latest", pipeline.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(
        body,
        serde_json::json!({
            "deviceID": "sensor-1",
            "value": 21.5,
            "observedAt": "2024-01-01T00:00:00Z"
        })
    );

    let resp = client
        .get(format!(
            "{}/devices/sensor-1/history?limit=10",
            pipeline.base_url
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let history: HistoryResponse = resp.json().await.unwrap();
    assert_eq!(history.total, 1);
    assert_eq!(history.limit, 10);
    assert_eq!(history.offset, 0);
    assert_eq!(history.data.len(), 1);
    assert_eq!(history.data[0].device_id, "sensor-1");
    assert_eq!(history.data[0].value, 21.5);
    assert_eq!(
        history.data[0].observed_at.to_rfc3339(),
        "2024-01-01T00:00:00+00:00"
    );

    pipeline.stop().await;
}

#[tokio::test]
async fn test_unknown_device_and_bad_paging() {
    if !can_bind_loopback().await {
        eprintln!("skipping: loopback bind not permitted");
        return;
    }
    let pipeline = start_pipeline().await;
    let client = http_client();

    let resp = client
        .get(format!("{}/devices/ghost/latest", pipeline.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
    let body: Value = resp.json().await.unwrap();
    assert!(body["error"].as_str().unwrap().contains("ghost"));

    let resp = client
        .get(format!(
            "{}/devices/ghost/history?limit=lots&offset=-3",
            pipeline.base_url
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let history: HistoryResponse = resp.json().await.unwrap();
    assert_eq!(history.limit, 100);
    assert_eq!(history.offset, 0);
    assert_eq!(history.total, 0);
    assert!(history.data.is_empty());

    pipeline.stop().await;
}

#[tokio::test]
async fn test_history_store_outage_is_server_error() {
    if !can_bind_loopback().await {
        eprintln!("skipping: loopback bind not permitted");
        return;
    }
    let pipeline = start_pipeline().await;
    pipeline.history.fail_reads(true);

    let resp = http_client()
        .get(format!("{}/devices/d/history", pipeline.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 500);

    pipeline.stop().await;
}

#[tokio::test]
async fn test_duplicate_and_rejected_messages() {
    let (dispatcher, history, latest) = offline_pipeline();
    let payload = br#"{"device":{"id":"dup"},"data":{"value":7.0,"timestamp":"2024-02-01T00:00:00Z"}}"#;

    assert_eq!(dispatcher.dispatch("sensors/dup", payload).await, Outcome::Processed);
    assert_eq!(dispatcher.dispatch("sensors/dup", payload).await, Outcome::Processed);
    assert_eq!(
        dispatcher
            .dispatch("sensors/dup", br#"{"device":{},"data":{"value":1}}"#)
            .await,
        Outcome::Rejected
    );

    assert_eq!(history.rows().await.len(), 2);
    assert_eq!(latest.len().await, 1);
    assert_eq!(latest.writes(), 2);
}

#[tokio::test]
async fn test_cache_outage_keeps_history() {
    let (dispatcher, history, latest) = offline_pipeline();
    latest.fail_writes(true);

    let outcome = dispatcher
        .dispatch("sensors/c", br#"{"device":{"id":"c"},"data":{"value":1.5}}"#)
        .await;

    assert_eq!(outcome, Outcome::Processed);
    assert_eq!(history.rows().await.len(), 1);
    assert_eq!(latest.len().await, 0);
}

#[tokio::test]
async fn test_history_outage_reported_to_consumer() {
    let (dispatcher, history, latest) = offline_pipeline();
    history.fail_writes(true);

    let outcome = dispatcher
        .dispatch("sensors/h", br#"{"device":{"id":"h"},"data":{"value":1.5}}"#)
        .await;

    assert_eq!(outcome, Outcome::HandlerFailed);
    assert!(history.rows().await.is_empty());
    assert_eq!(latest.len().await, 0);
}

async fn panicking_handler() -> &'static str {
    panic!("handler bug")
}

#[tokio::test]
async fn test_handler_panic_becomes_server_error() {
    if !can_bind_loopback().await {
        eprintln!("skipping: loopback bind not permitted");
        return;
    }
    let server = serve(rest::instrument(
        Router::new().route("/boom", get(panicking_handler)),
    ))
    .await;
    let client = http_client();

    let resp = client
        .get(format!("{}/boom", server.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 500);

    // The listener keeps serving after the panic.
    let resp = client
        .get(format!("{}/boom", server.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 500);

    let _ = server.shutdown_tx.send(());
    let _ = server.handle.await;
}
