//! Full-stack tests over a real TCP socket.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use gantry_core::{Backend, HandlerError, Status};
use gantry_server::{App, BackendDescriptor, NetworkConfig, NetworkModule, Outcome};
use serde_json::{json, Value};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

struct Store;

#[async_trait]
impl Backend for Store {
    async fn health_check(&self) -> Status {
        Status::Up
    }
}

/// A backend that refuses the first `failures` attempts.
fn flaky_store(name: &str, failures: u32, interval: Duration) -> BackendDescriptor {
    let attempts = Arc::new(AtomicU32::new(0));
    BackendDescriptor::new(name, move || {
        let attempts = Arc::clone(&attempts);
        async move {
            if attempts.fetch_add(1, Ordering::SeqCst) < failures {
                anyhow::bail!("connection refused");
            }
            Ok(Store)
        }
    })
    .with_retry_interval(interval)
}

fn explode() -> Outcome {
    panic!("handler exploded")
}

fn demo_app() -> App {
    let mut app = App::new();
    app.get("/users/{id}", |ctx| {
        Box::pin(async move {
            let id: u64 = ctx
                .param("id")
                .and_then(|raw| raw.parse().ok())
                .ok_or_else(|| HandlerError::invalid_param("id"))?;
            Ok::<_, HandlerError>(json!({ "id": id }))
        })
    })
    .unwrap()
    .post("/users", |_ctx| {
        Box::pin(async {
            Outcome::partial(json!({ "id": 1, "name": "ann" }), HandlerError::EntityAlreadyExists)
        })
    })
    .unwrap()
    .put("/users/{id}", |_ctx| {
        Box::pin(async {
            Outcome::partial(json!({ "id": 1 }), HandlerError::EntityAlreadyExists)
        })
    })
    .unwrap()
    .get("/report", |_ctx| {
        Box::pin(async {
            Outcome::partial(json!({ "rows": 2 }), HandlerError::missing_param("since"))
        })
    })
    .unwrap()
    .get("/panic", |_ctx| Box::pin(async { explode() }))
    .unwrap()
    .get("/store", |ctx| {
        Box::pin(async move {
            ctx.backend::<Store>("sql")?;
            Ok::<_, HandlerError>("connected")
        })
    })
    .unwrap();
    app
}

struct Running {
    base: String,
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<anyhow::Result<()>>,
}

impl Running {
    async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        self.task.await.unwrap().unwrap();
    }
}

async fn spawn(app: App) -> Running {
    let config = NetworkConfig {
        host: "127.0.0.1".to_string(),
        shutdown_grace: Duration::from_millis(500),
        ..NetworkConfig::default()
    };
    let mut server = NetworkModule::new(config, app);
    let port = server.start().await.unwrap();

    let (tx, rx) = oneshot::channel();
    let task = tokio::spawn(server.serve(async move {
        let _ = rx.await;
    }));

    Running {
        base: format!("http://127.0.0.1:{port}"),
        stop: Some(tx),
        task,
    }
}

async fn get(url: &str) -> (u16, Value) {
    let response = reqwest::get(url).await.unwrap();
    let status = response.status().as_u16();
    (status, response.json().await.unwrap_or(Value::Null))
}

#[tokio::test]
async fn backend_failing_twice_recovers_from_down_to_up() {
    // Startup attempt and the 100 ms retry fail; the 200 ms retry connects.
    let mut app = demo_app();
    app.backend(flaky_store("sql", 2, Duration::from_millis(100)));
    let server = spawn(app).await;

    let (status, body) = get(&format!("{}/.well-known/health", server.base)).await;
    assert_eq!(status, 200);
    assert_eq!(body, json!({ "status": "DOWN", "details": { "sql": "DOWN" } }));

    let (status, body) = get(&format!("{}/store", server.base)).await;
    assert_eq!(status, 500);
    assert_eq!(body["errors"][0]["code"], "DB Error");

    tokio::time::sleep(Duration::from_millis(250)).await;

    let (_, body) = get(&format!("{}/.well-known/health", server.base)).await;
    assert_eq!(body, json!({ "status": "UP", "details": { "sql": "UP" } }));

    let (status, body) = get(&format!("{}/store", server.base)).await;
    assert_eq!(status, 200);
    assert_eq!(body, json!("connected"));

    server.stop().await;
}

#[tokio::test]
async fn mixed_backends_are_degraded() {
    let mut app = demo_app();
    app.backend(flaky_store("sql", 0, Duration::from_secs(10)));
    app.backend(flaky_store("redis", u32::MAX, Duration::from_secs(10)));
    let server = spawn(app).await;

    let (_, body) = get(&format!("{}/.well-known/health/", server.base)).await;
    assert_eq!(body["status"], "DEGRADED");
    assert_eq!(body["details"]["redis"], "DOWN");

    server.stop().await;
}

#[tokio::test]
async fn invalid_param_is_400() {
    let server = spawn(demo_app()).await;

    let (status, body) = get(&format!("{}/users/abc", server.base)).await;
    assert_eq!(status, 400);
    let error = &body["errors"][0];
    assert_eq!(error["code"], "Invalid Parameter");
    assert_eq!(error["reason"], "Incorrect value for parameter: id");
    assert!(error["datetime"]["value"].is_string());

    server.stop().await;
}

#[tokio::test]
async fn already_exists_is_reported_as_success() {
    let server = spawn(demo_app()).await;
    let client = reqwest::Client::new();

    let created = client
        .post(format!("{}/users", server.base))
        .json(&json!({ "name": "ann" }))
        .send()
        .await
        .unwrap();
    assert_eq!(created.status().as_u16(), 201);
    let body: Value = created.json().await.unwrap();
    assert_eq!(body, json!({ "id": 1, "name": "ann" }));

    let updated = client
        .put(format!("{}/users/1", server.base))
        .send()
        .await
        .unwrap();
    assert_eq!(updated.status().as_u16(), 200);
    let body: Value = updated.json().await.unwrap();
    assert!(body.get("errors").is_none());

    server.stop().await;
}

#[tokio::test]
async fn partial_success_is_206() {
    let server = spawn(demo_app()).await;

    let (status, body) = get(&format!("{}/report", server.base)).await;
    assert_eq!(status, 206);
    assert_eq!(body["rows"], 2);
    assert_eq!(body["errors"][0]["code"], "Missing Parameter");

    server.stop().await;
}

#[tokio::test]
async fn routing_misses_are_classified() {
    let server = spawn(demo_app()).await;
    let client = reqwest::Client::new();

    let (status, body) = get(&format!("{}/users/7/", server.base)).await;
    assert_eq!(status, 200);
    assert_eq!(body["id"], 7);

    let response = client
        .delete(format!("{}/users/7", server.base))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 405);
    assert_eq!(response.headers()["allow"], "GET, PUT");

    let (status, body) = get(&format!("{}/nowhere", server.base)).await;
    assert_eq!(status, 404);
    assert_eq!(body["errors"][0]["code"], "Route Not Found");

    let response = client
        .post(format!("{}/.well-known/health", server.base))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 405);

    server.stop().await;
}

#[tokio::test]
async fn panics_are_contained() {
    let server = spawn(demo_app()).await;

    let (status, body) = get(&format!("{}/panic", server.base)).await;
    assert_eq!(status, 500);
    assert_eq!(body["errors"][0]["code"], "Internal Server Error");

    // The server keeps serving.
    let (status, _) = get(&format!("{}/users/1", server.base)).await;
    assert_eq!(status, 200);

    server.stop().await;
}

#[tokio::test]
async fn correlation_id_is_echoed() {
    let server = spawn(demo_app()).await;

    let response = reqwest::Client::new()
        .get(format!("{}/users/1", server.base))
        .header("X-Correlation-Id", "req-123")
        .send()
        .await
        .unwrap();
    assert_eq!(response.headers()["x-correlation-id"], "req-123");

    server.stop().await;
}

#[tokio::test]
async fn readiness_and_liveness() {
    let server = spawn(demo_app()).await;

    let (status, body) = get(&format!("{}/.well-known/alive", server.base)).await;
    assert_eq!(status, 200);
    assert_eq!(body, json!({ "status": "UP" }));

    let (status, body) = get(&format!("{}/.well-known/ready", server.base)).await;
    assert_eq!(status, 200);
    assert_eq!(body["status"], "UP");

    server.stop().await;
}
