use std::sync::Arc;

use jiff::tz::TimeZone;
use serde_json::{Value, json};
use showclock::{
    api::build_router,
    clock::ManualClock,
    engine::{Engine, EngineSettings},
    rundown::{CustomFields, Entry, Event, Rundown},
};

const NINE: i64 = 9 * 3_600_000;

/// Spin up the HTTP server on an OS-assigned port, returning the base URL.
async fn spawn_test_server() -> String {
    let clock = Arc::new(ManualClock::new(TimeZone::UTC, "2024-05-01T09:00:00Z".parse().unwrap()));
    let rundown = Rundown::from_entries([Entry::Event(Event::new("a", NINE, NINE + 600_000))]);
    let engine = Engine::new(clock, rundown, CustomFields::new(), EngineSettings::default());
    let app = build_router(engine.into_shared());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://127.0.0.1:{port}")
}

#[tokio::test]
async fn state_starts_stopped() {
    let base = spawn_test_server().await;
    let body: Value = reqwest::get(format!("{base}/api/state"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["timer"]["playback"], "stop");
    assert_eq!(body["eventNow"], Value::Null);
}

#[tokio::test]
async fn load_and_start() {
    let base = spawn_test_server().await;
    let client = reqwest::Client::new();

    let resp = client.post(format!("{base}/api/load/a")).send().await.unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["timer"]["playback"], "armed");
    assert_eq!(body["timer"]["current"], 600_000);

    let resp = client.post(format!("{base}/api/start")).send().await.unwrap();
    assert_eq!(resp.status(), 200);

    let resp = client.post(format!("{base}/api/addtime/-1000")).send().await.unwrap();
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["timer"]["addedTime"], -1000);
}

#[tokio::test]
async fn rejected_operations_conflict() {
    let base = spawn_test_server().await;
    let client = reqwest::Client::new();

    let resp = client.post(format!("{base}/api/pause")).send().await.unwrap();
    assert_eq!(resp.status(), 409);

    let resp = client.post(format!("{base}/api/load/nope")).send().await.unwrap();
    assert_eq!(resp.status(), 409);
}

#[tokio::test]
async fn replace_rundown_reports_warnings() {
    let base = spawn_test_server().await;
    let rundown = json!({
        "order": ["b", "ghost"],
        "entries": {
            "b": { "type": "event", "id": "b", "timeStart": 0, "timeEnd": 60000, "duration": 60000 }
        }
    });
    let resp = reqwest::Client::new()
        .put(format!("{base}/api/rundown"))
        .json(&rundown)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["revision"], 1);
    assert_eq!(body["warnings"].as_array().map(Vec::len), Some(1));
}
