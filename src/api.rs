//! HTTP control surface over a shared [`Engine`](crate::engine::Engine).

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post, put},
};
use serde::Serialize;
use tower_http::cors::CorsLayer;

use crate::{
    engine::{Engine, SharedEngine},
    rundown::Rundown,
    runtime::RuntimeState,
};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RundownReply {
    pub revision: u64,
    pub warnings: Vec<String>,
}

type Reply = (StatusCode, Json<RuntimeState>);

async fn control(engine: SharedEngine, op: impl FnOnce(&mut Engine) -> bool) -> Reply {
    let mut engine = engine.lock().await;
    let status = if op(&mut *engine) {
        StatusCode::OK
    } else {
        StatusCode::CONFLICT
    };
    (status, Json(engine.get_state()))
}

async fn state(State(engine): State<SharedEngine>) -> Json<RuntimeState> {
    Json(engine.lock().await.get_state())
}

async fn load(State(engine): State<SharedEngine>, Path(id): Path<String>) -> Reply {
    control(engine, |engine| engine.load_event(&id)).await
}

async fn start(State(engine): State<SharedEngine>) -> Reply {
    control(engine, Engine::start).await
}

async fn pause(State(engine): State<SharedEngine>) -> Reply {
    control(engine, Engine::pause).await
}

async fn stop(State(engine): State<SharedEngine>) -> Reply {
    control(engine, Engine::stop).await
}

async fn roll(State(engine): State<SharedEngine>) -> Reply {
    control(engine, Engine::roll).await
}

async fn add_time(State(engine): State<SharedEngine>, Path(millis): Path<i64>) -> Reply {
    control(engine, |engine| engine.add_time(millis)).await
}

async fn replace_rundown(
    State(engine): State<SharedEngine>,
    Json(rundown): Json<Rundown>,
) -> Json<RundownReply> {
    let mut engine = engine.lock().await;
    let warnings = engine.replace_rundown(rundown);
    Json(RundownReply {
        revision: engine.processed().rundown.revision,
        warnings: warnings.iter().map(ToString::to_string).collect(),
    })
}

pub fn build_router(engine: SharedEngine) -> Router {
    Router::new()
        .route("/api/state", get(state))
        .route("/api/load/{id}", post(load))
        .route("/api/start", post(start))
        .route("/api/pause", post(pause))
        .route("/api/stop", post(stop))
        .route("/api/roll", post(roll))
        .route("/api/addtime/{millis}", post(add_time))
        .route("/api/rundown", put(replace_rundown))
        .layer(CorsLayer::permissive())
        .with_state(engine)
}
