//! HTTP and WebSocket surface.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use skyrelay_fc::actions::{CommandError, Commander};
use skyrelay_hub::{SampleSink, SinkClosed, TelemetryHub};
use skyrelay_video::camera::CameraSource;
use skyrelay_video::stream::{self, frame_stream};
use tracing::{info, warn};

const DEFAULT_TAKEOFF_ALT_M: f32 = 10.0;

#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<TelemetryHub>,
    pub commander: Commander,
    /// `None` when video is disabled in config.
    pub camera: Option<Arc<CameraSource>>,
    pub api_key: Arc<str>,
    pub frame_interval: Duration,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ws", get(telemetry_ws))
        .route("/api/v1/status", get(status))
        .route("/api/v1/command/arm", post(arm))
        .route("/api/v1/command/disarm", post(disarm))
        .route("/api/v1/command/takeoff", post(takeoff))
        .route("/api/v1/command/land", post(land))
        .route("/api/v1/video/stream", get(video_stream))
        .route("/api/v1/video/status", get(video_status))
        .route("/api/v1/video/camera/{name}", post(switch_camera))
        .with_state(state)
}

fn error(code: StatusCode, msg: impl Into<String>) -> Response {
    (code, Json(json!({ "status": "error", "detail": msg.into() }))).into_response()
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn status(State(app): State<AppState>) -> Response {
    Json(app.hub.status()).into_response()
}

// ---------------------------------------------------------------------------
// Telemetry WebSocket
// ---------------------------------------------------------------------------

async fn telemetry_ws(ws: WebSocketUpgrade, State(app): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| telemetry_socket(socket, app.hub))
}

struct WsSink(SplitSink<WebSocket, Message>);

#[async_trait]
impl SampleSink for WsSink {
    async fn send(&mut self, json: String) -> Result<(), SinkClosed> {
        self.0.send(Message::Text(json.into())).await.map_err(|e| SinkClosed(e.to_string()))
    }
}

async fn wait_for_close(rx: &mut SplitStream<WebSocket>) {
    loop {
        match rx.next().await {
            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return,
            // inbound messages are ignored
            Some(Ok(_)) => {}
        }
    }
}

async fn telemetry_socket(socket: WebSocket, hub: Arc<TelemetryHub>) {
    let (tx, mut rx) = socket.split();
    let mut sink = WsSink(tx);
    tokio::select! {
        _ = hub.serve(&mut sink) => {}
        _ = wait_for_close(&mut rx) => info!("gateway: websocket client closed"),
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct CommandQuery {
    pub token: Option<String>,
    pub altitude_m: Option<f32>,
}

enum Action {
    Arm,
    Disarm,
    Takeoff(f32),
    Land,
}

async fn dispatch(app: &AppState, q: &CommandQuery, action: Action) -> Response {
    if q.token.as_deref() != Some(&*app.api_key) {
        warn!("gateway: command refused, bad token");
        return (StatusCode::UNAUTHORIZED, Json(json!({ "detail": "Invalid API key" }))).into_response();
    }

    let (result, done) = match action {
        Action::Arm => (app.commander.arm().await, "Arming drone".to_string()),
        Action::Disarm => (app.commander.disarm().await, "Disarming drone".to_string()),
        Action::Takeoff(alt) => (app.commander.takeoff(alt).await, format!("Taking off to {:?}m", alt)),
        Action::Land => (app.commander.land().await, "Landing drone".to_string()),
    };

    match result {
        Ok(()) => Json(json!({ "status": "ok", "detail": done })).into_response(),
        Err(e) => {
            warn!("gateway: command failed: {}", e);
            match e {
                CommandError::NotConnected => error(StatusCode::SERVICE_UNAVAILABLE, "Drone not connected"),
                CommandError::Link(_) => error(StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
                CommandError::Rejected(_) | CommandError::Timeout(..) => error(StatusCode::BAD_REQUEST, e.to_string()),
            }
        }
    }
}

async fn arm(State(app): State<AppState>, Query(q): Query<CommandQuery>) -> Response {
    dispatch(&app, &q, Action::Arm).await
}

async fn disarm(State(app): State<AppState>, Query(q): Query<CommandQuery>) -> Response {
    dispatch(&app, &q, Action::Disarm).await
}

async fn takeoff(State(app): State<AppState>, Query(q): Query<CommandQuery>) -> Response {
    let alt = q.altitude_m.unwrap_or(DEFAULT_TAKEOFF_ALT_M);
    dispatch(&app, &q, Action::Takeoff(alt)).await
}

async fn land(State(app): State<AppState>, Query(q): Query<CommandQuery>) -> Response {
    dispatch(&app, &q, Action::Land).await
}

// ---------------------------------------------------------------------------
// Video
// ---------------------------------------------------------------------------

async fn video_stream(State(app): State<AppState>) -> Response {
    let Some(camera) = app.camera.clone() else {
        return error(StatusCode::SERVICE_UNAVAILABLE, "Video streaming disabled");
    };
    if !camera.is_connected() && !camera.connect().await {
        return error(StatusCode::SERVICE_UNAVAILABLE, "Simulator not connected");
    }

    info!("gateway: video viewer attached");
    let frames = frame_stream(camera, app.frame_interval).map(Ok::<_, Infallible>);
    ([(header::CONTENT_TYPE, stream::CONTENT_TYPE)], Body::from_stream(frames)).into_response()
}

async fn video_status(State(app): State<AppState>) -> Response {
    match &app.camera {
        Some(camera) => Json(camera.status()).into_response(),
        None => Json(json!({ "connected": false, "camera": null })).into_response(),
    }
}

async fn switch_camera(State(app): State<AppState>, Path(name): Path<String>) -> Response {
    let Some(camera) = &app.camera else {
        return error(StatusCode::SERVICE_UNAVAILABLE, "Video streaming disabled");
    };
    if camera.switch_camera(&name) {
        Json(json!({ "status": "ok", "camera": name })).into_response()
    } else {
        error(StatusCode::BAD_REQUEST, "Invalid camera name")
    }
}
