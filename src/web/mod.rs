use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::command::ControlCommand;
use crate::command::router::{CommandRouter, SendOptions};
use crate::device::registry::DeviceRegistry;
use crate::error::ApiError;
use crate::hub::FanoutHub;
use crate::rules::store::RulesStore;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<DeviceRegistry>,
    pub rules: Arc<RulesStore>,
    pub router: Arc<CommandRouter>,
    pub hub: Arc<FanoutHub>,
    pub command_timeout: Duration,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health_check))
        .route("/api/last", get(last_readings))
        .route("/api/history/:device_id", get(device_history))
        .route("/api/rules", get(list_rules))
        .route("/api/control", post(send_control))
        .route("/ws", get(websocket_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(state: AppState, port: u16) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!("HTTP listening on {}", listener.local_addr()?);
    axum::serve(listener, create_router(state)).await
}

async fn health_check(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "ok": true,
        "devices": state.registry.len().await,
        "subscribers": state.hub.subscriber_count().await,
        "pendingCommands": state.router.in_flight(),
    }))
}

/// Point-in-time device snapshot, no subscription.
async fn last_readings(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "devices": state.registry.snapshot().await }))
}

async fn device_history(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let readings = state
        .registry
        .history(&device_id)
        .await
        .ok_or_else(|| ApiError::NotFound(device_id.clone()))?;
    Ok(Json(json!({ "deviceId": device_id, "readings": readings })))
}

async fn list_rules(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "rules": state.rules.snapshot().await }))
}

/// `{deviceId, cmd, ...fields}` → publish and wait for the transport ack.
async fn send_control(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let (device_id, command) = ControlCommand::from_request(body)?;
    let ack = state
        .router
        .send(&device_id, &command, SendOptions::acked(state.command_timeout))
        .await?;
    Ok(Json(json!({
        "ok": true,
        "topic": ack.topic,
        "payload": ack.payload,
    })))
}

async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_websocket(socket, state.hub))
}

async fn handle_websocket(socket: WebSocket, hub: Arc<FanoutHub>) {
    let (mut sender, mut receiver) = socket.split();
    let (conn_id, mut rx) = hub.join().await;

    let send_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if sender.send(Message::Text(frame)).await.is_err() {
                break;
            }
        }
    });

    let recv_hub = hub.clone();
    let recv_task = tokio::spawn(async move {
        while let Some(result) = receiver.next().await {
            match result {
                Ok(Message::Text(text)) => {
                    // Requests may wait on acks; answer them concurrently.
                    let hub = recv_hub.clone();
                    tokio::spawn(async move { hub.handle_frame(conn_id, &text).await });
                }
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    warn!("WebSocket error on {}: {}", conn_id, e);
                    break;
                }
            }
        }
    });

    tokio::select! {
        _ = send_task => debug!("Send side of {} closed", conn_id),
        _ = recv_task => debug!("Receive side of {} closed", conn_id),
    }

    hub.leave(&conn_id).await;
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::command::router::tests::Transport;
    use crate::device::codec::decode;
    use crate::hub::tests::{Fixture, fixture};

    fn state(f: &Fixture) -> AppState {
        AppState {
            registry: f.registry.clone(),
            rules: f.rules.clone(),
            router: f.router.clone(),
            hub: f.hub.clone(),
            command_timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn last_returns_device_snapshot() {
        let f = fixture(Transport::Accept);
        f.registry
            .apply(decode("farm/node-1/sensor", br#"{"temperature":30.5}"#, 10).unwrap())
            .await;

        let Json(body) = last_readings(State(state(&f))).await;
        assert_eq!(
            body,
            json!({"devices":[{
                "deviceId":"node-1",
                "latest":{"deviceId":"node-1","temperature":30.5,"receivedAt":10},
                "online":true,
                "lastSeenAt":10
            }]})
        );
    }

    #[tokio::test]
    async fn control_publishes_and_echoes_payload() {
        let mut f = fixture(Transport::Accept);
        let Json(body) = send_control(
            State(state(&f)),
            Json(json!({"deviceId":"node-1","cmd":"setMode","mode":"manual"})),
        )
        .await
        .unwrap();

        assert_eq!(
            body,
            json!({"ok":true,"topic":"farm/node-1/control","payload":{"cmd":"setMode","mode":"manual"}})
        );
        assert_eq!(f.published.recv().await.unwrap().topic, "farm/node-1/control");
    }

    #[tokio::test]
    async fn control_without_device_is_bad_request() {
        let f = fixture(Transport::Accept);
        let err = send_control(State(state(&f)), Json(json!({"cmd":"setPump","pump":true})))
            .await
            .unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn control_publish_failure_is_bad_gateway() {
        let f = fixture(Transport::Reject);
        let err = send_control(
            State(state(&f)),
            Json(json!({"deviceId":"node-1","cmd":"setPump","pump":true})),
        )
        .await
        .unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn history_and_rules_listing() {
        let f = fixture(Transport::Accept);
        for at in [1, 2] {
            f.registry
                .apply(decode("farm/node-1/sensor", br#"{"light":5}"#, at).unwrap())
                .await;
        }
        f.rules.save("node-1", &json!([])).await.unwrap();

        let Json(history) = device_history(State(state(&f)), Path("node-1".into()))
            .await
            .unwrap();
        assert_eq!(history["readings"].as_array().unwrap().len(), 2);

        let err = device_history(State(state(&f)), Path("ghost".into()))
            .await
            .unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::NOT_FOUND);

        let Json(rules) = list_rules(State(state(&f))).await;
        assert_eq!(rules["rules"][0]["deviceId"], "node-1");

        let Json(health) = health_check(State(state(&f))).await;
        assert_eq!(health, json!({"ok":true,"devices":1,"subscribers":0,"pendingCommands":0}));
    }
}
