// HTTP surface: the `/ws` upgrade endpoint and a small health probe.
//
// The embedding bootstrap provisions the engine workers, builds the
// `ConferenceManager` and serves the router returned here; everything from
// the upgrade onward is owned by this crate.

use axum::extract::ws::WebSocket;
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{error, info};

use crate::manager::ConferenceManager;
use crate::transport::{SignalTransport, WebSocketTransport};

/// Build the signaling router around `manager`.
pub fn router(manager: Arc<ConferenceManager>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(manager)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConnectParams {
    room_id: String,
    peer_id: String,
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    State(manager): State<Arc<ConferenceManager>>,
) -> Response {
    if params.room_id.is_empty() || params.peer_id.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            "roomId and peerId query parameters are required",
        )
            .into_response();
    }

    ws.on_upgrade(move |socket| handle_socket(socket, params, manager))
}

async fn handle_socket(
    socket: WebSocket,
    params: ConnectParams,
    manager: Arc<ConferenceManager>,
) {
    info!(room = %params.room_id, peer = %params.peer_id, "new websocket connection");

    let transport = WebSocketTransport::new(socket);
    match manager.create_or_get_conference(&params.room_id).await {
        Ok(conference) => conference.handle_new_peer(&params.peer_id, transport),
        Err(e) => {
            error!(room = %params.room_id, error = %e, "conference unavailable");
            transport.close();
        }
    }
}

async fn health_handler(State(manager): State<Arc<ConferenceManager>>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "conferences": manager.conference_count(),
        "peers": manager.peer_count(),
    }))
}

// ─── Tests ──────────────────────────────────────────────────────────────────
