//! 릴레이 HTTP/WebSocket 서버

use crate::handlers;
use crate::protocol::{ClientMessage, ServerMessage};
use crate::state::AppState;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::HeaderValue,
    response::{Html, IntoResponse, Json},
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// WebSocket 접속 파라미터
#[derive(Debug, Default, Deserialize)]
pub struct ConnectParams {
    pub participant_id: Option<String>,
}

/// 라우터 구성
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/health", get(health_handler))
        .route("/ws", get(ws_handler))
        .layer(cors_layer(&state.config.cors_origins))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if origins.is_empty() || origins.iter().any(|o| o == "*") {
        return layer.allow_origin(Any);
    }

    let parsed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| match o.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(origin = %o, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    layer.allow_origin(parsed)
}

async fn index_handler() -> Html<&'static str> {
    Html("<h1>PonsWarp Session Relay</h1><p>WebSocket endpoint: /ws?participant_id=&lt;id&gt;</p>")
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "server": "ponswarp-session-relay",
        "rooms": state.rooms.len(),
        "participants": state.peers.len(),
        "timestamp": unix_seconds(),
    }))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, params.participant_id))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, requested_id: Option<String>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();

    // 연결 처리
    let (participant_id, connection_id) =
        handlers::handle_connection(state.clone(), requested_id, tx.clone()).await;

    // 송신 태스크
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            match serde_json::to_string(&msg) {
                Ok(json) => {
                    if ws_sender.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
                Err(e) => tracing::error!(error = %e, "Failed to encode server message"),
            }
        }
    });

    // 수신 처리
    while let Some(result) = ws_receiver.next().await {
        match result {
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(msg) => dispatch(&state, &participant_id, &tx, msg).await,
                Err(e) => {
                    tracing::debug!(participant_id = %participant_id, error = %e, "Malformed client message");
                    let _ = tx.send(ServerMessage::Error {
                        code: "BAD_MESSAGE".to_string(),
                        message: e.to_string(),
                    });
                }
            },
            Ok(Message::Close(_)) => break,
            Err(_) => break,
            _ => {}
        }
    }

    // 연결 해제
    handlers::handle_disconnect(state, &participant_id, connection_id).await;
    send_task.abort();
}

/// 클라이언트 메시지 처리
///
/// WebSocket 연결과 프로세스 내 `MemoryChannel` 이 같은 경로를 사용한다.
pub async fn dispatch(
    state: &Arc<AppState>,
    participant_id: &str,
    sender: &mpsc::UnboundedSender<ServerMessage>,
    msg: ClientMessage,
) {
    match msg {
        ClientMessage::Ping => {
            handlers::handle_ping(sender);
        }
        ClientMessage::RoomJoin { session_id } => {
            handlers::handle_room_join(state.clone(), participant_id, &session_id).await;
        }
        ClientMessage::RoomLeave { session_id } => {
            handlers::handle_room_leave(state.clone(), participant_id, &session_id).await;
        }
        ClientMessage::Invite {
            session_id,
            target,
            metadata,
        } => {
            handlers::handle_invite(state.clone(), participant_id, &session_id, &target, metadata)
                .await;
        }
        ClientMessage::Offer {
            session_id,
            description,
            generation,
            target,
        } => {
            handlers::handle_offer(
                state.clone(),
                participant_id,
                &session_id,
                description,
                generation,
                target.as_deref(),
            )
            .await;
        }
        ClientMessage::Answer {
            session_id,
            description,
            generation,
            target,
        } => {
            handlers::handle_answer(
                state.clone(),
                participant_id,
                &session_id,
                description,
                generation,
                target.as_deref(),
            )
            .await;
        }
        ClientMessage::IceCandidate {
            session_id,
            candidate,
            generation,
            target,
        } => {
            handlers::handle_ice_candidate(
                state.clone(),
                participant_id,
                &session_id,
                candidate,
                generation,
                target.as_deref(),
            )
            .await;
        }
        ClientMessage::Heartbeat {
            session_id,
            participant_id: beat_from,
            timestamp,
            target,
        } => {
            handlers::handle_heartbeat(
                state.clone(),
                participant_id,
                &session_id,
                &beat_from,
                timestamp,
                target.as_deref(),
            )
            .await;
        }
        ClientMessage::HeartbeatTimeout { session_id, target } => {
            handlers::handle_heartbeat_timeout(
                state.clone(),
                participant_id,
                &session_id,
                target.as_deref(),
            )
            .await;
        }
        ClientMessage::Terminate {
            session_id,
            reason,
            target,
        } => {
            handlers::handle_terminate(
                state.clone(),
                participant_id,
                &session_id,
                &reason,
                target.as_deref(),
            )
            .await;
        }
        ClientMessage::ViewerCount { session_id, count } => {
            handlers::handle_viewer_count(state.clone(), participant_id, &session_id, count).await;
        }
    }
}

pub(crate) fn unix_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
