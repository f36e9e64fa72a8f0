//! 연결 핸들러

use crate::protocol::ServerMessage;
use crate::state::{AppState, PeerSession};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc::UnboundedSender, RwLock};
use uuid::Uuid;

/// 새 연결 처리
///
/// 요청한 참가자 ID 가 있으면 그대로 쓰고, 없으면 UUID 를 발급한다.
/// 반환값은 (participant_id, connection_id).
pub async fn handle_connection(
    state: Arc<AppState>,
    requested_id: Option<String>,
    sender: UnboundedSender<ServerMessage>,
) -> (String, Uuid) {
    let participant_id = requested_id
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let connection_id = Uuid::new_v4();

    // 같은 ID 로 재접속하면 이전 연결의 방 멤버십을 이어받는다
    let rooms = match state.peers.remove(&participant_id) {
        Some((_, previous)) => {
            tracing::warn!(
                participant_id = %participant_id,
                "Participant reconnected, replacing previous connection"
            );
            previous.rooms.read().await.clone()
        }
        None => HashSet::new(),
    };

    let session = PeerSession {
        id: participant_id.clone(),
        connection_id,
        rooms: RwLock::new(rooms),
        sender: sender.clone(),
        connected_at: Instant::now(),
    };

    state.peers.insert(participant_id.clone(), Arc::new(session));

    let _ = sender.send(ServerMessage::Connected {
        participant_id: participant_id.clone(),
    });

    tracing::info!(participant_id = %participant_id, "New connection established");
    (participant_id, connection_id)
}

/// 연결 해제 처리
pub async fn handle_disconnect(state: Arc<AppState>, participant_id: &str, connection_id: Uuid) {
    // 이미 새 연결로 교체되었다면 건드리지 않는다
    let removed = state
        .peers
        .remove_if(participant_id, |_, session| session.connection_id == connection_id);

    if let Some((_, session)) = removed {
        let rooms: Vec<String> = session.rooms.read().await.iter().cloned().collect();
        for session_id in rooms {
            crate::handlers::room::leave_room_internal(&state, participant_id, &session_id).await;
        }
        tracing::info!(
            participant_id = %participant_id,
            connected_for_ms = session.connected_at.elapsed().as_millis() as u64,
            "Connection closed"
        );
    } else {
        tracing::debug!(participant_id = %participant_id, "Stale connection closed");
    }
}

/// Ping 처리
pub fn handle_ping(sender: &UnboundedSender<ServerMessage>) {
    let _ = sender.send(ServerMessage::Pong);
}
