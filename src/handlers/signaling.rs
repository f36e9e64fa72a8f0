//! WebRTC 시그널링 중계 핸들러

use crate::handlers::room::broadcast_to_room;
use crate::protocol::{IceCandidate, ServerMessage, SessionDescription};
use crate::state::AppState;
use serde_json::Value;
use std::sync::Arc;

/// 통화 초대 처리
pub async fn handle_invite(
    state: Arc<AppState>,
    from: &str,
    session_id: &str,
    target: &str,
    metadata: Option<Value>,
) {
    let message = ServerMessage::Invite {
        session_id: session_id.to_string(),
        from: from.to_string(),
        metadata,
    };

    if !state.send_to(target, message) {
        state.send_to(
            from,
            ServerMessage::Error {
                code: "PEER_NOT_FOUND".to_string(),
                message: format!("participant {} is not connected", target),
            },
        );
    }

    tracing::info!(from = %from, session_id = %session_id, target = %target, "Relayed invite");
}

/// Offer 처리
pub async fn handle_offer(
    state: Arc<AppState>,
    from: &str,
    session_id: &str,
    description: SessionDescription,
    generation: u32,
    target: Option<&str>,
) {
    let message = ServerMessage::Offer {
        session_id: session_id.to_string(),
        from: from.to_string(),
        description,
        generation,
    };
    route(&state, from, session_id, target, message).await;

    tracing::debug!(from = %from, session_id = %session_id, target = ?target, generation, "Relayed offer");
}

/// Answer 처리
pub async fn handle_answer(
    state: Arc<AppState>,
    from: &str,
    session_id: &str,
    description: SessionDescription,
    generation: u32,
    target: Option<&str>,
) {
    let message = ServerMessage::Answer {
        session_id: session_id.to_string(),
        from: from.to_string(),
        description,
        generation,
    };
    route(&state, from, session_id, target, message).await;

    tracing::debug!(from = %from, session_id = %session_id, target = ?target, generation, "Relayed answer");
}

/// ICE Candidate 처리
pub async fn handle_ice_candidate(
    state: Arc<AppState>,
    from: &str,
    session_id: &str,
    candidate: IceCandidate,
    generation: u32,
    target: Option<&str>,
) {
    let message = ServerMessage::IceCandidate {
        session_id: session_id.to_string(),
        from: from.to_string(),
        candidate,
        generation,
    };
    route(&state, from, session_id, target, message).await;

    tracing::trace!(from = %from, session_id = %session_id, target = ?target, "Relayed ICE candidate");
}

/// 피어 간 하트비트 중계
pub async fn handle_heartbeat(
    state: Arc<AppState>,
    from: &str,
    session_id: &str,
    participant_id: &str,
    timestamp: u64,
    target: Option<&str>,
) {
    let message = ServerMessage::Heartbeat {
        session_id: session_id.to_string(),
        from: from.to_string(),
        participant_id: participant_id.to_string(),
        timestamp,
    };
    route(&state, from, session_id, target, message).await;
}

/// 하트비트 타임아웃 통지 중계
pub async fn handle_heartbeat_timeout(
    state: Arc<AppState>,
    from: &str,
    session_id: &str,
    target: Option<&str>,
) {
    let message = ServerMessage::HeartbeatTimeout {
        session_id: session_id.to_string(),
        from: from.to_string(),
    };
    route(&state, from, session_id, target, message).await;

    tracing::info!(from = %from, session_id = %session_id, target = ?target, "Relayed heartbeat timeout");
}

/// 세션 종료 처리
///
/// target 이 없으면 방 전체에 한 번만 브로드캐스트한다.
pub async fn handle_terminate(
    state: Arc<AppState>,
    from: &str,
    session_id: &str,
    reason: &str,
    target: Option<&str>,
) {
    let message = ServerMessage::Terminate {
        session_id: session_id.to_string(),
        from: from.to_string(),
        reason: reason.to_string(),
    };
    route(&state, from, session_id, target, message).await;

    tracing::info!(
        from = %from,
        session_id = %session_id,
        target = ?target,
        reason = %reason,
        "Relayed terminate"
    );
}

/// 시청자 수 브로드캐스트
pub async fn handle_viewer_count(state: Arc<AppState>, from: &str, session_id: &str, count: usize) {
    let message = ServerMessage::ViewerCount {
        session_id: session_id.to_string(),
        count,
    };
    broadcast_to_room(&state, session_id, Some(from), message).await;
}

/// target 이 있으면 직접 전송, 없으면 보낸 사람을 제외한 방 전체에 전송
async fn route(
    state: &AppState,
    from: &str,
    session_id: &str,
    target: Option<&str>,
    message: ServerMessage,
) {
    match target {
        Some(target_id) => {
            if !state.send_to(target_id, message) {
                tracing::debug!(
                    from = %from,
                    session_id = %session_id,
                    target = %target_id,
                    "Target not connected, message dropped"
                );
            }
        }
        None => {
            broadcast_to_room(state, session_id, Some(from), message).await;
        }
    }
}
