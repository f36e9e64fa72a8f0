//! 방 관리 핸들러

use crate::protocol::ServerMessage;
use crate::state::{AppState, Room};
use std::sync::Arc;
use std::time::Instant;

/// 방 참여 처리
pub async fn handle_room_join(state: Arc<AppState>, participant_id: &str, session_id: &str) {
    let session_id = session_id.trim().to_string();
    let max_size = state.config.room.max_size;

    // DashMap 엔트리 가드는 이 문장 안에서 해제된다
    let room = Arc::clone(
        state
            .rooms
            .entry(session_id.clone())
            .or_insert_with(|| {
                tracing::info!(session_id = %session_id, "Room created");
                Arc::new(Room::new(session_id.clone()))
            })
            .value(),
    );

    let (existing_members, newly_joined) = {
        let mut members = room.members.write().await;

        // 이미 방에 있는 참가자의 재입장은 인원 제한과 무관하게 허용
        if members.len() >= max_size && !members.contains(participant_id) {
            drop(members);
            state.send_to(
                participant_id,
                ServerMessage::RoomFull {
                    session_id: session_id.clone(),
                },
            );
            tracing::warn!(session_id = %session_id, participant_id = %participant_id, "Room full, rejected join");
            return;
        }

        let existing: Vec<String> = members
            .iter()
            .filter(|id| id.as_str() != participant_id)
            .cloned()
            .collect();
        let newly_joined = members.insert(participant_id.to_string());
        (existing, newly_joined)
    };

    if let Some(peer) = state.peer(participant_id) {
        peer.rooms.write().await.insert(session_id.clone());
    }

    // 입장 확인 (offer 전송 전에 반드시 필요)
    state.send_to(
        participant_id,
        ServerMessage::RoomJoined {
            session_id: session_id.clone(),
            participant_id: participant_id.to_string(),
            members: existing_members.clone(),
        },
    );

    // 기존 멤버들에게 새 참가자 알림
    if newly_joined {
        for member in &existing_members {
            state.send_to(
                member,
                ServerMessage::PeerJoined {
                    session_id: session_id.clone(),
                    participant_id: participant_id.to_string(),
                },
            );
        }
    }

    tracing::info!(
        participant_id = %participant_id,
        session_id = %session_id,
        member_count = existing_members.len() + 1,
        "Participant joined room"
    );
}

/// 방 나가기 내부 로직
pub async fn leave_room_internal(state: &AppState, participant_id: &str, session_id: &str) {
    let Some(room) = state.room(session_id) else {
        return;
    };

    let (removed, remaining) = {
        let mut members = room.members.write().await;
        let removed = members.remove(participant_id);
        (removed, members.iter().cloned().collect::<Vec<String>>())
    };

    if removed {
        for member in &remaining {
            state.send_to(
                member,
                ServerMessage::PeerLeft {
                    session_id: session_id.to_string(),
                    participant_id: participant_id.to_string(),
                },
            );
        }

        tracing::info!(
            participant_id = %participant_id,
            session_id = %session_id,
            remaining = remaining.len(),
            "Participant left room"
        );
    }

    if remaining.is_empty() {
        // 그 사이 다른 참가자가 들어왔을 수 있으므로 비어있을 때만 제거
        let deleted = state
            .rooms
            .remove_if(session_id, |_, room| {
                room.members.try_read().map(|m| m.is_empty()).unwrap_or(false)
            })
            .is_some();
        if deleted {
            tracing::info!(session_id = %session_id, "Room deleted");
        }
    }
}

/// 방 나가기 처리
pub async fn handle_room_leave(state: Arc<AppState>, participant_id: &str, session_id: &str) {
    leave_room_internal(&state, participant_id, session_id).await;
    if let Some(peer) = state.peer(participant_id) {
        peer.rooms.write().await.remove(session_id);
    }
}

/// 방에 메시지 브로드캐스트 (except 참가자 제외)
pub async fn broadcast_to_room(
    state: &AppState,
    session_id: &str,
    except: Option<&str>,
    message: ServerMessage,
) -> usize {
    let members = state.room_members(session_id).await;
    let mut delivered = 0;
    for member in members.iter().filter(|m| Some(m.as_str()) != except) {
        if state.send_to(member, message.clone()) {
            delivered += 1;
        }
    }
    delivered
}

/// 오래된 방 정리
pub async fn cleanup_old_rooms(state: Arc<AppState>) {
    let timeout_ms = state.config.room.timeout_ms;
    let now = Instant::now();
    let mut deleted = 0;

    state.rooms.retain(|session_id, room| {
        let age = now.duration_since(room.created_at).as_millis() as u64;
        if age > timeout_ms {
            tracing::info!(session_id = %session_id, room = %room.id, age_ms = age, "Cleaned up old room");
            deleted += 1;
            false
        } else {
            true
        }
    });

    if deleted > 0 {
        tracing::info!(deleted_rooms = deleted, "Cleanup completed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, RoomConfig};
    use crate::handlers::connection::handle_connection;
    use tokio::sync::mpsc;

    fn state_with_room_size(max_size: usize) -> Arc<AppState> {
        Arc::new(AppState::new(Config {
            room: RoomConfig {
                max_size,
                ..RoomConfig::default()
            },
            ..Config::default()
        }))
    }

    #[tokio::test]
    async fn join_confirms_and_notifies_existing_members() {
        let state = state_with_room_size(8);
        let (alice_tx, mut alice_rx) = mpsc::unbounded_channel();
        let (bob_tx, mut bob_rx) = mpsc::unbounded_channel();
        handle_connection(state.clone(), Some("alice".into()), alice_tx).await;
        handle_connection(state.clone(), Some("bob".into()), bob_tx).await;
        let _ = alice_rx.recv().await;
        let _ = bob_rx.recv().await;

        handle_room_join(state.clone(), "alice", "s1").await;
        handle_room_join(state.clone(), "bob", "s1").await;

        assert_eq!(
            alice_rx.recv().await,
            Some(ServerMessage::RoomJoined {
                session_id: "s1".into(),
                participant_id: "alice".into(),
                members: vec![],
            })
        );
        assert_eq!(
            alice_rx.recv().await,
            Some(ServerMessage::PeerJoined {
                session_id: "s1".into(),
                participant_id: "bob".into(),
            })
        );
        assert_eq!(
            bob_rx.recv().await,
            Some(ServerMessage::RoomJoined {
                session_id: "s1".into(),
                participant_id: "bob".into(),
                members: vec!["alice".into()],
            })
        );
    }

    #[tokio::test]
    async fn full_room_rejects_newcomers_but_not_rejoins() {
        let state = state_with_room_size(1);
        let (alice_tx, mut alice_rx) = mpsc::unbounded_channel();
        let (bob_tx, mut bob_rx) = mpsc::unbounded_channel();
        handle_connection(state.clone(), Some("alice".into()), alice_tx).await;
        handle_connection(state.clone(), Some("bob".into()), bob_tx).await;
        let _ = alice_rx.recv().await;
        let _ = bob_rx.recv().await;

        handle_room_join(state.clone(), "alice", "s1").await;
        handle_room_join(state.clone(), "bob", "s1").await;
        handle_room_join(state.clone(), "alice", "s1").await;

        assert!(matches!(alice_rx.recv().await, Some(ServerMessage::RoomJoined { .. })));
        assert!(matches!(alice_rx.recv().await, Some(ServerMessage::RoomJoined { .. })));
        assert_eq!(
            bob_rx.recv().await,
            Some(ServerMessage::RoomFull {
                session_id: "s1".into()
            })
        );
    }

    #[tokio::test]
    async fn last_member_leaving_deletes_room() {
        let state = state_with_room_size(8);
        let (tx, _rx) = mpsc::unbounded_channel();
        handle_connection(state.clone(), Some("alice".into()), tx).await;

        handle_room_join(state.clone(), "alice", "s1").await;
        assert!(state.rooms.contains_key("s1"));

        handle_room_leave(state.clone(), "alice", "s1").await;
        assert!(!state.rooms.contains_key("s1"));
        assert!(state.peer("alice").unwrap().rooms.read().await.is_empty());
    }
}
