//! 릴레이 상태 관리

use crate::config::Config;
use crate::protocol::ServerMessage;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc::UnboundedSender, RwLock};
use uuid::Uuid;

/// 전역 릴레이 상태
pub struct AppState {
    /// 방 정보 (session_id -> Room)
    pub rooms: DashMap<String, Arc<Room>>,
    /// 참가자 연결 (participant_id -> PeerSession)
    pub peers: DashMap<String, Arc<PeerSession>>,
    /// 설정
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        Self {
            rooms: DashMap::new(),
            peers: DashMap::new(),
            config: Arc::new(config),
        }
    }

    /// 방 멤버 목록 (없으면 빈 목록)
    pub async fn room_members(&self, session_id: &str) -> Vec<String> {
        match self.room(session_id) {
            Some(room) => room.members.read().await.iter().cloned().collect(),
            None => Vec::new(),
        }
    }

    /// 방 핸들 복제 (DashMap 가드를 await 너머로 들고 가지 않기 위해)
    pub fn room(&self, session_id: &str) -> Option<Arc<Room>> {
        self.rooms.get(session_id).map(|room| Arc::clone(room.value()))
    }

    pub fn peer(&self, participant_id: &str) -> Option<Arc<PeerSession>> {
        self.peers.get(participant_id).map(|peer| Arc::clone(peer.value()))
    }

    /// 특정 참가자에게 메시지 전송
    pub fn send_to(&self, participant_id: &str, message: ServerMessage) -> bool {
        match self.peers.get(participant_id) {
            Some(peer) => peer.sender.send(message).is_ok(),
            None => false,
        }
    }
}

/// 방 정보
pub struct Room {
    pub id: String,
    pub members: RwLock<HashSet<String>>,
    pub created_at: Instant,
}

impl Room {
    pub fn new(id: String) -> Self {
        Self {
            id,
            members: RwLock::new(HashSet::new()),
            created_at: Instant::now(),
        }
    }
}

/// 참가자 연결 정보
pub struct PeerSession {
    pub id: String,
    /// 같은 참가자 ID 로 재접속했을 때 이전 연결의 정리 작업을 구분한다
    pub connection_id: Uuid,
    pub rooms: RwLock<HashSet<String>>,
    pub sender: UnboundedSender<ServerMessage>,
    pub connected_at: Instant,
}
