//! 클라이언트-릴레이 메시지 프로토콜 정의
//!
//! 모든 메시지는 `{"type": "<event>", "payload": {...}}` 형태의 JSON 이며
//! 방(세션) 단위로 라우팅된다.

use serde::{Deserialize, Serialize};

/// SDP 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

impl SdpKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SdpKind::Offer => "offer",
            SdpKind::Answer => "answer",
        }
    }
}

/// 세션 디스크립션 (offer/answer)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn new(kind: SdpKind, sdp: impl Into<String>) -> Self {
        Self {
            kind,
            sdp: sdp.into(),
        }
    }
}

/// ICE 후보
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
        }
    }
}

/// 클라이언트 → 릴레이 메시지
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "payload",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum ClientMessage {
    // Connection
    Ping,

    // Room Management
    RoomJoin {
        session_id: String,
    },
    RoomLeave {
        session_id: String,
    },

    // Call setup
    Invite {
        session_id: String,
        target: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<serde_json::Value>,
    },

    // WebRTC Signaling
    Offer {
        session_id: String,
        description: SessionDescription,
        #[serde(default)]
        generation: u32,
        target: Option<String>,
    },
    Answer {
        session_id: String,
        description: SessionDescription,
        #[serde(default)]
        generation: u32,
        target: Option<String>,
    },
    IceCandidate {
        session_id: String,
        candidate: IceCandidate,
        #[serde(default)]
        generation: u32,
        target: Option<String>,
    },

    // Liveness
    Heartbeat {
        session_id: String,
        participant_id: String,
        timestamp: u64,
        target: Option<String>,
    },
    HeartbeatTimeout {
        session_id: String,
        target: Option<String>,
    },

    // Teardown
    Terminate {
        session_id: String,
        reason: String,
        target: Option<String>,
    },

    // Broadcast
    ViewerCount {
        session_id: String,
        count: usize,
    },
}

/// 릴레이 → 클라이언트 메시지
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "payload",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum ServerMessage {
    // Connection
    Connected {
        participant_id: String,
    },
    Pong,
    Error {
        code: String,
        message: String,
    },

    // Room Events
    RoomJoined {
        session_id: String,
        participant_id: String,
        members: Vec<String>,
    },
    PeerJoined {
        session_id: String,
        participant_id: String,
    },
    PeerLeft {
        session_id: String,
        participant_id: String,
    },
    RoomFull {
        session_id: String,
    },

    // Call setup
    Invite {
        session_id: String,
        from: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<serde_json::Value>,
    },

    // WebRTC Signaling
    Offer {
        session_id: String,
        from: String,
        description: SessionDescription,
        #[serde(default)]
        generation: u32,
    },
    Answer {
        session_id: String,
        from: String,
        description: SessionDescription,
        #[serde(default)]
        generation: u32,
    },
    IceCandidate {
        session_id: String,
        from: String,
        candidate: IceCandidate,
        #[serde(default)]
        generation: u32,
    },

    // Liveness
    Heartbeat {
        session_id: String,
        from: String,
        participant_id: String,
        timestamp: u64,
    },
    HeartbeatTimeout {
        session_id: String,
        from: String,
    },

    // Teardown
    Terminate {
        session_id: String,
        from: String,
        reason: String,
    },

    // Broadcast
    ViewerCount {
        session_id: String,
        count: usize,
    },
}

impl ServerMessage {
    /// 메시지가 속한 세션 ID
    pub fn session_id(&self) -> Option<&str> {
        match self {
            ServerMessage::Connected { .. } | ServerMessage::Pong | ServerMessage::Error { .. } => {
                None
            }
            ServerMessage::RoomJoined { session_id, .. }
            | ServerMessage::PeerJoined { session_id, .. }
            | ServerMessage::PeerLeft { session_id, .. }
            | ServerMessage::RoomFull { session_id }
            | ServerMessage::Invite { session_id, .. }
            | ServerMessage::Offer { session_id, .. }
            | ServerMessage::Answer { session_id, .. }
            | ServerMessage::IceCandidate { session_id, .. }
            | ServerMessage::Heartbeat { session_id, .. }
            | ServerMessage::HeartbeatTimeout { session_id, .. }
            | ServerMessage::Terminate { session_id, .. }
            | ServerMessage::ViewerCount { session_id, .. } => Some(session_id),
        }
    }

    /// 보낸 참가자 ID (릴레이가 찍어준 값)
    pub fn from(&self) -> Option<&str> {
        match self {
            ServerMessage::Invite { from, .. }
            | ServerMessage::Offer { from, .. }
            | ServerMessage::Answer { from, .. }
            | ServerMessage::IceCandidate { from, .. }
            | ServerMessage::Heartbeat { from, .. }
            | ServerMessage::HeartbeatTimeout { from, .. }
            | ServerMessage::Terminate { from, .. } => Some(from),
            _ => None,
        }
    }
}
