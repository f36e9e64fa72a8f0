//! 애플리케이션으로 전달되는 세션 이벤트

use crate::engine::session::SessionState;
use crate::error::ErrorKind;
use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    IncomingCall {
        session_id: String,
        from: String,
        metadata: Option<Value>,
    },
    StateChanged {
        session_id: String,
        remote: Option<String>,
        state: SessionState,
    },
    /// 협상 완료. 반환값이 아니라 이벤트로만 알린다.
    Connected {
        session_id: String,
        remote: Option<String>,
    },
    Closed {
        session_id: String,
        remote: Option<String>,
        reason: String,
    },
    Failed {
        session_id: String,
        remote: Option<String>,
        kind: ErrorKind,
    },
    ViewerCount {
        session_id: String,
        count: usize,
    },
    /// 시그널링 채널 끊김 (클라이언트당 한 번)
    ChannelUnavailable,
}

impl SessionEvent {
    pub fn session_id(&self) -> Option<&str> {
        match self {
            SessionEvent::IncomingCall { session_id, .. }
            | SessionEvent::StateChanged { session_id, .. }
            | SessionEvent::Connected { session_id, .. }
            | SessionEvent::Closed { session_id, .. }
            | SessionEvent::Failed { session_id, .. }
            | SessionEvent::ViewerCount { session_id, .. } => Some(session_id),
            SessionEvent::ChannelUnavailable => None,
        }
    }
}
