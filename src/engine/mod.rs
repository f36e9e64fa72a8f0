//! 클라이언트 측 세션 엔진
//!
//! 시그널링 채널 위에서 세션별 협상 상태 머신, 하트비트, 재연결 감독,
//! 방송 팬아웃을 구동한다.

pub mod broadcast;
pub mod channel;
pub mod client;
pub mod dedup;
pub mod events;
pub mod heartbeat;
pub mod hooks;
pub mod reconnect;
pub mod session;
pub mod transport;
pub mod ws;

#[cfg(test)]
mod testing;

pub use channel::{MemoryChannel, SignalingChannel};
pub use client::SessionClient;
pub use events::SessionEvent;
pub use hooks::{BroadcastMetadata, BroadcastRegistry, Collaborators, JoinAuthorizer};
pub use session::{ParticipantRole, SessionHandle, SessionSnapshot, SessionState, SessionStatus};
pub use transport::{
    ConnectivityState, LocalMedia, MediaConstraints, MediaSource, PeerTransport, TransportEvent,
    TransportFactory, TransportHandle,
};
pub use ws::WsSignalingChannel;
