//! 시그널링 채널 추상화
//!
//! 전송은 방/대상 단위로 순서가 보장된다고 가정하지만, 메시지는 유실되거나
//! 중복될 수 있다. 엔진은 이를 상태 머신의 가드와 지문 캐시로 흡수한다.

use crate::error::ChannelError;
use crate::handlers;
use crate::protocol::{ClientMessage, ServerMessage};
use crate::server;
use crate::state::AppState;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// 릴레이와 연결된 양방향 시그널링 채널
pub trait SignalingChannel: Send + Sync {
    /// 릴레이가 인정한 내 참가자 ID
    fn participant_id(&self) -> &str;

    fn send(&self, message: ClientMessage) -> Result<(), ChannelError>;

    /// 수신 스트림 (한 번만 꺼낼 수 있다). 스트림이 끝나면 채널이 끊긴 것이다.
    fn take_events(&self) -> Option<UnboundedReceiver<ServerMessage>>;
}

type DropFilter = Box<dyn Fn(&ClientMessage) -> bool + Send + Sync>;

/// 프로세스 내 릴레이(`AppState`)에 직접 붙는 채널
///
/// WebSocket 서버와 같은 `server::dispatch` 경로를 타므로 릴레이 동작이 동일하다.
pub struct MemoryChannel {
    participant_id: String,
    connection_id: Uuid,
    state: Arc<AppState>,
    outbound: UnboundedSender<ClientMessage>,
    events: Mutex<Option<UnboundedReceiver<ServerMessage>>>,
    drop_filter: RwLock<Option<DropFilter>>,
    forwarder: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl MemoryChannel {
    pub async fn connect(state: Arc<AppState>, participant_id: &str) -> Arc<Self> {
        let (server_tx, mut server_rx) = mpsc::unbounded_channel::<ServerMessage>();
        let (participant_id, connection_id) =
            handlers::handle_connection(state.clone(), Some(participant_id.to_string()), server_tx.clone())
                .await;

        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<ClientMessage>();
        let relay_state = state.clone();
        let sender_id = participant_id.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(msg) = outbound_rx.recv().await {
                server::dispatch(&relay_state, &sender_id, &server_tx, msg).await;
            }
        });

        // Connected 메시지는 여기서 소비한다
        let _ = server_rx.try_recv();

        Arc::new(Self {
            participant_id,
            connection_id,
            state,
            outbound,
            events: Mutex::new(Some(server_rx)),
            drop_filter: RwLock::new(None),
            forwarder: Mutex::new(Some(forwarder)),
            closed: AtomicBool::new(false),
        })
    }

    /// 조건에 맞는 송신 메시지를 조용히 버린다 (유실 시뮬레이션)
    pub fn set_drop_filter<F>(&self, filter: F)
    where
        F: Fn(&ClientMessage) -> bool + Send + Sync + 'static,
    {
        if let Ok(mut guard) = self.drop_filter.write() {
            *guard = Some(Box::new(filter));
        }
    }

    pub fn clear_drop_filter(&self) {
        if let Ok(mut guard) = self.drop_filter.write() {
            *guard = None;
        }
    }

    /// 릴레이에서 연결 해제. 수신 스트림이 끝난다.
    pub async fn disconnect(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let forwarder = self.forwarder.lock().ok().and_then(|mut f| f.take());
        if let Some(task) = forwarder {
            task.abort();
        }
        handlers::handle_disconnect(self.state.clone(), &self.participant_id, self.connection_id)
            .await;
    }
}

impl SignalingChannel for MemoryChannel {
    fn participant_id(&self) -> &str {
        &self.participant_id
    }

    fn send(&self, message: ClientMessage) -> Result<(), ChannelError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ChannelError::Closed);
        }
        let dropped = self
            .drop_filter
            .read()
            .ok()
            .map(|guard| guard.as_ref().map(|f| f(&message)).unwrap_or(false))
            .unwrap_or(false);
        if dropped {
            tracing::trace!(participant_id = %self.participant_id, ?message, "Dropping outbound message");
            return Ok(());
        }
        self.outbound.send(message).map_err(|_| ChannelError::Closed)
    }

    fn take_events(&self) -> Option<UnboundedReceiver<ServerMessage>> {
        self.events.lock().ok().and_then(|mut events| events.take())
    }
}

impl Drop for MemoryChannel {
    fn drop(&mut self) {
        if let Ok(mut forwarder) = self.forwarder.lock() {
            if let Some(task) = forwarder.take() {
                task.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[tokio::test]
    async fn memory_channel_round_trips_through_relay() {
        let state = Arc::new(AppState::new(Config::default()));
        let alice = MemoryChannel::connect(state.clone(), "alice").await;
        let mut events = alice.take_events().unwrap();
        assert!(alice.take_events().is_none());

        alice
            .send(ClientMessage::RoomJoin {
                session_id: "s1".into(),
            })
            .unwrap();

        assert_eq!(
            events.recv().await,
            Some(ServerMessage::RoomJoined {
                session_id: "s1".into(),
                participant_id: "alice".into(),
                members: vec![],
            })
        );
    }

    #[tokio::test]
    async fn drop_filter_swallows_matching_messages() {
        let state = Arc::new(AppState::new(Config::default()));
        let alice = MemoryChannel::connect(state.clone(), "alice").await;
        let mut events = alice.take_events().unwrap();

        alice.set_drop_filter(|msg| matches!(msg, ClientMessage::Ping));
        alice.send(ClientMessage::Ping).unwrap();
        alice.clear_drop_filter();
        alice.send(ClientMessage::Ping).unwrap();

        assert_eq!(events.recv().await, Some(ServerMessage::Pong));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn disconnect_ends_event_stream() {
        let state = Arc::new(AppState::new(Config::default()));
        let alice = MemoryChannel::connect(state.clone(), "alice").await;
        let mut events = alice.take_events().unwrap();

        alice.disconnect().await;

        assert_eq!(events.recv().await, None);
        assert!(alice.send(ClientMessage::Ping).is_err());
    }
}
