//! 클라이언트 Facade
//!
//! 모든 호출은 상태 전이를 *시작*시킨 뒤 반환한다. 연결 완료와 실패는
//! `SessionEvent` 로만 알린다.

use crate::config::EngineConfig;
use crate::engine::broadcast::BroadcastCoordinator;
use crate::engine::channel::SignalingChannel;
use crate::engine::events::SessionEvent;
use crate::engine::hooks::{BroadcastMetadata, Collaborators};
use crate::engine::session::{
    self, MediaPlan, ParticipantRole, SessionContext, SessionExit, SessionHandle, SessionParams,
    SessionSnapshot, SessionStatus,
};
use crate::engine::transport::{MediaConstraints, MediaSource, TransportFactory};
use crate::error::{EngineError, EngineResult};
use crate::protocol::{ClientMessage, ServerMessage};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// 수락 대기 중인 수신 통화
struct PendingCall {
    from: String,
    /// 수락 전에 도착한 시그널 (offer, candidate 등)
    buffered: Vec<ServerMessage>,
}

struct ClientInner {
    ctx: SessionContext,
    sessions: DashMap<String, SessionHandle>,
    incoming: DashMap<String, PendingCall>,
    broadcasts: Arc<BroadcastCoordinator>,
    channel_down: AtomicBool,
}

pub struct SessionClient {
    inner: Arc<ClientInner>,
    router: JoinHandle<()>,
}

impl SessionClient {
    pub fn new(
        channel: Arc<dyn SignalingChannel>,
        transports: Arc<dyn TransportFactory>,
        media_source: Arc<dyn MediaSource>,
        config: EngineConfig,
        collaborators: Collaborators,
    ) -> (Self, UnboundedReceiver<SessionEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (exits_tx, exits_rx) = mpsc::unbounded_channel();
        let inbound = channel.take_events();

        let ctx = SessionContext {
            channel,
            transports,
            media_source,
            presets: Arc::new(MediaConstraints::fallback_presets()),
            config,
            events: events_tx,
            exits: exits_tx,
        };

        let inner = Arc::new(ClientInner {
            broadcasts: Arc::new(BroadcastCoordinator::new(ctx.clone(), collaborators)),
            ctx,
            sessions: DashMap::new(),
            incoming: DashMap::new(),
            channel_down: AtomicBool::new(false),
        });

        let router = tokio::spawn(run_router(inner.clone(), inbound, exits_rx));
        (Self { inner, router }, events_rx)
    }

    pub fn participant_id(&self) -> &str {
        self.inner.ctx.channel.participant_id()
    }

    /// 1:1 통화 시작. 새 세션 ID 를 돌려준다.
    pub async fn start_call(&self, remote_id: &str, metadata: Option<Value>) -> EngineResult<String> {
        let session_id = Uuid::new_v4().to_string();
        self.start_call_with_id(&session_id, remote_id, metadata).await?;
        Ok(session_id)
    }

    pub async fn start_call_with_id(
        &self,
        session_id: &str,
        remote_id: &str,
        metadata: Option<Value>,
    ) -> EngineResult<()> {
        let inner = &self.inner;
        let entry = match inner.sessions.entry(session_id.to_string()) {
            Entry::Occupied(_) => return Err(EngineError::AlreadyExists(session_id.to_string())),
            Entry::Vacant(entry) => entry,
        };

        inner.ctx.channel.send(ClientMessage::Invite {
            session_id: session_id.to_string(),
            target: remote_id.to_string(),
            metadata,
        })?;

        let handle = session::spawn(
            inner.ctx.clone(),
            SessionParams {
                session_id: session_id.to_string(),
                remote: Some(remote_id.to_string()),
                role: ParticipantRole::Initiator,
                media: MediaPlan::Acquire,
                join_room: true,
            },
        );
        entry.insert(handle);

        tracing::info!(session_id = %session_id, remote = %remote_id, "Call started");
        Ok(())
    }

    /// 수신 통화 수락
    pub async fn accept_incoming(&self, session_id: &str) -> EngineResult<()> {
        let inner = &self.inner;
        // 대기 항목을 잡은 채로 세션을 등록하고 버퍼를 넘겨야 라우터가 중간 메시지를 놓치지 않는다
        let Entry::Occupied(pending) = inner.incoming.entry(session_id.to_string()) else {
            return Err(EngineError::UnknownSession(session_id.to_string()));
        };
        if inner.sessions.contains_key(session_id) {
            return Err(EngineError::AlreadyExists(session_id.to_string()));
        }

        let handle = session::spawn(
            inner.ctx.clone(),
            SessionParams {
                session_id: session_id.to_string(),
                remote: Some(pending.get().from.clone()),
                role: ParticipantRole::Responder,
                media: MediaPlan::Acquire,
                join_room: true,
            },
        );
        inner.sessions.insert(session_id.to_string(), handle.clone());

        let call = pending.remove();
        for message in call.buffered {
            handle.deliver(message);
        }

        tracing::info!(session_id = %session_id, remote = %call.from, "Incoming call accepted");
        Ok(())
    }

    /// 수신 통화 거절. 발신자에게 terminate 를 보낸다.
    pub async fn reject_incoming(&self, session_id: &str, reason: &str) -> EngineResult<()> {
        let (_, call) = self
            .inner
            .incoming
            .remove(session_id)
            .ok_or_else(|| EngineError::UnknownSession(session_id.to_string()))?;

        self.inner.ctx.channel.send(ClientMessage::Terminate {
            session_id: session_id.to_string(),
            reason: reason.to_string(),
            target: Some(call.from.clone()),
        })?;

        tracing::info!(session_id = %session_id, remote = %call.from, reason = %reason, "Incoming call rejected");
        Ok(())
    }

    /// 통화 종료. 어떤 상태에서도 호출할 수 있고, 반환 시점에는 타이머가 모두 멈춰 있다.
    pub async fn end_call(&self, session_id: &str) -> EngineResult<()> {
        let (_, handle) = self
            .inner
            .sessions
            .remove(session_id)
            .ok_or_else(|| EngineError::UnknownSession(session_id.to_string()))?;

        handle.end("ended", true).await;
        self.inner.leave_room(session_id);
        Ok(())
    }

    /// 방송 시작. 방송 세션 ID 를 돌려준다.
    pub async fn start_broadcast(&self, metadata: BroadcastMetadata) -> EngineResult<String> {
        self.inner.broadcasts.start(metadata).await
    }

    /// 시청자로 방송 참여 (수신 전용)
    pub async fn join_broadcast(&self, session_id: &str) -> EngineResult<()> {
        let inner = &self.inner;
        if inner.broadcasts.is_host(session_id) {
            return Err(EngineError::AlreadyExists(session_id.to_string()));
        }
        let entry = match inner.sessions.entry(session_id.to_string()) {
            Entry::Occupied(_) => return Err(EngineError::AlreadyExists(session_id.to_string())),
            Entry::Vacant(entry) => entry,
        };

        let handle = session::spawn(
            inner.ctx.clone(),
            SessionParams {
                session_id: session_id.to_string(),
                remote: None,
                role: ParticipantRole::BroadcastViewer,
                media: MediaPlan::ReceiveOnly,
                join_room: true,
            },
        );
        entry.insert(handle);

        tracing::info!(session_id = %session_id, "Joined broadcast");
        Ok(())
    }

    /// 방송에서 나가기. 호스트가 호출하면 방송 자체를 끝낸다.
    pub async fn leave_broadcast(&self, session_id: &str) -> EngineResult<()> {
        if self.inner.broadcasts.is_host(session_id) {
            return self.end_broadcast(session_id, None).await;
        }
        self.end_call(session_id).await
    }

    /// 호스트 측 방송 종료 (녹화 정보는 기록 API 로 전달)
    pub async fn end_broadcast(&self, session_id: &str, recording: Option<String>) -> EngineResult<()> {
        if !self.inner.broadcasts.is_host(session_id) {
            return Err(EngineError::NotHost(session_id.to_string()));
        }
        self.inner.broadcasts.end(session_id, recording).await
    }

    pub fn session_status(&self, session_id: &str) -> Option<SessionStatus> {
        self.inner.sessions.get(session_id).map(|h| h.status())
    }

    pub fn session(&self, session_id: &str) -> Option<SessionHandle> {
        self.inner.sessions.get(session_id).map(|h| h.clone())
    }

    pub async fn session_snapshot(&self, session_id: &str) -> Option<SessionSnapshot> {
        let handle = self.session(session_id)?;
        handle.snapshot().await
    }

    /// 호스트 측 시청자 수
    pub fn viewer_count(&self, session_id: &str) -> Option<usize> {
        self.inner.broadcasts.room(session_id).map(|room| room.viewer_count())
    }

    /// 현재 방송에 연결된 시청자 ID 목록
    pub fn viewers(&self, session_id: &str) -> Vec<String> {
        self.inner
            .broadcasts
            .room(session_id)
            .map(|room| room.viewer_ids())
            .unwrap_or_default()
    }

    pub fn viewer_session(&self, session_id: &str, viewer_id: &str) -> Option<SessionHandle> {
        self.inner
            .broadcasts
            .room(session_id)
            .and_then(|room| room.viewer(viewer_id))
    }
}

impl Drop for SessionClient {
    fn drop(&mut self) {
        self.router.abort();
    }
}

impl ClientInner {
    fn on_message(&self, message: ServerMessage) {
        let Some(session_id) = message.session_id().map(str::to_string) else {
            match message {
                ServerMessage::Error { code, message } => {
                    tracing::warn!(code = %code, message = %message, "Relay reported an error");
                }
                other => tracing::trace!(message = ?other, "Relay message"),
            }
            return;
        };

        match &message {
            ServerMessage::RoomJoined { members, .. } => {
                if self.broadcasts.on_room_joined(&session_id) {
                    // 호스트보다 먼저 들어와 있던 시청자
                    for member in members {
                        self.broadcasts.on_peer_joined(&session_id, member.clone());
                    }
                    return;
                }
            }
            ServerMessage::PeerJoined { participant_id, .. } => {
                if self.broadcasts.is_host(&session_id) {
                    self.broadcasts.on_peer_joined(&session_id, participant_id.clone());
                }
                return;
            }
            ServerMessage::PeerLeft { participant_id, .. } => {
                self.broadcasts.on_peer_left(&session_id, participant_id);
                return;
            }
            ServerMessage::RoomFull { .. } => {
                tracing::warn!(session_id = %session_id, "Room is full");
                if let Some((_, handle)) = self.sessions.remove(&session_id) {
                    tokio::spawn(async move {
                        handle.end("room-full", false).await;
                    });
                }
                return;
            }
            ServerMessage::ViewerCount { count, .. } => {
                let _ = self.ctx.events.send(SessionEvent::ViewerCount {
                    session_id,
                    count: *count,
                });
                return;
            }
            _ => {}
        }

        if self.broadcasts.deliver(&message) {
            return;
        }

        if let Some(mut pending) = self.incoming.get_mut(&session_id) {
            if let ServerMessage::Terminate { reason, .. } = &message {
                let reason = reason.clone();
                let from = pending.from.clone();
                drop(pending);
                self.incoming.remove(&session_id);
                tracing::info!(session_id = %session_id, remote = %from, "Incoming call withdrawn");
                let _ = self.ctx.events.send(SessionEvent::Closed {
                    session_id,
                    remote: Some(from),
                    reason,
                });
            } else {
                pending.buffered.push(message);
            }
            return;
        }

        if let Some(handle) = self.sessions.get(&session_id) {
            handle.deliver(message);
            return;
        }

        match message {
            ServerMessage::Invite { from, metadata, .. } => {
                tracing::info!(session_id = %session_id, from = %from, "Incoming call");
                self.incoming.insert(
                    session_id.clone(),
                    PendingCall {
                        from: from.clone(),
                        buffered: Vec::new(),
                    },
                );
                let _ = self.ctx.events.send(SessionEvent::IncomingCall {
                    session_id,
                    from,
                    metadata,
                });
            }
            other => {
                tracing::debug!(session_id = %session_id, message = ?other, "Signal for unknown session");
            }
        }
    }

    fn on_exit(&self, exit: SessionExit) {
        if exit.role == ParticipantRole::BroadcastHost {
            if let Some(viewer_id) = exit.remote.as_deref() {
                self.broadcasts.on_viewer_exit(&exit.session_id, viewer_id);
            }
            return;
        }

        let removed = self
            .sessions
            .remove_if(&exit.session_id, |_, handle| handle.state().is_terminal());
        if removed.is_some() {
            self.leave_room(&exit.session_id);
        }
        tracing::debug!(session_id = %exit.session_id, state = ?exit.state, "Session task finished");
    }

    fn on_channel_closed(&self) {
        if self.channel_down.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::warn!(participant_id = %self.ctx.channel.participant_id(), "Signaling channel unavailable");
        let _ = self.ctx.events.send(SessionEvent::ChannelUnavailable);
    }

    fn leave_room(&self, session_id: &str) {
        let _ = self.ctx.channel.send(ClientMessage::RoomLeave {
            session_id: session_id.to_string(),
        });
    }
}

/// 수신 시그널과 세션 종료 통지를 분배하는 라우터 태스크
async fn run_router(
    inner: Arc<ClientInner>,
    mut inbound: Option<UnboundedReceiver<ServerMessage>>,
    mut exits: UnboundedReceiver<SessionExit>,
) {
    if inbound.is_none() {
        inner.on_channel_closed();
    }

    loop {
        tokio::select! {
            message = next_message(&mut inbound) => match message {
                Some(message) => inner.on_message(message),
                None => {
                    inbound = None;
                    inner.on_channel_closed();
                }
            },
            Some(exit) = exits.recv() => inner.on_exit(exit),
        }
    }
}

async fn next_message(inbound: &mut Option<UnboundedReceiver<ServerMessage>>) -> Option<ServerMessage> {
    match inbound {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
