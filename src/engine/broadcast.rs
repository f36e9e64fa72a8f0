//! 방송 팬아웃 코디네이터 (호스트 측)
//!
//! 호스트 캡처 하나를 시청자별 세션 N 개가 공유한다. 시청자 세션은 서로
//! 독립적으로 협상하며, 호스트가 각 시청자에게 offer 를 먼저 보낸다.
//! 시청자 집합과 종료 여부는 방마다 하나의 잠금 아래에서만 바뀌므로
//! 시청자 수는 항상 집합 크기와 같다.

use crate::engine::events::SessionEvent;
use crate::engine::hooks::{BroadcastMetadata, Collaborators};
use crate::engine::session::{self, MediaPlan, ParticipantRole, SessionContext, SessionHandle, SessionParams};
use crate::engine::transport::{acquire_with_fallback, LocalMedia};
use crate::error::{EngineError, EngineResult, ErrorKind};
use crate::protocol::{ClientMessage, ServerMessage};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;

pub const BROADCAST_ENDED: &str = "broadcast-ended";

#[derive(Default)]
struct Viewers {
    sessions: HashMap<String, SessionHandle>,
    /// 권한 확인 중인 시청자 -> 입장 티켓. 떠나면 티켓이 사라진다.
    pending: HashMap<String, u64>,
    next_ticket: u64,
    closed: bool,
}

/// 진행 중인 방송 하나
pub struct BroadcastRoom {
    pub session_id: String,
    media: Arc<dyn LocalMedia>,
    viewers: Mutex<Viewers>,
}

impl BroadcastRoom {
    fn new(session_id: String, media: Arc<dyn LocalMedia>) -> Self {
        Self {
            session_id,
            media,
            viewers: Mutex::new(Viewers::default()),
        }
    }

    fn viewers(&self) -> MutexGuard<'_, Viewers> {
        self.viewers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn viewer_count(&self) -> usize {
        self.viewers().sessions.len()
    }

    pub fn viewer_ids(&self) -> Vec<String> {
        self.viewers().sessions.keys().cloned().collect()
    }

    pub fn viewer(&self, viewer_id: &str) -> Option<SessionHandle> {
        self.viewers().sessions.get(viewer_id).cloned()
    }
}

pub struct BroadcastCoordinator {
    ctx: SessionContext,
    collaborators: Collaborators,
    rooms: DashMap<String, Arc<BroadcastRoom>>,
    join_waiters: DashMap<String, oneshot::Sender<()>>,
}

impl BroadcastCoordinator {
    pub fn new(ctx: SessionContext, collaborators: Collaborators) -> Self {
        Self {
            ctx,
            collaborators,
            rooms: DashMap::new(),
            join_waiters: DashMap::new(),
        }
    }

    pub fn room(&self, session_id: &str) -> Option<Arc<BroadcastRoom>> {
        self.rooms.get(session_id).map(|r| Arc::clone(r.value()))
    }

    pub fn is_host(&self, session_id: &str) -> bool {
        self.rooms.contains_key(session_id)
    }

    /// 방송 시작: 기록 등록 → 캡처 → 방 입장 확인
    pub async fn start(&self, metadata: BroadcastMetadata) -> EngineResult<String> {
        let host_id = self.ctx.channel.participant_id().to_string();
        let session_id = self
            .collaborators
            .registry
            .register_start(&host_id, &metadata)
            .await
            .map_err(EngineError::Hook)?;

        let media = match acquire_with_fallback(self.ctx.media_source.as_ref(), &self.ctx.presets).await {
            Ok(media) => media,
            Err(e) => {
                tracing::warn!(session_id = %session_id, error = %e, "Broadcast media unavailable");
                if let Err(hook_err) = self.collaborators.registry.register_end(&session_id, None).await {
                    tracing::warn!(session_id = %session_id, error = %hook_err, "Failed to unregister broadcast");
                }
                let _ = self.ctx.events.send(SessionEvent::Failed {
                    session_id: session_id.clone(),
                    remote: None,
                    kind: ErrorKind::MediaUnavailable,
                });
                return Err(EngineError::MediaUnavailable(e));
            }
        };

        let room = Arc::new(BroadcastRoom::new(session_id.clone(), media.clone()));
        self.rooms.insert(session_id.clone(), room);

        let (joined_tx, joined_rx) = oneshot::channel();
        self.join_waiters.insert(session_id.clone(), joined_tx);
        if let Err(e) = self.ctx.channel.send(ClientMessage::RoomJoin {
            session_id: session_id.clone(),
        }) {
            self.join_waiters.remove(&session_id);
            self.rooms.remove(&session_id);
            media.stop();
            return Err(e.into());
        }

        match tokio::time::timeout(self.ctx.config.join_confirm_timeout, joined_rx).await {
            Ok(Ok(())) => {}
            _ => {
                self.join_waiters.remove(&session_id);
                tracing::warn!(session_id = %session_id, "No room-joined confirmation for broadcast, continuing degraded");
            }
        }

        tracing::info!(session_id = %session_id, host_id = %host_id, title = %metadata.title, "Broadcast started");
        Ok(session_id)
    }

    /// room-joined 확인. 이 코디네이터가 기다리던 것이면 true.
    pub(crate) fn on_room_joined(&self, session_id: &str) -> bool {
        match self.join_waiters.remove(session_id) {
            Some((_, waiter)) => {
                let _ = waiter.send(());
                true
            }
            None => false,
        }
    }

    /// 새 시청자 입장: 권한 확인 후 호스트 측 세션 생성
    pub(crate) fn on_peer_joined(self: &Arc<Self>, session_id: &str, viewer_id: String) {
        let Some(room) = self.room(session_id) else {
            return;
        };
        let ticket = {
            let mut viewers = room.viewers();
            if viewers.closed || viewers.sessions.contains_key(&viewer_id) {
                return;
            }
            viewers.next_ticket += 1;
            let ticket = viewers.next_ticket;
            viewers.pending.insert(viewer_id.clone(), ticket);
            ticket
        };
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            coordinator.admit_viewer(room, viewer_id, ticket).await;
        });
    }

    async fn admit_viewer(&self, room: Arc<BroadcastRoom>, viewer_id: String, ticket: u64) {
        let allowed = self
            .collaborators
            .authorizer
            .authorize(&viewer_id, &room.session_id)
            .await;

        let admitted = {
            let mut viewers = room.viewers();
            // 권한 확인 중에 떠났거나 다시 들어와 새 티켓을 받은 시청자
            if viewers.pending.get(&viewer_id) != Some(&ticket) {
                tracing::debug!(session_id = %room.session_id, viewer_id = %viewer_id, "Viewer left before admission");
                return;
            }
            viewers.pending.remove(&viewer_id);
            if viewers.closed || viewers.sessions.contains_key(&viewer_id) {
                return;
            }
            if allowed {
                let handle = session::spawn(
                    self.ctx.clone(),
                    SessionParams {
                        session_id: room.session_id.clone(),
                        remote: Some(viewer_id.clone()),
                        role: ParticipantRole::BroadcastHost,
                        media: MediaPlan::Shared(room.media.clone()),
                        join_room: false,
                    },
                );
                viewers.sessions.insert(viewer_id.clone(), handle);
                Some(viewers.sessions.len())
            } else {
                None
            }
        };

        match admitted {
            Some(count) => {
                tracing::info!(session_id = %room.session_id, viewer_id = %viewer_id, viewer_count = count, "Viewer joined");
                self.publish_count(&room.session_id, count);
            }
            None => {
                tracing::warn!(session_id = %room.session_id, viewer_id = %viewer_id, "Viewer not authorized");
                self.send(ClientMessage::Terminate {
                    session_id: room.session_id.clone(),
                    reason: "unauthorized".to_string(),
                    target: Some(viewer_id),
                });
            }
        }
    }

    /// 시청자가 방을 떠남
    pub(crate) fn on_peer_left(&self, session_id: &str, viewer_id: &str) {
        let Some(room) = self.room(session_id) else {
            return;
        };
        let (handle, count) = {
            let mut viewers = room.viewers();
            if viewers.pending.remove(viewer_id).is_some() {
                tracing::debug!(session_id = %session_id, viewer_id = %viewer_id, "Pending admission cancelled");
            }
            let handle = viewers.sessions.remove(viewer_id);
            (handle, viewers.sessions.len())
        };
        let Some(handle) = handle else {
            return;
        };

        tracing::info!(session_id = %session_id, viewer_id = %viewer_id, viewer_count = count, "Viewer left");
        self.publish_count(session_id, count);
        tokio::spawn(async move {
            handle.end("viewer left", false).await;
        });
    }

    /// 시청자 세션 종료 통지 (Closed / Failed)
    pub(crate) fn on_viewer_exit(&self, session_id: &str, viewer_id: &str) {
        let Some(room) = self.room(session_id) else {
            return;
        };
        let count = {
            let mut viewers = room.viewers();
            // 같은 시청자가 다시 들어와 새 세션이 생겼다면 건드리지 않는다
            let finished = viewers
                .sessions
                .get(viewer_id)
                .map(|h| h.state().is_terminal())
                .unwrap_or(false);
            if !finished {
                return;
            }
            viewers.sessions.remove(viewer_id);
            viewers.sessions.len()
        };
        self.publish_count(session_id, count);
    }

    /// 시청자 세션으로 시그널 전달. 이 방송에 속한 시그널이면 true.
    pub(crate) fn deliver(&self, message: &ServerMessage) -> bool {
        let (Some(session_id), Some(from)) = (message.session_id(), message.from()) else {
            return false;
        };
        let Some(room) = self.room(session_id) else {
            return false;
        };
        if let Some(handle) = room.viewers().sessions.get(from) {
            handle.deliver(message.clone());
        }
        true
    }

    /// 방송 종료: 모든 시청자 세션을 닫고 종료 메시지는 한 번만 보낸다
    pub async fn end(&self, session_id: &str, recording: Option<String>) -> EngineResult<()> {
        let (_, room) = self
            .rooms
            .remove(session_id)
            .ok_or_else(|| EngineError::UnknownSession(session_id.to_string()))?;

        let handles: Vec<SessionHandle> = {
            let mut viewers = room.viewers();
            viewers.closed = true;
            viewers.pending.clear();
            viewers.sessions.drain().map(|(_, handle)| handle).collect()
        };
        let closed = handles.len();
        futures::future::join_all(handles.iter().map(|h| h.end(BROADCAST_ENDED, false))).await;

        self.publish_count(session_id, 0);
        self.send(ClientMessage::Terminate {
            session_id: session_id.to_string(),
            reason: BROADCAST_ENDED.to_string(),
            target: None,
        });
        self.send(ClientMessage::RoomLeave {
            session_id: session_id.to_string(),
        });
        room.media.stop();

        tracing::info!(session_id = %session_id, viewers = closed, "Broadcast ended");

        self.collaborators
            .registry
            .register_end(session_id, recording)
            .await
            .map_err(EngineError::Hook)
    }

    fn publish_count(&self, session_id: &str, count: usize) {
        self.send(ClientMessage::ViewerCount {
            session_id: session_id.to_string(),
            count,
        });
        let _ = self.ctx.events.send(SessionEvent::ViewerCount {
            session_id: session_id.to_string(),
            count,
        });
    }

    fn send(&self, message: ClientMessage) {
        if let Err(e) = self.ctx.channel.send(message) {
            tracing::debug!(error = %e, "Signaling send failed");
        }
    }
}
