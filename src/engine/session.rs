//! 미디어 세션: 원격 참가자 하나와의 협상 상태 머신
//!
//! 세션마다 하나의 태스크가 상태를 독점한다. 외부와는 명령 채널,
//! 시그널링 채널, 전송 계층 이벤트 스트림으로만 통신한다.
//!
//! ```text
//! Idle -> GatheringLocalMedia -> Negotiating (offer 측)
//!                             -> AwaitingRemoteDescription -> Negotiating (answer 측)
//! Negotiating -> Connected -> Reconnecting -> GatheringLocalMedia | Failed
//! (any) -> Closed
//! ```

use crate::config::EngineConfig;
use crate::engine::channel::SignalingChannel;
use crate::engine::dedup::{fingerprint, FingerprintCache};
use crate::engine::events::SessionEvent;
use crate::engine::heartbeat::{unix_millis, HeartbeatMonitor};
use crate::engine::reconnect::{ReconnectDecision, ReconnectPolicy};
use crate::engine::transport::{
    acquire_with_fallback, ConnectivityState, LocalMedia, MediaConstraints, MediaSource,
    PeerTransport, TransportEvent, TransportFactory,
};
use crate::error::ErrorKind;
use crate::protocol::{ClientMessage, IceCandidate, SdpKind, ServerMessage, SessionDescription};
use serde::Serialize;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;

/// 누가 offer 를 만드는지 결정하는 역할
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ParticipantRole {
    Initiator,
    Responder,
    BroadcastHost,
    BroadcastViewer,
}

impl ParticipantRole {
    pub fn originates_offer(&self) -> bool {
        matches!(self, ParticipantRole::Initiator | ParticipantRole::BroadcastHost)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionState {
    Idle,
    GatheringLocalMedia,
    AwaitingRemoteDescription,
    Negotiating,
    Connected,
    Reconnecting,
    Failed,
    Closed,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Failed | SessionState::Closed)
    }
}

/// 로컬 미디어 사용 방식
#[derive(Debug, Clone)]
pub enum MediaPlan {
    /// 세션이 직접 캡처하고 종료 시 해제
    Acquire,
    /// 방송 호스트가 소유한 캡처를 공유 (세션은 해제하지 않음)
    Shared(Arc<dyn LocalMedia>),
    /// 수신 전용 (방송 시청자)
    ReceiveOnly,
}

/// 세션 태스크가 공유하는 의존성
#[derive(Clone)]
pub struct SessionContext {
    pub channel: Arc<dyn SignalingChannel>,
    pub transports: Arc<dyn TransportFactory>,
    pub media_source: Arc<dyn MediaSource>,
    pub presets: Arc<Vec<MediaConstraints>>,
    pub config: EngineConfig,
    pub events: mpsc::UnboundedSender<SessionEvent>,
    pub exits: mpsc::UnboundedSender<SessionExit>,
}

#[derive(Debug, Clone)]
pub struct SessionParams {
    pub session_id: String,
    pub remote: Option<String>,
    pub role: ParticipantRole,
    pub media: MediaPlan,
    /// 시작 시 room-join 을 보낸다. offer 측은 room-joined 확인 후에 offer 를 보낸다.
    pub join_room: bool,
}

/// 세션 태스크 종료 통지
#[derive(Debug, Clone)]
pub struct SessionExit {
    pub session_id: String,
    pub remote: Option<String>,
    pub role: ParticipantRole,
    pub state: SessionState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionStatus {
    pub state: SessionState,
    pub reconnect_attempt: u32,
    pub generation: u32,
}

/// 진단용 세션 스냅샷
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub remote: Option<String>,
    pub role: ParticipantRole,
    pub state: SessionState,
    pub reconnect_attempt: u32,
    pub generation: u32,
    pub local_description: Option<SessionDescription>,
    pub remote_description: Option<SessionDescription>,
    pub pending_local_candidates: usize,
    pub pending_remote_candidates: usize,
    pub last_heartbeat_sent_at: Option<Instant>,
    pub last_heartbeat_received_at: Option<Instant>,
    pub heartbeat_running: bool,
    pub processed_signals: usize,
}

pub(crate) enum SessionCommand {
    Signal(ServerMessage),
    End {
        reason: String,
        notify_remote: bool,
        done: oneshot::Sender<()>,
    },
    Snapshot(oneshot::Sender<SessionSnapshot>),
}

/// 세션 태스크 핸들
#[derive(Clone)]
pub struct SessionHandle {
    session_id: String,
    role: ParticipantRole,
    commands: mpsc::UnboundedSender<SessionCommand>,
    status: watch::Receiver<SessionStatus>,
}

impl SessionHandle {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn role(&self) -> ParticipantRole {
        self.role
    }

    pub fn status(&self) -> SessionStatus {
        *self.status.borrow()
    }

    pub fn state(&self) -> SessionState {
        self.status().state
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }

    pub(crate) fn deliver(&self, message: ServerMessage) -> bool {
        self.commands.send(SessionCommand::Signal(message)).is_ok()
    }

    /// 세션 종료. 세션 태스크가 모든 타이머를 멈추고 Closed 가 된 뒤 반환한다.
    pub async fn end(&self, reason: &str, notify_remote: bool) {
        let (done, wait) = oneshot::channel();
        let command = SessionCommand::End {
            reason: reason.to_string(),
            notify_remote,
            done,
        };
        if self.commands.send(command).is_err() {
            return;
        }
        let _ = wait.await;
    }

    pub async fn snapshot(&self) -> Option<SessionSnapshot> {
        let (reply, wait) = oneshot::channel();
        self.commands.send(SessionCommand::Snapshot(reply)).ok()?;
        wait.await.ok()
    }
}

/// 세션 태스크 시작
pub fn spawn(ctx: SessionContext, params: SessionParams) -> SessionHandle {
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let (status_tx, status_rx) = watch::channel(SessionStatus {
        state: SessionState::Idle,
        reconnect_attempt: 0,
        generation: 0,
    });

    let handle = SessionHandle {
        session_id: params.session_id.clone(),
        role: params.role,
        commands: commands_tx,
        status: status_rx,
    };

    let session = MediaSession::new(ctx, params, commands_rx, status_tx);
    tokio::spawn(session.run());
    handle
}

struct MediaSession {
    session_id: String,
    local_id: String,
    remote: Option<String>,
    role: ParticipantRole,
    state: SessionState,

    generation: u32,
    local_description: Option<SessionDescription>,
    remote_description: Option<SessionDescription>,
    local_description_sent: bool,
    pending_local_candidates: Vec<IceCandidate>,
    /// (generation, candidate)
    pending_remote_candidates: Vec<(u32, IceCandidate)>,
    processed: FingerprintCache,

    last_heartbeat_sent_at: Option<Instant>,
    last_heartbeat_received_at: Option<Instant>,
    reconnect_attempt: u32,
    policy: ReconnectPolicy,

    media_plan: MediaPlan,
    media: Option<Arc<dyn LocalMedia>>,
    transport: Option<Arc<dyn PeerTransport>>,
    transport_events: Option<mpsc::UnboundedReceiver<TransportEvent>>,

    // 타이머: 모두 이 태스크의 select 루프 안에만 존재한다
    heartbeat: Option<HeartbeatMonitor>,
    backoff_until: Option<Instant>,
    join_deadline: Option<Instant>,
    attempt_deadline: Option<Instant>,

    join_room: bool,
    joined: bool,

    ctx: SessionContext,
    commands: mpsc::UnboundedReceiver<SessionCommand>,
    deferred: VecDeque<SessionCommand>,
    status: watch::Sender<SessionStatus>,
}

impl MediaSession {
    fn new(
        ctx: SessionContext,
        params: SessionParams,
        commands: mpsc::UnboundedReceiver<SessionCommand>,
        status: watch::Sender<SessionStatus>,
    ) -> Self {
        let media = match &params.media {
            MediaPlan::Shared(media) => Some(media.clone()),
            _ => None,
        };

        Self {
            session_id: params.session_id,
            local_id: ctx.channel.participant_id().to_string(),
            remote: params.remote,
            role: params.role,
            state: SessionState::Idle,
            generation: 0,
            local_description: None,
            remote_description: None,
            local_description_sent: false,
            pending_local_candidates: Vec::new(),
            pending_remote_candidates: Vec::new(),
            processed: FingerprintCache::new(ctx.config.dedup_capacity),
            last_heartbeat_sent_at: None,
            last_heartbeat_received_at: None,
            reconnect_attempt: 0,
            policy: ReconnectPolicy::from_config(&ctx.config),
            media_plan: params.media,
            media,
            transport: None,
            transport_events: None,
            heartbeat: None,
            backoff_until: None,
            join_deadline: None,
            attempt_deadline: None,
            // 방에 직접 들어가지 않는 세션(방송 호스트의 시청자 세션)은 이미 입장한 것으로 본다
            joined: !params.join_room,
            join_room: params.join_room,
            ctx,
            commands,
            deferred: VecDeque::new(),
            status,
        }
    }

    async fn run(mut self) {
        if self.join_room {
            self.send(ClientMessage::RoomJoin {
                session_id: self.session_id.clone(),
            });
        }
        self.begin_attempt().await;

        while !self.state.is_terminal() {
            if let Some(command) = self.deferred.pop_front() {
                self.handle_command(command).await;
                continue;
            }

            tokio::select! {
                biased;
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => self.close("handle dropped", true).await,
                },
                event = next_transport_event(&mut self.transport_events) => {
                    self.on_transport_event(event).await
                }
                now = next_heartbeat_tick(&mut self.heartbeat) => self.on_heartbeat_tick(now).await,
                _ = sleep_until_opt(self.backoff_until) => {
                    self.backoff_until = None;
                    self.begin_attempt().await;
                }
                _ = sleep_until_opt(self.join_deadline) => self.on_join_timeout().await,
                _ = sleep_until_opt(self.attempt_deadline) => {
                    self.attempt_deadline = None;
                    self.invoke_supervisor("reconnect attempt did not connect").await;
                }
            }
        }

        let _ = self.ctx.exits.send(SessionExit {
            session_id: self.session_id.clone(),
            remote: self.remote.clone(),
            role: self.role,
            state: self.state,
        });
    }

    async fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Signal(message) => self.on_signal(message).await,
            SessionCommand::End {
                reason,
                notify_remote,
                done,
            } => {
                self.close(&reason, notify_remote).await;
                let _ = done.send(());
            }
            SessionCommand::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
        }
    }

    /// 중단 가능한 대기. 대기 중 End 가 오면 세션을 닫고 None.
    /// 그 외 명령은 대기가 끝난 뒤 처리하도록 미룬다.
    async fn interruptible<T>(&mut self, fut: impl Future<Output = T>) -> Option<T> {
        tokio::pin!(fut);
        loop {
            tokio::select! {
                biased;
                command = self.commands.recv() => match command {
                    Some(SessionCommand::End { reason, notify_remote, done }) => {
                        self.close(&reason, notify_remote).await;
                        let _ = done.send(());
                        return None;
                    }
                    Some(SessionCommand::Snapshot(reply)) => {
                        let _ = reply.send(self.snapshot());
                    }
                    Some(other) => self.deferred.push_back(other),
                    None => {
                        self.close("handle dropped", true).await;
                        return None;
                    }
                },
                out = &mut fut => return Some(out),
            }
        }
    }

    // ---- 협상 ----

    /// 새 협상 시도 시작 (최초 시작, 재연결, 재협상)
    async fn begin_attempt(&mut self) {
        if self.state.is_terminal() {
            return;
        }

        // 이전 시도의 상태는 이어받지 않는다
        self.close_transport().await;
        self.local_description = None;
        self.remote_description = None;
        self.local_description_sent = false;
        self.pending_local_candidates.clear();
        if self.role.originates_offer() {
            self.generation += 1;
        }
        let generation = self.generation;
        let originates = self.role.originates_offer();
        self.pending_remote_candidates
            .retain(|(g, _)| if originates { *g >= generation } else { *g > generation });

        self.transition(SessionState::GatheringLocalMedia);

        let media = match self.media_plan.clone() {
            MediaPlan::Acquire => match self.media.clone().filter(|m| m.is_live()) {
                Some(media) => Some(media),
                None => {
                    let source = self.ctx.media_source.clone();
                    let presets = self.ctx.presets.clone();
                    let acquired = self
                        .interruptible(async move {
                            acquire_with_fallback(source.as_ref(), &presets).await
                        })
                        .await;
                    match acquired {
                        None => return,
                        Some(Ok(media)) => {
                            self.media = Some(media.clone());
                            Some(media)
                        }
                        Some(Err(e)) => {
                            tracing::warn!(
                                session_id = %self.session_id,
                                error = %e,
                                "Local media unavailable"
                            );
                            self.fail(ErrorKind::MediaUnavailable).await;
                            return;
                        }
                    }
                }
            },
            MediaPlan::Shared(media) => Some(media),
            MediaPlan::ReceiveOnly => None,
        };

        let factory = self.ctx.transports.clone();
        let created = self
            .interruptible(async move { factory.create(media).await })
            .await;
        let handle = match created {
            None => return,
            Some(Ok(handle)) => handle,
            Some(Err(e)) => {
                tracing::warn!(session_id = %self.session_id, error = %e, "Failed to create transport");
                self.invoke_supervisor("transport creation failed").await;
                return;
            }
        };
        self.transport = Some(handle.transport);
        self.transport_events = Some(handle.events);

        if self.reconnect_attempt > 0 {
            self.attempt_deadline = Some(Instant::now() + self.ctx.config.heartbeat_timeout);
        }

        if self.role.originates_offer() {
            if self.joined {
                self.send_offer().await;
            } else {
                tracing::debug!(session_id = %self.session_id, "Waiting for room-joined before offering");
                self.join_deadline = Some(Instant::now() + self.ctx.config.join_confirm_timeout);
            }
        } else {
            self.transition(SessionState::AwaitingRemoteDescription);
        }
    }

    async fn send_offer(&mut self) {
        let Some(transport) = self.transport.clone() else {
            return;
        };
        let created = self
            .interruptible(async move { transport.create_local_description(SdpKind::Offer).await })
            .await;
        let offer = match created {
            None => return,
            Some(Ok(offer)) => offer,
            Some(Err(e)) => {
                tracing::warn!(session_id = %self.session_id, error = %e, "Failed to create offer");
                self.invoke_supervisor("offer creation failed").await;
                return;
            }
        };

        self.local_description = Some(offer.clone());
        self.send(ClientMessage::Offer {
            session_id: self.session_id.clone(),
            description: offer,
            generation: self.generation,
            target: self.remote.clone(),
        });
        self.local_description_sent = true;
        self.flush_local_candidates();
        self.transition(SessionState::Negotiating);

        tracing::info!(
            session_id = %self.session_id,
            remote = ?self.remote,
            generation = self.generation,
            "Offer sent"
        );
    }

    async fn on_offer(&mut self, from: String, description: SessionDescription, generation: u32) {
        let fp = fingerprint(&self.session_id, &from, SdpKind::Offer, generation, &description.sdp);
        if self.processed.contains(&fp) {
            tracing::debug!(session_id = %self.session_id, from = %from, "Duplicate offer discarded");
            return;
        }

        if self.role.originates_offer() || description.kind != SdpKind::Offer {
            self.processed.insert(fp);
            tracing::warn!(
                session_id = %self.session_id,
                from = %from,
                kind = ?ErrorKind::NegotiationRejected,
                "Ignoring unexpected offer"
            );
            return;
        }

        match self.state {
            SessionState::AwaitingRemoteDescription if generation > self.generation => {
                self.processed.insert(fp);
                self.accept_offer(from, description, generation).await;
            }
            SessionState::Negotiating | SessionState::Connected | SessionState::Reconnecting
                if generation > self.generation =>
            {
                // 상대가 새 시도를 시작했다. 현재 시도를 버리고 새 offer 를 받는다.
                tracing::info!(
                    session_id = %self.session_id,
                    from = %from,
                    generation,
                    "Remote restarted negotiation"
                );
                self.stop_timers();
                self.transition(SessionState::Reconnecting);
                self.begin_attempt().await;
                if self.state == SessionState::AwaitingRemoteDescription {
                    self.deferred.push_front(SessionCommand::Signal(ServerMessage::Offer {
                        session_id: self.session_id.clone(),
                        from,
                        description,
                        generation,
                    }));
                }
            }
            state => {
                self.processed.insert(fp);
                tracing::warn!(
                    session_id = %self.session_id,
                    from = %from,
                    state = ?state,
                    generation,
                    current_generation = self.generation,
                    "Ignoring offer in current state"
                );
            }
        }
    }

    async fn accept_offer(&mut self, from: String, description: SessionDescription, generation: u32) {
        let Some(transport) = self.transport.clone() else {
            tracing::warn!(session_id = %self.session_id, "Offer arrived without a transport");
            return;
        };
        if self.remote.is_none() {
            self.remote = Some(from.clone());
        }
        self.generation = generation;

        let apply_transport = transport.clone();
        let remote_description = description.clone();
        let applied = self
            .interruptible(async move {
                apply_transport.apply_remote_description(remote_description).await
            })
            .await;
        match applied {
            None => return,
            Some(Err(e)) => {
                tracing::warn!(
                    session_id = %self.session_id,
                    error = %e,
                    kind = ?ErrorKind::NegotiationRejected,
                    "Remote offer rejected by transport"
                );
                return;
            }
            Some(Ok(())) => {}
        }
        self.remote_description = Some(description);
        self.flush_remote_candidates().await;

        let created = self
            .interruptible(async move { transport.create_local_description(SdpKind::Answer).await })
            .await;
        let answer = match created {
            None => return,
            Some(Ok(answer)) => answer,
            Some(Err(e)) => {
                tracing::warn!(session_id = %self.session_id, error = %e, "Failed to create answer");
                return;
            }
        };

        self.local_description = Some(answer.clone());
        self.send(ClientMessage::Answer {
            session_id: self.session_id.clone(),
            description: answer,
            generation,
            target: Some(from),
        });
        self.local_description_sent = true;
        self.flush_local_candidates();
        self.transition(SessionState::Negotiating);

        tracing::info!(session_id = %self.session_id, remote = ?self.remote, generation, "Answer sent");
    }

    async fn on_answer(&mut self, from: String, description: SessionDescription, generation: u32) {
        let fp = fingerprint(&self.session_id, &from, SdpKind::Answer, generation, &description.sdp);
        if !self.processed.insert(fp) {
            tracing::debug!(session_id = %self.session_id, from = %from, "Duplicate answer discarded");
            return;
        }

        if !self.role.originates_offer() || description.kind != SdpKind::Answer {
            tracing::warn!(session_id = %self.session_id, from = %from, "Ignoring unexpected answer");
            return;
        }
        if self.state != SessionState::Negotiating
            || self.remote_description.is_some()
            || generation != self.generation
        {
            tracing::warn!(
                session_id = %self.session_id,
                from = %from,
                state = ?self.state,
                generation,
                current_generation = self.generation,
                "Ignoring answer without a pending local offer"
            );
            return;
        }

        let Some(transport) = self.transport.clone() else {
            return;
        };
        let remote_description = description.clone();
        let applied = self
            .interruptible(async move { transport.apply_remote_description(remote_description).await })
            .await;
        match applied {
            None => return,
            Some(Err(e)) => {
                tracing::warn!(
                    session_id = %self.session_id,
                    error = %e,
                    kind = ?ErrorKind::NegotiationRejected,
                    "Remote answer rejected by transport"
                );
                return;
            }
            Some(Ok(())) => {}
        }
        self.remote_description = Some(description);
        self.flush_remote_candidates().await;
    }

    // ---- 후보 ----

    async fn on_remote_candidate(&mut self, candidate: IceCandidate, generation: u32) {
        if generation < self.generation {
            tracing::trace!(session_id = %self.session_id, generation, "Stale candidate discarded");
            return;
        }

        if generation == self.generation && self.remote_description.is_some() {
            if let Some(transport) = self.transport.clone() {
                if let Err(e) = transport.add_candidate(candidate).await {
                    tracing::debug!(session_id = %self.session_id, error = %e, "Remote candidate rejected");
                }
                return;
            }
        }
        self.pending_remote_candidates.push((generation, candidate));
    }

    async fn flush_remote_candidates(&mut self) {
        let Some(transport) = self.transport.clone() else {
            return;
        };
        let pending = std::mem::take(&mut self.pending_remote_candidates);
        for (generation, candidate) in pending {
            if generation == self.generation {
                if let Err(e) = transport.add_candidate(candidate).await {
                    tracing::debug!(session_id = %self.session_id, error = %e, "Buffered candidate rejected");
                }
            } else if generation > self.generation {
                self.pending_remote_candidates.push((generation, candidate));
            }
        }
    }

    fn on_local_candidate(&mut self, candidate: IceCandidate) {
        match (&self.remote, self.local_description_sent) {
            (Some(remote), true) => {
                let message = ClientMessage::IceCandidate {
                    session_id: self.session_id.clone(),
                    candidate,
                    generation: self.generation,
                    target: Some(remote.clone()),
                };
                self.send(message);
            }
            _ => self.pending_local_candidates.push(candidate),
        }
    }

    fn flush_local_candidates(&mut self) {
        if !self.local_description_sent || self.remote.is_none() {
            return;
        }
        for candidate in std::mem::take(&mut self.pending_local_candidates) {
            self.on_local_candidate(candidate);
        }
    }

    // ---- 전송 계층 ----

    async fn on_transport_event(&mut self, event: Option<TransportEvent>) {
        match event {
            None => {
                self.transport_events = None;
            }
            Some(TransportEvent::LocalCandidate(candidate)) => self.on_local_candidate(candidate),
            Some(TransportEvent::StateChanged(ConnectivityState::Connected)) => {
                if self.state == SessionState::Negotiating {
                    self.on_connected().await;
                }
            }
            Some(TransportEvent::StateChanged(
                state @ (ConnectivityState::Disconnected | ConnectivityState::Failed),
            )) => {
                if self.state == SessionState::Connected {
                    tracing::warn!(session_id = %self.session_id, state = ?state, "Transport lost connectivity");
                    self.invoke_supervisor("transport connectivity lost").await;
                } else {
                    tracing::debug!(session_id = %self.session_id, state = ?state, session_state = ?self.state, "Transport state change ignored");
                }
            }
            Some(TransportEvent::StateChanged(state)) => {
                tracing::trace!(session_id = %self.session_id, state = ?state, "Transport state");
            }
        }
    }

    async fn on_connected(&mut self) {
        self.flush_remote_candidates().await;
        self.flush_local_candidates();

        self.reconnect_attempt = 0;
        self.attempt_deadline = None;
        self.heartbeat = Some(HeartbeatMonitor::start(
            self.ctx.config.heartbeat_interval,
            self.ctx.config.heartbeat_timeout,
            Instant::now(),
        ));
        self.transition(SessionState::Connected);
        self.emit(SessionEvent::Connected {
            session_id: self.session_id.clone(),
            remote: self.remote.clone(),
        });

        tracing::info!(session_id = %self.session_id, remote = ?self.remote, "Session connected");
    }

    // ---- 하트비트 ----

    async fn on_heartbeat_tick(&mut self, now: Instant) {
        if self.state != SessionState::Connected {
            self.heartbeat = None;
            return;
        }
        let timed_out = match self.heartbeat.as_mut() {
            Some(monitor) => monitor.check(now),
            None => return,
        };

        if timed_out {
            tracing::warn!(
                session_id = %self.session_id,
                remote = ?self.remote,
                kind = ?ErrorKind::HeartbeatTimeout,
                "Heartbeat timeout"
            );
            if let Some(remote) = self.remote.clone() {
                self.send(ClientMessage::HeartbeatTimeout {
                    session_id: self.session_id.clone(),
                    target: Some(remote),
                });
            }
            self.invoke_supervisor("heartbeat timeout").await;
            return;
        }

        self.send(ClientMessage::Heartbeat {
            session_id: self.session_id.clone(),
            participant_id: self.local_id.clone(),
            timestamp: unix_millis(),
            target: self.remote.clone(),
        });
        self.last_heartbeat_sent_at = Some(now);
    }

    fn on_heartbeat_received(&mut self) {
        let now = Instant::now();
        self.last_heartbeat_received_at = Some(now);
        if let Some(monitor) = self.heartbeat.as_mut() {
            if monitor.record_received(now) {
                tracing::info!(session_id = %self.session_id, "Peer heartbeat resumed");
            }
        }

        // 재연결 대기 중이면 생존 기록만 남긴다. 백오프는 그대로 지킨다.
        if self.state == SessionState::Reconnecting {
            tracing::debug!(
                session_id = %self.session_id,
                attempt = self.reconnect_attempt,
                "Peer heartbeat during reconnection"
            );
        }
    }

    // ---- 재연결 / 종료 ----

    /// 재연결 감독: 재시도 예약 또는 실패 확정
    async fn invoke_supervisor(&mut self, reason: &str) {
        if self.state.is_terminal() {
            return;
        }
        self.stop_timers();

        match self.policy.decide(self.reconnect_attempt) {
            ReconnectDecision::Exhausted { attempts } => {
                tracing::warn!(
                    session_id = %self.session_id,
                    attempts,
                    reason = %reason,
                    "Reconnection attempts exhausted"
                );
                self.fail(ErrorKind::ReconnectionExhausted).await;
            }
            ReconnectDecision::Retry { attempt, delay } => {
                self.reconnect_attempt = attempt;
                // 로컬 미디어는 재사용하므로 전송 객체만 닫는다
                self.close_transport().await;
                self.backoff_until = Some(Instant::now() + delay);
                self.transition(SessionState::Reconnecting);

                tracing::info!(
                    session_id = %self.session_id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    reason = %reason,
                    "Scheduling reconnection"
                );
            }
        }
    }

    async fn on_room_joined(&mut self) {
        self.joined = true;
        if self.join_deadline.take().is_some() {
            self.send_offer().await;
        }
    }

    async fn on_join_timeout(&mut self) {
        self.join_deadline = None;
        tracing::warn!(
            session_id = %self.session_id,
            "No room-joined confirmation, sending offer in degraded mode"
        );
        self.joined = true;
        self.send_offer().await;
    }

    async fn fail(&mut self, kind: ErrorKind) {
        debug_assert!(kind.is_surfaced(), "{:?} is handled internally", kind);
        if self.state.is_terminal() {
            return;
        }
        self.stop_timers();
        self.close_transport().await;
        self.release_media();
        if let Some(remote) = self.remote.clone() {
            let reason = serde_json::to_value(kind)
                .ok()
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_else(|| "failed".to_string());
            self.send(ClientMessage::Terminate {
                session_id: self.session_id.clone(),
                reason,
                target: Some(remote),
            });
        }
        self.transition(SessionState::Failed);
        self.emit(SessionEvent::Failed {
            session_id: self.session_id.clone(),
            remote: self.remote.clone(),
            kind,
        });

        tracing::error!(session_id = %self.session_id, remote = ?self.remote, kind = ?kind, "Session failed");
    }

    async fn close(&mut self, reason: &str, notify_remote: bool) {
        if self.state.is_terminal() {
            return;
        }
        // 타이머부터 멈춰야 종료 후 재연결이 발화하지 않는다
        self.stop_timers();

        if notify_remote {
            if let Some(remote) = self.remote.clone() {
                self.send(ClientMessage::Terminate {
                    session_id: self.session_id.clone(),
                    reason: reason.to_string(),
                    target: Some(remote),
                });
            }
        }
        self.close_transport().await;
        self.release_media();
        self.transition(SessionState::Closed);
        self.emit(SessionEvent::Closed {
            session_id: self.session_id.clone(),
            remote: self.remote.clone(),
            reason: reason.to_string(),
        });

        tracing::info!(session_id = %self.session_id, remote = ?self.remote, reason = %reason, "Session closed");
    }

    fn stop_timers(&mut self) {
        self.heartbeat = None;
        self.backoff_until = None;
        self.join_deadline = None;
        self.attempt_deadline = None;
    }

    async fn close_transport(&mut self) {
        self.transport_events = None;
        if let Some(transport) = self.transport.take() {
            transport.close().await;
        }
    }

    fn release_media(&mut self) {
        if let MediaPlan::Acquire = self.media_plan {
            if let Some(media) = self.media.take() {
                media.stop();
            }
        }
    }

    // ---- 시그널 분배 ----

    async fn on_signal(&mut self, message: ServerMessage) {
        if let (Some(from), Some(remote)) = (message.from(), self.remote.as_deref()) {
            if from != remote {
                tracing::debug!(
                    session_id = %self.session_id,
                    from = %from,
                    remote = %remote,
                    "Ignoring signal from unexpected participant"
                );
                return;
            }
        }

        match message {
            ServerMessage::RoomJoined { .. } => self.on_room_joined().await,
            ServerMessage::Offer {
                from,
                description,
                generation,
                ..
            } => self.on_offer(from, description, generation).await,
            ServerMessage::Answer {
                from,
                description,
                generation,
                ..
            } => self.on_answer(from, description, generation).await,
            ServerMessage::IceCandidate {
                candidate,
                generation,
                ..
            } => self.on_remote_candidate(candidate, generation).await,
            ServerMessage::Heartbeat { .. } => self.on_heartbeat_received(),
            ServerMessage::HeartbeatTimeout { .. } => {
                if self.state == SessionState::Connected {
                    self.invoke_supervisor("peer reported heartbeat timeout").await;
                }
            }
            ServerMessage::Terminate { reason, .. } => self.close(&reason, false).await,
            other => {
                tracing::trace!(session_id = %self.session_id, message = ?other, "Unhandled signal");
            }
        }
    }

    // ---- 공통 ----

    fn transition(&mut self, next: SessionState) {
        if self.state != next {
            tracing::debug!(
                session_id = %self.session_id,
                remote = ?self.remote,
                from = ?self.state,
                to = ?next,
                "Session state changed"
            );
            self.state = next;
            self.emit(SessionEvent::StateChanged {
                session_id: self.session_id.clone(),
                remote: self.remote.clone(),
                state: next,
            });
        }
        self.status.send_replace(SessionStatus {
            state: self.state,
            reconnect_attempt: self.reconnect_attempt,
            generation: self.generation,
        });
    }

    fn send(&self, message: ClientMessage) {
        if let Err(e) = self.ctx.channel.send(message) {
            tracing::debug!(session_id = %self.session_id, error = %e, "Signaling send failed");
        }
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.ctx.events.send(event);
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.session_id.clone(),
            remote: self.remote.clone(),
            role: self.role,
            state: self.state,
            reconnect_attempt: self.reconnect_attempt,
            generation: self.generation,
            local_description: self.local_description.clone(),
            remote_description: self.remote_description.clone(),
            pending_local_candidates: self.pending_local_candidates.len(),
            pending_remote_candidates: self.pending_remote_candidates.len(),
            last_heartbeat_sent_at: self.last_heartbeat_sent_at,
            last_heartbeat_received_at: self.last_heartbeat_received_at,
            heartbeat_running: self.heartbeat.is_some(),
            processed_signals: self.processed.len(),
        }
    }
}

async fn next_transport_event(
    events: &mut Option<mpsc::UnboundedReceiver<TransportEvent>>,
) -> Option<TransportEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn next_heartbeat_tick(monitor: &mut Option<HeartbeatMonitor>) -> Instant {
    match monitor {
        Some(monitor) => monitor.tick().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
